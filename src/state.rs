//! Connection lifecycle states and disconnect classification.

use strum_macros::Display;

/// Lifecycle state of a managed WebSocket connection.
///
/// The state is owned by the manager's run loop; every other component only
/// observes it through a watch channel. `Closed` is terminal: a manager that
/// reaches it never transitions again and a new instance is required.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected, no reconnect pending
    Disconnected,
    /// Connection attempt in flight
    Connecting,
    /// Successfully connected
    Connected,
    /// Waiting before the next automatic reconnect attempt
    Reconnecting,
    /// Deliberate teardown in progress (close handshake)
    Closing,
    /// Terminal; the manager will not transition again
    Closed,
}

impl ConnectionState {
    /// True exactly for the states from which a connect attempt is legal.
    #[must_use]
    pub const fn can_connect(self) -> bool {
        matches!(self, Self::Disconnected | Self::Reconnecting)
    }

    /// True only while the connection is established.
    #[must_use]
    pub const fn can_send(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// True for `Closed`, after which no further transitions are legal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Legal-transition table consumed by the manager's run loop.
    ///
    /// Deliberate teardown passes through `Closing`, which resolves to
    /// `Reconnecting` when automatic reconnection continues and to
    /// `Disconnected` or `Closed` otherwise; reactive losses go straight
    /// from `Connected` to `Reconnecting` or `Closed`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Disconnected => matches!(
                next,
                Self::Connecting | Self::Reconnecting | Self::Closing | Self::Closed
            ),
            Self::Connecting => matches!(
                next,
                Self::Connected | Self::Reconnecting | Self::Closing | Self::Closed
            ),
            Self::Connected => matches!(next, Self::Reconnecting | Self::Closing | Self::Closed),
            Self::Reconnecting => matches!(next, Self::Connecting | Self::Closing | Self::Closed),
            Self::Closing => matches!(next, Self::Reconnecting | Self::Disconnected | Self::Closed),
            Self::Closed => false,
        }
    }
}

/// Why a connection ended.
///
/// Proactive reasons are initiated by this side (operator or policy);
/// reactive reasons are externally imposed. The two classes are mutually
/// exclusive and exhaustive over all variants.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DisconnectReason {
    /// Caller asked for the disconnect
    UserRequested,
    /// A scheduled disconnect fired
    Scheduled,
    /// A `should_disconnect` predicate returned true
    CallbackTriggered,
    /// Server-advertised connection lifetime was about to expire
    ConnectionLimit,
    /// Server closed the connection
    ServerClosed,
    /// Transport-level I/O failure
    NetworkError,
    /// No pong received within the heartbeat timeout
    PingTimeout,
    /// Malformed frame or handshake violation
    ProtocolError,
    /// Connection was forcibly killed
    Killed,
}

impl DisconnectReason {
    /// True when the closure was initiated by this side.
    #[must_use]
    pub const fn is_proactive(self) -> bool {
        matches!(
            self,
            Self::UserRequested | Self::Scheduled | Self::CallbackTriggered | Self::ConnectionLimit
        )
    }

    /// True when the closure was externally imposed.
    #[must_use]
    pub const fn is_reactive(self) -> bool {
        !self.is_proactive()
    }

    /// Reasons after which reconnecting is pointless even with
    /// `auto_reconnect` enabled.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Killed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [ConnectionState; 6] = [
        ConnectionState::Disconnected,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
        ConnectionState::Closing,
        ConnectionState::Closed,
    ];

    const ALL_REASONS: [DisconnectReason; 9] = [
        DisconnectReason::UserRequested,
        DisconnectReason::Scheduled,
        DisconnectReason::CallbackTriggered,
        DisconnectReason::ConnectionLimit,
        DisconnectReason::ServerClosed,
        DisconnectReason::NetworkError,
        DisconnectReason::PingTimeout,
        DisconnectReason::ProtocolError,
        DisconnectReason::Killed,
    ];

    #[test]
    fn can_connect_exactly_disconnected_and_reconnecting() {
        for state in ALL_STATES {
            let expected = matches!(
                state,
                ConnectionState::Disconnected | ConnectionState::Reconnecting
            );
            assert_eq!(state.can_connect(), expected, "can_connect for {state}");
        }
    }

    #[test]
    fn can_send_only_while_connected() {
        for state in ALL_STATES {
            assert_eq!(
                state.can_send(),
                state == ConnectionState::Connected,
                "can_send for {state}"
            );
        }
    }

    #[test]
    fn closed_is_the_only_terminal_state() {
        for state in ALL_STATES {
            assert_eq!(
                state.is_terminal(),
                state == ConnectionState::Closed,
                "is_terminal for {state}"
            );
        }
    }

    #[test]
    fn no_transition_leaves_closed() {
        for next in ALL_STATES {
            assert!(
                !ConnectionState::Closed.can_transition_to(next),
                "CLOSED must not transition to {next}"
            );
        }
    }

    #[test]
    fn teardown_passes_through_closing() {
        assert!(ConnectionState::Connected.can_transition_to(ConnectionState::Closing));
        assert!(ConnectionState::Closing.can_transition_to(ConnectionState::Closed));
        assert!(ConnectionState::Closing.can_transition_to(ConnectionState::Disconnected));
        assert!(!ConnectionState::Closing.can_transition_to(ConnectionState::Connected));
    }

    // A proactive teardown with auto-reconnect enabled goes Connected ->
    // Closing -> Reconnecting -> Connecting -> Connected; every hop must be
    // legal or the watch channel sticks at Closing.
    #[test]
    fn closing_resolves_into_the_reconnect_cycle() {
        assert!(ConnectionState::Closing.can_transition_to(ConnectionState::Reconnecting));
        assert!(ConnectionState::Reconnecting.can_transition_to(ConnectionState::Connecting));
        assert!(ConnectionState::Connecting.can_transition_to(ConnectionState::Connected));
    }

    #[test]
    fn proactive_and_reactive_partition_all_reasons() {
        for reason in ALL_REASONS {
            assert_ne!(
                reason.is_proactive(),
                reason.is_reactive(),
                "classification must be exclusive for {reason}"
            );
        }

        let proactive: Vec<_> = ALL_REASONS.iter().filter(|r| r.is_proactive()).collect();
        assert_eq!(proactive.len(), 4, "exactly four proactive reasons");
        assert!(proactive.contains(&&DisconnectReason::UserRequested));
        assert!(proactive.contains(&&DisconnectReason::Scheduled));
        assert!(proactive.contains(&&DisconnectReason::CallbackTriggered));
        assert!(proactive.contains(&&DisconnectReason::ConnectionLimit));
    }

    #[test]
    fn display_uses_screaming_snake_case() {
        assert_eq!(DisconnectReason::UserRequested.to_string(), "USER_REQUESTED");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "RECONNECTING");
    }
}
