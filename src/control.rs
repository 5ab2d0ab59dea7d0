//! User-supplied predicates and hooks, and the proactive controller that
//! polls them on timers independent of socket I/O.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::state::DisconnectReason;

/// Outcome of one `should_reconnect` poll.
///
/// This is the typed form of the "bool or seconds" predicate contract:
/// `true` maps to [`Proceed`](Self::Proceed), `false` to
/// [`Hold`](Self::Hold), and a numeric return to
/// [`HoldFor`](Self::HoldFor).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectSignal {
    /// Not yet; ask again after the default check interval
    Hold,
    /// Reconnect now
    Proceed,
    /// Not yet; ask again after this delay instead of the default interval
    HoldFor(Duration),
}

impl From<bool> for ReconnectSignal {
    fn from(proceed: bool) -> Self {
        if proceed { Self::Proceed } else { Self::Hold }
    }
}

impl From<Duration> for ReconnectSignal {
    fn from(delay: Duration) -> Self {
        Self::HoldFor(delay)
    }
}

/// Decides whether the manager should proactively drop a live connection.
///
/// Implementations may suspend; plain closures returning `bool` get a
/// blanket implementation.
#[async_trait]
pub trait DisconnectPredicate: Send + Sync {
    async fn should_disconnect(&self) -> bool;
}

#[async_trait]
impl<F> DisconnectPredicate for F
where
    F: Fn() -> bool + Send + Sync,
{
    async fn should_disconnect(&self) -> bool {
        self()
    }
}

/// Decides whether a reconnect attempt may proceed.
///
/// Implementations may suspend; plain closures returning
/// [`ReconnectSignal`] get a blanket implementation.
#[async_trait]
pub trait ReconnectPredicate: Send + Sync {
    async fn should_reconnect(&self) -> ReconnectSignal;
}

#[async_trait]
impl<F> ReconnectPredicate for F
where
    F: Fn() -> ReconnectSignal + Send + Sync,
{
    async fn should_reconnect(&self) -> ReconnectSignal {
        self()
    }
}

/// Invoked once per disconnect, after statistics are recorded and before the
/// state machine moves on. Errors are logged and swallowed; they never block
/// the transition.
#[async_trait]
pub trait DisconnectHook: Send + Sync {
    async fn on_disconnect(&self, reason: DisconnectReason) -> crate::Result<()>;
}

#[async_trait]
impl<F> DisconnectHook for F
where
    F: Fn(DisconnectReason) + Send + Sync,
{
    async fn on_disconnect(&self, reason: DisconnectReason) -> crate::Result<()> {
        self(reason);
        Ok(())
    }
}

/// Runs the two predicate timers.
///
/// The disconnect check is polled by the manager only while connected; the
/// reconnect window is polled only while waiting to reconnect. Neither timer
/// ever touches the socket handle; both only report decisions back to the
/// manager's run loop.
pub struct ProactiveController {
    disconnect_check_interval: Duration,
    reconnect_check_interval: Duration,
    should_disconnect: Option<Arc<dyn DisconnectPredicate>>,
    should_reconnect: Option<Arc<dyn ReconnectPredicate>>,
    cancel: CancellationToken,
}

impl ProactiveController {
    #[must_use]
    pub fn new(
        disconnect_check_interval: Duration,
        reconnect_check_interval: Duration,
        should_disconnect: Option<Arc<dyn DisconnectPredicate>>,
        should_reconnect: Option<Arc<dyn ReconnectPredicate>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            disconnect_check_interval,
            reconnect_check_interval,
            should_disconnect,
            should_reconnect,
            cancel,
        }
    }

    /// Interval at which the manager polls the disconnect predicate while
    /// connected.
    #[must_use]
    pub fn disconnect_check_interval(&self) -> Duration {
        self.disconnect_check_interval
    }

    #[must_use]
    pub fn has_reconnect_predicate(&self) -> bool {
        self.should_reconnect.is_some()
    }

    /// Evaluate the disconnect predicate once. `false` when none is
    /// configured.
    pub async fn poll_disconnect(&self) -> bool {
        match &self.should_disconnect {
            Some(predicate) => predicate.should_disconnect().await,
            None => false,
        }
    }

    /// Block until the reconnect predicate allows an attempt.
    ///
    /// Without a predicate (neither `override_predicate` nor a configured
    /// one) this returns `false` immediately. Otherwise it polls until the
    /// predicate signals [`ReconnectSignal::Proceed`] (`true`), the optional
    /// timeout elapses (`false`), or the manager is torn down (`false`).
    /// [`ReconnectSignal::HoldFor`] reschedules the next poll after the
    /// given delay instead of the default interval.
    pub async fn wait_for_reconnect_window(
        &self,
        override_predicate: Option<Arc<dyn ReconnectPredicate>>,
        timeout: Option<Duration>,
    ) -> bool {
        let Some(predicate) = override_predicate.or_else(|| self.should_reconnect.clone()) else {
            return false;
        };

        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }

            let wait = match predicate.should_reconnect().await {
                ReconnectSignal::Proceed => return true,
                ReconnectSignal::Hold => self.reconnect_check_interval,
                ReconnectSignal::HoldFor(delay) => delay,
            };

            let next_poll = Instant::now() + wait;
            let wake_at = match deadline {
                Some(deadline) if deadline <= Instant::now() => return false,
                Some(deadline) => next_poll.min(deadline),
                None => next_poll,
            };

            tokio::select! {
                () = sleep_until(wake_at) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return false;
                    }
                }
                () = self.cancel.cancelled() => return false,
            }
        }
    }

    /// One reconnect-gate cycle for callback-controlled reconnection.
    ///
    /// `true` means attempt now. Without a configured predicate the gate
    /// degrades to waiting one default interval per cycle, so a
    /// callback-controlled manager without a predicate still retries instead
    /// of spinning.
    pub(crate) async fn reconnect_gate(&self) -> bool {
        if self.should_reconnect.is_some() {
            self.wait_for_reconnect_window(None, None).await
        } else {
            sleep(self.reconnect_check_interval).await;
            true
        }
    }
}

impl std::fmt::Debug for ProactiveController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProactiveController")
            .field("disconnect_check_interval", &self.disconnect_check_interval)
            .field("reconnect_check_interval", &self.reconnect_check_interval)
            .field("has_should_disconnect", &self.should_disconnect.is_some())
            .field("has_should_reconnect", &self.should_reconnect.is_some())
            .finish_non_exhaustive()
    }
}
