use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use crate::state::ConnectionState;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Error establishing or communicating over the WebSocket connection
    Connection,
    /// Operation attempted on a closed or closing connection
    Closed,
    /// A bounded wait did not complete in time
    Timeout,
    /// Reconnection attempts were exhausted
    Reconnect,
    /// Malformed frame or handshake violation from the transport layer
    Protocol,
    /// Inbound message queue overflowed under the reject policy
    Backpressure,
    /// Operation is illegal in the current connection state
    State,
    /// Invalid caller-supplied input
    Validation,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn closed() -> Self {
        Closed {
            code: None,
            reason: None,
        }
        .into()
    }

    #[must_use]
    pub fn invalid_state(state: ConnectionState, operation: &'static str) -> Self {
        InvalidState { state, operation }.into()
    }

    #[must_use]
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Timeout { operation, timeout }.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Connect failed and retries were exhausted or disabled.
#[non_exhaustive]
#[derive(Debug)]
pub struct ConnectionFailed {
    pub url: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl fmt::Display for ConnectionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unable to connect to {} after {} attempt(s)",
            self.url, self.attempts
        )?;
        if let Some(last) = &self.last_error {
            write!(f, ": {last}")?;
        }
        Ok(())
    }
}

impl StdError for ConnectionFailed {}

/// Operation attempted on a closed or closing connection.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Closed {
    pub code: Option<u16>,
    pub reason: Option<String>,
}

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection closed")?;
        if let Some(code) = self.code {
            write!(f, " (code {code})")?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

impl StdError for Closed {}

/// A bounded wait (connect, ping, reconnect window) did not complete in time.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Timeout {
    pub operation: &'static str,
    pub timeout: Duration,
}

impl fmt::Display for Timeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} did not complete within {:?}",
            self.operation, self.timeout
        )
    }
}

impl StdError for Timeout {}

/// Reconnection attempts were exhausted against a configured limit.
#[non_exhaustive]
#[derive(Debug)]
pub struct ReconnectExhausted {
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl fmt::Display for ReconnectExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gave up reconnecting after {} attempt(s)", self.attempts)?;
        if let Some(last) = &self.last_error {
            write!(f, ": {last}")?;
        }
        Ok(())
    }
}

impl StdError for ReconnectExhausted {}

/// Malformed frame or handshake violation reported by the transport layer.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct Protocol {
    pub message: String,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol violation: {}", self.message)
    }
}

impl StdError for Protocol {}

/// The inbound message queue was full and the reject policy applied.
///
/// `dropped_count` is the queue's cumulative drop counter, which is
/// independent of the traffic statistics: rejected messages are not
/// "received" for accounting purposes.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct QueueFull {
    pub queue_size: usize,
    pub dropped_count: u64,
}

impl fmt::Display for QueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message queue full at {} entries, {} message(s) dropped so far",
            self.queue_size, self.dropped_count
        )
    }
}

impl StdError for QueueFull {}

/// Operation rejected by the connection state machine.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct InvalidState {
    pub state: ConnectionState,
    pub operation: &'static str,
}

impl fmt::Display for InvalidState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while {}", self.operation, self.state)
    }
}

impl StdError for InvalidState {}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

impl From<ConnectionFailed> for Error {
    fn from(err: ConnectionFailed) -> Self {
        Self::with_source(Kind::Connection, err)
    }
}

impl From<Closed> for Error {
    fn from(err: Closed) -> Self {
        Self::with_source(Kind::Closed, err)
    }
}

impl From<Timeout> for Error {
    fn from(err: Timeout) -> Self {
        Self::with_source(Kind::Timeout, err)
    }
}

impl From<ReconnectExhausted> for Error {
    fn from(err: ReconnectExhausted) -> Self {
        Self::with_source(Kind::Reconnect, err)
    }
}

impl From<Protocol> for Error {
    fn from(err: Protocol) -> Self {
        Self::with_source(Kind::Protocol, err)
    }
}

impl From<QueueFull> for Error {
    fn from(err: QueueFull) -> Self {
        Self::with_source(Kind::Backpressure, err)
    }
}

impl From<InvalidState> for Error {
    fn from(err: InvalidState) -> Self {
        Self::with_source(Kind::State, err)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Self::with_source(Kind::Validation, err)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match e {
            WsError::Protocol(_) | WsError::Capacity(_) => Protocol {
                message: e.to_string(),
            }
            .into(),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::with_source(Kind::Closed, e)
            }
            _ => Self::with_source(Kind::Connection, e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::with_source(Kind::Validation, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::with_source(Kind::Validation, e)
    }
}
