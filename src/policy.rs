//! Reconnection timing policy.

use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use strum_macros::Display;

const DEFAULT_FIXED_DELAY_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// How the delay before the next reconnect attempt is computed.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconnectStrategy {
    /// Retry with no delay
    Immediate,
    /// Retry after a configured constant delay
    FixedDelay,
    /// Retry with jittered exponential backoff, clamped to a maximum
    #[default]
    ExponentialBackoff,
    /// Delegate timing entirely to a `should_reconnect` predicate
    CallbackControlled,
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay used by [`ReconnectStrategy::FixedDelay`]
    pub fixed_delay: Duration,
    /// Initial backoff duration for the first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None, // Infinite reconnection by default
            fixed_delay: DEFAULT_FIXED_DELAY_DURATION,
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // Max attempts are enforced separately
            .build()
    }
}

/// Maps (strategy, consecutive failures) to the delay before the next
/// reconnect attempt.
///
/// The attempt counter increments on every failed connect and resets to zero
/// only after a successful connection, so the backoff progression survives
/// intermediate attempts within one outage. [`ReconnectStrategy::CallbackControlled`]
/// never computes a delay here; the proactive controller polls the caller's
/// predicate instead.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    strategy: ReconnectStrategy,
    config: ReconnectConfig,
    backoff: ExponentialBackoff,
    attempts: u32,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(strategy: ReconnectStrategy, config: ReconnectConfig) -> Self {
        let backoff = config.clone().into();
        Self {
            strategy,
            config,
            backoff,
            attempts: 0,
        }
    }

    /// Number of consecutive failed attempts since the last success.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Register a failed connect attempt; returns the running attempt count.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Register a successful connection, resetting the attempt counter and
    /// the backoff progression.
    pub fn record_success(&mut self) {
        self.attempts = 0;
        self.backoff.reset();
    }

    /// True once the configured attempt limit has been reached.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.config
            .max_attempts
            .is_some_and(|max| self.attempts >= max)
    }

    /// Delay before the next attempt, or `None` when timing is delegated to
    /// a callback.
    pub fn next_delay(&mut self) -> Option<Duration> {
        match self.strategy {
            ReconnectStrategy::Immediate => Some(Duration::ZERO),
            ReconnectStrategy::FixedDelay => Some(self.config.fixed_delay),
            ReconnectStrategy::ExponentialBackoff => Some(
                self.backoff
                    .next_backoff()
                    .unwrap_or(self.config.max_backoff),
            ),
            ReconnectStrategy::CallbackControlled => None,
        }
    }
}
