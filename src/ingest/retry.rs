//! Reconnect policy and the ingester's connection state machine.

use anyhow::{anyhow, Result};
use std::fmt;
use std::time::Duration;

/// Backoff parameters. Immutable once built.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    initial_interval: Duration,
    max_interval: Duration,
    backoff_multiplier: f64,
}

impl RetryPolicy {
    pub fn new(
        initial_interval: Duration,
        max_interval: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        if initial_interval.is_zero() {
            return Err(anyhow!("initial retry interval must be greater than zero"));
        }
        if max_interval < initial_interval {
            return Err(anyhow!(
                "max retry interval {:?} is below initial interval {:?}",
                max_interval,
                initial_interval
            ));
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(anyhow!(
                "backoff multiplier must be a finite value >= 1.0 (got {})",
                backoff_multiplier
            ));
        }
        Ok(Self {
            initial_interval,
            max_interval,
            backoff_multiplier,
        })
    }

    pub fn from_secs(initial: f64, max: f64, multiplier: f64) -> Result<Self> {
        let initial = Duration::try_from_secs_f64(initial)
            .map_err(|_| anyhow!("invalid initial retry interval {}", initial))?;
        let max = Duration::try_from_secs_f64(max)
            .map_err(|_| anyhow!("invalid max retry interval {}", max))?;
        Self::new(initial, max, multiplier)
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// The delay that follows `delay` in the sequence.
    pub fn advance(&self, delay: Duration) -> Duration {
        let next = delay.as_secs_f64() * self.backoff_multiplier;
        if next >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(next)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(5),
            max_interval: Duration::from_secs(100),
            backoff_multiplier: 1.5,
        }
    }
}

/// Current retry delay.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.initial_interval,
            policy,
        }
    }

    /// Delay the next sleep would use.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the delay to sleep now and advance to the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.policy.advance(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial_interval;
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

/// Upstream connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    /// Terminal: the ingester gave up (attempt limit reached).
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Streaming => "streaming",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the loop should do after a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStep {
    /// Sleep this long, then reconnect.
    Retry(Duration),
    /// Attempt limit reached.
    GiveUp,
}

/// `Disconnected -> Connecting -> Streaming -> Disconnected`, with backoff.
///
/// Owned by the ingest worker; nothing else reads or writes it.
#[derive(Debug)]
pub struct ConnectionMachine {
    state: ConnectionState,
    backoff: Backoff,
    attempts: u64,
    consecutive_failures: u32,
    max_consecutive_failures: Option<u32>,
}

impl ConnectionMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(policy),
            attempts: 0,
            consecutive_failures: 0,
            max_consecutive_failures: None,
        }
    }

    /// Give up after `limit` connect failures in a row.
    pub fn with_failure_limit(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_failures = limit;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn current_delay(&self) -> Duration {
        self.backoff.current()
    }

    /// Total connect attempts so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Enter `Connecting`. Returns the attempt number (1-based).
    pub fn begin_connect(&mut self) -> u64 {
        debug_assert_eq!(self.state, ConnectionState::Disconnected);
        self.state = ConnectionState::Connecting;
        self.attempts += 1;
        self.attempts
    }

    /// Connect succeeded: enter `Streaming` and reset the delay.
    pub fn connected(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.state = ConnectionState::Streaming;
        self.consecutive_failures = 0;
        self.backoff.reset();
    }

    /// Connect failed: back to `Disconnected` with the current delay, which is
    /// then advanced for the next failure.
    pub fn connect_failed(&mut self) -> NextStep {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if let Some(limit) = self.max_consecutive_failures {
            if self.consecutive_failures >= limit {
                self.state = ConnectionState::Failed;
                return NextStep::GiveUp;
            }
        }
        self.state = ConnectionState::Disconnected;
        NextStep::Retry(self.backoff.next_delay())
    }

    /// A streaming session ended: back to `Disconnected` starting again from
    /// the initial delay.
    pub fn session_ended(&mut self) -> NextStep {
        debug_assert_eq!(self.state, ConnectionState::Streaming);
        self.state = ConnectionState::Disconnected;
        self.backoff.reset();
        NextStep::Retry(self.backoff.next_delay())
    }

    /// Stop requested: leave whatever state we are in.
    pub fn shutdown(&mut self) {
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }
}
