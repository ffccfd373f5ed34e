//! Backoff policy shared by model requests and MCP connections.

use std::time::Duration;

use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng;
use supercli_model::ErrorKind;

/// Capped exponential backoff with jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// The delay ceiling before the first retry.
    pub base_delay: Duration,
    /// The growth factor of the ceiling between retries.
    pub factor: f64,
    /// The ceiling never grows beyond this.
    pub max_delay: Duration,
    /// Failed attempts tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Starts a new delay schedule.
    pub fn schedule(&self) -> BackoffSchedule {
        let ceilings = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_multiplier(self.factor)
            .with_max_interval(self.max_delay)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();
        BackoffSchedule {
            ceilings,
            prev: Duration::ZERO,
            failures: 0,
            max_attempts: self.max_attempts,
        }
    }
}

/// The delays of one retry sequence.
///
/// Each delay is drawn uniformly between the previous delay and the current
/// exponential ceiling, so the sequence is jittered but never decreases.
pub struct BackoffSchedule {
    ceilings: ExponentialBackoff,
    prev: Duration,
    failures: u32,
    max_attempts: u32,
}

impl BackoffSchedule {
    /// Records a failed attempt and returns how long to wait before the next
    /// one, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.max_attempts {
            return None;
        }
        let ceiling = self.ceilings.next_backoff()?.max(self.prev);
        let delay = if ceiling > self.prev {
            let millis = rand::thread_rng().gen_range(
                self.prev.as_millis() as u64..=ceiling.as_millis() as u64,
            );
            Duration::from_millis(millis)
        } else {
            ceiling
        };
        self.prev = delay.max(self.prev);
        Some(self.prev)
    }

    /// Returns the number of failures recorded so far.
    #[inline]
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Retry bookkeeping for model requests.
///
/// Rate limiting and network failures are tracked separately, each with its
/// own attempt budget and delay sequence.
pub(crate) struct RetryState {
    rate_limit: BackoffSchedule,
    network: BackoffSchedule,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            rate_limit: policy.schedule(),
            network: policy.schedule(),
        }
    }

    /// Returns the delay before retrying after an error of `kind`, or `None`
    /// if the error must be surfaced.
    pub fn next_delay(&mut self, kind: ErrorKind) -> Option<Duration> {
        match kind {
            ErrorKind::RateLimitExceeded => self.rate_limit.next_delay(),
            ErrorKind::Network => self.network.next_delay(),
            _ => None,
        }
    }
}
