use std::collections::VecDeque;
use std::time::Duration;

use supercli_model::RateLimits;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};

const MINUTE: Duration = Duration::from_secs(60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Client-side request limiter following a provider's published limits.
///
/// The per-minute limit is a sliding window, callers wait for a free slot.
/// The per-day limit is a fixed window starting at the first request, once
/// it is used up requests fail until the window rolls over.
pub(crate) struct RateLimiter {
    limits: RateLimits,
    state: Mutex<State>,
}

struct State {
    recent: VecDeque<Instant>,
    day_start: Option<Instant>,
    day_count: u32,
}

#[derive(Debug)]
pub(crate) struct DailyLimitReached {
    pub resets_in: Duration,
}

impl RateLimiter {
    pub fn new(mut limits: RateLimits) -> Option<Self> {
        // A zero limit is treated as no limit.
        let per_minute = limits.requests_per_minute.filter(|n| *n > 0);
        let per_day = limits.requests_per_day.filter(|n| *n > 0);
        limits.requests_per_minute = per_minute;
        limits.requests_per_day = per_day;
        if per_minute.is_none() && per_day.is_none() {
            return None;
        }
        Some(Self {
            limits,
            state: Mutex::new(State {
                recent: VecDeque::new(),
                day_start: None,
                day_count: 0,
            }),
        })
    }

    /// Waits until a request may be sent and records it.
    pub async fn acquire(&self) -> Result<(), DailyLimitReached> {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            if let Some(per_day) = self.limits.requests_per_day {
                let day_start = *state.day_start.get_or_insert(now);
                if now.duration_since(day_start) >= DAY {
                    state.day_start = Some(now);
                    state.day_count = 0;
                } else if state.day_count >= per_day {
                    return Err(DailyLimitReached {
                        resets_in: DAY - now.duration_since(day_start),
                    });
                }
            }

            if let Some(per_minute) = self.limits.requests_per_minute {
                while state
                    .recent
                    .front()
                    .is_some_and(|sent| now.duration_since(*sent) >= MINUTE)
                {
                    state.recent.pop_front();
                }
                if state.recent.len() >= per_minute as usize {
                    let Some(oldest) = state.recent.front().copied() else {
                        continue;
                    };
                    drop(state);
                    debug!("per-minute request limit reached, waiting");
                    sleep_until(oldest + MINUTE).await;
                    continue;
                }
                state.recent.push_back(now);
            }

            state.day_count += 1;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_limits() {
        assert!(RateLimiter::new(RateLimits::default()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_minute_waits_for_slot() {
        let limiter = RateLimiter::new(RateLimits {
            requests_per_minute: Some(2),
            requests_per_day: None,
        })
        .unwrap();

        let start = Instant::now();
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        limiter.acquire().await.unwrap();
        assert!(start.elapsed() >= MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_day_fails_fast() {
        let limiter = RateLimiter::new(RateLimits {
            requests_per_minute: None,
            requests_per_day: Some(1),
        })
        .unwrap();
        limiter.acquire().await.unwrap();
        let err = limiter.acquire().await.unwrap_err();
        assert!(err.resets_in <= DAY);

        tokio::time::advance(DAY).await;
        limiter.acquire().await.unwrap();
    }
}
