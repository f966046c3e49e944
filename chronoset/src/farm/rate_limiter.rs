//! Token bucket admission control, shared by `RateLimited` repair and the
//! `SendVarReadFirstLinger` read strategy's SendAll/SendOne split.
use parking_lot::Mutex;
use tokio::time::{Duration, Instant};

struct State {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket refilling at `rate` tokens per second, capped at `rate`
/// tokens of burst (one second's worth).
pub struct RateLimiter {
    rate: f64,
    state: Mutex<State>,
}

impl RateLimiter {
    pub fn new(rate_per_second: u32) -> Self {
        let rate = rate_per_second.max(1) as f64;
        Self {
            rate,
            state: Mutex::new(State {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut State) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.rate);
        state.last_refill = now;
    }

    /// Take one token immediately if available, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, waiting for the bucket to refill if necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.rate))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_try_acquire_drains_burst_then_refuses() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
