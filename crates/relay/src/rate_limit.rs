// Per-connection inbound rate limiting.
//
// A token bucket that refills one token per interval up to a burst
// capacity. Tokens are whole numbers and refill time is tracked in whole
// intervals, so the bucket behaves the same under a paused test clock.

use std::time::Duration;

use tokio::time::{sleep, Instant};

pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_BURST: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Time to earn back one token.
    pub refill_interval: Duration,
    /// Bucket capacity; also the number of tokens a fresh bucket starts with.
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { refill_interval: DEFAULT_REFILL_INTERVAL, burst: DEFAULT_BURST }
    }
}

#[derive(Debug)]
pub struct TokenBucket {
    config: RateLimitConfig,
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let config = RateLimitConfig {
            refill_interval: config.refill_interval.max(Duration::from_millis(1)),
            burst: config.burst.max(1),
        };
        Self { config, tokens: config.burst, last_refill: Instant::now() }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Tokens available right now.
    pub fn available(&mut self) -> u32 {
        self.refill(Instant::now());
        self.tokens
    }

    /// Takes a token if one is available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }

    /// Takes a token, or records nothing when the bucket is already empty.
    ///
    /// Called after a frame has been read: the frame is processed either way,
    /// and [`TokenBucket::ready`] has already made the caller wait.
    pub fn consume(&mut self) {
        let _ = self.try_acquire();
    }

    /// How long until at least one token is available.
    pub fn time_until_ready(&mut self) -> Duration {
        let now = Instant::now();
        self.refill(now);
        if self.tokens > 0 {
            return Duration::ZERO;
        }
        match self.last_refill.checked_add(self.config.refill_interval) {
            Some(next_token) => next_token.saturating_duration_since(now),
            None => self.config.refill_interval,
        }
    }

    /// Waits until a token is available without taking it.
    ///
    /// Cancel safe: dropping the future leaves the bucket untouched.
    pub async fn ready(&mut self) {
        loop {
            let wait = self.time_until_ready();
            if wait.is_zero() {
                return;
            }
            sleep(wait).await;
        }
    }

    fn refill(&mut self, now: Instant) {
        if self.tokens >= self.config.burst {
            self.last_refill = now;
            return;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        let interval_nanos = self.config.refill_interval.as_nanos();
        let earned = elapsed.as_nanos() / interval_nanos;
        if earned == 0 {
            return;
        }

        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(self.config.burst);
        if self.tokens >= self.config.burst {
            self.last_refill = now;
        } else {
            self.last_refill += self.config.refill_interval * earned;
        }
    }
}
