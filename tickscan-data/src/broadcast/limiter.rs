use std::time::Duration;
use tokio::time::Instant;

/// Token bucket limiting how often a connection may write a batch.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Bucket refilling at `rate_per_sec`, with a burst capacity of one second of tokens.
    pub fn new(rate_per_sec: f64) -> Self {
        let max_tokens = rate_per_sec.max(1.0);
        Self {
            tokens: max_tokens,
            max_tokens,
            rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then consume it.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let deficit = 1.0 - self.tokens;
            tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate_per_sec)).await;
        }
    }

    pub fn available(&self) -> f64 {
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.max_tokens);
        self.last_refill = now;
    }
}
