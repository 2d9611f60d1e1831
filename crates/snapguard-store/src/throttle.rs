//! Global I/O throttling.
//!
//! One token bucket for reads and one for writes, shared by every ingestion
//! and restore worker. Tokens are bytes.

use crate::config::ThrottleConfig;
use crate::error::{StoreError, StoreResult};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::trace;

const MAX_SLEEP: Duration = Duration::from_millis(50);

/// Token bucket state for one direction.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: f64,
    refill_rate: f64,
    last_refill_us: u64,
}

impl TokenBucket {
    /// Create a full bucket with the given capacity and refill rate (tokens/sec).
    pub fn new(capacity: u64, rate_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: rate_per_sec / 1_000_000.0,
            last_refill_us: 0,
        }
    }

    /// Bucket capacity.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Refill rate in tokens per second.
    pub fn rate_per_sec(&self) -> f64 {
        self.refill_rate * 1_000_000.0
    }

    /// Consume `amount` tokens if available.
    pub fn try_consume(&mut self, amount: u64, now_us: u64) -> bool {
        self.refill(now_us);
        let amount_f = amount as f64;
        if self.tokens >= amount_f {
            self.tokens -= amount_f;
            true
        } else {
            false
        }
    }

    /// Time until `amount` tokens would be available.
    pub fn wait_time(&self, amount: u64) -> Duration {
        let deficit = (amount as f64 - self.tokens).max(0.0);
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_micros((deficit / self.refill_rate).ceil() as u64)
    }

    fn refill(&mut self, now_us: u64) {
        let elapsed_us = now_us.saturating_sub(self.last_refill_us);
        if elapsed_us > 0 {
            self.tokens = (self.tokens + elapsed_us as f64 * self.refill_rate).min(self.capacity as f64);
            self.last_refill_us = now_us;
        }
    }
}

/// Read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reading source files or chunks.
    Read,
    /// Writing chunks or restored files.
    Write,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Read => "read",
            Direction::Write => "write",
        }
    }
}

/// Read and write byte-rate limits shared across workers.
#[derive(Debug)]
pub struct IoThrottle {
    origin: Instant,
    read: Option<Mutex<TokenBucket>>,
    write: Option<Mutex<TokenBucket>>,
    timeout: Duration,
}

impl IoThrottle {
    /// Build from configuration. A rate of 0 leaves that direction unlimited.
    pub fn new(config: &ThrottleConfig) -> Self {
        let bucket = |rate: u64| {
            (rate > 0).then(|| {
                let capacity = ((rate as f64 * config.burst_factor) as u64).max(rate);
                Mutex::new(TokenBucket::new(capacity, rate as f64))
            })
        };
        Self {
            origin: Instant::now(),
            read: bucket(config.max_read_bytes_per_sec),
            write: bucket(config.max_write_bytes_per_sec),
            timeout: Duration::from_millis(config.acquire_timeout_ms),
        }
    }

    /// No limits in either direction.
    pub fn unlimited() -> Self {
        Self::new(&ThrottleConfig::default())
    }

    /// Block until `bytes` of budget are granted in `direction`.
    ///
    /// Requests are granted in pieces no larger than the bucket and no larger
    /// than half a timeout's worth of refill, so a request of any size can
    /// complete at the configured rate. The timeout bounds the wait for each
    /// piece: it fires when other workers keep draining the bucket, or when
    /// the rate is too low to grant even a single piece in time.
    pub fn acquire(&self, direction: Direction, bytes: u64) -> StoreResult<()> {
        let bucket = match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        };
        let Some(bucket) = bucket else {
            return Ok(());
        };

        let mut started = Instant::now();
        let mut remaining = bytes;
        while remaining > 0 {
            let wait = {
                let mut b = bucket.lock().unwrap_or_else(|e| e.into_inner());
                let per_timeout = (b.rate_per_sec() * self.timeout.as_secs_f64() / 2.0) as u64;
                let piece = remaining.min(b.capacity()).min(per_timeout.max(1));
                let now_us = self.origin.elapsed().as_micros() as u64;
                if b.try_consume(piece, now_us) {
                    remaining -= piece;
                    started = Instant::now();
                    continue;
                }
                b.wait_time(piece)
            };
            if started.elapsed().saturating_add(wait) > self.timeout {
                return Err(StoreError::IoThrottleTimeout {
                    direction: direction.as_str(),
                    bytes,
                    waited_ms: self.timeout.as_millis() as u64,
                });
            }
            trace!(direction = direction.as_str(), wait_us = wait.as_micros() as u64, "throttled");
            std::thread::sleep(wait.min(MAX_SLEEP));
        }
        Ok(())
    }
}
