//! Per-host rate limiting.
//!
//! Every host gets a token bucket created on first use (default 5 req/s;
//! loopback hosts 300 req/s). Acquisition is cooperative and FIFO: waiters
//! queue on the bucket's async mutex and sleep out their deficit while
//! holding it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;

const DEFAULT_RATE: f64 = 5.0;
const LOOPBACK_RATE: f64 = 300.0;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket for one host.
#[derive(Debug)]
pub struct HostLimiter {
    rate: f64,
    burst: f64,
    bucket: AsyncMutex<Bucket>,
}

impl HostLimiter {
    fn new(rate: f64) -> Self {
        Self {
            rate,
            burst: rate,
            bucket: AsyncMutex::new(Bucket {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Block cooperatively until one token is available.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens < 1.0 {
            let deficit = 1.0 - bucket.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate);
            // Sleeping while holding the bucket keeps acquisition FIFO.
            tokio::time::sleep(wait).await;
            bucket.tokens = 1.0;
            bucket.last_refill = Instant::now();
        }
        bucket.tokens -= 1.0;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }
}

/// Registry of host limiters, lazily populated and process-lived.
#[derive(Debug, Default)]
pub struct WebLimiters {
    limiters: Mutex<HashMap<String, Arc<HostLimiter>>>,
}

impl WebLimiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or create) the limiter for `host`.
    pub fn get(&self, host: &str) -> Arc<HostLimiter> {
        let mut limiters = self.limiters.lock().expect("limiter registry poisoned");
        limiters
            .entry(host.to_string())
            .or_insert_with(|| {
                let rate = if is_loopback(host) {
                    LOOPBACK_RATE
                } else {
                    DEFAULT_RATE
                };
                Arc::new(HostLimiter::new(rate))
            })
            .clone()
    }

    /// Acquire one token for `host`, creating the limiter on first use.
    pub async fn acquire(&self, host: &str) {
        let limiter = self.get(host);
        limiter.acquire().await;
    }

    pub fn remove(&self, host: &str) {
        if let Ok(mut limiters) = self.limiters.lock() {
            limiters.remove(host);
        }
    }
}

fn is_loopback(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "::1"
}
