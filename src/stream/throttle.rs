//! Bandwidth throttling for chunk streams using the governor crate.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct ThrottleConfig {
    /// Maximum bytes per second (0 = unlimited).
    pub bytes_per_second: u32,
    /// Maximum chunks per second (0 = unlimited).
    pub chunks_per_second: u32,
}

/// Awaited before each chunk emission to cap stream throughput.
pub struct StreamThrottle {
    bytes_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    chunks_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    enabled: bool,
}

impl StreamThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let bytes_limiter = if config.bytes_per_second > 0 {
            // 1KB units for finer control at high rates.
            let kb_per_second = (config.bytes_per_second / 1024).max(1);
            RateLimiter::direct(Quota::per_second(NonZeroU32::new(kb_per_second).unwrap()))
        } else {
            RateLimiter::direct(Quota::per_second(NonZeroU32::new(u32::MAX).unwrap()))
        };

        let chunks_limiter = if config.chunks_per_second > 0 {
            RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(config.chunks_per_second).unwrap(),
            ))
        } else {
            RateLimiter::direct(Quota::per_second(NonZeroU32::new(u32::MAX).unwrap()))
        };

        Self {
            bytes_limiter: Arc::new(bytes_limiter),
            chunks_limiter: Arc::new(chunks_limiter),
            enabled: config.bytes_per_second > 0 || config.chunks_per_second > 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(ThrottleConfig::default())
    }

    /// Wait until one more chunk of `bytes` length may be emitted.
    pub async fn acquire(&self, bytes: usize) {
        if !self.enabled {
            return;
        }

        self.chunks_limiter.until_ready().await;

        let kb = ((bytes / 1024).max(1) as u32).min(u32::MAX);
        if let Some(cells) = NonZeroU32::new(kb) {
            // Oversized requests would exceed the quota outright; fall back
            // to cell-at-a-time pacing.
            if self.bytes_limiter.until_n_ready(cells).await.is_err() {
                for _ in 0..kb {
                    self.bytes_limiter.until_ready().await;
                }
            }
        }
    }
}
