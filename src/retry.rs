//! Three-phase connection retry (spec §4.6).
//!
//! Phase 1 (Immediate) retries back-to-back with no delay; phase 2
//! (Gradual) backs off exponentially up to a cap; phase 3 (Persistent)
//! retries at a fixed long interval until the deadline. `d_k = min(initial
//! * multiplier^k, max_interval)` within the Gradual phase.

use crate::error::{Result, TunnelError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Immediate,
    Gradual,
    Persistent,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Attempts in the Immediate phase before Gradual begins.
    pub immediate_attempts: u32,
    /// Delay between successive Immediate-phase attempts (the first
    /// Immediate attempt itself has no preceding delay).
    pub immediate_delay: Duration,
    /// Attempts in the Gradual phase before Persistent begins.
    pub gradual_attempts: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub persistent_interval: Duration,
    /// Total attempts across all phases before giving up entirely. `None`
    /// retries until `deadline` instead.
    pub max_attempts: Option<u32>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            immediate_attempts: 3,
            immediate_delay: Duration::from_millis(50),
            gradual_attempts: 5,
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            persistent_interval: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// Which phase attempt number `attempt` (0-indexed, counting from the
    /// very first call) falls into.
    pub fn phase_for(&self, attempt: u32) -> Phase {
        if attempt < self.immediate_attempts {
            Phase::Immediate
        } else if attempt < self.immediate_attempts + self.gradual_attempts {
            Phase::Gradual
        } else {
            Phase::Persistent
        }
    }

    /// Delay to wait *before* making the given attempt. The very first
    /// attempt of the Immediate phase has no preceding delay; every other
    /// attempt (including the first Gradual attempt, when there is no
    /// Immediate phase at all) waits its phase's delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.phase_for(attempt) {
            Phase::Immediate => {
                if attempt == 0 {
                    Duration::ZERO
                } else {
                    self.immediate_delay
                }
            }
            Phase::Gradual => {
                let k = (attempt - self.immediate_attempts) as i32;
                let scaled = self.initial_interval.as_secs_f64() * self.multiplier.powi(k);
                Duration::from_secs_f64(scaled.min(self.max_interval.as_secs_f64()))
            }
            Phase::Persistent => self.persistent_interval,
        }
    }
}

/// Drives repeated attempts of a fallible async operation through the
/// three-phase schedule, honoring both a deadline and a hard attempt cap.
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `op` until it succeeds, the deadline passes, or `max_attempts`
    /// is exhausted — whichever comes first.
    pub async fn run<T, F, Fut>(&self, deadline: Instant, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        let mut last_err: Option<TunnelError> = None;
        loop {
            if let Some(max) = self.config.max_attempts {
                if attempt >= max {
                    let err = last_err.unwrap_or(TunnelError::DeadlineExceeded);
                    return Err(TunnelError::MaxRetriesExceeded(Box::new(err)));
                }
            }

            let delay = self.config.delay_for(attempt);
            if delay > Duration::ZERO {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TunnelError::DeadlineExceeded);
                }
                let wait = delay.min(deadline - now);
                tokio::time::sleep(wait).await;
                if Instant::now() >= deadline {
                    return Err(TunnelError::DeadlineExceeded);
                }
            }

            debug!(attempt, phase = ?self.config.phase_for(attempt), "retry attempt");
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt, error = %e, "attempt failed");
                    last_err = Some(e);
                    attempt += 1;
                    if Instant::now() >= deadline {
                        let err = last_err.unwrap_or(TunnelError::DeadlineExceeded);
                        return Err(TunnelError::MaxRetriesExceeded(Box::new(err)));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn phase_boundaries_match_configured_counts() {
        let cfg = RetryConfig {
            immediate_attempts: 2,
            gradual_attempts: 3,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.phase_for(0), Phase::Immediate);
        assert_eq!(cfg.phase_for(1), Phase::Immediate);
        assert_eq!(cfg.phase_for(2), Phase::Gradual);
        assert_eq!(cfg.phase_for(4), Phase::Gradual);
        assert_eq!(cfg.phase_for(5), Phase::Persistent);
    }

    #[test]
    fn gradual_delay_follows_exponential_formula_capped_at_max() {
        let cfg = RetryConfig {
            immediate_attempts: 1,
            gradual_attempts: 10,
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_secs(1),
            ..RetryConfig::default()
        };
        assert_eq!(cfg.delay_for(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(400));
        assert_eq!(cfg.delay_for(4), Duration::from_millis(800));
        // k=4 -> 1600ms, capped at max_interval of 1s.
        assert_eq!(cfg.delay_for(5), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_second_immediate_attempt() {
        let manager = RetryManager::new(RetryConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = manager
            .run(Instant::now() + Duration::from_secs(5), move |attempt| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        Err(TunnelError::ConnectionRefused("first try".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_max_attempts_and_wraps_last_error() {
        let cfg = RetryConfig {
            max_attempts: Some(3),
            ..RetryConfig::default()
        };
        let manager = RetryManager::new(cfg);
        let result: Result<()> = manager
            .run(Instant::now() + Duration::from_secs(60), |_attempt| async {
                Err(TunnelError::ConnectionRefused("down".into()))
            })
            .await;
        assert!(matches!(result, Err(TunnelError::MaxRetriesExceeded(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_when_backoff_would_exceed_it() {
        let cfg = RetryConfig {
            immediate_attempts: 0,
            gradual_attempts: 0,
            persistent_interval: Duration::from_secs(600),
            max_attempts: None,
            ..RetryConfig::default()
        };
        let manager = RetryManager::new(cfg);
        let result: Result<()> = manager
            .run(Instant::now() + Duration::from_secs(1), |_attempt| async {
                Err(TunnelError::ConnectionRefused("down".into()))
            })
            .await;
        assert!(matches!(
            result,
            Err(TunnelError::MaxRetriesExceeded(_)) | Err(TunnelError::DeadlineExceeded)
        ));
    }
}
