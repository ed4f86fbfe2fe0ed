//! Endpoint data model (spec §3), split per Design Notes (spec §9) into an
//! immutable descriptor and a separately-locked mutable statistics record,
//! instead of one mutex-protected struct with interior atomics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Immutable identity of one peer candidate: address and weight never
/// change after registration (a change is a remove + re-add).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointDescriptor {
    pub address: SocketAddr,
    pub weight: u32,
}

/// Mutable counters for one endpoint. Counters are plain atomics; the rare
/// fields that need read-modify-write together (`last_error` +
/// `last_error_time`) sit behind their own small lock.
#[derive(Default)]
pub struct EndpointStats {
    pub active: AtomicU32,
    pub total: AtomicU64,
    pub success_streak: AtomicU32,
    pub failure_streak: AtomicU32,
    /// Latched "currently excluded from selection" flag. Unlike
    /// `failure_streak`, this does not clear on a single success — only
    /// `Endpoint::record_success` clears it, once `success_streak` reaches
    /// `healthy_threshold`. This is what keeps a single lucky probe from
    /// immediately re-admitting an endpoint that tripped `unhealthy_threshold`.
    down: AtomicBool,
    last_error: Mutex<Option<(String, SystemTime)>>,
}

impl EndpointStats {
    pub fn record_connect(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn last_error(&self) -> Option<(String, SystemTime)> {
        self.last_error.lock().unwrap().clone()
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }
}

/// One registered peer candidate: its fixed descriptor plus live stats and
/// the per-endpoint health thresholds from configuration.
pub struct Endpoint {
    pub descriptor: EndpointDescriptor,
    pub stats: EndpointStats,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Endpoint {
    pub fn new(address: SocketAddr, weight: u32) -> Self {
        Self {
            descriptor: EndpointDescriptor { address, weight },
            stats: EndpointStats::default(),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }

    pub fn with_thresholds(mut self, healthy: u32, unhealthy: u32) -> Self {
        self.healthy_threshold = healthy;
        self.unhealthy_threshold = unhealthy;
        self
    }

    /// Record a successful probe/connect. Only clears the latched `down`
    /// state once `success_streak` reaches `healthy_threshold` (spec §4.7:
    /// "skipped until they accumulate healthy_threshold successes") — a
    /// lone success resets `failure_streak` but does not by itself restore
    /// eligibility.
    pub fn record_success(&self) {
        self.stats.success_streak.fetch_add(1, Ordering::SeqCst);
        self.stats.failure_streak.store(0, Ordering::SeqCst);
        if self.stats.success_streak.load(Ordering::SeqCst) >= self.healthy_threshold {
            self.stats.down.store(false, Ordering::SeqCst);
        }
    }

    /// Record a failed probe/connect. Latches `down` once `failure_streak`
    /// reaches `unhealthy_threshold`.
    pub fn record_failure(&self, error: impl Into<String>) {
        self.stats.failure_streak.fetch_add(1, Ordering::SeqCst);
        self.stats.success_streak.store(0, Ordering::SeqCst);
        *self.stats.last_error.lock().unwrap() = Some((error.into(), SystemTime::now()));
        if self.stats.failure_streak.load(Ordering::SeqCst) >= self.unhealthy_threshold {
            self.stats.down.store(true, Ordering::SeqCst);
        }
    }

    /// False once `record_failure` has latched `down`; stays false until
    /// `record_success` clears it (see `record_success`), not merely until
    /// one success arrives.
    pub fn is_healthy(&self) -> bool {
        !self.stats.down.load(Ordering::SeqCst)
    }

    /// An unhealthy endpoint becomes eligible again once it accumulates
    /// `healthy_threshold` consecutive successes.
    pub fn is_recovered(&self) -> bool {
        self.stats.success_streak.load(Ordering::SeqCst) >= self.healthy_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:8001".parse().unwrap()
    }

    #[test]
    fn connect_and_release_track_active_count() {
        let ep = Endpoint::new(addr(), 1);
        ep.stats.record_connect();
        assert_eq!(ep.stats.active(), 1);
        ep.stats.record_release();
        assert_eq!(ep.stats.active(), 0);
    }

    #[test]
    fn failure_streak_marks_unhealthy_after_threshold() {
        let ep = Endpoint::new(addr(), 1).with_thresholds(2, 3);
        assert!(ep.is_healthy());
        for _ in 0..3 {
            ep.record_failure("boom");
        }
        assert!(!ep.is_healthy());
    }

    #[test]
    fn success_streak_marks_recovered_after_threshold() {
        let ep = Endpoint::new(addr(), 1).with_thresholds(2, 3);
        ep.record_success();
        assert!(!ep.is_recovered());
        ep.record_success();
        assert!(ep.is_recovered());
    }

    #[test]
    fn single_success_does_not_readmit_an_unhealthy_endpoint() {
        let ep = Endpoint::new(addr(), 1).with_thresholds(2, 3);
        for _ in 0..3 {
            ep.record_failure("boom");
        }
        assert!(!ep.is_healthy());
        ep.record_success();
        assert!(!ep.is_healthy());
        ep.record_success();
        assert!(ep.is_healthy());
    }

    #[test]
    fn last_error_records_message_and_time() {
        let ep = Endpoint::new(addr(), 1);
        ep.record_failure("connection refused");
        let (msg, _time) = ep.stats.last_error().unwrap();
        assert_eq!(msg, "connection refused");
    }
}
