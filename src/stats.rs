//! Per-session/per-pool counters surfaced to logging.
//!
//! This is a thin counters layer, not a metrics exporter: SPEC_FULL's
//! module layout carries no counterpart to the reference's
//! Prometheus exporter, so these numbers are read back only by `log`
//! lines and by tests, never served over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::utils::clock;

/// Process-wide dispatcher counters, incremented on every request.
#[derive(Default)]
pub struct DispatcherStats {
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub unknown_opcode_total: AtomicU64,
    pub unknown_session_total: AtomicU64,
}

impl DispatcherStats {
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_opcode(&self) {
        self.unknown_opcode_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unknown_session(&self) {
        self.unknown_session_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            unknown_opcode_total: self.unknown_opcode_total.load(Ordering::Relaxed),
            unknown_session_total: self.unknown_session_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatcherStatsSnapshot {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub unknown_opcode_total: u64,
    pub unknown_session_total: u64,
}

/// A single request's latency sample, timed with the fast clock; reused
/// here for aggregate reporting rather than per-session storage, which
/// lives on `Session` itself.
pub struct RequestTimer {
    start: quanta::Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        RequestTimer { start: clock::now() }
    }

    pub fn elapsed(&self) -> std::time::Duration {
        clock::now().duration_since(self.start)
    }
}

/// Snapshot of one `ConnectionPool`'s introspection surface (max
/// resources, available, created), taken for logging or a status command
/// rather than held live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatsSnapshot {
    pub url: &'static str,
    pub max_resources: u64,
    pub available: u64,
    pub created: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_stats_accumulate() {
        let stats = DispatcherStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_failure();
        stats.record_unknown_opcode();
        let snap = stats.snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.requests_failed, 1);
        assert_eq!(snap.unknown_opcode_total, 1);
        assert_eq!(snap.unknown_session_total, 0);
    }

    #[test]
    fn request_timer_elapses_nonzero_after_work() {
        let timer = RequestTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed() > std::time::Duration::from_nanos(0));
    }
}
