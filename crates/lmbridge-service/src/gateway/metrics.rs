use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

static BRIDGE_TOTAL_REQUESTS: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_ACTIVE_REQUESTS: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_FALLBACK_ATTEMPTS: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_COMMITTED_REQUESTS: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_EXHAUSTED_REQUESTS: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_RELAY_CLAIMS: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_REQUEST_DURATION_MS_TOTAL: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BridgeMetricsSnapshot {
    pub total_requests: usize,
    pub active_requests: usize,
    pub fallback_attempts: usize,
    pub committed_requests: usize,
    pub exhausted_requests: usize,
    pub relay_claims: usize,
    pub request_duration_ms_total: u64,
}

pub(crate) struct BridgeRequestGuard;

impl Drop for BridgeRequestGuard {
    fn drop(&mut self) {
        BRIDGE_ACTIVE_REQUESTS.fetch_sub(1, Ordering::Relaxed);
    }
}

pub(crate) fn begin_bridge_request() -> BridgeRequestGuard {
    BRIDGE_TOTAL_REQUESTS.fetch_add(1, Ordering::Relaxed);
    BRIDGE_ACTIVE_REQUESTS.fetch_add(1, Ordering::Relaxed);
    BridgeRequestGuard
}

pub(crate) fn record_fallback_attempt() {
    BRIDGE_FALLBACK_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_commit() {
    BRIDGE_COMMITTED_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_exhausted() {
    BRIDGE_EXHAUSTED_REQUESTS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_relay_claim() {
    BRIDGE_RELAY_CLAIMS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_request_duration(duration: Duration) {
    let ms = duration.as_millis().min(u128::from(u64::MAX)) as u64;
    BRIDGE_REQUEST_DURATION_MS_TOTAL.fetch_add(ms, Ordering::Relaxed);
}

pub(crate) fn bridge_metrics_snapshot() -> BridgeMetricsSnapshot {
    BridgeMetricsSnapshot {
        total_requests: BRIDGE_TOTAL_REQUESTS.load(Ordering::Relaxed),
        active_requests: BRIDGE_ACTIVE_REQUESTS.load(Ordering::Relaxed),
        fallback_attempts: BRIDGE_FALLBACK_ATTEMPTS.load(Ordering::Relaxed),
        committed_requests: BRIDGE_COMMITTED_REQUESTS.load(Ordering::Relaxed),
        exhausted_requests: BRIDGE_EXHAUSTED_REQUESTS.load(Ordering::Relaxed),
        relay_claims: BRIDGE_RELAY_CLAIMS.load(Ordering::Relaxed),
        request_duration_ms_total: BRIDGE_REQUEST_DURATION_MS_TOTAL.load(Ordering::Relaxed),
    }
}

pub(crate) fn bridge_metrics_prometheus() -> String {
    let m = bridge_metrics_snapshot();
    format!(
        "lmbridge_requests_total {}\n\
lmbridge_requests_active {}\n\
lmbridge_fallback_attempts_total {}\n\
lmbridge_requests_committed_total {}\n\
lmbridge_requests_exhausted_total {}\n\
lmbridge_relay_claims_total {}\n\
lmbridge_request_duration_milliseconds_total {}\n\
lmbridge_request_duration_milliseconds_count {}\n",
        m.total_requests,
        m.active_requests,
        m.fallback_attempts,
        m.committed_requests,
        m.exhausted_requests,
        m.relay_claims,
        m.request_duration_ms_total,
        m.total_requests,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_text_contains_expected_series() {
        let text = bridge_metrics_prometheus();
        assert!(text.contains("lmbridge_requests_total "));
        assert!(text.contains("lmbridge_requests_active "));
        assert!(text.contains("lmbridge_fallback_attempts_total "));
        assert!(text.contains("lmbridge_requests_committed_total "));
        assert!(text.contains("lmbridge_requests_exhausted_total "));
    }

    // 计数器是进程级的，测试并行跑；只能做下界断言。
    #[test]
    fn request_guard_counts_totals() {
        let before = bridge_metrics_snapshot().total_requests;
        let _guard = begin_bridge_request();
        assert!(bridge_metrics_snapshot().total_requests >= before + 1);
    }
}
