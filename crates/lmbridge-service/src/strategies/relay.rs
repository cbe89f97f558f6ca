use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

use lmbridge_core::config;
use lmbridge_core::jobs::{JobHandle, JobRegistry};

use super::{Strategy, UpstreamRequest};

#[derive(Debug, Clone)]
struct PendingRelayJob {
    job_id: String,
    claim: Value,
}

/// Hand-off point between the orchestrator and the external userscript
/// producer. Dispatched jobs wait here until a poll claims them; claiming is
/// what fires the pickup signal.
#[derive(Debug, Default)]
pub struct RelayQueue {
    pending: Mutex<VecDeque<PendingRelayJob>>,
    last_seen: Mutex<Option<Instant>>,
}

impl RelayQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn enqueue(&self, job_id: String, claim: Value) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(PendingRelayJob { job_id, claim });
        }
    }

    /// Claims the next pending job for a polling producer. Skips jobs whose
    /// cascade has already moved on.
    pub fn claim_next(&self, registry: &JobRegistry) -> Option<Value> {
        self.note_activity();
        loop {
            let candidate = {
                let Ok(mut pending) = self.pending.lock() else {
                    return None;
                };
                pending.pop_front()?
            };
            let Some(job) = registry.get(&candidate.job_id) else {
                continue;
            };
            if job.is_abandoned() {
                continue;
            }
            job.mark_picked_up();
            return Some(candidate.claim);
        }
    }

    fn remove_pending(&self, job_id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|entry| entry.job_id != job_id);
        }
    }

    /// Any producer-side activity counts: a userscript that polls but has
    /// claimed nothing yet is still alive.
    pub fn note_activity(&self) {
        if let Ok(mut last_seen) = self.last_seen.lock() {
            *last_seen = Some(Instant::now());
        }
    }

    pub fn seen_within(&self, window: Duration) -> bool {
        let Ok(last_seen) = self.last_seen.lock() else {
            return false;
        };
        last_seen.map(|at| at.elapsed() < window).unwrap_or(false)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

/// Relay-based acquisition: cheap, but only useful while an external
/// userscript is actually polling.
pub struct RelayStrategy {
    queue: Arc<RelayQueue>,
}

impl RelayStrategy {
    pub fn new(queue: Arc<RelayQueue>) -> Self {
        Self { queue }
    }
}

impl Strategy for RelayStrategy {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn looks_alive(&self) -> bool {
        self.queue.seen_within(config::relay_fresh_window())
    }

    fn dispatch(&self, request: &UpstreamRequest, job: &JobHandle) -> Result<(), String> {
        // 中文注释：交给页面里的 userscript 时把上游 URL 归一化成路径形式，
        // 让它走同源 fetch；跨域的 URL 原样透传，由页面自己决定能不能发。
        let claim = json!({
            "job_id": job.id(),
            "method": request.method,
            "url": normalize_relay_url(&request.url),
            "payload": request.payload,
        });
        self.queue.enqueue(job.id().to_string(), claim);
        Ok(())
    }

    fn cancel(&self, job_id: &str) {
        self.queue.remove_pending(job_id);
    }
}

/// Rewrites absolute URLs on the upstream's own domains to path-plus-query so
/// the in-page producer can fetch them same-origin. Foreign absolute URLs and
/// already-relative paths pass through unchanged.
pub fn normalize_relay_url(raw: &str) -> String {
    let Ok(parsed) = Url::parse(raw) else {
        // 相对路径解析不出来，本来就是目标形式。
        return raw.to_string();
    };
    let Some(host) = parsed.host_str() else {
        return raw.to_string();
    };
    let host = host.to_ascii_lowercase();
    let owned = config::upstream_domains()
        .iter()
        .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")));
    if !owned {
        return raw.to_string();
    }
    match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    }
}
