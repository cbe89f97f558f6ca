use serde_json::Value;

use lmbridge_core::jobs::JobHandle;

mod browser_fetch;
mod relay;

pub use browser_fetch::BrowserFetchStrategy;
pub use relay::{normalize_relay_url, RelayQueue, RelayStrategy};

/// Fully-shaped upstream call, ready for whichever acquisition path runs it.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub payload: Value,
}

/// One way of obtaining the upstream response. Every adapter speaks the same
/// contract: dispatch starts a producer for the given job and returns
/// immediately; all further progress flows through the job's registry
/// operations.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Liveness hint for preference ordering only; a strategy that looks
    /// alive can still stall, and the cascade falls through regardless.
    fn looks_alive(&self) -> bool {
        true
    }

    fn dispatch(&self, request: &UpstreamRequest, job: &JobHandle) -> Result<(), String>;

    /// Best-effort cancellation: the external side effect may keep running;
    /// its late output is discarded via the abandoned job.
    fn cancel(&self, _job_id: &str) {}
}
