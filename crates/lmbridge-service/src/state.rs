use std::sync::{Arc, Mutex};

use lmbridge_core::config::FetchTimeouts;
use lmbridge_core::jobs::JobRegistry;
use lmbridge_core::storage::Storage;

use crate::browser::{BrowserProvider, UnconfiguredBrowser};
use crate::session::SessionProvisioner;
use crate::strategies::{BrowserFetchStrategy, RelayQueue, RelayStrategy, Strategy};

/// Everything the request path needs, created once at startup and shared.
pub struct BridgeState {
    pub registry: Arc<JobRegistry>,
    pub timeouts: FetchTimeouts,
    pub strategies: Vec<Arc<dyn Strategy>>,
    pub relay_queue: Arc<RelayQueue>,
    pub session: Arc<SessionProvisioner>,
    pub storage: Arc<Mutex<Storage>>,
}

impl BridgeState {
    pub fn from_env() -> Result<Self, String> {
        let storage = crate::storage_helpers::open_storage()?;
        let provider: Arc<dyn BrowserProvider> = Arc::new(UnconfiguredBrowser);
        Ok(Self::build(provider, storage))
    }

    pub fn build(provider: Arc<dyn BrowserProvider>, storage: Storage) -> Self {
        let relay_queue = Arc::new(RelayQueue::new());
        let session = Arc::new(SessionProvisioner::new(provider.clone()));
        // 中文注释：策略按偏好声明顺序排列；每次请求前再按 looks_alive 稳定排序。
        let strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(RelayStrategy::new(relay_queue.clone())),
            Arc::new(BrowserFetchStrategy::new(provider, session.clone())),
        ];
        Self {
            registry: Arc::new(JobRegistry::new()),
            timeouts: FetchTimeouts::from_env(),
            strategies,
            relay_queue,
            session,
            storage: Arc::new(Mutex::new(storage)),
        }
    }

    /// State with caller-supplied strategies and budgets over an in-memory
    /// request log. Used by tests and embedders that bring their own
    /// acquisition paths.
    pub fn with_strategies(
        strategies: Vec<Arc<dyn Strategy>>,
        timeouts: FetchTimeouts,
    ) -> Result<Self, String> {
        let storage = Storage::open_in_memory().map_err(|err| err.to_string())?;
        storage.init().map_err(|err| err.to_string())?;
        let provider: Arc<dyn BrowserProvider> = Arc::new(UnconfiguredBrowser);
        Ok(Self {
            registry: Arc::new(JobRegistry::new()),
            timeouts,
            strategies,
            relay_queue: Arc::new(RelayQueue::new()),
            session: Arc::new(SessionProvisioner::new(provider)),
            storage: Arc::new(Mutex::new(storage)),
        })
    }
}
