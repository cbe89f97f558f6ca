use serde_json::Value;
use std::sync::Arc;

/// Cookie shape accepted by the automated-browser collaborator. Either `url`
/// or `domain` addresses the cookie; the provisioner writes both forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserCookie {
    pub name: String,
    pub value: String,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub path: String,
}

/// One controllable page. The orchestrator assumes nothing beyond
/// call/response semantics plus the ability to fail.
pub trait BrowserPage: Send + Sync {
    fn evaluate(&self, script: &str, arg: Value) -> Result<Value, String>;
}

/// The page's enclosing context: cookie jar access.
pub trait BrowserContext: Send + Sync {
    fn cookies(&self) -> Result<Vec<BrowserCookie>, String>;
    fn add_cookies(&self, cookies: Vec<BrowserCookie>) -> Result<(), String>;
}

/// Hands out a ready page/context pair. Backed in production by an external
/// browser-automation process; swapped for fakes in tests.
pub trait BrowserProvider: Send + Sync {
    fn acquire(&self) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String>;
}

/// Placeholder provider used when no automated browser is wired up: the
/// browser strategy fails fast and the cascade moves on.
#[derive(Debug, Default)]
pub struct UnconfiguredBrowser;

impl BrowserProvider for UnconfiguredBrowser {
    fn acquire(&self) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String> {
        Err("browser collaborator not configured".to_string())
    }
}
