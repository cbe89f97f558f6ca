use std::time::Duration;

const DEFAULT_PICKUP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SIGNUP_PREFLIGHT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_FETCH_PREFLIGHT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_STATUS_TIMEOUT_SECS: u64 = 30;
const DEFAULT_OVERALL_TIMEOUT_SECS: u64 = 300;
const DEFAULT_RELAY_FRESH_SECS: u64 = 30;
const DEFAULT_SESSION_TTL_SECS: u64 = 1800;
const DEFAULT_UPSTREAM_DOMAINS: &str = "lmarena.ai,arena.ai";
const DEFAULT_UPSTREAM_BASE_URL: &str = "https://lmarena.ai";

/// Per-attempt and per-request deadline budgets, value semantics only.
/// 中文注释：signup 与 fetch 的 preflight 预算必须分开；注册阶段可能卡在真人验证上,
/// 不能吃掉等待网络请求启动的预算。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTimeouts {
    pub pickup: Duration,
    pub signup_preflight: Duration,
    pub fetch_preflight: Duration,
    pub status: Duration,
    pub overall: Duration,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            pickup: Duration::from_secs(DEFAULT_PICKUP_TIMEOUT_SECS),
            signup_preflight: Duration::from_secs(DEFAULT_SIGNUP_PREFLIGHT_TIMEOUT_SECS),
            fetch_preflight: Duration::from_secs(DEFAULT_FETCH_PREFLIGHT_TIMEOUT_SECS),
            status: Duration::from_secs(DEFAULT_STATUS_TIMEOUT_SECS),
            overall: Duration::from_secs(DEFAULT_OVERALL_TIMEOUT_SECS),
        }
    }
}

impl FetchTimeouts {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pickup: env_duration_secs("LMBRIDGE_PICKUP_TIMEOUT_SECS", defaults.pickup),
            signup_preflight: env_duration_secs(
                "LMBRIDGE_SIGNUP_PREFLIGHT_TIMEOUT_SECS",
                defaults.signup_preflight,
            ),
            fetch_preflight: env_duration_secs(
                "LMBRIDGE_FETCH_PREFLIGHT_TIMEOUT_SECS",
                defaults.fetch_preflight,
            ),
            status: env_duration_secs("LMBRIDGE_STATUS_TIMEOUT_SECS", defaults.status),
            overall: env_duration_secs("LMBRIDGE_OVERALL_TIMEOUT_SECS", defaults.overall),
        }
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

pub fn relay_fresh_window() -> Duration {
    env_duration_secs(
        "LMBRIDGE_RELAY_FRESH_SECS",
        Duration::from_secs(DEFAULT_RELAY_FRESH_SECS),
    )
}

pub fn session_ttl() -> Duration {
    env_duration_secs(
        "LMBRIDGE_SESSION_TTL_SECS",
        Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
    )
}

/// Domain set the upstream is known to answer under. Kept as configuration:
/// the observed set (two domains) may be incomplete.
pub fn upstream_domains() -> Vec<String> {
    let raw = std::env::var("LMBRIDGE_UPSTREAM_DOMAINS")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_UPSTREAM_DOMAINS.to_string());
    raw.split(',')
        .map(|part| part.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|part| !part.is_empty())
        .collect()
}

pub fn upstream_base_url() -> String {
    std::env::var("LMBRIDGE_UPSTREAM_BASE_URL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(|v| v.trim().trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string())
}
