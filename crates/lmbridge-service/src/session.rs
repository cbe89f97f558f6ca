use rand::RngCore;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lmbridge_core::config;

use crate::browser::{BrowserContext, BrowserCookie, BrowserPage, BrowserProvider};

const IDENTITY_COOKIE_NAME: &str = "provisional_user_id";
const RECAPTCHA_SIGNUP_ACTION: &str = "sign_up";

// 这些脚本在受控页面里执行；具体的挑战求解发生在页面侧，桥接层只看 call/response。
const MINT_TURNSTILE_SCRIPT: &str =
    "async () => await window.LM_BRIDGE_MINT_TURNSTILE()";
const MINT_RECAPTCHA_SCRIPT: &str =
    "async (arg) => await window.LM_BRIDGE_MINT_RECAPTCHA_V3(arg.sitekey, arg.action)";
const SIGNUP_SCRIPT: &str = r#"async (arg) => {
  const resp = await fetch('/nextjs-api/sign-up', {
    method: 'POST',
    headers: { 'content-type': 'application/json' },
    body: JSON.stringify(arg),
  });
  return { status: resp.status, ok: resp.ok, body: await resp.text() };
}"#;
const LOCAL_STORAGE_SCRIPT: &str =
    "(value) => { localStorage.setItem('provisional_user_id', value); return true; }";

/// Anonymous identity accepted by the upstream in place of a full account.
#[derive(Debug, Clone)]
pub struct Session {
    pub provisional_user_id: String,
    pub turnstile_token: String,
    pub recaptcha_token: String,
    created_at: Instant,
}

impl Session {
    fn is_valid(&self) -> bool {
        self.created_at.elapsed() < config::session_ttl()
    }
}

/// Process-wide provisioner for the single anonymous identity. `ensure` is
/// idempotent: concurrent callers single-flight behind one lock and the
/// second one through reuses what the first minted.
pub struct SessionProvisioner {
    provider: Arc<dyn BrowserProvider>,
    cached: Mutex<Option<Session>>,
    provision_lock: Mutex<()>,
}

impl SessionProvisioner {
    pub fn new(provider: Arc<dyn BrowserProvider>) -> Self {
        Self {
            provider,
            cached: Mutex::new(None),
            provision_lock: Mutex::new(()),
        }
    }

    pub fn ensure_anonymous_session(&self) -> Result<Session, String> {
        if let Some(session) = self.cached_session() {
            return Ok(session);
        }
        let _guard = self
            .provision_lock
            .lock()
            .map_err(|_| "session provision lock poisoned".to_string())?;
        // 中文注释：拿到锁后重查缓存；并发下后到线程直接复用刚注册好的身份，
        // 避免重复 signup 打上游。
        if let Some(session) = self.cached_session() {
            return Ok(session);
        }

        let (page, context) = self.provider.acquire()?;
        let session = provision_anonymous_session(page.as_ref(), context.as_ref())?;
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(session.clone());
        }
        Ok(session)
    }

    /// Drops the cached identity after an explicit upstream rejection.
    pub fn invalidate(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    pub fn has_session(&self) -> bool {
        self.cached_session().is_some()
    }

    fn cached_session(&self) -> Option<Session> {
        let Ok(cached) = self.cached.lock() else {
            return None;
        };
        cached.as_ref().filter(|s| s.is_valid()).cloned()
    }
}

fn provision_anonymous_session(
    page: &dyn BrowserPage,
    context: &dyn BrowserContext,
) -> Result<Session, String> {
    let turnstile_token = page
        .evaluate(MINT_TURNSTILE_SCRIPT, Value::Null)?
        .as_str()
        .map(str::to_string)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "turnstile mint returned no token".to_string())?;

    let sitekey = std::env::var("LMBRIDGE_RECAPTCHA_SITEKEY").unwrap_or_default();
    let recaptcha_token = page
        .evaluate(
            MINT_RECAPTCHA_SCRIPT,
            json!({ "sitekey": sitekey, "action": RECAPTCHA_SIGNUP_ACTION }),
        )?
        .as_str()
        .map(str::to_string)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| "recaptcha mint returned no token".to_string())?;

    let provisional_user_id = new_provisional_user_id();
    let response = page.evaluate(
        SIGNUP_SCRIPT,
        json!({
            "turnstileToken": turnstile_token,
            "recaptchaToken": recaptcha_token,
            "provisionalUserId": provisional_user_id,
        }),
    )?;
    let status = response
        .get("status")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u16;
    if !(200..300).contains(&status) {
        let body = response
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(format!("anonymous signup failed: status={status} body={body}"));
    }

    inject_provisional_identity(page, context, &provisional_user_id)?;

    Ok(Session {
        provisional_user_id,
        turnstile_token,
        recaptcha_token,
        created_at: Instant::now(),
    })
}

/// Writes the provisional identity everywhere the upstream might look for it:
/// one cookie per configured domain in both addressing forms, plus
/// localStorage. The upstream is inconsistent about which domain it reads
/// cookies from across endpoints, hence the redundancy.
pub fn inject_provisional_identity(
    page: &dyn BrowserPage,
    context: &dyn BrowserContext,
    provisional_user_id: &str,
) -> Result<(), String> {
    let mut cookies = Vec::new();
    for domain in config::upstream_domains() {
        cookies.push(BrowserCookie {
            name: IDENTITY_COOKIE_NAME.to_string(),
            value: provisional_user_id.to_string(),
            url: Some(format!("https://{domain}/")),
            domain: None,
            path: "/".to_string(),
        });
        cookies.push(BrowserCookie {
            name: IDENTITY_COOKIE_NAME.to_string(),
            value: provisional_user_id.to_string(),
            url: None,
            domain: Some(format!(".{domain}")),
            path: "/".to_string(),
        });
    }
    context.add_cookies(cookies)?;

    // Cookie 注入成功即可保证正确性；localStorage 写失败只记日志不整体失败。
    if let Err(err) = page.evaluate(
        LOCAL_STORAGE_SCRIPT,
        Value::String(provisional_user_id.to_string()),
    ) {
        log::warn!("localStorage identity write failed (tolerated): {err}");
    }
    Ok(())
}

fn new_provisional_user_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut id = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakePage {
        evaluated: StdMutex<Vec<(String, Value)>>,
        fail_local_storage: bool,
    }

    impl BrowserPage for FakePage {
        fn evaluate(&self, script: &str, arg: Value) -> Result<Value, String> {
            if let Ok(mut evaluated) = self.evaluated.lock() {
                evaluated.push((script.to_string(), arg.clone()));
            }
            if script.contains("LM_BRIDGE_MINT_TURNSTILE") {
                return Ok(Value::String("turnstile-token-1".to_string()));
            }
            if script.contains("LM_BRIDGE_MINT_RECAPTCHA_V3") {
                return Ok(Value::String("recaptcha-token-1".to_string()));
            }
            if script.contains("/nextjs-api/sign-up") {
                return Ok(json!({ "status": 200, "ok": true, "body": "{\"user\":{}}" }));
            }
            if script.contains("localStorage.setItem") {
                if self.fail_local_storage {
                    return Err("page crashed during evaluate".to_string());
                }
                return Ok(Value::Bool(true));
            }
            Err(format!("unexpected evaluate script: {script}"))
        }
    }

    #[derive(Default)]
    struct FakeContext {
        added: StdMutex<Vec<BrowserCookie>>,
    }

    impl BrowserContext for FakeContext {
        fn cookies(&self) -> Result<Vec<BrowserCookie>, String> {
            Ok(self.added.lock().map(|v| v.clone()).unwrap_or_default())
        }
        fn add_cookies(&self, cookies: Vec<BrowserCookie>) -> Result<(), String> {
            if let Ok(mut added) = self.added.lock() {
                added.extend(cookies);
            }
            Ok(())
        }
    }

    struct FakeProvider {
        page: Arc<FakePage>,
        context: Arc<FakeContext>,
    }

    impl BrowserProvider for FakeProvider {
        fn acquire(&self) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String> {
            Ok((self.page.clone(), self.context.clone()))
        }
    }

    #[test]
    fn injection_covers_every_domain_variant() {
        let page = FakePage::default();
        let context = FakeContext::default();
        inject_provisional_identity(&page, &context, "prov-1").expect("inject");

        let added = context.added.lock().expect("cookies");
        let domains = config::upstream_domains();
        assert_eq!(added.len(), domains.len() * 2);
        for cookie in added.iter() {
            assert_eq!(cookie.name, "provisional_user_id");
            assert_eq!(cookie.value, "prov-1");
        }
        for domain in &domains {
            assert!(added
                .iter()
                .any(|c| c.url.as_deref() == Some(format!("https://{domain}/").as_str())));
            assert!(added
                .iter()
                .any(|c| c.domain.as_deref() == Some(format!(".{domain}").as_str())));
        }
    }

    #[test]
    fn local_storage_failure_does_not_fail_injection() {
        let page = FakePage {
            fail_local_storage: true,
            ..FakePage::default()
        };
        let context = FakeContext::default();
        inject_provisional_identity(&page, &context, "prov-2").expect("tolerated");
        assert!(!context.added.lock().expect("cookies").is_empty());
    }

    #[test]
    fn signup_posts_both_tokens_and_provisional_id() {
        let page = Arc::new(FakePage::default());
        let context = Arc::new(FakeContext::default());
        let provisioner = SessionProvisioner::new(Arc::new(FakeProvider {
            page: page.clone(),
            context,
        }));

        let session = provisioner.ensure_anonymous_session().expect("provision");
        assert_eq!(session.turnstile_token, "turnstile-token-1");
        assert_eq!(session.recaptcha_token, "recaptcha-token-1");
        assert!(!session.provisional_user_id.is_empty());

        let evaluated = page.evaluated.lock().expect("calls");
        let signup = evaluated
            .iter()
            .find(|(script, _)| script.contains("/nextjs-api/sign-up"))
            .expect("signup call");
        assert_eq!(
            signup.1.get("turnstileToken").and_then(Value::as_str),
            Some("turnstile-token-1")
        );
        assert_eq!(
            signup.1.get("recaptchaToken").and_then(Value::as_str),
            Some("recaptcha-token-1")
        );
        assert_eq!(
            signup.1.get("provisionalUserId").and_then(Value::as_str),
            Some(session.provisional_user_id.as_str())
        );
        let recaptcha = evaluated
            .iter()
            .find(|(script, _)| script.contains("LM_BRIDGE_MINT_RECAPTCHA_V3"))
            .expect("recaptcha call");
        assert_eq!(
            recaptcha.1.get("action").and_then(Value::as_str),
            Some("sign_up")
        );
    }

    #[test]
    fn second_ensure_reuses_cached_identity() {
        let page = Arc::new(FakePage::default());
        let context = Arc::new(FakeContext::default());
        let provisioner = SessionProvisioner::new(Arc::new(FakeProvider {
            page: page.clone(),
            context,
        }));

        let first = provisioner.ensure_anonymous_session().expect("first");
        let calls_after_first = page.evaluated.lock().expect("calls").len();
        let second = provisioner.ensure_anonymous_session().expect("second");
        assert_eq!(first.provisional_user_id, second.provisional_user_id);
        assert_eq!(page.evaluated.lock().expect("calls").len(), calls_after_first);

        provisioner.invalidate();
        assert!(!provisioner.has_session());
    }
}
