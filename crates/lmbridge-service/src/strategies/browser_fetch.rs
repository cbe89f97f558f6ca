use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;

use lmbridge_core::jobs::{JobHandle, Phase};

use crate::browser::{BrowserPage, BrowserProvider};
use crate::session::SessionProvisioner;
use crate::strategies::{normalize_relay_url, Strategy, UpstreamRequest};

const MINT_RECAPTCHA_SCRIPT: &str =
    "async (arg) => await window.LM_BRIDGE_MINT_RECAPTCHA_V3(arg.sitekey, arg.action)";
const FETCH_STREAM_SCRIPT: &str = r#"async (arg) => {
  const resp = await fetch(arg.url, {
    method: arg.method,
    headers: { 'content-type': 'application/json', 'x-recaptcha-token': arg.recaptchaToken },
    body: JSON.stringify(arg.payload),
  });
  return { status: resp.status, body: await resp.text() };
}"#;

/// Locally driven acquisition: the bridge drives the automated browser page
/// itself instead of waiting for an external producer.
pub struct BrowserFetchStrategy {
    provider: Arc<dyn BrowserProvider>,
    session: Arc<SessionProvisioner>,
}

impl BrowserFetchStrategy {
    pub fn new(provider: Arc<dyn BrowserProvider>, session: Arc<SessionProvisioner>) -> Self {
        Self { provider, session }
    }
}

impl Strategy for BrowserFetchStrategy {
    fn name(&self) -> &'static str {
        "browser"
    }

    fn dispatch(&self, request: &UpstreamRequest, job: &JobHandle) -> Result<(), String> {
        let provider = Arc::clone(&self.provider);
        let session = Arc::clone(&self.session);
        let request = request.clone();
        let job = job.clone();
        thread::Builder::new()
            .name(format!("browser-fetch-{}", &job.id()[..8]))
            .spawn(move || run_browser_fetch(provider, session, request, job))
            .map_err(|err| format!("spawn browser fetch thread failed: {err}"))?;
        Ok(())
    }
}

fn run_browser_fetch(
    provider: Arc<dyn BrowserProvider>,
    session: Arc<SessionProvisioner>,
    request: UpstreamRequest,
    job: JobHandle,
) {
    job.mark_picked_up();

    if !session.has_session() {
        if let Err(err) = job.transition_phase(Phase::Signup) {
            log::warn!("browser fetch phase error: {err}");
        }
        // 注册失败整体重试一次；再失败才把这次尝试判死。
        if let Err(first) = session.ensure_anonymous_session() {
            log::warn!("session provisioning failed, retrying once: {first}");
            session.invalidate();
            if let Err(second) = session.ensure_anonymous_session() {
                job.mark_failed(&format!("session provisioning failed: {second}"));
                return;
            }
        }
    }
    if job.is_abandoned() {
        return;
    }

    if let Err(err) = job.transition_phase(Phase::Fetch) {
        log::warn!("browser fetch phase error: {err}");
    }

    let (page, _context) = match provider.acquire() {
        Ok(pair) => pair,
        Err(err) => {
            job.mark_failed(&format!("browser unavailable: {err}"));
            return;
        }
    };

    // Preflight: a fresh score token for the streaming call. This can be
    // slow, which is exactly why the status deadline must not be armed yet.
    let sitekey = std::env::var("LMBRIDGE_RECAPTCHA_SITEKEY").unwrap_or_default();
    let recaptcha_token = match page.evaluate(
        MINT_RECAPTCHA_SCRIPT,
        json!({ "sitekey": sitekey, "action": "create_evaluation" }),
    ) {
        Ok(value) => value.as_str().unwrap_or_default().to_string(),
        Err(err) => {
            job.mark_failed(&format!("score token mint failed: {err}"));
            return;
        }
    };
    if job.is_abandoned() {
        return;
    }

    job.mark_upstream_fetch_started();
    let response = page.evaluate(
        FETCH_STREAM_SCRIPT,
        json!({
            "method": request.method,
            "url": normalize_relay_url(&request.url),
            "payload": request.payload,
            "recaptchaToken": recaptcha_token,
        }),
    );
    finish_from_page_response(&job, response);
}

fn finish_from_page_response(job: &JobHandle, response: Result<Value, String>) {
    match response {
        Ok(value) => {
            let status = value.get("status").and_then(Value::as_u64).unwrap_or(0) as u16;
            job.set_status(status);
            if let Some(body) = value.get("body").and_then(Value::as_str) {
                for line in body.lines() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    if !job.push_line(line.to_string()) {
                        // 任务已被放弃，剩下的输出全部丢弃。
                        return;
                    }
                }
            }
            job.push_end_of_stream();
            job.mark_done();
        }
        Err(err) => {
            job.mark_failed(&format!("in-page fetch failed: {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{BrowserContext, BrowserCookie};
    use lmbridge_core::jobs::JobRegistry;
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedPage {
        fetch_result: Value,
        calls: Mutex<Vec<String>>,
    }

    impl BrowserPage for ScriptedPage {
        fn evaluate(&self, script: &str, _arg: Value) -> Result<Value, String> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(script.to_string());
            }
            if script.contains("LM_BRIDGE_MINT_RECAPTCHA_V3") {
                return Ok(Value::String("score-token".to_string()));
            }
            Ok(self.fetch_result.clone())
        }
    }

    struct NoopContext;

    impl BrowserContext for NoopContext {
        fn cookies(&self) -> Result<Vec<BrowserCookie>, String> {
            Ok(Vec::new())
        }
        fn add_cookies(&self, _cookies: Vec<BrowserCookie>) -> Result<(), String> {
            Ok(())
        }
    }

    struct ScriptedProvider {
        page: Arc<ScriptedPage>,
    }

    impl BrowserProvider for ScriptedProvider {
        fn acquire(
            &self,
        ) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String> {
            Ok((self.page.clone(), Arc::new(NoopContext)))
        }
    }

    #[test]
    fn successful_fetch_streams_lines_and_finishes() {
        let registry = JobRegistry::new();
        let job = registry.create_job();
        let page = Arc::new(ScriptedPage {
            fetch_result: json!({
                "status": 200,
                "body": "a0:\"Hello\"\nad:{\"finishReason\":\"stop\"}",
            }),
            calls: Mutex::new(Vec::new()),
        });

        run_browser_fetch(
            Arc::new(ScriptedProvider { page: page.clone() }),
            session_with_identity(),
            sample_request(),
            job.clone(),
        );

        assert_eq!(job.status(), Some(200));
        assert!(job.status_gate().is_fired());
        assert_eq!(job.phase(), Phase::Done);
        assert_eq!(
            job.pop_line(Duration::from_millis(10)),
            lmbridge_core::jobs::Popped::Line("a0:\"Hello\"".to_string())
        );
        assert!(job.phase_snapshot().upstream_fetch_started_at.is_some());
    }

    #[test]
    fn evaluate_error_marks_job_failed() {
        struct FailingPage;
        impl BrowserPage for FailingPage {
            fn evaluate(&self, script: &str, _arg: Value) -> Result<Value, String> {
                if script.contains("LM_BRIDGE_MINT_RECAPTCHA_V3") {
                    return Ok(Value::String("score-token".to_string()));
                }
                Err("page closed".to_string())
            }
        }
        struct FailingProvider;
        impl BrowserProvider for FailingProvider {
            fn acquire(
                &self,
            ) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String> {
                Ok((Arc::new(FailingPage), Arc::new(NoopContext)))
            }
        }

        let registry = JobRegistry::new();
        let job = registry.create_job();
        run_browser_fetch(
            Arc::new(FailingProvider),
            session_with_identity(),
            sample_request(),
            job.clone(),
        );
        assert_eq!(job.phase(), Phase::Failed);
        assert!(job
            .fail_reason()
            .unwrap_or_default()
            .contains("in-page fetch failed"));
    }

    #[test]
    fn session_provisioning_failure_is_retried_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct SignupOkPage;
        impl BrowserPage for SignupOkPage {
            fn evaluate(&self, script: &str, _arg: Value) -> Result<Value, String> {
                if script.contains("LM_BRIDGE_MINT_TURNSTILE") {
                    return Ok(Value::String("t".to_string()));
                }
                if script.contains("LM_BRIDGE_MINT_RECAPTCHA_V3") {
                    return Ok(Value::String("r".to_string()));
                }
                if script.contains("/nextjs-api/sign-up") {
                    return Ok(json!({"status": 200, "ok": true, "body": "{}"}));
                }
                Ok(Value::Bool(true))
            }
        }
        struct FlakyProvider {
            acquires: AtomicUsize,
        }
        impl BrowserProvider for FlakyProvider {
            fn acquire(
                &self,
            ) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String> {
                // 第一次拿页面失败，之后恢复。
                if self.acquires.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err("browser not warmed up yet".to_string());
                }
                Ok((Arc::new(SignupOkPage), Arc::new(NoopContext)))
            }
        }

        let flaky = Arc::new(FlakyProvider {
            acquires: AtomicUsize::new(0),
        });
        let session = Arc::new(SessionProvisioner::new(flaky.clone()));
        let registry = JobRegistry::new();
        let job = registry.create_job();
        let page = Arc::new(ScriptedPage {
            fetch_result: json!({
                "status": 200,
                "body": "a0:\"ok\"\nad:{\"finishReason\":\"stop\"}",
            }),
            calls: Mutex::new(Vec::new()),
        });

        run_browser_fetch(
            Arc::new(ScriptedProvider { page }),
            session,
            sample_request(),
            job.clone(),
        );

        assert_eq!(flaky.acquires.load(Ordering::SeqCst), 2);
        assert_eq!(job.phase(), Phase::Done);
        assert_eq!(job.status(), Some(200));
    }

    #[test]
    fn provisioning_failing_twice_fails_the_job() {
        struct DeadProvider;
        impl BrowserProvider for DeadProvider {
            fn acquire(
                &self,
            ) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String> {
                Err("no browser".to_string())
            }
        }

        let session = Arc::new(SessionProvisioner::new(Arc::new(DeadProvider)));
        let registry = JobRegistry::new();
        let job = registry.create_job();
        run_browser_fetch(Arc::new(DeadProvider), session, sample_request(), job.clone());
        assert_eq!(job.phase(), Phase::Failed);
        assert!(job
            .fail_reason()
            .unwrap_or_default()
            .contains("session provisioning failed"));
    }

    fn sample_request() -> UpstreamRequest {
        UpstreamRequest {
            method: "POST".to_string(),
            url: "https://lmarena.ai/nextjs-api/stream/create-evaluation".to_string(),
            payload: json!({"model": "m"}),
        }
    }

    fn session_with_identity() -> Arc<SessionProvisioner> {
        struct SignupPage;
        impl BrowserPage for SignupPage {
            fn evaluate(&self, script: &str, _arg: Value) -> Result<Value, String> {
                if script.contains("LM_BRIDGE_MINT_TURNSTILE") {
                    return Ok(Value::String("t".to_string()));
                }
                if script.contains("LM_BRIDGE_MINT_RECAPTCHA_V3") {
                    return Ok(Value::String("r".to_string()));
                }
                if script.contains("/nextjs-api/sign-up") {
                    return Ok(json!({"status": 200, "ok": true, "body": "{}"}));
                }
                Ok(Value::Bool(true))
            }
        }
        struct SignupProvider;
        impl BrowserProvider for SignupProvider {
            fn acquire(
                &self,
            ) -> Result<(Arc<dyn BrowserPage>, Arc<dyn BrowserContext>), String> {
                Ok((Arc::new(SignupPage), Arc::new(NoopContext)))
            }
        }
        let provisioner = Arc::new(SessionProvisioner::new(Arc::new(SignupProvider)));
        provisioner
            .ensure_anonymous_session()
            .expect("provision test identity");
        provisioner
    }
}
