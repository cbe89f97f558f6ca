use std::sync::Arc;
use std::time::{Duration, Instant};

use lmbridge_core::config::FetchTimeouts;
use lmbridge_core::error::FetchError;
use lmbridge_core::jobs::{JobHandle, Phase, PhaseSnapshot};

use crate::state::BridgeState;
use crate::strategies::{Strategy, UpstreamRequest};

pub(crate) mod metrics;
pub mod openai;

pub(crate) use metrics::bridge_metrics_prometheus;

// 中文注释：监督循环的单次等待片长。换相不会唤醒 status gate，
// 所以必须以有界片长轮醒来重新计算当前相位的截止时间。
const SUPERVISION_SLICE: Duration = Duration::from_millis(25);

/// Committed result of one cascade: exactly one job produced the stream the
/// caller will consume.
#[derive(Debug)]
pub struct CascadeOutcome {
    pub job: JobHandle,
    pub strategy: &'static str,
    pub status: u16,
}

/// Tries each eligible strategy in preference order until one commits. The
/// overall wall-clock ceiling spans the whole cascade, not one attempt.
pub fn run_cascade(
    state: &BridgeState,
    request: &UpstreamRequest,
) -> Result<CascadeOutcome, FetchError> {
    let _guard = metrics::begin_bridge_request();
    let started = Instant::now();
    let result = run_cascade_inner(state, request, started);
    metrics::record_request_duration(started.elapsed());
    result
}

fn run_cascade_inner(
    state: &BridgeState,
    request: &UpstreamRequest,
    started: Instant,
) -> Result<CascadeOutcome, FetchError> {
    let candidates = order_strategies(&state.strategies);
    if candidates.is_empty() {
        log::error!("no acquisition strategy configured");
        metrics::record_exhausted();
        return Err(FetchError::NoStrategyAvailable);
    }

    let overall_deadline = started + state.timeouts.overall;
    let mut last_error = FetchError::NoStrategyAvailable;
    for (index, strategy) in candidates.iter().enumerate() {
        if index > 0 {
            metrics::record_fallback_attempt();
            log::warn!(
                "falling back to strategy {} after: {last_error}",
                strategy.name()
            );
        }
        if Instant::now() >= overall_deadline {
            last_error = FetchError::OverallTimeout;
            break;
        }

        let job = state.registry.create_job();
        if let Err(err) = strategy.dispatch(request, &job) {
            log::warn!("strategy {} dispatch failed: {err}", strategy.name());
            state.registry.abandon(job.id());
            state.registry.remove(job.id());
            last_error = FetchError::ProducerFailure(err);
            continue;
        }

        match supervise(&job, &state.timeouts, overall_deadline) {
            Ok(status) => {
                metrics::record_commit();
                return Ok(CascadeOutcome {
                    job,
                    strategy: strategy.name(),
                    status,
                });
            }
            Err(err) => {
                if let FetchError::UpstreamRejected { status } = err {
                    // 身份被上游明确拒绝时作废缓存，下一次尝试重新注册。
                    if status == 401 || status == 403 {
                        state.session.invalidate();
                    }
                }
                strategy.cancel(job.id());
                state.registry.abandon(job.id());
                state.registry.remove(job.id());
                let fatal = matches!(err, FetchError::OverallTimeout);
                last_error = err;
                if fatal {
                    break;
                }
            }
        }
    }

    metrics::record_exhausted();
    Err(last_error)
}

/// Preference order for this request: strategies that look alive first,
/// original declaration order preserved within each group.
fn order_strategies(strategies: &[Arc<dyn Strategy>]) -> Vec<Arc<dyn Strategy>> {
    let mut ordered = strategies.to_vec();
    ordered.sort_by_key(|strategy| !strategy.looks_alive());
    ordered
}

/// Watches one attempt until it commits (2xx status) or a deadline fires.
/// Deadlines are phase-relative and re-anchored on every phase change; the
/// status deadline is only armed once the upstream call has actually started.
fn supervise(
    job: &JobHandle,
    timeouts: &FetchTimeouts,
    overall_deadline: Instant,
) -> Result<u16, FetchError> {
    let pickup_deadline = (Instant::now() + timeouts.pickup).min(overall_deadline);
    while !job.picked_up_gate().is_fired() {
        let now = Instant::now();
        if now >= overall_deadline {
            return Err(FetchError::OverallTimeout);
        }
        if now >= pickup_deadline {
            return Err(FetchError::PickupTimeout);
        }
        job.picked_up_gate()
            .wait_timeout((pickup_deadline - now).min(SUPERVISION_SLICE));
    }

    loop {
        if job.status_gate().is_fired() {
            let status = job.status().unwrap_or(0);
            return if (200..300).contains(&status) {
                Ok(status)
            } else {
                Err(FetchError::UpstreamRejected { status })
            };
        }

        let snapshot = job.phase_snapshot();
        match snapshot.phase {
            Phase::Failed => {
                return Err(FetchError::ProducerFailure(
                    job.fail_reason()
                        .unwrap_or_else(|| "producer failed".to_string()),
                ));
            }
            Phase::Expired => {
                return Err(FetchError::ProducerFailure("job expired".to_string()));
            }
            Phase::Done => {
                return Err(FetchError::ProducerFailure(
                    "producer finished without reporting a status".to_string(),
                ));
            }
            Phase::Queued | Phase::Signup | Phase::Fetch => {}
        }

        let now = Instant::now();
        if now >= overall_deadline {
            return Err(FetchError::OverallTimeout);
        }
        let (deadline, on_expiry) = phase_deadline(&snapshot, timeouts);
        if now >= deadline {
            return Err(on_expiry);
        }
        let wait = (deadline - now)
            .min(overall_deadline - now)
            .min(SUPERVISION_SLICE);
        job.status_gate().wait_timeout(wait);
    }
}

fn phase_deadline(snapshot: &PhaseSnapshot, timeouts: &FetchTimeouts) -> (Instant, FetchError) {
    let phase_started = snapshot.phase_started_at.unwrap_or_else(Instant::now);
    match snapshot.phase {
        Phase::Signup => (
            phase_started + timeouts.signup_preflight,
            FetchError::PreflightTimeout {
                phase: Phase::Signup,
            },
        ),
        Phase::Fetch => match snapshot.upstream_fetch_started_at {
            // 中文注释：status 截止时间以 fetch 相位起点与网络调用起点中较晚者
            // 为锚；否则慢启动的 preflight 会偷走等 status 的预算。
            Some(fetch_started) => (
                phase_started.max(fetch_started) + timeouts.status,
                FetchError::StatusTimeout,
            ),
            None => (
                phase_started + timeouts.fetch_preflight,
                FetchError::PreflightTimeout { phase: Phase::Fetch },
            ),
        },
        // Picked up but no phase report yet: budget like a fetch preflight
        // anchored at pickup.
        _ => {
            let anchor = snapshot.picked_up_at.unwrap_or(phase_started);
            (
                anchor + timeouts.fetch_preflight,
                FetchError::PreflightTimeout { phase: Phase::Fetch },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    type Script = Arc<dyn Fn(JobHandle) + Send + Sync>;

    struct ScriptedStrategy {
        label: &'static str,
        alive: bool,
        dispatches: AtomicUsize,
        last_job: Mutex<Option<JobHandle>>,
        script: Script,
    }

    impl ScriptedStrategy {
        fn new(label: &'static str, script: Script) -> Arc<Self> {
            Arc::new(Self {
                label,
                alive: true,
                dispatches: AtomicUsize::new(0),
                last_job: Mutex::new(None),
                script,
            })
        }

        fn dispatch_count(&self) -> usize {
            self.dispatches.load(Ordering::SeqCst)
        }

        fn last_job(&self) -> Option<JobHandle> {
            self.last_job.lock().unwrap().clone()
        }
    }

    impl Strategy for ScriptedStrategy {
        fn name(&self) -> &'static str {
            self.label
        }

        fn looks_alive(&self) -> bool {
            self.alive
        }

        fn dispatch(&self, _request: &UpstreamRequest, job: &JobHandle) -> Result<(), String> {
            self.dispatches.fetch_add(1, Ordering::SeqCst);
            *self.last_job.lock().unwrap() = Some(job.clone());
            let job = job.clone();
            let script = self.script.clone();
            thread::spawn(move || script(job));
            Ok(())
        }
    }

    fn tight_timeouts() -> FetchTimeouts {
        FetchTimeouts {
            pickup: Duration::from_millis(200),
            signup_preflight: Duration::from_millis(500),
            fetch_preflight: Duration::from_millis(80),
            status: Duration::from_millis(100),
            overall: Duration::from_secs(5),
        }
    }

    fn sample_request() -> UpstreamRequest {
        UpstreamRequest {
            method: "POST".to_string(),
            url: "/nextjs-api/stream/create-evaluation".to_string(),
            payload: json!({"model": "m"}),
        }
    }

    fn quick_success(job: JobHandle) {
        job.mark_picked_up();
        job.transition_phase(Phase::Fetch).unwrap();
        job.mark_upstream_fetch_started();
        job.set_status(200);
        job.push_line("a0:\"ok\"".to_string());
        job.transition_phase(Phase::Done).unwrap();
        job.mark_done();
    }

    #[test]
    fn dead_looking_strategies_sort_after_alive_ones() {
        let stalled = ScriptedStrategy::new("first", Arc::new(|_| {}));
        let healthy = ScriptedStrategy::new("second", Arc::new(|_| {}));
        let strategies: Vec<Arc<dyn Strategy>> = vec![
            Arc::new(StalenessOverride {
                inner: stalled,
                alive: false,
            }),
            healthy,
        ];
        let ordered = order_strategies(&strategies);
        assert_eq!(ordered[0].name(), "second");
        assert_eq!(ordered[1].name(), "first");
    }

    struct StalenessOverride {
        inner: Arc<ScriptedStrategy>,
        alive: bool,
    }

    impl Strategy for StalenessOverride {
        fn name(&self) -> &'static str {
            self.inner.name()
        }
        fn looks_alive(&self) -> bool {
            self.alive
        }
        fn dispatch(&self, request: &UpstreamRequest, job: &JobHandle) -> Result<(), String> {
            self.inner.dispatch(request, job)
        }
    }

    #[test]
    fn slow_signup_within_its_own_budget_succeeds_without_fallback() {
        // Signup takes longer than the fetch preflight budget on purpose.
        let first = ScriptedStrategy::new(
            "slow-signup",
            Arc::new(|job: JobHandle| {
                job.mark_picked_up();
                job.transition_phase(Phase::Signup).unwrap();
                thread::sleep(Duration::from_millis(150));
                job.transition_phase(Phase::Fetch).unwrap();
                thread::sleep(Duration::from_millis(30));
                job.mark_upstream_fetch_started();
                thread::sleep(Duration::from_millis(40));
                job.set_status(200);
                job.mark_done();
            }),
        );
        let second = ScriptedStrategy::new("untouched", Arc::new(quick_success));
        let state = BridgeState::with_strategies(
            vec![first.clone(), second.clone()],
            tight_timeouts(),
        )
        .expect("state");

        let outcome = run_cascade(&state, &sample_request()).expect("commit");
        assert_eq!(outcome.strategy, "slow-signup");
        assert_eq!(outcome.status, 200);
        assert_eq!(second.dispatch_count(), 0);
    }

    #[test]
    fn status_deadline_not_armed_before_upstream_fetch_starts() {
        // Stall in fetch preflight for longer than the status timeout; the
        // attempt must survive because the upstream call has not started.
        let timeouts = FetchTimeouts {
            status: Duration::from_millis(50),
            fetch_preflight: Duration::from_millis(250),
            ..tight_timeouts()
        };
        let strategy = ScriptedStrategy::new(
            "slow-preflight",
            Arc::new(|job: JobHandle| {
                job.mark_picked_up();
                job.transition_phase(Phase::Fetch).unwrap();
                thread::sleep(Duration::from_millis(120));
                job.mark_upstream_fetch_started();
                thread::sleep(Duration::from_millis(20));
                job.set_status(200);
                job.mark_done();
            }),
        );
        let state = BridgeState::with_strategies(vec![strategy], timeouts).expect("state");
        let outcome = run_cascade(&state, &sample_request()).expect("commit");
        assert_eq!(outcome.status, 200);
    }

    #[test]
    fn fetch_preflight_expiry_falls_through_to_next_strategy() {
        let stalled = ScriptedStrategy::new(
            "stalled",
            Arc::new(|job: JobHandle| {
                job.mark_picked_up();
                job.transition_phase(Phase::Fetch).unwrap();
                // Never starts the upstream call.
            }),
        );
        let backup = ScriptedStrategy::new("backup", Arc::new(quick_success));
        let state = BridgeState::with_strategies(
            vec![stalled.clone(), backup.clone()],
            tight_timeouts(),
        )
        .expect("state");

        let outcome = run_cascade(&state, &sample_request()).expect("commit");
        assert_eq!(outcome.strategy, "backup");
        assert!(stalled.last_job().expect("dispatched").is_abandoned());
    }

    #[test]
    fn pickup_timeout_falls_through_and_late_success_is_discarded() {
        let never_picked_up = ScriptedStrategy::new("deaf", Arc::new(|_job: JobHandle| {}));
        let backup = ScriptedStrategy::new("backup", Arc::new(quick_success));
        let state = BridgeState::with_strategies(
            vec![never_picked_up.clone(), backup.clone()],
            tight_timeouts(),
        )
        .expect("state");

        let outcome = run_cascade(&state, &sample_request()).expect("commit");
        assert_eq!(outcome.strategy, "backup");

        // A late producer waking up on the abandoned attempt changes nothing.
        let stale = never_picked_up.last_job().expect("dispatched");
        assert!(stale.is_abandoned());
        assert!(!stale.push_line("a0:\"late\"".to_string()));
        stale.set_status(200);
        assert_eq!(outcome.job.status(), Some(200));
        assert_eq!(outcome.job.pop_line(Duration::from_millis(50)),
            lmbridge_core::jobs::Popped::Line("a0:\"ok\"".to_string()));
    }

    #[test]
    fn overall_ceiling_ends_the_cascade_instead_of_trying_the_next_strategy() {
        // 单次尝试的 signup 预算还没用完，但整体墙钟先到；必须以
        // OverallTimeout 收场，而不是继续轮下一个策略。
        let timeouts = FetchTimeouts {
            overall: Duration::from_millis(250),
            ..tight_timeouts()
        };
        let stall_in_signup: Script = Arc::new(|job: JobHandle| {
            job.mark_picked_up();
            job.transition_phase(Phase::Signup).unwrap();
            thread::sleep(Duration::from_secs(1));
        });
        let first = ScriptedStrategy::new("first", stall_in_signup.clone());
        let second = ScriptedStrategy::new("second", stall_in_signup);
        let state = BridgeState::with_strategies(
            vec![first.clone(), second.clone()],
            timeouts,
        )
        .expect("state");

        let started = Instant::now();
        let err = run_cascade(&state, &sample_request()).expect_err("ceiling");
        assert_eq!(err, FetchError::OverallTimeout);
        assert_eq!(err.client_status(), 502);
        assert!(started.elapsed() < Duration::from_millis(900));
        assert_eq!(second.dispatch_count(), 0);
        assert!(first.last_job().expect("dispatched").is_abandoned());
    }

    #[test]
    fn non_success_status_surfaces_as_rejection_after_exhaustion() {
        let rejected = ScriptedStrategy::new(
            "rejected",
            Arc::new(|job: JobHandle| {
                job.mark_picked_up();
                job.transition_phase(Phase::Fetch).unwrap();
                job.mark_upstream_fetch_started();
                job.set_status(429);
                job.mark_done();
            }),
        );
        let state = BridgeState::with_strategies(vec![rejected], tight_timeouts()).expect("state");
        let err = run_cascade(&state, &sample_request()).expect_err("exhausted");
        assert_eq!(err, FetchError::UpstreamRejected { status: 429 });
        assert_eq!(err.client_status(), 429);
    }

    #[test]
    fn producer_failure_reason_is_preserved() {
        let failing = ScriptedStrategy::new(
            "failing",
            Arc::new(|job: JobHandle| {
                job.mark_picked_up();
                job.mark_failed("tab crashed");
            }),
        );
        let state = BridgeState::with_strategies(vec![failing], tight_timeouts()).expect("state");
        let err = run_cascade(&state, &sample_request()).expect_err("exhausted");
        assert_eq!(err, FetchError::ProducerFailure("tab crashed".to_string()));
    }
}
