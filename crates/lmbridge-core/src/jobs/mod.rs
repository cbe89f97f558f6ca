use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

mod gate;

pub use gate::OneShotGate;

/// Stages a job passes through before streaming begins. `Signup` and `Fetch`
/// carry independent preflight budgets; `Failed`/`Expired` are reachable from
/// any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Queued,
    Signup,
    Fetch,
    Done,
    Failed,
    Expired,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed | Phase::Expired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Signup => "signup",
            Phase::Fetch => "fetch",
            Phase::Done => "done",
            Phase::Failed => "failed",
            Phase::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Phase> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Phase::Queued),
            "signup" => Some(Phase::Signup),
            "fetch" => Some(Phase::Fetch),
            "done" => Some(Phase::Done),
            "failed" => Some(Phase::Failed),
            "expired" => Some(Phase::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid phase transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

/// Result of a blocking line pop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped {
    Line(String),
    EndOfStream,
    TimedOut,
}

/// Consumer-visible snapshot of the timing fields the deadline computation
/// reads. Taken under one lock so phase and its start marker stay consistent.
#[derive(Debug, Clone, Copy)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub phase_started_at: Option<Instant>,
    pub picked_up_at: Option<Instant>,
    pub upstream_fetch_started_at: Option<Instant>,
}

#[derive(Debug)]
struct JobInner {
    phase: Phase,
    picked_up_at: Option<Instant>,
    phase_started_at: Option<Instant>,
    upstream_fetch_started_at: Option<Instant>,
    status_code: Option<u16>,
    fail_reason: Option<String>,
    done: bool,
    abandoned: bool,
    // None 是流结束哨兵，与生产端协议保持一致。
    lines: VecDeque<Option<String>>,
}

#[derive(Debug)]
struct JobState {
    id: String,
    created_at: Instant,
    picked_up: OneShotGate,
    status_known: OneShotGate,
    done_gate: OneShotGate,
    inner: Mutex<JobInner>,
    lines_cond: Condvar,
}

/// Handle shared by exactly one producer and one consumer. All mutation goes
/// through these methods; nothing else touches the inner record.
#[derive(Debug, Clone)]
pub struct JobHandle {
    state: Arc<JobState>,
}

impl JobHandle {
    fn new(id: String) -> Self {
        Self {
            state: Arc::new(JobState {
                id,
                created_at: Instant::now(),
                picked_up: OneShotGate::new(),
                status_known: OneShotGate::new(),
                done_gate: OneShotGate::new(),
                inner: Mutex::new(JobInner {
                    phase: Phase::Queued,
                    picked_up_at: None,
                    phase_started_at: Some(Instant::now()),
                    upstream_fetch_started_at: None,
                    status_code: None,
                    fail_reason: None,
                    done: false,
                    abandoned: false,
                    lines: VecDeque::new(),
                }),
                lines_cond: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    /// Producer has begun work. Idempotent: the timestamp is stamped once and
    /// the gate fires once no matter how often a flaky producer signals.
    pub fn mark_picked_up(&self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            if inner.picked_up_at.is_none() {
                inner.picked_up_at = Some(Instant::now());
            }
        }
        self.state.picked_up.fire();
    }

    /// Moves the job forward. Re-entering the current phase is a silent no-op
    /// so redundant producer signals don't error; backwards or
    /// out-of-machine moves are rejected.
    pub fn transition_phase(&self, to: Phase) -> Result<(), InvalidTransition> {
        let Ok(mut inner) = self.state.inner.lock() else {
            return Ok(());
        };
        let from = inner.phase;
        if from == to {
            return Ok(());
        }
        let allowed = match (from, to) {
            (_, Phase::Failed) | (_, Phase::Expired) => !from.is_terminal(),
            (Phase::Queued, Phase::Signup)
            | (Phase::Queued, Phase::Fetch)
            | (Phase::Signup, Phase::Fetch)
            | (Phase::Fetch, Phase::Done) => true,
            _ => false,
        };
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        inner.phase = to;
        // 中文注释：每次换相必须重盖 phase_started_at，否则 fetch 阶段的预算会把
        // signup 耗掉的时间也算进去，直接复现已修掉的误回退问题。
        inner.phase_started_at = Some(Instant::now());
        if to != Phase::Fetch {
            inner.upstream_fetch_started_at = None;
        }
        Ok(())
    }

    /// The in-page work has issued the actual outbound network call. Only
    /// meaningful during `Fetch`; stray signals in other phases are dropped.
    pub fn mark_upstream_fetch_started(&self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            if inner.phase == Phase::Fetch && inner.upstream_fetch_started_at.is_none() {
                inner.upstream_fetch_started_at = Some(Instant::now());
            }
        }
    }

    /// First status wins; later re-sets are ignored.
    pub fn set_status(&self, code: u16) {
        if let Ok(mut inner) = self.state.inner.lock() {
            if inner.status_code.is_none() {
                inner.status_code = Some(code);
            }
        }
        self.state.status_known.fire();
    }

    /// Appends one raw upstream line. Returns false when the line was
    /// discarded (job already finished or abandoned).
    pub fn push_line(&self, line: String) -> bool {
        let Ok(mut inner) = self.state.inner.lock() else {
            return false;
        };
        if inner.done || inner.abandoned {
            return false;
        }
        inner.lines.push_back(Some(line));
        self.state.lines_cond.notify_all();
        true
    }

    pub fn push_end_of_stream(&self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            if !inner.done && !inner.abandoned {
                inner.lines.push_back(None);
            }
            self.state.lines_cond.notify_all();
        }
    }

    /// Blocking pop with timeout. After the sentinel (or abandonment) every
    /// further pop yields `EndOfStream`.
    pub fn pop_line(&self, timeout: Duration) -> Popped {
        let deadline = Instant::now() + timeout;
        let Ok(mut inner) = self.state.inner.lock() else {
            return Popped::EndOfStream;
        };
        loop {
            if let Some(entry) = inner.lines.pop_front() {
                return match entry {
                    Some(line) => Popped::Line(line),
                    None => Popped::EndOfStream,
                };
            }
            if inner.abandoned || (inner.done && inner.lines.is_empty()) {
                return Popped::EndOfStream;
            }
            let now = Instant::now();
            if now >= deadline {
                return Popped::TimedOut;
            }
            let (guard, _) = match self.state.lines_cond.wait_timeout(inner, deadline - now) {
                Ok(result) => result,
                Err(_) => return Popped::EndOfStream,
            };
            inner = guard;
        }
    }

    /// Terminal success: no further lines will be produced.
    pub fn mark_done(&self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            if !inner.phase.is_terminal() {
                inner.phase = Phase::Done;
                inner.phase_started_at = Some(Instant::now());
            }
            if !inner.done {
                inner.done = true;
                inner.lines.push_back(None);
            }
            self.state.lines_cond.notify_all();
        }
        self.state.done_gate.fire();
    }

    /// Terminal failure with a producer-supplied reason (first reason wins).
    pub fn mark_failed(&self, reason: &str) {
        if let Ok(mut inner) = self.state.inner.lock() {
            if !inner.phase.is_terminal() {
                inner.phase = Phase::Failed;
                inner.phase_started_at = Some(Instant::now());
            }
            if inner.fail_reason.is_none() {
                inner.fail_reason = Some(reason.to_string());
            }
            if !inner.done {
                inner.done = true;
                inner.lines.push_back(None);
            }
            self.state.lines_cond.notify_all();
        }
        self.state.done_gate.fire();
    }

    /// The orchestrator gave up on this attempt. The producer may still be
    /// running; everything it reports from now on is discarded.
    pub fn abandon(&self) {
        if let Ok(mut inner) = self.state.inner.lock() {
            if !inner.phase.is_terminal() {
                inner.phase = Phase::Expired;
                inner.phase_started_at = Some(Instant::now());
            }
            inner.abandoned = true;
            inner.done = true;
            inner.lines.clear();
            self.state.lines_cond.notify_all();
        }
        self.state.done_gate.fire();
    }

    pub fn phase_snapshot(&self) -> PhaseSnapshot {
        let Ok(inner) = self.state.inner.lock() else {
            return PhaseSnapshot {
                phase: Phase::Expired,
                phase_started_at: None,
                picked_up_at: None,
                upstream_fetch_started_at: None,
            };
        };
        PhaseSnapshot {
            phase: inner.phase,
            phase_started_at: inner.phase_started_at,
            picked_up_at: inner.picked_up_at,
            upstream_fetch_started_at: inner.upstream_fetch_started_at,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase_snapshot().phase
    }

    pub fn status(&self) -> Option<u16> {
        self.state
            .inner
            .lock()
            .ok()
            .and_then(|inner| inner.status_code)
    }

    pub fn fail_reason(&self) -> Option<String> {
        self.state
            .inner
            .lock()
            .ok()
            .and_then(|inner| inner.fail_reason.clone())
    }

    pub fn is_abandoned(&self) -> bool {
        self.state
            .inner
            .lock()
            .map(|inner| inner.abandoned)
            .unwrap_or(true)
    }

    pub fn is_done(&self) -> bool {
        self.state
            .inner
            .lock()
            .map(|inner| inner.done)
            .unwrap_or(true)
    }

    pub fn picked_up_gate(&self) -> &OneShotGate {
        &self.state.picked_up
    }

    pub fn status_gate(&self) -> &OneShotGate {
        &self.state.status_known
    }

    pub fn done_gate(&self) -> &OneShotGate {
        &self.state.done_gate
    }

    fn age(&self) -> Duration {
        self.state.created_at.elapsed()
    }
}

/// Registry owning every live job, keyed by id. One instance is created at
/// startup and passed to every collaborator; there is no ambient global map.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_job(&self) -> JobHandle {
        let handle = JobHandle::new(new_job_id());
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.insert(handle.id().to_string(), handle.clone());
        }
        handle
    }

    pub fn get(&self, id: &str) -> Option<JobHandle> {
        let Ok(jobs) = self.jobs.lock() else {
            return None;
        };
        jobs.get(id).cloned()
    }

    /// Removes the record once the consumer has fully drained and
    /// acknowledged it (or given up on it).
    pub fn remove(&self, id: &str) {
        if let Ok(mut jobs) = self.jobs.lock() {
            jobs.remove(id);
        }
    }

    /// Marks the job expired but keeps the record so late producer reports
    /// can be answered with "gone" instead of "not found" until the sweep.
    pub fn abandon(&self, id: &str) {
        if let Some(job) = self.get(id) {
            job.abandon();
        }
    }

    /// Drops terminal jobs older than `max_age` and force-expires stragglers.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let Ok(mut jobs) = self.jobs.lock() else {
            return 0;
        };
        let before = jobs.len();
        jobs.retain(|_, job| {
            if job.age() < max_age {
                return true;
            }
            if !job.phase().is_terminal() {
                job.abandon();
            }
            false
        });
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn new_job_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut id = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}
