use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Set-once cross-thread signal. Firing twice is allowed and observable
/// exactly once; waiters are level-triggered, so a gate fired before the wait
/// returns immediately.
#[derive(Debug, Default)]
pub struct OneShotGate {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl OneShotGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the first fire.
    pub fn fire(&self) -> bool {
        let Ok(mut fired) = self.fired.lock() else {
            return false;
        };
        if *fired {
            return false;
        }
        *fired = true;
        self.cond.notify_all();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired.lock().map(|fired| *fired).unwrap_or(false)
    }

    /// Waits until the gate fires or the timeout elapses; true when fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let Ok(mut fired) = self.fired.lock() else {
            return false;
        };
        while !*fired {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = match self.cond.wait_timeout(fired, deadline - now) {
                Ok(result) => result,
                Err(_) => return false,
            };
            fired = guard;
        }
        true
    }
}
