//! # Mutex-guarded boolean with compound check-and-act operations.
//!
//! [`LockedBool`] is the state primitive used wherever a component flips between two
//! lifecycle states exactly once under concurrent callers (service readiness,
//! supervisor readiness).
//!
//! Every operation holds a single [`parking_lot::Mutex`] for the full duration of
//! the supplied callback, so "observe, decide, act" sequences are atomic:
//! ```text
//! set_if(false, true, || publish(ServiceRegistered))
//!   lock ─► current == false? ─► state = true ─► callback ─► unlock
//! ```
//!
//! ## Re-entrancy
//! The lock is **not** re-entrant. A callback that calls back into the same
//! `LockedBool` deadlocks. Keep callbacks short and never hand the primitive to them.

use parking_lot::Mutex;

/// Boolean state with atomic observe-and-transition operations.
#[derive(Debug, Default)]
pub struct LockedBool {
    state: Mutex<bool>,
}

impl LockedBool {
    /// Creates the primitive with an initial value.
    pub fn new(initial: bool) -> Self {
        Self {
            state: Mutex::new(initial),
        }
    }

    /// Returns the current state.
    pub fn get(&self) -> bool {
        *self.state.lock()
    }

    /// Assigns `value`.
    pub fn set(&self, value: bool) {
        *self.state.lock() = value;
    }

    /// Assigns `value` and runs `on_change` with the new value while the lock is held.
    pub fn set_with(&self, value: bool, on_change: impl FnOnce(bool)) {
        let mut state = self.state.lock();
        *state = value;
        on_change(value);
    }

    /// Assigns `new` only if the current state equals `expected`.
    ///
    /// `on_change` runs inside the same critical section. Returns `true` if the
    /// transition happened.
    pub fn set_if(&self, expected: bool, new: bool, on_change: impl FnOnce()) -> bool {
        let mut state = self.state.lock();
        if *state != expected {
            return false;
        }
        *state = new;
        on_change();
        true
    }

    /// Runs `f` if the current state equals `expected` and commits `new` only when it succeeds.
    ///
    /// Returns `None` when the state did not match, otherwise the callback result.
    pub fn try_set_if<R, E>(
        &self,
        expected: bool,
        new: bool,
        f: impl FnOnce() -> Result<R, E>,
    ) -> Option<Result<R, E>> {
        let mut state = self.state.lock();
        if *state != expected {
            return None;
        }
        let res = f();
        if res.is_ok() {
            *state = new;
        }
        Some(res)
    }

    /// Runs `f` with the current state, mutually exclusive with writers.
    pub fn run<R>(&self, f: impl FnOnce(bool) -> R) -> R {
        let state = self.state.lock();
        f(*state)
    }

    /// Runs `f` only if the current state equals `expected`.
    pub fn run_if<R>(&self, expected: bool, f: impl FnOnce() -> R) -> Option<R> {
        let state = self.state.lock();
        (*state == expected).then(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_if_only_fires_on_matching_state() {
        let flag = LockedBool::new(false);
        let mut calls = 0;
        assert!(flag.set_if(false, true, || calls += 1));
        assert!(!flag.set_if(false, true, || calls += 1));
        assert_eq!(calls, 1);
        assert!(flag.get());
    }

    #[test]
    fn try_set_if_commits_only_on_success() {
        let flag = LockedBool::new(false);
        let res: Option<Result<(), &str>> = flag.try_set_if(false, true, || Err("start failed"));
        assert!(matches!(res, Some(Err(_))));
        assert!(!flag.get());

        let res: Option<Result<u8, &str>> = flag.try_set_if(false, true, || Ok(1));
        assert_eq!(res, Some(Ok(1)));
        assert!(flag.get());

        let res: Option<Result<u8, &str>> = flag.try_set_if(false, true, || Ok(2));
        assert_eq!(res, None);
    }

    #[test]
    fn run_if_does_not_mutate() {
        let flag = LockedBool::new(true);
        assert_eq!(flag.run_if(true, || 5), Some(5));
        assert_eq!(flag.run_if(false, || 5), None);
        assert!(flag.run(|s| s));
    }

    #[test]
    fn set_with_sees_new_value() {
        let flag = LockedBool::new(false);
        let mut seen = None;
        flag.set_with(true, |v| seen = Some(v));
        assert_eq!(seen, Some(true));
    }

    #[test]
    fn concurrent_transition_happens_once() {
        let flag = Arc::new(LockedBool::new(false));
        let hits = Arc::new(AtomicUsize::new(0));
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let flag = Arc::clone(&flag);
                let hits = Arc::clone(&hits);
                std::thread::spawn(move || {
                    flag.set_if(false, true, || {
                        hits.fetch_add(1, Ordering::SeqCst);
                    });
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
