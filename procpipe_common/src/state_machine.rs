use std::sync::{Mutex, MutexGuard};

/// A lock-guarded state cell whose transitions happen atomically.
///
/// The state `S` lives behind a `Mutex`; every transition runs a closure while
/// the lock is held, so "check the current state, then move to the next one"
/// can never interleave with another thread doing the same.
///
/// # Example
///
/// ```rust
/// use procpipe_common::state_machine::StateMachine;
///
/// enum Lifecycle {
///     Created,
///     Started(u32),
/// }
///
/// let machine = StateMachine::new(Lifecycle::Created);
///
/// let started_now = machine.transition(|state| match state {
///     Lifecycle::Created => {
///         *state = Lifecycle::Started(42);
///         true
///     }
///     Lifecycle::Started(_) => false,
/// });
/// assert!(started_now);
/// ```
#[derive(Debug)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    /// Creates a new `StateMachine` in the given initial state.
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Locks the state for a plain read or a check.
    ///
    /// Poisoning is treated as unrecoverable: a panic while a transition held
    /// the lock leaves the lifecycle in an unknown state.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().expect("state machine lock poisoned")
    }

    /// Runs `f` against the current state with the lock held and returns its result.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.lock();
        f(&mut state)
    }

    /// Reads a projection of the state without exposing the guard.
    pub fn inspect<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let state = self.lock();
        f(&state)
    }
}

impl<S: Default> Default for StateMachine<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[derive(Debug, PartialEq)]
    enum Lifecycle {
        Created,
        Started,
    }

    #[test]
    fn test_start_happens_exactly_once_under_contention() {
        let machine = Arc::new(StateMachine::new(Lifecycle::Created));
        let starts = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..16 {
            let machine = machine.clone();
            let starts = starts.clone();
            handles.push(thread::spawn(move || {
                machine.transition(|state| {
                    if *state == Lifecycle::Created {
                        *state = Lifecycle::Started;
                        starts.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(*machine.lock(), Lifecycle::Started);
    }

    #[test]
    fn test_inspect_does_not_change_state() {
        let machine = StateMachine::new(Lifecycle::Created);
        let is_created = machine.inspect(|state| *state == Lifecycle::Created);
        assert!(is_created);
        assert_eq!(*machine.lock(), Lifecycle::Created);
    }

    #[test]
    fn test_transition_returns_closure_result() {
        let machine = StateMachine::new(0u32);
        let previous = machine.transition(|value| {
            let previous = *value;
            *value += 5;
            previous
        });
        assert_eq!(previous, 0);
        assert_eq!(*machine.lock(), 5);
    }
}
