//! Pipeline state with transition counting and observer broadcast.

use crate::pipeline::error::{ErrorReporter, invoke_guarded};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// High-level state of an [`AudioPipeline`](crate::pipeline::AudioPipeline).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PipelineState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Error,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Listening => "listening",
            PipelineState::Processing => "processing",
            PipelineState::Speaking => "speaking",
            PipelineState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Observer called with `(from, to)` after every transition.
pub type StateObserver = Arc<dyn Fn(PipelineState, PipelineState) + Send + Sync>;

/// Mutex-guarded state plus the observers that want to hear about changes.
pub(crate) struct StateMachine {
    state: Mutex<PipelineState>,
    transitions: AtomicU64,
    observers: Mutex<Vec<StateObserver>>,
    reporter: Arc<dyn ErrorReporter>,
}

impl StateMachine {
    pub(crate) fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self {
            state: Mutex::new(PipelineState::Idle),
            transitions: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
            reporter,
        }
    }

    pub(crate) fn get(&self) -> PipelineState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `to`. Returns false (and notifies nobody) if already there.
    pub(crate) fn transition(&self, to: PipelineState) -> bool {
        self.transition_if(to, |_| true)
    }

    /// Moves to `to` only if `guard(current)` returns true.
    ///
    /// `guard` runs under the state lock, so side effects it performs are
    /// atomic with the transition. It must not call back into the machine.
    pub(crate) fn transition_if(
        &self,
        to: PipelineState,
        guard: impl FnOnce(PipelineState) -> bool,
    ) -> bool {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let from = *state;
            if from == to || !guard(from) {
                return false;
            }
            *state = to;
            self.transitions.fetch_add(1, Ordering::Relaxed);
            from
        };

        tracing::debug!(%from, %to, "pipeline state transition");
        self.notify(from, to);
        true
    }

    fn notify(&self, from: PipelineState, to: PipelineState) {
        // Snapshot so observers may register further observers or transition again.
        let observers: Vec<StateObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            invoke_guarded(self.reporter.as_ref(), "state-observer", || observer(from, to));
        }
    }

    pub(crate) fn add_observer(&self, observer: StateObserver) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::log_reporter;

    fn machine() -> StateMachine {
        StateMachine::new(log_reporter())
    }

    #[test]
    fn test_starts_idle() {
        let sm = machine();
        assert_eq!(sm.get(), PipelineState::Idle);
        assert_eq!(sm.transition_count(), 0);
    }

    #[test]
    fn test_transition_counts_and_notifies() {
        let sm = machine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        sm.add_observer(Arc::new(move |from, to| {
            sink.lock().unwrap().push((from, to));
        }));

        assert!(sm.transition(PipelineState::Listening));
        assert!(sm.transition(PipelineState::Speaking));
        assert_eq!(sm.transition_count(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (PipelineState::Idle, PipelineState::Listening),
                (PipelineState::Listening, PipelineState::Speaking),
            ]
        );
    }

    #[test]
    fn test_same_state_is_noop() {
        let sm = machine();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        sm.add_observer(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(!sm.transition(PipelineState::Idle));
        assert_eq!(sm.transition_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_guard_blocks_transition() {
        let sm = machine();
        assert!(!sm.transition_if(PipelineState::Listening, |s| s == PipelineState::Speaking));
        assert_eq!(sm.get(), PipelineState::Idle);
    }

    #[test]
    fn test_panicking_observer_does_not_stop_others() {
        let sm = machine();
        let calls = Arc::new(AtomicU64::new(0));

        sm.add_observer(Arc::new(|_, _| panic!("observer failure")));
        let counter = Arc::clone(&calls);
        sm.add_observer(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(sm.transition(PipelineState::Listening));
        assert!(sm.transition(PipelineState::Processing));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(sm.get(), PipelineState::Processing);
    }

    #[test]
    fn test_observer_may_read_state() {
        let sm = Arc::new(machine());
        let observed = Arc::new(Mutex::new(None));

        let sm_ref = Arc::downgrade(&sm);
        let slot = Arc::clone(&observed);
        sm.add_observer(Arc::new(move |_, _| {
            if let Some(sm) = sm_ref.upgrade() {
                *slot.lock().unwrap() = Some(sm.get());
            }
        }));

        sm.transition(PipelineState::Speaking);
        assert_eq!(*observed.lock().unwrap(), Some(PipelineState::Speaking));
    }
}
