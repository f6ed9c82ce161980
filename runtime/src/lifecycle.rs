//! Lifecycle of the manager: `UNSTARTED → STARTED → STOPPING → STOPPED`.

use crate::error::ManagerError;
use std::fmt;
use std::sync::{PoisonError, RwLock};

/// A lifecycle stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifeCycleState {
    /// Created, not started.
    Unstarted,
    /// Running flows and accepting work.
    Started,
    /// Waiting for flows to shut down.
    Stopping,
    /// Done.
    Stopped,
}

impl LifeCycleState {
    const fn next(self) -> Option<Self> {
        match self {
            Self::Unstarted => Some(Self::Started),
            Self::Started => Some(Self::Stopping),
            Self::Stopping => Some(Self::Stopped),
            Self::Stopped => None,
        }
    }
}

impl fmt::Display for LifeCycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unstarted => "UNSTARTED",
            Self::Started => "STARTED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        })
    }
}

/// Guarded lifecycle state. Transitions are strictly linear.
#[derive(Debug)]
pub struct LifeCycle {
    state: RwLock<LifeCycleState>,
}

impl LifeCycle {
    /// Start in `UNSTARTED`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: RwLock::new(LifeCycleState::Unstarted),
        }
    }

    /// The current stage.
    pub fn state(&self) -> LifeCycleState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move from `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::WrongLifeCycle`] if the current stage is not
    /// `from`, or `to` is not the stage after it.
    pub fn transition(&self, from: LifeCycleState, to: LifeCycleState) -> Result<(), ManagerError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != from || from.next() != Some(to) {
            return Err(ManagerError::WrongLifeCycle {
                expected: from,
                actual: *state,
            });
        }
        *state = to;
        Ok(())
    }

    /// Fail unless the current stage is `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::WrongLifeCycle`] otherwise.
    pub fn require(&self, expected: LifeCycleState) -> Result<(), ManagerError> {
        self.require_state(expected, || ())
    }

    /// Run `f` while the stage is held at `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::WrongLifeCycle`] without running `f` if the
    /// stage is not `expected`.
    pub fn require_state<T>(
        &self,
        expected: LifeCycleState,
        f: impl FnOnce() -> T,
    ) -> Result<T, ManagerError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            return Err(ManagerError::WrongLifeCycle {
                expected,
                actual: *state,
            });
        }
        Ok(f())
    }

    /// Run `f` with the current stage, which cannot change until `f` returns.
    pub fn with_state<T>(&self, f: impl FnOnce(LifeCycleState) -> T) -> T {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(*state)
    }
}

impl Default for LifeCycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn stages_advance_in_order() {
        let lifecycle = LifeCycle::new();
        lifecycle
            .transition(LifeCycleState::Unstarted, LifeCycleState::Started)
            .unwrap();
        lifecycle
            .transition(LifeCycleState::Started, LifeCycleState::Stopping)
            .unwrap();
        lifecycle
            .transition(LifeCycleState::Stopping, LifeCycleState::Stopped)
            .unwrap();
        assert_eq!(lifecycle.state(), LifeCycleState::Stopped);
    }

    #[test]
    fn stages_cannot_be_skipped_or_repeated() {
        let lifecycle = LifeCycle::new();
        assert!(
            lifecycle
                .transition(LifeCycleState::Unstarted, LifeCycleState::Stopped)
                .is_err()
        );
        lifecycle
            .transition(LifeCycleState::Unstarted, LifeCycleState::Started)
            .unwrap();
        assert!(matches!(
            lifecycle.transition(LifeCycleState::Unstarted, LifeCycleState::Started),
            Err(ManagerError::WrongLifeCycle {
                actual: LifeCycleState::Started,
                ..
            })
        ));
    }

    #[test]
    fn require_state_only_runs_in_the_expected_stage() {
        let lifecycle = LifeCycle::new();
        assert!(lifecycle.require_state(LifeCycleState::Started, || 1).is_err());
        lifecycle
            .transition(LifeCycleState::Unstarted, LifeCycleState::Started)
            .unwrap();
        assert_eq!(lifecycle.require_state(LifeCycleState::Started, || 1).unwrap(), 1);
    }

    #[test]
    fn stage_holds_while_inspected() {
        let lifecycle = Arc::new(LifeCycle::new());
        let moved = Arc::new(AtomicBool::new(false));

        let (seen, moved_meanwhile, mover) = lifecycle.with_state(|stage| {
            let other = Arc::clone(&lifecycle);
            let flag = Arc::clone(&moved);
            let mover = std::thread::spawn(move || {
                other
                    .transition(LifeCycleState::Unstarted, LifeCycleState::Started)
                    .unwrap();
                flag.store(true, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(50));
            (stage, moved.load(Ordering::SeqCst), mover)
        });

        assert_eq!(seen, LifeCycleState::Unstarted);
        assert!(!moved_meanwhile);
        mover.join().unwrap();
        assert_eq!(lifecycle.state(), LifeCycleState::Started);
    }
}
