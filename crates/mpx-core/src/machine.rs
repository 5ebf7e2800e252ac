//! Administrative state machine gating every `ServerState` mutation.
//!
//! The machine mutates under its own lock and returns outcome values; it
//! never invokes callbacks while locked. Callers publish the resulting
//! events after this lock has been released.

use std::sync::Mutex;

use crate::error::ProxyError;
use crate::state::{ServerState, transition_allowed};

/// Global default for consecutive failures before auto-disable.
pub const DEFAULT_AUTO_DISABLE_THRESHOLD: u32 = 5;

/// A validated administrative transition that has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ServerState,
    pub to: ServerState,
}

/// What `record_connection_failure` decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Failure counted; threshold not yet reached.
    Counted { consecutive_failures: u32 },
    /// The threshold was reached on this very failure; the machine moved to
    /// `auto_disabled`.
    AutoDisabled {
        transition: Transition,
        consecutive_failures: u32,
        threshold: u32,
        reason: String,
    },
    /// Current state does not count failures (not active/lazy_loading).
    Ignored,
}

struct MachineInner {
    state: ServerState,
    consecutive_failures: u32,
    auto_disable_reason: Option<String>,
}

/// Per-server administrative state with transition validation.
pub struct ServerStateMachine {
    inner: Mutex<MachineInner>,
}

impl ServerStateMachine {
    pub fn new(initial: ServerState) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                state: initial,
                consecutive_failures: 0,
                auto_disable_reason: None,
            }),
        }
    }

    /// Restores a persisted auto-disabled server, carrying its reason.
    pub fn restore_auto_disabled(reason: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                state: ServerState::AutoDisabled,
                consecutive_failures: 0,
                auto_disable_reason: Some(reason.into()),
            }),
        }
    }

    pub fn state(&self) -> ServerState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn auto_disable_reason(&self) -> Option<String> {
        self.lock().auto_disable_reason.clone()
    }

    /// Applies an administrative transition after validating it against the
    /// declared table.
    ///
    /// Leaving `auto_disabled` clears the stored reason; any move into
    /// `active` resets the failure streak.
    pub fn transition(&self, to: ServerState) -> Result<Transition, ProxyError> {
        let mut inner = self.lock();
        let from = inner.state;
        if !transition_allowed(from, to) {
            return Err(ProxyError::InvalidTransition { from, to });
        }

        if from == ServerState::AutoDisabled {
            inner.auto_disable_reason = None;
            inner.consecutive_failures = 0;
        }
        if to == ServerState::Active {
            inner.consecutive_failures = 0;
        }
        inner.state = to;
        Ok(Transition { from, to })
    }

    /// Counts one connection failure, auto-disabling when the streak reaches
    /// `threshold`.
    ///
    /// Only meaningful while the server is `active` or `lazy_loading`; in
    /// every other state this is a no-op.
    pub fn record_connection_failure(&self, threshold: u32) -> FailureOutcome {
        let mut inner = self.lock();
        if !inner.state.is_connectable() {
            return FailureOutcome::Ignored;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let consecutive_failures = inner.consecutive_failures;
        if threshold == 0 || consecutive_failures < threshold {
            return FailureOutcome::Counted {
                consecutive_failures,
            };
        }

        let reason = format!(
            "automatically disabled after {consecutive_failures} consecutive failures"
        );
        let transition = Transition {
            from: inner.state,
            to: ServerState::AutoDisabled,
        };
        inner.state = ServerState::AutoDisabled;
        inner.auto_disable_reason = Some(reason.clone());
        FailureOutcome::AutoDisabled {
            transition,
            consecutive_failures,
            threshold,
            reason,
        }
    }

    /// Resets the failure streak after a successful `Ready` transition.
    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    /// Reverts an auto-disable whose persistence failed, restoring the
    /// pre-transition state. The failure streak stays as counted.
    pub fn rollback_auto_disable(&self, transition: &Transition) {
        let mut inner = self.lock();
        if inner.state == ServerState::AutoDisabled {
            inner.state = transition.from;
            inner.auto_disable_reason = None;
        }
    }

    /// Reinstates the stored reason after a rolled-back attempt to leave
    /// `auto_disabled`. No-op in any other state.
    pub fn set_auto_disable_reason(&self, reason: impl Into<String>) {
        let mut inner = self.lock();
        if inner.state == ServerState::AutoDisabled {
            inner.auto_disable_reason = Some(reason.into());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MachineInner> {
        // Inner state is plain data; a poisoned lock only means another
        // thread panicked mid-update, and the data is still a valid enum.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
