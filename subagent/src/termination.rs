//! Termination evaluation and per-scope stop signals.
//!
//! The evaluator decides; it never tears anything down. A decision reached
//! outside the tool call loop (monitor tick, caller cancellation) is parked on
//! the scope's [`ScopeSignal`] as a pending reason and the scope token is
//! cancelled, so the loop adopts the reason at its next checkpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::conditions::{
    Evaluation, ScopeSnapshot, TerminationCondition, TurnBudget, evaluate, evaluate_background,
};
use crate::core::types::TerminationReason;

/// Reason adopted when the caller's token is cancelled without a recorded reason.
pub const CALLER_CANCELLED: &str = "cancelled by caller";

/// Shared stop state for one live scope.
#[derive(Debug)]
pub struct ScopeSignal {
    scope_id: String,
    token: CancellationToken,
    pending: Mutex<Option<TerminationReason>>,
    turns: AtomicU32,
    emitted: Mutex<Vec<String>>,
}

impl ScopeSignal {
    /// The scope token is a child of `parent`, so cancelling the caller's token
    /// cancels the scope but not the other way round.
    pub fn new(scope_id: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            scope_id: scope_id.into(),
            token: parent.child_token(),
            pending: Mutex::new(None),
            turns: AtomicU32::new(0),
            emitted: Mutex::new(Vec::new()),
        }
    }

    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn pending_slot(&self) -> MutexGuard<'_, Option<TerminationReason>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park `reason` and cancel the token. The first reason wins; returns
    /// false if one was already pending.
    pub fn request(&self, reason: TerminationReason) -> bool {
        let mut slot = self.pending_slot();
        let accepted = slot.is_none();
        if accepted {
            debug!(scope_id = %self.scope_id, reason = reason.code(), "termination requested");
            *slot = Some(reason);
        }
        drop(slot);
        self.token.cancel();
        accepted
    }

    pub fn pending(&self) -> Option<TerminationReason> {
        self.pending_slot().clone()
    }

    /// Reason to stop with if the token has been cancelled.
    pub fn stop_reason(&self) -> Option<TerminationReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        Some(self.pending().unwrap_or_else(|| TerminationReason::Cancelled {
            reason: CALLER_CANCELLED.to_string(),
        }))
    }

    pub fn set_turns(&self, turns: u32) {
        self.turns.store(turns, Ordering::SeqCst);
    }

    pub fn turns(&self) -> u32 {
        self.turns.load(Ordering::SeqCst)
    }

    pub fn mark_emitted(&self, name: &str) {
        let mut emitted = self.emitted.lock().unwrap_or_else(PoisonError::into_inner);
        if !emitted.iter().any(|n| n == name) {
            emitted.push(name.to_string());
        }
    }

    pub fn emitted(&self) -> Vec<String> {
        self.emitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Evaluates stopping conditions and routes forced terminations.
#[derive(Debug, Default)]
pub struct TerminationEvaluator {
    signals: Mutex<HashMap<String, Arc<ScopeSignal>>>,
}

impl TerminationEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<ScopeSignal>>> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, scope_id: &str, parent: &CancellationToken) -> Arc<ScopeSignal> {
        let signal = Arc::new(ScopeSignal::new(scope_id, parent));
        self.lock().insert(scope_id.to_string(), Arc::clone(&signal));
        signal
    }

    pub fn unregister(&self, scope_id: &str) -> bool {
        self.lock().remove(scope_id).is_some()
    }

    pub fn signal(&self, scope_id: &str) -> Option<Arc<ScopeSignal>> {
        self.lock().get(scope_id).cloned()
    }

    /// Evaluate `conditions` in fixed precedence and log predicates that failed.
    pub fn check(
        &self,
        conditions: &[TerminationCondition],
        budget: &TurnBudget,
        snapshot: &ScopeSnapshot,
    ) -> Evaluation {
        log_failures(snapshot, evaluate(conditions, budget, snapshot))
    }

    /// Evaluate what may end a scope between turns: resource-driven
    /// conditions and the wall-clock TIMEOUT. Used by the monitor tick.
    pub fn check_background(
        &self,
        conditions: &[TerminationCondition],
        budget: &TurnBudget,
        snapshot: &ScopeSnapshot,
    ) -> Evaluation {
        log_failures(snapshot, evaluate_background(conditions, budget, snapshot))
    }

    /// Record `reason` as the scope's pending result and cancel it.
    pub fn request_termination(&self, scope_id: &str, reason: TerminationReason) -> bool {
        let Some(signal) = self.signal(scope_id) else {
            warn!(scope_id, "termination requested for unknown scope");
            return false;
        };
        signal.request(reason)
    }

    /// Stop a scope without evaluating conditions; it ends as INTERRUPTED.
    pub fn force_termination(&self, scope_id: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        info!(scope_id, %reason, "forcing termination");
        self.request_termination(scope_id, TerminationReason::Cancelled { reason })
    }
}

fn log_failures(snapshot: &ScopeSnapshot, evaluation: Evaluation) -> Evaluation {
    for failure in &evaluation.failures {
        warn!(
            scope_id = %snapshot.scope_id,
            condition = %failure.condition,
            error = %failure.message,
            "termination predicate failed; treating as not met"
        );
    }
    evaluation
}
