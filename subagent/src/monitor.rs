//! Background monitoring tick for one scope.
//!
//! Each tick samples usage, records it in the ledger, logs violations and
//! checks the conditions that can be decided between turns (resource-driven
//! conditions and the wall-clock TIMEOUT). MAX_TURNS and turn-driven
//! conditions are left to the tool call loop. The tick never tears anything
//! down; a satisfied condition is handed to the evaluator as a termination
//! request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::budget::elapsed_ms;
use crate::core::conditions::ScopeSnapshot;
use crate::core::types::{ResourceUsage, UsageUpdate};
use crate::io::probe::UsageProbe;
use crate::scope::ScopeConfig;
use crate::store::context::ContextStore;
use crate::store::ledger::ResourceLedger;
use crate::termination::{ScopeSignal, TerminationEvaluator};

/// Everything a monitor task reads.
#[derive(Clone)]
pub struct MonitorDeps {
    pub config: Arc<ScopeConfig>,
    pub signal: Arc<ScopeSignal>,
    pub contexts: Arc<ContextStore>,
    pub ledger: Arc<ResourceLedger>,
    pub evaluator: Arc<TerminationEvaluator>,
    pub probe: Arc<dyn UsageProbe>,
    pub started_at: Instant,
}

/// Handle to a running monitor. Stop it before tearing the scope down.
#[derive(Debug)]
pub struct MonitorHandle {
    scope_id: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the tick and wait for the task to finish.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(err) = self.task.await
            && !err.is_cancelled()
        {
            warn!(scope_id = %self.scope_id, error = %err, "monitor task failed");
        }
        debug!(scope_id = %self.scope_id, "monitor stopped");
    }

    /// Synchronous teardown for drop paths that cannot await.
    pub fn abort(self) {
        self.stop.cancel();
        self.task.abort();
    }
}

pub fn spawn_monitor(deps: MonitorDeps, interval: Duration) -> MonitorHandle {
    let scope_id = deps.signal.scope_id().to_string();
    let stop = CancellationToken::new();
    let task = tokio::spawn(run(deps, interval, stop.clone()));
    MonitorHandle {
        scope_id,
        stop,
        task,
    }
}

async fn run(deps: MonitorDeps, interval: Duration, stop: CancellationToken) {
    let baseline = deps.probe.sample();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => tick(&deps, &baseline),
        }
    }
}

/// One monitoring pass. CPU time is attributed as the delta since the monitor started.
pub fn tick(deps: &MonitorDeps, baseline: &ResourceUsage) {
    let scope_id = deps.signal.scope_id();
    let mut usage = deps.probe.sample();
    usage.cpu_time_ms = usage.cpu_time_ms.saturating_sub(baseline.cpu_time_ms);

    let check = deps.ledger.update_usage(scope_id, &UsageUpdate::from(usage));
    if let Some(check) = &check {
        for violation in &check.violations {
            warn!(
                scope_id,
                resource = ?violation.kind,
                current = violation.current,
                limit = violation.limit,
                severity = ?violation.severity,
                "resource limit exceeded"
            );
        }
    }

    if deps.signal.is_cancelled() {
        return;
    }
    let snapshot = ScopeSnapshot {
        scope_id: scope_id.to_string(),
        turns_executed: deps.signal.turns(),
        elapsed_ms: elapsed_ms(deps.started_at),
        variables: deps.contexts.get_all_variables(scope_id).unwrap_or_default(),
        emitted: deps.signal.emitted(),
        resources: check,
    };
    let evaluation = deps.evaluator.check_background(
        &deps.config.constraints.termination_conditions,
        &deps.config.budget(),
        &snapshot,
    );
    if let Some(reason) = evaluation.reason {
        debug!(scope_id, reason = reason.code(), "monitor tick met a termination condition");
        deps.evaluator.request_termination(scope_id, reason);
    }
}
