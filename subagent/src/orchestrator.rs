//! Scope lifecycle: setup, loop execution, result assembly and guaranteed cleanup.
//!
//! Every call returns a [`SubAgentResult`]. Failures before the loop finishes
//! (bad config, denied allocation, a panic inside the loop) become ERROR
//! results instead of propagating. Cleanup runs on every exit path: the normal
//! path awaits the monitor before releasing resources, and a drop guard covers
//! callers that abandon the run future.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::types::TerminationReason;
use crate::io::config::EngineConfig;
use crate::io::conversation::{ConversationSink, MemoryConversation};
use crate::io::model::ModelClient;
use crate::io::probe::{ProcessUsageProbe, UsageProbe};
use crate::io::prompt::PromptEngine;
use crate::io::tools::ToolRegistry;
use crate::monitor::{MonitorDeps, MonitorHandle, spawn_monitor};
use crate::scope::{ExecutionMetadata, Scope, ScopeConfig, SubAgentResult, TerminationInfo};
use crate::store::context::ContextStore;
use crate::store::ledger::{ReleaseReport, ResourceLedger};
use crate::termination::TerminationEvaluator;
use crate::tool_loop::{LoopOutcome, ToolCallLoop};

/// Registry entry for a scope that is currently executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveScope {
    pub scope_id: String,
    pub parent: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Where a new scope's variables come from.
enum Seed {
    Variables(IndexMap<String, Value>),
    /// Deep copy of (a subset of) a live scope's context.
    Parent {
        scope_id: String,
        subset: Option<Vec<String>>,
    },
}

pub struct ScopeOrchestrator {
    config: EngineConfig,
    contexts: Arc<ContextStore>,
    ledger: Arc<ResourceLedger>,
    evaluator: Arc<TerminationEvaluator>,
    model: Arc<dyn ModelClient>,
    tools: Arc<dyn ToolRegistry>,
    probe: Arc<dyn UsageProbe>,
    prompts: PromptEngine,
    active: Mutex<HashMap<String, ActiveScope>>,
}

impl ScopeOrchestrator {
    pub fn new(config: EngineConfig, model: Arc<dyn ModelClient>, tools: Arc<dyn ToolRegistry>) -> Self {
        let ledger = Arc::new(ResourceLedger::new(config.ledger.clone()));
        Self {
            config,
            contexts: Arc::new(ContextStore::new()),
            ledger,
            evaluator: Arc::new(TerminationEvaluator::new()),
            model,
            tools,
            probe: Arc::new(ProcessUsageProbe),
            prompts: PromptEngine::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn UsageProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Share a ledger between orchestrators so they admit against the same ceilings.
    pub fn with_ledger(mut self, ledger: Arc<ResourceLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn contexts(&self) -> &Arc<ContextStore> {
        &self.contexts
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn evaluator(&self) -> &Arc<TerminationEvaluator> {
        &self.evaluator
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, ActiveScope>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently executing scopes, oldest first.
    pub fn active_scopes(&self) -> Vec<ActiveScope> {
        let mut scopes: Vec<ActiveScope> = self.active().values().cloned().collect();
        scopes.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.scope_id.cmp(&b.scope_id)));
        scopes
    }

    /// Ask a running scope to stop. It ends as INTERRUPTED at its next checkpoint.
    pub fn cancel(&self, scope_id: &str, reason: &str) -> bool {
        self.evaluator.force_termination(scope_id, reason)
    }

    pub async fn run(&self, config: ScopeConfig, variables: IndexMap<String, Value>) -> SubAgentResult {
        self.run_with_cancel(config, variables, CancellationToken::new())
            .await
    }

    /// Run with a caller-owned token; cancelling it interrupts the scope.
    pub async fn run_with_cancel(
        &self,
        config: ScopeConfig,
        variables: IndexMap<String, Value>,
        cancel: CancellationToken,
    ) -> SubAgentResult {
        self.execute(config, Seed::Variables(variables), None, cancel)
            .await
    }

    /// Run a child scope seeded with deep copies of a live parent's variables.
    ///
    /// `subset` limits which parent variables are copied. Nothing the child
    /// does is visible in the parent's context.
    pub async fn run_child(
        &self,
        parent_scope_id: &str,
        config: ScopeConfig,
        subset: Option<Vec<String>>,
        cancel: CancellationToken,
    ) -> SubAgentResult {
        let seed = Seed::Parent {
            scope_id: parent_scope_id.to_string(),
            subset,
        };
        self.execute(config, seed, Some(parent_scope_id.to_string()), cancel)
            .await
    }

    #[instrument(skip_all, fields(parent = parent.as_deref().unwrap_or("-")))]
    async fn execute(
        &self,
        config: ScopeConfig,
        seed: Seed,
        parent: Option<String>,
        cancel: CancellationToken,
    ) -> SubAgentResult {
        let started = Instant::now();
        if let Err(err) = config.validate() {
            error!(error = %err, "rejecting scope config");
            return SubAgentResult::failed(None, started, 0, &err);
        }

        let config = Arc::new(config);
        let mut scope = Scope::new(Arc::clone(&config));
        let scope_id = scope.id.clone();

        let seeded = match seed {
            Seed::Variables(variables) => self.contexts.create_context(&scope_id, variables),
            Seed::Parent { scope_id: parent_id, subset } => {
                self.contexts
                    .create_isolated_copy(&parent_id, &scope_id, subset.as_deref())
            }
        };
        if let Err(err) = seeded {
            error!(scope_id = %scope_id, error = %err, "failed to seed scope context");
            return SubAgentResult::failed(Some(scope_id), scope.started_at, 0, &err);
        }

        if let Err(err) = self
            .ledger
            .allocate(&scope_id, &config.constraints.resource_limits)
        {
            self.contexts.clear_context(&scope_id);
            error!(scope_id = %scope_id, error = %err, "scope refused by resource ledger");
            return SubAgentResult::failed(Some(scope_id), scope.started_at, 0, &err);
        }
        let mut guard = CleanupGuard::new(self, &scope_id);

        let signal = self.evaluator.register(&scope_id, &cancel);
        self.active().insert(
            scope_id.clone(),
            ActiveScope {
                scope_id: scope_id.clone(),
                parent,
                started_at: scope.started_at_utc,
            },
        );
        scope.begin();
        info!(scope_id = %scope_id, "scope started");

        guard.monitor = Some(spawn_monitor(
            MonitorDeps {
                config: Arc::clone(&config),
                signal: Arc::clone(&signal),
                contexts: Arc::clone(&self.contexts),
                ledger: Arc::clone(&self.ledger),
                evaluator: Arc::clone(&self.evaluator),
                probe: Arc::clone(&self.probe),
                started_at: scope.started_at,
            },
            Duration::from_millis(self.config.monitor_interval_ms),
        ));

        let conversation = MemoryConversation::new();
        let tool_loop = ToolCallLoop {
            model: self.model.as_ref(),
            tools: self.tools.as_ref(),
            conversation: &conversation,
            contexts: &self.contexts,
            ledger: &self.ledger,
            evaluator: &self.evaluator,
            prompts: &self.prompts,
            max_parse_retries: self.config.max_parse_retries,
        };
        let outcome = match AssertUnwindSafe(tool_loop.execute(&mut scope, &signal))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(payload) => panicked(&scope, payload.as_ref()),
        };
        let duration_ms = scope.elapsed_ms();
        debug!(scope_id = %scope_id, messages = conversation.messages().len(), "conversation closed");

        // Stop the monitor before reading final stats so no update races teardown.
        if let Some(monitor) = guard.monitor.take() {
            monitor.stop().await;
        }
        let resources = self.ledger.get_stats(&scope_id);
        scope.last_usage = resources.as_ref().map(|stats| stats.usage);
        let context = self.contexts.context_stats(&scope_id);
        let final_context = self.contexts.snapshot(&scope_id);
        let release = guard.finish().await;

        let status = outcome.reason.status();
        scope.finish(status);
        info!(
            scope_id = %scope_id,
            status = %status,
            reason = outcome.reason.code(),
            turns = outcome.turns,
            duration_ms,
            "scope finished"
        );
        SubAgentResult {
            scope_id: Some(scope_id),
            emitted: outcome.emitted,
            termination: TerminationInfo {
                reason: outcome.reason,
                status,
                execution_duration_ms: duration_ms,
                turns_executed: outcome.turns,
            },
            metadata: ExecutionMetadata {
                resources,
                release,
                context,
                termination: outcome.stats,
                error: outcome.error,
            },
            final_context,
        }
    }

    /// Release everything a scope holds. Safe to call more than once.
    fn teardown(&self, scope_id: &str) -> ReleaseReport {
        let report = self.ledger.release(scope_id);
        self.contexts.clear_context(scope_id);
        self.evaluator.unregister(scope_id);
        self.active().remove(scope_id);
        debug!(scope_id, "scope torn down");
        report
    }
}

fn panicked(scope: &Scope, payload: &(dyn std::any::Any + Send)) -> LoopOutcome {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let message = format!("scope execution panicked: {detail}");
    error!(scope_id = %scope.id, %message, "tool call loop panicked");
    LoopOutcome {
        reason: TerminationReason::Error {
            message: message.clone(),
        },
        turns: scope.turns,
        stats: crate::scope::TerminationStats::default(),
        emitted: IndexMap::new(),
        final_message: None,
        error: Some(message),
    }
}

/// Runs scope teardown exactly once, from `finish` or on drop.
struct CleanupGuard<'a> {
    orchestrator: &'a ScopeOrchestrator,
    scope_id: String,
    monitor: Option<MonitorHandle>,
    done: bool,
}

impl<'a> CleanupGuard<'a> {
    fn new(orchestrator: &'a ScopeOrchestrator, scope_id: &str) -> Self {
        Self {
            orchestrator,
            scope_id: scope_id.to_string(),
            monitor: None,
            done: false,
        }
    }

    async fn finish(&mut self) -> Option<ReleaseReport> {
        if self.done {
            return None;
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await;
        }
        self.done = true;
        Some(self.orchestrator.teardown(&self.scope_id))
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        warn!(scope_id = %self.scope_id, "scope abandoned before completion; cleaning up");
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        self.done = true;
        self.orchestrator.teardown(&self.scope_id);
    }
}
