//! Scope configuration, live scope state, and the structured result.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::core::budget::elapsed_ms;
use crate::core::conditions::{TerminationCondition, TurnBudget};
use crate::core::naming::is_valid_variable_name;
use crate::core::types::{ResourceRequirements, ResourceUsage, ScopeStatus, TerminationReason};
use crate::error::EngineError;
use crate::store::context::{ContextState, ContextStats};
use crate::store::ledger::{AllocationStats, ReleaseReport};

pub const DEFAULT_TIMEOUT_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MAX_TURNS: u32 = 20;

/// Execution constraints for one scope.
#[derive(Debug, Clone)]
pub struct ExecutionConstraints {
    /// Wall-clock budget measured from scope start.
    pub timeout_ms: u64,
    pub max_turns: u32,
    pub resource_limits: ResourceRequirements,
    /// Explicit conditions, evaluated in declaration order.
    pub termination_conditions: Vec<TerminationCondition>,
}

impl Default for ExecutionConstraints {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_turns: DEFAULT_MAX_TURNS,
            resource_limits: ResourceRequirements::default(),
            termination_conditions: Vec::new(),
        }
    }
}

/// Immutable input describing a delegated subtask.
#[derive(Debug, Clone)]
pub struct ScopeConfig {
    /// Task prompt; may contain `{{name}}` placeholders.
    pub prompt: String,
    /// Tool names the scope may invoke.
    pub tool_permissions: Vec<String>,
    pub constraints: ExecutionConstraints,
}

impl ScopeConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            tool_permissions: Vec::new(),
            constraints: ExecutionConstraints::default(),
        }
    }

    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_permissions = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.constraints.max_turns = max_turns;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.constraints.timeout_ms = timeout_ms;
        self
    }

    pub fn with_resource_limits(mut self, limits: ResourceRequirements) -> Self {
        self.constraints.resource_limits = limits;
        self
    }

    pub fn with_condition(mut self, condition: TerminationCondition) -> Self {
        self.constraints.termination_conditions.push(condition);
        self
    }

    /// Check the config before anything is allocated.
    ///
    /// All problems are reported together in one `Configuration` error.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut errors = Vec::new();
        if self.prompt.trim().is_empty() {
            errors.push("prompt must be non-empty".to_string());
        }
        if self.constraints.timeout_ms == 0 {
            errors.push("constraints.timeout_ms must be > 0".to_string());
        }
        if self.constraints.max_turns == 0 {
            errors.push("constraints.max_turns must be > 0".to_string());
        }
        let mut seen = HashSet::new();
        for tool in &self.tool_permissions {
            if tool.trim().is_empty() {
                errors.push("tool_permissions entries must be non-empty".to_string());
            } else if !seen.insert(tool.as_str()) {
                errors.push(format!("duplicate tool permission '{tool}'"));
            }
        }
        for condition in &self.constraints.termination_conditions {
            if let TerminationCondition::Output { required } = condition
                && required.is_empty()
            {
                errors.push("output condition must name at least one variable".to_string());
            }
            for name in condition.referenced_names() {
                if !is_valid_variable_name(name) {
                    errors.push(format!(
                        "{} references invalid variable name '{name}'",
                        condition.label()
                    ));
                }
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(EngineError::Configuration(errors.join("; ")))
    }

    pub fn budget(&self) -> TurnBudget {
        TurnBudget {
            max_turns: self.constraints.max_turns,
            timeout_ms: self.constraints.timeout_ms,
        }
    }

    pub fn permits(&self, tool: &str) -> bool {
        self.tool_permissions.iter().any(|t| t == tool)
    }

    pub fn has_explicit_conditions(&self) -> bool {
        !self.constraints.termination_conditions.is_empty()
    }

    /// Output names required by OUTPUT conditions, deduplicated in declaration order.
    pub fn required_outputs(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for condition in &self.constraints.termination_conditions {
            if let TerminationCondition::Output { required } = condition {
                for name in required {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
        }
        names
    }
}

/// One live execution of a [`ScopeConfig`].
///
/// Written only by its own executor.
#[derive(Debug)]
pub struct Scope {
    pub id: String,
    pub config: Arc<ScopeConfig>,
    status: ScopeStatus,
    pub started_at: Instant,
    pub started_at_utc: DateTime<Utc>,
    pub turns: u32,
    pub last_usage: Option<ResourceUsage>,
}

impl Scope {
    pub fn new(config: Arc<ScopeConfig>) -> Self {
        Self {
            id: format!("scope-{}", Uuid::new_v4()),
            config,
            status: ScopeStatus::Initialized,
            started_at: Instant::now(),
            started_at_utc: Utc::now(),
            turns: 0,
            last_usage: None,
        }
    }

    pub fn status(&self) -> ScopeStatus {
        self.status
    }

    pub fn elapsed_ms(&self) -> u64 {
        elapsed_ms(self.started_at)
    }

    /// Move from `Initialized` to `Executing`.
    pub fn begin(&mut self) {
        if self.status != ScopeStatus::Initialized {
            warn!(scope_id = %self.id, status = %self.status, "scope already started");
            return;
        }
        self.status = ScopeStatus::Executing;
    }

    /// Enter a terminal status. Returns false if the scope was already terminal.
    pub fn finish(&mut self, status: ScopeStatus) -> bool {
        if self.status.is_terminal() {
            warn!(
                scope_id = %self.id,
                current = %self.status,
                requested = %status,
                "ignoring transition out of terminal status"
            );
            return false;
        }
        self.status = status;
        true
    }
}

/// Terminal summary of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationInfo {
    pub reason: TerminationReason,
    pub status: ScopeStatus,
    pub execution_duration_ms: u64,
    pub turns_executed: u32,
}

/// Counters collected by the tool call loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TerminationStats {
    /// Correction retries issued after malformed model output.
    pub retry_count: u32,
    pub model_rounds: u32,
    pub tool_calls: u32,
    pub tool_errors: u32,
    /// Condition predicates that errored or panicked.
    pub predicate_failures: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionMetadata {
    pub resources: Option<AllocationStats>,
    pub release: Option<ReleaseReport>,
    pub context: Option<ContextStats>,
    pub termination: TerminationStats,
    pub error: Option<String>,
}

/// Structured output of a scope run. Always produced, whatever the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct SubAgentResult {
    /// `None` when the run failed before a scope id was assigned.
    pub scope_id: Option<String>,
    pub emitted: IndexMap<String, Value>,
    pub termination: TerminationInfo,
    pub metadata: ExecutionMetadata,
    pub final_context: Option<ContextState>,
}

impl SubAgentResult {
    /// Result for a run that failed before the tool call loop produced an outcome.
    pub fn failed(
        scope_id: Option<String>,
        started_at: Instant,
        turns_executed: u32,
        err: &EngineError,
    ) -> Self {
        let message = err.to_string();
        Self {
            scope_id,
            emitted: IndexMap::new(),
            termination: TerminationInfo {
                reason: TerminationReason::Error {
                    message: message.clone(),
                },
                status: ScopeStatus::Error,
                execution_duration_ms: elapsed_ms(started_at),
                turns_executed,
            },
            metadata: ExecutionMetadata {
                error: Some(message),
                ..ExecutionMetadata::default()
            },
            final_context: None,
        }
    }

    pub fn status(&self) -> ScopeStatus {
        self.termination.status
    }

    pub fn is_success(&self) -> bool {
        self.termination.status == ScopeStatus::Success
    }
}
