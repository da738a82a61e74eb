//! Adapter for callers that still speak "task type + prompt + context".
//!
//! A legacy request is turned into a [`ScopeConfig`] using the engine's
//! `[task_types.<name>]` presets, and a [`SubAgentResult`] is flattened back
//! into the legacy result shape.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::conditions::TerminationCondition;
use crate::core::types::ScopeStatus;
use crate::error::EngineError;
use crate::io::config::EngineConfig;
use crate::orchestrator::ScopeOrchestrator;
use crate::scope::{ScopeConfig, SubAgentResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyTaskRequest {
    pub task_type: String,
    pub prompt: String,
    #[serde(default)]
    pub context: IndexMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyMetadata {
    pub scope_id: Option<String>,
    pub status: ScopeStatus,
    /// Termination reason code, e.g. `OUTPUT` or `MAX_TURNS`.
    pub reason: String,
    pub turns: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyTaskResult {
    pub success: bool,
    /// Emitted variables.
    pub output: IndexMap<String, Value>,
    pub error: Option<String>,
    pub metadata: LegacyMetadata,
}

impl LegacyTaskRequest {
    /// Build the scope config for this request from the named preset.
    pub fn to_scope_config(&self, config: &EngineConfig) -> Result<ScopeConfig, EngineError> {
        let preset = config.task_types.get(&self.task_type).ok_or_else(|| {
            EngineError::Configuration(format!("unknown task type '{}'", self.task_type))
        })?;

        let prompt = match preset.instructions.as_deref().map(str::trim) {
            Some(instructions) if !instructions.is_empty() => {
                format!("{instructions}\n\n{}", self.prompt)
            }
            _ => self.prompt.clone(),
        };
        let mut scope = ScopeConfig::new(prompt)
            .with_tools(preset.tool_permissions.iter().cloned())
            .with_resource_limits(preset.resource_limits);
        if let Some(timeout_ms) = preset.timeout_ms {
            scope = scope.with_timeout_ms(timeout_ms);
        }
        if let Some(max_turns) = preset.max_turns {
            scope = scope.with_max_turns(max_turns);
        }
        if !preset.required_outputs.is_empty() {
            scope = scope.with_condition(TerminationCondition::output(
                preset.required_outputs.iter().cloned(),
            ));
        }
        Ok(scope)
    }
}

impl From<&SubAgentResult> for LegacyTaskResult {
    fn from(result: &SubAgentResult) -> Self {
        let success = result.is_success();
        let error = if success {
            None
        } else {
            result
                .metadata
                .error
                .clone()
                .or_else(|| Some(format!("scope ended with status {}", result.status())))
        };
        LegacyTaskResult {
            success,
            output: result.emitted.clone(),
            error,
            metadata: LegacyMetadata {
                scope_id: result.scope_id.clone(),
                status: result.status(),
                reason: result.termination.reason.code().to_string(),
                turns: result.termination.turns_executed,
                duration_ms: result.termination.execution_duration_ms,
            },
        }
    }
}

/// Run a legacy request end to end.
///
/// An unknown task type is reported as a failed legacy result, never as a panic
/// or a transport-level error.
pub async fn run_legacy(orchestrator: &ScopeOrchestrator, request: LegacyTaskRequest) -> LegacyTaskResult {
    let result = match request.to_scope_config(orchestrator.config()) {
        Ok(scope) => orchestrator.run(scope, request.context).await,
        Err(err) => SubAgentResult::failed(None, std::time::Instant::now(), 0, &err),
    };
    LegacyTaskResult::from(&result)
}
