//! Scope definitions on disk: schema check, then semantic validation.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use indexmap::IndexMap;
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::conditions::{TerminationCondition, VariableCheck};
use crate::core::types::ResourceRequirements;
use crate::scope::{DEFAULT_MAX_TURNS, DEFAULT_TIMEOUT_MS, ExecutionConstraints, ScopeConfig};

const SCOPE_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/scope_config.schema.json"
));

/// Declarative termination condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionSpec {
    Output {
        required: Vec<String>,
    },
    /// Without `equals`, the variable must be present and truthy.
    Variable {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        equals: Option<Value>,
    },
    ResourceViolation,
}

impl ConditionSpec {
    pub fn to_condition(&self) -> TerminationCondition {
        match self {
            ConditionSpec::Output { required } => TerminationCondition::output(required.clone()),
            ConditionSpec::Variable { name, equals } => {
                let check = match equals {
                    Some(expected) => VariableCheck::Equals(expected.clone()),
                    None => VariableCheck::Truthy,
                };
                TerminationCondition::variable(name.clone(), check)
            }
            ConditionSpec::ResourceViolation => TerminationCondition::on_resource_violation(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConstraintsFile {
    pub timeout_ms: Option<u64>,
    pub max_turns: Option<u32>,
    pub resource_limits: ResourceRequirements,
    pub termination_conditions: Vec<ConditionSpec>,
}

/// A scope config file plus the variables to start it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeFile {
    pub prompt: String,
    pub tool_permissions: Vec<String>,
    pub constraints: ConstraintsFile,
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
}

impl ScopeFile {
    pub fn to_config(&self) -> ScopeConfig {
        ScopeConfig {
            prompt: self.prompt.clone(),
            tool_permissions: self.tool_permissions.clone(),
            constraints: ExecutionConstraints {
                timeout_ms: self.constraints.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
                max_turns: self.constraints.max_turns.unwrap_or(DEFAULT_MAX_TURNS),
                resource_limits: self.constraints.resource_limits,
                termination_conditions: self
                    .constraints
                    .termination_conditions
                    .iter()
                    .map(ConditionSpec::to_condition)
                    .collect(),
            },
        }
    }
}

/// Load and validate a scope file (schema + semantic checks).
pub fn load_scope_file(path: &Path) -> Result<ScopeFile> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate {}", path.display()))?;
    let file: ScopeFile = serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", path.display()))?;
    file.to_config()
        .validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(file)
}

fn validate_schema(document: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(SCOPE_SCHEMA).context("parse scope schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(document) {
        let messages = compiled
            .iter_errors(document)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "scope schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
