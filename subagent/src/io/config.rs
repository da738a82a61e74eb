//! Engine configuration (TOML).

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::naming::is_valid_variable_name;
use crate::core::types::ResourceRequirements;
use crate::store::ledger::LedgerConfig;

/// Engine configuration.
///
/// Intended to be edited by humans. Missing fields default to the values in
/// [`EngineConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Period of the per-scope resource monitor tick.
    pub monitor_interval_ms: u64,

    /// Consecutive malformed model rounds tolerated before a scope errors out.
    pub max_parse_retries: u32,

    pub ledger: LedgerConfig,

    /// Named task presets used by the legacy task adapter.
    pub task_types: BTreeMap<String, TaskPreset>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 1000,
            max_parse_retries: 3,
            ledger: LedgerConfig::default(),
            task_types: BTreeMap::new(),
        }
    }
}

/// Defaults applied to a legacy task of a given type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskPreset {
    pub tool_permissions: Vec<String>,
    pub timeout_ms: Option<u64>,
    pub max_turns: Option<u32>,
    pub resource_limits: ResourceRequirements,
    /// Outputs the task must emit; becomes an OUTPUT condition.
    pub required_outputs: Vec<String>,
    /// Text placed before the caller's prompt.
    pub instructions: Option<String>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.monitor_interval_ms == 0 {
            errors.push("monitor_interval_ms must be > 0".to_string());
        }
        if self.ledger.max_concurrent_scopes == 0 {
            errors.push("ledger.max_concurrent_scopes must be > 0".to_string());
        }
        if self.ledger.max_total_memory_mb == 0 {
            errors.push("ledger.max_total_memory_mb must be > 0".to_string());
        }
        if self.ledger.max_total_cpu_time_ms == 0 {
            errors.push("ledger.max_total_cpu_time_ms must be > 0".to_string());
        }
        for (name, preset) in &self.task_types {
            if preset.timeout_ms == Some(0) {
                errors.push(format!("task_types.{name}.timeout_ms must be > 0"));
            }
            if preset.max_turns == Some(0) {
                errors.push(format!("task_types.{name}.max_turns must be > 0"));
            }
            for output in &preset.required_outputs {
                if !is_valid_variable_name(output) {
                    errors.push(format!(
                        "task_types.{name}.required_outputs has invalid name '{output}'"
                    ));
                }
            }
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(anyhow!("invalid engine config: {}", errors.join("; ")))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
