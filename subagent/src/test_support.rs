//! Test-only collaborators: scripted model, canned tools, fixed usage probe.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::core::types::ResourceUsage;
use crate::io::config::EngineConfig;
use crate::io::model::{GenerateOptions, Message, ModelClient, ModelResponse, ToolCall};
use crate::io::probe::UsageProbe;
use crate::io::tools::{EMIT_VARIABLE_TOOL, ToolOutput, ToolRegistry, ToolSchema};

static CALL_IDS: AtomicU64 = AtomicU64::new(1);

fn next_call_id() -> String {
    format!("call-{}", CALL_IDS.fetch_add(1, Ordering::Relaxed))
}

/// Tool call with a fresh id.
pub fn tool_call(name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(next_call_id(), name, arguments)
}

/// `emit_variable` call for `name = value`.
pub fn emit_call(name: &str, value: Value) -> ToolCall {
    tool_call(EMIT_VARIABLE_TOOL, json!({"name": name, "value": value}))
}

#[derive(Debug, Clone)]
enum Step {
    Respond(ModelResponse),
    Fail(String),
}

/// Model that answers from a queued script.
///
/// After the queue runs dry it repeats the `repeat` step if one was set, and
/// otherwise returns an error.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    script: Mutex<VecDeque<Step>>,
    fallback: Option<Step>,
    delay: Option<Duration>,
    calls: AtomicU32,
    histories: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, response: ModelResponse) -> Self {
        self.push(Step::Respond(response))
    }

    /// Queue a transport-level failure.
    pub fn fail(self, message: &str) -> Self {
        self.push(Step::Fail(message.to_string()))
    }

    pub fn repeat(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(Step::Respond(response));
        self
    }

    /// Sleep before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push(self, step: Step) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(step);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// History passed to each call, in call order.
    pub fn histories(&self) -> Vec<Vec<Message>> {
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn assert_drained(&self) {
        let left = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        assert_eq!(left, 0, "scripted model has {left} unused responses");
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn generate_response(
        &self,
        history: &[Message],
        _options: GenerateOptions<'_>,
    ) -> Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(history.to_vec());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .or_else(|| self.fallback.clone());
        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted model has no more responses")),
        }
    }
}

/// Tool registry with canned outputs and a call log.
#[derive(Debug, Default)]
pub struct ScriptedTools {
    outputs: HashMap<String, ToolOutput>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(mut self, name: &str, content: &str) -> Self {
        self.outputs
            .insert(name.to_string(), ToolOutput::ok(content));
        self
    }

    pub fn with_failing_tool(mut self, name: &str, content: &str) -> Self {
        self.outputs
            .insert(name.to_string(), ToolOutput::error(content));
        self
    }

    /// Sleep inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ToolRegistry for ScriptedTools {
    fn tool_schemas(&self) -> Vec<ToolSchema> {
        let mut names: Vec<&String> = self.outputs.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| ToolSchema::new(name.clone(), format!("scripted {name}")))
            .collect()
    }

    async fn invoke(&self, name: &str, arguments: &Value) -> Result<ToolOutput> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), arguments.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown tool '{name}'"))
    }
}

/// Probe returning whatever usage the test last set.
#[derive(Debug, Default)]
pub struct FixedUsageProbe {
    usage: Mutex<ResourceUsage>,
}

impl FixedUsageProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner) = usage;
    }
}

impl UsageProbe for FixedUsageProbe {
    fn sample(&self) -> ResourceUsage {
        *self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Engine config with a fast monitor tick for tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        monitor_interval_ms: 5,
        ..EngineConfig::default()
    }
}

/// Temporary directory for scope files, configs and replay fixtures.
pub struct TestDir {
    temp: tempfile::TempDir,
}

impl TestDir {
    pub fn new() -> Result<Self> {
        Ok(Self {
            temp: tempfile::tempdir().context("create tempdir")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn write(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.temp.path().join(name);
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}
