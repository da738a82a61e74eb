//! Recorded model transcripts and canned tool results for dry runs.
//!
//! Fixture format (JSON):
//!
//! ```json
//! {
//!   "responses": [{"tool_calls": [{"id": "1", "name": "read_file", "arguments": {}}]},
//!                 {"content": "done"}],
//!   "tools": [{"name": "read_file", "results": [{"content": "hello"}]}]
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::io::model::{GenerateOptions, Message, ModelClient, ModelResponse};
use crate::io::tools::{ToolOutput, ToolRegistry, ToolSchema};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayFixture {
    pub responses: Vec<ModelResponse>,
    #[serde(default)]
    pub tools: Vec<ReplayTool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayTool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Returned in order; the last one repeats once the queue runs dry.
    #[serde(default)]
    pub results: Vec<ToolOutput>,
}

pub fn load_fixture(path: &Path) -> Result<ReplayFixture> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fixture: ReplayFixture = serde_json::from_str(&contents)
        .with_context(|| format!("parse replay fixture {}", path.display()))?;
    if fixture.responses.is_empty() {
        return Err(anyhow!(
            "replay fixture {} has no responses",
            path.display()
        ));
    }
    Ok(fixture)
}

/// Model client that replays recorded responses in order.
#[derive(Debug)]
pub struct ReplayModel {
    responses: Mutex<VecDeque<ModelResponse>>,
}

impl ReplayModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ModelClient for ReplayModel {
    async fn generate_response(
        &self,
        history: &[Message],
        _options: GenerateOptions<'_>,
    ) -> Result<ModelResponse> {
        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        debug!(history_len = history.len(), "replaying model response");
        next.ok_or_else(|| anyhow!("replay transcript exhausted"))
    }
}

/// Tool registry answering from canned results.
#[derive(Debug)]
pub struct ReplayToolRegistry {
    schemas: Vec<ToolSchema>,
    results: Mutex<HashMap<String, VecDeque<ToolOutput>>>,
}

impl ReplayToolRegistry {
    pub fn new(tools: Vec<ReplayTool>) -> Self {
        let schemas = tools
            .iter()
            .map(|t| ToolSchema::new(t.name.clone(), t.description.clone()))
            .collect();
        let results = tools
            .into_iter()
            .map(|t| (t.name, t.results.into()))
            .collect();
        Self {
            schemas,
            results: Mutex::new(results),
        }
    }
}

#[async_trait]
impl ToolRegistry for ReplayToolRegistry {
    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.schemas.clone()
    }

    async fn invoke(&self, name: &str, _arguments: &Value) -> Result<ToolOutput> {
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        let queue = results
            .get_mut(name)
            .ok_or_else(|| anyhow!("no canned results for tool '{name}'"))?;
        let output = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        output.ok_or_else(|| anyhow!("no canned results for tool '{name}'"))
    }
}

pub fn from_fixture(fixture: ReplayFixture) -> (ReplayModel, ReplayToolRegistry) {
    (
        ReplayModel::new(fixture.responses),
        ReplayToolRegistry::new(fixture.tools),
    )
}
