//! Per-scope variable storage with templating, isolation copies and merge.
//!
//! Each scope owns exactly one [`ContextState`]. Contexts are never shared by
//! reference: seeding a child scope deep-copies the selected variables, and
//! every read that hands out a collection returns a snapshot.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::deep_copy::deep_copy;
use crate::core::naming::{invalid_names, is_valid_variable_name};
use crate::core::template::{self, Rendered};
use crate::error::{EngineError, EntityKind};

/// Where a variable's current value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableSource {
    /// Supplied by the caller when the scope started.
    Input,
    /// Deep-copied from another context.
    Copied,
    Merged,
    /// Written by the model through the output channel.
    Emitted,
    Tool,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableMetadata {
    pub source: VariableSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl VariableMetadata {
    pub fn new(source: VariableSource) -> Self {
        Self { source, note: None }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl Default for VariableMetadata {
    fn default() -> Self {
        Self::new(VariableSource::Manual)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub value: Value,
    pub metadata: VariableMetadata,
    pub updated_at: DateTime<Utc>,
}

/// Entries of a context's execution history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ContextEvent {
    Created { variables: usize },
    SeededFrom { source: String, names: Vec<String> },
    VariableSet { name: String, source: VariableSource },
    Merged { from: String, names: Vec<String> },
    TemplateRendered { unresolved: Vec<String> },
    ToolInvoked { tool: String, is_error: bool },
    TurnCompleted { turn: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ContextEvent,
}

/// A scope's private variable namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextState {
    pub scope_id: String,
    /// Insertion-ordered variables.
    pub variables: IndexMap<String, Variable>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContextState {
    fn new(scope_id: &str) -> Self {
        let now = Utc::now();
        Self {
            scope_id: scope_id.to_string(),
            variables: IndexMap::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn record(&mut self, event: ContextEvent) {
        let now = Utc::now();
        self.history.push(HistoryEntry { at: now, event });
        self.updated_at = now;
    }

    fn put(&mut self, name: &str, value: Value, metadata: VariableMetadata) {
        let now = Utc::now();
        self.variables.insert(
            name.to_string(),
            Variable {
                value,
                metadata,
                updated_at: now,
            },
        );
        self.updated_at = now;
    }

    /// Plain name → value view, in insertion order.
    pub fn values(&self) -> IndexMap<String, Value> {
        self.variables
            .iter()
            .map(|(name, var)| (name.clone(), var.value.clone()))
            .collect()
    }

    pub fn stats(&self) -> ContextStats {
        let approx_bytes = self
            .variables
            .iter()
            .map(|(name, var)| name.len() + var.value.to_string().len())
            .sum();
        ContextStats {
            variable_count: self.variables.len(),
            history_len: self.history.len(),
            approx_bytes,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextStats {
    pub variable_count: usize,
    pub history_len: usize,
    /// Serialized size of names plus values.
    pub approx_bytes: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Placeholder problems found by [`ContextStore::validate_template`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateCheck {
    pub missing: Vec<String>,
    pub invalid: Vec<String>,
}

impl TemplateCheck {
    pub fn is_ok(&self) -> bool {
        self.missing.is_empty() && self.invalid.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<String>,
    /// Names left alone because the target had them and overwrite was off.
    pub skipped: Vec<String>,
}

/// Store of all live scope contexts.
#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: Mutex<HashMap<String, ContextState>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ContextState>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the context for `scope_id` seeded with `initial` variables.
    pub fn create_context(
        &self,
        scope_id: &str,
        initial: IndexMap<String, Value>,
    ) -> Result<ContextState, EngineError> {
        let bad = invalid_names(initial.keys());
        if !bad.is_empty() {
            return Err(EngineError::InvalidName(bad.join(", ")));
        }
        let mut contexts = self.lock();
        if contexts.contains_key(scope_id) {
            return Err(EngineError::AlreadyExists {
                kind: EntityKind::Context,
                id: scope_id.to_string(),
            });
        }
        let mut state = ContextState::new(scope_id);
        let count = initial.len();
        for (name, value) in initial {
            state.put(&name, value, VariableMetadata::new(VariableSource::Input));
        }
        state.record(ContextEvent::Created { variables: count });
        debug!(scope_id, variables = count, "context created");
        contexts.insert(scope_id.to_string(), state.clone());
        Ok(state)
    }

    pub fn set_variable(
        &self,
        scope_id: &str,
        name: &str,
        value: Value,
        metadata: VariableMetadata,
    ) -> Result<(), EngineError> {
        let mut contexts = self.lock();
        let state = contexts
            .get_mut(scope_id)
            .ok_or_else(|| EngineError::context_not_found(scope_id))?;
        if !is_valid_variable_name(name) {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        let source = metadata.source;
        state.put(name, value, metadata);
        state.record(ContextEvent::VariableSet {
            name: name.to_string(),
            source,
        });
        Ok(())
    }

    /// Value of `name`, or `None` if the scope or variable is absent.
    pub fn get_variable(&self, scope_id: &str, name: &str) -> Option<Value> {
        self.lock()
            .get(scope_id)
            .and_then(|state| state.variables.get(name))
            .map(|var| var.value.clone())
    }

    pub fn has_variable(&self, scope_id: &str, name: &str) -> bool {
        self.lock()
            .get(scope_id)
            .is_some_and(|state| state.variables.contains_key(name))
    }

    /// Snapshot of every variable; mutating it does not touch the store.
    pub fn get_all_variables(&self, scope_id: &str) -> Option<IndexMap<String, Value>> {
        self.lock().get(scope_id).map(ContextState::values)
    }

    /// Substitute `{{name}}` placeholders from the scope's variables.
    ///
    /// Unresolved placeholders stay in the text verbatim and are logged; the
    /// template is never rejected.
    pub fn process_template(&self, template: &str, scope_id: &str) -> Rendered {
        let mut contexts = self.lock();
        let state = contexts.get_mut(scope_id);
        let rendered = match state {
            Some(state) => {
                let rendered = template::render(template, |name| {
                    state.variables.get(name).map(|var| var.value.clone())
                });
                state.record(ContextEvent::TemplateRendered {
                    unresolved: rendered.unresolved(),
                });
                rendered
            }
            None => {
                warn!(scope_id, "processing template for unknown context");
                template::render(template, |_| None)
            }
        };
        if !rendered.is_complete() {
            warn!(
                scope_id,
                missing = ?rendered.missing,
                invalid = ?rendered.invalid,
                "template has unresolved placeholders"
            );
        }
        rendered
    }

    /// Report missing and syntactically invalid placeholder names without mutating anything.
    pub fn validate_template(&self, template: &str, scope_id: &str) -> TemplateCheck {
        let contexts = self.lock();
        let state = contexts.get(scope_id);
        let mut check = TemplateCheck::default();
        for name in template::placeholders(template) {
            let bucket = if !is_valid_variable_name(&name) {
                &mut check.invalid
            } else if state.is_some_and(|s| s.variables.contains_key(&name)) {
                continue;
            } else {
                &mut check.missing
            };
            if !bucket.contains(&name) {
                bucket.push(name);
            }
        }
        check
    }

    /// Create a brand-new context for `target` holding deep copies of
    /// `source`'s variables (all of them, or only `subset`).
    pub fn create_isolated_copy(
        &self,
        source: &str,
        target: &str,
        subset: Option<&[String]>,
    ) -> Result<ContextState, EngineError> {
        let mut contexts = self.lock();
        if contexts.contains_key(target) {
            return Err(EngineError::AlreadyExists {
                kind: EntityKind::Context,
                id: target.to_string(),
            });
        }
        let source_state = contexts
            .get(source)
            .ok_or_else(|| EngineError::context_not_found(source))?;
        let selected = select_variables(source_state, subset);

        let mut state = ContextState::new(target);
        let mut names = Vec::with_capacity(selected.len());
        for (name, var) in selected {
            let mut copy = deep_copy(var)?;
            copy.metadata.source = VariableSource::Copied;
            copy.updated_at = Utc::now();
            state.variables.insert(name.clone(), copy);
            names.push(name.clone());
        }
        state.record(ContextEvent::SeededFrom {
            source: source.to_string(),
            names: names.clone(),
        });
        debug!(source, target, copied = names.len(), "isolated context copy created");
        contexts.insert(target.to_string(), state.clone());
        Ok(state)
    }

    /// Copy variables from `from` into `to`. `from` is never modified.
    pub fn merge_contexts(
        &self,
        from: &str,
        to: &str,
        subset: Option<&[String]>,
        overwrite: bool,
    ) -> Result<MergeReport, EngineError> {
        let mut contexts = self.lock();
        let source_state = contexts
            .get(from)
            .ok_or_else(|| EngineError::context_not_found(from))?;
        let mut copies = Vec::new();
        for (name, var) in select_variables(source_state, subset) {
            copies.push((name.clone(), deep_copy(&var.value)?, var.metadata.note.clone()));
        }
        let target = contexts
            .get_mut(to)
            .ok_or_else(|| EngineError::context_not_found(to))?;

        let mut report = MergeReport::default();
        for (name, value, note) in copies {
            if !overwrite && target.variables.contains_key(&name) {
                report.skipped.push(name);
                continue;
            }
            let metadata = VariableMetadata {
                source: VariableSource::Merged,
                note,
            };
            target.put(&name, value, metadata);
            report.merged.push(name);
        }
        target.record(ContextEvent::Merged {
            from: from.to_string(),
            names: report.merged.clone(),
        });
        debug!(
            from,
            to,
            merged = report.merged.len(),
            skipped = report.skipped.len(),
            "contexts merged"
        );
        Ok(report)
    }

    /// Append an event to the scope's history log. Unknown scopes are ignored.
    pub fn record_event(&self, scope_id: &str, event: ContextEvent) {
        match self.lock().get_mut(scope_id) {
            Some(state) => state.record(event),
            None => debug!(scope_id, "dropping history event for unknown context"),
        }
    }

    /// Deep snapshot of the whole context state.
    pub fn snapshot(&self, scope_id: &str) -> Option<ContextState> {
        self.lock().get(scope_id).cloned()
    }

    pub fn context_stats(&self, scope_id: &str) -> Option<ContextStats> {
        self.lock().get(scope_id).map(ContextState::stats)
    }

    /// Drop the scope's variables and history. Returns false if it was already gone.
    pub fn clear_context(&self, scope_id: &str) -> bool {
        let removed = self.lock().remove(scope_id).is_some();
        if removed {
            debug!(scope_id, "context cleared");
        } else {
            debug!(scope_id, "context already cleared");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn select_variables<'a>(
    state: &'a ContextState,
    subset: Option<&[String]>,
) -> Vec<(&'a String, &'a Variable)> {
    match subset {
        None => state.variables.iter().collect(),
        Some(names) => names
            .iter()
            .filter_map(|name| {
                let found = state.variables.get_key_value(name);
                if found.is_none() {
                    debug!(scope_id = %state.scope_id, name, "subset name not in source context");
                }
                found
            })
            .collect(),
    }
}
