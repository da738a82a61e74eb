//! Error taxonomy shared by the engine components.
//!
//! Component operations return [`EngineError`] so callers can match on an
//! explicit discriminant. File and CLI plumbing keeps using `anyhow`.

use serde::Serialize;

/// Which kind of entity an operation could not find or already had.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Context,
    Allocation,
    Scope,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntityKind::Context => "context",
            EntityKind::Allocation => "allocation",
            EntityKind::Scope => "scope",
        })
    }
}

/// Reason an allocation request was refused by the ledger.
///
/// Ceilings are checked in declaration order; the first one exceeded wins.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationDenied {
    #[error("concurrent scope ceiling reached: {live} live, max {max}")]
    ConcurrentScopes { live: usize, max: usize },

    #[error("aggregate memory ceiling exceeded: projected {projected_mb} MB, max {max_mb} MB")]
    AggregateMemory { projected_mb: u64, max_mb: u64 },

    #[error("aggregate CPU time ceiling exceeded: projected {projected_ms} ms, max {max_ms} ms")]
    AggregateCpuTime { projected_ms: u64, max_ms: u64 },

    #[error("scope '{0}' already holds an allocation")]
    Duplicate(String),
}

/// Unified error type for scope execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The scope configuration is unusable; nothing was allocated.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A global resource ceiling refused the scope.
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationDenied),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} '{id}' already exists")]
    AlreadyExists { kind: EntityKind, id: String },

    /// Variable name does not match `[A-Za-z_][A-Za-z0-9_-]*`.
    #[error("invalid variable name '{0}'")]
    InvalidName(String),

    /// Model output could not be interpreted.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("model output unusable after {attempts} attempts: {message}")]
    ExhaustedRetries { attempts: u32, message: String },

    #[error("tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("interrupted: {reason}")]
    Interrupted { reason: String },
}

impl EngineError {
    pub fn context_not_found(id: &str) -> Self {
        EngineError::NotFound {
            kind: EntityKind::Context,
            id: id.to_string(),
        }
    }

    pub fn allocation_not_found(id: &str) -> Self {
        EngineError::NotFound {
            kind: EntityKind::Allocation,
            id: id.to_string(),
        }
    }
}
