//! Shared deterministic types for the engine core.
//!
//! These types define stable contracts between components. They carry no
//! behaviour that depends on I/O or wall-clock state.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a scope. Terminal once it leaves `Executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeStatus {
    Initialized,
    Executing,
    Success,
    Timeout,
    Error,
    Interrupted,
}

impl ScopeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScopeStatus::Success
                | ScopeStatus::Timeout
                | ScopeStatus::Error
                | ScopeStatus::Interrupted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScopeStatus::Initialized => "INITIALIZED",
            ScopeStatus::Executing => "EXECUTING",
            ScopeStatus::Success => "SUCCESS",
            ScopeStatus::Timeout => "TIMEOUT",
            ScopeStatus::Error => "ERROR",
            ScopeStatus::Interrupted => "INTERRUPTED",
        }
    }
}

impl std::fmt::Display for ScopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a scope stopped.
///
/// Each reason maps to exactly one terminal [`ScopeStatus`] via
/// [`TerminationReason::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationReason {
    /// A GOAL condition's predicate held.
    Goal { description: String },
    /// Every required output variable was emitted.
    Output { required: Vec<String> },
    /// A VARIABLE condition's predicate held.
    Variable { name: String },
    /// A CUSTOM condition's predicate held.
    Custom { reason: String },
    /// The model stopped requesting tools and nothing else was awaited.
    Completed,
    MaxTurns { max_turns: u32 },
    Timeout { timeout_ms: u64 },
    /// Caller-initiated cancellation or `force_termination`.
    Cancelled { reason: String },
    Error { message: String },
}

impl TerminationReason {
    pub fn status(&self) -> ScopeStatus {
        match self {
            TerminationReason::Goal { .. }
            | TerminationReason::Output { .. }
            | TerminationReason::Variable { .. }
            | TerminationReason::Custom { .. }
            | TerminationReason::Completed => ScopeStatus::Success,
            TerminationReason::MaxTurns { .. } | TerminationReason::Timeout { .. } => {
                ScopeStatus::Timeout
            }
            TerminationReason::Cancelled { .. } => ScopeStatus::Interrupted,
            TerminationReason::Error { .. } => ScopeStatus::Error,
        }
    }

    /// Stable short code used in logs and CLI output.
    pub fn code(&self) -> &'static str {
        match self {
            TerminationReason::Goal { .. } => "GOAL",
            TerminationReason::Output { .. } => "OUTPUT",
            TerminationReason::Variable { .. } => "VARIABLE",
            TerminationReason::Custom { .. } => "CUSTOM",
            TerminationReason::Completed => "COMPLETED",
            TerminationReason::MaxTurns { .. } => "MAX_TURNS",
            TerminationReason::Timeout { .. } => "TIMEOUT",
            TerminationReason::Cancelled { .. } => "CANCELLED",
            TerminationReason::Error { .. } => "ERROR",
        }
    }
}

/// Resource dimensions tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceKind {
    Memory,
    CpuTime,
    FileHandles,
    NetworkConnections,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Memory,
        ResourceKind::CpuTime,
        ResourceKind::FileHandles,
        ResourceKind::NetworkConnections,
    ];
}

/// Live usage counters for one scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_mb: u64,
    pub cpu_time_ms: u64,
    pub file_handles: u64,
    pub network_connections: u64,
}

impl ResourceUsage {
    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::CpuTime => self.cpu_time_ms,
            ResourceKind::FileHandles => self.file_handles,
            ResourceKind::NetworkConnections => self.network_connections,
        }
    }

    /// Merge a partial update; absent fields keep their current value.
    pub fn apply(&mut self, update: &UsageUpdate) {
        if let Some(v) = update.memory_mb {
            self.memory_mb = v;
        }
        if let Some(v) = update.cpu_time_ms {
            self.cpu_time_ms = v;
        }
        if let Some(v) = update.file_handles {
            self.file_handles = v;
        }
        if let Some(v) = update.network_connections {
            self.network_connections = v;
        }
    }

    /// Component-wise maximum, used for peak tracking.
    pub fn max(&self, other: &ResourceUsage) -> ResourceUsage {
        ResourceUsage {
            memory_mb: self.memory_mb.max(other.memory_mb),
            cpu_time_ms: self.cpu_time_ms.max(other.cpu_time_ms),
            file_handles: self.file_handles.max(other.file_handles),
            network_connections: self.network_connections.max(other.network_connections),
        }
    }
}

/// Partial usage snapshot reported by a monitor tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageUpdate {
    pub memory_mb: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub file_handles: Option<u64>,
    pub network_connections: Option<u64>,
}

impl From<ResourceUsage> for UsageUpdate {
    fn from(usage: ResourceUsage) -> Self {
        Self {
            memory_mb: Some(usage.memory_mb),
            cpu_time_ms: Some(usage.cpu_time_ms),
            file_handles: Some(usage.file_handles),
            network_connections: Some(usage.network_connections),
        }
    }
}

/// Requested limits; unspecified fields fall back to ledger defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequirements {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_time_ms: Option<u64>,
    pub max_file_handles: Option<u64>,
    pub max_network_connections: Option<u64>,
}

/// Effective limits after defaults are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_time_ms: u64,
    pub max_file_handles: u64,
    pub max_network_connections: u64,
}

impl ResourceLimits {
    pub fn get(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::Memory => self.max_memory_mb,
            ResourceKind::CpuTime => self.max_cpu_time_ms,
            ResourceKind::FileHandles => self.max_file_handles,
            ResourceKind::NetworkConnections => self.max_network_connections,
        }
    }

    pub fn derive(requested: &ResourceRequirements, defaults: &ResourceLimits) -> Self {
        Self {
            max_memory_mb: requested.max_memory_mb.unwrap_or(defaults.max_memory_mb),
            max_cpu_time_ms: requested.max_cpu_time_ms.unwrap_or(defaults.max_cpu_time_ms),
            max_file_handles: requested
                .max_file_handles
                .unwrap_or(defaults.max_file_handles),
            max_network_connections: requested
                .max_network_connections
                .unwrap_or(defaults.max_network_connections),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 512,
            max_cpu_time_ms: 300_000,
            max_file_handles: 256,
            max_network_connections: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// One limit exceeded by live usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub current: u64,
    pub limit: u64,
    pub severity: Severity,
}

/// Result of checking one allocation against its limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitCheck {
    pub valid: bool,
    pub violations: Vec<Violation>,
    pub usage: ResourceUsage,
    pub limits: ResourceLimits,
}

/// Compute violations of `usage` against `limits`.
///
/// Usage above 150% of a limit is `Critical`, anything else over the limit is
/// a `Warning`.
pub fn detect_violations(usage: &ResourceUsage, limits: &ResourceLimits) -> Vec<Violation> {
    ResourceKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let current = usage.get(kind);
            let limit = limits.get(kind);
            if current <= limit {
                return None;
            }
            let severity = if current.saturating_mul(2) > limit.saturating_mul(3) {
                Severity::Critical
            } else {
                Severity::Warning
            };
            Some(Violation {
                kind,
                current,
                limit,
                severity,
            })
        })
        .collect()
}
