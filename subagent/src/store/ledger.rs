//! Per-scope and global resource accounting.
//!
//! The ledger measures; it never terminates a scope. Violations are recorded
//! and surfaced through [`ResourceLedger::check_limits`] and the stats
//! projections, and acting on them is left to termination conditions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::budget::elapsed_ms;
use crate::core::types::{
    LimitCheck, ResourceKind, ResourceLimits, ResourceRequirements, ResourceUsage, UsageUpdate,
    Violation, detect_violations,
};
use crate::error::{AllocationDenied, EngineError};

/// Global ceilings enforced at allocation time plus per-scope default limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub max_concurrent_scopes: usize,
    /// Sum of `max_memory_mb` over live allocations.
    pub max_total_memory_mb: u64,
    /// Sum of `max_cpu_time_ms` over live allocations.
    pub max_total_cpu_time_ms: u64,
    pub default_limits: ResourceLimits,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scopes: 10,
            max_total_memory_mb: 8192,
            max_total_cpu_time_ms: 3_600_000,
            default_limits: ResourceLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationStatus {
    Active,
    Released,
}

/// Isolation derived from the effective limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationFlags {
    /// No network connections allowed.
    pub network: bool,
    /// No file handles allowed.
    pub filesystem: bool,
}

impl IsolationFlags {
    fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            network: limits.max_network_connections == 0,
            filesystem: limits.max_file_handles == 0,
        }
    }
}

/// The ledger's record for one live scope.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub scope_id: String,
    pub requested: ResourceRequirements,
    pub limits: ResourceLimits,
    pub usage: ResourceUsage,
    pub peak: ResourceUsage,
    pub status: AllocationStatus,
    pub isolation: IsolationFlags,
    pub violations: Vec<Violation>,
    pub allocated_at: Instant,
    pub allocated_at_utc: DateTime<Utc>,
}

impl Allocation {
    fn limit_check(&self) -> LimitCheck {
        LimitCheck {
            valid: self.violations.is_empty(),
            violations: self.violations.clone(),
            usage: self.usage,
            limits: self.limits,
        }
    }
}

/// Usage as a percentage of each limit. A zero limit reports 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Utilization {
    pub memory_pct: f64,
    pub cpu_time_pct: f64,
    pub file_handles_pct: f64,
    pub network_connections_pct: f64,
}

impl Utilization {
    fn of(usage: &ResourceUsage, limits: &ResourceLimits) -> Self {
        let pct = |kind| percent(usage.get(kind), limits.get(kind));
        Self {
            memory_pct: pct(ResourceKind::Memory),
            cpu_time_pct: pct(ResourceKind::CpuTime),
            file_handles_pct: pct(ResourceKind::FileHandles),
            network_connections_pct: pct(ResourceKind::NetworkConnections),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(current: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    current as f64 * 100.0 / limit as f64
}

/// Read-only projection of one allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationStats {
    pub scope_id: String,
    pub status: AllocationStatus,
    pub usage: ResourceUsage,
    pub peak: ResourceUsage,
    pub limits: ResourceLimits,
    pub utilization: Utilization,
    pub isolation: IsolationFlags,
    pub violations: Vec<Violation>,
    pub lifetime_ms: u64,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalStats {
    pub active_scopes: usize,
    pub max_concurrent_scopes: usize,
    pub reserved_memory_mb: u64,
    pub max_total_memory_mb: u64,
    pub reserved_cpu_time_ms: u64,
    pub max_total_cpu_time_ms: u64,
    /// Live usage summed over active allocations.
    pub current_usage: ResourceUsage,
    pub violating_scopes: usize,
    pub total_allocated: u64,
    pub total_released: u64,
    pub total_denied: u64,
}

/// One per-resource cleanup step run during release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupStep {
    pub resource: ResourceKind,
    /// Usage outstanding at release time.
    pub reclaimed: u64,
}

/// Outcome of [`ResourceLedger::release`]. Release never fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseReport {
    pub scope_id: String,
    /// False when there was no live allocation to release.
    pub released: bool,
    pub lifetime_ms: Option<u64>,
    pub cleanup: Vec<CleanupStep>,
    pub peak: Option<ResourceUsage>,
    pub warning: Option<String>,
}

#[derive(Debug, Default)]
struct LedgerState {
    allocations: HashMap<String, Allocation>,
    total_allocated: u64,
    total_released: u64,
    total_denied: u64,
}

impl LedgerState {
    fn reserved(&self) -> (u64, u64) {
        self.allocations
            .values()
            .filter(|a| a.status == AllocationStatus::Active)
            .fold((0, 0), |(mem, cpu), a| {
                (
                    mem.saturating_add(a.limits.max_memory_mb),
                    cpu.saturating_add(a.limits.max_cpu_time_ms),
                )
            })
    }

    fn active_count(&self) -> usize {
        self.allocations
            .values()
            .filter(|a| a.status == AllocationStatus::Active)
            .count()
    }
}

/// Single writer of per-scope allocations and global totals.
#[derive(Debug)]
pub struct ResourceLedger {
    config: LedgerConfig,
    state: Mutex<LedgerState>,
}

impl Default for ResourceLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

impl ResourceLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a scope if every global ceiling still holds afterwards.
    ///
    /// Ceilings are checked in order: concurrent scopes, aggregate memory,
    /// aggregate CPU time. A denial leaves the ledger unchanged apart from the
    /// denial counter.
    pub fn allocate(
        &self,
        scope_id: &str,
        requirements: &ResourceRequirements,
    ) -> Result<Allocation, EngineError> {
        let limits = ResourceLimits::derive(requirements, &self.config.default_limits);
        let mut state = self.lock();
        if let Err(denied) = self.admit(&state, scope_id, &limits) {
            state.total_denied += 1;
            warn!(scope_id, reason = %denied, "allocation denied");
            return Err(denied.into());
        }

        let allocation = Allocation {
            scope_id: scope_id.to_string(),
            requested: *requirements,
            limits,
            usage: ResourceUsage::default(),
            peak: ResourceUsage::default(),
            status: AllocationStatus::Active,
            isolation: IsolationFlags::from_limits(&limits),
            violations: Vec::new(),
            allocated_at: Instant::now(),
            allocated_at_utc: Utc::now(),
        };
        state
            .allocations
            .insert(scope_id.to_string(), allocation.clone());
        state.total_allocated += 1;
        debug!(
            scope_id,
            memory_mb = limits.max_memory_mb,
            cpu_time_ms = limits.max_cpu_time_ms,
            "resources allocated"
        );
        Ok(allocation)
    }

    fn admit(
        &self,
        state: &LedgerState,
        scope_id: &str,
        limits: &ResourceLimits,
    ) -> Result<(), AllocationDenied> {
        if state.allocations.contains_key(scope_id) {
            return Err(AllocationDenied::Duplicate(scope_id.to_string()));
        }
        let live = state.active_count();
        if live >= self.config.max_concurrent_scopes {
            return Err(AllocationDenied::ConcurrentScopes {
                live,
                max: self.config.max_concurrent_scopes,
            });
        }
        let (memory, cpu) = state.reserved();
        let projected_mb = memory.saturating_add(limits.max_memory_mb);
        if projected_mb > self.config.max_total_memory_mb {
            return Err(AllocationDenied::AggregateMemory {
                projected_mb,
                max_mb: self.config.max_total_memory_mb,
            });
        }
        let projected_ms = cpu.saturating_add(limits.max_cpu_time_ms);
        if projected_ms > self.config.max_total_cpu_time_ms {
            return Err(AllocationDenied::AggregateCpuTime {
                projected_ms,
                max_ms: self.config.max_total_cpu_time_ms,
            });
        }
        Ok(())
    }

    /// Merge a usage snapshot and recompute violations.
    ///
    /// Unknown scopes are logged and ignored. Returns the fresh limit check.
    pub fn update_usage(&self, scope_id: &str, update: &UsageUpdate) -> Option<LimitCheck> {
        let mut state = self.lock();
        let Some(allocation) = state.allocations.get_mut(scope_id) else {
            warn!(scope_id, "usage update for unknown allocation ignored");
            return None;
        };
        allocation.usage.apply(update);
        allocation.peak = allocation.peak.max(&allocation.usage);
        allocation.violations = detect_violations(&allocation.usage, &allocation.limits);
        Some(allocation.limit_check())
    }

    pub fn check_limits(&self, scope_id: &str) -> Option<LimitCheck> {
        self.lock()
            .allocations
            .get(scope_id)
            .map(Allocation::limit_check)
    }

    /// Mark the allocation released, run cleanup steps, and drop it.
    pub fn release(&self, scope_id: &str) -> ReleaseReport {
        let mut state = self.lock();
        let Some(mut allocation) = state.allocations.remove(scope_id) else {
            let warning = format!("no live allocation for '{scope_id}'; already released?");
            warn!(scope_id, "release of unknown allocation");
            return ReleaseReport {
                scope_id: scope_id.to_string(),
                released: false,
                lifetime_ms: None,
                cleanup: Vec::new(),
                peak: None,
                warning: Some(warning),
            };
        };
        allocation.status = AllocationStatus::Released;
        state.total_released += 1;
        drop(state);

        let cleanup = cleanup_steps(&mut allocation.usage);
        let lifetime_ms = elapsed_ms(allocation.allocated_at);
        info!(
            scope_id,
            lifetime_ms,
            peak_memory_mb = allocation.peak.memory_mb,
            "resources released"
        );
        ReleaseReport {
            scope_id: scope_id.to_string(),
            released: true,
            lifetime_ms: Some(lifetime_ms),
            cleanup,
            peak: Some(allocation.peak),
            warning: None,
        }
    }

    pub fn get_stats(&self, scope_id: &str) -> Option<AllocationStats> {
        self.lock().allocations.get(scope_id).map(|a| AllocationStats {
            scope_id: a.scope_id.clone(),
            status: a.status,
            usage: a.usage,
            peak: a.peak,
            limits: a.limits,
            utilization: Utilization::of(&a.usage, &a.limits),
            isolation: a.isolation,
            violations: a.violations.clone(),
            lifetime_ms: elapsed_ms(a.allocated_at),
            allocated_at: a.allocated_at_utc,
        })
    }

    pub fn get_global_stats(&self) -> GlobalStats {
        let state = self.lock();
        let (reserved_memory_mb, reserved_cpu_time_ms) = state.reserved();
        let mut current_usage = ResourceUsage::default();
        let mut violating_scopes = 0;
        for allocation in state.allocations.values() {
            let u = &allocation.usage;
            current_usage.memory_mb = current_usage.memory_mb.saturating_add(u.memory_mb);
            current_usage.cpu_time_ms = current_usage.cpu_time_ms.saturating_add(u.cpu_time_ms);
            current_usage.file_handles = current_usage.file_handles.saturating_add(u.file_handles);
            current_usage.network_connections = current_usage
                .network_connections
                .saturating_add(u.network_connections);
            if !allocation.violations.is_empty() {
                violating_scopes += 1;
            }
        }
        GlobalStats {
            active_scopes: state.active_count(),
            max_concurrent_scopes: self.config.max_concurrent_scopes,
            reserved_memory_mb,
            max_total_memory_mb: self.config.max_total_memory_mb,
            reserved_cpu_time_ms,
            max_total_cpu_time_ms: self.config.max_total_cpu_time_ms,
            current_usage,
            violating_scopes,
            total_allocated: state.total_allocated,
            total_released: state.total_released,
            total_denied: state.total_denied,
        }
    }

    /// Release every allocation that is no longer active or has violations.
    pub fn force_cleanup(&self) -> Vec<ReleaseReport> {
        let targets: Vec<String> = self
            .lock()
            .allocations
            .values()
            .filter(|a| a.status != AllocationStatus::Active || !a.violations.is_empty())
            .map(|a| a.scope_id.clone())
            .collect();
        if !targets.is_empty() {
            info!(count = targets.len(), "force cleanup releasing allocations");
        }
        targets.iter().map(|id| self.release(id)).collect()
    }

    pub fn is_allocated(&self, scope_id: &str) -> bool {
        self.lock().allocations.contains_key(scope_id)
    }
}

fn cleanup_steps(usage: &mut ResourceUsage) -> Vec<CleanupStep> {
    ResourceKind::ALL
        .into_iter()
        .map(|resource| {
            let slot = match resource {
                ResourceKind::Memory => &mut usage.memory_mb,
                ResourceKind::CpuTime => &mut usage.cpu_time_ms,
                ResourceKind::FileHandles => &mut usage.file_handles,
                ResourceKind::NetworkConnections => &mut usage.network_connections,
            };
            let reclaimed = std::mem::take(slot);
            debug!(?resource, reclaimed, "cleanup step");
            CleanupStep {
                resource,
                reclaimed,
            }
        })
        .collect()
}
