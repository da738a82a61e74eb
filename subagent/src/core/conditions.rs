//! Termination conditions and their deterministic evaluation.
//!
//! Precedence is fixed: explicit conditions in declaration order, then the
//! implicit MAX_TURNS check, then the implicit TIMEOUT check. The first
//! satisfied condition supplies the reason. A predicate that errors or panics
//! counts as "not met" and is reported in [`Evaluation::failures`] so the
//! caller can log it; evaluation then falls through to the next condition.
//!
//! [`evaluate_background`] is the subset safe to run off the loop's turn
//! boundary: resource-violation conditions and the wall-clock TIMEOUT. Turn
//! driven conditions and MAX_TURNS are only decided by the loop after a
//! round's tool results are folded back.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value;

use crate::core::types::{LimitCheck, TerminationReason};

/// Reason text used when a resource-violation condition ends a scope.
pub const RESOURCE_VIOLATION_REASON: &str = "resource limit exceeded";

/// Predicate over a whole scope snapshot (GOAL and CUSTOM conditions).
pub type ScopePredicate = Arc<dyn Fn(&ScopeSnapshot) -> anyhow::Result<bool> + Send + Sync>;

/// Predicate over a single variable value (VARIABLE conditions).
pub type ValuePredicate = Arc<dyn Fn(&Value) -> anyhow::Result<bool> + Send + Sync>;

/// Read-only view of a scope handed to predicates.
#[derive(Debug, Clone, Default)]
pub struct ScopeSnapshot {
    pub scope_id: String,
    pub turns_executed: u32,
    pub elapsed_ms: u64,
    pub variables: IndexMap<String, Value>,
    /// Names emitted through the scope's output channel, in emission order.
    pub emitted: Vec<String>,
    pub resources: Option<LimitCheck>,
}

impl ScopeSnapshot {
    pub fn has_violations(&self) -> bool {
        self.resources
            .as_ref()
            .is_some_and(|check| !check.violations.is_empty())
    }
}

#[derive(Clone)]
pub enum VariableCheck {
    /// The variable exists, whatever its value.
    Present,
    /// The variable exists and is not null/false/0/empty.
    Truthy,
    Equals(Value),
    Matches(ValuePredicate),
}

impl fmt::Debug for VariableCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableCheck::Present => f.write_str("Present"),
            VariableCheck::Truthy => f.write_str("Truthy"),
            VariableCheck::Equals(v) => f.debug_tuple("Equals").field(v).finish(),
            VariableCheck::Matches(_) => f.write_str("Matches(<predicate>)"),
        }
    }
}

/// Explicit stopping rule declared on a scope.
///
/// TIMEOUT and MAX_TURNS are implicit: they come from the scope's
/// constraints via [`TurnBudget`].
#[derive(Clone)]
pub enum TerminationCondition {
    Goal {
        description: String,
        predicate: ScopePredicate,
    },
    /// Met once every name in `required` has been emitted through the
    /// scope's output channel (`emit_variable`). A name that is merely present
    /// in the context, such as an input variable, does not count.
    Output {
        required: Vec<String>,
    },
    Variable {
        name: String,
        check: VariableCheck,
    },
    Custom {
        reason: String,
        predicate: ScopePredicate,
    },
    /// Met when the scope's allocation currently records a limit violation.
    /// Ends the scope with a CUSTOM reason.
    ResourceViolation,
}

impl TerminationCondition {
    pub fn goal<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ScopeSnapshot) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        TerminationCondition::Goal {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn custom<F>(reason: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&ScopeSnapshot) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        TerminationCondition::Custom {
            reason: reason.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn output<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TerminationCondition::Output {
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    pub fn variable(name: impl Into<String>, check: VariableCheck) -> Self {
        TerminationCondition::Variable {
            name: name.into(),
            check,
        }
    }

    pub fn variable_matches<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self::variable(name, VariableCheck::Matches(Arc::new(predicate)))
    }

    /// Stop as soon as the scope's allocation records any limit violation.
    pub fn on_resource_violation() -> Self {
        TerminationCondition::ResourceViolation
    }

    /// Whether the condition depends only on resource usage, so it can be
    /// decided between turns.
    pub fn is_resource_driven(&self) -> bool {
        matches!(self, TerminationCondition::ResourceViolation)
    }

    /// Short label for logs.
    pub fn label(&self) -> String {
        match self {
            TerminationCondition::Goal { description, .. } => format!("GOAL({description})"),
            TerminationCondition::Output { required } => {
                format!("OUTPUT({})", required.join(","))
            }
            TerminationCondition::Variable { name, .. } => format!("VARIABLE({name})"),
            TerminationCondition::Custom { reason, .. } => format!("CUSTOM({reason})"),
            TerminationCondition::ResourceViolation => "RESOURCE_VIOLATION".to_string(),
        }
    }

    /// Variable names this condition refers to directly.
    pub fn referenced_names(&self) -> Vec<&str> {
        match self {
            TerminationCondition::Output { required } => {
                required.iter().map(String::as_str).collect()
            }
            TerminationCondition::Variable { name, .. } => vec![name.as_str()],
            TerminationCondition::Goal { .. }
            | TerminationCondition::Custom { .. }
            | TerminationCondition::ResourceViolation => Vec::new(),
        }
    }

    fn check(&self, snapshot: &ScopeSnapshot) -> anyhow::Result<Option<TerminationReason>> {
        let met = match self {
            TerminationCondition::Goal { predicate, .. }
            | TerminationCondition::Custom { predicate, .. } => {
                run_guarded(|| predicate(snapshot))?
            }
            TerminationCondition::Output { required } => required
                .iter()
                .all(|name| snapshot.emitted.iter().any(|e| e == name)),
            TerminationCondition::Variable { name, check } => match snapshot.variables.get(name) {
                None => false,
                Some(value) => match check {
                    VariableCheck::Present => true,
                    VariableCheck::Truthy => is_truthy(value),
                    VariableCheck::Equals(expected) => value == expected,
                    VariableCheck::Matches(predicate) => run_guarded(|| predicate(value))?,
                },
            },
            TerminationCondition::ResourceViolation => snapshot.has_violations(),
        };
        if !met {
            return Ok(None);
        }
        Ok(Some(match self {
            TerminationCondition::Goal { description, .. } => TerminationReason::Goal {
                description: description.clone(),
            },
            TerminationCondition::Output { required } => TerminationReason::Output {
                required: required.clone(),
            },
            TerminationCondition::Variable { name, .. } => {
                TerminationReason::Variable { name: name.clone() }
            }
            TerminationCondition::Custom { reason, .. } => TerminationReason::Custom {
                reason: reason.clone(),
            },
            TerminationCondition::ResourceViolation => TerminationReason::Custom {
                reason: RESOURCE_VIOLATION_REASON.to_string(),
            },
        }))
    }
}

impl fmt::Debug for TerminationCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationCondition::Variable { name, check } => f
                .debug_struct("Variable")
                .field("name", name)
                .field("check", check)
                .finish(),
            other => f.write_str(&other.label()),
        }
    }
}

/// Implicit limits derived from the scope's constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnBudget {
    pub max_turns: u32,
    pub timeout_ms: u64,
}

/// A predicate that could not be evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateFailure {
    pub condition: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// `None` means "continue".
    pub reason: Option<TerminationReason>,
    pub failures: Vec<PredicateFailure>,
}

/// Evaluate conditions against a snapshot in fixed precedence order.
pub fn evaluate(
    conditions: &[TerminationCondition],
    budget: &TurnBudget,
    snapshot: &ScopeSnapshot,
) -> Evaluation {
    let mut failures = Vec::new();
    if let Some(reason) = first_met(conditions.iter(), snapshot, &mut failures) {
        return Evaluation {
            reason: Some(reason),
            failures,
        };
    }

    let reason = if snapshot.turns_executed >= budget.max_turns {
        Some(TerminationReason::MaxTurns {
            max_turns: budget.max_turns,
        })
    } else if snapshot.elapsed_ms >= budget.timeout_ms {
        Some(TerminationReason::Timeout {
            timeout_ms: budget.timeout_ms,
        })
    } else {
        None
    };
    Evaluation { reason, failures }
}

/// Evaluate only what may be decided between turns: resource-driven
/// conditions in declaration order, then the wall-clock TIMEOUT.
pub fn evaluate_background(
    conditions: &[TerminationCondition],
    budget: &TurnBudget,
    snapshot: &ScopeSnapshot,
) -> Evaluation {
    let mut failures = Vec::new();
    let resource_driven = conditions.iter().filter(|c| c.is_resource_driven());
    let reason = first_met(resource_driven, snapshot, &mut failures).or_else(|| {
        (snapshot.elapsed_ms >= budget.timeout_ms).then_some(TerminationReason::Timeout {
            timeout_ms: budget.timeout_ms,
        })
    });
    Evaluation { reason, failures }
}

fn first_met<'a>(
    conditions: impl Iterator<Item = &'a TerminationCondition>,
    snapshot: &ScopeSnapshot,
    failures: &mut Vec<PredicateFailure>,
) -> Option<TerminationReason> {
    for condition in conditions {
        match condition.check(snapshot) {
            Ok(Some(reason)) => return Some(reason),
            Ok(None) => {}
            Err(err) => failures.push(PredicateFailure {
                condition: condition.label(),
                message: format!("{err:#}"),
            }),
        }
    }
    None
}

fn run_guarded<F>(f: F) -> anyhow::Result<bool>
where
    F: FnOnce() -> anyhow::Result<bool>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("predicate panicked: {message}"))
        }
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn budget() -> TurnBudget {
        TurnBudget {
            max_turns: 5,
            timeout_ms: 10_000,
        }
    }

    fn snapshot() -> ScopeSnapshot {
        ScopeSnapshot {
            scope_id: "s".to_string(),
            turns_executed: 1,
            elapsed_ms: 10,
            ..ScopeSnapshot::default()
        }
    }

    #[test]
    fn continues_when_nothing_matches() {
        let eval = evaluate(&[TerminationCondition::output(["summary"])], &budget(), &snapshot());
        assert!(eval.reason.is_none());
        assert!(eval.failures.is_empty());
    }

    #[test]
    fn output_ignores_names_only_present_as_variables() {
        let mut snap = snapshot();
        snap.variables.insert("summary".to_string(), json!("seeded"));
        let conditions = [TerminationCondition::output(["summary"])];
        assert!(evaluate(&conditions, &budget(), &snap).reason.is_none());

        snap.emitted.push("summary".to_string());
        assert_eq!(
            evaluate(&conditions, &budget(), &snap).reason,
            Some(TerminationReason::Output {
                required: vec!["summary".to_string()]
            })
        );
    }

    #[test]
    fn first_explicit_condition_wins() {
        let mut snap = snapshot();
        snap.variables.insert("done".to_string(), json!(true));
        snap.emitted.push("summary".to_string());
        let conditions = vec![
            TerminationCondition::variable("done", VariableCheck::Truthy),
            TerminationCondition::output(["summary"]),
        ];
        let eval = evaluate(&conditions, &budget(), &snap);
        assert_eq!(
            eval.reason,
            Some(TerminationReason::Variable {
                name: "done".to_string()
            })
        );
    }

    #[test]
    fn explicit_conditions_precede_max_turns_and_timeout() {
        let mut snap = snapshot();
        snap.turns_executed = 5;
        snap.elapsed_ms = 20_000;
        let conditions = vec![TerminationCondition::custom("always", |_| Ok(true))];
        let eval = evaluate(&conditions, &budget(), &snap);
        assert_eq!(
            eval.reason,
            Some(TerminationReason::Custom {
                reason: "always".to_string()
            })
        );
    }

    #[test]
    fn max_turns_precedes_timeout() {
        let mut snap = snapshot();
        snap.turns_executed = 5;
        snap.elapsed_ms = 20_000;
        let eval = evaluate(&[], &budget(), &snap);
        assert_eq!(eval.reason, Some(TerminationReason::MaxTurns { max_turns: 5 }));
    }

    #[test]
    fn timeout_fires_on_elapsed() {
        let mut snap = snapshot();
        snap.elapsed_ms = 10_000;
        let eval = evaluate(&[], &budget(), &snap);
        assert_eq!(
            eval.reason,
            Some(TerminationReason::Timeout { timeout_ms: 10_000 })
        );
    }

    #[test]
    fn failing_predicate_falls_through_to_safety_net() {
        let mut snap = snapshot();
        snap.turns_executed = 5;
        let conditions = vec![
            TerminationCondition::custom("errors", |_| Err(anyhow::anyhow!("boom"))),
            TerminationCondition::goal("panics", |_| panic!("bad predicate")),
        ];
        let eval = evaluate(&conditions, &budget(), &snap);
        assert_eq!(eval.reason, Some(TerminationReason::MaxTurns { max_turns: 5 }));
        assert_eq!(eval.failures.len(), 2);
        assert!(eval.failures[0].message.contains("boom"));
        assert!(eval.failures[1].message.contains("bad predicate"));
    }

    #[test]
    fn variable_checks_cover_equals_and_matches() {
        let mut snap = snapshot();
        snap.variables.insert("count".to_string(), json!(3));
        let equals = TerminationCondition::variable("count", VariableCheck::Equals(json!(3)));
        let matches =
            TerminationCondition::variable_matches("count", |v| Ok(v.as_u64() == Some(4)));
        assert!(evaluate(&[equals], &budget(), &snap).reason.is_some());
        assert!(evaluate(&[matches], &budget(), &snap).reason.is_none());
    }

    /// Verifies the between-turns evaluation never decides on turn count or
    /// on conditions that depend on emitted outputs.
    #[test]
    fn background_evaluation_ignores_turn_driven_conditions() {
        let mut snap = snapshot();
        snap.turns_executed = 5;
        snap.emitted.push("summary".to_string());
        let conditions = vec![
            TerminationCondition::output(["summary"]),
            TerminationCondition::custom("always", |_| Ok(true)),
        ];
        assert!(evaluate_background(&conditions, &budget(), &snap).reason.is_none());

        snap.elapsed_ms = 10_000;
        assert_eq!(
            evaluate_background(&conditions, &budget(), &snap).reason,
            Some(TerminationReason::Timeout { timeout_ms: 10_000 })
        );
    }

    #[test]
    fn resource_violation_condition_reads_snapshot() {
        use crate::core::types::{
            ResourceKind, ResourceLimits, ResourceUsage, Severity, Violation,
        };
        let mut snap = snapshot();
        snap.resources = Some(LimitCheck {
            valid: false,
            violations: vec![Violation {
                kind: ResourceKind::Memory,
                current: 900,
                limit: 512,
                severity: Severity::Critical,
            }],
            usage: ResourceUsage::default(),
            limits: ResourceLimits::default(),
        });
        let conditions = [TerminationCondition::on_resource_violation()];
        let eval = evaluate(&conditions, &budget(), &snap);
        assert_eq!(eval.reason.map(|r| r.code()), Some("CUSTOM"));
        let background = evaluate_background(&conditions, &budget(), &snap);
        assert_eq!(
            background.reason,
            Some(TerminationReason::Custom {
                reason: RESOURCE_VIOLATION_REASON.to_string()
            })
        );
    }
}
