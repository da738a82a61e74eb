//! Lifecycle tests for `ScopeOrchestrator`.
//!
//! Drives full scopes through scripted model and tool collaborators and checks
//! the terminal status, the diagnostics and that every scope's context and
//! allocation are gone afterwards.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{Value, json};
use subagent::core::conditions::TerminationCondition;
use subagent::core::types::{ResourceUsage, ScopeStatus, TerminationReason};
use subagent::io::model::ModelResponse;
use subagent::orchestrator::ScopeOrchestrator;
use subagent::scope::{ScopeConfig, SubAgentResult};
use subagent::store::ledger::LedgerConfig;
use subagent::test_support::{
    FixedUsageProbe, ScriptedModel, ScriptedTools, emit_call, fast_config, tool_call,
};
use tokio_util::sync::CancellationToken;

fn orchestrator(model: ScriptedModel, tools: ScriptedTools) -> Arc<ScopeOrchestrator> {
    Arc::new(
        ScopeOrchestrator::new(fast_config(), Arc::new(model), Arc::new(tools))
            .with_probe(Arc::new(FixedUsageProbe::default())),
    )
}

fn no_vars() -> IndexMap<String, Value> {
    IndexMap::new()
}

fn assert_cleaned_up(orch: &ScopeOrchestrator, result: &SubAgentResult) {
    assert!(result.status().is_terminal(), "{result:?}");
    if let Some(scope_id) = &result.scope_id {
        assert!(!orch.ledger().is_allocated(scope_id));
        assert!(orch.contexts().snapshot(scope_id).is_none());
        assert!(orch.evaluator().signal(scope_id).is_none());
    }
    assert!(orch.active_scopes().is_empty());
    assert_eq!(orch.ledger().get_global_stats().active_scopes, 0);
}

#[tokio::test]
async fn output_condition_completes_with_emitted_values() {
    let model = ScriptedModel::new()
        .respond(ModelResponse::with_tools(vec![tool_call(
            "read_file",
            json!({"path": "README.md"}),
        )]))
        .respond(ModelResponse::with_tools(vec![emit_call(
            "summary",
            json!("A short summary"),
        )]));
    let tools = ScriptedTools::new().with_tool("read_file", "# Title\nBody");
    let orch = orchestrator(model, tools);

    let config = ScopeConfig::new("Summarize {{path}}")
        .with_tools(["read_file"])
        .with_condition(TerminationCondition::output(["summary"]));
    let vars: IndexMap<String, Value> = [("path".to_string(), json!("README.md"))].into_iter().collect();
    let result = orch.run(config, vars).await;

    assert_eq!(result.status(), ScopeStatus::Success);
    assert_eq!(
        result.termination.reason,
        TerminationReason::Output {
            required: vec!["summary".to_string()]
        }
    );
    assert_eq!(result.termination.turns_executed, 2);
    assert_eq!(result.emitted.len(), 1);
    assert_eq!(result.emitted["summary"], json!("A short summary"));
    assert_eq!(result.metadata.termination.tool_calls, 2);
    assert_cleaned_up(&orch, &result);
}

#[tokio::test]
async fn tool_calls_forever_stop_at_max_turns() {
    let model = ScriptedModel::new().repeat(ModelResponse::with_tools(vec![tool_call(
        "search",
        json!({"q": "x"}),
    )]));
    let tools = ScriptedTools::new().with_tool("search", "nothing");
    let orch = orchestrator(model, tools);

    let config = ScopeConfig::new("search until done")
        .with_tools(["search"])
        .with_max_turns(3);
    let result = orch.run(config, no_vars()).await;

    assert_eq!(result.status(), ScopeStatus::Timeout);
    assert_eq!(result.termination.reason, TerminationReason::MaxTurns { max_turns: 3 });
    assert_eq!(result.termination.turns_executed, 3);
    assert_cleaned_up(&orch, &result);
}

/// Verifies cancelling mid-loop ends the scope as INTERRUPTED and releases its
/// allocation exactly once.
#[tokio::test]
async fn cancel_mid_loop_is_interrupted_and_released_once() {
    let model = ScriptedModel::new().repeat(ModelResponse::with_tools(vec![tool_call(
        "slow",
        json!({}),
    )]));
    let tools = ScriptedTools::new()
        .with_tool("slow", "tick")
        .with_delay(Duration::from_millis(20));
    let orch = orchestrator(model, tools);

    let cancel = CancellationToken::new();
    let run = {
        let orch = Arc::clone(&orch);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let config = ScopeConfig::new("work").with_tools(["slow"]).with_max_turns(1_000);
            orch.run_with_cancel(config, IndexMap::new(), cancel).await
        })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(orch.active_scopes().len(), 1);
    cancel.cancel();
    let result = run.await.expect("join");

    assert_eq!(result.status(), ScopeStatus::Interrupted);
    assert!(result.termination.turns_executed >= 1);
    let duration_ms = result.termination.execution_duration_ms;
    assert!(duration_ms >= 50, "duration {duration_ms} ms ends before the cancel");
    assert!(duration_ms < 2_000, "duration {duration_ms} ms runs far past the cancel");
    assert!(result.metadata.release.as_ref().is_some_and(|r| r.released));
    let stats = orch.ledger().get_global_stats();
    assert_eq!(stats.total_allocated, 1);
    assert_eq!(stats.total_released, 1);
    assert_cleaned_up(&orch, &result);
}

/// Verifies an output emitted in the last allowed turn wins over MAX_TURNS,
/// even while the background monitor keeps ticking during a slow tool call in
/// the same batch.
#[tokio::test]
async fn output_in_final_turn_beats_max_turns_with_monitor_running() {
    let model = ScriptedModel::new().respond(ModelResponse::with_tools(vec![
        tool_call("search", json!({"q": "x"})),
        emit_call("summary", json!("found")),
    ]));
    let tools = ScriptedTools::new()
        .with_tool("search", "result")
        .with_delay(Duration::from_millis(50));
    let orch = orchestrator(model, tools);

    let config = ScopeConfig::new("p")
        .with_tools(["search"])
        .with_max_turns(1)
        .with_condition(TerminationCondition::output(["summary"]));
    let result = orch.run(config, no_vars()).await;

    assert_eq!(result.status(), ScopeStatus::Success);
    assert_eq!(
        result.termination.reason,
        TerminationReason::Output {
            required: vec!["summary".to_string()]
        }
    );
    assert_eq!(result.emitted["summary"], json!("found"));
    assert_eq!(result.metadata.termination.tool_calls, 2);
    assert_eq!(result.termination.turns_executed, 1);
    assert_cleaned_up(&orch, &result);
}

#[tokio::test]
async fn cancel_by_scope_id_uses_given_reason() {
    let model = ScriptedModel::new()
        .with_delay(Duration::from_millis(10))
        .repeat(ModelResponse::text("thinking"));
    let orch = orchestrator(model, ScriptedTools::new());

    let run = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move {
            let config = ScopeConfig::new("p")
                .with_max_turns(1_000)
                .with_condition(TerminationCondition::output(["never"]));
            orch.run(config, IndexMap::new()).await
        })
    };

    let scope_id = loop {
        if let Some(active) = orch.active_scopes().first() {
            break active.scope_id.clone();
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };
    assert!(orch.cancel(&scope_id, "operator abort"));
    let result = run.await.expect("join");

    assert_eq!(result.status(), ScopeStatus::Interrupted);
    assert_eq!(
        result.termination.reason,
        TerminationReason::Cancelled {
            reason: "operator abort".to_string()
        }
    );
    assert_eq!(result.scope_id.as_deref(), Some(scope_id.as_str()));
    assert_cleaned_up(&orch, &result);
}

#[tokio::test]
async fn parse_errors_then_success_record_retries() {
    let model = ScriptedModel::new()
        .respond(ModelResponse::malformed("expected value at line 1"))
        .respond(ModelResponse::malformed("expected value at line 1"))
        .respond(ModelResponse::with_tools(vec![emit_call("answer", json!("ok"))]));
    let orch = orchestrator(model, ScriptedTools::new());

    let config = ScopeConfig::new("p").with_condition(TerminationCondition::output(["answer"]));
    let result = orch.run(config, no_vars()).await;

    assert_eq!(result.status(), ScopeStatus::Success);
    assert_eq!(result.metadata.termination.retry_count, 2);
    assert_eq!(result.termination.turns_executed, 3);
    assert_cleaned_up(&orch, &result);
}

#[tokio::test]
async fn persistent_parse_errors_end_in_error() {
    let model = ScriptedModel::new().repeat(ModelResponse::malformed("garbage"));
    let orch = orchestrator(model, ScriptedTools::new());

    let result = orch.run(ScopeConfig::new("p"), no_vars()).await;

    assert_eq!(result.status(), ScopeStatus::Error);
    assert_eq!(result.metadata.termination.retry_count, 3);
    assert!(result.metadata.error.as_deref().is_some_and(|e| e.contains("garbage")));
    assert_cleaned_up(&orch, &result);
}

#[tokio::test]
async fn wall_clock_timeout_during_slow_tool_ends_as_timeout() {
    let model = ScriptedModel::new().repeat(ModelResponse::with_tools(vec![tool_call(
        "slow",
        json!({}),
    )]));
    let tools = ScriptedTools::new()
        .with_tool("slow", "done")
        .with_delay(Duration::from_millis(200));
    let orch = orchestrator(model, tools);

    let config = ScopeConfig::new("p")
        .with_tools(["slow"])
        .with_timeout_ms(50)
        .with_max_turns(100);
    let result = orch.run(config, no_vars()).await;

    assert_eq!(result.status(), ScopeStatus::Timeout);
    assert_eq!(result.termination.reason, TerminationReason::Timeout { timeout_ms: 50 });
    assert_cleaned_up(&orch, &result);
}

#[tokio::test]
async fn concurrency_ceiling_denies_extra_scope() {
    let config = subagent::io::config::EngineConfig {
        ledger: LedgerConfig {
            max_concurrent_scopes: 1,
            ..LedgerConfig::default()
        },
        ..fast_config()
    };
    let model = ScriptedModel::new()
        .with_delay(Duration::from_millis(10))
        .repeat(ModelResponse::text("busy"));
    let orch = Arc::new(
        ScopeOrchestrator::new(config, Arc::new(model), Arc::new(ScriptedTools::new()))
            .with_probe(Arc::new(FixedUsageProbe::default())),
    );

    let cancel = CancellationToken::new();
    let first = {
        let orch = Arc::clone(&orch);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let config = ScopeConfig::new("first")
                .with_max_turns(1_000)
                .with_condition(TerminationCondition::output(["never"]));
            orch.run_with_cancel(config, IndexMap::new(), cancel).await
        })
    };
    while orch.active_scopes().is_empty() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let denied = orch.run(ScopeConfig::new("second"), no_vars()).await;
    assert_eq!(denied.status(), ScopeStatus::Error);
    assert!(
        denied
            .metadata
            .error
            .as_deref()
            .is_some_and(|e| e.contains("concurrent scope ceiling"))
    );
    assert_eq!(orch.ledger().get_global_stats().total_denied, 1);

    cancel.cancel();
    let first = first.await.expect("join");
    assert_eq!(first.status(), ScopeStatus::Interrupted);
    assert_cleaned_up(&orch, &first);
}

#[tokio::test]
async fn resource_violation_condition_stops_scope() {
    let model = ScriptedModel::new()
        .with_delay(Duration::from_millis(10))
        .repeat(ModelResponse::text("working"));
    let probe = Arc::new(FixedUsageProbe::new(ResourceUsage {
        memory_mb: 4_096,
        ..ResourceUsage::default()
    }));
    let orch = ScopeOrchestrator::new(fast_config(), Arc::new(model), Arc::new(ScriptedTools::new()))
        .with_probe(probe);

    let config = ScopeConfig::new("p")
        .with_max_turns(1_000)
        .with_condition(TerminationCondition::on_resource_violation());
    let result = orch.run(config, no_vars()).await;

    assert_eq!(result.status(), ScopeStatus::Success);
    assert_eq!(result.termination.reason.code(), "CUSTOM");
    let resources = result.metadata.resources.as_ref().expect("allocation stats");
    assert!(!resources.violations.is_empty());
    assert_cleaned_up(&orch, &result);
}

#[tokio::test]
async fn concurrent_scopes_do_not_share_variables() {
    let orch = Arc::new(
        ScopeOrchestrator::new(
            fast_config(),
            Arc::new(
                ScriptedModel::new().repeat(ModelResponse::with_tools(vec![emit_call(
                    "result",
                    json!("same name"),
                )])),
            ),
            Arc::new(ScriptedTools::new()),
        )
        .with_probe(Arc::new(FixedUsageProbe::default())),
    );

    let runs = (0..4).map(|i| {
        let orch = Arc::clone(&orch);
        async move {
            let vars: IndexMap<String, Value> = [("index".to_string(), json!(i))].into_iter().collect();
            let config = ScopeConfig::new("scope {{index}}")
                .with_condition(TerminationCondition::output(["result"]));
            orch.run(config, vars).await
        }
    });
    let results = futures::future::join_all(runs).await;

    for (i, result) in results.iter().enumerate() {
        assert!(result.is_success(), "{result:?}");
        let context = result.final_context.as_ref().expect("context");
        assert_eq!(context.variables["index"].value, json!(i));
        assert_cleaned_up(&orch, result);
    }
    assert_eq!(orch.ledger().get_global_stats().total_released, 4);
}
