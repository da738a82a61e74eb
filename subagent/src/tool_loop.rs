//! The model ↔ tool conversation cycle run inside one scope.
//!
//! Per turn: `AwaitingModel → ModelResponded → (ToolsRequested → ToolsExecuted
//! → AwaitingModel) | Done`. Every model round counts as a turn, and the
//! scope's conditions are evaluated after each one. Cancellation is checked at
//! the top of every turn and before every tool dispatch; an in-flight tool call
//! is never interrupted.

use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::core::conditions::ScopeSnapshot;
use crate::core::types::TerminationReason;
use crate::error::EngineError;
use crate::io::conversation::ConversationSink;
use crate::io::model::{GenerateOptions, Message, ModelClient, ModelResponse, ToolCall};
use crate::io::prompt::{PreambleInputs, PromptEngine};
use crate::io::tools::{EMIT_VARIABLE_TOOL, ToolOutput, ToolRegistry, ToolSchema};
use crate::scope::{Scope, TerminationStats};
use crate::store::context::{ContextEvent, ContextStore, VariableMetadata, VariableSource};
use crate::store::ledger::ResourceLedger;
use crate::termination::{ScopeSignal, TerminationEvaluator};

pub const DEFAULT_MAX_PARSE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    AwaitingModel,
    ModelResponded,
    ToolsRequested,
    ToolsExecuted,
    Done,
}

/// How a loop run ended.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub reason: TerminationReason,
    pub turns: u32,
    pub stats: TerminationStats,
    /// Variables written through `emit_variable`, in emission order.
    pub emitted: IndexMap<String, Value>,
    /// Last non-empty assistant text.
    pub final_message: Option<String>,
    pub error: Option<String>,
}

/// Borrowed collaborators for one loop run.
pub struct ToolCallLoop<'a> {
    pub model: &'a dyn ModelClient,
    pub tools: &'a dyn ToolRegistry,
    pub conversation: &'a dyn ConversationSink,
    pub contexts: &'a ContextStore,
    pub ledger: &'a ResourceLedger,
    pub evaluator: &'a TerminationEvaluator,
    pub prompts: &'a PromptEngine,
    /// Consecutive malformed rounds tolerated before giving up.
    pub max_parse_retries: u32,
}

/// Mutable bookkeeping threaded through one run.
struct RunState {
    phase: LoopPhase,
    stats: TerminationStats,
    consecutive_malformed: u32,
    emitted: IndexMap<String, Value>,
    final_message: Option<String>,
}

enum RoundResult {
    Response(anyhow::Result<ModelResponse>),
    Stopped(TerminationReason),
}

#[derive(Deserialize)]
struct EmitArgs {
    name: String,
    value: Value,
}

impl ToolCallLoop<'_> {
    /// Drive `scope` until a terminal reason is reached.
    #[instrument(skip_all, fields(scope_id = %scope.id))]
    pub async fn execute(&self, scope: &mut Scope, signal: &ScopeSignal) -> LoopOutcome {
        let config = scope.config.clone();
        let schemas = self.permitted_schemas(scope);
        let mut state = RunState {
            phase: LoopPhase::AwaitingModel,
            stats: TerminationStats::default(),
            consecutive_malformed: 0,
            emitted: IndexMap::new(),
            final_message: None,
        };

        self.open_conversation(scope, &schemas);
        info!(max_turns = config.constraints.max_turns, "tool call loop started");

        loop {
            debug_assert_eq!(state.phase, LoopPhase::AwaitingModel);
            if let Some(reason) = signal.stop_reason() {
                return self.finish(scope, state, reason, None);
            }

            let response = match self.ask_model(scope, signal, &schemas).await {
                RoundResult::Stopped(reason) => return self.finish(scope, state, reason, None),
                RoundResult::Response(response) => response,
            };
            state.phase = LoopPhase::ModelResponded;
            scope.turns += 1;
            signal.set_turns(scope.turns);
            state.stats.model_rounds += 1;
            self.contexts
                .record_event(&scope.id, ContextEvent::TurnCompleted { turn: scope.turns });

            let mut settled = false;
            match response {
                Err(err) => {
                    warn!(turn = scope.turns, error = %format!("{err:#}"), "model call failed");
                    if let Some(exhausted) = self.note_malformed(&mut state, &format!("{err:#}"), false) {
                        return self.exhausted(scope, state, exhausted);
                    }
                }
                Ok(response) => match response.malformation() {
                    Some(reason) => {
                        warn!(turn = scope.turns, %reason, "malformed model response");
                        if let Some(exhausted) = self.note_malformed(&mut state, &reason, true) {
                            return self.exhausted(scope, state, exhausted);
                        }
                    }
                    None => {
                        state.consecutive_malformed = 0;
                        if !response.content.trim().is_empty() {
                            state.final_message = Some(response.content.clone());
                        }
                        self.conversation.append(Message::assistant(
                            response.content.clone(),
                            response.tool_calls.clone(),
                        ));
                        if response.tool_calls.is_empty() {
                            settled = true;
                        } else {
                            state.phase = LoopPhase::ToolsRequested;
                            for call in &response.tool_calls {
                                if let Some(reason) = signal.stop_reason() {
                                    return self.finish(scope, state, reason, None);
                                }
                                let output = self.dispatch(scope, signal, call, &mut state).await;
                                self.conversation.append(Message::tool_result(
                                    call.id.clone(),
                                    output.content,
                                    output.is_error,
                                ));
                            }
                            state.phase = LoopPhase::ToolsExecuted;
                        }
                    }
                },
            }

            let snapshot = self.snapshot(scope, signal);
            let evaluation = self.evaluator.check(
                &config.constraints.termination_conditions,
                &config.budget(),
                &snapshot,
            );
            state.stats.predicate_failures += u32::try_from(evaluation.failures.len()).unwrap_or(u32::MAX);
            if let Some(reason) = evaluation.reason {
                return self.finish(scope, state, reason, None);
            }
            if settled {
                if !config.has_explicit_conditions() {
                    return self.finish(scope, state, TerminationReason::Completed, None);
                }
                self.nudge(scope, &snapshot);
            }
            state.phase = LoopPhase::AwaitingModel;
        }
    }

    fn permitted_schemas(&self, scope: &Scope) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .tool_schemas()
            .into_iter()
            .filter(|schema| schema.name != EMIT_VARIABLE_TOOL && scope.config.permits(&schema.name))
            .collect();
        for name in &scope.config.tool_permissions {
            if name != EMIT_VARIABLE_TOOL && !schemas.iter().any(|s| &s.name == name) {
                warn!(scope_id = %scope.id, tool = %name, "permitted tool has no schema in the registry");
            }
        }
        schemas.push(ToolSchema::emit_variable());
        schemas
    }

    fn open_conversation(&self, scope: &Scope, schemas: &[ToolSchema]) {
        let config = &scope.config;
        let task = self.contexts.process_template(&config.prompt, &scope.id);
        let required = config.required_outputs();
        let preamble = self
            .prompts
            .render_preamble(&PreambleInputs {
                tools: schemas,
                required_outputs: &required,
                max_turns: config.constraints.max_turns,
                timeout_ms: config.constraints.timeout_ms,
            })
            .unwrap_or_else(|err| {
                warn!(scope_id = %scope.id, error = %err, "failed to render scope preamble");
                String::new()
            });
        if !preamble.is_empty() {
            self.conversation.append(Message::system(preamble));
        }
        self.conversation.append(Message::user(task.text));
    }

    /// One model call raced against cancellation and the wall-clock budget.
    async fn ask_model(
        &self,
        scope: &Scope,
        signal: &ScopeSignal,
        schemas: &[ToolSchema],
    ) -> RoundResult {
        let timeout_ms = scope.config.constraints.timeout_ms;
        let Some(remaining) = remaining_budget(scope.started_at, Duration::from_millis(timeout_ms))
        else {
            return RoundResult::Stopped(TerminationReason::Timeout { timeout_ms });
        };
        let history = self.conversation.messages();
        let options = GenerateOptions {
            tools: schemas,
            cancellation: signal.token(),
        };
        tokio::select! {
            biased;
            () = signal.token().cancelled() => {
                let reason = signal.stop_reason().unwrap_or_else(|| TerminationReason::Cancelled {
                    reason: crate::termination::CALLER_CANCELLED.to_string(),
                });
                RoundResult::Stopped(reason)
            }
            () = tokio::time::sleep(remaining) => {
                RoundResult::Stopped(TerminationReason::Timeout { timeout_ms })
            }
            result = self.model.generate_response(&history, options) => RoundResult::Response(result),
        }
    }

    /// Count a malformed round. Returns the exhaustion error once the bound is passed.
    fn note_malformed(&self, state: &mut RunState, reason: &str, correct: bool) -> Option<EngineError> {
        state.consecutive_malformed += 1;
        if state.consecutive_malformed > self.max_parse_retries {
            return Some(EngineError::ExhaustedRetries {
                attempts: state.consecutive_malformed,
                message: reason.to_string(),
            });
        }
        state.stats.retry_count += 1;
        if correct {
            let remaining = self.max_parse_retries - state.consecutive_malformed;
            match self.prompts.render_correction(reason, remaining) {
                Ok(text) => self.conversation.append(Message::user(text)),
                Err(err) => warn!(error = %err, "failed to render correction message"),
            }
        }
        None
    }

    async fn dispatch(
        &self,
        scope: &Scope,
        signal: &ScopeSignal,
        call: &ToolCall,
        state: &mut RunState,
    ) -> ToolOutput {
        state.stats.tool_calls += 1;
        let output = if call.name == EMIT_VARIABLE_TOOL {
            self.emit(scope, signal, call, state)
        } else if !scope.config.permits(&call.name) {
            warn!(scope_id = %scope.id, tool = %call.name, "tool not permitted in scope");
            ToolOutput::error(format!("tool '{}' is not permitted in this scope", call.name))
        } else {
            debug!(scope_id = %scope.id, tool = %call.name, "dispatching tool");
            match self.tools.invoke(&call.name, &call.arguments).await {
                Ok(output) => output,
                Err(err) => {
                    let err = EngineError::ToolExecution {
                        tool: call.name.clone(),
                        message: format!("{err:#}"),
                    };
                    warn!(scope_id = %scope.id, error = %err, "tool dispatch failed");
                    ToolOutput::error(err.to_string())
                }
            }
        };
        if output.is_error {
            state.stats.tool_errors += 1;
        }
        self.contexts.record_event(
            &scope.id,
            ContextEvent::ToolInvoked {
                tool: call.name.clone(),
                is_error: output.is_error,
            },
        );
        output
    }

    fn emit(&self, scope: &Scope, signal: &ScopeSignal, call: &ToolCall, state: &mut RunState) -> ToolOutput {
        let args: EmitArgs = match serde_json::from_value(call.arguments.clone()) {
            Ok(args) => args,
            Err(err) => {
                return ToolOutput::error(format!(
                    "{EMIT_VARIABLE_TOOL} expects {{\"name\": string, \"value\": any}}: {err}"
                ));
            }
        };
        let metadata = VariableMetadata::new(VariableSource::Emitted).with_note(format!("turn {}", scope.turns));
        if let Err(err) = self
            .contexts
            .set_variable(&scope.id, &args.name, args.value.clone(), metadata)
        {
            return ToolOutput::error(err.to_string());
        }
        debug!(scope_id = %scope.id, name = %args.name, "variable emitted");
        signal.mark_emitted(&args.name);
        state.emitted.insert(args.name.clone(), args.value);
        ToolOutput::ok(format!("recorded '{}'", args.name))
    }

    fn snapshot(&self, scope: &Scope, signal: &ScopeSignal) -> ScopeSnapshot {
        ScopeSnapshot {
            scope_id: scope.id.clone(),
            turns_executed: scope.turns,
            elapsed_ms: scope.elapsed_ms(),
            variables: self.contexts.get_all_variables(&scope.id).unwrap_or_default(),
            emitted: signal.emitted(),
            resources: self.ledger.check_limits(&scope.id),
        }
    }

    fn nudge(&self, scope: &Scope, snapshot: &ScopeSnapshot) {
        let missing: Vec<String> = scope
            .config
            .required_outputs()
            .into_iter()
            .filter(|name| !snapshot.emitted.contains(name))
            .collect();
        match self.prompts.render_nudge(&missing) {
            Ok(text) => self.conversation.append(Message::user(text)),
            Err(err) => warn!(scope_id = %scope.id, error = %err, "failed to render nudge"),
        }
    }

    fn exhausted(&self, scope: &Scope, state: RunState, err: EngineError) -> LoopOutcome {
        let (attempts, reason) = match &err {
            EngineError::ExhaustedRetries { attempts, message } => (*attempts, message.clone()),
            other => (state.consecutive_malformed, other.to_string()),
        };
        let message = self
            .prompts
            .render_rephrase(&reason, attempts)
            .unwrap_or_else(|_| "The request could not be completed. Please rephrase it.".to_string());
        error!(scope_id = %scope.id, error = %err, "giving up on malformed model output");
        self.finish(
            scope,
            state,
            TerminationReason::Error { message },
            Some(err.to_string()),
        )
    }

    fn finish(
        &self,
        scope: &Scope,
        mut state: RunState,
        reason: TerminationReason,
        error: Option<String>,
    ) -> LoopOutcome {
        state.phase = LoopPhase::Done;
        info!(
            scope_id = %scope.id,
            reason = reason.code(),
            turns = scope.turns,
            retries = state.stats.retry_count,
            "tool call loop finished"
        );
        LoopOutcome {
            reason,
            turns: scope.turns,
            stats: state.stats,
            emitted: state.emitted,
            final_message: state.final_message,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::core::conditions::{TerminationCondition, VariableCheck};
    use crate::core::types::{ResourceRequirements, ScopeStatus};
    use crate::io::conversation::MemoryConversation;
    use crate::io::model::Role;
    use crate::scope::ScopeConfig;
    use crate::test_support::{ScriptedModel, ScriptedTools, emit_call, tool_call};
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        contexts: ContextStore,
        ledger: ResourceLedger,
        evaluator: TerminationEvaluator,
        conversation: MemoryConversation,
        prompts: PromptEngine,
        tools: ScriptedTools,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                contexts: ContextStore::new(),
                ledger: ResourceLedger::default(),
                evaluator: TerminationEvaluator::new(),
                conversation: MemoryConversation::new(),
                prompts: PromptEngine::new(),
                tools: ScriptedTools::new().with_tool("search", "found it"),
            }
        }

        async fn run(&self, model: &ScriptedModel, config: ScopeConfig) -> (LoopOutcome, Scope) {
            self.run_with(model, config, &CancellationToken::new()).await
        }

        async fn run_with(
            &self,
            model: &ScriptedModel,
            config: ScopeConfig,
            parent: &CancellationToken,
        ) -> (LoopOutcome, Scope) {
            let mut scope = Scope::new(Arc::new(config));
            self.contexts
                .create_context(&scope.id, IndexMap::new())
                .expect("context");
            self.ledger
                .allocate(&scope.id, &ResourceRequirements::default())
                .expect("allocate");
            let signal = self.evaluator.register(&scope.id, parent);
            scope.begin();
            let tool_loop = ToolCallLoop {
                model,
                tools: &self.tools,
                conversation: &self.conversation,
                contexts: &self.contexts,
                ledger: &self.ledger,
                evaluator: &self.evaluator,
                prompts: &self.prompts,
                max_parse_retries: DEFAULT_MAX_PARSE_RETRIES,
            };
            let outcome = tool_loop.execute(&mut scope, &signal).await;
            (outcome, scope)
        }
    }

    #[tokio::test]
    async fn plain_answer_completes_without_conditions() {
        let harness = Harness::new();
        let model = ScriptedModel::new().respond(ModelResponse::text("all done"));
        let (outcome, _) = harness.run(&model, ScopeConfig::new("hi")).await;
        assert_eq!(outcome.reason, TerminationReason::Completed);
        assert_eq!(outcome.turns, 1);
        assert_eq!(outcome.final_message.as_deref(), Some("all done"));
        let roles: Vec<Role> = harness.conversation.messages().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn always_calling_tools_stops_at_max_turns() {
        let harness = Harness::new();
        let model = ScriptedModel::new()
            .repeat(ModelResponse::with_tools(vec![tool_call("search", json!({}))]));
        let config = ScopeConfig::new("loop").with_tools(["search"]).with_max_turns(3);
        let (outcome, scope) = harness.run(&model, config).await;
        assert_eq!(outcome.reason, TerminationReason::MaxTurns { max_turns: 3 });
        assert_eq!(outcome.turns, 3);
        assert_eq!(scope.turns, 3);
        assert_eq!(model.calls(), 3);
        assert_eq!(outcome.stats.tool_calls, 3);
        assert_eq!(outcome.reason.status(), ScopeStatus::Timeout);
    }

    #[tokio::test]
    async fn two_parse_errors_then_success_records_two_retries() {
        let harness = Harness::new();
        let model = ScriptedModel::new()
            .respond(ModelResponse::malformed("unterminated json"))
            .respond(ModelResponse::malformed("unterminated json"))
            .respond(ModelResponse::text("fine now"));
        let (outcome, _) = harness.run(&model, ScopeConfig::new("p")).await;
        assert_eq!(outcome.reason, TerminationReason::Completed);
        assert_eq!(outcome.stats.retry_count, 2);
        assert_eq!(outcome.turns, 3);
        let corrections = harness
            .conversation
            .messages()
            .iter()
            .filter(|m| m.role == Role::User && m.content.contains("could not be used"))
            .count();
        assert_eq!(corrections, 2);
        model.assert_drained();
    }

    /// Verifies the retry bound: three corrections are allowed, the fourth
    /// consecutive malformed round ends the scope with a rephrase request.
    #[tokio::test]
    async fn exhausted_retries_end_in_error_with_rephrase_message() {
        let harness = Harness::new();
        let model = ScriptedModel::new().repeat(ModelResponse::text(""));
        let (outcome, _) = harness.run(&model, ScopeConfig::new("p")).await;
        assert_eq!(outcome.reason.status(), ScopeStatus::Error);
        assert_eq!(outcome.stats.retry_count, 3);
        assert_eq!(outcome.turns, 4);
        let TerminationReason::Error { message } = &outcome.reason else {
            panic!("expected error reason, got {:?}", outcome.reason);
        };
        assert!(message.contains("Please rephrase"), "{message}");
        assert!(outcome.error.as_deref().is_some_and(|e| e.contains("4 attempts")));
    }

    #[tokio::test]
    async fn transport_errors_use_retry_budget_without_corrections() {
        let harness = Harness::new();
        let model = ScriptedModel::new()
            .fail("connection reset")
            .respond(ModelResponse::text("ok"));
        let (outcome, _) = harness.run(&model, ScopeConfig::new("p")).await;
        assert_eq!(outcome.reason, TerminationReason::Completed);
        assert_eq!(outcome.stats.retry_count, 1);
        assert!(
            !harness
                .conversation
                .messages()
                .iter()
                .any(|m| m.content.contains("could not be used"))
        );
    }

    #[tokio::test]
    async fn emitted_outputs_satisfy_output_condition() {
        let harness = Harness::new();
        let model = ScriptedModel::new()
            .respond(ModelResponse::text("thinking"))
            .respond(ModelResponse::with_tools(vec![emit_call("summary", json!("short"))]));
        let config = ScopeConfig::new("p").with_condition(TerminationCondition::output(["summary"]));
        let (outcome, scope) = harness.run(&model, config).await;
        assert_eq!(
            outcome.reason,
            TerminationReason::Output {
                required: vec!["summary".to_string()]
            }
        );
        assert_eq!(outcome.emitted["summary"], json!("short"));
        assert_eq!(
            harness.contexts.get_variable(&scope.id, "summary"),
            Some(json!("short"))
        );
        let nudged = harness
            .conversation
            .messages()
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("Still missing outputs: summary"));
        assert!(nudged);
    }

    #[tokio::test]
    async fn unpermitted_and_failing_tools_become_error_results() {
        let harness = Harness::new();
        let model = ScriptedModel::new()
            .respond(ModelResponse::with_tools(vec![
                tool_call("delete_everything", json!({})),
                tool_call("missing_tool", json!({})),
                emit_call("9bad", json!(1)),
            ]))
            .respond(ModelResponse::text("done"));
        let config = ScopeConfig::new("p").with_tools(["missing_tool"]);
        let (outcome, _) = harness.run(&model, config).await;
        assert_eq!(outcome.reason, TerminationReason::Completed);
        assert_eq!(outcome.stats.tool_calls, 3);
        assert_eq!(outcome.stats.tool_errors, 3);
        assert!(outcome.emitted.is_empty());
        let tool_messages: Vec<Message> = harness
            .conversation
            .messages()
            .into_iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_messages.len(), 3);
        assert!(tool_messages.iter().all(|m| m.is_error));
        assert!(tool_messages[0].content.contains("not permitted"));
        assert!(harness.tools.calls().iter().all(|(name, _)| name != "delete_everything"));
    }

    #[tokio::test]
    async fn cancelled_before_first_turn_is_interrupted() {
        let harness = Harness::new();
        let model = ScriptedModel::new().repeat(ModelResponse::text("never"));
        let parent = CancellationToken::new();
        parent.cancel();
        let (outcome, _) = harness.run_with(&model, ScopeConfig::new("p"), &parent).await;
        assert_eq!(outcome.reason.status(), ScopeStatus::Interrupted);
        assert_eq!(outcome.turns, 0);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn variable_condition_stops_on_truthy_emit() {
        let harness = Harness::new();
        let model = ScriptedModel::new()
            .respond(ModelResponse::with_tools(vec![emit_call("done", json!(false))]))
            .respond(ModelResponse::with_tools(vec![emit_call("done", json!(true))]))
            .repeat(ModelResponse::text("unreachable"));
        let config = ScopeConfig::new("p")
            .with_condition(TerminationCondition::variable("done", VariableCheck::Truthy));
        let (outcome, _) = harness.run(&model, config).await;
        assert_eq!(
            outcome.reason,
            TerminationReason::Variable {
                name: "done".to_string()
            }
        );
        assert_eq!(outcome.turns, 2);
    }

    #[tokio::test]
    async fn slow_model_is_cut_off_by_timeout() {
        let harness = Harness::new();
        let model = ScriptedModel::new()
            .with_delay(Duration::from_millis(500))
            .repeat(ModelResponse::text("late"));
        let config = ScopeConfig::new("p").with_timeout_ms(30);
        let (outcome, _) = harness.run(&model, config).await;
        assert_eq!(outcome.reason, TerminationReason::Timeout { timeout_ms: 30 });
        assert_eq!(outcome.turns, 0);
    }
}
