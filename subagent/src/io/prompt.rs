//! Messages the engine itself writes into a scope's conversation.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::io::tools::{EMIT_VARIABLE_TOOL, ToolSchema};

const PREAMBLE_TEMPLATE: &str = include_str!("prompts/scope_preamble.md");
const CORRECTION_TEMPLATE: &str = include_str!("prompts/correction.md");
const NUDGE_TEMPLATE: &str = include_str!("prompts/nudge.md");
const REPHRASE_TEMPLATE: &str = include_str!("prompts/rephrase.md");

#[derive(Debug, Clone, Serialize)]
struct ToolLine<'a> {
    name: &'a str,
    description: &'a str,
}

/// Inputs for the opening system message of a scope. The task itself is sent
/// separately as the first user message.
#[derive(Debug, Clone)]
pub struct PreambleInputs<'a> {
    pub tools: &'a [ToolSchema],
    pub required_outputs: &'a [String],
    pub max_turns: u32,
    pub timeout_ms: u64,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("preamble", PREAMBLE_TEMPLATE)
            .expect("preamble template should be valid");
        env.add_template("correction", CORRECTION_TEMPLATE)
            .expect("correction template should be valid");
        env.add_template("nudge", NUDGE_TEMPLATE)
            .expect("nudge template should be valid");
        env.add_template("rephrase", REPHRASE_TEMPLATE)
            .expect("rephrase template should be valid");
        Self { env }
    }

    pub fn render_preamble(&self, input: &PreambleInputs<'_>) -> Result<String> {
        let tools: Vec<ToolLine<'_>> = input
            .tools
            .iter()
            .filter(|t| t.name != EMIT_VARIABLE_TOOL)
            .map(|t| ToolLine {
                name: &t.name,
                description: t.description.trim(),
            })
            .collect();
        let template = self.env.get_template("preamble")?;
        let rendered = template.render(context! {
            tools => tools,
            emit_tool => EMIT_VARIABLE_TOOL,
            required_outputs => input.required_outputs,
            max_turns => input.max_turns,
            timeout_secs => input.timeout_ms.div_ceil(1000),
        })?;
        Ok(tidy(&rendered))
    }

    /// Message appended after a malformed model round.
    pub fn render_correction(&self, reason: &str, remaining: u32) -> Result<String> {
        let template = self.env.get_template("correction")?;
        let rendered = template.render(context! { reason => reason, remaining => remaining })?;
        Ok(tidy(&rendered))
    }

    /// Message appended when the model stopped but the scope's conditions are unmet.
    pub fn render_nudge(&self, missing_outputs: &[String]) -> Result<String> {
        let template = self.env.get_template("nudge")?;
        let rendered = template.render(context! {
            missing_outputs => missing_outputs,
            emit_tool => EMIT_VARIABLE_TOOL,
        })?;
        Ok(tidy(&rendered))
    }

    /// User-facing text for a scope that ran out of correction retries.
    pub fn render_rephrase(&self, reason: &str, attempts: u32) -> Result<String> {
        let template = self.env.get_template("rephrase")?;
        let rendered = template.render(context! { reason => reason, attempts => attempts })?;
        Ok(tidy(&rendered))
    }
}

/// Collapse runs of blank lines left by template control blocks.
fn tidy(rendered: &str) -> String {
    let mut out = String::with_capacity(rendered.len());
    let mut blank = false;
    for line in rendered.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if !blank && !out.is_empty() {
                out.push('\n');
            }
            blank = true;
            continue;
        }
        blank = false;
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}
