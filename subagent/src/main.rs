//! `subagent` command line.
//!
//! `validate` checks a scope file; `run` dry-runs a scope against a recorded
//! model transcript and prints the structured result as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use serde_json::Value;
use subagent::exit_codes;
use subagent::io::config::load_config;
use subagent::io::replay::{from_fixture, load_fixture};
use subagent::io::scope_file::load_scope_file;
use subagent::logging;
use subagent::orchestrator::ScopeOrchestrator;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "subagent.toml";

#[derive(Parser)]
#[command(name = "subagent", version, about = "Scoped subtask execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a scope file against the schema and semantic rules.
    Validate {
        scope: PathBuf,
    },
    /// Run a scope against a recorded model transcript.
    Run {
        scope: PathBuf,
        /// JSON fixture with model responses and canned tool results.
        #[arg(long)]
        replay: PathBuf,
        /// Extra input variable, `name=value`. Values are parsed as JSON when possible.
        #[arg(long = "var", value_name = "NAME=VALUE")]
        vars: Vec<String>,
        /// Engine config; defaults apply when the file is missing.
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Validate { scope } => cmd_validate(&scope),
        Command::Run {
            scope,
            replay,
            vars,
            config,
        } => cmd_run(&scope, &replay, &vars, &config).await,
    };
    match code {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let file = load_scope_file(path)?;
    println!(
        "ok: {} tool(s), {} termination condition(s), {} variable(s)",
        file.tool_permissions.len(),
        file.constraints.termination_conditions.len(),
        file.variables.len()
    );
    Ok(exit_codes::OK)
}

async fn cmd_run(scope_path: &Path, replay: &Path, vars: &[String], config_path: &Path) -> Result<i32> {
    let config = load_config(config_path)?;
    let file = load_scope_file(scope_path)?;
    let fixture = load_fixture(replay)?;

    let mut variables = file.variables.clone();
    for (name, value) in parse_vars(vars)? {
        variables.insert(name, value);
    }

    let (model, tools) = from_fixture(fixture);
    let orchestrator = ScopeOrchestrator::new(config, Arc::new(model), Arc::new(tools));

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling scope");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator
        .run_with_cancel(file.to_config(), variables, cancel)
        .await;
    info!(status = %result.status(), "run finished");
    let json = serde_json::to_string_pretty(&result).context("serialize result")?;
    println!("{json}");
    Ok(exit_codes::for_status(result.status()))
}

fn parse_vars(vars: &[String]) -> Result<IndexMap<String, Value>> {
    let mut parsed = IndexMap::new();
    for raw in vars {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("--var expects NAME=VALUE, got '{raw}'"))?;
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        parsed.insert(name.trim().to_string(), value);
    }
    Ok(parsed)
}
