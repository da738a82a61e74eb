//! CLI tests for `subagent validate` and `subagent run`.
//!
//! Spawns the binary against scope files and replay fixtures in a temp
//! directory and checks exit codes and the printed result.

use std::process::{Command, Output};

use serde_json::Value;
use subagent::exit_codes;
use subagent::test_support::TestDir;

const SUMMARY_SCOPE: &str = r#"
prompt = "Summarize {{path}}"
tool_permissions = ["read_file"]

[constraints]
max_turns = 4

[[constraints.termination_conditions]]
type = "output"
required = ["summary"]

[variables]
path = "README.md"
"#;

const SUMMARY_REPLAY: &str = r##"{
  "responses": [
    {"tool_calls": [{"id": "c1", "name": "read_file", "arguments": {"path": "README.md"}}]},
    {"tool_calls": [{"id": "c2", "name": "emit_variable", "arguments": {"name": "summary", "value": "short"}}]}
  ],
  "tools": [
    {"name": "read_file", "description": "Read a file", "results": [{"content": "# Title"}]}
  ]
}"##;

fn subagent(dir: &TestDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_subagent"))
        .current_dir(dir.path())
        .args(args)
        .output()
        .expect("spawn subagent")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("result json on stdout")
}

#[test]
fn validate_accepts_good_scope_file() {
    let dir = TestDir::new().expect("tempdir");
    dir.write("scope.toml", SUMMARY_SCOPE).expect("write scope");

    let output = subagent(&dir, &["validate", "scope.toml"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1 tool(s)"), "{stdout}");
}

#[test]
fn validate_rejects_scope_without_constraints() {
    let dir = TestDir::new().expect("tempdir");
    dir.write("scope.toml", "prompt = \"x\"\ntool_permissions = []\n")
        .expect("write scope");

    let output = subagent(&dir, &["validate", "scope.toml"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("scope schema validation failed"), "{stderr}");
}

#[test]
fn run_replays_transcript_to_success() {
    let dir = TestDir::new().expect("tempdir");
    dir.write("scope.toml", SUMMARY_SCOPE).expect("write scope");
    dir.write("replay.json", SUMMARY_REPLAY).expect("write replay");

    let output = subagent(&dir, &["run", "scope.toml", "--replay", "replay.json"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let result = stdout_json(&output);
    assert_eq!(result["termination"]["status"], "SUCCESS");
    assert_eq!(result["termination"]["turns_executed"], 2);
    assert_eq!(result["emitted"]["summary"], "short");
}

#[test]
fn run_overrides_file_variables_with_var_flags() {
    let dir = TestDir::new().expect("tempdir");
    dir.write("scope.toml", SUMMARY_SCOPE).expect("write scope");
    dir.write("replay.json", SUMMARY_REPLAY).expect("write replay");

    let output = subagent(
        &dir,
        &["run", "scope.toml", "--replay", "replay.json", "--var", "path=docs/guide.md"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let result = stdout_json(&output);
    assert_eq!(
        result["final_context"]["variables"]["path"]["value"],
        "docs/guide.md"
    );
}

#[test]
fn run_out_of_turns_exits_with_timeout_code() {
    let dir = TestDir::new().expect("tempdir");
    dir.write(
        "scope.toml",
        "prompt = \"loop\"\ntool_permissions = [\"read_file\"]\n[constraints]\nmax_turns = 1\n",
    )
    .expect("write scope");
    dir.write("replay.json", SUMMARY_REPLAY).expect("write replay");

    let output = subagent(&dir, &["run", "scope.toml", "--replay", "replay.json"]);

    assert_eq!(output.status.code(), Some(exit_codes::TIMEOUT));
    let result = stdout_json(&output);
    assert_eq!(result["termination"]["reason"]["kind"], "max_turns");
}

#[test]
fn run_with_exhausted_transcript_exits_with_error_code() {
    let dir = TestDir::new().expect("tempdir");
    dir.write(
        "scope.toml",
        "prompt = \"x\"\ntool_permissions = []\n[constraints]\n",
    )
    .expect("write scope");
    dir.write("replay.json", r#"{"responses": [{"content": ""}]}"#)
        .expect("write replay");

    let output = subagent(&dir, &["run", "scope.toml", "--replay", "replay.json"]);

    assert_eq!(output.status.code(), Some(exit_codes::ERROR));
    let result = stdout_json(&output);
    assert_eq!(result["termination"]["status"], "ERROR");
}

#[test]
fn run_with_missing_fixture_is_invalid_input() {
    let dir = TestDir::new().expect("tempdir");
    dir.write("scope.toml", SUMMARY_SCOPE).expect("write scope");

    let output = subagent(&dir, &["run", "scope.toml", "--replay", "missing.json"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(output.stdout.is_empty());
}

#[test]
fn run_with_invalid_engine_config_is_invalid_input() {
    let dir = TestDir::new().expect("tempdir");
    dir.write("scope.toml", SUMMARY_SCOPE).expect("write scope");
    dir.write("replay.json", SUMMARY_REPLAY).expect("write replay");
    dir.write("subagent.toml", "monitor_interval_ms = 0\n")
        .expect("write config");

    let output = subagent(&dir, &["run", "scope.toml", "--replay", "replay.json"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("monitor_interval_ms"), "{stderr}");
}
