use serde_json::Value;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const TOOLING_DOT: &str = r#"
    digraph build {
        developer [role="developer", tools="compile"]
        tester [role="tester"]
        developer -> tester
    }
"#;

fn run_cli(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_forge-factory"))
        .args(args)
        .current_dir(cwd)
        .env("RUST_LOG", "warn")
        .env_remove("FORGE_FACTORY_CONFIG")
        .output()
        .expect("cli process should start")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn describe(output: &Output) -> String {
    format!(
        "stdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn write_file(dir: &TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("file write should succeed");
    path.to_str().expect("path should be utf8").to_string()
}

#[test]
fn run_builtin_template_event_json_expected_success_output() {
    let temp = TempDir::new().expect("tempdir should create");
    let output = run_cli(
        &["run", "--requirement", r#"{"title":"todo api"}"#, "--event-json", "--input", "queue"],
        temp.path(),
    );

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = stdout(&output);
    assert!(stdout.contains("status: succeeded"), "{stdout}");
    assert!(stdout.contains("template: software-factory"), "{stdout}");

    let events: Vec<Value> = stdout
        .lines()
        .filter(|line| line.starts_with('{'))
        .map(|line| serde_json::from_str(line).expect("event line should be json"))
        .collect();
    assert!(!events.is_empty());
    assert_eq!(events[0]["kind"]["category"], "run");
    assert_eq!(events[0]["kind"]["kind"], "submitted");
    assert_eq!(events[0]["sequence_no"], 1);
    assert!(events.iter().any(|event| event["kind"]["kind"] == "dispatched"));
}

#[test]
fn run_dot_file_with_unregistered_tool_expected_configuration_error() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = write_file(&temp, "build.dot", TOOLING_DOT);

    let output = run_cli(
        &["run", "--dot-file", &dot_file, "--requirement", "cli", "--no-stream-events"],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown tool 'compile'"), "{stderr}");
}

#[test]
fn run_dot_file_with_tool_expected_success_and_template_from_file_stem() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = write_file(&temp, "build.dot", TOOLING_DOT);

    let output = run_cli(
        &[
            "run",
            "--dot-file",
            &dot_file,
            "--requirement",
            "cli",
            "--tool",
            "compile=true",
            "--no-stream-events",
        ],
        temp.path(),
    );

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = stdout(&output);
    assert!(stdout.contains("template: build"), "{stdout}");
    assert!(stdout.contains("attempts: developer=1, tester=1"), "{stdout}");
}

#[test]
fn run_with_state_root_then_inspect_run_expected_archived_status() {
    let temp = TempDir::new().expect("tempdir should create");
    let state_root = temp.path().join("state");
    let state_root = state_root.to_str().expect("path should be utf8");

    let output = run_cli(
        &["run", "--requirement", "todo api", "--state-root", state_root, "--no-stream-events"],
        temp.path(),
    );
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = stdout(&output);
    let run_id = stdout
        .lines()
        .find_map(|line| line.strip_prefix("run_id: "))
        .expect("summary should name the run");

    let inspected = run_cli(
        &["inspect-run", "--state-root", state_root, "--run-id", run_id, "--json"],
        temp.path(),
    );
    assert!(inspected.status.success(), "{}", describe(&inspected));
    let report: Value = serde_json::from_slice(&inspected.stdout).expect("report should be json");
    assert_eq!(report["status"], "succeeded");
    assert_eq!(report["run_id"], run_id);
    assert_eq!(report["attempt_counts"]["critic"], Value::Null);
}

#[test]
fn run_invalid_human_answer_expected_error_exit() {
    let temp = TempDir::new().expect("tempdir should create");
    let output = run_cli(
        &["run", "--requirement", "x", "--human-answer", "maybe", "--no-stream-events"],
        temp.path(),
    );

    assert_eq!(output.status.code(), Some(1), "{}", describe(&output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid human answer"));
}

#[test]
fn validate_unknown_role_expected_diagnostic_and_exit_code_two() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = write_file(
        &temp,
        "poetry.dot",
        r#"digraph G { developer [role="developer"] poet [role="poet"] developer -> poet }"#,
    );

    let output = run_cli(&["validate", "--dot-file", &dot_file], temp.path());

    assert_eq!(output.status.code(), Some(2), "{}", describe(&output));
    let stdout = stdout(&output);
    assert!(stdout.contains("error[role_registered]"), "{stdout}");
    assert!(stdout.contains("stage 'poet'"), "{stdout}");
}

#[test]
fn validate_clean_template_json_expected_empty_diagnostics() {
    let temp = TempDir::new().expect("tempdir should create");
    let dot_file = write_file(&temp, "build.dot", TOOLING_DOT);

    let output = run_cli(&["validate", "--dot-file", &dot_file, "--json"], temp.path());

    assert!(output.status.success(), "{}", describe(&output));
    let diagnostics: Vec<Value> = serde_json::from_slice(&output.stdout).expect("json");
    assert!(diagnostics.iter().all(|d| d["severity"] != "error"), "{diagnostics:?}");
}

#[test]
fn templates_command_expected_builtin_template_listed() {
    let temp = TempDir::new().expect("tempdir should create");
    let output = run_cli(&["templates"], temp.path());

    assert!(output.status.success(), "{}", describe(&output));
    let stdout = stdout(&output);
    assert!(stdout.starts_with("software-factory: architect, compliance, critic"), "{stdout}");
}
