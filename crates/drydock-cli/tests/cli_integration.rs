//! CLI subprocess integration tests.
//!
//! These tests invoke the `drydock` binary with the mock backend and verify
//! exit codes, stdout content, and JSON output.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn drydock_bin(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_drydock"));
    cmd.env_remove("DRYDOCK_LOG")
        .env_remove("LOG_LEVEL")
        .env_remove("DRYDOCK_MAX_PARALLELISM")
        .args(["--home", &home.to_string_lossy()])
        .args(["--backend", "mock", "--no-host-check"]);
    cmd
}

fn run(home: &Path, args: &[&str]) -> Output {
    drydock_bin(home).args(args).output().unwrap()
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_blueprint(dir: &Path, image: &str) -> PathBuf {
    let path = dir.join("main.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[[resource]]
type = "network"
name = "onprem"
subnet = "10.15.0.0/16"

[[resource]]
type = "container"
name = "consul"
image = "{image}"
depends_on = ["network.onprem"]
"#
        ),
    )
    .unwrap();
    path
}

fn state_file(home: &Path) -> PathBuf {
    home.join("state").join("state.json")
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_drydock"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("drydock"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_drydock"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    for cmd in ["apply", "plan", "destroy", "status", "taint"] {
        assert!(text.contains(cmd), "help must list '{cmd}': {text}");
    }
}

#[test]
fn cli_apply_then_status_json() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = write_blueprint(project.path(), "consul:1.8.1");

    let output = run(home.path(), &["apply", &bp.to_string_lossy()]);
    assert!(output.status.success(), "apply must exit 0: {}", stderr(&output));
    assert!(stdout(&output).contains("3 total"), "{}", stdout(&output));
    assert!(state_file(home.path()).exists());

    let output = run(home.path(), &["--json", "status"]);
    assert!(output.status.success());
    let status: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(status["summary"]["total"], 3);
    assert_eq!(status["summary"]["created"], 3);
    let ids: Vec<&str> = status["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(
        ids,
        vec![
            "resource.image_cache.default",
            "resource.network.onprem",
            "resource.container.consul"
        ]
    );
}

#[test]
fn cli_plan_reports_recreate() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = write_blueprint(project.path(), "consul:1.8.1");
    assert!(run(home.path(), &["apply", &bp.to_string_lossy()]).status.success());

    let output = run(home.path(), &["--json", "plan", &bp.to_string_lossy()]);
    assert!(output.status.success(), "{}", stderr(&output));
    let plan: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(plan["unchanged"], 2);
    assert_eq!(plan["create"].as_array().unwrap().len(), 0);

    let bp = write_blueprint(project.path(), "consul:1.9.0");
    let output = run(home.path(), &["--json", "plan", &bp.to_string_lossy()]);
    let plan: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(plan["recreate"], serde_json::json!(["resource.container.consul"]));
    assert_eq!(plan["unchanged"], 1);
}

#[test]
fn cli_invalid_blueprint_exits_two() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = project.path().join("main.toml");
    std::fs::write(
        &bp,
        "[[resource]]\ntype = \"network\"\nname = \"a\"\nsubnet = \"10.1.0.0/16\"\n\n\
         [[resource]]\ntype = \"network\"\nname = \"b\"\nsubnet = \"10.1.0.0/24\"\n",
    )
    .unwrap();

    let output = run(home.path(), &["apply", &bp.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
    assert!(!state_file(home.path()).exists());
}

#[test]
fn cli_unknown_type_without_backend_exits_two() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = write_blueprint(project.path(), "consul:1.8.1");

    let output = Command::new(env!("CARGO_BIN_EXE_drydock"))
        .args(["--home", &home.path().to_string_lossy(), "--no-host-check"])
        .args(["apply", &bp.to_string_lossy()])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
}

#[test]
fn cli_malformed_var_exits_two() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = write_blueprint(project.path(), "consul:1.8.1");

    let output = run(home.path(), &["apply", &bp.to_string_lossy(), "--var", "novalue"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("invalid variable"));
}

#[test]
fn cli_var_overrides_default() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = project.path().join("main.toml");
    std::fs::write(
        &bp,
        "[variable.version]\ndefault = \"1\"\n\n[[resource]]\ntype = \"container\"\nname = \"app\"\nimage = \"app:${var.version}\"\n",
    )
    .unwrap();

    let output = run(
        home.path(),
        &["apply", &bp.to_string_lossy(), "--var", "version=2"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    let state = std::fs::read_to_string(state_file(home.path())).unwrap();
    assert!(state.contains("app:2"), "{state}");
}

#[test]
fn cli_taint_then_status() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = write_blueprint(project.path(), "consul:1.8.1");
    assert!(run(home.path(), &["apply", &bp.to_string_lossy()]).status.success());

    let output = run(home.path(), &["taint", "resource.container.consul"]);
    assert!(output.status.success(), "{}", stderr(&output));

    let output = run(home.path(), &["--json", "status"]);
    let status: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(status["summary"]["tainted"], 1);

    let output = run(home.path(), &["taint", "resource.container.ghost"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_destroy_removes_state_file() {
    let home = tempfile::tempdir().unwrap();
    let project = tempfile::tempdir().unwrap();
    let bp = write_blueprint(project.path(), "consul:1.8.1");
    assert!(run(home.path(), &["apply", &bp.to_string_lossy()]).status.success());

    let output = run(home.path(), &["--json", "destroy"]);
    assert!(output.status.success(), "{}", stderr(&output));
    let result: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(result["destroyed"], 3);
    assert!(!state_file(home.path()).exists());

    let output = run(home.path(), &["destroy"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("nothing to destroy"));
}

#[test]
fn cli_completions_bash() {
    let output = Command::new(env!("CARGO_BIN_EXE_drydock"))
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("drydock"));
}
