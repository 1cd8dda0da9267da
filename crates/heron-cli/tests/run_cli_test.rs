//! Integration tests for the `heron` binary.
//!
//! Each test writes a config whose only backend is `cat`, so every "model
//! response" is the rendered prompt echoed back.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const PLAN: &str = r#"{
    "subtasks": [
        {"id": "s1", "title": "Survey", "objective": "List the modules",
         "agent_key": "coder", "engine": "local", "parallel_group": 1},
        {"id": "s2", "title": "Summarize", "objective": "Describe each module",
         "agent_key": "writer", "engine": "cloud", "parallel_group": 2,
         "depends_on": ["s1"]}
    ],
    "merge": {"strategy": "Produce a short architecture overview"}
}"#;

const CONFIG: &str = r#"
[dispatch]
retry_attempts = 0
retry_delay_ms = 0
call_timeout_secs = 30

[[agents]]
key = "coder"
system_prompt = "You write code."

[[agents]]
key = "writer"
system_prompt = "You write prose."

[[backends]]
name = "echo"
command = "cat"
"#;

struct Env {
    dir: tempfile::TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), CONFIG).unwrap();
        std::fs::write(dir.path().join("plan.json"), PLAN).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn heron(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_heron"))
            .args(args)
            .env("HERON_CONFIG", self.path("config.toml"))
            .env("HOME", self.dir.path())
            .env_remove("XDG_CONFIG_HOME")
            .env_remove("HERON_RETRY_ATTEMPTS")
            .env_remove("HERON_MAX_PARALLEL")
            .env("RUST_LOG", "warn")
            .output()
            .expect("failed to run heron")
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn plan_arg(env: &Env) -> String {
    env.path("plan.json").display().to_string()
}

#[test]
fn run_executes_plan_and_prints_answer() {
    let env = Env::new();
    let out = env.heron(&["run", &plan_arg(&env), "--goal", "Explain the repo", "--quiet"]);

    assert!(out.status.success(), "stderr: {}", text(&out.stderr));
    let stdout = text(&out.stdout);
    // `cat` echoes the synthesis prompt, which quotes both subtask outputs.
    assert!(stdout.contains("Goal: Explain the repo"), "{stdout}");
    assert!(stdout.contains("### [s1] Survey"), "{stdout}");
    assert!(stdout.contains("### [s2] Summarize"), "{stdout}");

    let state = std::fs::read_to_string(env.path("plan.state.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state).unwrap();
    for subtask in state["subtasks"].as_array().unwrap() {
        assert_eq!(subtask["status"], "completed");
    }
    assert_eq!(state["metadata"]["goal"], "Explain the repo");
}

#[test]
fn show_prints_persisted_status() {
    let env = Env::new();
    let state = env.path("custom-state.json");
    let state_arg = state.display().to_string();
    let run = env.heron(&[
        "run",
        &plan_arg(&env),
        "--goal",
        "Explain the repo",
        "--state",
        &state_arg,
        "--quiet",
    ]);
    assert!(run.status.success(), "stderr: {}", text(&run.stderr));

    let out = env.heron(&["show", &state_arg]);
    assert!(out.status.success(), "stderr: {}", text(&out.stderr));
    let stdout = text(&out.stdout);
    assert!(stdout.contains("Progress: 2/2 completed"), "{stdout}");
    assert!(stdout.contains("[+] s1"), "{stdout}");
}

#[test]
fn warnings_reject_the_run_unless_allowed() {
    let env = Env::new();
    let plan = PLAN.replace("\"Summarize\"", "\"Survey\"");
    std::fs::write(env.path("dup.json"), plan).unwrap();
    let dup = env.path("dup.json").display().to_string();

    let out = env.heron(&["run", &dup, "--goal", "g", "--quiet"]);
    assert_eq!(out.status.code(), Some(2), "stderr: {}", text(&out.stderr));
    assert!(text(&out.stderr).contains("share the title"));
    assert!(!Path::new(&env.path("dup.state.json")).exists());

    let out = env.heron(&["run", &dup, "--goal", "g", "--quiet", "--allow-warnings"]);
    assert!(out.status.success(), "stderr: {}", text(&out.stderr));
}

#[test]
fn failing_backend_exits_with_error() {
    let env = Env::new();
    let config = CONFIG.replace("command = \"cat\"", "command = \"false\"");
    std::fs::write(env.path("config.toml"), config).unwrap();

    let out = env.heron(&["run", &plan_arg(&env), "--goal", "g", "--quiet"]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = text(&out.stderr);
    assert!(stderr.contains("subtask \"s1\" failed"), "{stderr}");
}

#[test]
fn validate_reports_structural_errors() {
    let env = Env::new();
    let out = env.heron(&["validate", &plan_arg(&env)]);
    assert!(out.status.success(), "stderr: {}", text(&out.stderr));
    assert!(text(&out.stdout).contains("Plan OK: 2 subtask(s) in 2 group(s)"));

    std::fs::write(env.path("bad.json"), PLAN.replace("\"writer\"", "\"intruder\"")).unwrap();
    let bad = env.path("bad.json").display().to_string();
    let out = env.heron(&["validate", &bad]);
    assert_eq!(out.status.code(), Some(1));
    assert!(text(&out.stderr).contains("intruder"));
}

#[test]
fn init_refuses_to_overwrite_without_force() {
    let env = Env::new();
    let target = env.path("fresh").join("config.toml");
    let target_arg = target.display().to_string();

    let out = env.heron(&["--config", &target_arg, "init"]);
    assert!(out.status.success(), "stderr: {}", text(&out.stderr));
    assert!(std::fs::read_to_string(&target).unwrap().contains("[[backends]]"));

    let out = env.heron(&["--config", &target_arg, "init"]);
    assert!(!out.status.success());
    assert!(text(&out.stderr).contains("already exists"));

    let out = env.heron(&["--config", &target_arg, "init", "--force"]);
    assert!(out.status.success());
}
