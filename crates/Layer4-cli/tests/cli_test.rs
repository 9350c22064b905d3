//! End-to-end tests for the `clawmate` binary
//!
//! `cargo test -p claw-cli --test cli_test`

use std::path::Path;
use std::process::{Command, Output, Stdio};

/// Run the binary with config isolated to `home`
fn clawmate(home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_clawmate"))
        .arg("--no-containers")
        .args(args)
        .current_dir(home)
        .env("XDG_CONFIG_HOME", home.join("config"))
        .env("HOME", home)
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

fn json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_classify_destructive_command() {
    let home = tempfile::tempdir().unwrap();
    let output = clawmate(home.path(), &["--json", "classify", "rm", "-rf", "/tmp/scratch"]);
    assert!(output.status.success());

    let preview = json(&output);
    assert_eq!(preview["classification"]["tier"], "destructive");
    assert_eq!(preview["target"], "container");
}

#[test]
fn test_classify_rejects_unknown_tier() {
    let home = tempfile::tempdir().unwrap();
    let output = clawmate(home.path(), &["classify", "--tier", "apocalyptic", "ls"]);
    assert!(!output.status.success());
}

#[cfg(unix)]
#[test]
fn test_exec_auto_approved_echo() {
    let home = tempfile::tempdir().unwrap();
    let output = clawmate(
        home.path(),
        &["--approval", "auto", "exec", "echo", "hello", "$HOME"],
    );
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello $HOME\n");
}

#[cfg(unix)]
#[test]
fn test_exec_prompt_denied_at_end_of_input() {
    let home = tempfile::tempdir().unwrap();
    let output = clawmate(
        home.path(),
        &["--approval", "prompt", "--json", "exec", "touch", "marker"],
    );
    assert!(!output.status.success());
    assert!(!home.path().join("marker").exists());

    let record = json(&output);
    assert_eq!(record["result"]["failure"]["kind"], "approval-denied");
}

#[cfg(unix)]
#[test]
fn test_exec_reports_exit_code() {
    let home = tempfile::tempdir().unwrap();
    let output = clawmate(home.path(), &["--yes", "exec", "sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(3));
}

#[cfg(unix)]
#[test]
fn test_run_plan_in_defer_mode() {
    let home = tempfile::tempdir().unwrap();
    let plan = home.path().join("plan.json");
    std::fs::write(
        &plan,
        r#"{
            "mode": "guided",
            "steps": [
                {"kind": "action", "command": "echo", "args": ["first"]},
                {"kind": "action", "command": "touch", "args": ["made"]}
            ]
        }"#,
    )
    .unwrap();

    let output = clawmate(
        home.path(),
        &["--approval", "defer", "--yes", "--json", "run", plan.to_str().unwrap()],
    );
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let report = json(&output);
    assert_eq!(report["status"], "completed");
    assert_eq!(report["records"].as_array().unwrap().len(), 2);
    assert_eq!(report["records"][0]["result"]["stdout"], "first\n");
    assert!(home.path().join("made").exists());
}

#[test]
fn test_info_json() {
    let home = tempfile::tempdir().unwrap();
    let output = clawmate(home.path(), &["--json", "info", "--check", "definitely-not-a-program"]);
    assert!(output.status.success());

    let info = json(&output);
    assert_eq!(info["health"]["container"], "disabled");
    assert_eq!(info["commands"]["definitely-not-a-program"], false);
    assert!(info["shell"]["os"].is_string());
}
