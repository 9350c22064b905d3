//! Pipeline integration tests - approval, host execution and stream sessions
//!
//! `cargo test -p claw-task --test pipeline_test`

#![cfg(unix)]

use claw_foundation::{ApprovalMode, ErrorKind, PipelineConfig, StreamSettings};
use claw_task::{
    ActionRequest, ActionState, ApprovalEvent, DecisionOutcome, ExecMode, ExecStatus, Pipeline,
    RunContext, SessionState, ShellAdapter,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(mode: ApprovalMode) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.approval.mode = mode;
    config.container.enabled = false;
    config.execution.kill_grace_ms = 500;
    config.stream.use_pty = false;
    config.stream.flush_grace_ms = 200;
    config
}

fn pipeline(mode: ApprovalMode) -> Arc<Pipeline> {
    Arc::new(Pipeline::with_runtime(config(mode), None).unwrap())
}

#[tokio::test]
async fn test_safe_action_runs_without_human_input() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("echo").with_args(["hello"]);

    let record = tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.execute(&request, &RunContext::default()),
    )
    .await
    .expect("safe action must not wait for a decision");

    assert_eq!(
        record.decision.as_ref().unwrap().outcome,
        DecisionOutcome::AutoApproved
    );
    assert!(record.result.is_success());
    assert_eq!(record.result.stdout, "hello\n");
    assert!(pipeline.gate().pending().is_empty());
    assert_eq!(pipeline.state(request.id()), Some(ActionState::Completed));
}

#[tokio::test]
async fn test_prompt_mode_never_runs_before_approval() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("marker");
    let pipeline = pipeline(ApprovalMode::Prompt);
    let mut events = pipeline.gate().subscribe();

    let request = ActionRequest::new("touch")
        .with_args(["marker"])
        .with_cwd(dir.path());
    let id = request.id();

    let task = {
        let pipeline = pipeline.clone();
        let request = request.clone();
        tokio::spawn(async move { pipeline.execute(&request, &RunContext::default()).await })
    };

    match events.recv().await.unwrap() {
        ApprovalEvent::Requested(entry) => assert_eq!(entry.request_id, id),
        other => panic!("unexpected event {:?}", other),
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!marker.exists());
    assert_eq!(pipeline.state(id), Some(ActionState::AwaitingApproval));

    pipeline.gate().resolve(id, true).unwrap();
    let record = task.await.unwrap();
    assert!(record.executed());
    assert!(record.result.is_success());
    assert!(marker.exists());
}

#[tokio::test]
async fn test_denied_action_is_a_failure_without_execution() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(ApprovalMode::Prompt);
    let mut events = pipeline.gate().subscribe();

    let request = ActionRequest::new("touch")
        .with_args(["marker"])
        .with_cwd(dir.path());
    let task = {
        let pipeline = pipeline.clone();
        let request = request.clone();
        tokio::spawn(async move { pipeline.execute(&request, &RunContext::default()).await })
    };

    let _ = events.recv().await.unwrap();
    pipeline.gate().resolve(request.id(), false).unwrap();
    let record = task.await.unwrap();

    assert!(record.is_denied());
    assert!(!record.executed());
    assert_eq!(record.result.error_kind(), Some(ErrorKind::ApprovalDenied));
    assert_eq!(pipeline.state(request.id()), Some(ActionState::Denied));
    assert!(!dir.path().join("marker").exists());
}

#[tokio::test]
async fn test_request_never_executes_twice() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("echo").with_args(["once"]);

    let first = pipeline.execute(&request, &RunContext::default()).await;
    assert!(first.result.is_success());

    let second = pipeline.execute(&request, &RunContext::default()).await;
    assert!(!second.executed());
    assert_eq!(second.result.error_kind(), Some(ErrorKind::InvalidRequest));
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_the_gate() {
    let pipeline = pipeline(ApprovalMode::Prompt);
    let request = ActionRequest::new("echo").with_cwd("/definitely/not/here");

    let record = pipeline.execute(&request, &RunContext::default()).await;
    assert!(record.decision.is_none());
    assert_eq!(record.result.error_kind(), Some(ErrorKind::InvalidRequest));
    assert!(pipeline.gate().pending().is_empty());
}

#[tokio::test]
async fn test_timeout_reports_timed_out_within_grace() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("sleep")
        .with_args(["5"])
        .with_timeout(Duration::from_secs(1));

    let started = Instant::now();
    let record = pipeline.execute(&request, &RunContext::default()).await;

    assert_eq!(record.result.status, ExecStatus::TimedOut);
    assert_eq!(record.result.exit_code, None);
    assert_eq!(record.result.error_kind(), Some(ErrorKind::ExecutionTimeout));
    assert!(started.elapsed() < Duration::from_millis(1000 + 500 + 700));
    assert_eq!(pipeline.state(request.id()), Some(ActionState::TimedOut));
}

#[tokio::test]
async fn test_stream_round_trip() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("sh").with_mode(ExecMode::Streamed);

    let session = pipeline
        .open_stream(&request, &RunContext::default())
        .await
        .unwrap();
    let mut stream = session.subscribe().unwrap();
    session.write(b"echo hello\nexit\n").await.unwrap();

    let mut output = String::new();
    while let Some(chunk) = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .unwrap()
    {
        output.push_str(&chunk.text());
    }
    assert_eq!(output, "hello\n");
    assert_eq!(session.wait().await.unwrap().code, Some(0));

    let result = pipeline.close_session(session.id()).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.exit_info().is_some());
    assert_eq!(result.status, ExecStatus::Completed);
    assert_eq!(result.exit_code, Some(0));

    // closed sessions deliver nothing and take no input
    assert!(session.subscribe().is_err());
    assert!(session.write(b"echo again\n").await.is_err());
    // closing again is a no-op
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_close_kills_running_session() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("sleep")
        .with_args(["30"])
        .with_mode(ExecMode::Streamed);
    let session = pipeline
        .open_stream(&request, &RunContext::default())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Open);

    let started = Instant::now();
    session.close().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(session.exit_info().is_some());
    assert_eq!(session.result().status, ExecStatus::Killed);
}

#[tokio::test]
async fn test_streamed_request_through_execute_is_drained() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("sh")
        .with_args(["-c", "echo out; echo err >&2"])
        .with_mode(ExecMode::Streamed);

    let record = pipeline.execute(&request, &RunContext::default()).await;
    assert!(record.executed());
    assert_eq!(record.result.mode, ExecMode::Streamed);
    assert_eq!(record.result.stdout, "out\n");
    assert_eq!(record.result.stderr, "err\n");
    assert_eq!(record.result.exit_code, Some(0));
}

#[tokio::test]
async fn test_ambiguous_request_is_sandboxed_not_run_on_host() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("touch a; touch b").with_cwd(dir.path());

    let record = pipeline.execute(&request, &RunContext::default()).await;
    assert!(record.classification.as_ref().unwrap().ambiguous);
    assert!(record.plan.as_ref().unwrap().is_container());
    // containers are disabled here, and there is no host fallback
    assert_eq!(record.result.error_kind(), Some(ErrorKind::SandboxUnavailable));
    assert!(!dir.path().join("a").exists());
}

#[tokio::test]
async fn test_cancel_origin_closes_sessions() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("sleep")
        .with_args(["30"])
        .with_mode(ExecMode::Streamed)
        .with_origin("agent-7");
    let session = pipeline
        .open_stream(&request, &RunContext::default())
        .await
        .unwrap();
    assert_eq!(pipeline.sessions_of("agent-7").len(), 1);

    assert_eq!(pipeline.cancel_origin("agent-7").await, 1);
    assert!(session.is_closed());
    assert!(pipeline.sessions_of("agent-7").is_empty());
    assert_eq!(pipeline.state(request.id()), Some(ActionState::Cancelled));
}

#[tokio::test]
async fn test_pty_session_echoes_output() {
    let adapter = ShellAdapter::new(
        &config(ApprovalMode::Auto).execution,
        &StreamSettings {
            use_pty: true,
            flush_grace_ms: 200,
            ..Default::default()
        },
    );
    let request = ActionRequest::new("echo").with_args(["pty-hello"]);
    let session = adapter.open_session(&request).await.unwrap();
    let mut stream = session.subscribe().unwrap();

    let mut output = String::new();
    let collect = async {
        while let Some(chunk) = stream.next().await {
            output.push_str(&chunk.text());
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .unwrap();
    assert!(output.contains("pty-hello"));

    let exit = session.wait().await.unwrap();
    assert_eq!(exit.code, Some(0));
    session.close().await.unwrap();
}

#[tokio::test]
async fn test_streamed_request_uses_default_timeout() {
    let mut config = config(ApprovalMode::Auto);
    config.execution.default_timeout_secs = 1;
    let pipeline = Pipeline::with_runtime(config, None).unwrap();
    let request = ActionRequest::new("sleep")
        .with_args(["4"])
        .with_mode(ExecMode::Streamed);

    let started = Instant::now();
    let record = pipeline.execute(&request, &RunContext::default()).await;

    assert_eq!(record.result.mode, ExecMode::Streamed);
    assert_eq!(record.result.status, ExecStatus::TimedOut);
    assert_eq!(record.result.error_kind(), Some(ErrorKind::ExecutionTimeout));
    assert!(started.elapsed() < Duration::from_millis(1000 + 500 + 1000));
    assert_eq!(pipeline.state(request.id()), Some(ActionState::TimedOut));
}

#[tokio::test]
async fn test_slow_subscriber_gets_all_output_after_exit() {
    let mut config = config(ApprovalMode::Auto);
    config.stream.chunk_size = 16;
    let pipeline = Pipeline::with_runtime(config, None).unwrap();
    let request = ActionRequest::new("seq")
        .with_args(["1", "2000"])
        .with_mode(ExecMode::Streamed);

    let session = pipeline
        .open_stream(&request, &RunContext::default())
        .await
        .unwrap();
    let mut stream = session.subscribe().unwrap();

    let mut output = Vec::new();
    let collect = async {
        while let Some(chunk) = stream.next().await {
            tokio::time::sleep(Duration::from_millis(3)).await;
            output.extend_from_slice(&chunk.data);
        }
    };
    tokio::time::timeout(Duration::from_secs(30), collect)
        .await
        .unwrap();

    let expected: String = (1..=2000).map(|n| format!("{}\n", n)).collect();
    assert_eq!(String::from_utf8(output).unwrap(), expected);
    assert_eq!(session.exit_info().unwrap().code, Some(0));

    // the session closes itself and its final state is recorded
    tokio::time::timeout(Duration::from_secs(5), session.closed())
        .await
        .unwrap();
    let mut state = pipeline.state(request.id());
    for _ in 0..50 {
        if state == Some(ActionState::Completed) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        state = pipeline.state(request.id());
    }
    assert_eq!(state, Some(ActionState::Completed));
}

#[tokio::test]
async fn test_subscriber_reattaches_by_session_id() {
    let pipeline = pipeline(ApprovalMode::Auto);
    let request = ActionRequest::new("sh").with_mode(ExecMode::Streamed);
    let session = pipeline
        .open_stream(&request, &RunContext::default())
        .await
        .unwrap();

    async fn read_until(stream: &mut claw_task::ChunkStream, needle: &str) -> String {
        let mut output = String::new();
        while !output.contains(needle) {
            let chunk = tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .unwrap()
                .unwrap();
            output.push_str(&chunk.text());
        }
        output
    }

    let mut first = session.subscribe().unwrap();
    session.write(b"echo one\n").await.unwrap();
    assert_eq!(read_until(&mut first, "one\n").await, "one\n");
    drop(first);

    // output produced while nobody listens is kept for the next subscriber
    session.write(b"echo two\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let found = pipeline.session(session.id()).unwrap();
    let mut second = found.subscribe().unwrap();
    assert_eq!(read_until(&mut second, "two\n").await, "two\n");

    let result = pipeline.close_session(session.id()).await.unwrap();
    assert_eq!(result.status, ExecStatus::Killed);
    assert!(pipeline.session(session.id()).is_none());
}
