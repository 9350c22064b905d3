//! Container runtime tests against an in-memory backend
//!
//! `cargo test -p claw-task --test container_test`

use async_trait::async_trait;
use claw_foundation::{
    ApprovalMode, ContainerProfile, Error, ErrorKind, LimitDefaults, PipelineConfig, Result,
    RiskTier, SandboxMode,
};
use claw_task::{
    ActionRequest, ActionState, ContainerBackend, ContainerRuntime, ContainerSpec, ExecHandle,
    ExecMode, ExecSpec, ExecStatus, Executor, Location, LogChunk, Pipeline, ResourceLimits,
    RunContext, SandboxPlan,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records every call; exec output arrives after `hold`
#[derive(Default)]
struct FakeBackend {
    fail_create: bool,
    hold: Duration,
    created: Mutex<Vec<ContainerSpec>>,
    removed: Mutex<Vec<String>>,
    execs: Mutex<Vec<Vec<String>>>,
    live: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeBackend {
    fn holding(hold: Duration) -> Self {
        Self {
            hold,
            ..Default::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail_create: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ping(&self) -> Result<()> {
        if self.fail_create {
            Err(Error::SandboxUnavailable("daemon down".into()))
        } else {
            Ok(())
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_create {
            return Err(Error::SandboxUnavailable("daemon down".into()));
        }
        let mut created = self.created.lock();
        created.push(spec.clone());
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(format!("fake-{}", created.len()))
    }

    async fn exec(&self, _container_id: &str, spec: &ExecSpec) -> Result<ExecHandle> {
        self.execs.lock().push(spec.cmd.clone());
        let hold = self.hold;
        let output = futures::stream::once(async move {
            tokio::time::sleep(hold).await;
            Ok(LogChunk::Stdout(b"ok\n".to_vec()))
        })
        .chain(futures::stream::once(async {
            Ok(LogChunk::Stderr(b"warn\n".to_vec()))
        }))
        .boxed();
        Ok(ExecHandle {
            exec_id: "exec-1".to_string(),
            output,
            input: None,
        })
    }

    async fn exit_code(&self, _exec_id: &str) -> Result<Option<i64>> {
        Ok(Some(0))
    }

    async fn terminate(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn kill(&self, _container_id: &str) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.removed.lock().push(container_id.to_string());
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

fn config(bound: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.container.max_concurrent_creations = bound;
    config.execution.kill_grace_ms = 300;
    config
}

fn container_plan(request: &ActionRequest) -> SandboxPlan {
    SandboxPlan::container(
        request.id(),
        ContainerProfile::default(),
        ResourceLimits::from_defaults(&LimitDefaults::default()),
        "test",
    )
}

#[tokio::test]
async fn test_creation_bound_and_fifo_order() {
    let bound = 2;
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::holding(Duration::from_millis(100)));
    let runtime = ContainerRuntime::new(backend.clone(), &config(bound));

    let requests: Vec<ActionRequest> = (0..bound + 5)
        .map(|i| {
            ActionRequest::new("echo")
                .with_args([i.to_string()])
                .with_cwd(dir.path())
        })
        .collect();
    let plans: Vec<SandboxPlan> = requests.iter().map(container_plan).collect();
    let cancel = CancellationToken::new();

    let runs = requests
        .iter()
        .zip(plans.iter())
        .map(|(request, plan)| runtime.run(request, plan, &cancel));
    let results = futures::future::join_all(runs).await;

    for result in &results {
        let result = result.as_ref().unwrap();
        assert_eq!(result.status, ExecStatus::Completed);
        assert_eq!(result.stdout, "ok\n");
        assert_eq!(result.stderr, "warn\n");
        assert!(matches!(result.location, Location::Container(_)));
    }

    assert_eq!(backend.peak.load(Ordering::SeqCst), bound);
    assert_eq!(runtime.peak(), bound);
    assert_eq!(runtime.active(), 0);
    assert_eq!(backend.live.load(Ordering::SeqCst), 0);
    assert_eq!(backend.removed.lock().len(), bound + 5);

    let order: Vec<String> = backend.created.lock().iter().map(|s| s.name.clone()).collect();
    let expected: Vec<String> = requests
        .iter()
        .map(|r| format!("clawmate-{}", r.id()))
        .collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn test_spec_mounts_only_the_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::default());
    let runtime = ContainerRuntime::new(backend.clone(), &config(1));
    let request = ActionRequest::new("ls")
        .with_args(["-la", "my dir"])
        .with_cwd(dir.path())
        .with_env("MODE", "test");
    let plan = container_plan(&request);

    runtime
        .run(&request, &plan, &CancellationToken::new())
        .await
        .unwrap();

    let spec = backend.created.lock()[0].clone();
    let host = std::fs::canonicalize(dir.path()).unwrap();
    assert_eq!(spec.binds, vec![format!("{}:/workspace:rw", host.display())]);
    assert_eq!(spec.env, vec!["MODE=test".to_string()]);
    assert_eq!(spec.network, "none");
    assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);

    let cmd = backend.execs.lock()[0].clone();
    assert_eq!(cmd, vec!["/bin/sh", "-c", "ls \"$@\"", "/bin/sh", "-la", "my dir"]);
}

#[tokio::test]
async fn test_spec_without_working_directory_mounts_nothing() {
    let backend = Arc::new(FakeBackend::default());
    let runtime = ContainerRuntime::new(backend.clone(), &config(1));
    let request = ActionRequest::new("ls");
    let plan = container_plan(&request);

    runtime
        .run(&request, &plan, &CancellationToken::new())
        .await
        .unwrap();

    let spec = backend.created.lock()[0].clone();
    assert!(spec.binds.is_empty());
    assert_eq!(spec.workdir, "/workspace");
}

#[tokio::test]
async fn test_timeout_and_cancel_still_remove_container() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::holding(Duration::from_secs(30)));
    let runtime = ContainerRuntime::new(backend.clone(), &config(1));

    let request = ActionRequest::new("sleep")
        .with_args(["30"])
        .with_cwd(dir.path());
    let mut plan = container_plan(&request);
    if let claw_task::PlanTarget::Container { limits, .. } = &mut plan.target {
        limits.timeout_ms = 200;
    }
    let result = runtime
        .run(&request, &plan, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, ExecStatus::TimedOut);
    assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionTimeout));
    assert_eq!(backend.removed.lock().len(), 1);

    let request = ActionRequest::new("sleep")
        .with_args(["30"])
        .with_cwd(dir.path());
    let plan = container_plan(&request);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = runtime.run(&request, &plan, &cancel).await.unwrap();
    assert_eq!(result.status, ExecStatus::Killed);
    assert_eq!(backend.removed.lock().len(), 2);
    assert_eq!(runtime.active(), 0);
}

#[tokio::test]
async fn test_dropped_run_still_removes_container() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::holding(Duration::from_secs(30)));
    let runtime = ContainerRuntime::new(backend.clone(), &config(1));
    let request = ActionRequest::new("sleep").with_cwd(dir.path());
    let plan = container_plan(&request);
    let cancel = CancellationToken::new();

    let run = runtime.run(&request, &plan, &cancel);
    assert!(tokio::time::timeout(Duration::from_millis(100), run)
        .await
        .is_err());

    // the lease cleans up in the background
    for _ in 0..50 {
        if backend.removed.lock().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(backend.removed.lock().len(), 1);
    assert_eq!(runtime.active(), 0);
}

#[tokio::test]
async fn test_queue_timeout_is_resource_exhausted() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::holding(Duration::from_secs(2)));
    let mut config = config(1);
    config.container.queue_timeout_secs = Some(1);
    let runtime = ContainerRuntime::new(backend, &config);
    let cancel = CancellationToken::new();

    let first = ActionRequest::new("sleep").with_cwd(dir.path());
    let second = ActionRequest::new("sleep").with_cwd(dir.path());
    let (first_plan, second_plan) = (container_plan(&first), container_plan(&second));

    let (a, b) = tokio::join!(
        runtime.run(&first, &first_plan, &cancel),
        runtime.run(&second, &second_plan, &cancel)
    );
    assert!(a.is_ok());
    assert_eq!(b.unwrap_err().kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn test_streamed_container_session() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(FakeBackend::holding(Duration::from_millis(50)));
    let mut config = config(1);
    config.stream.flush_grace_ms = 100;
    let runtime = ContainerRuntime::new(backend.clone(), &config);
    let request = ActionRequest::new("echo")
        .with_cwd(dir.path())
        .with_mode(ExecMode::Streamed);
    let plan = container_plan(&request);

    let session = runtime.open(&request, &plan).await.unwrap();
    assert!(matches!(session.location(), Location::Container(_)));
    let chunks: Vec<_> = session.subscribe().unwrap().collect().await;
    let text: String = chunks.iter().map(|c| c.text().into_owned()).collect();
    assert_eq!(text, "ok\nwarn\n");
    assert_eq!(session.wait().await.unwrap().code, Some(0));

    session.close().await.unwrap();
    for _ in 0..50 {
        if runtime.active() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(runtime.active(), 0);
    assert_eq!(backend.removed.lock().len(), 1);
}

#[tokio::test]
async fn test_creation_failure_never_falls_back_to_host() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(2);
    config.approval.mode = ApprovalMode::Auto;
    config.approval.auto_approve_ceiling = RiskTier::Destructive;
    config.sandbox.mode = SandboxMode::On;
    let backend = Arc::new(FakeBackend::failing());
    let runtime = Arc::new(ContainerRuntime::new(backend, &config));
    let pipeline = Pipeline::with_runtime(config, Some(runtime.clone())).unwrap();
    assert!(runtime.ping().await.is_err());

    let request = ActionRequest::new("touch")
        .with_args(["marker"])
        .with_cwd(dir.path())
        .with_tier(RiskTier::Destructive);
    let record = pipeline.execute(&request, &RunContext::default()).await;

    assert!(record.plan.as_ref().unwrap().is_container());
    assert_eq!(record.result.error_kind(), Some(ErrorKind::SandboxUnavailable));
    assert_eq!(record.result.exit_code, None);
    assert!(!dir.path().join("marker").exists());
    assert!(matches!(
        pipeline.state(request.id()),
        Some(ActionState::Failed(_))
    ));
    assert!(!runtime.is_available());
    assert_eq!(runtime.active(), 0);
}
