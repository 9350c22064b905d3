//! Container Runtime Adapter - runs requests in ephemeral Docker containers
//!
//! Each request gets its own container:
//!
//! 1. Wait for a creation slot (global FIFO bound)
//! 2. Create an idle container with the plan's limits, mounting only the
//!    request's working directory
//! 3. Exec the command inside it
//! 4. Remove the container, on every exit path, then free the slot
//!
//! Failure to create or exec is reported as `sandbox-unavailable`. There is
//! no fallback to host execution.

use crate::action::{ActionFailure, ActionRequest, ActionResult, ExecMode, ExecStatus, Location};
use crate::executor::shell::{posix_argv, BoundedCapture};
use crate::executor::Executor;
use crate::sandbox::{PlanTarget, ResourceLimits, SandboxPlan};
use crate::stream::{
    raw_channel, ChunkSource, ExitInfo, InputSink, ProcessControl, RawChunk, SessionOptions,
    SessionParts, StreamSession,
};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use claw_foundation::{ContainerProfile, Error, PipelineConfig, Result, StreamSettings};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label put on every container this runtime creates
pub const MANAGED_LABEL: &str = "clawmate.managed";

// ============================================================================
// Backend
// ============================================================================

/// Everything needed to create one container
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub workdir: String,
    pub network: String,
    pub user: Option<String>,
    /// `KEY=VALUE` entries
    pub env: Vec<String>,
    /// `host:container:mode` entries
    pub binds: Vec<String>,
    pub cpu_shares: i64,
    pub memory_bytes: i64,
    pub pids_limit: Option<i64>,
    pub read_only_rootfs: bool,
    pub labels: HashMap<String, String>,
}

/// A command to exec inside a running container
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    /// Attach stdin for interactive sessions
    pub stdin: bool,
}

/// Output of a container exec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// A started exec
pub struct ExecHandle {
    pub exec_id: String,
    /// Ends when the exec'd process exits
    pub output: BoxStream<'static, Result<LogChunk>>,
    pub input: Option<Pin<Box<dyn AsyncWrite + Send>>>,
}

/// Container engine operations the runtime needs
#[async_trait]
pub trait ContainerBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn ping(&self) -> Result<()>;

    /// Create and start an idle container, returning its id
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    async fn exec(&self, container_id: &str, spec: &ExecSpec) -> Result<ExecHandle>;

    /// Exit code of a finished exec, `None` while still running
    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>>;

    /// Ask every process in the container to stop
    async fn terminate(&self, container_id: &str) -> Result<()>;

    async fn kill(&self, container_id: &str) -> Result<()>;

    /// Force-remove; removing a missing container is not an error
    async fn remove(&self, container_id: &str) -> Result<()>;
}

fn docker_error(context: &str, e: bollard::errors::Error) -> Error {
    Error::SandboxUnavailable(format!("{}: {}", context, e))
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 409,
            ..
        }
    )
}

/// Docker engine backend (honors `DOCKER_HOST`)
pub struct DockerBackend {
    docker: Docker,
    pull_missing: bool,
}

impl DockerBackend {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| docker_error("failed to connect to Docker", e))?;
        Ok(Self {
            docker,
            pull_missing: true,
        })
    }

    /// Fail instead of pulling images that are not present locally
    pub fn without_pull(mut self) -> Self {
        self.pull_missing = false;
        self
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.pull_missing {
            return Err(Error::SandboxUnavailable(format!(
                "image '{}' is not available locally",
                image
            )));
        }

        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            item.map_err(|e| docker_error(&format!("failed to pull '{}'", image), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| docker_error("Docker is not reachable", e))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let config = Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.workdir.clone()),
            env: Some(spec.env.clone()),
            user: spec.user.clone(),
            labels: Some(spec.labels.clone()),
            // Keep the container idle; commands run through exec
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            host_config: Some(HostConfig {
                binds: if spec.binds.is_empty() {
                    None
                } else {
                    Some(spec.binds.clone())
                },
                cpu_shares: Some(spec.cpu_shares),
                memory: Some(spec.memory_bytes),
                network_mode: Some(spec.network.clone()),
                pids_limit: spec.pids_limit,
                readonly_rootfs: Some(spec.read_only_rootfs),
                init: Some(true),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| docker_error("failed to create container", e))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self.remove(&response.id).await;
            return Err(docker_error("failed to start container", e));
        }
        Ok(response.id)
    }

    async fn exec(&self, container_id: &str, spec: &ExecSpec) -> Result<ExecHandle> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            attach_stdin: Some(spec.stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(|e| docker_error("failed to create exec", e))?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| docker_error("failed to start exec", e))?
        {
            StartExecResults::Attached { output, input } => {
                let output = output
                    .filter_map(|item| async move {
                        match item {
                            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                                Some(Ok(LogChunk::Stdout(message.to_vec())))
                            }
                            Ok(LogOutput::StdErr { message }) => {
                                Some(Ok(LogChunk::Stderr(message.to_vec())))
                            }
                            Ok(LogOutput::StdIn { .. }) => None,
                            Err(e) => Some(Err(Error::StreamDisconnected(e.to_string()))),
                        }
                    })
                    .boxed();
                Ok(ExecHandle {
                    exec_id: exec.id,
                    output,
                    input: if spec.stdin { Some(input) } else { None },
                })
            }
            StartExecResults::Detached => Err(Error::Internal(
                "exec started detached".to_string(),
            )),
        }
    }

    async fn exit_code(&self, exec_id: &str) -> Result<Option<i64>> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| docker_error("failed to inspect exec", e))?;
        if inspect.running == Some(true) {
            return Ok(None);
        }
        Ok(inspect.exit_code)
    }

    async fn terminate(&self, container_id: &str) -> Result<()> {
        // PID 1 is the init process; signal everything else
        let options = CreateExecOptions {
            cmd: Some(vec!["sh", "-c", "kill -s TERM -1"]),
            ..Default::default()
        };
        let exec = match self.docker.create_exec(container_id, options).await {
            Ok(exec) => exec,
            Err(e) if is_not_found(&e) => return Ok(()),
            Err(e) => return Err(docker_error("failed to signal container", e)),
        };
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map(|_| ())
            .map_err(|e| docker_error("failed to signal container", e))
    }

    async fn kill(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .kill_container(container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error("failed to kill container", e)),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(docker_error("failed to remove container", e)),
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// An existing container plus its creation slot. The container is removed
/// before the slot is freed, whether released explicitly or dropped.
pub struct ContainerLease {
    id: Option<String>,
    backend: Arc<dyn ContainerBackend>,
    permit: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl ContainerLease {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    /// Remove the container, then free the slot
    pub async fn release(mut self) {
        if let Some(id) = self.id.take() {
            if let Err(e) = self.backend.remove(&id).await {
                warn!("Failed to remove container {}: {}", id, e);
            } else {
                debug!("Removed container {}", id);
            }
        }
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
        self.permit.take();
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let backend = self.backend.clone();
        let permit = self.permit.take();
        let counters = self.counters.clone();
        let cleanup = async move {
            if let Err(e) = backend.remove(&id).await {
                warn!("Failed to remove container {}: {}", id, e);
            }
            counters.active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(cleanup);
            }
            Err(_) => warn!("Container lease dropped outside a runtime; container may leak"),
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Outcome of a direct container run
enum RunOutcome {
    Exited,
    TimedOut,
    Cancelled,
}

/// Runs sandbox plans through a [`ContainerBackend`]
pub struct ContainerRuntime {
    backend: Arc<dyn ContainerBackend>,
    slots: Arc<Semaphore>,
    max_slots: usize,
    counters: Arc<Counters>,
    available: AtomicBool,
    queue_timeout: Option<Duration>,
    kill_grace: Duration,
    max_output: usize,
    stream: StreamSettings,
}

impl ContainerRuntime {
    pub fn new(backend: Arc<dyn ContainerBackend>, config: &PipelineConfig) -> Self {
        let max_slots = config.container.max_concurrent_creations.max(1);
        Self {
            backend,
            slots: Arc::new(Semaphore::new(max_slots)),
            max_slots,
            counters: Arc::new(Counters {
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
            available: AtomicBool::new(true),
            queue_timeout: config.container.queue_timeout(),
            kill_grace: config.execution.kill_grace(),
            max_output: config.execution.max_output_bytes,
            stream: config.stream.clone(),
        }
    }

    /// Connect to the local Docker engine
    pub fn docker(config: &PipelineConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(DockerBackend::connect()?), config))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Check the engine and remember the answer
    pub async fn ping(&self) -> Result<()> {
        let result = self.backend.ping().await;
        self.available.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    /// Containers currently holding a slot
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous containers seen
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.max_slots
    }

    /// Requests waiting for a slot are served in arrival order
    pub async fn acquire(&self, spec: &ContainerSpec) -> Result<ContainerLease> {
        let acquire = self.slots.clone().acquire_owned();
        let permit = match self.queue_timeout {
            Some(limit) => tokio::time::timeout(limit, acquire).await.map_err(|_| {
                Error::ResourceExhausted(format!(
                    "no container slot freed within {:.1}s",
                    limit.as_secs_f64()
                ))
            })?,
            None => acquire.await,
        }
        .map_err(|_| Error::Internal("container slots closed".to_string()))?;

        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);

        match self.backend.create(spec).await {
            Ok(id) => {
                debug!("Created container {} ({})", id, spec.name);
                Ok(ContainerLease {
                    id: Some(id),
                    backend: self.backend.clone(),
                    permit: Some(permit),
                    counters: self.counters.clone(),
                })
            }
            Err(e) => {
                self.counters.active.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                Err(unavailable(e))
            }
        }
    }

    /// Container spec for a request under a profile and limits
    pub fn container_spec(
        &self,
        request: &ActionRequest,
        profile: &ContainerProfile,
        limits: &ResourceLimits,
    ) -> Result<ContainerSpec> {
        // only a declared working directory is ever mounted
        let binds = match request.cwd() {
            Some(cwd) => {
                let host_dir: PathBuf = std::fs::canonicalize(cwd)?;
                vec![format!("{}:{}:rw", host_dir.display(), profile.workdir)]
            }
            None => Vec::new(),
        };

        let mut env: Vec<String> = request
            .env()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        env.sort();

        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert("clawmate.request".to_string(), request.id().to_string());
        labels.insert("clawmate.origin".to_string(), request.origin().to_string());

        Ok(ContainerSpec {
            name: format!("clawmate-{}", request.id()),
            image: profile.image.clone(),
            workdir: profile.workdir.clone(),
            network: profile.network.clone(),
            user: profile.user.clone(),
            env,
            binds,
            cpu_shares: limits.cpu_shares,
            memory_bytes: limits.memory_bytes,
            pids_limit: profile.pids_limit,
            read_only_rootfs: profile.read_only_rootfs,
            labels,
        })
    }

    fn unpack<'a>(plan: &'a SandboxPlan) -> Result<(&'a ContainerProfile, &'a ResourceLimits)> {
        match &plan.target {
            PlanTarget::Container { profile, limits } => Ok((profile, limits)),
            PlanTarget::Host => Err(Error::InvalidRequest(
                "container runtime received a host plan".to_string(),
            )),
        }
    }

    /// Stop whatever runs in a container: TERM, grace, KILL
    async fn stop(&self, container_id: &str, exec_id: &str) {
        if let Err(e) = self.backend.terminate(container_id).await {
            debug!("terminate failed for {}: {}", container_id, e);
        }
        let deadline = Instant::now() + self.kill_grace;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.backend.exit_code(exec_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!("Container {} ignored termination, killing", container_id);
        if let Err(e) = self.backend.kill(container_id).await {
            warn!("kill failed for {}: {}", container_id, e);
        }
    }
}

fn unavailable(e: Error) -> Error {
    match e {
        Error::SandboxUnavailable(_) => e,
        other => Error::SandboxUnavailable(other.to_string()),
    }
}

#[async_trait]
impl Executor for ContainerRuntime {
    async fn run(
        &self,
        request: &ActionRequest,
        plan: &SandboxPlan,
        cancel: &CancellationToken,
    ) -> Result<ActionResult> {
        let (profile, limits) = Self::unpack(plan)?;
        let spec = self.container_spec(request, profile, limits)?;
        let started = Instant::now();

        let lease = tokio::select! {
            lease = self.acquire(&spec) => lease?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        let container_id = lease.id().to_string();
        info!(
            request = %request.id().short(),
            container = %container_id,
            "running in container"
        );

        let exec = ExecSpec {
            cmd: posix_argv(&profile.shell, request.command(), request.args()),
            stdin: false,
        };
        let handle = match self.backend.exec(&container_id, &exec).await {
            Ok(handle) => handle,
            Err(e) => {
                lease.release().await;
                return Err(unavailable(e));
            }
        };

        let mut stdout = BoundedCapture::new(self.max_output);
        let mut stderr = BoundedCapture::new(self.max_output);
        let mut output = handle.output;
        let outcome = {
            let drain = async {
                while let Some(item) = output.next().await {
                    match item {
                        Ok(LogChunk::Stdout(data)) => stdout.push(&data),
                        Ok(LogChunk::Stderr(data)) => stderr.push(&data),
                        Err(e) => {
                            warn!("container output interrupted: {}", e);
                            break;
                        }
                    }
                }
            };
            tokio::select! {
                _ = drain => RunOutcome::Exited,
                _ = tokio::time::sleep(limits.timeout()) => RunOutcome::TimedOut,
                _ = cancel.cancelled() => RunOutcome::Cancelled,
            }
        };
        drop(output);

        let (exit_code, status, failure) = match outcome {
            RunOutcome::Exited => match self.backend.exit_code(&handle.exec_id).await {
                Ok(Some(code)) => (Some(code as i32), ExecStatus::Completed, None),
                Ok(None) | Err(_) => (
                    None,
                    ExecStatus::Failed,
                    Some(ActionFailure::from(&Error::Internal(
                        "container exec finished without an exit code".to_string(),
                    ))),
                ),
            },
            RunOutcome::TimedOut => {
                warn!(
                    "Container command timed out after {:.1}s",
                    limits.timeout().as_secs_f64()
                );
                self.stop(&container_id, &handle.exec_id).await;
                (
                    None,
                    ExecStatus::TimedOut,
                    Some(ActionFailure::from(&Error::ExecutionTimeout(format!(
                        "command exceeded its {}ms limit",
                        limits.timeout_ms
                    )))),
                )
            }
            RunOutcome::Cancelled => {
                self.stop(&container_id, &handle.exec_id).await;
                (
                    None,
                    ExecStatus::Killed,
                    Some(ActionFailure::from(&Error::Cancelled)),
                )
            }
        };
        lease.release().await;

        let (stdout, stdout_truncated) = stdout.finish();
        let (stderr, stderr_truncated) = stderr.finish();
        Ok(ActionResult {
            request_id: request.id(),
            exit_code,
            status,
            mode: ExecMode::Direct,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration_ms: started.elapsed().as_millis() as u64,
            location: Location::Container(container_id),
            failure,
        })
    }

    async fn open(&self, request: &ActionRequest, plan: &SandboxPlan) -> Result<StreamSession> {
        let (profile, limits) = Self::unpack(plan)?;
        let spec = self.container_spec(request, profile, limits)?;
        let lease = self.acquire(&spec).await?;
        let container_id = lease.id().to_string();

        let exec = ExecSpec {
            cmd: posix_argv(&profile.shell, request.command(), request.args()),
            stdin: true,
        };
        let handle = match self.backend.exec(&container_id, &exec).await {
            Ok(handle) => handle,
            Err(e) => {
                lease.release().await;
                return Err(unavailable(e));
            }
        };

        let (raw_tx, raw_rx) = raw_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let backend = self.backend.clone();
        let exec_id = handle.exec_id.clone();
        let mut output = handle.output;

        // Owns the lease: the container goes away once output ends
        tokio::spawn(async move {
            let mut forwarding = true;
            while let Some(item) = output.next().await {
                let chunk = match item {
                    Ok(LogChunk::Stdout(data)) => RawChunk {
                        source: ChunkSource::Stdout,
                        data,
                    },
                    Ok(LogChunk::Stderr(data)) => RawChunk {
                        source: ChunkSource::Stderr,
                        data,
                    },
                    Err(e) => {
                        warn!("container output interrupted: {}", e);
                        break;
                    }
                };
                if forwarding && raw_tx.send(chunk).await.is_err() {
                    forwarding = false;
                }
            }
            drop(raw_tx);
            let code = backend
                .exit_code(&exec_id)
                .await
                .ok()
                .flatten()
                .map(|c| c as i32);
            let _ = exit_tx.send(Some(ExitInfo { code }));
            lease.release().await;
        });

        let control = Arc::new(ContainerControl {
            backend: self.backend.clone(),
            container_id: container_id.clone(),
        });
        let options = SessionOptions::from_settings(&self.stream, self.kill_grace)
            .with_timeout(Some(limits.timeout()));
        Ok(StreamSession::start(
            SessionParts {
                request_id: request.id(),
                location: Location::Container(container_id),
                raw: raw_rx,
                input: handle.input.map(InputSink::Async),
                process: control,
                exit: exit_rx,
            },
            options,
        ))
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn name(&self) -> &'static str {
        "container"
    }
}

struct ContainerControl {
    backend: Arc<dyn ContainerBackend>,
    container_id: String,
}

#[async_trait]
impl ProcessControl for ContainerControl {
    async fn terminate(&self) -> Result<()> {
        self.backend.terminate(&self.container_id).await
    }

    async fn kill(&self) -> Result<()> {
        self.backend.kill(&self.container_id).await
    }

    fn describe(&self) -> String {
        format!("container {}", self.container_id)
    }
}
