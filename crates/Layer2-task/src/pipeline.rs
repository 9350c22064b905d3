//! Execution pipeline - approval gate → sandbox selector → executor
//!
//! Features:
//! - Validation and classification before anything runs
//! - Action lifecycle tracking (an action never executes twice)
//! - Host or container execution per sandbox plan, never host as a fallback
//! - Registry of live stream sessions by id and by origin
//! - Per-origin cleanup of finished bookkeeping
//!
//! Approval and execution are separate steps so a caller can gate a whole
//! round of requests before any of them takes an execution slot.

use crate::action::{ActionId, ActionRequest, ActionResult, ExecMode, ExecStatus};
use crate::approval::{ApprovalDecision, ApprovalGate, Classification, Ticket};
use crate::executor::{BoundedCapture, ContainerRuntime, Executor, ShellAdapter};
use crate::sandbox::{SandboxPlan, SandboxSelector};
use crate::state::ActionState;
use crate::stream::{ChunkSource, SessionId, StreamSession};
use claw_foundation::{Error, PipelineConfig, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call execution context
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// The owning session runs in swarm mode
    pub swarm: bool,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            swarm: false,
            cancel,
        }
    }

    pub fn swarm(mut self, swarm: bool) -> Self {
        self.swarm = swarm;
        self
    }
}

/// A terminal approval for one request
#[derive(Debug, Clone)]
pub struct Approval {
    pub classification: Classification,
    pub decision: ApprovalDecision,
}

/// Everything the pipeline knows about one processed request
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub request: ActionRequest,
    pub classification: Option<Classification>,
    pub decision: Option<ApprovalDecision>,
    pub plan: Option<SandboxPlan>,
    pub result: ActionResult,
}

impl ActionRecord {
    /// The action actually ran (as opposed to being refused before execution)
    pub fn executed(&self) -> bool {
        self.decision.as_ref().is_some_and(|d| d.is_approved()) && self.plan.is_some()
    }

    pub fn is_denied(&self) -> bool {
        self.decision.as_ref().is_some_and(|d| !d.is_approved())
    }
}

struct SessionEntry {
    session: StreamSession,
    origin: String,
}

struct Tracked {
    state: ActionState,
    origin: String,
}

#[derive(Default)]
struct Ledger {
    live: HashMap<ActionId, Tracked>,
    /// Requests that ran before their origin was forgotten
    executed: HashSet<ActionId>,
}

impl Ledger {
    fn set(&mut self, id: ActionId, state: ActionState) {
        if let Some(tracked) = self.live.get_mut(&id) {
            debug!(request = %id.short(), state = %state, "action state");
            tracked.state = state;
        }
    }

    fn has_executed(&self, id: ActionId) -> bool {
        self.executed.contains(&id)
            || self.live.get(&id).is_some_and(|t| t.state.has_executed())
    }
}

/// Lifecycle state for a finished result
fn final_state(result: &ActionResult) -> ActionState {
    match result.status {
        ExecStatus::Completed => ActionState::Completed,
        ExecStatus::TimedOut => ActionState::TimedOut,
        ExecStatus::Killed => ActionState::Cancelled,
        ExecStatus::Failed => ActionState::Failed(
            result
                .failure
                .as_ref()
                .map(|f| f.cause.clone())
                .unwrap_or_else(|| "execution failed".to_string()),
        ),
    }
}

/// The command execution and approval pipeline
pub struct Pipeline {
    config: PipelineConfig,
    gate: Arc<ApprovalGate>,
    selector: SandboxSelector,
    host: Arc<ShellAdapter>,
    containers: Option<Arc<ContainerRuntime>>,
    ledger: Arc<Mutex<Ledger>>,
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
}

impl Pipeline {
    /// Build from configuration, connecting to Docker when containers are enabled
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let containers = if config.container.enabled {
            match ContainerRuntime::docker(&config) {
                Ok(runtime) => Some(Arc::new(runtime)),
                Err(e) => {
                    warn!("Container runtime unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self::with_runtime(config, containers)
    }

    /// Build with an explicit container runtime (or none)
    pub fn with_runtime(
        config: PipelineConfig,
        containers: Option<Arc<ContainerRuntime>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            gate: Arc::new(ApprovalGate::new(&config.approval)?),
            selector: SandboxSelector::new(&config.sandbox),
            host: Arc::new(ShellAdapter::new(&config.execution, &config.stream)),
            containers,
            ledger: Arc::new(Mutex::new(Ledger::default())),
            sessions: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn selector(&self) -> &SandboxSelector {
        &self.selector
    }

    pub fn host(&self) -> &Arc<ShellAdapter> {
        &self.host
    }

    pub fn container_runtime(&self) -> Option<&Arc<ContainerRuntime>> {
        self.containers.as_ref()
    }

    /// Lifecycle state of a request seen by this pipeline, until its origin
    /// is forgotten
    pub fn state(&self, id: ActionId) -> Option<ActionState> {
        self.ledger.lock().live.get(&id).map(|t| t.state.clone())
    }

    fn set_state(&self, id: ActionId, state: ActionState) {
        self.ledger.lock().set(id, state);
    }

    // ========================================================================
    // Approval
    // ========================================================================

    /// Validate a request and hand it to the approval gate
    pub fn submit(&self, request: &ActionRequest) -> Result<Ticket> {
        request.validate()?;
        {
            let mut ledger = self.ledger.lock();
            if ledger.live.contains_key(&request.id()) || ledger.executed.contains(&request.id()) {
                return Err(Error::InvalidRequest(format!(
                    "request {} was already submitted",
                    request.id()
                )));
            }
            ledger.live.insert(
                request.id(),
                Tracked {
                    state: ActionState::AwaitingApproval,
                    origin: request.origin().to_string(),
                },
            );
        }
        match self.gate.submit(request) {
            Ok(ticket) => Ok(ticket),
            Err(e) => {
                self.set_state(request.id(), ActionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Wait for a submitted ticket to become terminal
    pub async fn await_approval(&self, ticket: Ticket) -> Approval {
        let classification = ticket.classification().clone();
        let id = ticket.request_id();
        let decision = self.gate.wait(ticket).await;
        self.set_state(
            id,
            if decision.is_approved() {
                ActionState::Queued
            } else {
                ActionState::Denied
            },
        );
        Approval {
            classification,
            decision,
        }
    }

    /// Submit and wait in one step
    pub async fn authorize(&self, request: &ActionRequest) -> Result<Approval> {
        let ticket = self.submit(request)?;
        Ok(self.await_approval(ticket).await)
    }

    // ========================================================================
    // Execution
    // ========================================================================

    fn begin(&self, request: &ActionRequest, approval: &Approval, swarm: bool) -> Result<SandboxPlan> {
        let id = request.id();
        if !approval.decision.is_approved() || !self.gate.is_approved(id) {
            return Err(Error::ApprovalDenied(format!(
                "request {} has no approving decision",
                id
            )));
        }
        {
            let mut ledger = self.ledger.lock();
            if ledger.has_executed(id) {
                return Err(Error::InvalidRequest(format!(
                    "request {} has already executed",
                    id
                )));
            }
            let tracked = ledger.live.entry(id).or_insert_with(|| Tracked {
                state: ActionState::Queued,
                origin: request.origin().to_string(),
            });
            tracked.state = ActionState::Running;
        }
        Ok(self.selector.plan(request, &approval.classification, swarm))
    }

    fn executor_for(&self, plan: &SandboxPlan) -> Result<&dyn Executor> {
        if plan.is_container() {
            match &self.containers {
                Some(runtime) => Ok(runtime.as_ref()),
                None => Err(Error::SandboxUnavailable(
                    "container execution is disabled or the runtime is unreachable".to_string(),
                )),
            }
        } else {
            Ok(self.host.as_ref())
        }
    }

    fn finish(&self, result: &ActionResult) {
        self.set_state(result.request_id, final_state(result));
    }

    /// Run an approved request to completion. Streamed requests are drained
    /// into the result.
    pub async fn execute_approved(
        &self,
        request: &ActionRequest,
        approval: &Approval,
        ctx: &RunContext,
    ) -> (Option<SandboxPlan>, ActionResult) {
        let plan = match self.begin(request, approval, ctx.swarm) {
            Ok(plan) => plan,
            Err(e) => return (None, ActionResult::failed(request.id(), &e)),
        };
        info!(
            request = %request.id().short(),
            target = ?plan.execution_target(),
            "executing: {}",
            request.command_line()
        );

        let result = match self.executor_for(&plan) {
            Ok(executor) => match request.mode() {
                ExecMode::Direct => executor.run(request, &plan, &ctx.cancel).await,
                ExecMode::Streamed => self.drain(executor, request, &plan, ctx).await,
            },
            Err(e) => Err(e),
        };
        let result = result.unwrap_or_else(|e| {
            warn!(request = %request.id().short(), "execution failed: {}", e);
            ActionResult::failed(request.id(), &e).with_mode(request.mode())
        });
        self.finish(&result);
        (Some(plan), result)
    }

    async fn drain(
        &self,
        executor: &dyn Executor,
        request: &ActionRequest,
        plan: &SandboxPlan,
        ctx: &RunContext,
    ) -> Result<ActionResult> {
        let session = executor.open(request, plan).await?;
        self.register(&session, request.origin());
        let mut stream = session.subscribe()?;

        let limit = self.config.execution.max_output_bytes;
        let mut stdout = BoundedCapture::new(limit);
        let mut stderr = BoundedCapture::new(limit);
        let mut cancelled = false;
        loop {
            tokio::select! {
                chunk = stream.next() => match chunk {
                    Some(chunk) => match chunk.source {
                        ChunkSource::Stderr => stderr.push(&chunk.data),
                        ChunkSource::Stdout | ChunkSource::Pty => stdout.push(&chunk.data),
                    },
                    None => break,
                },
                _ = ctx.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
            }
        }
        drop(stream);
        if !cancelled {
            // output ended; give the process a moment to be reaped
            let _ = tokio::time::timeout(self.config.execution.kill_grace(), session.wait()).await;
        }
        session.close().await?;
        self.sessions.lock().remove(&session.id());

        let mut result = session.result();
        (result.stdout, result.stdout_truncated) = stdout.finish();
        (result.stderr, result.stderr_truncated) = stderr.finish();
        Ok(result)
    }

    /// Authorize and execute one request. Every failure is reported in the
    /// record's result.
    pub async fn execute(&self, request: &ActionRequest, ctx: &RunContext) -> ActionRecord {
        let approval = tokio::select! {
            approval = self.authorize(request) => approval,
            _ = ctx.cancel.cancelled() => {
                self.gate.abandon(request.origin());
                self.set_state(request.id(), ActionState::Cancelled);
                Err(Error::Cancelled)
            }
        };
        let approval = match approval {
            Ok(approval) => approval,
            Err(e) => {
                return ActionRecord {
                    request: request.clone(),
                    classification: None,
                    decision: self.gate.decision(request.id()),
                    plan: None,
                    result: ActionResult::failed(request.id(), &e).with_mode(request.mode()),
                }
            }
        };

        if !approval.decision.is_approved() {
            let reason = approval
                .decision
                .reason
                .clone()
                .unwrap_or_else(|| "denied by approval gate".to_string());
            info!(request = %request.id().short(), "denied: {}", reason);
            return ActionRecord {
                request: request.clone(),
                classification: Some(approval.classification),
                decision: Some(approval.decision),
                plan: None,
                result: ActionResult::failed(request.id(), &Error::ApprovalDenied(reason))
                    .with_mode(request.mode()),
            };
        }

        let (plan, result) = self.execute_approved(request, &approval, ctx).await;
        ActionRecord {
            request: request.clone(),
            classification: Some(approval.classification),
            decision: Some(approval.decision),
            plan,
            result,
        }
    }

    // ========================================================================
    // Stream sessions
    // ========================================================================

    /// Authorize a request and open a live session for it
    pub async fn open_stream(&self, request: &ActionRequest, ctx: &RunContext) -> Result<StreamSession> {
        let approval = self.authorize(request).await?;
        if !approval.decision.is_approved() {
            return Err(Error::ApprovalDenied(
                approval
                    .decision
                    .reason
                    .unwrap_or_else(|| "denied by approval gate".to_string()),
            ));
        }
        let plan = self.begin(request, &approval, ctx.swarm)?;
        let opened = match self.executor_for(&plan) {
            Ok(executor) => executor.open(request, &plan).await,
            Err(e) => Err(e),
        };
        match opened {
            Ok(session) => {
                self.register(&session, request.origin());
                self.watch_session(&session);
                Ok(session)
            }
            Err(e) => {
                self.set_state(request.id(), ActionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn register(&self, session: &StreamSession, origin: &str) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, entry| !entry.session.is_closed());
        sessions.insert(
            session.id(),
            SessionEntry {
                session: session.clone(),
                origin: origin.to_string(),
            },
        );
    }

    /// Record the final state whenever the session closes, including when
    /// it closes on its own after the process exits
    fn watch_session(&self, session: &StreamSession) {
        let ledger = self.ledger.clone();
        let session = session.clone();
        tokio::spawn(async move {
            session.closed().await;
            let result = session.result();
            ledger.lock().set(result.request_id, final_state(&result));
        });
    }

    /// Look up a live session, e.g. to attach a new subscriber
    pub fn session(&self, id: SessionId) -> Option<StreamSession> {
        self.sessions.lock().get(&id).map(|e| e.session.clone())
    }

    /// Live sessions of one origin
    pub fn sessions_of(&self, origin: &str) -> Vec<StreamSession> {
        self.sessions
            .lock()
            .values()
            .filter(|e| e.origin == origin && !e.session.is_closed())
            .map(|e| e.session.clone())
            .collect()
    }

    /// Close a session and record its final result
    pub async fn close_session(&self, id: SessionId) -> Result<ActionResult> {
        let entry = self
            .sessions
            .lock()
            .remove(&id)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown stream session {}", id)))?;
        entry.session.close().await?;
        let result = entry.session.result();
        self.finish(&result);
        Ok(result)
    }

    /// Close every session of one origin; returns how many were closed
    pub async fn close_sessions(&self, origin: &str) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .lock()
            .iter()
            .filter(|(_, e)| e.origin == origin)
            .map(|(id, _)| *id)
            .collect();
        let closes = ids.into_iter().map(|id| self.close_session(id));
        futures::future::join_all(closes)
            .await
            .into_iter()
            .filter(|r| r.is_ok())
            .count()
    }

    /// Deny everything an origin still has waiting and close its sessions
    pub async fn cancel_origin(&self, origin: &str) -> usize {
        let abandoned = self.gate.abandon(origin);
        let closed = self.close_sessions(origin).await;
        if abandoned + closed > 0 {
            info!(
                "Cancelled origin {}: {} approvals abandoned, {} sessions closed",
                origin, abandoned, closed
            );
        }
        abandoned + closed
    }

    /// Drop the bookkeeping of an origin's finished requests. Ids of requests
    /// that ran are kept so they can never run again.
    pub fn forget_origin(&self, origin: &str) -> usize {
        let forgotten: Vec<ActionId> = {
            let mut ledger = self.ledger.lock();
            let ids: Vec<ActionId> = ledger
                .live
                .iter()
                .filter(|(_, t)| t.origin == origin && t.state.is_terminal())
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                if let Some(tracked) = ledger.live.remove(id) {
                    if tracked.state.has_executed() {
                        ledger.executed.insert(*id);
                    }
                }
            }
            ids
        };
        self.gate.forget(forgotten.iter().copied());
        if !forgotten.is_empty() {
            debug!("Forgot {} finished requests of origin {}", forgotten.len(), origin);
        }
        forgotten.len()
    }
}
