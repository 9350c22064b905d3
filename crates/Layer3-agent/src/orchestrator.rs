//! Agent Orchestrator - drives sessions through the pipeline
//!
//! Each round goes through three phases:
//!
//! ```text
//! propose ─▶ screen + submit every request ─▶ (seal deferred batch) ─▶ settle
//!                                                                     │
//!                         await approval, then execute ◀──────────────┘
//! ```
//!
//! Submitting a whole round before anything executes is what lets a swarm
//! round under `defer` surface as one batch. Approval waits never hold an
//! execution slot; the session's concurrency limit only bounds execution.

use crate::health::HealthState;
use crate::session::{AgentSession, Halt, SessionStatus};
use crate::source::{ActionSource, Proposal};
use crate::tool_router::ToolRegistry;
use crate::variant::{AgentMode, ModeHandler, Step};
use claw_foundation::Error;
use claw_task::{
    ActionRecord, ActionRequest, ActionResult, Classification, Pipeline, RunContext, Ticket,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Counts across every session the orchestrator has run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmStatus {
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub timed_out: usize,
    pub total: usize,
    /// Actions that finished successfully
    pub succeeded_actions: usize,
    /// Actions that were refused, denied or failed
    pub failed_actions: usize,
}

/// Finished sessions kept individually before they are folded into totals
const RETAINED_SESSIONS: usize = 256;

struct Tracked {
    mode: AgentMode,
    status: SessionStatus,
    cancel: CancellationToken,
    succeeded: usize,
    failed: usize,
}

impl SwarmStatus {
    fn count(&mut self, tracked: &Tracked) {
        match tracked.status {
            SessionStatus::Running => self.active += 1,
            SessionStatus::Completed => self.completed += 1,
            SessionStatus::Failed => self.failed += 1,
            SessionStatus::Cancelled => self.cancelled += 1,
            SessionStatus::TimedOut => self.timed_out += 1,
        }
        self.total += 1;
        self.succeeded_actions += tracked.succeeded;
        self.failed_actions += tracked.failed;
    }
}

#[derive(Default)]
struct SessionBook {
    tracked: HashMap<String, Tracked>,
    /// Finished session ids, oldest first
    finished: VecDeque<String>,
    /// Totals of finished sessions no longer tracked one by one
    retired: SwarmStatus,
}

/// A request that reached the gate
struct Submitted {
    request: ActionRequest,
    ticket: Ticket,
}

/// Runs agent sessions against one shared pipeline
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    tools: RwLock<Arc<ToolRegistry>>,
    health: RwLock<HealthState>,
    sessions: Mutex<SessionBook>,
    retain: usize,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<Pipeline>, tools: ToolRegistry, health: HealthState) -> Self {
        Self {
            pipeline,
            tools: RwLock::new(Arc::new(tools)),
            health: RwLock::new(health),
            sessions: Mutex::new(SessionBook::default()),
            retain: RETAINED_SESSIONS,
        }
    }

    /// How many finished sessions stay queryable by id
    pub fn with_retention(mut self, finished: usize) -> Self {
        self.retain = finished;
        self
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn health(&self) -> HealthState {
        self.health.read().clone()
    }

    /// Applies to sessions built afterwards
    pub fn set_health(&self, health: HealthState) {
        *self.health.write() = health;
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        self.tools.read().clone()
    }

    /// Replace the registry; running sessions keep the one they started with
    pub fn set_tools(&self, tools: ToolRegistry) {
        *self.tools.write() = Arc::new(tools);
    }

    /// A new session with the configured limits, current health and a
    /// snapshot of the tool registry
    pub fn session(&self, mode: AgentMode) -> AgentSession {
        AgentSession::new(
            mode,
            &self.pipeline.config().agent,
            self.health(),
            self.tools(),
        )
    }

    // ========================================================================
    // Session control
    // ========================================================================

    /// Request cancellation of a running session
    pub fn cancel(&self, id: &str) -> bool {
        match self.sessions.lock().tracked.get(id) {
            Some(tracked) if !tracked.status.is_terminal() => {
                tracked.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every running session; returns how many were signalled
    pub fn shutdown(&self) -> usize {
        let sessions = self.sessions.lock();
        let running: Vec<&Tracked> = sessions
            .tracked
            .values()
            .filter(|t| !t.status.is_terminal())
            .collect();
        for tracked in &running {
            tracked.cancel.cancel();
        }
        if !running.is_empty() {
            info!("Shutting down {} agent sessions", running.len());
        }
        running.len()
    }

    pub fn session_status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.lock().tracked.get(id).map(|t| t.status)
    }

    /// Mode of a tracked session
    pub fn session_mode(&self, id: &str) -> Option<AgentMode> {
        self.sessions.lock().tracked.get(id).map(|t| t.mode)
    }

    pub fn status(&self) -> SwarmStatus {
        let sessions = self.sessions.lock();
        let mut status = sessions.retired.clone();
        for tracked in sessions.tracked.values() {
            status.count(tracked);
        }
        status
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Run a session to a terminal state and hand it back
    pub async fn run(&self, mut session: AgentSession, source: &mut dyn ActionSource) -> AgentSession {
        let id = session.id().to_string();
        let cancel = CancellationToken::new();
        self.sessions.lock().tracked.insert(
            id.clone(),
            Tracked {
                mode: session.mode(),
                status: SessionStatus::Running,
                cancel: cancel.clone(),
                succeeded: 0,
                failed: 0,
            },
        );
        info!(session = %id, mode = %session.mode(), "agent session started");

        if source.requires_model() && !session.health().model_connected {
            session.finish(Halt::failed("model server is not connected"));
            self.untrack(&session);
            return session;
        }
        if session.mode() == AgentMode::Swarm && !session.health().containers_ready() {
            warn!(session = %id, "swarm session started without a reachable container engine");
        }

        let timeout = session.timeout();
        let grace = self.pipeline.config().agent.cancel_grace();
        let halt = {
            let drive = self.drive(&mut session, source, &cancel);
            tokio::pin!(drive);
            let interrupted = tokio::select! {
                halt = &mut drive => Ok(halt),
                _ = tokio::time::sleep(timeout) => Err(Halt::timed_out(timeout)),
                _ = cancel.cancelled() => Err(Halt::cancelled()),
            };
            match interrupted {
                Ok(halt) => halt,
                Err(halt) => {
                    cancel.cancel();
                    // unblocks approval waits and closes stream sessions
                    self.pipeline.cancel_origin(&id).await;
                    if tokio::time::timeout(grace, &mut drive).await.is_err() {
                        warn!(session = %id, "in-flight actions did not stop within {:?}", grace);
                    }
                    halt
                }
            }
        };

        // nothing the session owned outlives it
        self.pipeline.cancel_origin(&id).await;
        self.pipeline.forget_origin(&id);
        info!(
            session = %id,
            status = %halt.status,
            actions = session.history().len(),
            "agent session finished: {}",
            halt.reason
        );
        session.finish(halt);
        self.untrack(&session);
        session
    }

    fn untrack(&self, session: &AgentSession) {
        let mut book = self.sessions.lock();
        let Some(tracked) = book.tracked.get_mut(session.id()) else {
            return;
        };
        tracked.status = session.status();
        tracked.succeeded = session.succeeded();
        tracked.failed = session.failed();
        book.finished.push_back(session.id().to_string());

        while book.finished.len() > self.retain {
            let Some(oldest) = book.finished.pop_front() else {
                break;
            };
            if let Some(tracked) = book.tracked.remove(&oldest) {
                book.retired.count(&tracked);
            }
        }
    }

    async fn drive(
        &self,
        session: &mut AgentSession,
        source: &mut dyn ActionSource,
        cancel: &CancellationToken,
    ) -> Halt {
        let handler = session.mode().handler();
        let ctx = RunContext::new(cancel.clone()).swarm(handler.concurrent());
        let mut pending: Vec<Submitted> = Vec::new();
        let mut last: Option<ActionRecord> = None;

        loop {
            if cancel.is_cancelled() {
                return Halt::cancelled();
            }

            if session.queue_len() == 0 && !session.is_exhausted() && session.awaiting().is_none() {
                match source.propose(session.history()).await {
                    Ok(round) if round.is_empty() => session.mark_exhausted(),
                    Ok(round) => {
                        for record in self.enqueue(session, round) {
                            last = Some(record.clone());
                            session.record(record);
                        }
                    }
                    Err(e) => return Halt::failed(format!("action source failed: {}", e)),
                }
            }

            match handler.next(session, last.as_ref()) {
                Step::Emit(requests) => {
                    let requests = session.take(requests.len());
                    debug!(session = %session.id(), count = requests.len(), "emitting");
                    let (submitted, refused) = self.submit(handler, requests);
                    pending = submitted;
                    for record in refused {
                        last = Some(record.clone());
                        session.record(record);
                    }

                    if let Some(batch) = pending.iter().find_map(|s| s.ticket.batch_id()) {
                        let gate = self.pipeline.gate();
                        if gate.open_batch() == Some(batch) {
                            gate.seal_batch();
                        }
                        session.set_awaiting(Some(batch));
                        continue;
                    }
                    let records = self
                        .settle(handler, std::mem::take(&mut pending), &ctx, session.concurrency_limit())
                        .await;
                    for record in records {
                        last = Some(record.clone());
                        session.record(record);
                    }
                }
                Step::AwaitApproval(batch) => {
                    info!(session = %session.id(), %batch, "waiting for batch approval");
                    let records = self
                        .settle(handler, std::mem::take(&mut pending), &ctx, session.concurrency_limit())
                        .await;
                    session.set_awaiting(None);
                    for record in records {
                        last = Some(record.clone());
                        session.record(record);
                    }
                }
                Step::Halt(halt) => return halt,
            }
        }
    }

    /// Queue a round of proposals. Tool calls resolve against the session's
    /// registry; the ones that fail come back as records.
    fn enqueue(&self, session: &mut AgentSession, round: Vec<Proposal>) -> Vec<ActionRecord> {
        let mut rejected = Vec::new();
        for proposal in round {
            let request = match proposal {
                Proposal::Action(request) => Ok(request),
                Proposal::Tool(call) => session.tools().resolve(&call).map_err(|e| {
                    let request = ActionRequest::new(call.tool.clone()).with_tool(call.tool.clone());
                    (request, e)
                }),
            };
            match request {
                Ok(request) => session.enqueue(request.with_origin(session.id())),
                Err((request, e)) => {
                    warn!(session = %session.id(), "tool call rejected: {}", e);
                    let request = request.with_origin(session.id());
                    rejected.push(unexecuted(request, None, e));
                }
            }
        }
        rejected
    }

    /// Screen and submit a round. Requests the mode refuses or the pipeline
    /// rejects come back as records.
    fn submit(
        &self,
        handler: &dyn ModeHandler,
        requests: Vec<ActionRequest>,
    ) -> (Vec<Submitted>, Vec<ActionRecord>) {
        let mut submitted = Vec::with_capacity(requests.len());
        let mut refused = Vec::new();
        for request in requests {
            let classification = self.pipeline.gate().classify(&request);
            if let Err(reason) = handler.admit(&classification) {
                info!(request = %request.id().short(), "refused: {}", reason);
                let mut record = unexecuted(request, None, Error::ApprovalDenied(reason));
                record.classification = Some(classification);
                refused.push(record);
                continue;
            }
            match self.pipeline.submit(&request) {
                Ok(ticket) => submitted.push(Submitted { request, ticket }),
                Err(e) => {
                    warn!(request = %request.id().short(), "rejected: {}", e);
                    refused.push(unexecuted(request, Some(classification), e));
                }
            }
        }
        (submitted, refused)
    }

    /// Wait for decisions and execute what was approved
    async fn settle(
        &self,
        handler: &dyn ModeHandler,
        pending: Vec<Submitted>,
        ctx: &RunContext,
        limit: usize,
    ) -> Vec<ActionRecord> {
        if !handler.concurrent() {
            let mut records = Vec::with_capacity(pending.len());
            for submitted in pending {
                records.push(settle_one(self.pipeline.clone(), submitted, ctx.clone(), None).await);
            }
            return records;
        }

        let permits = Arc::new(Semaphore::new(limit.max(1)));
        let mut tasks = JoinSet::new();
        for submitted in pending {
            let pipeline = self.pipeline.clone();
            let ctx = ctx.clone();
            let permits = permits.clone();
            tasks.spawn(settle_one(pipeline, submitted, ctx, Some(permits)));
        }

        let mut records = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(record) => records.push(record),
                Err(e) => warn!("swarm action task ended abnormally: {}", e),
            }
        }
        records
    }
}

/// Approval, then (bounded) execution of one submitted request
async fn settle_one(
    pipeline: Arc<Pipeline>,
    submitted: Submitted,
    ctx: RunContext,
    permits: Option<Arc<Semaphore>>,
) -> ActionRecord {
    let Submitted { request, ticket } = submitted;
    let approval = pipeline.await_approval(ticket).await;

    if !approval.decision.is_approved() {
        let reason = approval
            .decision
            .reason
            .clone()
            .unwrap_or_else(|| "denied by approval gate".to_string());
        info!(request = %request.id().short(), "denied: {}", reason);
        let mut record = unexecuted(
            request,
            Some(approval.classification),
            Error::ApprovalDenied(reason),
        );
        record.decision = Some(approval.decision);
        return record;
    }

    let _permit = match permits {
        Some(permits) => match permits.acquire_owned().await {
            Ok(permit) => Some(permit),
            Err(_) => {
                let mut record = unexecuted(
                    request,
                    Some(approval.classification),
                    Error::Internal("concurrency limiter closed".into()),
                );
                record.decision = Some(approval.decision);
                return record;
            }
        },
        None => None,
    };

    if ctx.cancel.is_cancelled() {
        let mut record = unexecuted(request, Some(approval.classification), Error::Cancelled);
        record.decision = Some(approval.decision);
        return record;
    }

    let (plan, result) = pipeline.execute_approved(&request, &approval, &ctx).await;
    ActionRecord {
        request,
        classification: Some(approval.classification),
        decision: Some(approval.decision),
        plan,
        result,
    }
}

/// Record for a request that never executed
fn unexecuted(
    request: ActionRequest,
    classification: Option<Classification>,
    err: Error,
) -> ActionRecord {
    let result = ActionResult::failed(request.id(), &err).with_mode(request.mode());
    ActionRecord {
        request,
        classification,
        decision: None,
        plan: None,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orchestrator() -> Orchestrator {
        let mut config = claw_foundation::PipelineConfig::default();
        config.container.enabled = false;
        let pipeline = Arc::new(Pipeline::with_runtime(config, None).unwrap());
        Orchestrator::new(pipeline, ToolRegistry::new(), HealthState::new())
    }

    fn track(orchestrator: &Orchestrator, session: &AgentSession) {
        orchestrator.sessions.lock().tracked.insert(
            session.id().to_string(),
            Tracked {
                mode: session.mode(),
                status: SessionStatus::Running,
                cancel: CancellationToken::new(),
                succeeded: 0,
                failed: 0,
            },
        );
    }

    #[test]
    fn test_status_counts_tracked_sessions() {
        let orchestrator = orchestrator();

        let running = orchestrator.session(AgentMode::Guided);
        let mut done = orchestrator.session(AgentMode::Swarm);
        track(&orchestrator, &running);
        track(&orchestrator, &done);
        done.finish(Halt::failed("boom"));
        orchestrator.untrack(&done);

        let status = orchestrator.status();
        assert_eq!(status.total, 2);
        assert_eq!(status.active, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(orchestrator.session_mode(done.id()), Some(AgentMode::Swarm));

        assert!(orchestrator.cancel(running.id()));
        assert!(!orchestrator.cancel(done.id()));
        assert!(!orchestrator.cancel("nope"));
        assert_eq!(orchestrator.shutdown(), 1);
    }

    #[test]
    fn test_old_finished_sessions_fold_into_totals() {
        let orchestrator = orchestrator().with_retention(1);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let mut session = orchestrator.session(AgentMode::Guided);
            track(&orchestrator, &session);
            session.finish(Halt::failed("boom"));
            orchestrator.untrack(&session);
            ids.push(session.id().to_string());
        }

        assert_eq!(orchestrator.sessions.lock().tracked.len(), 1);
        assert!(orchestrator.session_status(&ids[0]).is_none());
        assert_eq!(
            orchestrator.session_status(&ids[2]),
            Some(SessionStatus::Failed)
        );

        let status = orchestrator.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.failed, 3);
        assert_eq!(status.active, 0);
    }
}
