//! Agent sessions - one orchestrated workflow

use crate::health::HealthState;
use crate::tool_router::ToolRegistry;
use crate::variant::AgentMode;
use chrono::{DateTime, Utc};
use claw_foundation::{AgentSettings, ErrorKind};
use claw_task::{ActionRecord, ActionRequest, BatchId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::TimedOut => "timed-out",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a session stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halt {
    pub status: SessionStatus,
    pub reason: String,
}

impl Halt {
    pub fn completed(reason: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Completed,
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Failed,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: SessionStatus::Cancelled,
            reason: "cancelled".to_string(),
        }
    }

    pub fn timed_out(after: Duration) -> Self {
        Self {
            status: SessionStatus::TimedOut,
            reason: format!("session exceeded {}s", after.as_secs()),
        }
    }
}

/// A failure that stops guided and autonomous sessions.
///
/// Denials, invalid requests and refusals only end their own request; a
/// non-zero exit code is a result, not a fault.
pub fn is_fault(record: &ActionRecord) -> bool {
    match record.result.error_kind() {
        None => false,
        Some(ErrorKind::InvalidRequest | ErrorKind::ApprovalDenied | ErrorKind::Cancelled) => false,
        Some(_) => true,
    }
}

/// One orchestrated workflow and its history
#[derive(Debug, Clone)]
pub struct AgentSession {
    id: String,
    mode: AgentMode,
    status: SessionStatus,
    concurrency_limit: usize,
    timeout: Duration,
    max_steps: usize,
    health: HealthState,
    tools: Arc<ToolRegistry>,

    history: Vec<ActionRecord>,
    queue: VecDeque<ActionRequest>,
    emitted: usize,
    exhausted: bool,
    awaiting: Option<BatchId>,
    halt: Option<Halt>,

    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    /// Limits come from the agent settings
    pub fn new(
        mode: AgentMode,
        settings: &AgentSettings,
        health: HealthState,
        tools: Arc<ToolRegistry>,
    ) -> Self {
        Self {
            id: format!("agent-{}", &Uuid::new_v4().simple().to_string()[..12]),
            mode,
            status: SessionStatus::Running,
            concurrency_limit: settings.concurrency_limit.max(1),
            timeout: settings.session_timeout(),
            max_steps: settings.max_steps,
            health,
            tools,
            history: Vec::new(),
            queue: VecDeque::new(),
            emitted: 0,
            exhausted: false,
            awaiting: None,
            halt: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Also the origin of every request the session emits
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn health(&self) -> &HealthState {
        &self.health
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// (request, decision, result) records in completion order
    pub fn history(&self) -> &[ActionRecord] {
        &self.history
    }

    /// Requests proposed but not yet emitted
    pub fn queued(&self) -> impl Iterator<Item = &ActionRequest> {
        self.queue.iter()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Requests emitted so far
    pub fn steps(&self) -> usize {
        self.emitted
    }

    pub fn remaining_steps(&self) -> usize {
        self.max_steps.saturating_sub(self.emitted)
    }

    /// The source has nothing more to propose
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Deferred batch the session is waiting on
    pub fn awaiting(&self) -> Option<BatchId> {
        self.awaiting
    }

    pub fn halt(&self) -> Option<&Halt> {
        self.halt.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn succeeded(&self) -> usize {
        self.history.iter().filter(|r| r.result.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.history.len() - self.succeeded()
    }

    // ========================================================================
    // Orchestrator bookkeeping
    // ========================================================================

    pub(crate) fn enqueue(&mut self, request: ActionRequest) {
        self.queue.push_back(request);
    }

    /// Take the first `n` queued requests
    pub(crate) fn take(&mut self, n: usize) -> Vec<ActionRequest> {
        let n = n.min(self.queue.len());
        self.emitted += n;
        self.queue.drain(..n).collect()
    }

    pub(crate) fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    pub(crate) fn set_awaiting(&mut self, batch: Option<BatchId>) {
        self.awaiting = batch;
    }

    pub(crate) fn record(&mut self, record: ActionRecord) {
        self.history.push(record);
    }

    pub(crate) fn finish(&mut self, halt: Halt) {
        self.status = halt.status;
        self.halt = Some(halt);
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> AgentSession {
        AgentSession::new(
            AgentMode::Guided,
            &AgentSettings::default(),
            HealthState::default(),
            Arc::new(ToolRegistry::new()),
        )
    }

    #[test]
    fn test_defaults_from_settings() {
        let session = session();
        assert!(session.id().starts_with("agent-"));
        assert_eq!(session.status(), SessionStatus::Running);
        assert_eq!(session.concurrency_limit(), 4);
        assert_eq!(session.timeout(), Duration::from_secs(600));
        assert_eq!(session.max_steps(), 32);
    }

    #[test]
    fn test_take_counts_steps() {
        let mut session = session().with_max_steps(3);
        for i in 0..5 {
            session.enqueue(ActionRequest::new("echo").with_args([i.to_string()]));
        }
        let taken = session.take(2);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].args(), ["0"]);
        assert_eq!(session.queue_len(), 3);
        assert_eq!(session.remaining_steps(), 1);
        assert!(session.take(10).len() == 3);
        assert_eq!(session.remaining_steps(), 0);
    }

    #[test]
    fn test_finish_is_terminal() {
        let mut session = session();
        session.finish(Halt::timed_out(Duration::from_secs(5)));
        assert_eq!(session.status(), SessionStatus::TimedOut);
        assert!(session.status().is_terminal());
        assert!(session.finished_at().is_some());
        assert_eq!(session.halt().unwrap().reason, "session exceeded 5s");
    }
}
