//! # Agent Modes
//!
//! One handler per mode, all behind the same contract:
//! `next(session, last) → Emit | AwaitApproval | Halt`.
//!
//! ## Modes
//!
//! - **Assist**: read-only requests only, one at a time
//! - **Guided**: one request at a time, each waits for its decision and result
//! - **Autonomous**: a bounded sequence without per-step confirmation;
//!   stops at the first denial or fault
//! - **Swarm**: whole rounds at once, bounded by the session's concurrency
//!   limit and always sandboxed

mod assist;
mod autonomous;
mod guided;
mod swarm;

pub use assist::AssistHandler;
pub use autonomous::AutonomousHandler;
pub use guided::GuidedHandler;
pub use swarm::SwarmHandler;

use crate::session::{AgentSession, Halt};
use claw_task::{ActionRecord, ActionRequest, BatchId, Classification};
use serde::{Deserialize, Serialize};

/// Orchestration mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    Assist,
    #[default]
    Guided,
    Autonomous,
    Swarm,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Assist => "assist",
            AgentMode::Guided => "guided",
            AgentMode::Autonomous => "autonomous",
            AgentMode::Swarm => "swarm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "assist" => Some(Self::Assist),
            "guided" => Some(Self::Guided),
            "autonomous" | "auto" => Some(Self::Autonomous),
            "swarm" => Some(Self::Swarm),
            _ => None,
        }
    }

    pub fn all() -> [AgentMode; 4] {
        [
            AgentMode::Assist,
            AgentMode::Guided,
            AgentMode::Autonomous,
            AgentMode::Swarm,
        ]
    }

    /// The handler implementing this mode
    pub fn handler(&self) -> &'static dyn ModeHandler {
        match self {
            AgentMode::Assist => &AssistHandler,
            AgentMode::Guided => &GuidedHandler,
            AgentMode::Autonomous => &AutonomousHandler,
            AgentMode::Swarm => &SwarmHandler,
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown agent mode: {}", s))
    }
}

/// What the orchestrator does next
#[derive(Debug, Clone)]
pub enum Step {
    /// Submit these queued requests, in order
    Emit(Vec<ActionRequest>),
    /// Wait for a sealed batch to be resolved
    AwaitApproval(BatchId),
    Halt(Halt),
}

/// Contract shared by every mode
pub trait ModeHandler: Send + Sync {
    fn mode(&self) -> AgentMode;

    /// Decide the next step from the session and the most recent record
    fn next(&self, session: &AgentSession, last: Option<&ActionRecord>) -> Step;

    /// Screen a classified request before it reaches the gate. `Err` refuses
    /// it without execution.
    fn admit(&self, _classification: &Classification) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Emitted requests run concurrently
    fn concurrent(&self) -> bool {
        false
    }
}

/// Shared preamble: a sealed batch blocks everything else, a spent step
/// budget or an empty queue ends the session.
fn settled(session: &AgentSession) -> Option<Step> {
    if let Some(batch) = session.awaiting() {
        return Some(Step::AwaitApproval(batch));
    }
    if session.queue_len() == 0 {
        return Some(Step::Halt(Halt::completed("no more proposed actions")));
    }
    if session.remaining_steps() == 0 {
        return Some(Step::Halt(Halt::completed(format!(
            "reached the step limit ({})",
            session.max_steps()
        ))));
    }
    None
}

/// Emit the next queued request alone
fn one(session: &AgentSession) -> Step {
    Step::Emit(session.queued().take(1).cloned().collect())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::health::HealthState;
    use crate::tool_router::ToolRegistry;
    use claw_foundation::{AgentSettings, Error, RiskTier};
    use claw_task::{
        ActionResult, ApprovalDecision, DecisionOutcome, ExecMode, ExecStatus, Location,
    };
    use std::sync::Arc;

    pub fn session(mode: AgentMode, queued: usize) -> AgentSession {
        let mut session = AgentSession::new(
            mode,
            &AgentSettings::default(),
            HealthState::default(),
            Arc::new(ToolRegistry::new()),
        );
        for i in 0..queued {
            session.enqueue(ActionRequest::new("echo").with_args([i.to_string()]));
        }
        session
    }

    pub fn record(outcome: DecisionOutcome, error: Option<Error>) -> ActionRecord {
        let request = ActionRequest::new("echo");
        let id = request.id();
        let result = match &error {
            Some(e) => ActionResult::failed(id, e),
            None => ActionResult {
                request_id: id,
                exit_code: Some(0),
                status: ExecStatus::Completed,
                mode: ExecMode::Direct,
                stdout: String::new(),
                stderr: String::new(),
                stdout_truncated: false,
                stderr_truncated: false,
                duration_ms: 1,
                location: Location::Host,
                failure: None,
            },
        };
        ActionRecord {
            request,
            classification: None,
            decision: Some(ApprovalDecision::new(id, outcome, RiskTier::Safe)),
            plan: None,
            result,
        }
    }
}
