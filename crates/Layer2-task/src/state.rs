//! Action lifecycle state machine

use serde::{Deserialize, Serialize};

/// Lifecycle of a single action inside the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "kebab-case")]
pub enum ActionState {
    /// Validated, waiting for an approval decision
    AwaitingApproval,

    /// Approved, waiting for an execution slot
    Queued,

    /// Currently executing
    Running,

    /// Finished (any exit code)
    Completed,

    /// Rejected by the approval gate
    Denied,

    /// Failed before or during execution
    Failed(String),

    /// Killed by its wall-clock limit
    TimedOut,

    /// Cancelled by its session
    Cancelled,
}

impl ActionState {
    /// Check if this is a terminal state (cannot transition further)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::Completed
                | ActionState::Denied
                | ActionState::Failed(_)
                | ActionState::TimedOut
                | ActionState::Cancelled
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ActionState::Running)
    }

    /// Not yet executing
    pub fn is_pending(&self) -> bool {
        matches!(self, ActionState::AwaitingApproval | ActionState::Queued)
    }

    /// Whether execution has been entered at some point
    pub fn has_executed(&self) -> bool {
        matches!(
            self,
            ActionState::Running
                | ActionState::Completed
                | ActionState::TimedOut
                | ActionState::Cancelled
        )
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ActionState::AwaitingApproval => "Awaiting approval",
            ActionState::Queued => "Queued",
            ActionState::Running => "Running",
            ActionState::Completed => "Completed",
            ActionState::Denied => "Denied",
            ActionState::Failed(_) => "Failed",
            ActionState::TimedOut => "Timed out",
            ActionState::Cancelled => "Cancelled",
        }
    }

    /// Symbol for terminal output
    pub fn symbol(&self) -> &'static str {
        match self {
            ActionState::AwaitingApproval => "?",
            ActionState::Queued => "◎",
            ActionState::Running => "⟳",
            ActionState::Completed => "✓",
            ActionState::Denied => "⊘",
            ActionState::Failed(_) => "✗",
            ActionState::TimedOut => "⏱",
            ActionState::Cancelled => "⊘",
        }
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
