//! Swarm mode - concurrent rounds

use super::{settled, AgentMode, ModeHandler, Step};
use crate::session::AgentSession;
use claw_task::ActionRecord;

/// Emits every queued request at once (within the step budget). The
/// orchestrator bounds how many run at a time; failures never stop the
/// session.
pub struct SwarmHandler;

impl ModeHandler for SwarmHandler {
    fn mode(&self) -> AgentMode {
        AgentMode::Swarm
    }

    fn next(&self, session: &AgentSession, _last: Option<&ActionRecord>) -> Step {
        if let Some(step) = settled(session) {
            return step;
        }
        Step::Emit(
            session
                .queued()
                .take(session.remaining_steps())
                .cloned()
                .collect(),
        )
    }

    fn concurrent(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::test_support::*;
    use claw_foundation::Error;
    use claw_task::DecisionOutcome;

    #[test]
    fn test_emits_whole_round_despite_failures() {
        let session = session(AgentMode::Swarm, 5);
        let failed = record(
            DecisionOutcome::AutoApproved,
            Some(Error::SandboxUnavailable("down".into())),
        );
        assert!(matches!(
            SwarmHandler.next(&session, Some(&failed)),
            Step::Emit(r) if r.len() == 5
        ));
    }

    #[test]
    fn test_round_respects_step_budget() {
        let session = session(AgentMode::Swarm, 5).with_max_steps(2);
        assert!(matches!(
            SwarmHandler.next(&session, None),
            Step::Emit(r) if r.len() == 2
        ));
    }
}
