//! Autonomous mode - bounded sequence without per-step confirmation

use super::guided::fault_reason;
use super::{one, settled, AgentMode, ModeHandler, Step};
use crate::session::{is_fault, AgentSession, Halt};
use claw_task::ActionRecord;

/// Runs requests back to back, subject only to the gate's tier policy.
/// Stops at the first denial, the first fault or the step limit.
pub struct AutonomousHandler;

impl ModeHandler for AutonomousHandler {
    fn mode(&self) -> AgentMode {
        AgentMode::Autonomous
    }

    fn next(&self, session: &AgentSession, last: Option<&ActionRecord>) -> Step {
        if let Some(batch) = session.awaiting() {
            return Step::AwaitApproval(batch);
        }
        if let Some(last) = last {
            if last.is_denied() {
                let reason = last
                    .decision
                    .as_ref()
                    .and_then(|d| d.reason.clone())
                    .unwrap_or_else(|| "denied by approval gate".to_string());
                return Step::Halt(Halt::completed(format!(
                    "halted: request {} denied ({})",
                    last.request.id(),
                    reason
                )));
            }
            if is_fault(last) {
                return Step::Halt(Halt::failed(fault_reason(last)));
            }
        }
        settled(session).unwrap_or_else(|| one(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::variant::test_support::*;
    use claw_foundation::Error;
    use claw_task::DecisionOutcome;

    #[test]
    fn test_first_denial_halts() {
        let session = session(AgentMode::Autonomous, 3);
        let denied = record(
            DecisionOutcome::Denied,
            Some(Error::ApprovalDenied("no".into())),
        );
        match AutonomousHandler.next(&session, Some(&denied)) {
            Step::Halt(halt) => {
                assert_eq!(halt.status, SessionStatus::Completed);
                assert!(halt.reason.contains("denied"));
            }
            other => panic!("expected halt, got {:?}", other),
        }
    }

    #[test]
    fn test_sandbox_failure_halts_as_failed() {
        let session = session(AgentMode::Autonomous, 3);
        let failed = record(
            DecisionOutcome::AutoApproved,
            Some(Error::SandboxUnavailable("daemon down".into())),
        );
        assert!(matches!(
            AutonomousHandler.next(&session, Some(&failed)),
            Step::Halt(h) if h.status == SessionStatus::Failed
        ));
    }

    #[test]
    fn test_success_continues_one_at_a_time() {
        let session = session(AgentMode::Autonomous, 3);
        let ok = record(DecisionOutcome::AutoApproved, None);
        assert!(matches!(
            AutonomousHandler.next(&session, Some(&ok)),
            Step::Emit(r) if r.len() == 1
        ));
    }
}
