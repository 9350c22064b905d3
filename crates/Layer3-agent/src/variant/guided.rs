//! Guided mode - one request at a time

use super::{one, settled, AgentMode, ModeHandler, Step};
use crate::session::{is_fault, AgentSession, Halt};
use claw_task::ActionRecord;

/// Emits a request, waits for its decision and result, then the next.
///
/// A denial is the human steering the session and does not stop it; a
/// fault (timeout, sandbox failure...) does.
pub struct GuidedHandler;

impl ModeHandler for GuidedHandler {
    fn mode(&self) -> AgentMode {
        AgentMode::Guided
    }

    fn next(&self, session: &AgentSession, last: Option<&ActionRecord>) -> Step {
        if let Some(batch) = session.awaiting() {
            return Step::AwaitApproval(batch);
        }
        if let Some(last) = last.filter(|r| is_fault(r)) {
            return Step::Halt(Halt::failed(fault_reason(last)));
        }
        settled(session).unwrap_or_else(|| one(session))
    }
}

pub(super) fn fault_reason(record: &ActionRecord) -> String {
    match &record.result.failure {
        Some(failure) => format!(
            "request {} failed ({}): {}",
            record.request.id(),
            failure.kind,
            failure.cause
        ),
        None => format!("request {} failed", record.request.id()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::variant::test_support::*;
    use claw_foundation::{Error, ErrorKind};
    use claw_task::DecisionOutcome;

    #[test]
    fn test_denial_does_not_halt() {
        let session = session(AgentMode::Guided, 2);
        let denied = record(
            DecisionOutcome::Denied,
            Some(Error::ApprovalDenied("no".into())),
        );
        assert!(matches!(
            GuidedHandler.next(&session, Some(&denied)),
            Step::Emit(r) if r.len() == 1
        ));
    }

    #[test]
    fn test_fault_halts_as_failed() {
        let session = session(AgentMode::Guided, 2);
        let timed_out = record(
            DecisionOutcome::AutoApproved,
            Some(Error::ExecutionTimeout("1s".into())),
        );
        match GuidedHandler.next(&session, Some(&timed_out)) {
            Step::Halt(halt) => {
                assert_eq!(halt.status, SessionStatus::Failed);
                assert!(halt.reason.contains(ErrorKind::ExecutionTimeout.as_str()));
            }
            other => panic!("expected halt, got {:?}", other),
        }
    }
}
