//! Assist mode - read-only help

use super::{one, settled, AgentMode, ModeHandler, Step};
use crate::session::AgentSession;
use claw_foundation::RiskTier;
use claw_task::{ActionRecord, Classification};

/// Runs safe requests one at a time and refuses everything else.
/// A refusal ends only that request.
pub struct AssistHandler;

impl ModeHandler for AssistHandler {
    fn mode(&self) -> AgentMode {
        AgentMode::Assist
    }

    fn next(&self, session: &AgentSession, _last: Option<&ActionRecord>) -> Step {
        settled(session).unwrap_or_else(|| one(session))
    }

    fn admit(&self, classification: &Classification) -> std::result::Result<(), String> {
        if classification.tier > RiskTier::Safe || classification.ambiguous {
            return Err(format!(
                "assist mode only runs read-only actions (classified {})",
                classification.tier
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::test_support::*;
    use claw_foundation::Error;
    use claw_task::DecisionOutcome;

    #[test]
    fn test_admits_only_safe() {
        assert!(AssistHandler.admit(&Classification::safe()).is_ok());

        let mut sensitive = Classification::safe();
        sensitive.tier = RiskTier::Sensitive;
        assert!(AssistHandler.admit(&sensitive).is_err());

        let mut ambiguous = Classification::safe();
        ambiguous.ambiguous = true;
        assert!(AssistHandler.admit(&ambiguous).is_err());
    }

    #[test]
    fn test_keeps_going_after_refusal() {
        let session = session(AgentMode::Assist, 2);
        let refused = record(
            DecisionOutcome::Denied,
            Some(Error::ApprovalDenied("refused".into())),
        );
        match AssistHandler.next(&session, Some(&refused)) {
            Step::Emit(requests) => assert_eq!(requests.len(), 1),
            other => panic!("expected emit, got {:?}", other),
        }
    }
}
