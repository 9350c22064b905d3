//! Risk classification
//!
//! Maps an [`ActionRequest`] to a [`RiskTier`] using the configured
//! [`TierPolicy`]. The effective tier is never lower than the tier the
//! producer declared.
//!
//! ## Rules
//! 1. Any destructive predicate over the full command line → `destructive`
//! 2. Compound shell syntax in the command text (`;`, `|`, `&`, `$(`, backticks,
//!    newlines, process substitution) → ambiguous, at least `sensitive`
//! 3. A safe program or safe prefix with no sensitive predicate → `safe`
//! 4. Everything else → `sensitive`
//!
//! Arguments are passed to the process as discrete argv entries, so shell
//! metacharacters inside them do not make a request ambiguous.

use crate::action::ActionRequest;
use claw_foundation::{CompiledPredicate, Error, Result, RiskTier, TierPolicy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Outcome of classifying one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub tier: RiskTier,

    /// The command text could not be classified reliably
    pub ambiguous: bool,

    /// Matched predicate reasons, for the approval UI
    pub reasons: Vec<String>,
}

impl Classification {
    pub fn safe() -> Self {
        Self {
            tier: RiskTier::Safe,
            ambiguous: false,
            reasons: Vec::new(),
        }
    }
}

/// Compiled form of a [`TierPolicy`]
#[derive(Debug, Clone)]
pub struct Classifier {
    safe_programs: HashSet<String>,
    safe_prefixes: Vec<String>,
    destructive: Vec<CompiledPredicate>,
    sensitive: Vec<CompiledPredicate>,
}

const COMPOUND_TOKENS: &[&str] = &[";", "|", "&", "$(", "`", "\n", "<(", ">("];

impl Classifier {
    pub fn new(policy: &TierPolicy) -> Result<Self> {
        let compile = |predicates: &[claw_foundation::RiskPredicate]| {
            predicates
                .iter()
                .map(|p| {
                    p.compile()
                        .map_err(|e| Error::Config(format!("risk predicate '{}': {}", p.reason, e)))
                })
                .collect::<Result<Vec<_>>>()
        };

        Ok(Self {
            safe_programs: policy
                .safe_programs
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
            safe_prefixes: policy.safe_prefixes.clone(),
            destructive: compile(&policy.destructive)?,
            sensitive: compile(&policy.sensitive)?,
        })
    }

    /// Classify a request
    pub fn classify(&self, request: &ActionRequest) -> Classification {
        let classification =
            self.classify_parts(request.command(), &request.command_line(), request.declared_tier());
        debug!(
            request = %request.id().short(),
            tier = %classification.tier,
            ambiguous = classification.ambiguous,
            "classified request"
        );
        classification
    }

    /// Classify a bare command line (no separate args)
    pub fn classify_line(&self, line: &str, declared: RiskTier) -> Classification {
        self.classify_parts(line, line, declared)
    }

    fn classify_parts(&self, command: &str, full_line: &str, declared: RiskTier) -> Classification {
        let mut reasons = Vec::new();

        let destructive: Vec<&str> = self
            .destructive
            .iter()
            .filter(|p| p.matches(full_line))
            .map(|p| p.reason())
            .collect();
        if !destructive.is_empty() {
            reasons.extend(destructive.into_iter().map(String::from));
            return Classification {
                tier: RiskTier::Destructive,
                ambiguous: false,
                reasons,
            };
        }

        let ambiguous = is_compound(command) || base_program(command).is_none();
        if ambiguous {
            reasons.push("Compound or unparseable shell syntax".to_string());
        }

        reasons.extend(
            self.sensitive
                .iter()
                .filter(|p| p.matches(full_line))
                .map(|p| p.reason().to_string()),
        );

        let looks_safe = !ambiguous && reasons.is_empty() && self.is_safe_invocation(command, full_line);
        let classified = if looks_safe {
            RiskTier::Safe
        } else {
            if reasons.is_empty() {
                reasons.push("Not a known read-only command".to_string());
            }
            RiskTier::Sensitive
        };

        Classification {
            tier: classified.max(declared),
            ambiguous,
            reasons,
        }
    }

    fn is_safe_invocation(&self, command: &str, full_line: &str) -> bool {
        let trimmed = full_line.trim();
        if self
            .safe_prefixes
            .iter()
            .any(|prefix| trimmed == prefix || trimmed.starts_with(&format!("{} ", prefix)))
        {
            return true;
        }
        base_program(command)
            .map(|program| self.safe_programs.contains(&program.to_lowercase()))
            .unwrap_or(false)
    }
}

fn is_compound(command: &str) -> bool {
    COMPOUND_TOKENS.iter().any(|token| command.contains(token))
}

/// First word of the command with any directory stripped.
/// `None` when the text does not split cleanly or starts with an assignment.
fn base_program(command: &str) -> Option<String> {
    let words = shlex::split(command)?;
    let first = words.first()?;
    if first.contains('=') {
        return None;
    }
    let name = first.rsplit(['/', '\\']).next().unwrap_or(first);
    let name = name.strip_suffix(".exe").unwrap_or(name);
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(&TierPolicy::default()).unwrap()
    }

    #[test]
    fn test_read_only_is_safe() {
        let c = classifier();
        let req = ActionRequest::new("ls").with_args(["-la"]);
        assert_eq!(c.classify(&req).tier, RiskTier::Safe);
        assert_eq!(c.classify_line("git status", RiskTier::Safe).tier, RiskTier::Safe);
        assert_eq!(c.classify_line("/bin/cat notes.txt", RiskTier::Safe).tier, RiskTier::Safe);
    }

    #[test]
    fn test_declared_tier_is_a_floor() {
        let c = classifier();
        let req = ActionRequest::new("ls").with_tier(RiskTier::Destructive);
        assert_eq!(c.classify(&req).tier, RiskTier::Destructive);
    }

    #[test]
    fn test_destructive_patterns() {
        let c = classifier();
        let result = c.classify_line("rm -rf build", RiskTier::Safe);
        assert_eq!(result.tier, RiskTier::Destructive);
        assert!(!result.reasons.is_empty());

        // matched across discrete args too
        let req = ActionRequest::new("git").with_args(["push", "--force"]);
        assert_eq!(c.classify(&req).tier, RiskTier::Destructive);
    }

    #[test]
    fn test_compound_syntax_is_never_safe() {
        let c = classifier();
        for line in ["ls; echo hi", "cat a | grep b", "echo $(whoami)", "ls && pwd"] {
            let result = c.classify_line(line, RiskTier::Safe);
            assert!(result.ambiguous, "{}", line);
            assert_eq!(result.tier, RiskTier::Sensitive, "{}", line);
        }
    }

    #[test]
    fn test_metacharacters_in_args_are_not_ambiguous() {
        let c = classifier();
        let req = ActionRequest::new("echo").with_args(["a;b", "$(x)"]);
        let result = c.classify(&req);
        assert!(!result.ambiguous);
        assert_eq!(result.tier, RiskTier::Safe);
    }

    #[test]
    fn test_unknown_and_redirect_are_sensitive() {
        let c = classifier();
        assert_eq!(c.classify_line("npm install", RiskTier::Safe).tier, RiskTier::Sensitive);
        assert_eq!(
            c.classify_line("echo hi > out.txt", RiskTier::Safe).tier,
            RiskTier::Sensitive
        );
        assert!(c.classify_line("FOO=1 ls", RiskTier::Safe).ambiguous);
    }

    #[test]
    fn test_programs_that_launch_or_write_are_not_safe() {
        let c = classifier();
        let requests = [
            ActionRequest::new("env").with_args(["touch", "/tmp/marker"]),
            ActionRequest::new("env").with_args(["python3", "-c", "import os; os.remove('x')"]),
            ActionRequest::new("less").with_args(["notes.txt"]),
            ActionRequest::new("find").with_args([".", "-execdir", "rm", "{}", ";"]),
            ActionRequest::new("find").with_args([".", "-ok", "rm", "{}", ";"]),
            ActionRequest::new("find").with_args([".", "-fprint", "list.txt"]),
            ActionRequest::new("find").with_args([".", "-delete"]),
            ActionRequest::new("rg").with_args(["--pre", "./run.sh", "needle"]),
            ActionRequest::new("git").with_args(["branch", "-D", "main"]),
        ];
        for request in &requests {
            assert_eq!(
                c.classify(request).tier,
                RiskTier::Sensitive,
                "{}",
                request.command_line()
            );
        }

        // plain reads stay safe
        let find = ActionRequest::new("find").with_args([".", "-name", "*.rs"]);
        assert_eq!(c.classify(&find).tier, RiskTier::Safe);
        let branches = ActionRequest::new("git").with_args(["branch", "--list"]);
        assert_eq!(c.classify(&branches).tier, RiskTier::Safe);
    }

    #[test]
    fn test_invalid_policy_is_config_error() {
        let mut policy = TierPolicy::default();
        policy
            .sensitive
            .push(claw_foundation::RiskPredicate::regex("(", "broken"));
        assert!(matches!(Classifier::new(&policy), Err(Error::Config(_))));
    }
}
