//! Plan files for `clawmate run`
//!
//! ```json
//! {
//!   "mode": "swarm",
//!   "rounds": [
//!     [{ "kind": "action", "command": "ls", "args": ["-la"] }],
//!     [{ "kind": "tool", "tool": "greet", "params": { "name": "Ann" } }]
//!   ]
//! }
//! ```
//!
//! `steps` is shorthand for one proposal per round.

use claw_agent::{AgentMode, Proposal, ScriptedSource};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    #[serde(default)]
    pub mode: Option<AgentMode>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub rounds: Vec<Vec<Proposal>>,
    #[serde(default)]
    pub steps: Vec<Proposal>,
}

impl Plan {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read plan {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let plan: Plan = serde_json::from_str(content)?;
        if plan.rounds.is_empty() && plan.steps.is_empty() {
            anyhow::bail!("plan has no rounds or steps");
        }
        Ok(plan)
    }

    /// Rounds first, then the single-step proposals
    pub fn into_source(self) -> ScriptedSource {
        let mut source = ScriptedSource::new();
        for round in self.rounds {
            source.push_round(round);
        }
        for step in self.steps {
            source.push_round([step]);
        }
        source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rounds_and_steps() {
        let plan = Plan::parse(
            r#"{
                "mode": "swarm",
                "concurrency": 2,
                "rounds": [[
                    {"kind": "action", "command": "ls"},
                    {"kind": "action", "command": "pwd"}
                ]],
                "steps": [{"kind": "tool", "tool": "greet", "params": {"name": "Ann"}}]
            }"#,
        )
        .unwrap();
        assert_eq!(plan.mode, Some(AgentMode::Swarm));
        assert_eq!(plan.concurrency, Some(2));
        assert_eq!(plan.into_source().remaining(), 2);
    }

    #[test]
    fn test_empty_plan_rejected() {
        assert!(Plan::parse(r#"{"mode": "guided"}"#).is_err());
        assert!(Plan::parse("not json").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, r#"{"steps": [{"kind": "action", "command": "echo"}]}"#).unwrap();
        let plan = Plan::load(&path).unwrap();
        assert!(plan.mode.is_none());
        assert_eq!(plan.steps.len(), 1);
        assert!(Plan::load(&dir.path().join("missing.json")).is_err());
    }
}
