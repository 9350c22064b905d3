//! Action sources - where proposed actions come from
//!
//! The model layer implements [`ActionSource`]; the orchestrator asks it for
//! a new round whenever the session's queue runs dry.

use crate::tool_router::ToolCall;
use async_trait::async_trait;
use claw_foundation::Result;
use claw_task::{ActionRecord, ActionRequest};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One proposed action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Proposal {
    Action(ActionRequest),
    Tool(ToolCall),
}

impl From<ActionRequest> for Proposal {
    fn from(request: ActionRequest) -> Self {
        Proposal::Action(request)
    }
}

impl From<ToolCall> for Proposal {
    fn from(call: ToolCall) -> Self {
        Proposal::Tool(call)
    }
}

/// Producer of proposed actions
#[async_trait]
pub trait ActionSource: Send {
    /// Next round given everything recorded so far. An empty round ends the
    /// workflow.
    async fn propose(&mut self, history: &[ActionRecord]) -> Result<Vec<Proposal>>;

    /// The source talks to the model server
    fn requires_model(&self) -> bool {
        false
    }
}

/// Replays fixed rounds
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    rounds: VecDeque<Vec<Proposal>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each proposal becomes its own round
    pub fn steps<I, P>(proposals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Proposal>,
    {
        Self {
            rounds: proposals.into_iter().map(|p| vec![p.into()]).collect(),
        }
    }

    /// All proposals in a single round
    pub fn batch<I, P>(proposals: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Proposal>,
    {
        let mut source = Self::new();
        source.push_round(proposals);
        source
    }

    pub fn push_round<I, P>(&mut self, proposals: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<Proposal>,
    {
        self.rounds
            .push_back(proposals.into_iter().map(Into::into).collect());
    }

    pub fn remaining(&self) -> usize {
        self.rounds.len()
    }
}

#[async_trait]
impl ActionSource for ScriptedSource {
    async fn propose(&mut self, _history: &[ActionRecord]) -> Result<Vec<Proposal>> {
        Ok(self.rounds.pop_front().unwrap_or_default())
    }
}
