//! # claw-agent
//!
//! Agent orchestration for ClawMate: sequences proposed actions through the
//! execution pipeline according to the session's mode.
//!
//! ## Components
//!
//! - **Orchestrator**: runs sessions, owns cancellation and the swarm summary
//! - **Variant**: one handler per mode (assist / guided / autonomous / swarm)
//! - **Source**: where proposed actions come from (model layer seam)
//! - **Tool Router**: skill tools resolved into action requests
//! - **Health**: explicit health state passed into sessions
//!
//! ## Usage
//!
//! ```ignore
//! use claw_agent::{AgentMode, Orchestrator, ScriptedSource};
//!
//! let orchestrator = Orchestrator::new(pipeline, tools, health);
//! let session = orchestrator.session(AgentMode::Autonomous);
//! let mut source = ScriptedSource::steps([ActionRequest::new("ls")]);
//! let finished = orchestrator.run(session, &mut source).await;
//! println!("{}: {} actions", finished.status(), finished.history().len());
//! ```

pub mod health;
pub mod orchestrator;
pub mod session;
pub mod source;
pub mod tool_router;
pub mod variant;

pub use health::{ContainerHealth, HealthState};
pub use orchestrator::{Orchestrator, SwarmStatus};
pub use session::{is_fault, AgentSession, Halt, SessionStatus};
pub use source::{ActionSource, Proposal, ScriptedSource};
pub use tool_router::{Entrypoint, SkillInfo, ToolCall, ToolContract, ToolParam, ToolRegistry};
pub use variant::{
    AgentMode, AssistHandler, AutonomousHandler, GuidedHandler, ModeHandler, Step, SwarmHandler,
};
