//! # claw-task
//!
//! Command execution and approval pipeline for ClawMate.
//! Turns an agent's requested action into host or container execution,
//! gated by a three-tier approval policy.
//!
//! ## Features
//!
//! - Risk classification and approval gate (auto / prompt / defer)
//! - Per-request sandbox selection (host or ephemeral container)
//! - Host execution through the platform shell with timeouts and bounded capture
//! - Container execution with a global FIFO creation bound
//! - **Live stream sessions over PTYs, pipes and container execs**
//! - **Single-subscriber output with backpressure and reattach**

pub mod action;
pub mod approval;
pub mod executor;
pub mod pipeline;
pub mod sandbox;
pub mod state;
pub mod stream;

// Requests and results
pub use action::{
    ActionFailure, ActionId, ActionRequest, ActionResult, ExecMode, ExecStatus, Location,
    SandboxOverride,
};
pub use state::ActionState;

// Approval
pub use approval::{
    ApprovalDecision, ApprovalEvent, ApprovalGate, BatchId, Classification, Classifier,
    DecisionOutcome, PendingApproval, PendingKind, Ticket,
};

// Sandbox
pub use sandbox::{ExecutionTarget, PlanTarget, ResourceLimits, SandboxPlan, SandboxSelector};

// Executors
pub use executor::{
    ContainerBackend, ContainerLease, ContainerRuntime, ContainerSpec, DockerBackend, ExecHandle,
    ExecSpec, Executor, LogChunk, ShellAdapter, ShellInfo, ShellKind, ShellOutput,
};

// Stream sessions
pub use stream::{
    ChunkSource, ChunkStream, ExitInfo, OutputChunk, ProcessControl, SessionId, SessionOptions,
    SessionState, StreamSession,
};

// Pipeline
pub use pipeline::{ActionRecord, Approval, Pipeline, RunContext};
