//! Config - pipeline settings
//!
//! - `pipeline.rs` - PipelineConfig and its sections

mod pipeline;

pub use pipeline::{
    AgentSettings, ApprovalMode, ApprovalSettings, ContainerProfile, ContainerSettings,
    ExecutionSettings, LimitDefaults, PipelineConfig, SandboxMode, SandboxSettings,
    StreamSettings, ENV_PREFIX, PIPELINE_CONFIG_FILE,
};
