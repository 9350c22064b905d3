//! Health state handed to agent sessions
//!
//! The host process owns one value and passes it into every session it
//! builds, so tests can construct any combination directly.

use claw_task::{Executor, Pipeline};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Container engine reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContainerHealth {
    /// Never probed
    #[default]
    Unknown,
    Available,
    Unavailable,
    /// Turned off in configuration
    Disabled,
}

/// What the orchestrator knows about its collaborators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
    /// The model server answered its last check
    pub model_connected: bool,
    /// Skills were loaded into the tool registry
    pub skills_loaded: bool,
    /// Number of tools the registry resolved
    pub tool_count: usize,
    pub container: ContainerHealth,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, connected: bool) -> Self {
        self.model_connected = connected;
        self
    }

    pub fn with_skills(mut self, loaded: bool, tool_count: usize) -> Self {
        self.skills_loaded = loaded;
        self.tool_count = tool_count;
        self
    }

    pub fn with_container(mut self, container: ContainerHealth) -> Self {
        self.container = container;
        self
    }

    /// Ping the pipeline's container runtime and record the answer
    pub async fn probe_containers(mut self, pipeline: &Pipeline) -> Self {
        self.container = match pipeline.container_runtime() {
            None => ContainerHealth::Disabled,
            Some(runtime) => match runtime.ping().await {
                Ok(()) => {
                    debug!("container engine {} reachable", runtime.backend_name());
                    ContainerHealth::Available
                }
                Err(e) => {
                    warn!("container engine unreachable: {}", e);
                    ContainerHealth::Unavailable
                }
            },
        };
        self
    }

    /// Container execution can be attempted
    pub fn containers_ready(&self) -> bool {
        self.container == ContainerHealth::Available
    }

    /// Refresh the container field from the runtime's last ping without a
    /// new round trip
    pub fn observe(mut self, pipeline: &Pipeline) -> Self {
        self.container = match pipeline.container_runtime() {
            None => ContainerHealth::Disabled,
            Some(runtime) if runtime.is_available() => ContainerHealth::Available,
            Some(_) if self.container == ContainerHealth::Unknown => ContainerHealth::Unknown,
            Some(_) => ContainerHealth::Unavailable,
        };
        self
    }
}
