//! Pipeline Config - execution, approval and sandbox settings
//!
//! Loaded by merging the global file, the project file and `CLAWMATE_*`
//! environment variables, in that order.

use crate::permission::{EnvPolicy, RiskTier, TierPolicy};
use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Config file name inside a [`JsonStore`]
pub const PIPELINE_CONFIG_FILE: &str = "pipeline.json";

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "CLAWMATE_";

// ============================================================================
// Modes
// ============================================================================

/// How the approval gate treats classified requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Auto-approve up to the configured tier ceiling
    Auto,
    /// Ask a human for every request
    #[default]
    Prompt,
    /// Queue requests into batches for bulk confirmation
    Defer,
}

impl ApprovalMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "prompt" => Some(Self::Prompt),
            "defer" => Some(Self::Defer),
            _ => None,
        }
    }
}

/// Global container policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    /// Never containerize unless a request explicitly asks for it
    Off,
    /// Containerize destructive, swarm and ambiguous requests
    #[default]
    On,
    /// Containerize everything
    Forced,
}

impl SandboxMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "false" => Some(Self::Off),
            "on" | "true" => Some(Self::On),
            "forced" | "force" => Some(Self::Forced),
            _ => None,
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalSettings {
    pub mode: ApprovalMode,
    /// Highest tier that `auto` mode approves without asking
    pub auto_approve_ceiling: RiskTier,
    /// How long a prompt waits before resolving to denied
    pub decision_timeout_secs: u64,
    pub tiers: TierPolicy,
}

impl Default for ApprovalSettings {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::default(),
            auto_approve_ceiling: RiskTier::Sensitive,
            decision_timeout_secs: 120,
            tiers: TierPolicy::default(),
        }
    }
}

impl ApprovalSettings {
    pub fn decision_timeout(&self) -> Duration {
        Duration::from_secs(self.decision_timeout_secs)
    }
}

/// Base profile every ephemeral container starts from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerProfile {
    pub image: String,
    /// Mount point of the request's working directory inside the container
    pub workdir: String,
    /// Docker network mode ("none", "bridge", ...)
    pub network: String,
    pub user: Option<String>,
    pub pids_limit: Option<i64>,
    pub read_only_rootfs: bool,
    pub shell: String,
}

impl Default for ContainerProfile {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            workdir: "/workspace".to_string(),
            network: "none".to_string(),
            user: None,
            pids_limit: Some(256),
            read_only_rootfs: false,
            shell: "/bin/sh".to_string(),
        }
    }
}

/// Default resource ceilings for container plans
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitDefaults {
    pub cpu_shares: i64,
    pub memory_mb: i64,
    pub timeout_secs: u64,
}

impl Default for LimitDefaults {
    fn default() -> Self {
        Self {
            cpu_shares: 512,
            memory_mb: 512,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxSettings {
    pub mode: SandboxMode,
    pub profile: ContainerProfile,
    pub limits: LimitDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionSettings {
    pub default_timeout_secs: u64,
    /// Time between the termination request and the forced kill
    pub kill_grace_ms: u64,
    /// Per-stream capture cap for direct execution
    pub max_output_bytes: usize,
    /// Shell override ("bash", "powershell", "cmd", ...)
    pub shell: Option<String>,
    pub env: EnvPolicy,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_secs: 300,
            kill_grace_ms: 2_000,
            max_output_bytes: 1024 * 1024,
            shell: None,
            env: EnvPolicy::default(),
        }
    }
}

impl ExecutionSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamSettings {
    /// Host sessions run under a pseudo-terminal instead of plain pipes
    pub use_pty: bool,
    pub pty_rows: u16,
    pub pty_cols: u16,
    /// Chunks buffered for an absent subscriber before reads pause
    pub buffer_watermark: usize,
    pub chunk_size: usize,
    pub backpressure_grace_ms: u64,
    /// How long buffered output survives after the process exits
    pub flush_grace_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            use_pty: true,
            pty_rows: 24,
            pty_cols: 120,
            buffer_watermark: 256,
            chunk_size: 4096,
            backpressure_grace_ms: 5_000,
            flush_grace_ms: 1_000,
        }
    }
}

impl StreamSettings {
    pub fn backpressure_grace(&self) -> Duration {
        Duration::from_millis(self.backpressure_grace_ms)
    }

    pub fn flush_grace(&self) -> Duration {
        Duration::from_millis(self.flush_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContainerSettings {
    pub enabled: bool,
    /// Global bound on simultaneously existing containers
    pub max_concurrent_creations: usize,
    /// Fail queued requests with `resource-exhausted` after this long
    pub queue_timeout_secs: Option<u64>,
    /// Ping the runtime at startup and report it in health state
    pub ping_on_start: bool,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_creations: 4,
            queue_timeout_secs: None,
            ping_on_start: true,
        }
    }
}

impl ContainerSettings {
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.queue_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentSettings {
    /// Max simultaneous in-flight actions per session
    pub concurrency_limit: usize,
    pub max_steps: usize,
    pub session_timeout_secs: u64,
    pub cancel_grace_ms: u64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            max_steps: 32,
            session_timeout_secs: 600,
            cancel_grace_ms: 3_000,
        }
    }
}

impl AgentSettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

// ============================================================================
// Pipeline Config
// ============================================================================

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineConfig {
    pub approval: ApprovalSettings,
    pub sandbox: SandboxSettings,
    pub execution: ExecutionSettings,
    pub stream: StreamSettings,
    pub container: ContainerSettings,
    pub agent: AgentSettings,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load / Save
    // ========================================================================

    /// Global + project + environment
    pub fn load() -> Result<Self> {
        let mut stores = Vec::new();
        if let Ok(global) = JsonStore::global() {
            stores.push(global);
        }
        if let Ok(project) = JsonStore::current_project() {
            stores.push(project);
        }
        let mut config = Self::load_from(&stores)?;
        config.apply_env(std::env::vars());
        config.validate()?;
        Ok(config)
    }

    /// Merge the given stores in order, later stores win per key
    pub fn load_from(stores: &[JsonStore]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;
        for store in stores {
            if let Some(layer) = store.load_value(PIPELINE_CONFIG_FILE)? {
                debug!(path = %store.file_path(PIPELINE_CONFIG_FILE).display(), "merging pipeline config");
                merge_json(&mut merged, layer);
            }
        }
        serde_json::from_value(merged).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn save(&self, store: &JsonStore) -> Result<()> {
        store.save(PIPELINE_CONFIG_FILE, self)
    }

    /// Apply `CLAWMATE_*` overrides. Unparseable values are ignored with a warning.
    pub fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let applied = match name {
                "APPROVAL_MODE" => ApprovalMode::parse(&value).map(|m| self.approval.mode = m),
                "APPROVAL_REQUIRED" => parse_bool(&value).map(|required| {
                    if !required {
                        self.approval.mode = ApprovalMode::Auto;
                    }
                }),
                "SANDBOX_MODE" => SandboxMode::parse(&value).map(|m| self.sandbox.mode = m),
                "USE_CONTAINERS" => parse_bool(&value).map(|b| self.container.enabled = b),
                "CONTAINER_IMAGE" => {
                    self.sandbox.profile.image = value.clone();
                    Some(())
                }
                "DOCKER_TIMEOUT" => value
                    .parse()
                    .ok()
                    .map(|secs| self.sandbox.limits.timeout_secs = secs),
                "COMMAND_TIMEOUT" => value
                    .parse()
                    .ok()
                    .map(|secs| self.execution.default_timeout_secs = secs),
                "MAX_CONCURRENT_AGENTS" => value
                    .parse()
                    .ok()
                    .map(|n| self.agent.concurrency_limit = n),
                "AGENT_TIMEOUT" => value
                    .parse()
                    .ok()
                    .map(|secs| self.agent.session_timeout_secs = secs),
                "MAX_CONTAINERS" => value
                    .parse()
                    .ok()
                    .map(|n| self.container.max_concurrent_creations = n),
                "SHELL" => {
                    self.execution.shell = Some(value.clone());
                    Some(())
                }
                _ => Some(()),
            };
            if applied.is_none() {
                warn!("Ignoring invalid value for {}: {}", key, value);
            }
        }
    }

    /// Reject configurations that would break pipeline invariants
    pub fn validate(&self) -> Result<()> {
        if self.agent.concurrency_limit == 0 {
            return Err(Error::Config("agent.concurrencyLimit must be at least 1".into()));
        }
        if self.container.max_concurrent_creations == 0 {
            return Err(Error::Config(
                "container.maxConcurrentCreations must be at least 1".into(),
            ));
        }
        if self.sandbox.limits.memory_mb <= 0 || self.sandbox.limits.timeout_secs == 0 {
            return Err(Error::Config(
                "sandbox.limits must set a positive memory ceiling and timeout".into(),
            ));
        }
        if self.stream.buffer_watermark == 0 || self.stream.chunk_size == 0 {
            return Err(Error::Config("stream buffer sizes must be positive".into()));
        }
        if self.sandbox.profile.image.trim().is_empty() {
            return Err(Error::Config("sandbox.profile.image is empty".into()));
        }
        self.approval.tiers.validate().map_err(Error::Config)
    }
}

/// Recursive object merge, `overlay` wins
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.approval.mode, ApprovalMode::Prompt);
        assert_eq!(config.sandbox.mode, SandboxMode::On);
        assert_eq!(config.agent.concurrency_limit, 4);
        assert_eq!(config.agent.session_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_project_overrides_global() {
        let global_dir = tempfile::tempdir().unwrap();
        let project_dir = tempfile::tempdir().unwrap();
        let global = JsonStore::new(global_dir.path());
        let project = JsonStore::new(project_dir.path());

        global
            .save(
                PIPELINE_CONFIG_FILE,
                &serde_json::json!({
                    "approval": {"mode": "defer", "decisionTimeoutSecs": 30},
                    "agent": {"concurrencyLimit": 8}
                }),
            )
            .unwrap();
        project
            .save(
                PIPELINE_CONFIG_FILE,
                &serde_json::json!({"approval": {"mode": "auto"}}),
            )
            .unwrap();

        let config = PipelineConfig::load_from(&[global, project]).unwrap();
        assert_eq!(config.approval.mode, ApprovalMode::Auto);
        assert_eq!(config.approval.decision_timeout_secs, 30);
        assert_eq!(config.agent.concurrency_limit, 8);
        // untouched sections keep defaults
        assert_eq!(config.sandbox.limits.memory_mb, 512);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config.apply_env(vec![
            ("CLAWMATE_APPROVAL_REQUIRED".to_string(), "false".to_string()),
            ("CLAWMATE_SANDBOX_MODE".to_string(), "forced".to_string()),
            ("CLAWMATE_MAX_CONCURRENT_AGENTS".to_string(), "2".to_string()),
            ("CLAWMATE_DOCKER_TIMEOUT".to_string(), "not-a-number".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        assert_eq!(config.approval.mode, ApprovalMode::Auto);
        assert_eq!(config.sandbox.mode, SandboxMode::Forced);
        assert_eq!(config.agent.concurrency_limit, 2);
        assert_eq!(config.sandbox.limits.timeout_secs, 300);
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let mut config = PipelineConfig::default();
        config.container.max_concurrent_creations = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = PipelineConfig::default();
        config.sandbox.limits.memory_mb = 0;
        assert!(config.validate().is_err());
    }
}
