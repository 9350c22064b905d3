//! Action definition and types
//!
//! An [`ActionRequest`] is one proposed command invocation. It is built once
//! (by the orchestrator, the transport layer or a tool contract) and never
//! mutated afterwards; everything downstream only reads it.

use chrono::{DateTime, Utc};
use claw_foundation::{Error, ErrorKind, Result, RiskTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for an action request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub Uuid);

impl ActionId {
    /// Generate a new random ActionId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// First 8 characters, for log lines
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How output is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecMode {
    /// Run to completion and return captured output
    #[default]
    Direct,
    /// Open a session that emits output chunks while running
    Streamed,
}

/// Per-action placement override
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxOverride {
    Host,
    Container,
}

fn default_origin() -> String {
    "anonymous".to_string()
}

/// A single proposed command invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    #[serde(default)]
    id: ActionId,

    command: String,

    #[serde(default)]
    args: Vec<String>,

    #[serde(default)]
    cwd: Option<PathBuf>,

    #[serde(default)]
    env: HashMap<String, String>,

    #[serde(default)]
    mode: ExecMode,

    #[serde(default)]
    declared_tier: RiskTier,

    /// Agent session (or client) that produced the request
    #[serde(default = "default_origin")]
    origin: String,

    #[serde(default)]
    sandbox: Option<SandboxOverride>,

    #[serde(default)]
    timeout_ms: Option<u64>,

    /// Tool that produced the request, if any
    #[serde(default)]
    tool: Option<String>,

    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
}

impl ActionRequest {
    /// Create a new request for `command`
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: ActionId::new(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            mode: ExecMode::Direct,
            declared_tier: RiskTier::Safe,
            origin: default_origin(),
            sandbox: None,
            timeout_ms: None,
            tool: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_tier(mut self, tier: RiskTier) -> Self {
        self.declared_tier = tier;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxOverride) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn declared_tier(&self) -> RiskTier {
        self.declared_tier
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn sandbox(&self) -> Option<SandboxOverride> {
        self.sandbox
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub fn tool(&self) -> Option<&str> {
        self.tool.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Command and arguments joined for display and classification
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Reject malformed requests before they reach classification
    pub fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(Error::InvalidRequest("command is empty".into()));
        }
        if self.command.contains('\0') || self.args.iter().any(|a| a.contains('\0')) {
            return Err(Error::InvalidRequest(
                "command or argument contains a NUL byte".into(),
            ));
        }
        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') || value.contains('\0') {
                return Err(Error::InvalidRequest(format!(
                    "invalid environment variable '{}'",
                    key
                )));
            }
        }
        if let Some(cwd) = &self.cwd {
            if !cwd.is_dir() {
                return Err(Error::InvalidRequest(format!(
                    "working directory '{}' does not exist",
                    cwd.display()
                )));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(Error::InvalidRequest("timeout must be positive".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Result
// ============================================================================

/// Final status of an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecStatus {
    /// Process exited on its own (any exit code)
    Completed,
    /// Wall-clock limit exceeded, process killed
    TimedOut,
    /// Terminated by cancellation or a forced stream close
    Killed,
    /// Never ran, or the runtime failed
    Failed,
}

impl ExecStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecStatus::Completed => "completed",
            ExecStatus::TimedOut => "timed-out",
            ExecStatus::Killed => "killed",
            ExecStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an action ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "kebab-case")]
pub enum Location {
    Host,
    Container(String),
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Host => f.write_str("host"),
            Location::Container(id) => write!(f, "container:{}", id),
        }
    }
}

/// Pipeline-side failure, kept apart from process stderr
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    pub kind: ErrorKind,
    pub cause: String,
}

impl From<&Error> for ActionFailure {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            cause: err.to_string(),
        }
    }
}

/// Result of one action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    pub request_id: ActionId,

    /// Absent when killed or never started
    pub exit_code: Option<i32>,

    pub status: ExecStatus,

    pub mode: ExecMode,

    #[serde(default)]
    pub stdout: String,

    #[serde(default)]
    pub stderr: String,

    #[serde(default)]
    pub stdout_truncated: bool,

    #[serde(default)]
    pub stderr_truncated: bool,

    pub duration_ms: u64,

    pub location: Location,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ActionFailure>,
}

impl ActionResult {
    /// A result that carries no execution, only the reason it failed
    pub fn failed(request_id: ActionId, err: &Error) -> Self {
        let status = match err.kind() {
            ErrorKind::ExecutionTimeout => ExecStatus::TimedOut,
            ErrorKind::Cancelled | ErrorKind::StreamDisconnected => ExecStatus::Killed,
            _ => ExecStatus::Failed,
        };
        Self {
            request_id,
            exit_code: None,
            status,
            mode: ExecMode::Direct,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            duration_ms: 0,
            location: Location::Host,
            failure: Some(ActionFailure::from(err)),
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = location;
        self
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Completed with exit code 0
    pub fn is_success(&self) -> bool {
        self.status == ExecStatus::Completed && self.exit_code == Some(0)
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    pub fn is_timed_out(&self) -> bool {
        self.status == ExecStatus::TimedOut
    }
}
