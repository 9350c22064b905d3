//! Executor trait

use crate::action::{ActionRequest, ActionResult};
use crate::sandbox::SandboxPlan;
use crate::stream::StreamSession;
use async_trait::async_trait;
use claw_foundation::Result;
use tokio_util::sync::CancellationToken;

/// Executor trait - implement to add new execution backends
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a request to completion. Cancelling the token terminates the
    /// process (or container) within the kill grace period.
    async fn run(
        &self,
        request: &ActionRequest,
        plan: &SandboxPlan,
        cancel: &CancellationToken,
    ) -> Result<ActionResult>;

    /// Start a streamed session for a request
    async fn open(&self, request: &ActionRequest, plan: &SandboxPlan) -> Result<StreamSession>;

    /// Check if the executor can currently run anything
    fn is_available(&self) -> bool;

    /// Get executor name
    fn name(&self) -> &'static str;
}
