//! Sandbox Selector
//!
//! Decides per request whether execution happens on the host or inside an
//! ephemeral container.
//!
//! ## Precedence
//!
//! 1. Global mode `forced` → container
//! 2. Explicit per-action override
//! 3. Global mode `off` → host
//! 4. Mode `on`: destructive tier, swarm sessions and ambiguous
//!    classifications → container
//! 5. Everything else → host
//!
//! A container plan always carries resource limits; the type does not allow
//! one without them.

use crate::action::{ActionId, ActionRequest, SandboxOverride};
use crate::approval::Classification;
use claw_foundation::{ContainerProfile, LimitDefaults, RiskTier, SandboxMode, SandboxSettings};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Plan Types
// ============================================================================

/// Execution target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionTarget {
    Host,
    Container,
}

/// Limits applied to a container plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// Relative CPU weight
    pub cpu_shares: i64,

    /// Memory ceiling in bytes
    pub memory_bytes: i64,

    /// Wall-clock timeout
    pub timeout_ms: u64,
}

impl ResourceLimits {
    pub fn from_defaults(defaults: &LimitDefaults) -> Self {
        Self {
            cpu_shares: defaults.cpu_shares.max(2),
            memory_bytes: defaults.memory_mb.max(4).saturating_mul(1024 * 1024),
            timeout_ms: defaults.timeout_secs.max(1).saturating_mul(1000),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Replace the timeout, ignoring zero
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let ms = timeout.as_millis() as u64;
        if ms > 0 {
            self.timeout_ms = ms;
        }
        self
    }
}

/// Where a plan sends the request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "kebab-case")]
pub enum PlanTarget {
    Host,
    Container {
        profile: ContainerProfile,
        limits: ResourceLimits,
    },
}

/// Placement decision for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPlan {
    pub request_id: ActionId,
    pub target: PlanTarget,
    /// Which rule selected the target
    pub reason: String,
}

impl SandboxPlan {
    pub fn host(request_id: ActionId, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            target: PlanTarget::Host,
            reason: reason.into(),
        }
    }

    pub fn container(
        request_id: ActionId,
        profile: ContainerProfile,
        limits: ResourceLimits,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            target: PlanTarget::Container { profile, limits },
            reason: reason.into(),
        }
    }

    pub fn execution_target(&self) -> ExecutionTarget {
        match self.target {
            PlanTarget::Host => ExecutionTarget::Host,
            PlanTarget::Container { .. } => ExecutionTarget::Container,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self.target, PlanTarget::Container { .. })
    }

    pub fn limits(&self) -> Option<&ResourceLimits> {
        match &self.target {
            PlanTarget::Container { limits, .. } => Some(limits),
            PlanTarget::Host => None,
        }
    }

    pub fn profile(&self) -> Option<&ContainerProfile> {
        match &self.target {
            PlanTarget::Container { profile, .. } => Some(profile),
            PlanTarget::Host => None,
        }
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Per-request placement policy
#[derive(Debug, Clone)]
pub struct SandboxSelector {
    mode: SandboxMode,
    profile: ContainerProfile,
    limits: LimitDefaults,
}

impl SandboxSelector {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            mode: settings.mode,
            profile: settings.profile.clone(),
            limits: settings.limits.clone(),
        }
    }

    pub fn mode(&self) -> SandboxMode {
        self.mode
    }

    /// Plan a request. `swarm` is true when the owning session runs in swarm mode.
    pub fn plan(
        &self,
        request: &ActionRequest,
        classification: &Classification,
        swarm: bool,
    ) -> SandboxPlan {
        let plan = match self.route(request, classification, swarm) {
            (ExecutionTarget::Host, reason) => SandboxPlan::host(request.id(), reason),
            (ExecutionTarget::Container, reason) => {
                let mut limits = ResourceLimits::from_defaults(&self.limits);
                if let Some(timeout) = request.timeout() {
                    limits = limits.with_timeout(timeout);
                }
                SandboxPlan::container(request.id(), self.profile.clone(), limits, reason)
            }
        };
        debug!(
            request = %request.id().short(),
            target = ?plan.execution_target(),
            reason = %plan.reason,
            "sandbox plan"
        );
        plan
    }

    fn route(
        &self,
        request: &ActionRequest,
        classification: &Classification,
        swarm: bool,
    ) -> (ExecutionTarget, &'static str) {
        if self.mode == SandboxMode::Forced {
            return (ExecutionTarget::Container, "containerization forced");
        }
        match request.sandbox() {
            Some(SandboxOverride::Container) => {
                return (ExecutionTarget::Container, "per-action override")
            }
            Some(SandboxOverride::Host) => return (ExecutionTarget::Host, "per-action override"),
            None => {}
        }
        if self.mode == SandboxMode::Off {
            return (ExecutionTarget::Host, "sandbox off");
        }
        if classification.tier == RiskTier::Destructive {
            (ExecutionTarget::Container, "destructive tier")
        } else if swarm {
            (ExecutionTarget::Container, "swarm session")
        } else if classification.ambiguous {
            (ExecutionTarget::Container, "ambiguous classification")
        } else {
            (ExecutionTarget::Host, "default")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(mode: SandboxMode) -> SandboxSelector {
        SandboxSelector::new(&SandboxSettings {
            mode,
            ..Default::default()
        })
    }

    fn classified(tier: RiskTier, ambiguous: bool) -> Classification {
        Classification {
            tier,
            ambiguous,
            reasons: Vec::new(),
        }
    }

    #[test]
    fn test_safe_goes_to_host() {
        let plan = selector(SandboxMode::On).plan(
            &ActionRequest::new("ls"),
            &classified(RiskTier::Safe, false),
            false,
        );
        assert_eq!(plan.execution_target(), ExecutionTarget::Host);
        assert!(plan.limits().is_none());
    }

    #[test]
    fn test_destructive_swarm_and_ambiguous_go_to_container() {
        let s = selector(SandboxMode::On);
        let req = ActionRequest::new("x");
        assert!(s.plan(&req, &classified(RiskTier::Destructive, false), false).is_container());
        assert!(s.plan(&req, &classified(RiskTier::Safe, false), true).is_container());
        assert!(s.plan(&req, &classified(RiskTier::Sensitive, true), false).is_container());
        assert!(!s.plan(&req, &classified(RiskTier::Sensitive, false), false).is_container());
    }

    #[test]
    fn test_override_precedence() {
        let req = ActionRequest::new("rm").with_sandbox(SandboxOverride::Host);
        let destructive = classified(RiskTier::Destructive, false);
        assert!(!selector(SandboxMode::On).plan(&req, &destructive, false).is_container());
        // forced beats the override
        assert!(selector(SandboxMode::Forced).plan(&req, &destructive, false).is_container());

        let req = ActionRequest::new("ls").with_sandbox(SandboxOverride::Container);
        assert!(selector(SandboxMode::Off)
            .plan(&req, &classified(RiskTier::Safe, false), false)
            .is_container());
    }

    #[test]
    fn test_off_mode_routes_to_host() {
        let plan = selector(SandboxMode::Off).plan(
            &ActionRequest::new("rm"),
            &classified(RiskTier::Destructive, false),
            true,
        );
        assert!(!plan.is_container());
    }

    #[test]
    fn test_container_plan_always_has_limits() {
        let req = ActionRequest::new("ls").with_timeout(Duration::from_secs(5));
        let plan = selector(SandboxMode::Forced).plan(&req, &classified(RiskTier::Safe, false), false);
        let limits = plan.limits().unwrap();
        assert_eq!(limits.timeout(), Duration::from_secs(5));
        assert_eq!(limits.memory_bytes, 512 * 1024 * 1024);
        assert!(limits.cpu_shares > 0);
        assert_eq!(plan.profile().unwrap().workdir, "/workspace");
    }

    #[test]
    fn test_huge_limits_saturate() {
        let limits = ResourceLimits::from_defaults(&LimitDefaults {
            memory_mb: i64::MAX / 2,
            timeout_secs: u64::MAX / 10,
            ..Default::default()
        });
        assert_eq!(limits.memory_bytes, i64::MAX);
        assert_eq!(limits.timeout_ms, u64::MAX);
    }
}
