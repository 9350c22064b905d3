//! # claw-foundation
//!
//! Foundation layer for ClawMate:
//! - Error: shared error type and the failure kinds reported on results
//! - Permission: risk tiers, tier predicates and environment scrubbing
//! - Config: pipeline settings (approval, sandbox, execution, stream, container, agent)
//! - Storage: JsonStore (global + project config files)

pub mod config;
pub mod error;
pub mod permission;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, ErrorKind, Result};

// ============================================================================
// Permission
// ============================================================================
pub use permission::{
    pattern_matches, CompiledPredicate, EnvPolicy, PatternType, RiskPredicate, RiskTier,
    TierPolicy,
};

// ============================================================================
// Config
// ============================================================================
pub use config::{
    AgentSettings, ApprovalMode, ApprovalSettings, ContainerProfile, ContainerSettings,
    ExecutionSettings, LimitDefaults, PipelineConfig, SandboxMode, SandboxSettings,
    StreamSettings,
};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
