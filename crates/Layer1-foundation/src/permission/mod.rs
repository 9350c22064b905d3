//! Trust policy primitives
//!
//! - `tier`: risk tiers and the configurable predicates that assign them
//! - `env`: environment scrubbing for spawned processes

mod env;
mod tier;

pub use env::{pattern_matches, EnvPolicy};
pub use tier::{CompiledPredicate, PatternType, RiskPredicate, RiskTier, TierPolicy};
