//! Approval Gate
//!
//! - `classifier` - maps requests to risk tiers using the configured predicates
//! - `gate` - auto / prompt / defer decisions, pending queue and batches

mod classifier;
mod gate;

pub use classifier::{Classification, Classifier};
pub use gate::{
    ApprovalDecision, ApprovalEvent, ApprovalGate, BatchId, DecisionOutcome, PendingApproval,
    PendingKind, Ticket,
};
