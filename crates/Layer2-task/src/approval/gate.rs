//! Approval Gate
//!
//! Per-request state machine:
//!
//! ```text
//! pending ──► auto-approved
//!    │
//!    ├──────► approved / denied      (prompt: resolve() or decision timeout)
//!    │
//!    └──────► deferred ──► approved / denied   (resolve_batch() only)
//! ```
//!
//! The gate never executes anything. Callers hold a [`Ticket`] and wait on it;
//! execution may only start once [`ApprovalGate::is_approved`] holds.

use super::classifier::{Classification, Classifier};
use crate::action::{ActionId, ActionRequest};
use chrono::{DateTime, Utc};
use claw_foundation::{ApprovalMode, ApprovalSettings, Error, Result, RiskTier};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identifier of a deferred batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of an approval decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionOutcome {
    AutoApproved,
    Approved,
    Denied,
    Deferred,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::AutoApproved => "auto-approved",
            DecisionOutcome::Approved => "approved",
            DecisionOutcome::Denied => "denied",
            DecisionOutcome::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for DecisionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision record for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalDecision {
    pub request_id: ActionId,
    pub outcome: DecisionOutcome,
    pub tier: RiskTier,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<BatchId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn new(request_id: ActionId, outcome: DecisionOutcome, tier: RiskTier) -> Self {
        Self {
            request_id,
            outcome,
            tier,
            timestamp: Utc::now(),
            batch_id: None,
            reason: None,
        }
    }

    pub fn with_batch(mut self, batch_id: Option<BatchId>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Approved or auto-approved
    pub fn is_approved(&self) -> bool {
        matches!(
            self.outcome,
            DecisionOutcome::AutoApproved | DecisionOutcome::Approved
        )
    }

    /// Approved, auto-approved or denied
    pub fn is_terminal(&self) -> bool {
        self.outcome != DecisionOutcome::Deferred
    }
}

/// Why a request is waiting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PendingKind {
    Prompt,
    Deferred,
}

/// A queue entry surfaced to approval UIs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub request_id: ActionId,
    pub kind: PendingKind,
    pub tier: RiskTier,
    pub ambiguous: bool,
    pub reasons: Vec<String>,
    pub command_line: String,
    pub origin: String,
    pub batch_id: Option<BatchId>,
    pub submitted_at: DateTime<Utc>,
}

/// Events for approval UIs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ApprovalEvent {
    /// A prompt is waiting for a human
    Requested(PendingApproval),
    /// A request joined the open batch
    Deferred(PendingApproval),
    /// A batch is ready for bulk confirmation
    BatchSealed {
        batch_id: BatchId,
        requests: Vec<ActionId>,
    },
    /// A decision became terminal
    Resolved(ApprovalDecision),
}

/// What a caller waits on after submitting
pub struct Ticket {
    request_id: ActionId,
    classification: Classification,
    state: TicketState,
}

enum TicketState {
    Ready(ApprovalDecision),
    Prompt(oneshot::Receiver<bool>),
    Deferred {
        batch_id: BatchId,
        rx: oneshot::Receiver<bool>,
    },
}

impl Ticket {
    pub fn request_id(&self) -> ActionId {
        self.request_id
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Batch the request joined, when deferred
    pub fn batch_id(&self) -> Option<BatchId> {
        match &self.state {
            TicketState::Deferred { batch_id, .. } => Some(*batch_id),
            _ => None,
        }
    }

    /// Decided without waiting
    pub fn is_ready(&self) -> bool {
        matches!(self.state, TicketState::Ready(_))
    }
}

struct Waiting {
    entry: PendingApproval,
    tx: oneshot::Sender<bool>,
}

struct Batch {
    members: Vec<ActionId>,
}

#[derive(Default)]
struct GateState {
    mode: Option<ApprovalMode>,
    waiting: HashMap<ActionId, Waiting>,
    batches: HashMap<BatchId, Batch>,
    open_batch: Option<BatchId>,
    decisions: HashMap<ActionId, ApprovalDecision>,
}

/// Approval gate shared by every session of a host process
pub struct ApprovalGate {
    classifier: Classifier,
    mode: ApprovalMode,
    auto_ceiling: RiskTier,
    decision_timeout: Duration,
    state: Mutex<GateState>,
    events: broadcast::Sender<ApprovalEvent>,
}

impl ApprovalGate {
    pub fn new(settings: &ApprovalSettings) -> Result<Self> {
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            classifier: Classifier::new(&settings.tiers)?,
            mode: settings.mode,
            auto_ceiling: settings.auto_approve_ceiling,
            decision_timeout: settings.decision_timeout(),
            state: Mutex::new(GateState::default()),
            events,
        })
    }

    /// Current approval mode
    pub fn mode(&self) -> ApprovalMode {
        self.state.lock().mode.unwrap_or(self.mode)
    }

    /// Switch mode at runtime. Requests already waiting keep their state.
    pub fn set_mode(&self, mode: ApprovalMode) {
        self.state.lock().mode = Some(mode);
        info!("Approval mode set to {:?}", mode);
    }

    pub fn classify(&self, request: &ActionRequest) -> Classification {
        self.classifier.classify(request)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Classify a request and apply the initial transition
    pub fn submit(&self, request: &ActionRequest) -> Result<Ticket> {
        let classification = self.classify(request);
        self.submit_classified(request, classification)
    }

    /// Apply the initial transition to an already classified request
    pub fn submit_classified(
        &self,
        request: &ActionRequest,
        classification: Classification,
    ) -> Result<Ticket> {
        let id = request.id();
        let tier = classification.tier;
        let mut state = self.state.lock();

        if state.decisions.contains_key(&id) || state.waiting.contains_key(&id) {
            return Err(Error::InvalidRequest(format!(
                "request {} was already submitted for approval",
                id
            )));
        }

        let mode = state.mode.unwrap_or(self.mode);
        let auto = mode == ApprovalMode::Auto && tier <= self.auto_ceiling;

        if auto {
            let decision = ApprovalDecision::new(id, DecisionOutcome::AutoApproved, tier);
            state.decisions.insert(id, decision.clone());
            drop(state);
            debug!(request = %id.short(), %tier, "auto-approved");
            let _ = self.events.send(ApprovalEvent::Resolved(decision.clone()));
            return Ok(Ticket {
                request_id: id,
                classification,
                state: TicketState::Ready(decision),
            });
        }

        let (tx, rx) = oneshot::channel();
        let mut entry = PendingApproval {
            request_id: id,
            kind: PendingKind::Prompt,
            tier,
            ambiguous: classification.ambiguous,
            reasons: classification.reasons.clone(),
            command_line: request.command_line(),
            origin: request.origin().to_string(),
            batch_id: None,
            submitted_at: Utc::now(),
        };

        let ticket_state = if mode == ApprovalMode::Defer {
            let batch_id = match state.open_batch {
                Some(batch_id) => batch_id,
                None => {
                    let batch_id = BatchId::new();
                    state.batches.insert(
                        batch_id,
                        Batch {
                            members: Vec::new(),
                        },
                    );
                    state.open_batch = Some(batch_id);
                    batch_id
                }
            };
            if let Some(batch) = state.batches.get_mut(&batch_id) {
                batch.members.push(id);
            }
            entry.kind = PendingKind::Deferred;
            entry.batch_id = Some(batch_id);
            state.decisions.insert(
                id,
                ApprovalDecision::new(id, DecisionOutcome::Deferred, tier)
                    .with_batch(Some(batch_id)),
            );
            TicketState::Deferred { batch_id, rx }
        } else {
            TicketState::Prompt(rx)
        };

        state.waiting.insert(
            id,
            Waiting {
                entry: entry.clone(),
                tx,
            },
        );
        drop(state);

        let event = match entry.kind {
            PendingKind::Prompt => ApprovalEvent::Requested(entry),
            PendingKind::Deferred => ApprovalEvent::Deferred(entry),
        };
        let _ = self.events.send(event);

        Ok(Ticket {
            request_id: id,
            classification,
            state: ticket_state,
        })
    }

    /// Wait until the ticket's decision is terminal.
    ///
    /// Prompts resolve to denied after the decision timeout. Deferred requests
    /// wait for their batch without a deadline; dropping this future leaves the
    /// entry queued.
    pub async fn wait(&self, ticket: Ticket) -> ApprovalDecision {
        let id = ticket.request_id;
        match ticket.state {
            TicketState::Ready(decision) => decision,
            TicketState::Prompt(rx) => {
                match tokio::time::timeout(self.decision_timeout, rx).await {
                    Ok(_) => self.settled(id),
                    Err(_) => {
                        warn!(request = %id.short(), "approval timed out");
                        self.settle(id, false, Some("decision timed out"))
                            .unwrap_or_else(|| self.settled(id))
                    }
                }
            }
            TicketState::Deferred { rx, .. } => {
                let _ = rx.await;
                self.settled(id)
            }
        }
    }

    /// Submit and wait in one step
    pub async fn decide(&self, request: &ActionRequest) -> Result<(Classification, ApprovalDecision)> {
        let ticket = self.submit(request)?;
        let classification = ticket.classification().clone();
        let decision = self.wait(ticket).await;
        Ok((classification, decision))
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve a prompt. Deferred requests only resolve through their batch.
    pub fn resolve(&self, id: ActionId, approve: bool) -> Result<ApprovalDecision> {
        {
            let state = self.state.lock();
            match state.waiting.get(&id) {
                Some(w) if w.entry.kind == PendingKind::Deferred => {
                    return Err(Error::InvalidRequest(format!(
                        "request {} is deferred, resolve its batch instead",
                        id
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(Error::InvalidRequest(format!(
                        "no pending approval for request {}",
                        id
                    )));
                }
            }
        }
        self.settle(id, approve, None)
            .ok_or_else(|| Error::InvalidRequest(format!("request {} is already resolved", id)))
    }

    /// Close the open batch and surface it for bulk confirmation
    pub fn seal_batch(&self) -> Option<BatchId> {
        let (batch_id, members) = {
            let mut state = self.state.lock();
            let batch_id = state.open_batch.take()?;
            let batch = state.batches.get(&batch_id)?;
            (batch_id, batch.members.clone())
        };
        info!("Sealed approval batch {} ({} requests)", batch_id, members.len());
        let _ = self.events.send(ApprovalEvent::BatchSealed {
            batch_id,
            requests: members,
        });
        Some(batch_id)
    }

    /// Approve or deny every request of a batch. An open batch is sealed first.
    pub fn resolve_batch(&self, batch_id: BatchId, approve: bool) -> Result<Vec<ApprovalDecision>> {
        let members = {
            let mut state = self.state.lock();
            if state.open_batch == Some(batch_id) {
                state.open_batch = None;
            }
            let batch = state
                .batches
                .remove(&batch_id)
                .ok_or_else(|| Error::InvalidRequest(format!("unknown batch {}", batch_id)))?;
            batch.members
        };

        let decisions: Vec<ApprovalDecision> = members
            .into_iter()
            .filter_map(|id| self.settle(id, approve, None))
            .collect();
        info!(
            "Resolved batch {}: {} requests {}",
            batch_id,
            decisions.len(),
            if approve { "approved" } else { "denied" }
        );
        Ok(decisions)
    }

    /// Deny every waiting request of one origin (session teardown)
    pub fn abandon(&self, origin: &str) -> usize {
        let ids: Vec<ActionId> = self
            .state
            .lock()
            .waiting
            .values()
            .filter(|w| w.entry.origin == origin)
            .map(|w| w.entry.request_id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.settle(id, false, Some("session ended")))
            .count()
    }

    /// Drop terminal decisions, and batches with nothing left waiting.
    /// Requests still waiting are kept.
    pub fn forget<I>(&self, ids: I) -> usize
    where
        I: IntoIterator<Item = ActionId>,
    {
        let mut state = self.state.lock();
        let mut forgotten = 0;
        for id in ids {
            if state.waiting.contains_key(&id) {
                continue;
            }
            if state.decisions.get(&id).is_some_and(|d| d.is_terminal()) {
                state.decisions.remove(&id);
                forgotten += 1;
            }
        }
        let GateState {
            waiting,
            batches,
            open_batch,
            ..
        } = &mut *state;
        batches.retain(|batch_id, batch| {
            *open_batch == Some(*batch_id) || batch.members.iter().any(|m| waiting.contains_key(m))
        });
        forgotten
    }

    fn settle(&self, id: ActionId, approve: bool, reason: Option<&str>) -> Option<ApprovalDecision> {
        let decision = {
            let mut state = self.state.lock();
            let waiting = state.waiting.remove(&id)?;
            let outcome = if approve {
                DecisionOutcome::Approved
            } else {
                DecisionOutcome::Denied
            };
            let mut decision = ApprovalDecision::new(id, outcome, waiting.entry.tier)
                .with_batch(waiting.entry.batch_id);
            if let Some(reason) = reason {
                decision = decision.with_reason(reason);
            }
            state.decisions.insert(id, decision.clone());
            let _ = waiting.tx.send(approve);
            decision
        };
        debug!(request = %id.short(), outcome = %decision.outcome, "approval resolved");
        let _ = self.events.send(ApprovalEvent::Resolved(decision.clone()));
        Some(decision)
    }

    fn settled(&self, id: ActionId) -> ApprovalDecision {
        self.state
            .lock()
            .decisions
            .get(&id)
            .filter(|d| d.is_terminal())
            .cloned()
            .unwrap_or_else(|| {
                ApprovalDecision::new(id, DecisionOutcome::Denied, RiskTier::Destructive)
                    .with_reason("approval channel closed")
            })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Pending and deferred entries, oldest first
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut entries: Vec<PendingApproval> = self
            .state
            .lock()
            .waiting
            .values()
            .map(|w| w.entry.clone())
            .collect();
        entries.sort_by_key(|e| e.submitted_at);
        entries
    }

    pub fn decision(&self, id: ActionId) -> Option<ApprovalDecision> {
        self.state.lock().decisions.get(&id).cloned()
    }

    /// Whether the request may execute
    pub fn is_approved(&self, id: ActionId) -> bool {
        self.state
            .lock()
            .decisions
            .get(&id)
            .map(|d| d.is_approved())
            .unwrap_or(false)
    }

    /// The currently open (unsealed) batch
    pub fn open_batch(&self) -> Option<BatchId> {
        self.state.lock().open_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(mode: ApprovalMode) -> ApprovalGate {
        ApprovalGate::new(&ApprovalSettings {
            mode,
            decision_timeout_secs: 1,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_auto_mode_safe_is_immediate() {
        let gate = gate(ApprovalMode::Auto);
        let request = ActionRequest::new("ls");
        let ticket = gate.submit(&request).unwrap();
        assert!(ticket.is_ready());
        let decision = gate.wait(ticket).await;
        assert_eq!(decision.outcome, DecisionOutcome::AutoApproved);
        assert!(gate.is_approved(request.id()));
    }

    #[tokio::test]
    async fn test_auto_mode_above_ceiling_prompts() {
        let gate = gate(ApprovalMode::Auto);
        let request = ActionRequest::new("rm").with_args(["-rf", "target"]);
        let ticket = gate.submit(&request).unwrap();
        assert!(!ticket.is_ready());
        assert_eq!(gate.pending().len(), 1);
        assert!(!gate.is_approved(request.id()));
    }

    #[tokio::test]
    async fn test_prompt_resolve() {
        let gate = std::sync::Arc::new(gate(ApprovalMode::Prompt));
        let request = ActionRequest::new("ls");
        let ticket = gate.submit(&request).unwrap();
        assert!(!gate.is_approved(request.id()));

        let g = gate.clone();
        let id = request.id();
        let resolver = tokio::spawn(async move { g.resolve(id, true) });
        let decision = gate.wait(ticket).await;
        resolver.await.unwrap().unwrap();

        assert_eq!(decision.outcome, DecisionOutcome::Approved);
        assert!(gate.pending().is_empty());
    }

    #[tokio::test]
    async fn test_prompt_timeout_denies() {
        let gate = gate(ApprovalMode::Prompt);
        let request = ActionRequest::new("ls");
        let started = std::time::Instant::now();
        let (_, decision) = gate.decide(&request).await.unwrap();
        assert_eq!(decision.outcome, DecisionOutcome::Denied);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(gate.resolve(request.id(), true).is_err());
    }

    #[tokio::test]
    async fn test_defer_requires_batch_resolution() {
        let gate = gate(ApprovalMode::Defer);
        let a = ActionRequest::new("ls");
        let b = ActionRequest::new("pwd");
        let ta = gate.submit(&a).unwrap();
        let tb = gate.submit(&b).unwrap();
        assert_eq!(ta.batch_id(), tb.batch_id());
        assert_eq!(
            gate.decision(a.id()).unwrap().outcome,
            DecisionOutcome::Deferred
        );

        // single resolution is not allowed for deferred entries
        assert!(gate.resolve(a.id(), true).is_err());

        let batch = gate.seal_batch().unwrap();
        assert_eq!(Some(batch), ta.batch_id());
        assert!(gate.open_batch().is_none());

        let decisions = gate.resolve_batch(batch, true).unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(gate.wait(ta).await.outcome, DecisionOutcome::Approved);
        assert_eq!(gate.wait(tb).await.outcome, DecisionOutcome::Approved);
    }

    #[tokio::test]
    async fn test_duplicate_submission_rejected() {
        let gate = gate(ApprovalMode::Auto);
        let request = ActionRequest::new("ls");
        gate.submit(&request).unwrap();
        assert!(gate.submit(&request).is_err());
    }

    #[tokio::test]
    async fn test_forget_drops_only_terminal_entries() {
        let gate = gate(ApprovalMode::Defer);
        let a = ActionRequest::new("ls").with_origin("agent-1");
        let b = ActionRequest::new("pwd").with_origin("agent-1");
        gate.submit(&a).unwrap();
        gate.submit(&b).unwrap();
        let batch = gate.seal_batch().unwrap();
        assert_eq!(gate.abandon("agent-1"), 2);

        gate.set_mode(ApprovalMode::Prompt);
        let waiting = ActionRequest::new("ls").with_origin("agent-2");
        let _ticket = gate.submit(&waiting).unwrap();

        assert_eq!(gate.forget([a.id(), b.id(), waiting.id()]), 2);
        assert!(gate.decision(a.id()).is_none());
        assert!(gate.resolve_batch(batch, true).is_err());
        assert_eq!(gate.pending().len(), 1);
        assert!(gate.resolve(waiting.id(), true).is_ok());
    }

    #[tokio::test]
    async fn test_events_stream() {
        let gate = gate(ApprovalMode::Prompt);
        let mut events = gate.subscribe();
        let request = ActionRequest::new("ls");
        let _ticket = gate.submit(&request).unwrap();
        match events.recv().await.unwrap() {
            ApprovalEvent::Requested(entry) => assert_eq!(entry.request_id, request.id()),
            other => panic!("unexpected event {:?}", other),
        }
        gate.resolve(request.id(), false).unwrap();
        match events.recv().await.unwrap() {
            ApprovalEvent::Resolved(decision) => {
                assert_eq!(decision.outcome, DecisionOutcome::Denied)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
