//! Terminal approval prompts
//!
//! Listens to the gate's event stream and answers prompts and sealed batches
//! from stdin. Stdin is shared with `stream`, which forwards the remaining
//! lines to the live session.

use claw_task::{ApprovalEvent, ApprovalGate};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Line-oriented stdin shared between the prompter and stream input
pub struct Console {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl Console {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        })
    }

    /// Next line, `None` at end of input
    pub async fn read_line(&self) -> Option<String> {
        match self.lines.lock().await.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!("stdin read failed: {}", e);
                None
            }
        }
    }

    /// Print a question and read a yes/no answer. End of input answers no.
    pub async fn confirm(&self, question: &str) -> bool {
        eprint!("{} [y/N] ", question);
        let _ = std::io::stderr().flush();
        self.read_line().await.is_some_and(|a| parse_answer(&a))
    }
}

/// `y`/`yes` (any case) approves; everything else denies
pub fn parse_answer(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Answer approval events until the gate goes away. With `seal_deferred`
/// every deferred request seals its batch at once, for single-command runs
/// where nothing else would seal it.
pub fn spawn(
    gate: Arc<ApprovalGate>,
    console: Arc<Console>,
    assume_yes: bool,
    seal_deferred: bool,
) -> JoinHandle<()> {
    let mut events = gate.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("approval prompter skipped {} events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            match event {
                ApprovalEvent::Requested(entry) => {
                    eprintln!(
                        "\n[{}{}] {}",
                        entry.tier,
                        if entry.ambiguous { ", ambiguous" } else { "" },
                        entry.command_line
                    );
                    for reason in &entry.reasons {
                        eprintln!("  - {}", reason);
                    }
                    let approve = assume_yes || console.confirm("Run this command?").await;
                    if let Err(e) = gate.resolve(entry.request_id, approve) {
                        // timed out or abandoned while we were asking
                        eprintln!("  (no longer pending: {})", e);
                    }
                }
                ApprovalEvent::Deferred(entry) => {
                    eprintln!("[queued {}] {}", entry.tier, entry.command_line);
                    if seal_deferred {
                        gate.seal_batch();
                    }
                }
                ApprovalEvent::BatchSealed { batch_id, requests } => {
                    eprintln!("\nBatch {} holds {} requests.", batch_id, requests.len());
                    let approve = assume_yes || console.confirm("Run the whole batch?").await;
                    if let Err(e) = gate.resolve_batch(batch_id, approve) {
                        eprintln!("  (batch no longer pending: {})", e);
                    }
                }
                ApprovalEvent::Resolved(decision) => {
                    debug!(
                        request = %decision.request_id.short(),
                        outcome = decision.outcome.as_str(),
                        "approval resolved"
                    );
                }
            }
        }
    })
}
