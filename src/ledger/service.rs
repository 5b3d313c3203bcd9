//! Single-writer ledger task for live runs
//!
//! Fills, marks and reconciliations are queued as commands and applied by
//! one owning task. Readers take the latest snapshot from a watch channel
//! and never contend with the writer.

use super::{AccountSnapshot, Ledger, LedgerSnapshot, ReconcileReport};
use crate::data::CorporateAction;
use crate::error::{EngineError, Result};
use crate::execution::Fill;
use crate::telemetry;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Mutation requests for the ledger task
#[derive(Debug)]
pub enum LedgerCommand {
    ApplyFill(Fill),
    ApplyCorporateAction(CorporateAction),
    Mark {
        symbol: String,
        price: Decimal,
        at: NaiveDateTime,
    },
    Reconcile {
        snapshot: AccountSnapshot,
        at: NaiveDateTime,
        reply: Option<oneshot::Sender<ReconcileReport>>,
    },
}

/// Cloneable handle to the ledger task
#[derive(Clone)]
pub struct LedgerHandle {
    commands: mpsc::Sender<LedgerCommand>,
    snapshots: watch::Receiver<LedgerSnapshot>,
}

impl LedgerHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> LedgerSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Queue a command, waiting for capacity
    pub async fn send(&self, command: LedgerCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| EngineError::Results("ledger task stopped".into()))
    }

    /// Queue a command from synchronous code without waiting
    pub fn try_send(&self, command: LedgerCommand) -> Result<()> {
        self.commands
            .try_send(command)
            .map_err(|e| EngineError::Results(format!("ledger queue: {e}")))
    }

    /// Queue a command from a blocking thread
    pub fn blocking_send(&self, command: LedgerCommand) -> Result<()> {
        self.commands
            .blocking_send(command)
            .map_err(|_| EngineError::Results("ledger task stopped".into()))
    }

    /// Wait until a snapshot newer than the last observed one is published
    pub async fn changed(&mut self) -> Result<()> {
        self.snapshots
            .changed()
            .await
            .map_err(|_| EngineError::Results("ledger task stopped".into()))
    }
}

/// Spawn the owning task. It exits and returns the ledger once every
/// handle has been dropped.
pub fn spawn_ledger(ledger: Ledger, queue: usize) -> (LedgerHandle, JoinHandle<Ledger>) {
    let (tx, rx) = mpsc::channel(queue);
    let (snap_tx, snap_rx) = watch::channel(ledger.snapshot());

    let task = tokio::spawn(run(ledger, rx, snap_tx));

    (
        LedgerHandle {
            commands: tx,
            snapshots: snap_rx,
        },
        task,
    )
}

async fn run(
    mut ledger: Ledger,
    mut rx: mpsc::Receiver<LedgerCommand>,
    snapshots: watch::Sender<LedgerSnapshot>,
) -> Ledger {
    while let Some(command) = rx.recv().await {
        match command {
            LedgerCommand::ApplyFill(fill) => ledger.apply_fill(&fill),
            LedgerCommand::ApplyCorporateAction(action) => {
                if let Err(e) = ledger.apply_corporate_action(&action) {
                    tracing::warn!(error = %e, "Corporate action not applied");
                }
            }
            LedgerCommand::Mark { symbol, price, at } => ledger.mark(&symbol, price, at),
            LedgerCommand::Reconcile {
                snapshot,
                at,
                reply,
            } => {
                let report = ledger.reconcile(&snapshot, at);
                if !report.is_clean() {
                    telemetry::record_reconcile_drift(report.diffs.len());
                }
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
        }

        let snapshot = ledger.snapshot();
        telemetry::record_snapshot(&snapshot);
        // Receivers may all be gone during shutdown; the ledger is still returned
        let _ = snapshots.send(snapshot);
    }

    tracing::debug!(fills = ledger.fill_count(), "Ledger task stopped");
    ledger
}
