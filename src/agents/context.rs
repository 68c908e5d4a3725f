//! Stage execution context - what a running pipeline hands to its engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::AgentResult;
use crate::budget::BudgetLedger;

/// Shared context passed to the execution engine for one run.
///
/// # Thread Safety
/// Cloning is cheap; every field is a handle. The context never outlives
/// the run: when the orchestrator gives up (timeout), it cancels the token
/// and drains whatever reports were already sent.
#[derive(Clone)]
pub struct StageContext {
    /// Topic being researched
    pub niche: String,

    /// Shared credit ledger
    pub ledger: Arc<BudgetLedger>,

    /// Cooperative cancellation for the whole run
    pub cancel_token: CancellationToken,

    reports: mpsc::UnboundedSender<AgentResult>,
}

impl StageContext {
    /// Create a context and the receiving end of its stage-report channel.
    pub fn new(
        niche: impl Into<String>,
        ledger: Arc<BudgetLedger>,
        cancel_token: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<AgentResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                niche: niche.into(),
                ledger,
                cancel_token,
                reports: tx,
            },
            rx,
        )
    }

    /// Report a finished stage. Reports after the run was abandoned are dropped.
    pub fn report(&self, result: AgentResult) {
        if self.reports.send(result).is_err() {
            tracing::debug!("Stage report dropped, run receiver is gone");
        }
    }

    /// Check if cooperative cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}
