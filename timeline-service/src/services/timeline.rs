//! Running-balance reconstruction over stored balance snapshots.
//!
//! Each snapshot anchors the transactions first observed in its batch. The
//! walk runs ascending by `executionDateTime`: the first transaction gets the
//! snapshot balance as-is, and each following one gets the previous balance
//! minus the previous amount.

use crate::error::TimelineError;
use crate::models::{BalanceSnapshot, BatchId, TimelineEntry, Transaction};
use crate::services::fan_out::join_all_settled;
use crate::services::metrics;
use crate::services::store::{with_session, StoreConnector, StoreSession};
use rust_decimal::Decimal;
use std::sync::Arc;

#[derive(Clone)]
pub struct TimelineReconstructor {
    store: Arc<dyn StoreConnector>,
}

impl TimelineReconstructor {
    pub fn new(store: Arc<dyn StoreConnector>) -> Self {
        Self { store }
    }

    /// Timeline entries for `account_id` from snapshots with
    /// `start < batchId < end`, plus the first snapshot after `end`.
    ///
    /// Entries are grouped by batch in ascending batch order. They are not
    /// re-sorted across batches.
    pub async fn build(
        &self,
        account_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> Result<Vec<TimelineEntry>, TimelineError> {
        if start >= end {
            tracing::debug!(account_id = account_id, "Empty timeline range requested");
            metrics::record_timeline_build("success", 0);
            return Ok(Vec::new());
        }

        let result = with_session(self.store.as_ref(), |session| async move {
            let snapshots = Self::anchoring_snapshots(&session, account_id, start, end).await?;

            let batches = join_all_settled(
                snapshots
                    .iter()
                    .map(|snapshot| Self::batch_entries(&session, account_id, snapshot)),
            )
            .await?;

            Ok::<_, TimelineError>(batches.into_iter().flatten().collect::<Vec<_>>())
        })
        .await;

        match &result {
            Ok(entries) => {
                metrics::record_timeline_build("success", entries.len());
                tracing::info!(
                    account_id = account_id,
                    entries = entries.len(),
                    "Timeline built"
                );
            }
            Err(e) => {
                metrics::record_timeline_build("failure", 0);
                tracing::error!(account_id = account_id, error = %e, "Timeline build failed");
            }
        }

        result
    }

    async fn anchoring_snapshots(
        session: &Arc<dyn StoreSession>,
        account_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> Result<Vec<BalanceSnapshot>, TimelineError> {
        let mut snapshots = session
            .find_balances_in_range(account_id, start, end)
            .await?;
        if let Some(trailing) = session.find_trailing_balance(account_id, end).await? {
            snapshots.push(trailing);
        }
        Ok(snapshots)
    }

    async fn batch_entries(
        session: &Arc<dyn StoreSession>,
        account_id: &str,
        snapshot: &BalanceSnapshot,
    ) -> Result<Vec<TimelineEntry>, TimelineError> {
        let transactions = session
            .find_transactions_for_batch(account_id, snapshot.batch_id)
            .await?;
        Ok(annotate_batch(snapshot.current_balance, transactions))
    }
}

/// Assign-then-subtract walk over one batch's transactions, which must
/// already be ascending by `executionDateTime`.
pub fn annotate_batch(opening: Decimal, transactions: Vec<Transaction>) -> Vec<TimelineEntry> {
    let mut running = opening;
    transactions
        .into_iter()
        .map(|transaction| {
            let balance = running;
            running -= transaction.amount;
            TimelineEntry {
                transaction,
                balance,
            }
        })
        .collect()
}
