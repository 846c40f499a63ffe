//! Batch ingestion: pull accounts, balances and transactions from the
//! banking provider and upsert them under one batch id.

use crate::error::TimelineError;
use crate::models::{iso8601, Account, ArrangementId, BatchId};
use crate::services::banking::BankingApi;
use crate::services::batch::BatchIdGenerator;
use crate::services::fan_out::join_all_settled;
use crate::services::metrics;
use crate::services::store::{with_session, StoreConnector, StoreSession};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Summary of one completed ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionReport {
    #[serde(serialize_with = "iso8601::batch")]
    pub batch_id: BatchId,
    pub arrangement_id: String,
    pub accounts: usize,
    pub balances: usize,
    pub transactions: usize,
    /// Provider transactions dropped for lacking a `transactionId`.
    pub skipped_transactions: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransactionCounts {
    pub stored: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct BatchIngestor {
    banking: Arc<dyn BankingApi>,
    store: Arc<dyn StoreConnector>,
    batch_ids: Arc<BatchIdGenerator>,
    run_timeout: Duration,
}

impl BatchIngestor {
    pub fn new(
        banking: Arc<dyn BankingApi>,
        store: Arc<dyn StoreConnector>,
        batch_ids: Arc<BatchIdGenerator>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            banking,
            store,
            batch_ids,
            run_timeout,
        }
    }

    /// Same store and batch sequence, different provider client.
    pub fn with_banking(&self, banking: Arc<dyn BankingApi>) -> Self {
        Self {
            banking,
            ..self.clone()
        }
    }

    /// Mint the id every write of one run is stamped with.
    pub fn new_batch(&self) -> BatchId {
        self.batch_ids.next()
    }

    /// The first ACTIVE consent arrangement.
    pub async fn consent_check(&self) -> Result<ArrangementId, TimelineError> {
        let consents = self.banking.active_consents().await?;
        let arrangement = consents
            .into_iter()
            .find(|c| c.is_active())
            .map(|c| ArrangementId(c.cdr_arrangement_id))
            .ok_or(TimelineError::NoConsent)?;

        tracing::info!(arrangement_id = %arrangement, "Active consent found");
        Ok(arrangement)
    }

    pub async fn fetch_and_store_accounts(
        &self,
        arrangement: &ArrangementId,
    ) -> Result<Vec<Account>, TimelineError> {
        let accounts = self.banking.accounts(arrangement).await?;
        let to_store = &accounts;

        with_session(self.store.as_ref(), |session| async move {
            join_all_settled(to_store.iter().map(|a| session.upsert_account(a))).await?;
            Ok::<_, TimelineError>(())
        })
        .await?;

        metrics::record_upserts("accounts", accounts.len());
        tracing::info!(count = accounts.len(), "Stored accounts");
        Ok(accounts)
    }

    /// One snapshot per returned balance, keyed by `(accountId, batch_id)`.
    pub async fn fetch_and_store_balances(
        &self,
        arrangement: &ArrangementId,
        accounts: &[Account],
        batch_id: BatchId,
    ) -> Result<usize, TimelineError> {
        if accounts.is_empty() {
            return Ok(0);
        }

        let account_ids: Vec<String> = accounts.iter().map(|a| a.account_id.clone()).collect();
        let snapshots: Vec<_> = self
            .banking
            .balances(arrangement, &account_ids)
            .await?
            .into_iter()
            .map(|b| b.into_snapshot(batch_id))
            .collect();

        with_session(self.store.as_ref(), |session| async move {
            join_all_settled(snapshots.iter().map(|s| session.upsert_balance(s))).await?;
            Ok::<_, TimelineError>(snapshots.len())
        })
        .await
        .inspect(|stored| {
            metrics::record_upserts("balances", *stored);
            tracing::info!(count = *stored, batch_id = %batch_id, "Stored balance snapshots");
        })
    }

    /// Fetch and upsert every account's transactions concurrently.
    ///
    /// Waits for all accounts before reporting; an account that fails does
    /// not roll back what the others already wrote.
    pub async fn fetch_and_store_transactions(
        &self,
        arrangement: &ArrangementId,
        accounts: &[Account],
        batch_id: BatchId,
    ) -> Result<TransactionCounts, TimelineError> {
        let per_account = with_session(self.store.as_ref(), |session| async move {
            join_all_settled(
                accounts
                    .iter()
                    .map(|a| self.store_account_transactions(&session, arrangement, a, batch_id)),
            )
            .await
        })
        .await?;

        let counts = per_account
            .into_iter()
            .fold(TransactionCounts::default(), |acc, c| TransactionCounts {
                stored: acc.stored + c.stored,
                skipped: acc.skipped + c.skipped,
            });

        metrics::record_upserts("transactions", counts.stored);
        Ok(counts)
    }

    async fn store_account_transactions(
        &self,
        session: &Arc<dyn StoreSession>,
        arrangement: &ArrangementId,
        account: &Account,
        batch_id: BatchId,
    ) -> Result<TransactionCounts, TimelineError> {
        let fetched = self
            .banking
            .transactions(arrangement, &account.account_id)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    account_id = %account.account_id,
                    error = %e,
                    "Failed to fetch transactions"
                );
            })?;

        let fetched_count = fetched.len();
        let transactions: Vec<_> = fetched
            .into_iter()
            .filter_map(|t| t.into_transaction(batch_id))
            .collect();
        let skipped = fetched_count - transactions.len();
        if skipped > 0 {
            tracing::warn!(
                account_id = %account.account_id,
                skipped = skipped,
                "Skipping transactions without an identifier"
            );
        }

        join_all_settled(transactions.iter().map(|t| session.upsert_transaction(t))).await?;

        tracing::info!(
            account_id = %account.account_id,
            count = transactions.len(),
            "Stored transactions"
        );
        Ok(TransactionCounts {
            stored: transactions.len(),
            skipped,
        })
    }

    /// One full ingestion cycle, bounded by the configured run timeout.
    pub async fn ingest(&self) -> Result<IngestionReport, TimelineError> {
        let started = Instant::now();

        let result = match tokio::time::timeout(self.run_timeout, self.run()).await {
            Ok(result) => result,
            Err(_) => Err(TimelineError::Timeout(self.run_timeout)),
        };

        match &result {
            Ok(report) => {
                metrics::record_ingestion_run("success", started.elapsed());
                tracing::info!(
                    batch_id = %report.batch_id,
                    arrangement_id = %report.arrangement_id,
                    accounts = report.accounts,
                    balances = report.balances,
                    transactions = report.transactions,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Ingestion run completed"
                );
            }
            Err(e) => {
                metrics::record_ingestion_run("failure", started.elapsed());
                tracing::error!(error = %e, "Ingestion run failed");
            }
        }

        result
    }

    async fn run(&self) -> Result<IngestionReport, TimelineError> {
        let arrangement = self.consent_check().await?;
        let batch_id = self.new_batch();
        tracing::info!(batch_id = %batch_id, "Starting ingestion batch");

        let accounts = self.fetch_and_store_accounts(&arrangement).await?;
        let balances = self
            .fetch_and_store_balances(&arrangement, &accounts, batch_id)
            .await?;
        let transactions = self
            .fetch_and_store_transactions(&arrangement, &accounts, batch_id)
            .await?;

        Ok(IngestionReport {
            batch_id,
            arrangement_id: arrangement.0,
            accounts: accounts.len(),
            balances,
            transactions: transactions.stored,
            skipped_transactions: transactions.skipped,
        })
    }
}
