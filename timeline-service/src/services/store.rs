//! Batch store: the `accounts`, `balances` and `transactions` collections.
//!
//! A [`StoreConnector`] hands out one [`StoreSession`] per logical operation.
//! Callers go through [`with_session`], which closes the session whether the
//! operation succeeded or not.

use crate::config::MongoConfig;
use crate::models::{Account, BalanceSnapshot, BatchId, Transaction};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::options::{FindOneOptions, FindOptions, IndexOptions, ReplaceOptions, UpdateOptions};
use mongodb::{Client as MongoClient, Collection, Database, IndexModel};
use secrecy::{ExposeSecret, Secret};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const ACCOUNTS: &str = "accounts";
const BALANCES: &str = "balances";
const TRANSACTIONS: &str = "transactions";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store operation failed: {0}")]
    Backend(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(e: mongodb::error::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<bson::ser::Error> for StoreError {
    fn from(e: bson::ser::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Connection-scoped read/write operations against the batch store.
#[async_trait]
pub trait StoreSession: Send + Sync {
    /// Insert or replace by `accountId`.
    async fn upsert_account(&self, account: &Account) -> Result<(), StoreError>;

    /// Insert or replace by `(accountId, batchId)`.
    async fn upsert_balance(&self, snapshot: &BalanceSnapshot) -> Result<(), StoreError>;

    /// Insert or update by `transactionId`. The stored `batchId` is written
    /// on insert only.
    async fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError>;

    /// Snapshots with `start < batchId < end`, ascending by batch.
    async fn find_balances_in_range(
        &self,
        account_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> Result<Vec<BalanceSnapshot>, StoreError>;

    /// The earliest snapshot with `batchId > end`.
    async fn find_trailing_balance(
        &self,
        account_id: &str,
        end: BatchId,
    ) -> Result<Option<BalanceSnapshot>, StoreError>;

    /// Transactions first seen in `batch_id`, ascending by
    /// `executionDateTime` with undated ones first.
    async fn find_transactions_for_batch(
        &self,
        account_id: &str,
        batch_id: BatchId,
    ) -> Result<Vec<Transaction>, StoreError>;

    async fn find_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Release the underlying connection. Idempotent. Sessions dropped
    /// without `close` release themselves on drop.
    async fn close(&self);
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn StoreSession>, StoreError>;
}

/// Run `f` against a fresh session and close it afterwards, including when
/// `f` fails. If this future is dropped before `f` finishes (a timeout
/// upstream), the session is released by its `Drop` impl instead.
pub async fn with_session<T, E, F, Fut>(connector: &dyn StoreConnector, f: F) -> Result<T, E>
where
    F: FnOnce(Arc<dyn StoreSession>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    let session = connector.connect().await?;
    let result = f(Arc::clone(&session)).await;
    session.close().await;
    result
}

pub struct MongoConnector {
    uri: Secret<String>,
    database: String,
}

impl MongoConnector {
    pub fn new(config: &MongoConfig) -> Self {
        Self {
            uri: config.uri.clone(),
            database: config.database.clone(),
        }
    }

    async fn open(&self) -> Result<MongoSession, StoreError> {
        let client = MongoClient::with_uri_str(self.uri.expose_secret())
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to MongoDB");
                StoreError::Connection(e.to_string())
            })?;

        Ok(MongoSession {
            client: Mutex::new(Some(client)),
            database: self.database.clone(),
        })
    }

    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        tracing::info!(database = %self.database, "Creating MongoDB indexes");
        let session = self.open().await?;
        let result = session.create_indexes().await;
        session.close().await;
        result?;
        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for MongoConnector {
    async fn connect(&self) -> Result<Arc<dyn StoreSession>, StoreError> {
        Ok(Arc::new(self.open().await?))
    }
}

/// One MongoDB client, shut down on close.
pub struct MongoSession {
    client: Mutex<Option<MongoClient>>,
    database: String,
}

impl MongoSession {
    fn take_client(&self) -> Option<MongoClient> {
        match self.client.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn db(&self) -> Result<Database, StoreError> {
        let guard = self
            .client
            .lock()
            .map_err(|_| StoreError::Backend("session lock poisoned".to_string()))?;
        guard
            .as_ref()
            .map(|client| client.database(&self.database))
            .ok_or_else(|| StoreError::Connection("session already closed".to_string()))
    }

    fn accounts(&self) -> Result<Collection<Account>, StoreError> {
        Ok(self.db()?.collection(ACCOUNTS))
    }

    fn balances(&self) -> Result<Collection<BalanceSnapshot>, StoreError> {
        Ok(self.db()?.collection(BALANCES))
    }

    fn transactions(&self) -> Result<Collection<Transaction>, StoreError> {
        Ok(self.db()?.collection(TRANSACTIONS))
    }

    async fn create_indexes(&self) -> Result<(), StoreError> {
        let unique = |name: &str| {
            IndexOptions::builder()
                .name(name.to_string())
                .unique(true)
                .build()
        };

        self.accounts()?
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "accountId": 1 })
                    .options(unique("account_id_idx"))
                    .build(),
                None,
            )
            .await?;

        self.balances()?
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "accountId": 1, "batchId": 1 })
                    .options(unique("account_batch_idx"))
                    .build(),
                None,
            )
            .await?;

        let transactions = self.transactions()?;
        transactions
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "transactionId": 1 })
                    .options(unique("transaction_id_idx"))
                    .build(),
                None,
            )
            .await?;

        transactions
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "accountId": 1, "batchId": 1, "executionDateTime": 1 })
                    .options(
                        IndexOptions::builder()
                            .name("account_batch_execution_idx".to_string())
                            .build(),
                    )
                    .build(),
                None,
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl StoreSession for MongoSession {
    async fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.accounts()?
            .replace_one(doc! { "accountId": &account.account_id }, account, options)
            .await
            .map_err(|e| {
                tracing::error!(account_id = %account.account_id, error = %e, "Failed to upsert account");
                StoreError::from(e)
            })?;
        Ok(())
    }

    async fn upsert_balance(&self, snapshot: &BalanceSnapshot) -> Result<(), StoreError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        self.balances()?
            .replace_one(
                doc! { "accountId": &snapshot.account_id, "batchId": snapshot.batch_id },
                snapshot,
                options,
            )
            .await
            .map_err(|e| {
                tracing::error!(account_id = %snapshot.account_id, error = %e, "Failed to upsert balance");
                StoreError::from(e)
            })?;
        Ok(())
    }

    async fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let mut fields = bson::to_document(transaction)?;
        fields.remove("batchId");

        let update = doc! {
            "$set": fields,
            "$setOnInsert": { "batchId": transaction.batch_id },
        };
        let options = UpdateOptions::builder().upsert(true).build();

        self.transactions()?
            .update_one(
                doc! { "transactionId": &transaction.transaction_id },
                update,
                options,
            )
            .await
            .map_err(|e| {
                tracing::error!(
                    transaction_id = %transaction.transaction_id,
                    error = %e,
                    "Failed to upsert transaction"
                );
                StoreError::from(e)
            })?;
        Ok(())
    }

    async fn find_balances_in_range(
        &self,
        account_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> Result<Vec<BalanceSnapshot>, StoreError> {
        let filter = doc! {
            "accountId": account_id,
            "batchId": { "$gt": start, "$lt": end },
        };
        let options = FindOptions::builder().sort(doc! { "batchId": 1 }).build();

        let cursor = self.balances()?.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_trailing_balance(
        &self,
        account_id: &str,
        end: BatchId,
    ) -> Result<Option<BalanceSnapshot>, StoreError> {
        let filter = doc! { "accountId": account_id, "batchId": { "$gt": end } };
        let options = FindOneOptions::builder().sort(doc! { "batchId": 1 }).build();

        Ok(self.balances()?.find_one(filter, options).await?)
    }

    async fn find_transactions_for_batch(
        &self,
        account_id: &str,
        batch_id: BatchId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let filter = doc! { "accountId": account_id, "batchId": batch_id };
        let options = FindOptions::builder()
            .sort(doc! { "executionDateTime": 1 })
            .build();

        let cursor = self.transactions()?.find(filter, options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let options = FindOptions::builder().sort(doc! { "accountId": 1 }).build();
        let cursor = self.accounts()?.find(Document::new(), options).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn close(&self) {
        if let Some(client) = self.take_client() {
            client.shutdown().await;
        }
    }
}

impl Drop for MongoSession {
    fn drop(&mut self) {
        // Reached with a live client only when the owning operation was
        // cancelled before `close`.
        let Some(client) = self.take_client() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!("MongoDB session dropped without close, shutting client down");
                handle.spawn(client.shutdown());
            }
            Err(_) => drop(client),
        }
    }
}

#[derive(Default)]
struct Collections {
    accounts: BTreeMap<String, Account>,
    balances: BTreeMap<(String, BatchId), BalanceSnapshot>,
    transactions: BTreeMap<String, Transaction>,
}

#[derive(Default)]
struct InMemoryInner {
    data: Mutex<Collections>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    fail_reads: AtomicBool,
}

/// Process-local store with the same semantics as the MongoDB one.
///
/// Counts opened and closed sessions and can be told to fail reads.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<InMemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened_sessions(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.inner.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn balance_count(&self) -> usize {
        lock(&self.inner.data).map(|d| d.balances.len()).unwrap_or(0)
    }

    pub fn transaction_count(&self) -> usize {
        lock(&self.inner.data)
            .map(|d| d.transactions.len())
            .unwrap_or(0)
    }

    pub fn transaction(&self, transaction_id: &str) -> Option<Transaction> {
        lock(&self.inner.data)
            .ok()
            .and_then(|d| d.transactions.get(transaction_id).cloned())
    }

    /// Number of stored transactions per account.
    pub fn transactions_by_account(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        if let Ok(data) = lock(&self.inner.data) {
            for tx in data.transactions.values() {
                *counts.entry(tx.account_id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

#[async_trait]
impl StoreConnector for InMemoryStore {
    async fn connect(&self) -> Result<Arc<dyn StoreSession>, StoreError> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemorySession {
            inner: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }
}

struct InMemorySession {
    inner: Arc<InMemoryInner>,
    closed: AtomicBool,
}

fn lock(data: &Mutex<Collections>) -> Result<MutexGuard<'_, Collections>, StoreError> {
    data.lock()
        .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
}

impl InMemorySession {
    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn write(&self) -> Result<MutexGuard<'_, Collections>, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("session already closed".to_string()));
        }
        lock(&self.inner.data)
    }

    fn read(&self) -> Result<MutexGuard<'_, Collections>, StoreError> {
        if self.inner.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected read failure".to_string()));
        }
        self.write()
    }
}

#[async_trait]
impl StoreSession for InMemorySession {
    async fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
        self.write()?
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(())
    }

    async fn upsert_balance(&self, snapshot: &BalanceSnapshot) -> Result<(), StoreError> {
        self.write()?.balances.insert(
            (snapshot.account_id.clone(), snapshot.batch_id),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn upsert_transaction(&self, transaction: &Transaction) -> Result<(), StoreError> {
        let mut data = self.write()?;
        let mut stored = transaction.clone();
        if let Some(existing) = data.transactions.get(&transaction.transaction_id) {
            stored.batch_id = existing.batch_id;
        }
        data.transactions
            .insert(transaction.transaction_id.clone(), stored);
        Ok(())
    }

    async fn find_balances_in_range(
        &self,
        account_id: &str,
        start: BatchId,
        end: BatchId,
    ) -> Result<Vec<BalanceSnapshot>, StoreError> {
        let data = self.read()?;
        Ok(data
            .balances
            .values()
            .filter(|s| s.account_id == account_id && s.batch_id > start && s.batch_id < end)
            .cloned()
            .collect())
    }

    async fn find_trailing_balance(
        &self,
        account_id: &str,
        end: BatchId,
    ) -> Result<Option<BalanceSnapshot>, StoreError> {
        let data = self.read()?;
        Ok(data
            .balances
            .values()
            .filter(|s| s.account_id == account_id && s.batch_id > end)
            .min_by_key(|s| s.batch_id)
            .cloned())
    }

    async fn find_transactions_for_batch(
        &self,
        account_id: &str,
        batch_id: BatchId,
    ) -> Result<Vec<Transaction>, StoreError> {
        let data = self.read()?;
        let mut transactions: Vec<Transaction> = data
            .transactions
            .values()
            .filter(|t| t.account_id == account_id && t.batch_id == batch_id)
            .cloned()
            .collect();
        transactions.sort_by_key(|t| t.execution_date_time);
        Ok(transactions)
    }

    async fn find_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.read()?.accounts.values().cloned().collect())
    }

    async fn close(&self) {
        self.release();
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        self.release();
    }
}
