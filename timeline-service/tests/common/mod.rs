#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mongodb::bson;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use timeline_service::models::{Account, ArrangementId, BalanceSnapshot, BatchId, Transaction};
use timeline_service::services::banking::{CdrBalance, CdrTransaction, Consent};
use timeline_service::services::{
    BankingApi, BankingError, BatchIdGenerator, BatchIngestor, InMemoryStore, StoreConnector,
    StoreSession,
};

pub const ARRANGEMENT_ID: &str = "arr-test-1";

/// Banking provider double with a fixed data set.
#[derive(Default)]
pub struct ScriptedBanking {
    pub consents: Vec<Consent>,
    pub accounts: Vec<Account>,
    pub balances: Mutex<Vec<CdrBalance>>,
    pub transactions: HashMap<String, Vec<CdrTransaction>>,
    pub failing_accounts: HashSet<String>,
    /// Stall applied to the accounts fetch.
    pub delay: Option<Duration>,
    /// Stall applied to every transactions fetch.
    pub transaction_delay: Option<Duration>,
    pub transaction_calls: AtomicUsize,
}

impl ScriptedBanking {
    /// One active consent, the given accounts, a zero balance each and no
    /// transactions.
    pub fn with_accounts(ids: &[&str]) -> Self {
        Self {
            consents: vec![active_consent(ARRANGEMENT_ID)],
            accounts: ids.iter().map(|id| account(id)).collect(),
            balances: Mutex::new(ids.iter().map(|id| cdr_balance(id, 0)).collect()),
            ..Default::default()
        }
    }

    pub fn set_balance(&self, account_id: &str, amount: i64) {
        let mut balances = self.balances.lock().unwrap();
        balances.retain(|b| b.account_id != account_id);
        balances.push(cdr_balance(account_id, amount));
    }

    async fn pause(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl BankingApi for ScriptedBanking {
    async fn active_consents(&self) -> Result<Vec<Consent>, BankingError> {
        Ok(self.consents.clone())
    }

    async fn accounts(&self, arrangement: &ArrangementId) -> Result<Vec<Account>, BankingError> {
        assert_eq!(arrangement.0, ARRANGEMENT_ID);
        Self::pause(self.delay).await;
        Ok(self.accounts.clone())
    }

    async fn balances(
        &self,
        _arrangement: &ArrangementId,
        account_ids: &[String],
    ) -> Result<Vec<CdrBalance>, BankingError> {
        Ok(self
            .balances
            .lock()
            .unwrap()
            .iter()
            .filter(|b| account_ids.contains(&b.account_id))
            .cloned()
            .collect())
    }

    async fn transactions(
        &self,
        _arrangement: &ArrangementId,
        account_id: &str,
    ) -> Result<Vec<CdrTransaction>, BankingError> {
        self.transaction_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_accounts.contains(account_id) {
            return Err(BankingError::Status {
                status: 500,
                body: format!("transactions unavailable for {}", account_id),
            });
        }
        // Give sibling accounts time to race the failing one.
        Self::pause(Some(self.transaction_delay.unwrap_or(Duration::from_millis(10)))).await;
        Ok(self
            .transactions
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub fn active_consent(arrangement_id: &str) -> Consent {
    Consent {
        cdr_arrangement_id: arrangement_id.to_string(),
        status: Some("ACTIVE".to_string()),
    }
}

pub fn account(id: &str) -> Account {
    Account {
        account_id: id.to_string(),
        display_name: format!("Account {}", id),
        nickname: None,
        masked_number: Some("xxxx1234".to_string()),
        product_category: Some("TRANS_AND_SAVINGS_ACCOUNTS".to_string()),
        product_name: Some("Everyday".to_string()),
        open_status: Some("OPEN".to_string()),
        is_owned: Some(true),
        creation_date: None,
    }
}

pub fn cdr_balance(account_id: &str, amount: i64) -> CdrBalance {
    CdrBalance {
        account_id: account_id.to_string(),
        current_balance: Decimal::from(amount),
        available_balance: Some(Decimal::from(amount)),
        currency: Some("AUD".to_string()),
    }
}

pub fn cdr_transaction(account_id: &str, id: &str, amount: i64, executed_ms: i64) -> CdrTransaction {
    CdrTransaction {
        account_id: account_id.to_string(),
        transaction_id: Some(id.to_string()),
        execution_date_time: Some(Utc.timestamp_millis_opt(executed_ms).unwrap()),
        posting_date_time: None,
        value_date_time: None,
        amount: Decimal::from(amount),
        currency: Some("AUD".to_string()),
        description: format!("purchase {}", id),
        status: Some("POSTED".to_string()),
        transaction_type: Some("PAYMENT".to_string()),
        reference: None,
        merchant_name: None,
        merchant_category_code: None,
    }
}

pub fn snapshot(account_id: &str, batch_ms: i64, balance: i64) -> BalanceSnapshot {
    BalanceSnapshot {
        account_id: account_id.to_string(),
        batch_id: BatchId::from_millis(batch_ms),
        current_balance: Decimal::from(balance),
        available_balance: None,
        currency: Some("AUD".to_string()),
    }
}

pub fn transaction(
    account_id: &str,
    id: &str,
    batch_ms: i64,
    amount: i64,
    executed_ms: i64,
) -> Transaction {
    Transaction {
        transaction_id: id.to_string(),
        account_id: account_id.to_string(),
        batch_id: BatchId::from_millis(batch_ms),
        execution_date_time: Some(bson::DateTime::from_millis(executed_ms)),
        posting_date_time: None,
        value_date_time: None,
        amount: Decimal::from(amount),
        currency: Some("AUD".to_string()),
        description: format!("purchase {}", id),
        status: None,
        transaction_type: None,
        reference: None,
        merchant_name: None,
        merchant_category_code: None,
    }
}

/// Write fixtures through one session of `store`.
pub async fn seed(store: &InMemoryStore, snapshots: &[BalanceSnapshot], transactions: &[Transaction]) {
    let session = store.connect().await.unwrap();
    for s in snapshots {
        session.upsert_balance(s).await.unwrap();
    }
    for t in transactions {
        session.upsert_transaction(t).await.unwrap();
    }
    session.close().await;
}

pub fn ingestor(banking: Arc<ScriptedBanking>, store: &InMemoryStore) -> BatchIngestor {
    ingestor_with_timeout(banking, store, Duration::from_secs(5))
}

pub fn ingestor_with_timeout(
    banking: Arc<ScriptedBanking>,
    store: &InMemoryStore,
    run_timeout: Duration,
) -> BatchIngestor {
    let store: Arc<dyn StoreConnector> = Arc::new(store.clone());
    BatchIngestor::new(
        banking,
        store,
        Arc::new(BatchIdGenerator::new()),
        run_timeout,
    )
}
