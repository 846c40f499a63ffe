//! Consumer-Data-Right banking API client.
//!
//! Wraps the provider's consent, account, balance and transaction endpoints
//! behind the [`BankingApi`] trait so ingestion can run against a fake.

use crate::config::BankingConfig;
use crate::models::{Account, ArrangementId, BalanceSnapshot, BatchId, Transaction};
use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use service_core::observability::{TracedClientExt, TracedRequest};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BankingError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode provider response: {0}")]
    Decode(String),
}

impl BankingError {
    /// Transient failures worth another attempt: transport trouble,
    /// throttling and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            BankingError::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            BankingError::Status { status, .. } => *status == 429 || *status >= 500,
            BankingError::Decode(_) => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consent {
    pub cdr_arrangement_id: String,
    #[serde(default)]
    pub status: Option<String>,
}

impl Consent {
    /// A consent with no status field is taken at face value, since the
    /// listing was already filtered to ACTIVE.
    pub fn is_active(&self) -> bool {
        self.status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("ACTIVE"))
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdrBalance {
    pub account_id: String,
    pub current_balance: Decimal,
    #[serde(default)]
    pub available_balance: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
}

impl CdrBalance {
    pub fn into_snapshot(self, batch_id: BatchId) -> BalanceSnapshot {
        BalanceSnapshot {
            account_id: self.account_id,
            batch_id,
            current_balance: self.current_balance,
            available_balance: self.available_balance,
            currency: self.currency,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdrTransaction {
    pub account_id: String,
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub execution_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub posting_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value_date_time: Option<DateTime<Utc>>,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(rename = "type", default)]
    pub transaction_type: Option<String>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub merchant_name: Option<String>,
    #[serde(default)]
    pub merchant_category_code: Option<String>,
}

impl CdrTransaction {
    /// Convert into the stored shape. Transactions the provider sent
    /// without an identifier cannot be upserted and yield `None`.
    pub fn into_transaction(self, batch_id: BatchId) -> Option<Transaction> {
        let transaction_id = self.transaction_id?;
        let to_bson = |dt: DateTime<Utc>| mongodb::bson::DateTime::from_chrono(dt);

        Some(Transaction {
            transaction_id,
            account_id: self.account_id,
            batch_id,
            execution_date_time: self.execution_date_time.map(to_bson),
            posting_date_time: self.posting_date_time.map(to_bson),
            value_date_time: self.value_date_time.map(to_bson),
            amount: self.amount,
            currency: self.currency,
            description: self.description,
            status: self.status,
            transaction_type: self.transaction_type,
            reference: self.reference,
            merchant_name: self.merchant_name,
            merchant_category_code: self.merchant_category_code,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ConsentsResponse {
    #[serde(default)]
    consents: Vec<Consent>,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageMeta {
    #[serde(default)]
    total_pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct AccountsData {
    #[serde(default)]
    accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
struct BalancesData {
    #[serde(default)]
    balances: Vec<CdrBalance>,
}

#[derive(Debug, Deserialize)]
struct TransactionsData {
    #[serde(default)]
    transactions: Vec<CdrTransaction>,
}

/// Remote banking provider as seen by the ingestor.
#[async_trait]
pub trait BankingApi: Send + Sync {
    /// Consent arrangements currently ACTIVE for the bearer.
    async fn active_consents(&self) -> Result<Vec<Consent>, BankingError>;

    async fn accounts(&self, arrangement: &ArrangementId) -> Result<Vec<Account>, BankingError>;

    /// Current balances for several accounts in one call.
    async fn balances(
        &self,
        arrangement: &ArrangementId,
        account_ids: &[String],
    ) -> Result<Vec<CdrBalance>, BankingError>;

    async fn transactions(
        &self,
        arrangement: &ArrangementId,
        account_id: &str,
    ) -> Result<Vec<CdrTransaction>, BankingError>;
}

/// reqwest-backed client for the Adatree CDR insights API.
#[derive(Clone)]
pub struct AdatreeClient {
    client: Client,
    config: BankingConfig,
}

impl AdatreeClient {
    pub fn new(config: BankingConfig) -> Result<Self, BankingError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    /// Same client, authenticating as a different bearer.
    pub fn with_token(&self, token: Secret<String>) -> Self {
        let mut config = self.config.clone();
        config.token = token;
        Self {
            client: self.client.clone(),
            config,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.token.expose_secret().is_empty()
    }

    fn base_url(&self) -> &str {
        self.config.api_base_url.trim_end_matches('/')
    }

    fn arrangement_url(&self, arrangement: &ArrangementId) -> String {
        format!("{}/adr/banking/arrangements/{}", self.base_url(), arrangement)
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        let initial = Duration::from_millis(200);
        ExponentialBackoff {
            initial_interval: initial,
            current_interval: initial,
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(self.config.request_timeout * (self.config.max_retries + 1)),
            ..Default::default()
        }
    }

    fn request(&self, url: &str, query: &[(&str, String)]) -> TracedRequest {
        self.client
            .traced_get(url)
            .bearer_auth(self.config.token.expose_secret())
            .header("accept", "application/json")
            .query(query)
    }

    async fn execute<T: DeserializeOwned>(request: TracedRequest) -> Result<T, BankingError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BankingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| BankingError::Decode(e.to_string()))
    }

    /// GET with bounded exponential-backoff retry on transient failures.
    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, BankingError> {
        let attempts = AtomicU32::new(0);
        let max_retries = self.config.max_retries;

        let result = retry_notify(
            self.backoff_policy(),
            || {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed);
                let request = self.request(url, query);
                async move {
                    match Self::execute::<T>(request).await {
                        Ok(value) => Ok(value),
                        Err(e) if e.is_retryable() && attempt < max_retries => {
                            Err(backoff::Error::transient(e))
                        }
                        Err(e) => Err(backoff::Error::permanent(e)),
                    }
                }
            },
            |err: BankingError, wait: Duration| {
                tracing::warn!(
                    operation = operation,
                    error = %err,
                    backoff_ms = wait.as_millis() as u64,
                    "Banking API call failed, retrying after backoff"
                );
            },
        )
        .await;

        if let Err(e) = &result {
            tracing::error!(
                operation = operation,
                attempts = attempts.load(Ordering::Relaxed),
                error = %e,
                "Banking API call failed"
            );
        }

        result
    }
}

#[async_trait]
impl BankingApi for AdatreeClient {
    async fn active_consents(&self) -> Result<Vec<Consent>, BankingError> {
        let url = format!("{}/consents/v2", self.base_url());
        let response: ConsentsResponse = self
            .get_json("active_consents", &url, &[("status", "ACTIVE".to_string())])
            .await?;
        Ok(response.consents)
    }

    async fn accounts(&self, arrangement: &ArrangementId) -> Result<Vec<Account>, BankingError> {
        let url = format!("{}/accounts", self.arrangement_url(arrangement));
        let response: Envelope<AccountsData> = self.get_json("accounts", &url, &[]).await?;
        tracing::info!(
            arrangement_id = %arrangement,
            count = response.data.accounts.len(),
            "Fetched accounts"
        );
        Ok(response.data.accounts)
    }

    async fn balances(
        &self,
        arrangement: &ArrangementId,
        account_ids: &[String],
    ) -> Result<Vec<CdrBalance>, BankingError> {
        let url = format!("{}/accounts/balances", self.arrangement_url(arrangement));
        let response: Envelope<BalancesData> = self
            .get_json("balances", &url, &[("accountIds", account_ids.join(","))])
            .await?;
        Ok(response.data.balances)
    }

    async fn transactions(
        &self,
        arrangement: &ArrangementId,
        account_id: &str,
    ) -> Result<Vec<CdrTransaction>, BankingError> {
        let url = format!(
            "{}/accounts/{}/transactions",
            self.arrangement_url(arrangement),
            account_id
        );

        let mut transactions = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [
                ("page-size", self.config.page_size.to_string()),
                ("page", page.to_string()),
            ];
            let response: Envelope<TransactionsData> =
                self.get_json("transactions", &url, &query).await?;
            transactions.extend(response.data.transactions);

            let total_pages = response.meta.and_then(|m| m.total_pages).unwrap_or(1);
            if page >= total_pages {
                break;
            }
            if page >= self.config.max_pages {
                tracing::warn!(
                    account_id = account_id,
                    total_pages = total_pages,
                    max_pages = self.config.max_pages,
                    "Transaction listing truncated at page limit"
                );
                break;
            }
            page += 1;
        }

        tracing::debug!(
            account_id = account_id,
            count = transactions.len(),
            pages = page,
            "Fetched transactions"
        );
        Ok(transactions)
    }
}
