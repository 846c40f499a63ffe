//! Persisted documents for the `accounts`, `balances` and `transactions`
//! collections, plus the derived timeline entry.
//!
//! Field names are camelCase so the stored documents keep the provider's
//! naming (`accountId`, `batchId`, `executionDateTime`, ...).

use chrono::{DateTime as ChronoDateTime, SecondsFormat, Utc};
use mongodb::bson::DateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Identifier of one ingestion run: the wall-clock instant it started.
///
/// Stored as a BSON datetime so range queries compare chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub DateTime);

impl BatchId {
    pub fn from_millis(millis: i64) -> Self {
        Self(DateTime::from_millis(millis))
    }

    pub fn from_chrono(instant: ChronoDateTime<Utc>) -> Self {
        Self(DateTime::from_chrono(instant))
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn to_chrono(&self) -> ChronoDateTime<Utc> {
        self.0.to_chrono()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&rfc3339(self.0))
    }
}

impl From<BatchId> for mongodb::bson::Bson {
    fn from(batch: BatchId) -> Self {
        mongodb::bson::Bson::DateTime(batch.0)
    }
}

/// Identifier of the provider-side consent that scopes which accounts can
/// be queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrangementId(pub String);

impl fmt::Display for ArrangementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_id: String,
    pub display_name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub masked_number: Option<String>,
    #[serde(default)]
    pub product_category: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub open_status: Option<String>,
    #[serde(default)]
    pub is_owned: Option<bool>,
    #[serde(default)]
    pub creation_date: Option<String>,
}

/// The balance an account reported when batch `batch_id` was ingested.
/// Unique per `(account_id, batch_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceSnapshot {
    pub account_id: String,
    pub batch_id: BatchId,
    pub current_balance: Decimal,
    #[serde(default)]
    pub available_balance: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
}

/// A provider transaction, tagged with the batch that first observed it.
///
/// `batch_id` is not the economic event time; that is
/// `execution_date_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub transaction_id: String,
    pub account_id: String,
    pub batch_id: BatchId,
    #[serde(default)]
    pub execution_date_time: Option<DateTime>,
    #[serde(default)]
    pub posting_date_time: Option<DateTime>,
    #[serde(default)]
    pub value_date_time: Option<DateTime>,
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

/// A transaction annotated with the running balance the reconstruction
/// walk assigned to it. Never persisted.
///
/// Serializes flat with RFC 3339 dates, the shape handed to API callers.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineEntry {
    pub transaction: Transaction,
    pub balance: Decimal,
}

impl Serialize for TimelineEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let tx = &self.transaction;
        TimelineEntryView {
            transaction_id: &tx.transaction_id,
            account_id: &tx.account_id,
            batch_id: tx.batch_id,
            execution_date_time: tx.execution_date_time,
            posting_date_time: tx.posting_date_time,
            value_date_time: tx.value_date_time,
            amount: tx.amount,
            currency: tx.currency.as_deref(),
            description: &tx.description,
            status: tx.status.as_deref(),
            transaction_type: tx.transaction_type.as_deref(),
            reference: tx.reference.as_deref(),
            merchant_name: tx.merchant_name.as_deref(),
            merchant_category_code: tx.merchant_category_code.as_deref(),
            balance: self.balance,
        }
        .serialize(serializer)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimelineEntryView<'a> {
    transaction_id: &'a str,
    account_id: &'a str,
    #[serde(serialize_with = "iso8601::batch")]
    batch_id: BatchId,
    #[serde(serialize_with = "iso8601::optional")]
    execution_date_time: Option<DateTime>,
    #[serde(serialize_with = "iso8601::optional")]
    posting_date_time: Option<DateTime>,
    #[serde(serialize_with = "iso8601::optional")]
    value_date_time: Option<DateTime>,
    amount: Decimal,
    currency: Option<&'a str>,
    description: &'a str,
    status: Option<&'a str>,
    #[serde(rename = "type")]
    transaction_type: Option<&'a str>,
    reference: Option<&'a str>,
    merchant_name: Option<&'a str>,
    merchant_category_code: Option<&'a str>,
    balance: Decimal,
}

fn rfc3339(instant: DateTime) -> String {
    instant
        .to_chrono()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `serialize_with` helpers rendering BSON datetimes as RFC 3339 strings
/// for output that leaves the store.
pub mod iso8601 {
    use super::{rfc3339, BatchId, DateTime};
    use serde::Serializer;

    pub fn batch<S: Serializer>(batch: &BatchId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&rfc3339(batch.0))
    }

    pub fn optional<S: Serializer>(
        instant: &Option<DateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match instant {
            Some(instant) => serializer.serialize_str(&rfc3339(*instant)),
            None => serializer.serialize_none(),
        }
    }
}
