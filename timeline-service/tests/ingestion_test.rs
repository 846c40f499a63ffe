mod common;

use common::{
    active_consent, cdr_transaction, ingestor, ingestor_with_timeout, ScriptedBanking,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use timeline_service::error::TimelineError;
use timeline_service::models::{ArrangementId, BatchId};
use timeline_service::services::banking::Consent;
use timeline_service::services::{InMemoryStore, StoreConnector, StoreSession};

fn two_account_bank() -> ScriptedBanking {
    let mut banking = ScriptedBanking::with_accounts(&["acc-1", "acc-2"]);
    banking.set_balance("acc-1", 500);
    banking.set_balance("acc-2", 80);
    banking.transactions.insert(
        "acc-1".to_string(),
        vec![
            cdr_transaction("acc-1", "tx-1", 30, 1_000),
            cdr_transaction("acc-1", "tx-2", 20, 2_000),
        ],
    );
    banking.transactions.insert(
        "acc-2".to_string(),
        vec![cdr_transaction("acc-2", "tx-3", -15, 1_500)],
    );
    banking
}

#[tokio::test]
async fn test_ingest_writes_all_three_collections() {
    let store = InMemoryStore::new();
    let ingestor = ingestor(Arc::new(two_account_bank()), &store);

    let report = ingestor.ingest().await.unwrap();

    assert_eq!(report.arrangement_id, common::ARRANGEMENT_ID);
    assert_eq!(report.accounts, 2);
    assert_eq!(report.balances, 2);
    assert_eq!(report.transactions, 3);
    assert_eq!(report.skipped_transactions, 0);
    assert_eq!(store.balance_count(), 2);
    assert_eq!(store.transaction_count(), 3);
    assert_eq!(store.transaction("tx-1").unwrap().batch_id, report.batch_id);
}

#[tokio::test]
async fn test_report_json_carries_rfc3339_batch_id() {
    let store = InMemoryStore::new();
    let ingestor = ingestor(Arc::new(two_account_bank()), &store);

    let report = ingestor.ingest().await.unwrap();
    let json = serde_json::to_value(&report).unwrap();

    let batch_id = json["batchId"].as_str().unwrap();
    let parsed = chrono::DateTime::parse_from_rfc3339(batch_id).unwrap();
    assert_eq!(parsed.timestamp_millis(), report.batch_id.timestamp_millis());
    assert!(batch_id.ends_with('Z'));
    assert_eq!(json["arrangementId"], common::ARRANGEMENT_ID);
    assert_eq!(json["transactions"], 3);
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let store = InMemoryStore::new();
    let ingestor = ingestor(Arc::new(two_account_bank()), &store);

    let first = ingestor.ingest().await.unwrap();
    let accounts_after_first = {
        let session = store.connect().await.unwrap();
        let accounts = session.find_accounts().await.unwrap();
        session.close().await;
        accounts
    };

    let second = ingestor.ingest().await.unwrap();
    assert!(second.batch_id > first.batch_id);

    let session = store.connect().await.unwrap();
    assert_eq!(session.find_accounts().await.unwrap(), accounts_after_first);
    session.close().await;
    assert_eq!(store.transactions_by_account().get("acc-1"), Some(&2));

    // One extra snapshot per account, no duplicate transactions
    assert_eq!(store.balance_count(), 4);
    assert_eq!(store.transaction_count(), 3);

    // Re-fetched transactions stay attached to the batch that first saw them
    for id in ["tx-1", "tx-2", "tx-3"] {
        assert_eq!(store.transaction(id).unwrap().batch_id, first.batch_id);
    }
}

#[tokio::test]
async fn test_no_consent_fails_without_writes() {
    let store = InMemoryStore::new();
    let mut banking = two_account_bank();
    banking.consents.clear();
    let ingestor = ingestor(Arc::new(banking), &store);

    let result = ingestor.ingest().await;

    assert!(matches!(result, Err(TimelineError::NoConsent)));
    assert_eq!(store.opened_sessions(), 0);
    assert_eq!(store.balance_count(), 0);
    assert_eq!(store.transaction_count(), 0);
}

#[tokio::test]
async fn test_inactive_consents_are_ignored() {
    let store = InMemoryStore::new();
    let mut banking = two_account_bank();
    banking.consents = vec![
        Consent {
            cdr_arrangement_id: "arr-revoked".to_string(),
            status: Some("REVOKED".to_string()),
        },
        active_consent(common::ARRANGEMENT_ID),
    ];
    let ingestor = ingestor(Arc::new(banking), &store);

    assert_eq!(
        ingestor.consent_check().await.unwrap(),
        ArrangementId(common::ARRANGEMENT_ID.to_string())
    );

    let mut only_revoked = two_account_bank();
    only_revoked.consents = vec![Consent {
        cdr_arrangement_id: "arr-revoked".to_string(),
        status: Some("REVOKED".to_string()),
    }];
    let ingestor = common::ingestor(Arc::new(only_revoked), &store);
    assert!(matches!(
        ingestor.consent_check().await,
        Err(TimelineError::NoConsent)
    ));
}

#[tokio::test]
async fn test_one_failing_account_keeps_sibling_writes() {
    let store = InMemoryStore::new();
    let mut banking = ScriptedBanking::with_accounts(&["acc-1", "acc-2", "acc-3"]);
    for id in ["acc-1", "acc-2", "acc-3"] {
        banking.transactions.insert(
            id.to_string(),
            vec![
                cdr_transaction(id, &format!("{}-a", id), 10, 1_000),
                cdr_transaction(id, &format!("{}-b", id), 5, 2_000),
            ],
        );
    }
    banking.failing_accounts.insert("acc-2".to_string());
    let banking = Arc::new(banking);
    let ingestor = ingestor(Arc::clone(&banking), &store);

    let arrangement = ingestor.consent_check().await.unwrap();
    let batch = ingestor.new_batch();
    let accounts = ingestor.fetch_and_store_accounts(&arrangement).await.unwrap();
    let result = ingestor
        .fetch_and_store_transactions(&arrangement, &accounts, batch)
        .await;

    assert!(matches!(
        result,
        Err(TimelineError::Upstream(timeline_service::services::BankingError::Status {
            status: 500,
            ..
        }))
    ));
    assert_eq!(banking.transaction_calls.load(Ordering::SeqCst), 3);

    let per_account = store.transactions_by_account();
    assert_eq!(per_account.get("acc-1"), Some(&2));
    assert_eq!(per_account.get("acc-3"), Some(&2));
    assert_eq!(per_account.get("acc-2"), None);

    // Session released even though the fan-out failed
    assert_eq!(store.opened_sessions(), store.closed_sessions());
}

#[tokio::test]
async fn test_rerunning_balances_for_same_batch_is_idempotent() {
    let store = InMemoryStore::new();
    let ingestor = ingestor(Arc::new(two_account_bank()), &store);

    let arrangement = ingestor.consent_check().await.unwrap();
    let batch = BatchId::from_millis(1_700_000_000_000);
    let accounts = ingestor.fetch_and_store_accounts(&arrangement).await.unwrap();

    ingestor
        .fetch_and_store_balances(&arrangement, &accounts, batch)
        .await
        .unwrap();
    ingestor
        .fetch_and_store_balances(&arrangement, &accounts, batch)
        .await
        .unwrap();

    assert_eq!(store.balance_count(), 2);
}

#[tokio::test]
async fn test_transactions_without_id_are_skipped() {
    let store = InMemoryStore::new();
    let mut banking = ScriptedBanking::with_accounts(&["acc-1"]);
    let mut pending = cdr_transaction("acc-1", "unused", 7, 3_000);
    pending.transaction_id = None;
    banking.transactions.insert(
        "acc-1".to_string(),
        vec![cdr_transaction("acc-1", "tx-1", 10, 1_000), pending],
    );
    let ingestor = ingestor(Arc::new(banking), &store);

    let report = ingestor.ingest().await.unwrap();

    assert_eq!(report.transactions, 1);
    assert_eq!(report.skipped_transactions, 1);
    assert_eq!(store.transaction_count(), 1);
}

#[tokio::test]
async fn test_slow_provider_hits_run_timeout() {
    let store = InMemoryStore::new();
    let mut banking = two_account_bank();
    banking.delay = Some(Duration::from_millis(500));
    let ingestor = ingestor_with_timeout(Arc::new(banking), &store, Duration::from_millis(50));

    let result = ingestor.ingest().await;

    assert!(matches!(result, Err(TimelineError::Timeout(limit)) if limit == Duration::from_millis(50)));
    assert_eq!(store.balance_count(), 0);
}

#[tokio::test]
async fn test_timeout_during_transaction_stage_releases_session() {
    let store = InMemoryStore::new();
    let mut banking = two_account_bank();
    banking.transaction_delay = Some(Duration::from_secs(2));
    let ingestor = ingestor_with_timeout(Arc::new(banking), &store, Duration::from_millis(100));

    let result = ingestor.ingest().await;

    assert!(matches!(result, Err(TimelineError::Timeout(_))));
    // accounts and balances completed; the transaction session was abandoned
    assert_eq!(store.balance_count(), 2);
    assert_eq!(store.transaction_count(), 0);
    assert_eq!(store.opened_sessions(), 3);
    assert_eq!(store.opened_sessions(), store.closed_sessions());
}

#[tokio::test]
async fn test_every_session_is_closed() {
    let store = InMemoryStore::new();
    let ingestor = ingestor(Arc::new(two_account_bank()), &store);

    ingestor.ingest().await.unwrap();

    // accounts, balances and transactions each get their own session
    assert_eq!(store.opened_sessions(), 3);
    assert_eq!(store.closed_sessions(), 3);
}
