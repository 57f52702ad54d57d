//! Lost-transaction cleanup scenarios: attempts a client gave up on are
//! finished by a later sweep.

mod common;

use common::{accounts, body, far_future, has_txn_metadata, ledger, test_config, Harness, NUM_ATRS};
use docstore_transactions::{AtrState, CycleOutcome, FaultOp, StoreError, TransactionOperationFailed};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn test_cleanup_finishes_commit_after_unstaging_failed() {
    let h = Harness::new(test_config());
    let raw_accounts = h.raw(&accounts());
    let raw_ledger = h.raw(&ledger());
    raw_accounts.write_raw("a", json!({"balance": 10})).unwrap();
    raw_ledger.inject_fault(FaultOp::Insert, "b", StoreError::InternalServerFailure("node down".into()), None);
    let accounts_coll = h.collection(&accounts());
    let ledger_coll = h.collection(&ledger());

    let result = h
        .transactions
        .run(|ctx| {
            let accounts_coll = accounts_coll.clone();
            let ledger_coll = ledger_coll.clone();
            async move {
                ctx.insert(&ledger_coll, "b", &json!({"credit": 5})).await?;
                let a = ctx.get(&accounts_coll, "a").await?;
                ctx.replace(&a, &json!({"balance": 5})).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    // Past the commit point, so the transaction still succeeded.
    assert!(!result.unstaging_complete);
    let entries = h.entries_of(result.transaction_id).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.state, AtrState::Committed);
    assert_eq!(body(&raw_ledger, "b"), None);

    raw_ledger.clear_faults();
    let sweeper = h.transactions.cleanup().sweeper(&accounts()).unwrap();
    let outcome = sweeper.run_cycle_at(far_future()).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Swept { atrs: NUM_ATRS, found: 1, cleaned: 1 });

    assert_eq!(body(&raw_ledger, "b"), Some(json!({"credit": 5})));
    assert_eq!(body(&raw_accounts, "a"), Some(json!({"balance": 5})));
    assert!(!has_txn_metadata(&raw_ledger, "b"));
    assert!(!has_txn_metadata(&raw_accounts, "a"));
    assert!(h.entries_of(result.transaction_id).await.is_empty());

    let again = sweeper.run_cycle_at(far_future()).await.unwrap();
    assert_eq!(again, CycleOutcome::Swept { atrs: NUM_ATRS, found: 0, cleaned: 0 });

    let stats = h.transactions.cleanup().stats(&accounts()).unwrap();
    assert_eq!(stats.entries_cleaned, 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_pending_attempt_is_removed() {
    let h = Harness::new(test_config());
    let raw = h.raw(&accounts());
    raw.write_raw("a", json!({"balance": 10})).unwrap();
    let coll = h.collection(&accounts());

    let err = h
        .transactions
        .run(|ctx| {
            let coll = coll.clone();
            async move {
                let a = ctx.get(&coll, "a").await?;
                ctx.replace(&a, &json!({"balance": 0})).await?;
                Err(TransactionOperationFailed::application("client crashed").no_rollback())
            }
        })
        .await
        .unwrap_err();

    let txn = err.failure().transaction_id;
    assert_eq!(h.entries_of(txn).await[0].1.state, AtrState::Pending);
    assert!(has_txn_metadata(&raw, "a"));

    let sweeper = h.transactions.cleanup().sweeper(&accounts()).unwrap();
    let outcome = sweeper.run_cycle_at(far_future()).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Swept { atrs: NUM_ATRS, found: 1, cleaned: 1 });
    assert!(h.entries_of(txn).await.is_empty());
    assert_eq!(body(&raw, "a"), Some(json!({"balance": 10})));

    // The stale staging no longer blocks writers.
    let result = h
        .transactions
        .run(|ctx| {
            let coll = coll.clone();
            async move {
                let a = ctx.get(&coll, "a").await?;
                assert_eq!(a.content_as::<serde_json::Value>()?, json!({"balance": 10}));
                ctx.replace(&a, &json!({"balance": 20})).await?;
                Ok(())
            }
        })
        .await
        .unwrap();
    assert_eq!(result.attempts, 1);
    assert_eq!(body(&raw, "a"), Some(json!({"balance": 20})));
    assert!(!has_txn_metadata(&raw, "a"));
}

#[tokio::test(start_paused = true)]
async fn test_lost_aborted_attempt_is_reverted() {
    let h = Harness::new(test_config());
    let raw = h.raw(&accounts());
    raw.write_raw("a", json!({"balance": 10})).unwrap();
    let coll = h.collection(&accounts());

    let err = h
        .transactions
        .run(|ctx| {
            let coll = coll.clone();
            let raw = raw.clone();
            async move {
                let a = ctx.get(&coll, "a").await?;
                ctx.replace(&a, &json!({"balance": 0})).await?;
                raw.inject_fault(FaultOp::MutateIn, "a", StoreError::InternalServerFailure("node down".into()), None);
                Err(TransactionOperationFailed::application("changed my mind"))
            }
        })
        .await
        .unwrap_err();

    let txn = err.failure().transaction_id;
    let entries = h.entries_of(txn).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].1.state, AtrState::Aborted);
    assert!(has_txn_metadata(&raw, "a"));

    raw.clear_faults();
    let sweeper = h.transactions.cleanup().sweeper(&accounts()).unwrap();
    let outcome = sweeper.run_cycle_at(far_future()).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Swept { atrs: NUM_ATRS, found: 1, cleaned: 1 });

    assert_eq!(body(&raw, "a"), Some(json!({"balance": 10})));
    assert!(!has_txn_metadata(&raw, "a"));
    assert!(h.entries_of(txn).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unexpired_entries_are_left_alone() {
    let h = Harness::new(test_config());
    let coll = h.collection(&accounts());

    let err = h
        .transactions
        .run(|ctx| {
            let coll = coll.clone();
            async move {
                ctx.insert(&coll, "a", &json!({})).await?;
                Err(TransactionOperationFailed::application("crash").no_rollback())
            }
        })
        .await
        .unwrap_err();

    let sweeper = h.transactions.cleanup().sweeper(&accounts()).unwrap();
    let outcome = sweeper.run_cycle().await.unwrap();
    assert_eq!(outcome, CycleOutcome::Swept { atrs: NUM_ATRS, found: 0, cleaned: 0 });
    assert_eq!(h.entries_of(err.failure().transaction_id).await.len(), 1);
}
