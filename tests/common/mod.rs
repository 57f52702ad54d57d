//! Shared fixtures for the scenario suites.
//!
//! Import via `mod common;`.

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use docstore_transactions::{
    atr_id, lookup_attempts, now_millis, AtrEntry, Collection, DurabilityLevel, InMemoryCollection, InMemoryStore,
    Keyspace, TransactionConfig, TransactionId, Transactions, TXN_XATTR,
};
use serde_json::Value;

pub const NUM_ATRS: usize = 8;

static INIT_TRACING: Once = Once::new();

/// Log to the test writer, filtered by `RUST_LOG`
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn accounts() -> Keyspace {
    Keyspace::default_collection("bank")
}

pub fn ledger() -> Keyspace {
    Keyspace::new("bank", "audit", "ledger")
}

pub fn test_config() -> TransactionConfig {
    TransactionConfig {
        expiration: Duration::from_secs(2),
        durability: DurabilityLevel::None,
        num_atrs: NUM_ATRS,
        cleanup_window: Duration::from_millis(80),
        ..TransactionConfig::default()
    }
}

/// Wall-clock time far enough ahead that every entry written now has expired
pub fn far_future() -> u64 {
    now_millis() + 3_600_000
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub transactions: Transactions,
}

impl Harness {
    pub fn new(config: TransactionConfig) -> Self {
        init_tracing();
        let store = Arc::new(InMemoryStore::new());
        let transactions = Transactions::new(store.clone(), config).unwrap();
        Self { store, transactions }
    }

    /// Typed handle for seeding, peeking and fault injection
    pub fn raw(&self, keyspace: &Keyspace) -> Arc<InMemoryCollection> {
        self.store.in_memory(keyspace).unwrap()
    }

    /// Handle as the transaction code sees it
    pub fn collection(&self, keyspace: &Keyspace) -> Arc<dyn Collection> {
        self.raw(keyspace)
    }

    /// Every ATR entry written by `txn` in the accounts bucket
    pub async fn entries_of(&self, txn: TransactionId) -> Vec<(Box<str>, AtrEntry)> {
        let coll = self.raw(&accounts());
        let txn = txn.to_string();
        let mut found = Vec::new();
        for index in 0..NUM_ATRS {
            let Some(entries) = lookup_attempts(coll.as_ref(), &atr_id(index)).await.unwrap() else {
                continue;
            };
            found.extend(
                entries
                    .into_iter()
                    .filter(|(_, entry)| entry.transaction_id.as_deref() == Some(txn.as_str())),
            );
        }
        found
    }
}

/// Body of a live document, `None` for tombstones and missing documents
pub fn body(coll: &InMemoryCollection, id: &str) -> Option<Value> {
    coll.peek(id).filter(|doc| !doc.is_deleted).and_then(|doc| doc.body)
}

/// Whether a document still carries transaction metadata
pub fn has_txn_metadata(coll: &InMemoryCollection, id: &str) -> bool {
    coll.peek(id).is_some_and(|doc| doc.xattr(TXN_XATTR).is_some())
}
