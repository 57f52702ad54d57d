//! Client-side multi-document transactions for a clustered document store
//!
//! The store offers single-document atomicity only. This crate builds
//! multi-document transactions on top of it: mutations are staged as hidden
//! metadata on each document, and an Active Transaction Record (ATR) entry
//! records whether the attempt committed. Flipping that entry to COMMITTED is
//! the commit point; staged content is promoted afterwards. Clients that crash
//! mid-transaction leave entries behind which the lost-transaction sweepers of
//! any other client eventually finish.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let store = Arc::new(InMemoryStore::new());
//! let accounts: Arc<dyn Collection> = store.in_memory(&Keyspace::default_collection("bank"))?;
//! let transactions = Transactions::new(store.clone(), TransactionConfig::default())?;
//!
//! let result = transactions
//!     .run(|ctx| {
//!         let accounts = accounts.clone();
//!         async move {
//!             let alice = ctx.get(&accounts, "alice").await?;
//!             let bob = ctx.get(&accounts, "bob").await?;
//!             ctx.replace(&alice, &json!({"balance": 90})).await?;
//!             ctx.replace(&bob, &json!({"balance": 110})).await?;
//!             Ok(())
//!         }
//!     })
//!     .await?;
//!
//! // Host-managed cleanup lifecycle
//! transactions.cleanup().start();
//! // ...
//! transactions.cleanup().dispose().await;
//! ```

#![warn(missing_docs)]

// === Store ===
mod memory;
mod store;

// === Core Types ===
mod atr;
mod config;
mod context;
mod document;
mod errors;
mod redaction;
mod staged;
mod state;

// === Protocol ===
mod attempt;
mod repository;
mod retry;
mod transactions;
mod triage;

// === Cleanup ===
mod cleaner;
mod client_record;
mod lost_cleanup;
mod sweeper;

// === Observability ===
mod observer;
mod stats;

// === Re-exports ===

// Store
pub use memory::{FaultOp, InMemoryCollection, InMemoryStore};
pub use store::{
    lookup_path, Collection, CollectionResolver, Keyspace, MutateOptions, MutateSpec, StoreError, StoreSemantics,
    StoredDocument, DEFAULT_NAME,
};

// Types
pub use atr::{
    atr_id, atr_id_for_key, atr_index, atr_index_for_key, AtrEntry, AtrRef, DocRecord, ATR_ATTEMPTS_FIELD,
    TXN_DOC_PREFIX,
};
pub use config::{ConfigError, DurabilityLevel, TransactionConfig, MAX_ATRS};
pub use context::{now_millis, AttemptId, TransactionContext, TransactionId};
pub use document::{
    CompositeId, RestoreMetadata, StagedKind, StagedOperation, TransactionGetResult, TransactionXattrs, TXN_XATTR,
};
pub use redaction::{Redacted, RedactionLevel, Redactor};
pub use staged::{StagedMutation, StagedMutations};
pub use state::{AtrState, AttemptState, IllegalTransition};

// Errors
pub use errors::{
    ErrorClass, FailureCause, FinalError, TransactionError, TransactionFailure, TransactionOperationFailed,
};

// Protocol
pub use attempt::AttemptContext;
pub use repository::{
    find_entry, lookup_attempts, remove_entry, transition_entry, AtrRepository, ClientRecordRepository, DocumentRepository,
};
pub use retry::{RepeatDelay, RetryPolicy};
pub use transactions::{TransactionResult, Transactions};
pub use triage::{combine_previous_errors, FailDirective, LocalAction, TriageDecision};

// Cleanup
pub use cleaner::{Cleaner, CleanupError, CleanupRequest};
pub use client_record::{
    partition, ClientEntry, ClientRecord, ClientRecordDetails, OverrideEntry, CLIENT_RECORD_FIELD, CLIENT_RECORD_ID,
    MAX_PRUNED_PER_WRITE, SAFETY_MARGIN,
};
pub use lost_cleanup::LostCleanup;
pub use sweeper::{AtrQueue, CollectionSweeper, CycleOutcome};

// Observability
pub use observer::{NoOpObserver, TracingObserver, TransactionObserver};
pub use stats::{CleanupStats, CleanupStatsSnapshot};
