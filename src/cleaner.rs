//! Cleaner: finishes or reverts one lost attempt
//!
//! Works only from the ATR entry and each document's own `txn` xattr, so any
//! client can run it. Every step is idempotent: a document that no longer
//! carries the attempt's metadata is skipped, and removing an entry that is
//! already gone is not an error.

use std::sync::Arc;

use serde_json::Value;

use crate::atr::{AtrEntry, AtrRef, DocRecord};
use crate::config::{DurabilityLevel, TransactionConfig};
use crate::document::{StagedKind, TransactionXattrs};
use crate::observer::TransactionObserver;
use crate::redaction::Redactor;
use crate::repository::{remove_entry, DocumentRepository};
use crate::state::AtrState;
use crate::store::{CollectionResolver, StoreError};

/// Cleanup errors
#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The client record kept changing under this client
    #[error("client record contended after {0} tries")]
    ClientRecordContention(u32),
}

/// One expired entry to finish
#[derive(Clone, Debug)]
pub struct CleanupRequest {
    /// ATR holding the entry
    pub atr: AtrRef,
    /// Attempt the entry belongs to
    pub attempt_id: Box<str>,
    /// Entry as read from the ATR
    pub entry: AtrEntry,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Finishes lost attempts
pub struct Cleaner {
    resolver: Arc<dyn CollectionResolver>,
    durability: DurabilityLevel,
    docs: DocumentRepository,
    redactor: Redactor,
    observer: Arc<dyn TransactionObserver>,
}

impl Cleaner {
    /// Cleaner reaching documents through `resolver`
    pub fn new(
        resolver: Arc<dyn CollectionResolver>,
        config: &TransactionConfig,
        observer: Arc<dyn TransactionObserver>,
    ) -> Self {
        Self {
            resolver,
            durability: config.durability,
            docs: DocumentRepository::new(config.durability),
            redactor: Redactor::new(config.redaction),
            observer,
        }
    }

    /// Finish `request` and remove its entry.
    ///
    /// COMMITTED entries are unstaged forward and ABORTED entries backward.
    /// PENDING, COMPLETED and ROLLED_BACK entries are only removed. Returns
    /// `true` if this call removed the entry.
    pub async fn clean(&self, request: &CleanupRequest) -> Result<bool, CleanupError> {
        let state = request.entry.state;
        match state {
            AtrState::Committed => self.visit_documents(request, Direction::Forward).await?,
            AtrState::Aborted => self.visit_documents(request, Direction::Backward).await?,
            AtrState::Pending | AtrState::Completed | AtrState::RolledBack => {}
            AtrState::Unknown => {
                tracing::debug!(atr = %request.atr, attempt_id = %request.attempt_id, "Skipping entry in an unknown state");
                return Ok(false);
            }
        }

        let atr_collection = self.resolver.collection(&request.atr.keyspace())?;
        let removed = remove_entry(atr_collection.as_ref(), &request.atr.id, &request.attempt_id, self.durability).await?;
        if removed {
            self.observer.on_entry_cleaned(&request.atr, &request.attempt_id, state);
        }
        Ok(removed)
    }

    async fn visit_documents(&self, request: &CleanupRequest, direction: Direction) -> Result<(), CleanupError> {
        for record in request.entry.documents() {
            self.visit_document(request, record, direction).await?;
        }
        Ok(())
    }

    async fn visit_document(
        &self,
        request: &CleanupRequest,
        record: &DocRecord,
        direction: Direction,
    ) -> Result<(), CleanupError> {
        let collection = self.resolver.collection(&record.keyspace())?;
        let Some(doc) = self.docs.lookup(collection.as_ref(), &record.id).await? else {
            return Ok(());
        };
        let Some(txn) = TransactionXattrs::from_document(&doc) else {
            return Ok(());
        };
        if txn.id.attempt_id != request.attempt_id {
            // Restaged by a later attempt, or already finished.
            return Ok(());
        }

        let id = record.id.as_ref();
        match (direction, txn.op.kind) {
            (Direction::Forward, StagedKind::Remove) => {
                self.docs.unstage_remove(collection.as_ref(), id, doc.cas).await?;
            }
            (Direction::Forward, StagedKind::Insert | StagedKind::Replace) => {
                let content = txn.op.staged.unwrap_or(Value::Null);
                self.docs
                    .unstage_insert_or_replace(collection.as_ref(), id, doc.cas, content, doc.is_deleted)
                    .await?;
            }
            (Direction::Backward, _) => {
                self.docs.clear_metadata(collection.as_ref(), id, doc.cas, doc.is_deleted).await?;
            }
        }
        tracing::debug!(
            atr = %request.atr,
            attempt_id = %request.attempt_id,
            doc = %self.redactor.user(id),
            direction = ?direction,
            "Cleaned document"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{CompositeId, StagedOperation, TXN_XATTR};
    use crate::memory::{InMemoryCollection, InMemoryStore};
    use crate::observer::NoOpObserver;
    use crate::repository::{lookup_attempts, AtrRepository};
    use crate::store::{Collection, Keyspace};
    use serde_json::json;

    const ATR_ID: &str = "_txn:atr-3";
    const ATTEMPT: &str = "attempt-1";

    struct Fixture {
        store: Arc<InMemoryStore>,
        coll: Arc<InMemoryCollection>,
        handle: Arc<dyn Collection>,
        atr: AtrRepository,
        docs: DocumentRepository,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryStore::new());
            let keyspace = Keyspace::default_collection("b");
            let coll = store.in_memory(&keyspace).unwrap();
            let handle: Arc<dyn Collection> = coll.clone();
            let atr = AtrRepository::new(handle.clone(), ATR_ID.into(), ATTEMPT.into(), DurabilityLevel::None);
            Self { store, coll, handle, atr, docs: DocumentRepository::new(DurabilityLevel::None) }
        }

        fn xattrs(&self, kind: StagedKind, staged: Option<Value>) -> TransactionXattrs {
            TransactionXattrs {
                id: CompositeId { transaction_id: "t".into(), attempt_id: ATTEMPT.into() },
                atr: AtrRef::new(self.handle.keyspace(), ATR_ID.into()),
                op: StagedOperation { kind, staged },
                restore: None,
                forward_compat: None,
            }
        }

        fn cleaner(&self) -> Cleaner {
            let config = TransactionConfig { durability: DurabilityLevel::None, ..TransactionConfig::default() };
            Cleaner::new(self.store.clone(), &config, Arc::new(NoOpObserver))
        }

        async fn request(&self) -> CleanupRequest {
            let entry = self.atr.lookup_own_entry().await.unwrap().unwrap();
            CleanupRequest { atr: AtrRef::new(self.handle.keyspace(), ATR_ID.into()), attempt_id: ATTEMPT.into(), entry }
        }

        /// Stage an insert of `fresh` and a replace of `existing`
        async fn stage_two(&self) -> Vec<DocRecord> {
            self.atr.set_pending(&AtrEntry::pending("t", 0, 10, "n")).await.unwrap();
            self.docs
                .stage_insert(&*self.handle, "fresh", &self.xattrs(StagedKind::Insert, Some(json!({"v": 0}))), None)
                .await
                .unwrap();
            let cas = self.coll.write_raw("existing", json!({"v": 1})).unwrap();
            self.docs
                .stage_mutation(&*self.handle, "existing", cas, &self.xattrs(StagedKind::Replace, Some(json!({"v": 2}))), false)
                .await
                .unwrap();
            vec![DocRecord::new(self.handle.keyspace(), "fresh"), DocRecord::new(self.handle.keyspace(), "existing")]
        }
    }

    #[tokio::test]
    async fn test_committed_entry_is_finished_forward() {
        let fx = Fixture::new();
        let records = fx.stage_two().await;
        fx.atr.set_committed(&records[..1], &records[1..], &[]).await.unwrap();

        assert!(fx.cleaner().clean(&fx.request().await).await.unwrap());

        assert_eq!(fx.coll.peek("fresh").unwrap().body, Some(json!({"v": 0})));
        assert!(!fx.coll.peek("fresh").unwrap().is_deleted);
        let existing = fx.coll.peek("existing").unwrap();
        assert_eq!(existing.body, Some(json!({"v": 2})));
        assert!(existing.xattr(TXN_XATTR).is_none());
        assert!(lookup_attempts(&*fx.handle, ATR_ID).await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_entry_is_reverted() {
        let fx = Fixture::new();
        let records = fx.stage_two().await;
        fx.atr.set_aborted(&records[..1], &records[1..], &[]).await.unwrap();

        assert!(fx.cleaner().clean(&fx.request().await).await.unwrap());

        let fresh = fx.coll.peek("fresh").unwrap();
        assert!(fresh.is_deleted);
        assert!(fresh.xattr(TXN_XATTR).is_none());
        let existing = fx.coll.peek("existing").unwrap();
        assert_eq!(existing.body, Some(json!({"v": 1})));
        assert!(existing.xattr(TXN_XATTR).is_none());
    }

    #[tokio::test]
    async fn test_second_clean_is_a_no_op() {
        let fx = Fixture::new();
        let records = fx.stage_two().await;
        fx.atr.set_committed(&records[..1], &records[1..], &[]).await.unwrap();
        let request = fx.request().await;
        let cleaner = fx.cleaner();

        assert!(cleaner.clean(&request).await.unwrap());
        assert!(!cleaner.clean(&request).await.unwrap());
        assert_eq!(fx.coll.peek("existing").unwrap().body, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_documents_owned_by_other_attempts_are_left_alone() {
        let fx = Fixture::new();
        let records = fx.stage_two().await;
        fx.atr.set_aborted(&records[..1], &records[1..], &[]).await.unwrap();

        // A later attempt restaged the replace.
        let mut other = fx.xattrs(StagedKind::Replace, Some(json!({"v": 9})));
        other.id.attempt_id = "attempt-2".into();
        let cas = fx.coll.peek("existing").unwrap().cas;
        fx.docs.stage_mutation(&*fx.handle, "existing", cas, &other, false).await.unwrap();

        fx.cleaner().clean(&fx.request().await).await.unwrap();
        let existing = fx.coll.peek("existing").unwrap();
        let txn = TransactionXattrs::from_document(&existing).unwrap();
        assert_eq!(txn.id.attempt_id.as_ref(), "attempt-2");
    }

    #[tokio::test]
    async fn test_pending_entry_is_only_removed() {
        let fx = Fixture::new();
        fx.atr.set_pending(&AtrEntry::pending("t", 0, 10, "n")).await.unwrap();
        assert!(fx.cleaner().clean(&fx.request().await).await.unwrap());
        assert!(fx.atr.lookup_own_entry().await.unwrap().is_none());
    }
}
