//! Attempt Context: one attempt of a transaction
//!
//! An [`AttemptContext`] is handed to the application logic for each attempt.
//! Reads resolve documents staged by other attempts through their ATR entry
//! (Get With MAV). Writes are staged into the `txn` xattr of each document,
//! after the attempt's ATR entry has been created in PENDING. Commit flips the
//! ATR entry to COMMITTED, which is the commit point, then unstages every
//! mutation and marks the entry COMPLETED. Rollback mirrors this through
//! ABORTED and ROLLED_BACK.
//!
//! Every store failure goes through the triage table of the phase that saw
//! it. The in-memory state sits behind a mutex that is never held across an
//! await.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::atr::{atr_id_for_key, AtrEntry, AtrRef, DocRecord};
use crate::context::{now_millis, AttemptId, TransactionContext, TransactionId};
use crate::document::{
    CompositeId, RestoreMetadata, StagedKind, StagedOperation, TransactionGetResult, TransactionXattrs,
};
use crate::errors::{ErrorClass, FailureCause, FinalError, TransactionOperationFailed};
use crate::redaction::Redactor;
use crate::repository::{find_entry, AtrRepository, DocumentRepository};
use crate::retry::RepeatDelay;
use crate::staged::{StagedMutation, StagedMutations};
use crate::state::{AtrState, AttemptState};
use crate::store::{Collection, CollectionResolver, StoredDocument};
use crate::triage::{self, combine_previous_errors, LocalAction, TriageDecision};

/// How long a write waits for another attempt to release a document
const WRITE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const WRITE_WRITE_POLL: Duration = Duration::from_millis(50);

fn fail(decision: TriageDecision, class: ErrorClass, cause: impl Into<FailureCause>) -> TransactionOperationFailed {
    let cause = cause.into();
    decision
        .into_failure(class, cause.clone())
        .unwrap_or_else(|| TransactionOperationFailed::new(class, cause))
}

fn expired() -> TransactionOperationFailed {
    TransactionOperationFailed::new(ErrorClass::FailExpiry, FailureCause::AttemptExpired)
        .raise(FinalError::TransactionExpired)
}

fn to_content<T: Serialize + ?Sized>(content: &T) -> Result<Value, TransactionOperationFailed> {
    serde_json::to_value(content).map_err(TransactionOperationFailed::application)
}

/// Document being staged over
struct Target<'a> {
    collection: &'a Arc<dyn Collection>,
    id: &'a str,
    cas: u64,
    is_deleted: bool,
}

struct AttemptShared {
    state: AttemptState,
    staged: StagedMutations,
    atr: Option<AtrRepository>,
    atr_ref: Option<AtrRef>,
    errors: Vec<TransactionOperationFailed>,
    overtime: bool,
}

struct AttemptInner {
    txn: TransactionContext,
    attempt_id: AttemptId,
    attempt_key: Box<str>,
    resolver: Arc<dyn CollectionResolver>,
    docs: DocumentRepository,
    redactor: Redactor,
    shared: Mutex<AttemptShared>,
}

/// Handle to one attempt, cheap to clone
#[derive(Clone)]
pub struct AttemptContext {
    inner: Arc<AttemptInner>,
}

impl AttemptContext {
    pub(crate) fn new(txn: TransactionContext, resolver: Arc<dyn CollectionResolver>) -> Self {
        let attempt_id = AttemptId::new();
        let docs = DocumentRepository::new(txn.config.durability);
        let redactor = Redactor::new(txn.config.redaction);
        Self {
            inner: Arc::new(AttemptInner {
                attempt_key: attempt_id.to_string().into(),
                attempt_id,
                txn,
                resolver,
                docs,
                redactor,
                shared: Mutex::new(AttemptShared {
                    state: AttemptState::NotStarted,
                    staged: StagedMutations::new(),
                    atr: None,
                    atr_ref: None,
                    errors: Vec::new(),
                    overtime: false,
                }),
            }),
        }
    }

    /// This attempt's id
    pub fn attempt_id(&self) -> AttemptId {
        self.inner.attempt_id
    }

    /// Id of the transaction this attempt belongs to
    pub fn transaction_id(&self) -> TransactionId {
        self.inner.txn.transaction_id
    }

    /// Current phase
    pub fn state(&self) -> AttemptState {
        self.shared().state
    }

    /// ATR holding this attempt's entry, once one was written
    pub fn atr(&self) -> Option<AtrRef> {
        self.shared().atr_ref.clone()
    }

    fn shared(&self) -> MutexGuard<'_, AttemptShared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record<T>(&self, result: Result<T, TransactionOperationFailed>) -> Result<T, TransactionOperationFailed> {
        if let Err(e) = &result {
            self.shared().errors.push(e.clone());
        }
        result
    }

    fn set_state(&self, to: AttemptState) {
        let mut shared = self.shared();
        match shared.state.transition(to) {
            Ok(next) => shared.state = next,
            Err(e) => tracing::warn!(attempt_id = %self.inner.attempt_id, error = %e, "Ignoring attempt state change"),
        }
    }

    fn has_expired(&self) -> bool {
        self.inner.txn.has_expired()
    }

    fn in_overtime(&self) -> bool {
        self.shared().overtime
    }

    /// Once past the deadline, enter overtime: the phase keeps going and only
    /// a store failure from then on ends it
    fn enter_overtime_if_expired(&self) {
        if !self.has_expired() {
            return;
        }
        let mut shared = self.shared();
        if !shared.overtime {
            shared.overtime = true;
            tracing::warn!(
                txn_id = %self.inner.txn.transaction_id,
                attempt_id = %self.inner.attempt_id,
                "Attempt expired, continuing in overtime"
            );
        }
    }

    fn check_can_operate(&self) -> Result<(), TransactionOperationFailed> {
        {
            let shared = self.shared();
            if !matches!(shared.state, AttemptState::NotStarted | AttemptState::Staging) {
                return Err(TransactionOperationFailed::illegal_state(format!(
                    "operation on an attempt that is {}",
                    shared.state.name()
                )));
            }
            if let Some(e) = combine_previous_errors(&shared.errors) {
                return Err(e);
            }
        }
        if self.has_expired() {
            return Err(expired());
        }
        Ok(())
    }

    fn staged_for(&self, collection: &Arc<dyn Collection>, id: &str) -> Option<StagedMutation> {
        self.shared().staged.find(collection.keyspace(), id).cloned()
    }

    fn track(
        &self,
        collection: &Arc<dyn Collection>,
        id: &str,
        kind: StagedKind,
        content: Option<Value>,
        cas: u64,
    ) -> TransactionGetResult {
        self.shared().staged.add(StagedMutation {
            id: id.into(),
            collection: collection.clone(),
            kind,
            content: content.clone(),
            cas,
        });
        TransactionGetResult {
            id: id.into(),
            collection: collection.clone(),
            cas,
            content,
            txn: None,
            is_deleted: kind == StagedKind::Insert,
        }
    }

    fn xattrs(&self, atr: &AtrRepository, kind: StagedKind, staged: Option<Value>, restore: Option<u64>) -> TransactionXattrs {
        TransactionXattrs {
            id: CompositeId {
                transaction_id: self.inner.txn.transaction_id.to_string().into(),
                attempt_id: self.inner.attempt_key.clone(),
            },
            atr: AtrRef::new(atr.collection().keyspace(), atr.atr_id().into()),
            op: StagedOperation { kind, staged },
            restore: restore.map(|cas| RestoreMetadata { cas }),
            forward_compat: None,
        }
    }

    // === Reads ===

    /// Read a document, `None` if it does not exist in this attempt's view
    pub async fn get_optional(
        &self,
        collection: &Arc<dyn Collection>,
        id: &str,
    ) -> Result<Option<TransactionGetResult>, TransactionOperationFailed> {
        let result = self.get_optional_inner(collection, id).await;
        self.record(result)
    }

    /// Read a document that must exist
    pub async fn get(
        &self,
        collection: &Arc<dyn Collection>,
        id: &str,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        self.get_optional(collection, id).await?.ok_or_else(|| {
            TransactionOperationFailed::new(ErrorClass::FailDocNotFound, FailureCause::DocumentNotFound)
        })
    }

    async fn get_optional_inner(
        &self,
        collection: &Arc<dyn Collection>,
        id: &str,
    ) -> Result<Option<TransactionGetResult>, TransactionOperationFailed> {
        self.check_can_operate()?;

        if let Some(own) = self.staged_for(collection, id) {
            return Ok(match own.kind {
                StagedKind::Remove => None,
                StagedKind::Insert | StagedKind::Replace => Some(TransactionGetResult {
                    id: id.into(),
                    collection: own.collection,
                    cas: own.cas,
                    content: own.content,
                    txn: None,
                    is_deleted: own.kind == StagedKind::Insert,
                }),
            });
        }

        let doc = match self.inner.docs.lookup(collection.as_ref(), id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Ok(None),
            Err(e) => {
                let class = ErrorClass::classify(&e);
                return match triage::get(class) {
                    TriageDecision::TreatAsSuccess => Ok(None),
                    decision => Err(fail(decision, class, e)),
                };
            }
        };
        self.resolve_read(collection, id, doc).await
    }

    /// Get With MAV: choose between the committed and the staged view of a document
    async fn resolve_read(
        &self,
        collection: &Arc<dyn Collection>,
        id: &str,
        doc: StoredDocument,
    ) -> Result<Option<TransactionGetResult>, TransactionOperationFailed> {
        let content = match TransactionXattrs::from_document(&doc) {
            None if doc.is_deleted => None,
            None => doc.body.clone(),
            Some(txn) => {
                if self.staged_elsewhere_committed(&txn).await? {
                    tracing::debug!(
                        attempt_id = %self.inner.attempt_id,
                        doc = %self.inner.redactor.user(id),
                        blocking = %txn.id.attempt_id,
                        "Reading staged content of a committed attempt"
                    );
                    match txn.op.kind {
                        StagedKind::Remove => None,
                        StagedKind::Insert | StagedKind::Replace => txn.op.staged.clone(),
                    }
                } else if doc.is_deleted {
                    None
                } else {
                    doc.body.clone()
                }
            }
        };
        Ok(content.map(|content| TransactionGetResult::from_stored(id, collection.clone(), doc, Some(content))))
    }

    async fn staged_elsewhere_committed(&self, txn: &TransactionXattrs) -> Result<bool, TransactionOperationFailed> {
        let atr_collection = self.inner.resolver.collection(&txn.atr.keyspace())?;
        match find_entry(atr_collection.as_ref(), &txn.atr.id, &txn.id.attempt_id).await {
            Ok(Some(entry)) => Ok(matches!(entry.state, AtrState::Committed | AtrState::Completed)),
            Ok(None) => Ok(false),
            Err(e) => {
                let class = ErrorClass::classify(&e);
                Err(fail(triage::atr_lookup_in_mav(class), class, e))
            }
        }
    }

    /// Wait for another attempt staged on a document to finish or expire
    async fn check_write_write(&self, id: &str, blocking: &TransactionXattrs) -> Result<(), TransactionOperationFailed> {
        if blocking.id.attempt_id == self.inner.attempt_key {
            return Ok(());
        }
        let atr_collection = self.inner.resolver.collection(&blocking.atr.keyspace())?;
        let deadline = Instant::now() + WRITE_WRITE_TIMEOUT;
        loop {
            if self.has_expired() {
                return Err(expired());
            }
            match find_entry(atr_collection.as_ref(), &blocking.atr.id, &blocking.id.attempt_id).await {
                Ok(None) => return Ok(()),
                Ok(Some(entry)) if entry.state.is_terminal() || entry.has_expired(now_millis()) => return Ok(()),
                Ok(Some(_)) => {}
                Err(e) => return Err(TransactionOperationFailed::new(ErrorClass::classify(&e), e).retry()),
            }
            if Instant::now() >= deadline {
                tracing::debug!(
                    attempt_id = %self.inner.attempt_id,
                    doc = %self.inner.redactor.user(id),
                    blocking = %blocking.id.attempt_id,
                    "Write-write conflict"
                );
                return Err(TransactionOperationFailed::new(
                    ErrorClass::FailWriteWriteConflict,
                    FailureCause::DocumentAlreadyInTransaction,
                )
                .retry());
            }
            tokio::time::sleep(WRITE_WRITE_POLL).await;
        }
    }

    // === Staging ===

    /// Create the ATR entry in PENDING before the first staged mutation
    async fn ensure_pending(&self, collection: &Arc<dyn Collection>, id: &str) -> Result<AtrRepository, TransactionOperationFailed> {
        let existing = self.shared().atr.clone();
        if let Some(atr) = existing {
            return Ok(atr);
        }

        let config = &self.inner.txn.config;
        let keyspace = config
            .metadata_collection
            .clone()
            .unwrap_or_else(|| collection.keyspace().bucket_default());
        let atr_collection = self.inner.resolver.collection(&keyspace)?;
        let atr_id = atr_id_for_key(id, config.num_atrs);
        let atr = AtrRepository::new(
            atr_collection,
            atr_id.clone(),
            self.inner.attempt_key.clone(),
            config.durability,
        );
        let entry = AtrEntry::pending(
            &self.inner.txn.transaction_id.to_string(),
            now_millis(),
            self.inner.txn.remaining().as_millis() as u64,
            config.durability.short_code(),
        );

        let mut repeats = 0;
        loop {
            let (class, cause) = if self.has_expired() {
                (ErrorClass::FailExpiry, FailureCause::AttemptExpired)
            } else {
                match atr.set_pending(&entry).await {
                    Ok(_) => break,
                    Err(e) => (ErrorClass::classify(&e), e.into()),
                }
            };
            match triage::set_atr_pending(class, self.in_overtime()) {
                TriageDecision::TreatAsSuccess => break,
                TriageDecision::Repeat => {}
                decision => return Err(fail(decision, class, cause)),
            }
            repeats += 1;
            RepeatDelay::short().wait(repeats).await;
        }

        let atr_ref = AtrRef::new(&keyspace, atr_id);
        tracing::debug!(
            txn_id = %self.inner.txn.transaction_id,
            attempt_id = %self.inner.attempt_id,
            atr = %atr_ref,
            "ATR entry pending"
        );
        let mut shared = self.shared();
        shared.state = shared
            .state
            .transition(AttemptState::Staging)
            .map_err(|e| TransactionOperationFailed::illegal_state(e.to_string()))?;
        shared.atr_ref = Some(atr_ref);
        shared.atr = Some(atr.clone());
        Ok(atr)
    }

    /// Stage a new document
    pub async fn insert<T: Serialize + ?Sized>(
        &self,
        collection: &Arc<dyn Collection>,
        id: &str,
        content: &T,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let result = match to_content(content) {
            Ok(content) => self.insert_inner(collection, id, content).await,
            Err(e) => Err(e),
        };
        self.record(result)
    }

    async fn insert_inner(
        &self,
        collection: &Arc<dyn Collection>,
        id: &str,
        content: Value,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        self.check_can_operate()?;
        let existing = self.staged_for(collection, id);
        if existing.as_ref().is_some_and(|m| m.kind != StagedKind::Remove) {
            return Err(TransactionOperationFailed::new(
                ErrorClass::FailDocAlreadyExists,
                FailureCause::DocumentExists,
            ));
        }

        let atr = self.ensure_pending(collection, id).await?;
        match existing {
            // Inserting over our own staged remove becomes a replace.
            Some(removed) => {
                let target = Target { collection, id, cas: removed.cas, is_deleted: false };
                self.stage_mutation(&atr, target, StagedKind::Replace, Some(content)).await
            }
            None => self.stage_insert(&atr, collection, id, content, None).await,
        }
    }

    async fn stage_insert(
        &self,
        atr: &AtrRepository,
        collection: &Arc<dyn Collection>,
        id: &str,
        content: Value,
        mut cas: Option<u64>,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let xattrs = self.xattrs(atr, StagedKind::Insert, Some(content.clone()), None);
        let mut repeats = 0;
        loop {
            let (class, cause) = if self.has_expired() {
                (ErrorClass::FailExpiry, FailureCause::AttemptExpired)
            } else {
                match self.inner.docs.stage_insert(collection.as_ref(), id, &xattrs, cas).await {
                    Ok(new_cas) => {
                        tracing::debug!(
                            attempt_id = %self.inner.attempt_id,
                            doc = %self.inner.redactor.user(id),
                            "Staged insert"
                        );
                        return Ok(self.track(collection, id, StagedKind::Insert, Some(content), new_cas));
                    }
                    Err(e) => (ErrorClass::classify(&e), e.into()),
                }
            };
            match triage::staged_insert(class, self.in_overtime()) {
                TriageDecision::Repeat => {
                    repeats += 1;
                    RepeatDelay::short().wait(repeats).await;
                }
                TriageDecision::Local(LocalAction::DocExists) => {
                    cas = Some(self.handle_doc_exists(collection, id).await?);
                }
                decision => return Err(fail(decision, class, cause)),
            }
        }
    }

    /// A staged insert found something at the id; decide whether to overwrite it
    async fn handle_doc_exists(&self, collection: &Arc<dyn Collection>, id: &str) -> Result<u64, TransactionOperationFailed> {
        let doc = match self.inner.docs.lookup(collection.as_ref(), id).await {
            Ok(Some(doc)) => doc,
            Ok(None) => {
                let class = ErrorClass::FailDocNotFound;
                return Err(fail(triage::doc_exists_on_staged_insert(class), class, FailureCause::DocumentNotFound));
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                return Err(fail(triage::doc_exists_on_staged_insert(class), class, e));
            }
        };

        match TransactionXattrs::from_document(&doc) {
            None if doc.is_deleted => Ok(doc.cas),
            Some(blocking) if doc.is_deleted && blocking.op.kind == StagedKind::Insert => {
                self.check_write_write(id, &blocking).await?;
                Ok(doc.cas)
            }
            _ => Err(TransactionOperationFailed::new(
                ErrorClass::FailDocAlreadyExists,
                FailureCause::DocumentExists,
            )),
        }
    }

    async fn stage_mutation(
        &self,
        atr: &AtrRepository,
        target: Target<'_>,
        kind: StagedKind,
        content: Option<Value>,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        if self.has_expired() {
            let class = ErrorClass::FailExpiry;
            return Err(fail(triage::staged_replace_or_remove(class), class, FailureCause::AttemptExpired));
        }
        let xattrs = self.xattrs(atr, kind, content.clone(), Some(target.cas));
        match self
            .inner
            .docs
            .stage_mutation(target.collection.as_ref(), target.id, target.cas, &xattrs, target.is_deleted)
            .await
        {
            Ok(cas) => {
                tracing::debug!(
                    attempt_id = %self.inner.attempt_id,
                    doc = %self.inner.redactor.user(target.id),
                    kind = ?kind,
                    "Staged mutation"
                );
                Ok(self.track(target.collection, target.id, kind, content, cas))
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                Err(fail(triage::staged_replace_or_remove(class), class, e))
            }
        }
    }

    /// Stage new content for a document read in this attempt
    pub async fn replace<T: Serialize + ?Sized>(
        &self,
        doc: &TransactionGetResult,
        content: &T,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        let result = match to_content(content) {
            Ok(content) => self.replace_inner(doc, content).await,
            Err(e) => Err(e),
        };
        self.record(result)
    }

    async fn replace_inner(
        &self,
        doc: &TransactionGetResult,
        content: Value,
    ) -> Result<TransactionGetResult, TransactionOperationFailed> {
        self.check_can_operate()?;
        let collection = &doc.collection;
        let id = doc.id();
        let existing = self.staged_for(collection, id);
        if existing.as_ref().is_some_and(|m| m.kind == StagedKind::Remove) {
            return Err(TransactionOperationFailed::new(
                ErrorClass::FailDocNotFound,
                FailureCause::DocumentNotFound,
            ));
        }

        let atr = self.ensure_pending(collection, id).await?;
        match existing {
            Some(own) if own.kind == StagedKind::Insert => {
                self.stage_insert(&atr, collection, id, content, Some(own.cas)).await
            }
            Some(own) => {
                let target = Target { collection, id, cas: own.cas, is_deleted: false };
                self.stage_mutation(&atr, target, StagedKind::Replace, Some(content)).await
            }
            None => {
                if let Some(blocking) = &doc.txn {
                    self.check_write_write(id, blocking).await?;
                }
                let target = Target { collection, id, cas: doc.cas, is_deleted: doc.is_deleted };
                self.stage_mutation(&atr, target, StagedKind::Replace, Some(content)).await
            }
        }
    }

    /// Stage the removal of a document read in this attempt
    pub async fn remove(&self, doc: &TransactionGetResult) -> Result<(), TransactionOperationFailed> {
        let result = self.remove_inner(doc).await;
        self.record(result)
    }

    async fn remove_inner(&self, doc: &TransactionGetResult) -> Result<(), TransactionOperationFailed> {
        self.check_can_operate()?;
        let collection = &doc.collection;
        let id = doc.id();
        let existing = self.staged_for(collection, id);
        match existing {
            Some(own) if own.kind == StagedKind::Remove => Err(TransactionOperationFailed::new(
                ErrorClass::FailDocNotFound,
                FailureCause::DocumentNotFound,
            )),
            Some(own) if own.kind == StagedKind::Insert => self.remove_staged_insert(&own).await,
            Some(own) => {
                let atr = self.ensure_pending(collection, id).await?;
                let target = Target { collection, id, cas: own.cas, is_deleted: false };
                self.stage_mutation(&atr, target, StagedKind::Remove, None).await.map(|_| ())
            }
            None => {
                let atr = self.ensure_pending(collection, id).await?;
                if let Some(blocking) = &doc.txn {
                    self.check_write_write(id, blocking).await?;
                }
                let target = Target { collection, id, cas: doc.cas, is_deleted: doc.is_deleted };
                self.stage_mutation(&atr, target, StagedKind::Remove, None).await.map(|_| ())
            }
        }
    }

    /// Removing a document this attempt inserted drops the staged insert entirely
    async fn remove_staged_insert(&self, own: &StagedMutation) -> Result<(), TransactionOperationFailed> {
        if self.has_expired() {
            let class = ErrorClass::FailExpiry;
            return Err(fail(triage::staged_replace_or_remove(class), class, FailureCause::AttemptExpired));
        }
        match self.inner.docs.clear_metadata(own.collection.as_ref(), &own.id, own.cas, true).await {
            Ok(_) => {
                self.shared().staged.remove(own.collection.keyspace(), &own.id);
                Ok(())
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                Err(fail(triage::staged_replace_or_remove(class), class, e))
            }
        }
    }

    // === Commit ===

    /// Commit every staged mutation
    pub async fn commit(&self) -> Result<(), TransactionOperationFailed> {
        let result = self.commit_inner().await;
        self.record(result)
    }

    async fn commit_inner(&self) -> Result<(), TransactionOperationFailed> {
        let (atr, mutations, (inserted, replaced, removed)) = {
            let mut shared = self.shared();
            if !matches!(shared.state, AttemptState::NotStarted | AttemptState::Staging) {
                return Err(TransactionOperationFailed::illegal_state(format!(
                    "commit of an attempt that is {}",
                    shared.state.name()
                )));
            }
            if let Some(e) = combine_previous_errors(&shared.errors) {
                return Err(e);
            }
            if self.inner.txn.has_expired() {
                return Err(expired());
            }
            shared.state = AttemptState::Committing;
            (shared.atr.clone(), shared.staged.to_vec(), shared.staged.records())
        };

        let Some(atr) = atr else {
            self.set_state(AttemptState::Completed);
            return Ok(());
        };

        self.set_atr_committed(&atr, &inserted, &replaced, &removed).await?;
        self.set_state(AttemptState::Committed);
        tracing::debug!(
            txn_id = %self.inner.txn.transaction_id,
            attempt_id = %self.inner.attempt_id,
            mutations = mutations.len(),
            "Commit point reached"
        );

        for mutation in &mutations {
            match mutation.kind {
                StagedKind::Remove => self.unstage_remove(mutation).await?,
                StagedKind::Insert | StagedKind::Replace => self.unstage_insert_or_replace(mutation).await?,
            }
        }

        self.set_atr_completed(&atr).await?;
        self.set_state(AttemptState::Completed);
        Ok(())
    }

    async fn set_atr_committed(
        &self,
        atr: &AtrRepository,
        inserted: &[DocRecord],
        replaced: &[DocRecord],
        removed: &[DocRecord],
    ) -> Result<(), TransactionOperationFailed> {
        let mut ambiguity_resolution = false;
        let mut repeats = 0;
        loop {
            let (class, cause) = if self.has_expired() {
                (ErrorClass::FailExpiry, FailureCause::AttemptExpired)
            } else {
                match atr.set_committed(inserted, replaced, removed).await {
                    Ok(_) => return Ok(()),
                    Err(e) => (ErrorClass::classify(&e), e.into()),
                }
            };
            match triage::set_atr_commit(class, ambiguity_resolution) {
                TriageDecision::Repeat => {}
                TriageDecision::Local(LocalAction::EnterAmbiguityResolution) => {
                    tracing::debug!(attempt_id = %self.inner.attempt_id, "Commit write ambiguous, resolving");
                    ambiguity_resolution = true;
                }
                TriageDecision::Local(LocalAction::ResolveAmbiguity) => {
                    return self.resolve_commit_ambiguity(atr).await;
                }
                decision => return Err(fail(decision, class, cause)),
            }
            repeats += 1;
            RepeatDelay::backoff().wait(repeats).await;
        }
    }

    /// The pending sentinel was already present: read back what the entry says
    async fn resolve_commit_ambiguity(&self, atr: &AtrRepository) -> Result<(), TransactionOperationFailed> {
        let mut repeats = 0;
        loop {
            let (class, cause) = if self.has_expired() {
                (ErrorClass::FailExpiry, FailureCause::AttemptExpired)
            } else {
                match atr.lookup_own_entry().await {
                    Ok(Some(entry)) => {
                        return match entry.state {
                            AtrState::Committed | AtrState::Completed => Ok(()),
                            AtrState::Aborted => Err(TransactionOperationFailed::new(
                                ErrorClass::FailOther,
                                FailureCause::IllegalState("entry aborted while resolving commit".into()),
                            )
                            .retry()),
                            other => Err(TransactionOperationFailed::new(
                                ErrorClass::FailOther,
                                FailureCause::IllegalState(format!("entry is {other} while resolving commit").into()),
                            )
                            .no_rollback()
                            .raise(FinalError::TransactionCommitAmbiguous)),
                        };
                    }
                    Ok(None) => {
                        return Err(TransactionOperationFailed::new(
                            ErrorClass::FailPathNotFound,
                            FailureCause::ActiveTransactionRecordEntryNotFound,
                        )
                        .no_rollback()
                        .raise(FinalError::TransactionCommitAmbiguous));
                    }
                    Err(e) => {
                        let class = ErrorClass::classify(&e);
                        let cause = match class {
                            ErrorClass::FailDocNotFound => FailureCause::ActiveTransactionRecordNotFound,
                            ErrorClass::FailPathNotFound => FailureCause::ActiveTransactionRecordEntryNotFound,
                            _ => e.into(),
                        };
                        (class, cause)
                    }
                }
            };
            if !matches!(class, ErrorClass::FailTransient | ErrorClass::FailOther) {
                return Err(TransactionOperationFailed::new(class, cause)
                    .no_rollback()
                    .raise(FinalError::TransactionCommitAmbiguous));
            }
            repeats += 1;
            RepeatDelay::backoff().wait(repeats).await;
        }
    }

    async fn unstage_insert_or_replace(&self, mutation: &StagedMutation) -> Result<(), TransactionOperationFailed> {
        let content = mutation.content.clone().unwrap_or(Value::Null);
        let mut cas = mutation.cas;
        let mut insert_mode = mutation.kind == StagedKind::Insert;
        // Set once an earlier write may have landed without us seeing it
        let mut ambiguity_resolution = false;
        let mut repeats = 0;
        loop {
            self.enter_overtime_if_expired();
            let (class, cause): (ErrorClass, FailureCause) = match self
                .inner
                .docs
                .unstage_insert_or_replace(mutation.collection.as_ref(), &mutation.id, cas, content.clone(), insert_mode)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => (ErrorClass::classify(&e), e.into()),
            };
            match triage::unstage_insert_or_replace(class, self.in_overtime()) {
                TriageDecision::Repeat => ambiguity_resolution |= class == ErrorClass::FailAmbiguous,
                TriageDecision::Local(LocalAction::DocChangedDuringCommit) => {
                    ambiguity_resolution = true;
                    cas = 0;
                }
                TriageDecision::Local(LocalAction::InsertMode) => insert_mode = true,
                TriageDecision::Local(LocalAction::DocExists) if ambiguity_resolution || !insert_mode => {
                    return Ok(())
                }
                TriageDecision::Local(LocalAction::DocExists) => {
                    tracing::debug!(
                        attempt_id = %self.inner.attempt_id,
                        doc = %self.inner.redactor.user(&*mutation.id),
                        "Staged insert overwritten before commit, replacing"
                    );
                    insert_mode = false;
                    cas = 0;
                }
                decision => return Err(fail(decision, class, cause)),
            }
            repeats += 1;
            RepeatDelay::backoff().wait(repeats).await;
        }
    }

    async fn unstage_remove(&self, mutation: &StagedMutation) -> Result<(), TransactionOperationFailed> {
        let mut repeats = 0;
        loop {
            self.enter_overtime_if_expired();
            let (class, cause): (ErrorClass, FailureCause) = match self
                .inner
                .docs
                .unstage_remove(mutation.collection.as_ref(), &mutation.id, mutation.cas)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) => (ErrorClass::classify(&e), e.into()),
            };
            match triage::unstage_remove(class, self.in_overtime()) {
                TriageDecision::Repeat => {}
                decision => return Err(fail(decision, class, cause)),
            }
            repeats += 1;
            RepeatDelay::backoff().wait(repeats).await;
        }
    }

    async fn set_atr_completed(&self, atr: &AtrRepository) -> Result<(), TransactionOperationFailed> {
        match atr.set_completed().await {
            Ok(_) => Ok(()),
            Err(e) => {
                let class = ErrorClass::classify(&e);
                match triage::set_atr_complete(class) {
                    TriageDecision::TreatAsSuccess => {
                        tracing::debug!(attempt_id = %self.inner.attempt_id, error = %e, "Leaving COMPLETED to cleanup");
                        Ok(())
                    }
                    decision => Err(fail(decision, class, e)),
                }
            }
        }
    }

    // === Rollback ===

    /// Revert every staged mutation
    pub async fn rollback(&self) -> Result<(), TransactionOperationFailed> {
        let (atr, mutations, (inserted, replaced, removed)) = {
            let mut shared = self.shared();
            if !matches!(
                shared.state,
                AttemptState::NotStarted | AttemptState::Staging | AttemptState::Committing
            ) {
                return Err(TransactionOperationFailed::illegal_state(format!(
                    "rollback of an attempt that is {}",
                    shared.state.name()
                )));
            }
            shared.state = AttemptState::RollingBack;
            (shared.atr.clone(), shared.staged.to_vec(), shared.staged.records())
        };
        self.enter_overtime_if_expired();

        let Some(atr) = atr else {
            self.set_state(AttemptState::RolledBack);
            return Ok(());
        };

        self.set_atr_aborted(&atr, &inserted, &replaced, &removed).await?;
        for mutation in &mutations {
            self.rollback_mutation(mutation).await?;
        }
        self.set_atr_rolled_back(&atr).await?;
        self.set_state(AttemptState::RolledBack);
        tracing::debug!(
            txn_id = %self.inner.txn.transaction_id,
            attempt_id = %self.inner.attempt_id,
            "Attempt rolled back"
        );
        Ok(())
    }

    async fn set_atr_aborted(
        &self,
        atr: &AtrRepository,
        inserted: &[DocRecord],
        replaced: &[DocRecord],
        removed: &[DocRecord],
    ) -> Result<(), TransactionOperationFailed> {
        let mut repeats = 0;
        loop {
            self.enter_overtime_if_expired();
            match atr.set_aborted(inserted, replaced, removed).await {
                Ok(_) => return Ok(()),
                Err(_) if self.in_overtime() => return Err(expired().no_rollback()),
                Err(e) => {
                    let class = ErrorClass::classify(&e);
                    match triage::set_atr_aborted(class) {
                        TriageDecision::TreatAsSuccess => return Ok(()),
                        TriageDecision::Repeat => {}
                        TriageDecision::Local(LocalAction::EnterOvertime) => self.shared().overtime = true,
                        decision => return Err(fail(decision, class, e)),
                    }
                }
            }
            repeats += 1;
            RepeatDelay::short().wait(repeats).await;
        }
    }

    async fn rollback_mutation(&self, mutation: &StagedMutation) -> Result<(), TransactionOperationFailed> {
        let is_insert = mutation.kind == StagedKind::Insert;
        let table: fn(ErrorClass) -> TriageDecision = if is_insert {
            triage::rollback_staged_insert
        } else {
            triage::rollback_staged_replace_or_remove
        };
        let mut repeats = 0;
        loop {
            self.enter_overtime_if_expired();
            match self
                .inner
                .docs
                .clear_metadata(mutation.collection.as_ref(), &mutation.id, mutation.cas, is_insert)
                .await
            {
                Ok(_) => return Ok(()),
                Err(_) if self.in_overtime() => return Err(expired().no_rollback()),
                Err(e) => {
                    let class = ErrorClass::classify(&e);
                    match table(class) {
                        TriageDecision::TreatAsSuccess => return Ok(()),
                        TriageDecision::Repeat => {}
                        TriageDecision::Local(LocalAction::EnterOvertime) => self.shared().overtime = true,
                        decision => return Err(fail(decision, class, e)),
                    }
                }
            }
            repeats += 1;
            RepeatDelay::short().wait(repeats).await;
        }
    }

    async fn set_atr_rolled_back(&self, atr: &AtrRepository) -> Result<(), TransactionOperationFailed> {
        let mut repeats = 0;
        loop {
            self.enter_overtime_if_expired();
            let (class, cause): (ErrorClass, FailureCause) = match atr.set_rolled_back().await {
                Ok(_) => return Ok(()),
                Err(_) if self.in_overtime() => return Err(expired().no_rollback()),
                Err(e) => (ErrorClass::classify(&e), e.into()),
            };
            match triage::set_atr_rolled_back(class) {
                TriageDecision::TreatAsSuccess => return Ok(()),
                TriageDecision::Repeat => {}
                decision => return Err(fail(decision, class, cause)),
            }
            repeats += 1;
            RepeatDelay::short().wait(repeats).await;
        }
    }

    // === Run loop hooks ===

    /// Commit unless the application already finished the attempt
    pub(crate) async fn finish(&self) -> Result<(), TransactionOperationFailed> {
        let (state, last_error) = {
            let shared = self.shared();
            (shared.state, shared.errors.last().cloned())
        };
        match state {
            AttemptState::NotStarted | AttemptState::Staging => self.commit().await,
            AttemptState::Completed | AttemptState::RolledBack => Ok(()),
            other => Err(last_error.unwrap_or_else(|| {
                TransactionOperationFailed::illegal_state(format!("attempt left {}", other.name()))
            })),
        }
    }

    /// Roll back unless the commit point was passed or the attempt already ended
    pub(crate) async fn rollback_if_open(&self) -> Result<(), TransactionOperationFailed> {
        match self.state() {
            AttemptState::NotStarted | AttemptState::Staging | AttemptState::Committing => self.rollback().await,
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for AttemptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared();
        f.debug_struct("AttemptContext")
            .field("transaction_id", &self.inner.txn.transaction_id)
            .field("attempt_id", &self.inner.attempt_id)
            .field("state", &shared.state)
            .field("staged", &shared.staged.len())
            .finish()
    }
}
