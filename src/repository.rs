//! Document, ATR and client-record repositories
//!
//! Thin adapters that translate transaction steps into collection calls.
//! They hold no protocol logic: store failures are returned unchanged for
//! triage, and the "nothing there" outcomes that callers treat as success are
//! returned as `Option`/`bool` rather than as errors.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::atr::{parse_attempts, AtrEntry, DocRecord, ATR_ATTEMPTS_FIELD};
use crate::client_record::{ClientEntry, ClientRecord, CLIENT_RECORD_FIELD, CLIENT_RECORD_ID};
use crate::config::DurabilityLevel;
use crate::context::now_millis;
use crate::document::{TransactionXattrs, TXN_XATTR};
use crate::state::AtrState;
use crate::store::{Collection, MutateOptions, MutateSpec, StoreError, StoredDocument};

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Other(e.to_string().into()))
}

/// Staging and unstaging of user documents
#[derive(Clone, Copy, Debug)]
pub struct DocumentRepository {
    durability: DurabilityLevel,
}

impl DocumentRepository {
    /// Repository writing at `durability`
    pub fn new(durability: DurabilityLevel) -> Self {
        Self { durability }
    }

    /// Body, xattrs and CAS, tombstones included. `None` if absent.
    pub async fn lookup(&self, collection: &dyn Collection, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        match collection.get(id, true).await {
            Ok(doc) => Ok(Some(doc)),
            Err(StoreError::DocumentNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stage an insert as a tombstone carrying the staged body.
    ///
    /// With `cas`, an existing tombstone is overwritten instead.
    pub async fn stage_insert(
        &self,
        collection: &dyn Collection,
        id: &str,
        xattrs: &TransactionXattrs,
        cas: Option<u64>,
    ) -> Result<u64, StoreError> {
        let options = match cas {
            Some(cas) => MutateOptions::replace(cas, self.durability),
            None => MutateOptions::insert(self.durability),
        }
        .access_deleted(true)
        .create_as_deleted(true);
        let specs = vec![MutateSpec::upsert_xattr(TXN_XATTR, to_value(xattrs)?)];
        collection.mutate_in(id, specs, options).await
    }

    /// Stage a replace or remove on an existing document
    pub async fn stage_mutation(
        &self,
        collection: &dyn Collection,
        id: &str,
        cas: u64,
        xattrs: &TransactionXattrs,
        access_deleted: bool,
    ) -> Result<u64, StoreError> {
        let options = MutateOptions::replace(cas, self.durability).access_deleted(access_deleted);
        let specs = vec![MutateSpec::upsert_xattr(TXN_XATTR, to_value(xattrs)?)];
        collection.mutate_in(id, specs, options).await
    }

    /// Drop staging metadata, leaving the body (or tombstone) as it was
    pub async fn clear_metadata(
        &self,
        collection: &dyn Collection,
        id: &str,
        cas: u64,
        is_deleted: bool,
    ) -> Result<u64, StoreError> {
        let options = MutateOptions::replace(cas, self.durability).access_deleted(is_deleted);
        let specs = vec![
            MutateSpec::upsert_xattr(TXN_XATTR, Value::Null),
            MutateSpec::remove_xattr(TXN_XATTR),
        ];
        collection.mutate_in(id, specs, options).await
    }

    /// Promote staged content to the document body and drop the metadata.
    ///
    /// In insert mode the document is created fresh.
    pub async fn unstage_insert_or_replace(
        &self,
        collection: &dyn Collection,
        id: &str,
        cas: u64,
        content: Value,
        insert_mode: bool,
    ) -> Result<u64, StoreError> {
        if insert_mode {
            return collection.insert(id, content, self.durability).await;
        }
        let options = MutateOptions::replace(cas, self.durability);
        let specs = vec![
            MutateSpec::upsert_xattr(TXN_XATTR, Value::Null),
            MutateSpec::remove_xattr(TXN_XATTR),
            MutateSpec::SetBody(content),
        ];
        collection.mutate_in(id, specs, options).await
    }

    /// Remove a document staged for removal
    pub async fn unstage_remove(&self, collection: &dyn Collection, id: &str, cas: u64) -> Result<(), StoreError> {
        collection.remove(id, cas, self.durability).await
    }
}

fn attempt_path(attempt_id: &str) -> String {
    format!("{ATR_ATTEMPTS_FIELD}.{attempt_id}")
}

/// Every entry of an ATR. `None` if the ATR document does not exist.
pub async fn lookup_attempts(
    collection: &dyn Collection,
    atr_id: &str,
) -> Result<Option<Vec<(Box<str>, AtrEntry)>>, StoreError> {
    match collection.get(atr_id, true).await {
        Ok(doc) => Ok(Some(doc.xattr(ATR_ATTEMPTS_FIELD).map(parse_attempts).unwrap_or_default())),
        Err(StoreError::DocumentNotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

/// One attempt's entry. `None` if the ATR or the entry does not exist.
pub async fn find_entry(
    collection: &dyn Collection,
    atr_id: &str,
    attempt_id: &str,
) -> Result<Option<AtrEntry>, StoreError> {
    let entries = lookup_attempts(collection, atr_id).await?.unwrap_or_default();
    Ok(entries
        .into_iter()
        .find(|(id, _)| id.as_ref() == attempt_id)
        .map(|(_, entry)| entry))
}

/// Remove an entry. `false` if it was already gone.
pub async fn remove_entry(
    collection: &dyn Collection,
    atr_id: &str,
    attempt_id: &str,
    durability: DurabilityLevel,
) -> Result<bool, StoreError> {
    let specs = vec![MutateSpec::remove_xattr(attempt_path(attempt_id))];
    match collection
        .mutate_in(atr_id, specs, MutateOptions::replace(0, durability).access_deleted(true))
        .await
    {
        Ok(_) => Ok(true),
        Err(StoreError::DocumentNotFound | StoreError::PathNotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Rounds lost to concurrent writes on other entries of the same ATR
const MAX_ATR_WRITE_TRIES: u32 = 8;

/// Apply `specs` to an entry moving it to `to`, refusing backward moves.
///
/// The entry's current state is read and the write is made under that read's
/// CAS, so no other writer can slip in between the check and the write. A CAS
/// mismatch here means another entry of the shared ATR changed; the read is
/// repeated. Rewriting the state the entry already holds is allowed, which
/// lets a repeated write after an ambiguous outcome reach the store.
pub async fn transition_entry(
    collection: &dyn Collection,
    atr_id: &str,
    attempt_id: &str,
    to: AtrState,
    specs: Vec<MutateSpec>,
    durability: DurabilityLevel,
) -> Result<u64, StoreError> {
    let root = attempt_path(attempt_id);
    let state_path = format!("{root}.st");
    for _ in 0..MAX_ATR_WRITE_TRIES {
        let doc = collection.get(atr_id, false).await?;
        let current = doc
            .xattr(&state_path)
            .and_then(|st| serde_json::from_value::<AtrState>(st.clone()).ok())
            .ok_or_else(|| StoreError::PathNotFound(root.as_str().into()))?;
        if current != to {
            current.transition(to)?;
        }
        match collection
            .mutate_in(atr_id, specs.clone(), MutateOptions::replace(doc.cas, durability))
            .await
        {
            Err(StoreError::CasMismatch) => continue,
            result => return result,
        }
    }
    Err(StoreError::CasMismatch)
}

/// Write a new state and its timestamp into any attempt's entry
pub async fn set_entry_state(
    collection: &dyn Collection,
    atr_id: &str,
    attempt_id: &str,
    state: AtrState,
    timestamp_field: &str,
    durability: DurabilityLevel,
) -> Result<u64, StoreError> {
    let root = attempt_path(attempt_id);
    let specs = vec![
        MutateSpec::replace_xattr(format!("{root}.st"), json!(state)),
        MutateSpec::upsert_xattr(format!("{root}.{timestamp_field}"), json!(now_millis())),
    ];
    transition_entry(collection, atr_id, attempt_id, state, specs, durability).await
}

/// One attempt's view of its ATR
#[derive(Clone)]
pub struct AtrRepository {
    collection: Arc<dyn Collection>,
    atr_id: Box<str>,
    attempt_id: Box<str>,
    durability: DurabilityLevel,
}

impl AtrRepository {
    /// Repository for `attempt_id`'s entry in `atr_id`
    pub fn new(collection: Arc<dyn Collection>, atr_id: Box<str>, attempt_id: Box<str>, durability: DurabilityLevel) -> Self {
        Self { collection, atr_id, attempt_id, durability }
    }

    /// ATR document id
    pub fn atr_id(&self) -> &str {
        &self.atr_id
    }

    /// Collection holding the ATR
    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    fn root(&self) -> String {
        attempt_path(&self.attempt_id)
    }

    async fn write(&self, specs: Vec<MutateSpec>, options: MutateOptions) -> Result<u64, StoreError> {
        self.collection.mutate_in(&self.atr_id, specs, options).await
    }

    async fn transition(&self, to: AtrState, specs: Vec<MutateSpec>) -> Result<u64, StoreError> {
        transition_entry(&*self.collection, &self.atr_id, &self.attempt_id, to, specs, self.durability).await
    }

    /// Create the entry in PENDING, creating the ATR document if needed
    pub async fn set_pending(&self, entry: &AtrEntry) -> Result<u64, StoreError> {
        let specs = vec![MutateSpec::insert_xattr(self.root(), to_value(entry)?)];
        self.write(specs, MutateOptions::upsert(self.durability)).await
    }

    /// Move to COMMITTED, recording the staged documents and the pending sentinel
    pub async fn set_committed(
        &self,
        inserted: &[DocRecord],
        replaced: &[DocRecord],
        removed: &[DocRecord],
    ) -> Result<u64, StoreError> {
        let root = self.root();
        let specs = vec![
            MutateSpec::replace_xattr(format!("{root}.st"), json!(AtrState::Committed)),
            MutateSpec::upsert_xattr(format!("{root}.tsc"), json!(now_millis())),
            MutateSpec::upsert_xattr(format!("{root}.ins"), to_value(&inserted)?),
            MutateSpec::upsert_xattr(format!("{root}.rep"), to_value(&replaced)?),
            MutateSpec::upsert_xattr(format!("{root}.rem"), to_value(&removed)?),
            MutateSpec::insert_xattr(format!("{root}.p"), json!(0)),
        ];
        self.transition(AtrState::Committed, specs).await
    }

    /// Move to COMPLETED
    pub async fn set_completed(&self) -> Result<u64, StoreError> {
        set_entry_state(&*self.collection, &self.atr_id, &self.attempt_id, AtrState::Completed, "tsco", self.durability)
            .await
    }

    /// Move to ABORTED, recording the staged documents
    pub async fn set_aborted(
        &self,
        inserted: &[DocRecord],
        replaced: &[DocRecord],
        removed: &[DocRecord],
    ) -> Result<u64, StoreError> {
        let root = self.root();
        let specs = vec![
            MutateSpec::replace_xattr(format!("{root}.st"), json!(AtrState::Aborted)),
            MutateSpec::upsert_xattr(format!("{root}.tsrs"), json!(now_millis())),
            MutateSpec::upsert_xattr(format!("{root}.ins"), to_value(&inserted)?),
            MutateSpec::upsert_xattr(format!("{root}.rep"), to_value(&replaced)?),
            MutateSpec::upsert_xattr(format!("{root}.rem"), to_value(&removed)?),
        ];
        self.transition(AtrState::Aborted, specs).await
    }

    /// Move to ROLLED_BACK
    pub async fn set_rolled_back(&self) -> Result<u64, StoreError> {
        set_entry_state(&*self.collection, &self.atr_id, &self.attempt_id, AtrState::RolledBack, "tsrc", self.durability)
            .await
    }

    /// Read back this attempt's entry
    pub async fn lookup_own_entry(&self) -> Result<Option<AtrEntry>, StoreError> {
        find_entry(&*self.collection, &self.atr_id, &self.attempt_id).await
    }
}

/// Client record reads and writes for one collection
#[derive(Clone)]
pub struct ClientRecordRepository {
    collection: Arc<dyn Collection>,
    durability: DurabilityLevel,
}

impl ClientRecordRepository {
    /// Repository for the record in `collection`
    pub fn new(collection: Arc<dyn Collection>, durability: DurabilityLevel) -> Self {
        Self { collection, durability }
    }

    /// Collection holding the record
    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.collection
    }

    /// Record and CAS. `None` if the record does not exist yet.
    pub async fn get(&self) -> Result<Option<(ClientRecord, u64)>, StoreError> {
        let doc = match self.collection.get(CLIENT_RECORD_ID, true).await {
            Ok(doc) => doc,
            Err(StoreError::DocumentNotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        let record = match doc.xattr(CLIENT_RECORD_FIELD) {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| StoreError::Other(e.to_string().into()))?,
            None => ClientRecord::default(),
        };
        Ok(Some((record, doc.cas)))
    }

    /// Create an empty record. `false` if another client got there first.
    pub async fn create_placeholder(&self) -> Result<bool, StoreError> {
        let specs = vec![
            MutateSpec::insert_xattr(format!("{CLIENT_RECORD_FIELD}.clients"), json!({})),
            MutateSpec::SetBody(json!({})),
        ];
        match self
            .collection
            .mutate_in(CLIENT_RECORD_ID, specs, MutateOptions::insert(self.durability))
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::DocumentExists) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write this client's heartbeat and prune `expired`, guarded by `cas`
    pub async fn update(
        &self,
        client_id: &str,
        entry: &ClientEntry,
        expired: &[String],
        cas: u64,
    ) -> Result<u64, StoreError> {
        let mut specs = vec![MutateSpec::upsert_xattr(
            format!("{CLIENT_RECORD_FIELD}.clients.{client_id}"),
            to_value(entry)?,
        )];
        specs.extend(
            expired
                .iter()
                .map(|id| MutateSpec::remove_xattr(format!("{CLIENT_RECORD_FIELD}.clients.{id}"))),
        );
        self.collection
            .mutate_in(CLIENT_RECORD_ID, specs, MutateOptions::replace(cas, self.durability))
            .await
    }

    /// Remove this client's row. `false` if it was already gone.
    pub async fn remove_client(&self, client_id: &str) -> Result<bool, StoreError> {
        let specs = vec![MutateSpec::remove_xattr(format!("{CLIENT_RECORD_FIELD}.clients.{client_id}"))];
        match self
            .collection
            .mutate_in(CLIENT_RECORD_ID, specs, MutateOptions::replace(0, self.durability))
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::DocumentNotFound | StoreError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atr::AtrRef;
    use crate::document::{CompositeId, StagedKind, StagedOperation};
    use crate::memory::InMemoryCollection;
    use crate::state::IllegalTransition;
    use crate::store::Keyspace;

    fn coll() -> Arc<dyn Collection> {
        Arc::new(InMemoryCollection::new(Keyspace::default_collection("b")))
    }

    fn xattrs(kind: StagedKind, staged: Option<Value>) -> TransactionXattrs {
        TransactionXattrs {
            id: CompositeId { transaction_id: "t".into(), attempt_id: "a".into() },
            atr: AtrRef::new(&Keyspace::default_collection("b"), "_txn:atr-1".into()),
            op: StagedOperation { kind, staged },
            restore: None,
            forward_compat: None,
        }
    }

    #[tokio::test]
    async fn test_staged_insert_lifecycle() {
        let c = coll();
        let repo = DocumentRepository::new(DurabilityLevel::None);
        let cas = repo
            .stage_insert(&*c, "k", &xattrs(StagedKind::Insert, Some(json!({"v": 1}))), None)
            .await
            .unwrap();

        // Invisible to plain reads, visible to the repository.
        assert_eq!(c.get("k", false).await.unwrap_err(), StoreError::DocumentNotFound);
        let staged = repo.lookup(&*c, "k").await.unwrap().unwrap();
        assert!(staged.is_deleted);
        assert_eq!(staged.cas, cas);

        repo.unstage_insert_or_replace(&*c, "k", cas, json!({"v": 1}), true).await.unwrap();
        let live = c.get("k", false).await.unwrap();
        assert_eq!(live.body, Some(json!({"v": 1})));
        assert!(live.xattr(TXN_XATTR).is_none());
    }

    #[tokio::test]
    async fn test_stage_and_clear_replace() {
        let c = coll();
        let repo = DocumentRepository::new(DurabilityLevel::None);
        let cas = c.insert("k", json!({"v": 1}), DurabilityLevel::None).await.unwrap();

        let staged_cas = repo
            .stage_mutation(&*c, "k", cas, &xattrs(StagedKind::Replace, Some(json!({"v": 2}))), false)
            .await
            .unwrap();
        assert_eq!(
            repo.stage_mutation(&*c, "k", cas, &xattrs(StagedKind::Replace, None), false).await.unwrap_err(),
            StoreError::CasMismatch
        );

        repo.clear_metadata(&*c, "k", staged_cas, false).await.unwrap();
        let doc = c.get("k", false).await.unwrap();
        assert_eq!(doc.body, Some(json!({"v": 1})));
        assert!(doc.xattr(TXN_XATTR).is_none());
    }

    #[tokio::test]
    async fn test_atr_entry_lifecycle() {
        let c = coll();
        let repo = AtrRepository::new(c.clone(), "_txn:atr-1".into(), "a1".into(), DurabilityLevel::None);
        let entry = AtrEntry::pending("t1", now_millis(), 15_000, "m");

        repo.set_pending(&entry).await.unwrap();
        assert!(matches!(repo.set_pending(&entry).await.unwrap_err(), StoreError::PathExists(_)));

        let ins = vec![DocRecord::new(c.keyspace(), "k")];
        repo.set_committed(&ins, &[], &[]).await.unwrap();
        // A repeated commit write trips the sentinel.
        assert!(matches!(repo.set_committed(&ins, &[], &[]).await.unwrap_err(), StoreError::PathExists(_)));

        repo.set_completed().await.unwrap();
        let stored = repo.lookup_own_entry().await.unwrap().unwrap();
        assert_eq!(stored.state, AtrState::Completed);
        assert_eq!(stored.inserted, ins);
        assert!(stored.complete_millis.is_some());

        assert!(remove_entry(&*c, "_txn:atr-1", "a1", DurabilityLevel::None).await.unwrap());
        assert!(!remove_entry(&*c, "_txn:atr-1", "a1", DurabilityLevel::None).await.unwrap());
        assert!(repo.lookup_own_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entry_never_moves_backwards() {
        let c = coll();
        let repo = AtrRepository::new(c.clone(), "_txn:atr-3".into(), "a1".into(), DurabilityLevel::None);
        repo.set_pending(&AtrEntry::pending("t1", now_millis(), 15_000, "m")).await.unwrap();
        repo.set_committed(&[], &[], &[]).await.unwrap();

        assert_eq!(
            repo.set_aborted(&[], &[], &[]).await.unwrap_err(),
            StoreError::IllegalTransition(IllegalTransition { from: "COMMITTED", to: "ABORTED" })
        );
        assert!(matches!(repo.set_rolled_back().await.unwrap_err(), StoreError::IllegalTransition(_)));
        assert_eq!(repo.lookup_own_entry().await.unwrap().unwrap().state, AtrState::Committed);

        repo.set_completed().await.unwrap();
        // Rewriting the state already held is accepted.
        repo.set_completed().await.unwrap();
        assert!(matches!(repo.set_committed(&[], &[], &[]).await.unwrap_err(), StoreError::IllegalTransition(_)));
        assert_eq!(repo.lookup_own_entry().await.unwrap().unwrap().state, AtrState::Completed);
    }

    #[tokio::test]
    async fn test_transition_survives_writes_to_other_entries() {
        let c = coll();
        let mine = AtrRepository::new(c.clone(), "_txn:atr-4".into(), "a1".into(), DurabilityLevel::None);
        let theirs = AtrRepository::new(c.clone(), "_txn:atr-4".into(), "a2".into(), DurabilityLevel::None);
        mine.set_pending(&AtrEntry::pending("t1", now_millis(), 15_000, "m")).await.unwrap();
        theirs.set_pending(&AtrEntry::pending("t2", now_millis(), 15_000, "m")).await.unwrap();

        theirs.set_aborted(&[], &[], &[]).await.unwrap();
        mine.set_committed(&[], &[], &[]).await.unwrap();
        theirs.set_rolled_back().await.unwrap();
        mine.set_completed().await.unwrap();

        assert_eq!(mine.lookup_own_entry().await.unwrap().unwrap().state, AtrState::Completed);
        assert_eq!(theirs.lookup_own_entry().await.unwrap().unwrap().state, AtrState::RolledBack);
    }

    #[tokio::test]
    async fn test_transition_of_missing_entry() {
        let c = coll();
        let repo = AtrRepository::new(c.clone(), "_txn:atr-2".into(), "a1".into(), DurabilityLevel::None);
        assert_eq!(repo.set_aborted(&[], &[], &[]).await.unwrap_err(), StoreError::DocumentNotFound);

        let other = AtrRepository::new(c.clone(), "_txn:atr-2".into(), "a2".into(), DurabilityLevel::None);
        other.set_pending(&AtrEntry::pending("t", 0, 1, "m")).await.unwrap();
        assert!(matches!(repo.set_aborted(&[], &[], &[]).await.unwrap_err(), StoreError::PathNotFound(_)));
        assert!(lookup_attempts(&*c, "_txn:atr-404").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_client_record_roundtrip() {
        let repo = ClientRecordRepository::new(coll(), DurabilityLevel::None);
        assert!(repo.get().await.unwrap().is_none());
        assert!(repo.create_placeholder().await.unwrap());
        assert!(!repo.create_placeholder().await.unwrap());

        let (record, cas) = repo.get().await.unwrap().unwrap();
        assert!(record.clients.is_empty());

        let entry = ClientEntry { heartbeat_ms: 1, expires_ms: 2, num_atrs: 4, atrs: vec![0, 1, 2, 3] };
        let new_cas = repo.update("c1", &entry, &[], cas).await.unwrap();
        assert_eq!(repo.update("c1", &entry, &[], cas).await.unwrap_err(), StoreError::CasMismatch);

        let (record, cas) = repo.get().await.unwrap().unwrap();
        assert_eq!(cas, new_cas);
        assert_eq!(record.clients["c1"], entry);

        assert!(repo.remove_client("c1").await.unwrap());
        assert!(!repo.remove_client("c1").await.unwrap());
    }
}
