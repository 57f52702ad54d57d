//! In-memory document store for testing
//!
//! Mirrors the behaviour the transaction core depends on: CAS on every
//! mutation, tombstones reachable through deleted access, xattr paths with
//! insert/upsert/remove semantics, and a maximum document size. Faults can be
//! injected per operation and key to drive error paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config::DurabilityLevel;
use crate::store::{
    Collection, CollectionResolver, Keyspace, MutateOptions, MutateSpec, StoreError, StoreSemantics,
    StoredDocument,
};

const DEFAULT_MAX_DOC_BYTES: usize = 20 * 1024 * 1024;

/// Operation kinds a fault can target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOp {
    /// [`Collection::get`]
    Get,
    /// [`Collection::insert`]
    Insert,
    /// [`Collection::mutate_in`]
    MutateIn,
    /// [`Collection::remove`]
    Remove,
    /// Every operation
    Any,
}

struct Fault {
    op: FaultOp,
    id: Box<str>,
    error: StoreError,
    remaining: Option<u32>,
}

#[derive(Clone)]
struct Entry {
    body: Option<Value>,
    xattrs: Value,
    cas: u64,
    deleted: bool,
}

impl Entry {
    fn to_document(&self) -> StoredDocument {
        StoredDocument {
            body: self.body.clone(),
            xattrs: self.xattrs.clone(),
            cas: self.cas,
            is_deleted: self.deleted,
        }
    }

    fn size(&self) -> usize {
        let body = self.body.as_ref().map(|b| b.to_string().len()).unwrap_or(0);
        body + self.xattrs.to_string().len()
    }
}

/// One in-memory collection
pub struct InMemoryCollection {
    keyspace: Keyspace,
    docs: RwLock<HashMap<Box<str>, Entry>>,
    faults: RwLock<Vec<Fault>>,
    cas_counter: Arc<AtomicU64>,
    max_doc_bytes: usize,
}

impl InMemoryCollection {
    /// Standalone collection with its own CAS sequence
    pub fn new(keyspace: Keyspace) -> Self {
        Self::with_counter(keyspace, Arc::new(AtomicU64::new(1)), DEFAULT_MAX_DOC_BYTES)
    }

    fn with_counter(keyspace: Keyspace, cas_counter: Arc<AtomicU64>, max_doc_bytes: usize) -> Self {
        Self {
            keyspace,
            docs: RwLock::new(HashMap::new()),
            faults: RwLock::new(Vec::new()),
            cas_counter,
            max_doc_bytes,
        }
    }

    /// Fail `op` on `id` with `error`, `times` times (forever when `None`)
    pub fn inject_fault(&self, op: FaultOp, id: &str, error: StoreError, times: Option<u32>) {
        if let Ok(mut faults) = self.faults.write() {
            faults.push(Fault { op, id: id.into(), error, remaining: times });
        }
    }

    /// Drop every injected fault
    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.write() {
            faults.clear();
        }
    }

    /// Read a document bypassing faults, tombstones included
    pub fn peek(&self, id: &str) -> Option<StoredDocument> {
        let docs = self.docs.read().ok()?;
        docs.get(id).map(Entry::to_document)
    }

    /// Non-transactional overwrite of the body, keeping xattrs
    pub fn write_raw(&self, id: &str, body: Value) -> Result<u64, StoreError> {
        let cas = self.next_cas();
        let mut docs = self.docs.write().map_err(|e| StoreError::Other(e.to_string().into()))?;
        let entry = docs.entry(id.into()).or_insert_with(|| Entry {
            body: None,
            xattrs: Value::Object(Map::new()),
            cas,
            deleted: false,
        });
        entry.body = Some(body);
        entry.deleted = false;
        entry.cas = cas;
        Ok(cas)
    }

    /// Number of stored entries, tombstones included
    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    /// Whether the collection holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn take_fault(&self, op: FaultOp, id: &str) -> Result<(), StoreError> {
        let mut faults = self.faults.write().map_err(|e| StoreError::Other(e.to_string().into()))?;
        let hit = faults
            .iter_mut()
            .position(|f| (f.op == op || f.op == FaultOp::Any) && f.id.as_ref() == id);
        let Some(index) = hit else {
            return Ok(());
        };

        let error = faults[index].error.clone();
        if let Some(remaining) = faults[index].remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                faults.remove(index);
            }
        }
        Err(error)
    }

    fn check_size(&self, entry: &Entry) -> Result<(), StoreError> {
        if entry.size() > self.max_doc_bytes {
            return Err(StoreError::ValueTooLarge);
        }
        Ok(())
    }
}

#[async_trait]
impl Collection for InMemoryCollection {
    fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    async fn get(&self, id: &str, access_deleted: bool) -> Result<StoredDocument, StoreError> {
        tokio::task::yield_now().await;
        self.take_fault(FaultOp::Get, id)?;

        let docs = self.docs.read().map_err(|e| StoreError::Other(e.to_string().into()))?;
        match docs.get(id) {
            Some(entry) if !entry.deleted || access_deleted => Ok(entry.to_document()),
            _ => Err(StoreError::DocumentNotFound),
        }
    }

    async fn insert(&self, id: &str, body: Value, _durability: DurabilityLevel) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        self.take_fault(FaultOp::Insert, id)?;

        let mut docs = self.docs.write().map_err(|e| StoreError::Other(e.to_string().into()))?;
        if docs.get(id).is_some_and(|e| !e.deleted) {
            return Err(StoreError::DocumentExists);
        }

        let entry = Entry {
            body: Some(body),
            xattrs: Value::Object(Map::new()),
            cas: self.next_cas(),
            deleted: false,
        };
        self.check_size(&entry)?;
        let cas = entry.cas;
        docs.insert(id.into(), entry);
        Ok(cas)
    }

    async fn mutate_in(&self, id: &str, specs: Vec<MutateSpec>, options: MutateOptions) -> Result<u64, StoreError> {
        tokio::task::yield_now().await;
        self.take_fault(FaultOp::MutateIn, id)?;

        let mut docs = self.docs.write().map_err(|e| StoreError::Other(e.to_string().into()))?;
        // Tombstones only count as present under deleted access.
        let visible = docs.get(id).filter(|e| !e.deleted || options.access_deleted).cloned();

        let mut working = match (options.semantics, visible) {
            (StoreSemantics::Insert, Some(_)) => return Err(StoreError::DocumentExists),
            (StoreSemantics::Replace, None) => return Err(StoreError::DocumentNotFound),
            (StoreSemantics::Replace | StoreSemantics::Upsert, Some(entry)) => {
                if options.cas != 0 && options.cas != entry.cas {
                    return Err(StoreError::CasMismatch);
                }
                entry
            }
            (StoreSemantics::Insert | StoreSemantics::Upsert, None) => {
                Entry {
                    body: if options.create_as_deleted { None } else { Some(Value::Object(Map::new())) },
                    xattrs: Value::Object(Map::new()),
                    cas: 0,
                    deleted: options.create_as_deleted,
                }
            }
        };

        for spec in specs {
            apply_spec(&mut working, spec)?;
        }

        working.cas = self.next_cas();
        self.check_size(&working)?;
        let cas = working.cas;
        docs.insert(id.into(), working);
        Ok(cas)
    }

    async fn remove(&self, id: &str, cas: u64, _durability: DurabilityLevel) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.take_fault(FaultOp::Remove, id)?;

        let mut docs = self.docs.write().map_err(|e| StoreError::Other(e.to_string().into()))?;
        match docs.get(id) {
            None => Err(StoreError::DocumentNotFound),
            Some(entry) if entry.deleted => Err(StoreError::DocumentNotFound),
            Some(entry) if cas != 0 && entry.cas != cas => Err(StoreError::CasMismatch),
            Some(_) => {
                docs.remove(id);
                Ok(())
            }
        }
    }
}

fn apply_spec(entry: &mut Entry, spec: MutateSpec) -> Result<(), StoreError> {
    match spec {
        MutateSpec::SetBody(value) => {
            entry.body = Some(value);
            entry.deleted = false;
            Ok(())
        }
        MutateSpec::Insert { path, value, xattr } => {
            let root = target(entry, xattr, &path)?;
            write_path(root, &path, value, false)
        }
        MutateSpec::Replace { path, value, xattr } => {
            let root = target(entry, xattr, &path)?;
            replace_path(root, &path, value)
        }
        MutateSpec::Upsert { path, value, xattr } => {
            let root = target(entry, xattr, &path)?;
            write_path(root, &path, value, true)
        }
        MutateSpec::Remove { path, xattr } => {
            let root = target(entry, xattr, &path)?;
            remove_path(root, &path)
        }
    }
}

fn target<'a>(entry: &'a mut Entry, xattr: bool, path: &str) -> Result<&'a mut Value, StoreError> {
    if xattr {
        return Ok(&mut entry.xattrs);
    }
    entry.body.as_mut().ok_or_else(|| StoreError::PathNotFound(path.into()))
}

fn write_path(root: &mut Value, path: &str, value: Value, overwrite: bool) -> Result<(), StoreError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().ok_or_else(|| StoreError::PathNotFound(path.into()))?;

    let mut node = root;
    for segment in segments {
        let map = node.as_object_mut().ok_or_else(|| StoreError::PathNotFound(path.into()))?;
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let map = node.as_object_mut().ok_or_else(|| StoreError::PathNotFound(path.into()))?;
    if !overwrite && map.contains_key(last) {
        return Err(StoreError::PathExists(path.into()));
    }
    map.insert(last.to_string(), value);
    Ok(())
}

fn replace_path(root: &mut Value, path: &str, value: Value) -> Result<(), StoreError> {
    let slot = path
        .split('.')
        .try_fold(root, |node, segment| node.get_mut(segment))
        .ok_or_else(|| StoreError::PathNotFound(path.into()))?;
    *slot = value;
    Ok(())
}

fn remove_path(root: &mut Value, path: &str) -> Result<(), StoreError> {
    let mut segments: Vec<&str> = path.split('.').collect();
    let last = segments.pop().ok_or_else(|| StoreError::PathNotFound(path.into()))?;

    let mut node = root;
    for segment in segments {
        node = node
            .get_mut(segment)
            .ok_or_else(|| StoreError::PathNotFound(path.into()))?;
    }

    node.as_object_mut()
        .and_then(|map| map.remove(last))
        .map(|_| ())
        .ok_or_else(|| StoreError::PathNotFound(path.into()))
}

/// A set of in-memory collections sharing one CAS sequence
pub struct InMemoryStore {
    collections: RwLock<HashMap<Keyspace, Arc<InMemoryCollection>>>,
    cas_counter: Arc<AtomicU64>,
    max_doc_bytes: usize,
}

impl InMemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::with_max_doc_bytes(DEFAULT_MAX_DOC_BYTES)
    }

    /// Empty store whose documents may not exceed `max_doc_bytes`
    pub fn with_max_doc_bytes(max_doc_bytes: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            cas_counter: Arc::new(AtomicU64::new(1)),
            max_doc_bytes,
        }
    }

    /// Typed handle to `keyspace`, created on first use
    pub fn in_memory(&self, keyspace: &Keyspace) -> Result<Arc<InMemoryCollection>, StoreError> {
        if let Some(existing) = self
            .collections
            .read()
            .map_err(|e| StoreError::Other(e.to_string().into()))?
            .get(keyspace)
        {
            return Ok(existing.clone());
        }

        let mut collections = self.collections.write().map_err(|e| StoreError::Other(e.to_string().into()))?;
        let collection = collections.entry(keyspace.clone()).or_insert_with(|| {
            Arc::new(InMemoryCollection::with_counter(
                keyspace.clone(),
                self.cas_counter.clone(),
                self.max_doc_bytes,
            ))
        });
        Ok(collection.clone())
    }
}

impl CollectionResolver for InMemoryStore {
    fn collection(&self, keyspace: &Keyspace) -> Result<Arc<dyn Collection>, StoreError> {
        let collection: Arc<dyn Collection> = self.in_memory(keyspace)?;
        Ok(collection)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
