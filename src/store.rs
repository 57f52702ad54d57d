//! Document collection capability consumed by the transaction core
//!
//! The core never talks to the wire protocol. Everything it needs from the
//! document store is expressed through [`Collection`]: whole-document reads,
//! inserts and removes, and sub-document mutations over the body or the
//! extended attributes (xattrs), each guarded by CAS.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DurabilityLevel;
use crate::state::IllegalTransition;

/// Name of the default scope and default collection.
pub const DEFAULT_NAME: &str = "_default";

/// Fully qualified location of a collection
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Keyspace {
    /// Bucket name
    pub bucket: Box<str>,
    /// Scope name
    pub scope: Box<str>,
    /// Collection name
    pub collection: Box<str>,
}

impl Keyspace {
    /// Create a keyspace
    pub fn new(bucket: &str, scope: &str, collection: &str) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
        }
    }

    /// The default collection of `bucket`
    pub fn default_collection(bucket: &str) -> Self {
        Self::new(bucket, DEFAULT_NAME, DEFAULT_NAME)
    }

    /// The default collection of this keyspace's bucket
    pub fn bucket_default(&self) -> Self {
        Self::default_collection(&self.bucket)
    }
}

impl std::fmt::Debug for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keyspace({self})")
    }
}

impl std::fmt::Display for Keyspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bucket, self.scope, self.collection)
    }
}

/// Failures surfaced by a collection
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Document does not exist (or is a tombstone and deleted access was not requested)
    #[error("document not found")]
    DocumentNotFound,
    /// Document already exists
    #[error("document exists")]
    DocumentExists,
    /// CAS supplied did not match the stored CAS
    #[error("CAS mismatch")]
    CasMismatch,
    /// Sub-document path does not exist
    #[error("path not found: {0}")]
    PathNotFound(Box<str>),
    /// Sub-document path already exists
    #[error("path exists: {0}")]
    PathExists(Box<str>),
    /// Document would exceed the maximum document size
    #[error("value too large")]
    ValueTooLarge,
    /// Operation timed out and may or may not have been applied
    #[error("ambiguous timeout")]
    AmbiguousTimeout,
    /// Operation timed out before it could have been applied
    #[error("unambiguous timeout")]
    UnambiguousTimeout,
    /// Server is temporarily unable to serve the request
    #[error("temporary failure")]
    TemporaryFailure,
    /// Durability requirement may or may not have been met
    #[error("durability ambiguous")]
    DurabilityAmbiguous,
    /// Request canceled in flight
    #[error("request canceled")]
    RequestCanceled,
    /// Server reported an internal failure
    #[error("internal server failure: {0}")]
    InternalServerFailure(Box<str>),
    /// Write refused because it would move an ATR entry backwards
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),
    /// Anything else
    #[error("store error: {0}")]
    Other(Box<str>),
}

/// A document as returned by [`Collection::get`]
#[derive(Clone, Debug, PartialEq)]
pub struct StoredDocument {
    /// Body, absent for tombstones
    pub body: Option<Value>,
    /// Extended attributes (always a JSON object)
    pub xattrs: Value,
    /// Current CAS
    pub cas: u64,
    /// Whether this is a tombstone
    pub is_deleted: bool,
}

impl StoredDocument {
    /// Read an xattr at a dotted path
    pub fn xattr(&self, path: &str) -> Option<&Value> {
        lookup_path(&self.xattrs, path)
    }
}

/// How a sub-document mutation treats the enclosing document
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreSemantics {
    /// Document must exist
    Replace,
    /// Create the document if missing
    Upsert,
    /// Document must not exist
    Insert,
}

/// One sub-document mutation
#[derive(Clone, Debug, PartialEq)]
pub enum MutateSpec {
    /// Insert at path, failing with `PathExists` if present. Parents are created.
    Insert {
        /// Dotted path
        path: Box<str>,
        /// Value to write
        value: Value,
        /// Whether the path is in the xattrs
        xattr: bool,
    },
    /// Overwrite an existing path, failing with `PathNotFound` if absent.
    Replace {
        /// Dotted path
        path: Box<str>,
        /// Value to write
        value: Value,
        /// Whether the path is in the xattrs
        xattr: bool,
    },
    /// Write at path, creating parents.
    Upsert {
        /// Dotted path
        path: Box<str>,
        /// Value to write
        value: Value,
        /// Whether the path is in the xattrs
        xattr: bool,
    },
    /// Remove path, failing with `PathNotFound` if absent.
    Remove {
        /// Dotted path
        path: Box<str>,
        /// Whether the path is in the xattrs
        xattr: bool,
    },
    /// Replace the whole body. Revives a tombstone.
    SetBody(Value),
}

impl MutateSpec {
    /// Xattr insert
    pub fn insert_xattr(path: impl Into<Box<str>>, value: Value) -> Self {
        Self::Insert { path: path.into(), value, xattr: true }
    }

    /// Xattr upsert
    pub fn upsert_xattr(path: impl Into<Box<str>>, value: Value) -> Self {
        Self::Upsert { path: path.into(), value, xattr: true }
    }

    /// Xattr replace of an existing path
    pub fn replace_xattr(path: impl Into<Box<str>>, value: Value) -> Self {
        Self::Replace { path: path.into(), value, xattr: true }
    }

    /// Xattr remove
    pub fn remove_xattr(path: impl Into<Box<str>>) -> Self {
        Self::Remove { path: path.into(), xattr: true }
    }
}

/// Options for [`Collection::mutate_in`]
#[derive(Clone, Debug)]
pub struct MutateOptions {
    /// Expected CAS, 0 for any
    pub cas: u64,
    /// Document-level semantics
    pub semantics: StoreSemantics,
    /// Allow operating on tombstones
    pub access_deleted: bool,
    /// Create the document as a tombstone when it does not exist
    pub create_as_deleted: bool,
    /// Durability requirement
    pub durability: DurabilityLevel,
}

impl MutateOptions {
    /// Replace semantics guarded by `cas`
    pub fn replace(cas: u64, durability: DurabilityLevel) -> Self {
        Self {
            cas,
            semantics: StoreSemantics::Replace,
            access_deleted: false,
            create_as_deleted: false,
            durability,
        }
    }

    /// Upsert semantics, no CAS
    pub fn upsert(durability: DurabilityLevel) -> Self {
        Self {
            semantics: StoreSemantics::Upsert,
            ..Self::replace(0, durability)
        }
    }

    /// Insert semantics
    pub fn insert(durability: DurabilityLevel) -> Self {
        Self {
            semantics: StoreSemantics::Insert,
            ..Self::replace(0, durability)
        }
    }

    /// Allow operating on tombstones
    pub fn access_deleted(mut self, value: bool) -> Self {
        self.access_deleted = value;
        self
    }

    /// Create as a tombstone
    pub fn create_as_deleted(mut self, value: bool) -> Self {
        self.create_as_deleted = value;
        self
    }
}

/// Narrow document collection capability.
///
/// Implementations must be safe for concurrent use. Every mutation is
/// CAS-guarded when a non-zero CAS is supplied; a mismatch is returned as
/// [`StoreError::CasMismatch`] and never retried here.
#[async_trait]
pub trait Collection: Send + Sync + 'static {
    /// Where this collection lives
    fn keyspace(&self) -> &Keyspace;

    /// Fetch body and xattrs
    async fn get(&self, id: &str, access_deleted: bool) -> Result<StoredDocument, StoreError>;

    /// Insert a new document (a tombstone may be overwritten)
    async fn insert(&self, id: &str, body: Value, durability: DurabilityLevel) -> Result<u64, StoreError>;

    /// Apply sub-document mutations atomically
    async fn mutate_in(&self, id: &str, specs: Vec<MutateSpec>, options: MutateOptions) -> Result<u64, StoreError>;

    /// Remove a document
    async fn remove(&self, id: &str, cas: u64, durability: DurabilityLevel) -> Result<(), StoreError>;
}

/// Resolves a keyspace to a collection handle
pub trait CollectionResolver: Send + Sync + 'static {
    /// Open `keyspace`
    fn collection(&self, keyspace: &Keyspace) -> Result<Arc<dyn Collection>, StoreError>;
}

/// Read a dotted path out of a JSON object
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| node.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keyspace_display() {
        let ks = Keyspace::new("travel", "inventory", "hotels");
        assert_eq!(ks.to_string(), "travel.inventory.hotels");
        assert_eq!(ks.bucket_default(), Keyspace::new("travel", "_default", "_default"));
    }

    #[test]
    fn test_lookup_path() {
        let doc = json!({"txn": {"id": {"atmpt": "a1"}}});
        assert_eq!(lookup_path(&doc, "txn.id.atmpt"), Some(&json!("a1")));
        assert_eq!(lookup_path(&doc, "txn.op"), None);
    }
}
