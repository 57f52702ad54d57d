//! Active Transaction Record data model
//!
//! An ATR is an ordinary document whose `attempts` xattr maps attempt ids to
//! [`AtrEntry`] values. Documents hash onto a fixed universe of ATR ids so
//! that every client agrees where an attempt's record lives.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::AtrState;
use crate::store::Keyspace;

/// Xattr holding the attempts map
pub const ATR_ATTEMPTS_FIELD: &str = "attempts";

/// Prefix of every transaction metadata document id
pub const TXN_DOC_PREFIX: &str = "_txn:";

/// Index of the ATR that `key` maps to
pub fn atr_index_for_key(key: &str, num_atrs: usize) -> usize {
    let crc = crc32fast::hash(key.as_bytes());
    (((crc >> 16) & 0x7fff) as usize) % num_atrs.max(1)
}

/// Document id of ATR `index`
pub fn atr_id(index: usize) -> Box<str> {
    format!("{TXN_DOC_PREFIX}atr-{index}").into()
}

/// Index back from an ATR document id
pub fn atr_index(id: &str) -> Option<usize> {
    id.strip_prefix(TXN_DOC_PREFIX)?.strip_prefix("atr-")?.parse().ok()
}

/// ATR document id for `key`
pub fn atr_id_for_key(key: &str, num_atrs: usize) -> Box<str> {
    atr_id(atr_index_for_key(key, num_atrs))
}

/// Location of one ATR document
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtrRef {
    /// Bucket
    #[serde(rename = "bkt")]
    pub bucket: Box<str>,
    /// Scope
    #[serde(rename = "scp")]
    pub scope: Box<str>,
    /// Collection
    #[serde(rename = "coll")]
    pub collection: Box<str>,
    /// ATR document id
    pub id: Box<str>,
}

impl AtrRef {
    /// ATR `id` in `keyspace`
    pub fn new(keyspace: &Keyspace, id: Box<str>) -> Self {
        Self {
            bucket: keyspace.bucket.clone(),
            scope: keyspace.scope.clone(),
            collection: keyspace.collection.clone(),
            id,
        }
    }

    /// Keyspace of the ATR document
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.bucket, &self.scope, &self.collection)
    }
}

impl std::fmt::Display for AtrRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}/{}", self.bucket, self.scope, self.collection, self.id)
    }
}

/// Reference to a staged document, as listed in an ATR entry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocRecord {
    /// Bucket
    #[serde(rename = "bkt")]
    pub bucket: Box<str>,
    /// Scope
    #[serde(rename = "scp")]
    pub scope: Box<str>,
    /// Collection
    #[serde(rename = "col")]
    pub collection: Box<str>,
    /// Document id
    pub id: Box<str>,
}

impl DocRecord {
    /// Reference to `id` in `keyspace`
    pub fn new(keyspace: &Keyspace, id: &str) -> Self {
        Self {
            bucket: keyspace.bucket.clone(),
            scope: keyspace.scope.clone(),
            collection: keyspace.collection.clone(),
            id: id.into(),
        }
    }

    /// Keyspace of the document
    pub fn keyspace(&self) -> Keyspace {
        Keyspace::new(&self.bucket, &self.scope, &self.collection)
    }
}

/// One attempt's row in an ATR document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AtrEntry {
    /// Owning transaction
    #[serde(rename = "tid", default)]
    pub transaction_id: Option<Box<str>>,
    /// Lifecycle state
    #[serde(rename = "st")]
    pub state: AtrState,
    /// Start (millis since UNIX epoch)
    #[serde(rename = "tst")]
    pub start_millis: u64,
    /// Expiry relative to start
    #[serde(rename = "exp")]
    pub expires_after_millis: u64,
    /// Staged inserts
    #[serde(rename = "ins", default)]
    pub inserted: Vec<DocRecord>,
    /// Staged replaces
    #[serde(rename = "rep", default)]
    pub replaced: Vec<DocRecord>,
    /// Staged removes
    #[serde(rename = "rem", default)]
    pub removed: Vec<DocRecord>,
    /// Durability short code
    #[serde(rename = "d", default, skip_serializing_if = "Option::is_none")]
    pub durability: Option<Box<str>>,
    /// Commit started
    #[serde(rename = "tsc", default, skip_serializing_if = "Option::is_none")]
    pub commit_millis: Option<u64>,
    /// Commit completed
    #[serde(rename = "tsco", default, skip_serializing_if = "Option::is_none")]
    pub complete_millis: Option<u64>,
    /// Rollback started
    #[serde(rename = "tsrs", default, skip_serializing_if = "Option::is_none")]
    pub rollback_start_millis: Option<u64>,
    /// Rollback completed
    #[serde(rename = "tsrc", default, skip_serializing_if = "Option::is_none")]
    pub rollback_complete_millis: Option<u64>,
    /// Sentinel written by the commit; present once the commit write landed
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub pending_sentinel: Option<u8>,
    /// Forward-compatibility markers
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    pub forward_compat: Option<Value>,
}

impl AtrEntry {
    /// Fresh PENDING entry
    pub fn pending(transaction_id: &str, start_millis: u64, expires_after_millis: u64, durability: &str) -> Self {
        Self {
            transaction_id: Some(transaction_id.into()),
            state: AtrState::Pending,
            start_millis,
            expires_after_millis,
            inserted: Vec::new(),
            replaced: Vec::new(),
            removed: Vec::new(),
            durability: Some(durability.into()),
            commit_millis: None,
            complete_millis: None,
            rollback_start_millis: None,
            rollback_complete_millis: None,
            pending_sentinel: None,
            forward_compat: None,
        }
    }

    /// Whether `start + expiresAfter < now`
    pub fn has_expired(&self, now_millis: u64) -> bool {
        self.start_millis.saturating_add(self.expires_after_millis) < now_millis
    }

    /// Every referenced document, inserts first
    pub fn documents(&self) -> impl Iterator<Item = &DocRecord> {
        self.inserted.iter().chain(self.replaced.iter()).chain(self.removed.iter())
    }
}

/// Parse the `attempts` xattr, skipping rows that do not parse
pub fn parse_attempts(attempts: &Value) -> Vec<(Box<str>, AtrEntry)> {
    let Some(map) = attempts.as_object() else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(attempt_id, raw)| match serde_json::from_value::<AtrEntry>(raw.clone()) {
            Ok(entry) => Some((attempt_id.as_str().into(), entry)),
            Err(e) => {
                tracing::warn!(attempt_id = %attempt_id, error = %e, "Skipping unparseable ATR entry");
                None
            }
        })
        .collect()
}
