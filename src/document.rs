//! Transactional view of documents and their staging metadata

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::atr::AtrRef;
use crate::errors::{ErrorClass, FailureCause, TransactionOperationFailed};
use crate::store::{Collection, Keyspace, StoredDocument};

/// Xattr holding a document's transaction metadata
pub const TXN_XATTR: &str = "txn";

/// Kind of a staged mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagedKind {
    /// New document, staged as a tombstone
    Insert,
    /// Replacement body
    Replace,
    /// Removal
    Remove,
}

/// Transaction and attempt owning a staged document
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeId {
    /// Transaction id
    #[serde(rename = "txn")]
    pub transaction_id: Box<str>,
    /// Attempt id
    #[serde(rename = "atmpt")]
    pub attempt_id: Box<str>,
}

/// Staged operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagedOperation {
    /// Kind
    #[serde(rename = "type")]
    pub kind: StagedKind,
    /// Staged body for inserts and replaces
    #[serde(rename = "stgd", default, skip_serializing_if = "Option::is_none")]
    pub staged: Option<Value>,
}

/// Pre-transaction document state, for forensic use by cleanup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreMetadata {
    /// CAS before staging
    #[serde(rename = "CAS")]
    pub cas: u64,
}

/// Everything written under the `txn` xattr of a staged document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionXattrs {
    /// Owner
    pub id: CompositeId,
    /// ATR holding the owner's entry
    pub atr: AtrRef,
    /// Staged operation
    pub op: StagedOperation,
    /// Pre-transaction metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore: Option<RestoreMetadata>,
    /// Forward-compatibility markers
    #[serde(rename = "fc", default, skip_serializing_if = "Option::is_none")]
    pub forward_compat: Option<Value>,
}

impl TransactionXattrs {
    /// Extract from a stored document, if present and well formed
    pub fn from_document(doc: &StoredDocument) -> Option<Self> {
        let raw = doc.xattr(TXN_XATTR)?;
        serde_json::from_value(raw.clone()).ok()
    }
}

/// A document as seen inside a transaction
#[derive(Clone)]
pub struct TransactionGetResult {
    pub(crate) id: Box<str>,
    pub(crate) collection: Arc<dyn Collection>,
    pub(crate) cas: u64,
    pub(crate) content: Option<Value>,
    pub(crate) txn: Option<TransactionXattrs>,
    pub(crate) is_deleted: bool,
}

impl TransactionGetResult {
    pub(crate) fn from_stored(id: &str, collection: Arc<dyn Collection>, doc: StoredDocument, content: Option<Value>) -> Self {
        let txn = TransactionXattrs::from_document(&doc);
        Self {
            id: id.into(),
            collection,
            cas: doc.cas,
            content,
            txn,
            is_deleted: doc.is_deleted,
        }
    }

    /// Document id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Keyspace of the document
    pub fn keyspace(&self) -> &Keyspace {
        self.collection.keyspace()
    }

    /// CAS observed by this read
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Raw content
    pub fn content(&self) -> Option<&Value> {
        self.content.as_ref()
    }

    /// Deserialize the content
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, TransactionOperationFailed> {
        let value = self.content.clone().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            TransactionOperationFailed::new(ErrorClass::FailOther, FailureCause::Application(e.to_string().into()))
        })
    }

    /// Transaction metadata present on the document when it was read
    pub fn transaction_xattrs(&self) -> Option<&TransactionXattrs> {
        self.txn.as_ref()
    }
}

impl std::fmt::Debug for TransactionGetResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionGetResult")
            .field("keyspace", self.keyspace())
            .field("cas", &self.cas)
            .field("in_transaction", &self.txn.is_some())
            .field("is_deleted", &self.is_deleted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_xattrs_wire_shape() {
        let xattrs = TransactionXattrs {
            id: CompositeId { transaction_id: "t1".into(), attempt_id: "a1".into() },
            atr: AtrRef::new(&Keyspace::default_collection("b"), "_txn:atr-3".into()),
            op: StagedOperation { kind: StagedKind::Replace, staged: Some(json!({"v": 2})) },
            restore: Some(RestoreMetadata { cas: 17 }),
            forward_compat: None,
        };
        let value = serde_json::to_value(&xattrs).unwrap();
        assert_eq!(value["id"]["atmpt"], json!("a1"));
        assert_eq!(value["atr"]["coll"], json!("_default"));
        assert_eq!(value["op"]["type"], json!("replace"));
        assert_eq!(value["restore"]["CAS"], json!(17));

        let doc = StoredDocument {
            body: Some(json!({"v": 1})),
            xattrs: json!({ "txn": value }),
            cas: 18,
            is_deleted: false,
        };
        assert_eq!(TransactionXattrs::from_document(&doc), Some(xattrs));
    }
}
