//! Staged mutations tracked by one attempt

use std::sync::Arc;

use serde_json::Value;

use crate::atr::DocRecord;
use crate::document::StagedKind;
use crate::store::{Collection, Keyspace};

/// A pending change, owned by the attempt that staged it
#[derive(Clone)]
pub struct StagedMutation {
    /// Document id
    pub id: Box<str>,
    /// Collection holding the document
    pub collection: Arc<dyn Collection>,
    /// Operation kind
    pub kind: StagedKind,
    /// Staged body, absent for removes
    pub content: Option<Value>,
    /// CAS after staging
    pub cas: u64,
}

impl StagedMutation {
    /// Reference used in ATR entries
    pub fn record(&self) -> DocRecord {
        DocRecord::new(self.collection.keyspace(), &self.id)
    }

    fn matches(&self, keyspace: &Keyspace, id: &str) -> bool {
        self.id.as_ref() == id && self.collection.keyspace() == keyspace
    }
}

impl std::fmt::Debug for StagedMutation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedMutation")
            .field("keyspace", self.collection.keyspace())
            .field("kind", &self.kind)
            .field("cas", &self.cas)
            .finish()
    }
}

/// At most one staged mutation per document, in staging order
#[derive(Default, Debug)]
pub struct StagedMutations {
    mutations: Vec<StagedMutation>,
}

impl StagedMutations {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutation staged for `id` in `keyspace`
    pub fn find(&self, keyspace: &Keyspace, id: &str) -> Option<&StagedMutation> {
        self.mutations.iter().find(|m| m.matches(keyspace, id))
    }

    /// Track `mutation`, replacing any earlier mutation of the same document in place
    pub fn add(&mut self, mutation: StagedMutation) {
        let keyspace = mutation.collection.keyspace().clone();
        match self.mutations.iter_mut().find(|m| m.matches(&keyspace, &mutation.id)) {
            Some(existing) => *existing = mutation,
            None => self.mutations.push(mutation),
        }
    }

    /// Stop tracking a document
    pub fn remove(&mut self, keyspace: &Keyspace, id: &str) -> Option<StagedMutation> {
        let index = self.mutations.iter().position(|m| m.matches(keyspace, id))?;
        Some(self.mutations.remove(index))
    }

    /// Number of tracked documents
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Whether nothing is staged
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Snapshot in staging order
    pub fn to_vec(&self) -> Vec<StagedMutation> {
        self.mutations.clone()
    }

    /// ATR lists: (inserted, replaced, removed)
    pub fn records(&self) -> (Vec<DocRecord>, Vec<DocRecord>, Vec<DocRecord>) {
        let of = |kind: StagedKind| -> Vec<DocRecord> {
            self.mutations.iter().filter(|m| m.kind == kind).map(StagedMutation::record).collect()
        };
        (of(StagedKind::Insert), of(StagedKind::Replace), of(StagedKind::Remove))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCollection;
    use serde_json::json;

    fn mutation(coll: &Arc<dyn Collection>, id: &str, kind: StagedKind, cas: u64) -> StagedMutation {
        StagedMutation { id: id.into(), collection: coll.clone(), kind, content: Some(json!({"cas": cas})), cas }
    }

    #[test]
    fn test_restaging_updates_in_place() {
        let coll: Arc<dyn Collection> = Arc::new(InMemoryCollection::new(Keyspace::default_collection("b")));
        let mut staged = StagedMutations::new();
        staged.add(mutation(&coll, "a", StagedKind::Insert, 1));
        staged.add(mutation(&coll, "b", StagedKind::Replace, 2));
        staged.add(mutation(&coll, "a", StagedKind::Insert, 3));

        assert_eq!(staged.len(), 2);
        let a = staged.find(coll.keyspace(), "a").unwrap();
        assert_eq!(a.cas, 3);
        assert_eq!(staged.to_vec()[0].id.as_ref(), "a");
    }

    #[test]
    fn test_same_id_in_two_collections() {
        let one: Arc<dyn Collection> = Arc::new(InMemoryCollection::new(Keyspace::new("b", "s", "one")));
        let two: Arc<dyn Collection> = Arc::new(InMemoryCollection::new(Keyspace::new("b", "s", "two")));
        let mut staged = StagedMutations::new();
        staged.add(mutation(&one, "k", StagedKind::Insert, 1));
        staged.add(mutation(&two, "k", StagedKind::Remove, 2));
        assert_eq!(staged.len(), 2);

        let (ins, rep, rem) = staged.records();
        assert_eq!(ins.len(), 1);
        assert!(rep.is_empty());
        assert_eq!(rem[0].collection.as_ref(), "two");

        assert!(staged.remove(one.keyspace(), "k").is_some());
        assert!(staged.find(one.keyspace(), "k").is_none());
        assert!(staged.find(two.keyspace(), "k").is_some());
    }
}
