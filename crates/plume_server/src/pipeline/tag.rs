//! Ref-counted registry of receiver tags.
//!
//! A receiver tag is a channel's active subscriber set grouped by the slot
//! leader that owns each uid; delivery fans out one envelope per node. Tags
//! are shared (several channels can reference the same subscriber layout in
//! principle), so entries are ref-counted and reclaimed at zero.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use plume_replica::NodeId;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeUsers {
    pub node_id: NodeId,
    pub uids: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ReceiverTag {
    pub key: String,
    pub nodes: Vec<NodeUsers>,
}

struct TagEntry {
    tag: Arc<ReceiverTag>,
    refs: u32,
}

pub struct TagRegistry {
    inner: RwLock<HashMap<String, TagEntry>>,
}

impl TagRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
        })
    }

    /// Store a freshly materialized tag under a new key with one reference.
    pub fn insert(&self, nodes: Vec<NodeUsers>) -> Arc<ReceiverTag> {
        let key = Uuid::new_v4().to_string();
        let tag = Arc::new(ReceiverTag {
            key: key.clone(),
            nodes,
        });
        self.inner
            .write()
            .unwrap()
            .insert(key, TagEntry { tag: tag.clone(), refs: 1 });
        tag
    }

    pub fn get(&self, key: &str) -> Option<Arc<ReceiverTag>> {
        self.inner.read().unwrap().get(key).map(|e| e.tag.clone())
    }

    pub fn acquire(&self, key: &str) -> Option<Arc<ReceiverTag>> {
        let mut inner = self.inner.write().unwrap();
        inner.get_mut(key).map(|e| {
            e.refs += 1;
            e.tag.clone()
        })
    }

    /// Drop one reference; the entry is reclaimed at zero.
    pub fn release(&self, key: &str) {
        let mut inner = self.inner.write().unwrap();
        let remove = match inner.get_mut(key) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if remove {
            inner.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().is_empty()
    }
}
