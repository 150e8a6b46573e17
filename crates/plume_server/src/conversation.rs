//! Hot per-user conversation cache.
//!
//! Deliveries land on each uid's slot leader, which is exactly where
//! `/conversation/sync` is served, so the cache lives node-local and sharded
//! by uid hash. Rows go dirty on delivery and a background flusher folds them
//! into the replicated store; sync merges cache over persisted rows so reads
//! never wait on the flush.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::id::{now_ms, now_secs};
use crate::key::channel_key;
use crate::store::{Conversation, MessageRecord};

#[derive(Clone, Debug)]
pub struct CachedConversation {
    pub channel_id: String,
    pub channel_type: u8,
    pub readed_to_msg_seq: u64,
    pub last_msg_seq: u64,
    pub timestamp: u64,
    pub version: u64,
    dirty: bool,
}

impl CachedConversation {
    pub fn to_row(&self, uid: &str) -> Conversation {
        Conversation {
            uid: uid.to_string(),
            channel_id: self.channel_id.clone(),
            channel_type: self.channel_type,
            readed_to_msg_seq: self.readed_to_msg_seq,
            unread_count: self
                .last_msg_seq
                .saturating_sub(self.readed_to_msg_seq)
                .min(u32::MAX as u64) as u32,
            timestamp: self.timestamp,
            version: self.version,
        }
    }
}

/// One user's dirty rows plus the versions they were snapshotted at.
pub struct DirtyUser {
    pub uid: String,
    pub rows: Vec<Conversation>,
    pub stamps: Vec<(String, u64)>,
}

pub struct ConversationManager {
    shards: Vec<Mutex<HashMap<String, HashMap<String, CachedConversation>>>>,
}

impl ConversationManager {
    pub fn new(shard_count: usize) -> Arc<Self> {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Arc::new(Self { shards })
    }

    fn shard(&self, uid: &str) -> &Mutex<HashMap<String, HashMap<String, CachedConversation>>> {
        let idx = crc32fast::hash(uid.as_bytes()) as usize % self.shards.len();
        &self.shards[idx]
    }

    /// Fold a delivered batch into `uid`'s cache. The sender's own messages
    /// count as read; everyone else's unread grows with the sequence gap.
    pub fn update_on_deliver(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
        records: &[MessageRecord],
    ) {
        let Some(last) = records.iter().map(|r| r.message_seq).max() else {
            return;
        };
        let own_last = records
            .iter()
            .filter(|r| r.from_uid == uid)
            .map(|r| r.message_seq)
            .max();

        let key = channel_key(channel_id, channel_type);
        let mut shard = self.shard(uid).lock().unwrap();
        let rows = shard.entry(uid.to_string()).or_default();
        let row = rows.entry(key).or_insert_with(|| CachedConversation {
            channel_id: channel_id.to_string(),
            channel_type,
            readed_to_msg_seq: 0,
            last_msg_seq: 0,
            timestamp: 0,
            version: 0,
            dirty: false,
        });
        row.last_msg_seq = row.last_msg_seq.max(last);
        if let Some(own) = own_last {
            row.readed_to_msg_seq = row.readed_to_msg_seq.max(own);
        }
        row.timestamp = now_secs();
        row.version = now_ms();
        row.dirty = true;
    }

    pub fn user_cache(&self, uid: &str) -> Vec<CachedConversation> {
        let shard = self.shard(uid).lock().unwrap();
        shard
            .get(uid)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop one cached row, typically after a write-through mutation.
    pub fn remove(&self, uid: &str, channel_id: &str, channel_type: u8) {
        let key = channel_key(channel_id, channel_type);
        let mut shard = self.shard(uid).lock().unwrap();
        if let Some(rows) = shard.get_mut(uid) {
            rows.remove(&key);
            if rows.is_empty() {
                shard.remove(uid);
            }
        }
    }

    /// Snapshot every dirty row without clearing the flags; the flusher
    /// confirms with [`Self::mark_clean`] once the rows are durable.
    pub fn snapshot_dirty(&self) -> Vec<DirtyUser> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            for (uid, rows) in shard.iter() {
                let mut dirty_rows = Vec::new();
                let mut stamps = Vec::new();
                for (key, row) in rows {
                    if row.dirty {
                        dirty_rows.push(row.to_row(uid));
                        stamps.push((key.clone(), row.version));
                    }
                }
                if !dirty_rows.is_empty() {
                    out.push(DirtyUser {
                        uid: uid.clone(),
                        rows: dirty_rows,
                        stamps,
                    });
                }
            }
        }
        out
    }

    /// Clear dirty flags for rows whose version has not moved since the
    /// snapshot was taken.
    pub fn mark_clean(&self, uid: &str, stamps: &[(String, u64)]) {
        let mut shard = self.shard(uid).lock().unwrap();
        if let Some(rows) = shard.get_mut(uid) {
            for (key, version) in stamps {
                if let Some(row) = rows.get_mut(key) {
                    if row.version == *version {
                        row.dirty = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn record(seq: u64, from: &str) -> MessageRecord {
        MessageRecord {
            message_id: seq * 7,
            message_seq: seq,
            from_uid: from.into(),
            timestamp: 1,
            payload: Bytes::from_static(b"m"),
        }
    }

    #[test]
    fn deliver_updates_unread_and_sender_read_state() {
        let mgr = ConversationManager::new(4);
        let records = vec![record(1, "alice"), record(2, "bob")];

        mgr.update_on_deliver("alice", "alice@bob", 1, &records);
        mgr.update_on_deliver("bob", "alice@bob", 1, &records);

        let alice = &mgr.user_cache("alice")[0];
        assert_eq!(alice.last_msg_seq, 2);
        assert_eq!(alice.readed_to_msg_seq, 1, "own message auto-read");
        assert_eq!(alice.to_row("alice").unread_count, 1);

        let bob = &mgr.user_cache("bob")[0];
        assert_eq!(bob.readed_to_msg_seq, 2);
        assert_eq!(bob.to_row("bob").unread_count, 0);
    }

    #[test]
    fn dirty_snapshot_and_clean_cycle() {
        let mgr = ConversationManager::new(2);
        mgr.update_on_deliver("carol", "room", 2, &[record(5, "dave")]);

        let dirty = mgr.snapshot_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].uid, "carol");
        assert_eq!(dirty[0].rows[0].unread_count, 5);

        mgr.mark_clean("carol", &dirty[0].stamps);
        assert!(mgr.snapshot_dirty().is_empty());

        // A new delivery after cleaning re-dirties the row.
        mgr.update_on_deliver("carol", "room", 2, &[record(6, "dave")]);
        assert_eq!(mgr.snapshot_dirty().len(), 1);

        mgr.remove("carol", "room", 2);
        assert!(mgr.user_cache("carol").is_empty());
    }
}
