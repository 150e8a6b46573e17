//! Conversation rows and channel metadata (subscribers, denylist, cluster
//! configs, sender key material).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::key::channel_key;
use plume_replica::NodeId;

use super::keys;
use super::Store;

/// One user's view of one channel. `channel_id` is always the internal form
/// (fake id for person channels).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub uid: String,
    pub channel_id: String,
    pub channel_type: u8,
    pub readed_to_msg_seq: u64,
    pub unread_count: u32,
    pub timestamp: u64,
    pub version: u64,
}

/// Replication config of one channel, persisted on every replica and
/// rewritten atomically on leader change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClusterConfig {
    pub channel_id: String,
    pub channel_type: u8,
    pub term: u32,
    pub leader_id: NodeId,
    pub replicas: Vec<NodeId>,
}

impl Store {
    pub fn conversation(
        &self,
        uid: &str,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Option<Conversation>> {
        let key = keys::conversation_key(uid, &channel_key(channel_id, channel_type));
        match self.conversations.get(key)? {
            Some(v) => Ok(Some(serde_json::from_slice(&v).context("decode conversation")?)),
            None => Ok(None),
        }
    }

    pub fn upsert_conversations(&self, uid: &str, rows: &[Conversation]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut batch = self.keyspace().batch();
        for row in rows {
            let key = keys::conversation_key(uid, &channel_key(&row.channel_id, row.channel_type));
            batch.insert(&self.conversations, key, serde_json::to_vec(row)?);
        }
        batch.commit().context("commit conversations")?;
        Ok(())
    }

    pub fn delete_conversation(&self, uid: &str, channel_id: &str, channel_type: u8) -> Result<()> {
        let key = keys::conversation_key(uid, &channel_key(channel_id, channel_type));
        self.conversations.remove(key).context("delete conversation")?;
        Ok(())
    }

    /// Conversations of `uid` with `version > version_gt`, newest first,
    /// bounded by `limit`.
    pub fn last_conversations(
        &self,
        uid: &str,
        version_gt: u64,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let prefix = keys::conversation_prefix(uid);
        let mut rows: Vec<Conversation> = Vec::new();
        for item in self.conversations.prefix(prefix) {
            let (_, v) = item.context("scan conversations")?;
            let row: Conversation = serde_json::from_slice(&v).context("decode conversation")?;
            if row.version > version_gt {
                rows.push(row);
            }
        }
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        rows.truncate(limit.max(1));
        Ok(rows)
    }

    // ---- subscribers & denylist ------------------------------------------

    pub fn subscribers(&self, channel_id: &str, channel_type: u8) -> Result<Vec<String>> {
        let prefix = keys::subscriber_prefix(&channel_key(channel_id, channel_type));
        let mut out = Vec::new();
        for item in self.channel_meta.prefix(prefix.clone()) {
            let (k, _) = item.context("scan subscribers")?;
            if let Some(uid) = keys::uid_from_prefixed_key(&prefix, &k) {
                out.push(uid);
            }
        }
        Ok(out)
    }

    pub fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<()> {
        let ck = channel_key(channel_id, channel_type);
        let mut batch = self.keyspace().batch();
        for uid in uids {
            batch.insert(&self.channel_meta, keys::subscriber_key(&ck, uid), Vec::<u8>::new());
        }
        batch.commit().context("commit subscribers")?;
        Ok(())
    }

    pub fn remove_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
    ) -> Result<()> {
        let ck = channel_key(channel_id, channel_type);
        let mut batch = self.keyspace().batch();
        for uid in uids {
            batch.remove(&self.channel_meta, keys::subscriber_key(&ck, uid));
        }
        batch.commit().context("commit subscriber removal")?;
        Ok(())
    }

    pub fn is_subscriber(&self, channel_id: &str, channel_type: u8, uid: &str) -> Result<bool> {
        let key = keys::subscriber_key(&channel_key(channel_id, channel_type), uid);
        Ok(self.channel_meta.get(key)?.is_some())
    }

    pub fn add_denylist(&self, channel_id: &str, channel_type: u8, uids: &[String]) -> Result<()> {
        let ck = channel_key(channel_id, channel_type);
        let mut batch = self.keyspace().batch();
        for uid in uids {
            batch.insert(&self.channel_meta, keys::denylist_key(&ck, uid), Vec::<u8>::new());
        }
        batch.commit().context("commit denylist")?;
        Ok(())
    }

    pub fn is_denied(&self, channel_id: &str, channel_type: u8, uid: &str) -> Result<bool> {
        let key = keys::denylist_key(&channel_key(channel_id, channel_type), uid);
        Ok(self.channel_meta.get(key)?.is_some())
    }

    // ---- channel cluster config ------------------------------------------

    pub fn channel_config(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Option<ChannelClusterConfig>> {
        let key = keys::channel_config_key(&channel_key(channel_id, channel_type));
        match self.channel_meta.get(key)? {
            Some(v) => Ok(Some(serde_json::from_slice(&v).context("decode channel config")?)),
            None => Ok(None),
        }
    }

    pub fn save_channel_config(&self, config: &ChannelClusterConfig) -> Result<()> {
        let key = keys::channel_config_key(&channel_key(&config.channel_id, config.channel_type));
        self.channel_meta
            .insert(key, serde_json::to_vec(config)?)
            .context("save channel config")?;
        Ok(())
    }

    // ---- sender key material ---------------------------------------------

    pub fn user_key(&self, uid: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .channel_meta
            .get(keys::user_key_key(uid))?
            .map(|v| v.to_vec()))
    }

    pub fn set_user_key(&self, uid: &str, material: &[u8]) -> Result<()> {
        self.channel_meta
            .insert(keys::user_key_key(uid), material)
            .context("set user key")?;
        Ok(())
    }
}
