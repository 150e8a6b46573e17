//! Slot log commands and the appliers for both partition kinds.
//!
//! Slot partitions replicate metadata mutations: conversation rows,
//! subscriber and denylist membership, sender key material. The apply path
//! decodes each committed entry and writes it to the store. Channel
//! partitions need no apply-side work: their entries are materialized as
//! message rows by the append path itself, so commit just advances the
//! applied watermark.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use plume_replica::Log;

use crate::store::{Conversation, Store};

use super::{LogApplier, ShardIdent};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SlotCommand {
    UpsertConversations {
        uid: String,
        rows: Vec<Conversation>,
    },
    DeleteConversation {
        uid: String,
        channel_id: String,
        channel_type: u8,
    },
    AddSubscribers {
        channel_id: String,
        channel_type: u8,
        uids: Vec<String>,
    },
    RemoveSubscribers {
        channel_id: String,
        channel_type: u8,
        uids: Vec<String>,
    },
    AddDenylist {
        channel_id: String,
        channel_type: u8,
        uids: Vec<String>,
    },
    SetUserKey {
        uid: String,
        material: Vec<u8>,
    },
}

impl SlotCommand {
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self).context("encode slot command")?))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).context("decode slot command")
    }
}

pub struct SlotApplier {
    store: Arc<Store>,
}

impl SlotApplier {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

impl LogApplier for SlotApplier {
    fn apply(&self, ident: &ShardIdent, logs: &[Log]) -> Result<()> {
        for log in logs {
            let cmd = SlotCommand::decode(&log.data)?;
            debug!(shard = %ident.shard_no(), index = log.index, "apply slot command");
            match cmd {
                SlotCommand::UpsertConversations { uid, rows } => {
                    self.store.upsert_conversations(&uid, &rows)?;
                }
                SlotCommand::DeleteConversation {
                    uid,
                    channel_id,
                    channel_type,
                } => {
                    self.store.delete_conversation(&uid, &channel_id, channel_type)?;
                }
                SlotCommand::AddSubscribers {
                    channel_id,
                    channel_type,
                    uids,
                } => {
                    self.store.add_subscribers(&channel_id, channel_type, &uids)?;
                }
                SlotCommand::RemoveSubscribers {
                    channel_id,
                    channel_type,
                    uids,
                } => {
                    self.store.remove_subscribers(&channel_id, channel_type, &uids)?;
                }
                SlotCommand::AddDenylist {
                    channel_id,
                    channel_type,
                    uids,
                } => {
                    self.store.add_denylist(&channel_id, channel_type, &uids)?;
                }
                SlotCommand::SetUserKey { uid, material } => {
                    self.store.set_user_key(&uid, &material)?;
                }
            }
        }
        Ok(())
    }
}

pub struct ChannelApplier;

impl ChannelApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl LogApplier for ChannelApplier {
    fn apply(&self, _ident: &ShardIdent, _logs: &[Log]) -> Result<()> {
        Ok(())
    }
}
