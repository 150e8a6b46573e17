//! Embedded storage for logs, conversations and channel metadata.
//!
//! Backed by one fjall keyspace. Replicated-log rows and their per-partition
//! metadata are spread over `db_shard_count` partition pairs routed by crc32
//! of the shard key; appends take a per-shard lock so the read-modify-write
//! of a truncating append stays serialized. Conversation rows and channel
//! metadata are low-volume and live in two flat partitions.

mod conversation;
mod log;
pub(crate) mod keys;
mod record;

pub use conversation::{ChannelClusterConfig, Conversation};
pub use record::MessageRecord;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};

pub struct Store {
    keyspace: Arc<Keyspace>,
    shards: Vec<ShardPartitions>,
    conversations: PartitionHandle,
    channel_meta: PartitionHandle,
    shard_count: u32,
}

struct ShardPartitions {
    logs: PartitionHandle,
    meta: PartitionHandle,
    /// Serializes truncating appends per shard.
    write_lock: Mutex<()>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, shard_count: u32) -> anyhow::Result<Self> {
        let shard_count = shard_count.max(1);
        let keyspace = Arc::new(
            fjall::Config::new(path.as_ref())
                .open()
                .context("open fjall keyspace")?,
        );
        let mut shards = Vec::with_capacity(shard_count as usize);
        for i in 0..shard_count {
            let logs = keyspace
                .open_partition(&format!("logs_{i}"), PartitionCreateOptions::default())?;
            let meta = keyspace
                .open_partition(&format!("meta_{i}"), PartitionCreateOptions::default())?;
            shards.push(ShardPartitions {
                logs,
                meta,
                write_lock: Mutex::new(()),
            });
        }
        let conversations =
            keyspace.open_partition("conversations", PartitionCreateOptions::default())?;
        let channel_meta =
            keyspace.open_partition("channel_meta", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            shards,
            conversations,
            channel_meta,
            shard_count,
        })
    }

    fn shard(&self, shard_no: &str) -> &ShardPartitions {
        &self.shards[keys::db_shard(shard_no, self.shard_count) as usize]
    }

    pub(crate) fn keyspace(&self) -> &Arc<Keyspace> {
        &self.keyspace
    }
}
