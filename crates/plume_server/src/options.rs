//! Node configuration and static cluster membership.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use plume_replica::NodeId;

/// One cluster member: replica transport address plus its HTTP API base url,
/// used for request forwarding and cross-node fan-out.
#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub api_url: String,
}

impl PeerSpec {
    /// Parse `id@host:port@http://host:apiport`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.splitn(3, '@');
        let id = parts
            .next()
            .context("missing peer id")?
            .parse::<NodeId>()
            .context("peer id must be numeric")?;
        let addr = parts
            .next()
            .context("missing peer address")?
            .parse::<SocketAddr>()
            .context("bad peer address")?;
        let api_url = parts.next().context("missing peer api url")?.to_string();
        if id == 0 {
            bail!("peer id 0 is reserved");
        }
        Ok(Self {
            id,
            addr,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Clone, Debug)]
pub struct NodeOptions {
    pub node_id: NodeId,
    pub data_dir: PathBuf,
    pub listen_cluster: SocketAddr,
    pub listen_api: SocketAddr,
    /// Every cluster member, the local node included.
    pub peers: Vec<PeerSpec>,
    /// Shared secret checked during the node-to-node handshake.
    pub cluster_token: String,

    /// Fixed at cluster init; changing it re-homes every key.
    pub slot_count: u32,
    pub replica_count: usize,
    /// KV shard count inside the embedded store.
    pub db_shard_count: u32,

    pub reactor_subs: usize,
    pub tick_interval: Duration,
    pub propose_timeout: Duration,
    pub max_propose_log_count: usize,
    pub log_sync_limit_bytes: u64,

    pub storage_max_size: u64,
    pub deliver_max_size: u64,
    pub forward_max_size: u64,
    pub channel_idle_timeout: Duration,

    pub conversation_flush_interval: Duration,
    pub conversation_user_max_count: usize,
    pub sync_default_msg_count: usize,
}

impl NodeOptions {
    pub fn new(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        let subs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(8);
        Self {
            node_id,
            data_dir: data_dir.into(),
            listen_cluster: "127.0.0.1:0".parse().unwrap(),
            listen_api: "127.0.0.1:0".parse().unwrap(),
            peers: Vec::new(),
            cluster_token: "plume".to_string(),
            slot_count: 128,
            replica_count: 3,
            db_shard_count: 8,
            reactor_subs: subs,
            tick_interval: Duration::from_millis(100),
            propose_timeout: Duration::from_secs(5),
            max_propose_log_count: 1000,
            log_sync_limit_bytes: 2 * 1024 * 1024,
            storage_max_size: 2 * 1024 * 1024,
            deliver_max_size: 2 * 1024 * 1024,
            forward_max_size: 2 * 1024 * 1024,
            channel_idle_timeout: Duration::from_secs(120),
            conversation_flush_interval: Duration::from_secs(1),
            conversation_user_max_count: 500,
            sync_default_msg_count: 15,
        }
    }

    /// Single-node defaults used by tests and embedded runs.
    pub fn single(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        let mut opts = Self::new(node_id, data_dir);
        opts.replica_count = 1;
        opts.slot_count = 8;
        opts
    }

    pub fn peer(&self, id: NodeId) -> Option<&PeerSpec> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn api_url_of(&self, id: NodeId) -> Option<&str> {
        self.peer(id).map(|p| p.api_url.as_str())
    }

    /// Deterministic replica set of a slot: the sorted member list rotated by
    /// slot id, truncated to the replica count. The first entry is the
    /// initial leader at term 1; elections take over from there.
    pub fn replicas_for_slot(&self, slot_id: u32) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.peers.iter().map(|p| p.id).collect();
        if ids.is_empty() {
            ids.push(self.node_id);
        }
        ids.sort_unstable();
        let n = ids.len();
        let count = self.replica_count.clamp(1, n);
        let start = slot_id as usize % n;
        (0..count).map(|i| ids[(start + i) % n]).collect()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id == 0 {
            bail!("node id 0 is reserved");
        }
        if self.slot_count == 0 {
            bail!("slot count must be positive");
        }
        if !self.peers.is_empty() && self.peer(self.node_id).is_none() {
            bail!("peer list does not contain the local node {}", self.node_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_spec_parses() {
        let p = PeerSpec::parse("3@127.0.0.1:9100@http://127.0.0.1:9200").unwrap();
        assert_eq!(p.id, 3);
        assert_eq!(p.addr.port(), 9100);
        assert_eq!(p.api_url, "http://127.0.0.1:9200");
        assert!(PeerSpec::parse("x@nope").is_err());
    }

    #[test]
    fn slot_replicas_rotate_and_bound() {
        let mut opts = NodeOptions::new(1, "/tmp/x");
        for id in 1..=3u64 {
            opts.peers.push(PeerSpec {
                id,
                addr: "127.0.0.1:9000".parse().unwrap(),
                api_url: format!("http://127.0.0.1:920{id}"),
            });
        }
        opts.replica_count = 2;
        assert_eq!(opts.replicas_for_slot(0), vec![1, 2]);
        assert_eq!(opts.replicas_for_slot(1), vec![2, 3]);
        assert_eq!(opts.replicas_for_slot(2), vec![3, 1]);
        assert_eq!(opts.replicas_for_slot(3), vec![1, 2]);
    }
}
