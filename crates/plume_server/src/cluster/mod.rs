//! Cluster layer: partitions, managers, transport and the propose paths.
//!
//! A fixed array of slots partitions the metadata key space; every channel is
//! its own replicated log created lazily from its cluster config. Both kinds
//! run the same [`shard::Partition`] runtime on the shared [`reactor`] loops.

pub mod reactor;
pub mod shard;
pub mod slot;
pub mod transport;
pub mod wait;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use plume_replica::{Config, Log, NodeId, Replica};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::id::MessageIdGen;
use crate::key::{channel_key, parse_channel_key, parse_slot_shard_no, slot_shard_no};
use crate::options::NodeOptions;
use crate::store::{keys, ChannelClusterConfig, Store};

use reactor::Reactor;
use shard::{LeaderChange, Partition, ProposeReq};
use slot::{ChannelApplier, SlotApplier, SlotCommand};
use transport::{decode_message, Frame, FrameKind};
use wait::MessageItem;

/// Applies committed log entries to the state machine of a partition kind.
pub trait LogApplier: Send + Sync + 'static {
    fn apply(&self, ident: &ShardIdent, logs: &[Log]) -> Result<()>;
}

/// Best-effort node-to-node send; reliability lives in the replica protocol.
pub trait ClusterTransport: Send + Sync + 'static {
    fn send(&self, to: NodeId, frame: Frame);
}

/// Receives frames from the transport listener.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, from: NodeId, frame: Frame);
}

/// Identity of one replicated partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShardIdent {
    Slot(u32),
    Channel {
        channel_id: String,
        channel_type: u8,
    },
}

impl ShardIdent {
    pub fn shard_no(&self) -> String {
        match self {
            Self::Slot(id) => slot_shard_no(*id),
            Self::Channel {
                channel_id,
                channel_type,
            } => channel_key(channel_id, *channel_type),
        }
    }
}

pub struct Cluster {
    opts: Arc<NodeOptions>,
    store: Arc<Store>,
    reactor: Arc<Reactor>,
    transport: Arc<dyn ClusterTransport>,
    leader_tx: mpsc::UnboundedSender<LeaderChange>,
    id_gen: Arc<MessageIdGen>,
    stopped: AtomicBool,
}

impl Cluster {
    pub fn new(
        opts: Arc<NodeOptions>,
        store: Arc<Store>,
        reactor: Arc<Reactor>,
        transport: Arc<dyn ClusterTransport>,
        id_gen: Arc<MessageIdGen>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<LeaderChange>) {
        let (leader_tx, leader_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                opts,
                store,
                reactor,
                transport,
                leader_tx,
                id_gen,
                stopped: AtomicBool::new(false),
            }),
            leader_rx,
        )
    }

    pub fn node_id(&self) -> NodeId {
        self.opts.node_id
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Create the local replicas of every slot this node serves.
    pub fn bootstrap(&self) -> Result<()> {
        for slot_id in 0..self.opts.slot_count {
            let replicas = self.opts.replicas_for_slot(slot_id);
            if !replicas.contains(&self.opts.node_id) {
                continue;
            }
            let leader = replicas[0];
            self.create_partition(ShardIdent::Slot(slot_id), replicas, leader, 1)?;
        }
        info!(node = self.opts.node_id, slots = self.opts.slot_count, "cluster bootstrapped");
        Ok(())
    }

    // ---- slot routing -----------------------------------------------------

    pub fn slot_id_of_key(&self, key: &str) -> u32 {
        keys::slot_for_key(key, self.opts.slot_count)
    }

    /// Current leader of a slot: the live replica view when this node hosts
    /// the slot, otherwise the deterministic initial assignment.
    pub fn slot_leader(&self, slot_id: u32) -> NodeId {
        let shard_no = slot_shard_no(slot_id);
        let live = self.reactor.with_partition(&shard_no, |p| {
            p.shared.leader.load(Ordering::Relaxed)
        });
        match live {
            Some(leader) if leader != 0 => leader,
            _ => self.opts.replicas_for_slot(slot_id)[0],
        }
    }

    /// Leader of the slot that owns `key` (a uid or channel id).
    pub fn slot_leader_of(&self, key: &str) -> NodeId {
        self.slot_leader(self.slot_id_of_key(key))
    }

    pub fn is_slot_leader_of(&self, key: &str) -> bool {
        self.slot_leader_of(key) == self.opts.node_id
    }

    // ---- proposing --------------------------------------------------------

    pub async fn propose_to_slot(
        &self,
        slot_id: u32,
        logs: Vec<Log>,
    ) -> ClusterResult<Vec<MessageItem>> {
        let shard_no = slot_shard_no(slot_id);
        self.ensure_slot_partition(slot_id)
            .map_err(ClusterError::Other)?;
        let leader = self.slot_leader(slot_id);
        if leader != self.opts.node_id {
            return Err(ClusterError::NotLeader {
                shard: shard_no,
                leader,
            });
        }
        self.propose_and_wait(&shard_no, logs).await
    }

    /// Rebuild a crashed slot partition from persistent state.
    fn ensure_slot_partition(&self, slot_id: u32) -> Result<()> {
        let shard_no = slot_shard_no(slot_id);
        if self.reactor.contains(&shard_no) {
            return Ok(());
        }
        let replicas = self.opts.replicas_for_slot(slot_id);
        if !replicas.contains(&self.opts.node_id) {
            return Ok(());
        }
        let leader = replicas[0];
        self.create_partition(ShardIdent::Slot(slot_id), replicas, leader, 1)
    }

    /// Encode and replicate one metadata command through the slot that owns
    /// `owner_key`.
    pub async fn propose_slot_command(
        &self,
        owner_key: &str,
        cmd: &SlotCommand,
    ) -> ClusterResult<()> {
        let slot_id = self.slot_id_of_key(owner_key);
        let log = Log {
            index: 0,
            term: 0,
            id: self.id_gen.next(),
            data: cmd.encode().map_err(ClusterError::Other)?,
        };
        self.propose_to_slot(slot_id, vec![log]).await?;
        Ok(())
    }

    pub async fn propose_channel_messages(
        &self,
        channel_id: &str,
        channel_type: u8,
        logs: Vec<Log>,
    ) -> ClusterResult<Vec<MessageItem>> {
        let config = self
            .channel_config_or_create(channel_id, channel_type)
            .map_err(ClusterError::Other)?;
        self.ensure_channel_partition(&config)
            .map_err(ClusterError::Other)?;
        let shard_no = channel_key(channel_id, channel_type);
        let leader = self.channel_leader_live(&shard_no, &config);
        if leader != self.opts.node_id {
            return Err(ClusterError::NotLeader {
                shard: shard_no,
                leader,
            });
        }
        self.propose_and_wait(&shard_no, logs).await
    }

    async fn propose_and_wait(
        &self,
        shard_no: &str,
        logs: Vec<Log>,
    ) -> ClusterResult<Vec<MessageItem>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ClusterError::Stopped);
        }
        if logs.is_empty() {
            return Ok(Vec::new());
        }
        let key = logs.last().unwrap().id.to_string();
        let ids: Vec<u64> = logs.iter().map(|l| l.id).collect();
        let rx = self
            .reactor
            .with_partition(shard_no, |p| {
                let rx = p.shared.wait.lock().unwrap().add_wait(key.clone(), ids);
                p.shared
                    .proposes
                    .lock()
                    .unwrap()
                    .push_back(ProposeReq { key, logs });
                rx
            })
            .ok_or_else(|| ClusterError::NotLeader {
                shard: shard_no.to_string(),
                leader: 0,
            })?;
        self.reactor.advance(shard_no);

        match tokio::time::timeout(self.opts.propose_timeout, rx).await {
            Err(_) => Err(ClusterError::ProposeTimeout),
            Ok(Err(_)) => Err(ClusterError::Stopped),
            Ok(Ok(result)) => result,
        }
    }

    // ---- channels ---------------------------------------------------------

    /// Load a channel's cluster config, minting the initial one from the
    /// owning slot when the channel is new.
    pub fn channel_config_or_create(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<ChannelClusterConfig> {
        if let Some(cfg) = self.store.channel_config(channel_id, channel_type)? {
            return Ok(cfg);
        }
        let slot_id = self.slot_id_of_key(channel_id);
        let config = ChannelClusterConfig {
            channel_id: channel_id.to_string(),
            channel_type,
            term: 1,
            leader_id: self.slot_leader(slot_id),
            replicas: self.opts.replicas_for_slot(slot_id),
        };
        self.store.save_channel_config(&config)?;
        debug!(
            channel = %channel_key(channel_id, channel_type),
            leader = config.leader_id,
            "channel cluster config created"
        );
        Ok(config)
    }

    pub fn ensure_channel_partition(&self, config: &ChannelClusterConfig) -> Result<()> {
        if !config.replicas.contains(&self.opts.node_id) {
            return Ok(());
        }
        let ident = ShardIdent::Channel {
            channel_id: config.channel_id.clone(),
            channel_type: config.channel_type,
        };
        if self.reactor.contains(&ident.shard_no()) {
            return Ok(());
        }
        self.create_partition(
            ident,
            config.replicas.clone(),
            config.leader_id,
            config.term,
        )
    }

    pub fn leader_of_channel_for_read(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<NodeId> {
        let config = self.channel_config_or_create(channel_id, channel_type)?;
        Ok(self.channel_leader_live(&channel_key(channel_id, channel_type), &config))
    }

    fn channel_leader_live(&self, shard_no: &str, config: &ChannelClusterConfig) -> NodeId {
        let live = self.reactor.with_partition(shard_no, |p| {
            p.shared.leader.load(Ordering::Relaxed)
        });
        match live {
            Some(leader) if leader != 0 => leader,
            _ => config.leader_id,
        }
    }

    // ---- partition construction -------------------------------------------

    fn create_partition(
        &self,
        ident: ShardIdent,
        replicas: Vec<NodeId>,
        leader: NodeId,
        term: u32,
    ) -> Result<()> {
        let shard_no = ident.shard_no();
        let mut cfg = Config::new(self.opts.node_id, shard_no.clone(), replicas);
        let tick_ms = self.opts.tick_interval.as_millis().max(1) as u64;
        cfg.sync_timeout_ticks = (5_000 / tick_ms).max(2) as u32;
        cfg.sync_limit_bytes = self.opts.log_sync_limit_bytes;

        let mut replica = Replica::new(cfg);
        let (last_index, last_term) = self
            .store
            .log_last_index_and_term(&shard_no)
            .context("restore last index")?;
        let applied = self.store.applied_index(&shard_no)?;
        replica.set_initial_state(last_index, last_term, applied.min(last_index));
        if leader == self.opts.node_id {
            replica.become_leader(term);
        } else {
            replica.become_follower(term, leader);
        }

        let applier: Arc<dyn LogApplier> = match &ident {
            ShardIdent::Slot(_) => SlotApplier::new(self.store.clone()),
            ShardIdent::Channel { .. } => ChannelApplier::new(),
        };
        let partition = Partition::new(
            ident,
            replica,
            self.store.clone(),
            applier,
            self.transport.clone(),
            self.reactor.advance_handle(&shard_no),
            self.leader_tx.clone(),
            self.opts.max_propose_log_count,
            self.opts.log_sync_limit_bytes,
        );
        self.reactor.insert_partition(partition);
        Ok(())
    }

    /// Apply a config observed from the wire (leader-change broadcast).
    pub fn apply_channel_config(&self, config: &ChannelClusterConfig) -> Result<()> {
        self.store.save_channel_config(config)?;
        let shard_no = channel_key(&config.channel_id, config.channel_type);
        let node_id = self.opts.node_id;
        let applied = self.reactor.with_partition(&shard_no, |p| {
            p.replica.set_replicas(config.replicas.clone());
            if config.leader_id == node_id {
                p.replica.become_leader(config.term);
            } else {
                p.replica.become_follower(config.term, config.leader_id);
            }
        });
        if applied.is_some() {
            self.reactor.advance(&shard_no);
        } else {
            self.ensure_channel_partition(config)?;
        }
        Ok(())
    }
}

impl InboundHandler for Cluster {
    fn handle(&self, from: NodeId, frame: Frame) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        match frame.kind {
            FrameKind::ChannelMsg | FrameKind::SlotMsg => {
                let msg = match decode_message(&frame.payload) {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(%from, error = %err, "bad replica frame");
                        return;
                    }
                };
                if frame.kind == FrameKind::ChannelMsg && !self.reactor.contains(&frame.shard_no) {
                    // Lazily build the replica from (or with) its config.
                    let Some((channel_id, channel_type)) = parse_channel_key(&frame.shard_no)
                    else {
                        warn!(shard = %frame.shard_no, "bad channel shard key");
                        return;
                    };
                    match self.channel_config_or_create(&channel_id, channel_type) {
                        Ok(cfg) => {
                            if let Err(err) = self.ensure_channel_partition(&cfg) {
                                warn!(shard = %frame.shard_no, error = %err, "channel partition create failed");
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(shard = %frame.shard_no, error = %err, "channel config load failed");
                            return;
                        }
                    }
                }
                if frame.kind == FrameKind::SlotMsg {
                    let Some(slot_id) = parse_slot_shard_no(&frame.shard_no) else {
                        warn!(shard = %frame.shard_no, "bad slot shard key");
                        return;
                    };
                    if let Err(err) = self.ensure_slot_partition(slot_id) {
                        warn!(shard = %frame.shard_no, error = %err, "slot partition create failed");
                        return;
                    }
                }
                let delivered = self
                    .reactor
                    .with_partition(&frame.shard_no, |p| {
                        p.shared.inbound.lock().unwrap().push_back(msg);
                    })
                    .is_some();
                if delivered {
                    self.reactor.advance(&frame.shard_no);
                } else {
                    debug!(shard = %frame.shard_no, %from, "frame for unknown partition dropped");
                }
            }
            FrameKind::ConfigMsg => match serde_json::from_slice::<ChannelClusterConfig>(
                &frame.payload,
            ) {
                Ok(cfg) => {
                    if let Err(err) = self.apply_channel_config(&cfg) {
                        warn!(error = %err, "apply channel config failed");
                    }
                }
                Err(err) => warn!(%from, error = %err, "bad config frame"),
            },
            FrameKind::Ping | FrameKind::Pong => {}
        }
    }
}
