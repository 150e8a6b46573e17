//! Shared types for the replica engine.
//!
//! These are kept in a small, dependency-light module because they are used
//! by both the engine itself and the shard runtime / transport layers above.

use bytes::Bytes;

/// Logical node identifier within the cluster.
pub type NodeId = u64;
/// Leader term. Monotonically increasing per partition.
pub type Term = u32;

/// One replicated log entry.
///
/// `index` is the per-partition 1-based position, `term` the leader term the
/// entry was created in, and `id` a globally unique message identifier
/// assigned by the proposer. Entries are immutable once appended at a given
/// `(index, term)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Log {
    pub index: u64,
    pub term: Term,
    pub id: u64,
    pub data: Bytes,
}

impl Log {
    /// Wire/storage footprint used for byte-budgeted batching.
    pub fn encoded_size(&self) -> u64 {
        (8 + 4 + 8 + 4 + self.data.len()) as u64
    }
}

/// Message kinds understood by [`crate::Replica::step`].
///
/// `Sync`/`SyncResp` implement the pull-based replication loop between a
/// follower and its leader. `SyncGet`/`StoreAppend`/`ApplyLogsReq` (and their
/// responses) are self-addressed: the engine emits them to request local disk
/// or state-machine work and the runtime steps the response back in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Propose = 1,
    Sync = 2,
    SyncResp = 3,
    SyncGet = 4,
    SyncGetResp = 5,
    StoreAppend = 6,
    StoreAppendResp = 7,
    ApplyLogsReq = 8,
    ApplyLogsResp = 9,
    Ping = 10,
    Pong = 11,
    VoteReq = 12,
    VoteResp = 13,
    AppointLeader = 14,
}

impl MessageKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Propose,
            2 => Self::Sync,
            3 => Self::SyncResp,
            4 => Self::SyncGet,
            5 => Self::SyncGetResp,
            6 => Self::StoreAppend,
            7 => Self::StoreAppendResp,
            8 => Self::ApplyLogsReq,
            9 => Self::ApplyLogsResp,
            10 => Self::Ping,
            11 => Self::Pong,
            12 => Self::VoteReq,
            13 => Self::VoteResp,
            14 => Self::AppointLeader,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Propose => "propose",
            Self::Sync => "sync",
            Self::SyncResp => "sync_resp",
            Self::SyncGet => "sync_get",
            Self::SyncGetResp => "sync_get_resp",
            Self::StoreAppend => "store_append",
            Self::StoreAppendResp => "store_append_resp",
            Self::ApplyLogsReq => "apply_logs_req",
            Self::ApplyLogsResp => "apply_logs_resp",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::VoteReq => "vote_req",
            Self::VoteResp => "vote_resp",
            Self::AppointLeader => "appoint_leader",
        }
    }
}

/// A replica protocol message.
///
/// Not every field is meaningful for every kind; unused fields are zero. The
/// protocol is idempotent by construction, so the transport only needs
/// best-effort delivery.
#[derive(Clone, Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub from: NodeId,
    pub to: NodeId,
    pub term: Term,
    /// Kind-specific index: sync start index, appended-through index, vote
    /// candidate last index, appointed-leader node id, ...
    pub index: u64,
    pub applying_index: u64,
    pub committed_index: u64,
    pub applied_index: u64,
    pub reject: bool,
    pub logs: Vec<Log>,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            from: 0,
            to: 0,
            term: 0,
            index: 0,
            applying_index: 0,
            committed_index: 0,
            applied_index: 0,
            reject: false,
            logs: Vec::new(),
        }
    }
}

/// Replica role. At most one leader exists per term.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Per-partition engine configuration.
///
/// All cadences are expressed in ticks; the runtime decides the wall-clock
/// tick interval (100 ms by default), so `sync_timeout_ticks = 50` re-arms
/// an unanswered pull after roughly five seconds.
#[derive(Clone, Debug)]
pub struct Config {
    pub node_id: NodeId,
    pub shard_no: String,
    pub replicas: Vec<NodeId>,
    /// Base follower election timeout; the effective timeout is randomized
    /// in `[election_ticks, 2 * election_ticks)` to break ties.
    pub election_ticks: u32,
    pub heartbeat_ticks: u32,
    /// Cadence for a follower's pull requests when idle.
    pub sync_interval_ticks: u32,
    /// Re-arm an unanswered in-flight `Sync` after this many ticks.
    pub sync_timeout_ticks: u32,
    /// Byte budget for the log slice in one `SyncResp`.
    pub sync_limit_bytes: u64,
}

impl Config {
    pub fn new(node_id: NodeId, shard_no: impl Into<String>, replicas: Vec<NodeId>) -> Self {
        Self {
            node_id,
            shard_no: shard_no.into(),
            replicas,
            election_ticks: 10,
            heartbeat_ticks: 2,
            sync_interval_ticks: 2,
            sync_timeout_ticks: 50,
            sync_limit_bytes: 4 * 1024 * 1024,
        }
    }

    pub fn quorum(&self) -> usize {
        self.replicas.len() / 2 + 1
    }
}

/// Drained output of one ready cycle: messages to route.
///
/// Messages addressed to the local node are storage / apply requests; all
/// others go to the transport.
#[derive(Debug, Default)]
pub struct Ready {
    pub messages: Vec<Message>,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
