//! Typed errors surfaced across the cluster API boundary.

use plume_replica::NodeId;

/// Errors a caller of the cluster layer has to tell apart.
///
/// Everything else travels as `anyhow::Error` inside the node; these kinds
/// exist because callers react to them differently: leadership mismatches are
/// forwarded, propose timeouts mean "outcome unknown, reconcile by reading",
/// validation errors map to a 400-style response.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not the leader of {shard}, leader is node {leader}")]
    NotLeader { shard: String, leader: NodeId },

    /// The proposal was not rescinded and may still commit; callers must
    /// read committed state to reconcile.
    #[error("propose wait timed out, outcome unknown")]
    ProposeTimeout,

    #[error("not found")]
    NotFound,

    #[error("node is shutting down")]
    Stopped,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
