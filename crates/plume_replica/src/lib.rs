//! Replicated log engine for a single plume partition.
//!
//! Every channel and every slot runs one [`Replica`]. The engine is a pure
//! state machine: it owns no threads and performs no I/O. An external runtime
//! calls [`Replica::tick`] on a cadence, steps inbound [`Message`]s into it,
//! and drains [`Replica::ready`] whenever [`Replica::has_ready`] reports
//! pending work. Durable writes, disk reads and state-machine application are
//! requested through self-addressed messages (`StoreAppend`, `SyncGet`,
//! `ApplyLogsReq`) and answered by stepping the matching response back in.

mod replica;
mod types;

pub use replica::Replica;
pub use types::{Config, Log, Message, MessageKind, NodeId, Ready, Role, Term};
