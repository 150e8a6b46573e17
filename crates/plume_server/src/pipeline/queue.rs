//! The per-channel message queue and its stage cursors.
//!
//! One append-only queue per channel; each pipeline stage owns a monotone
//! cursor into it. A message at position `p` becomes eligible for a stage
//! once every prior stage has advanced past `p`. Indexes are absolute
//! (1-based, never reused) so cursors survive the queue dropping its fully
//! consumed prefix.

use bytes::Bytes;
use plume_replica::NodeId;
use std::collections::VecDeque;

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineMessage {
    pub message_id: u64,
    /// Per-channel sequence, assigned by the storage stage from the log index.
    pub message_seq: u64,
    pub from_uid: String,
    pub from_conn_id: u64,
    pub from_node_id: NodeId,
    pub is_encrypt: bool,
    pub payload: Bytes,
    /// Dropped by decrypt or permission checking; later stages skip it.
    pub failed: bool,
}

impl PipelineMessage {
    pub fn encoded_size(&self) -> u64 {
        (40 + self.from_uid.len() + self.payload.len()) as u64
    }
}

#[derive(Default)]
pub struct MsgQueue {
    /// Absolute index of the element before `items[0]`.
    base: u64,
    items: VecDeque<PipelineMessage>,

    pub last_index: u64,
    pub payload_decrypting_index: u64,
    pub permission_checking_index: u64,
    pub storaging_index: u64,
    pub sendacking_index: u64,
    pub delivering_index: u64,
    pub forwarding_index: u64,
}

impl MsgQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, msg: PipelineMessage) -> u64 {
        self.items.push_back(msg);
        self.last_index += 1;
        self.last_index
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Absolute index of the oldest retained position boundary; used as the
    /// floor when cursors reset on a role change.
    pub fn floor(&self) -> u64 {
        self.base
    }

    /// Messages in `(after, through]`, bounded by `max_bytes` (zero means
    /// unbounded). Never splits below one message.
    pub fn slice_with_size(&self, after: u64, through: u64, max_bytes: u64) -> Vec<PipelineMessage> {
        let mut out = Vec::new();
        let mut used = 0u64;
        let lo = after.max(self.base);
        for index in (lo + 1)..=through.min(self.last_index) {
            let Some(msg) = self.get(index) else {
                break;
            };
            used += msg.encoded_size();
            if max_bytes > 0 && used > max_bytes && !out.is_empty() {
                break;
            }
            out.push(msg.clone());
            if max_bytes > 0 && used >= max_bytes {
                break;
            }
        }
        out
    }

    pub fn get(&self, index: u64) -> Option<&PipelineMessage> {
        if index <= self.base {
            return None;
        }
        self.items.get((index - self.base - 1) as usize)
    }

    fn get_mut_by_id(&mut self, message_id: u64) -> Option<&mut PipelineMessage> {
        self.items.iter_mut().find(|m| m.message_id == message_id)
    }

    pub fn set_seq(&mut self, message_id: u64, seq: u64) {
        if let Some(msg) = self.get_mut_by_id(message_id) {
            msg.message_seq = seq;
        }
    }

    pub fn set_payload(&mut self, message_id: u64, payload: Bytes) {
        if let Some(msg) = self.get_mut_by_id(message_id) {
            msg.payload = payload;
        }
    }

    pub fn mark_failed(&mut self, message_id: u64) {
        if let Some(msg) = self.get_mut_by_id(message_id) {
            msg.failed = true;
        }
    }

    /// Drop the prefix every relevant cursor has consumed.
    pub fn truncate_to(&mut self, consumed: u64) {
        while self.base < consumed {
            if self.items.pop_front().is_none() {
                break;
            }
            self.base += 1;
        }
    }
}
