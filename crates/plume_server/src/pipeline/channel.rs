//! Per-channel pipeline state machine.
//!
//! A channel is either the logical leader (decrypt → permission → store →
//! sendack ∥ deliver) or a proxy (decrypt → forward to the leader). `ready()`
//! emits at most one in-flight batch per stage; the executor reports back
//! through [`StageOutcome`] and cursors only ever move forward.

use bytes::Bytes;
use plume_replica::NodeId;
use std::time::{Duration, Instant};
use tracing::info;

use crate::key::channel_key;

use super::queue::{MsgQueue, PipelineMessage};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineRole {
    Unknown,
    Leader,
    Proxy { leader: NodeId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Decrypt,
    Permission,
    Storage,
    Sendack,
    Deliver,
    Forward,
}

/// One batch of work handed to a stage executor.
#[derive(Debug)]
pub struct StageAction {
    pub kind: StageKind,
    /// Queue index of the last message in the batch; the cursor advances to
    /// it when the executor succeeds.
    pub end_index: u64,
    pub messages: Vec<PipelineMessage>,
    /// Target leader for forward batches.
    pub leader: NodeId,
    /// The channel's receiver tag at schedule time (deliver batches).
    pub tag_key: Option<String>,
}

/// What a stage executor observed; applied back under the channel lock.
#[derive(Debug, Default)]
pub struct StageOutcome {
    pub ok: bool,
    /// message_id → recovered plaintext.
    pub decrypted: Vec<(u64, Bytes)>,
    /// Messages dropped with an error ack.
    pub failures: Vec<u64>,
    /// message_id → assigned per-channel sequence.
    pub seqs: Vec<(u64, u64)>,
    /// Fresh receiver tag minted during delivery.
    pub new_tag_key: Option<String>,
    /// Leadership learned from a NotLeader rejection.
    pub new_leader: Option<NodeId>,
}

pub struct PipelineChannel {
    pub channel_id: String,
    pub channel_type: u8,
    key: String,
    pub queue: MsgQueue,
    role: PipelineRole,
    pub receiver_tag_key: Option<String>,

    decrypting: bool,
    permission_checking: bool,
    storaging: bool,
    sendacking: bool,
    delivering: bool,
    forwarding: bool,

    storage_max_size: u64,
    deliver_max_size: u64,
    forward_max_size: u64,

    last_activity: Instant,
}

impl PipelineChannel {
    pub fn new(
        channel_id: &str,
        channel_type: u8,
        storage_max_size: u64,
        deliver_max_size: u64,
        forward_max_size: u64,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            channel_type,
            key: channel_key(channel_id, channel_type),
            queue: MsgQueue::new(),
            role: PipelineRole::Unknown,
            receiver_tag_key: None,
            decrypting: false,
            permission_checking: false,
            storaging: false,
            sendacking: false,
            delivering: false,
            forwarding: false,
            storage_max_size,
            deliver_max_size,
            forward_max_size,
            last_activity: Instant::now(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn role(&self) -> PipelineRole {
        self.role
    }

    pub fn enqueue(&mut self, msg: PipelineMessage) -> u64 {
        self.last_activity = Instant::now();
        self.queue.append(msg)
    }

    pub fn become_leader(&mut self) {
        if self.role == PipelineRole::Leader {
            return;
        }
        self.role = PipelineRole::Leader;
        self.reset_cursors();
        info!(channel = %self.key, "pipeline leader");
    }

    pub fn become_proxy(&mut self, leader: NodeId) {
        if self.role == (PipelineRole::Proxy { leader }) {
            return;
        }
        self.role = PipelineRole::Proxy { leader };
        self.reset_cursors();
        info!(channel = %self.key, leader, "pipeline proxy");
    }

    /// Role change: unconsumed messages replay through the new role's stages.
    fn reset_cursors(&mut self) {
        let floor = self.queue.floor();
        self.queue.forwarding_index = floor;
        self.queue.permission_checking_index = floor;
        self.queue.storaging_index = floor;
        self.queue.sendacking_index = floor;
        self.queue.delivering_index = floor;
        self.permission_checking = false;
        self.storaging = false;
        self.sendacking = false;
        self.delivering = false;
        self.forwarding = false;
    }

    pub fn has_ready(&self) -> bool {
        let q = &self.queue;
        if !self.decrypting && q.payload_decrypting_index < q.last_index {
            return true;
        }
        match self.role {
            PipelineRole::Leader => {
                (!self.permission_checking
                    && q.permission_checking_index < q.payload_decrypting_index)
                    || (!self.storaging && q.storaging_index < q.permission_checking_index)
                    || (!self.sendacking && q.sendacking_index < q.storaging_index)
                    || (!self.delivering && q.delivering_index < q.storaging_index)
            }
            PipelineRole::Proxy { .. } => {
                !self.forwarding && q.forwarding_index < q.payload_decrypting_index
            }
            PipelineRole::Unknown => false,
        }
    }

    pub fn ready(&mut self) -> Vec<StageAction> {
        let mut actions = Vec::new();

        if !self.decrypting {
            let msgs = self.queue.slice_with_size(
                self.queue.payload_decrypting_index,
                self.queue.last_index,
                0,
            );
            if !msgs.is_empty() {
                self.decrypting = true;
                actions.push(StageAction {
                    kind: StageKind::Decrypt,
                    end_index: self.queue.payload_decrypting_index + msgs.len() as u64,
                    leader: 0,
                    tag_key: None,
                    messages: msgs,
                });
            }
        }

        match self.role {
            PipelineRole::Leader => {
                if !self.permission_checking {
                    let msgs = self.queue.slice_with_size(
                        self.queue.permission_checking_index,
                        self.queue.payload_decrypting_index,
                        0,
                    );
                    if !msgs.is_empty() {
                        self.permission_checking = true;
                        actions.push(StageAction {
                            kind: StageKind::Permission,
                            end_index: self.queue.permission_checking_index + msgs.len() as u64,
                            leader: 0,
                            tag_key: None,
                            messages: msgs,
                        });
                    }
                }
                if !self.storaging {
                    let msgs = self.queue.slice_with_size(
                        self.queue.storaging_index,
                        self.queue.permission_checking_index,
                        self.storage_max_size,
                    );
                    if !msgs.is_empty() {
                        self.storaging = true;
                        actions.push(StageAction {
                            kind: StageKind::Storage,
                            end_index: self.queue.storaging_index + msgs.len() as u64,
                            leader: 0,
                            tag_key: None,
                            messages: msgs,
                        });
                    }
                }
                if !self.sendacking {
                    let msgs = self.queue.slice_with_size(
                        self.queue.sendacking_index,
                        self.queue.storaging_index,
                        0,
                    );
                    if !msgs.is_empty() {
                        self.sendacking = true;
                        actions.push(StageAction {
                            kind: StageKind::Sendack,
                            end_index: self.queue.sendacking_index + msgs.len() as u64,
                            leader: 0,
                            tag_key: None,
                            messages: msgs,
                        });
                    }
                }
                if !self.delivering {
                    let msgs = self.queue.slice_with_size(
                        self.queue.delivering_index,
                        self.queue.storaging_index,
                        self.deliver_max_size,
                    );
                    if !msgs.is_empty() {
                        self.delivering = true;
                        actions.push(StageAction {
                            kind: StageKind::Deliver,
                            end_index: self.queue.delivering_index + msgs.len() as u64,
                            leader: 0,
                            tag_key: self.receiver_tag_key.clone(),
                            messages: msgs,
                        });
                    }
                }
            }
            PipelineRole::Proxy { leader } => {
                if !self.forwarding {
                    let msgs = self.queue.slice_with_size(
                        self.queue.forwarding_index,
                        self.queue.payload_decrypting_index,
                        self.forward_max_size,
                    );
                    if !msgs.is_empty() {
                        self.forwarding = true;
                        actions.push(StageAction {
                            kind: StageKind::Forward,
                            end_index: self.queue.forwarding_index + msgs.len() as u64,
                            leader,
                            tag_key: None,
                            messages: msgs,
                        });
                    }
                }
            }
            PipelineRole::Unknown => {}
        }

        actions
    }

    pub fn apply_outcome(&mut self, kind: StageKind, end_index: u64, outcome: StageOutcome) {
        self.last_activity = Instant::now();
        match kind {
            StageKind::Decrypt => self.decrypting = false,
            StageKind::Permission => self.permission_checking = false,
            StageKind::Storage => self.storaging = false,
            StageKind::Sendack => self.sendacking = false,
            StageKind::Deliver => self.delivering = false,
            StageKind::Forward => self.forwarding = false,
        }
        for (id, payload) in outcome.decrypted {
            self.queue.set_payload(id, payload);
        }
        for id in outcome.failures {
            self.queue.mark_failed(id);
        }
        for (id, seq) in outcome.seqs {
            self.queue.set_seq(id, seq);
        }
        if let Some(tag_key) = outcome.new_tag_key {
            self.receiver_tag_key = Some(tag_key);
        }
        if let Some(leader) = outcome.new_leader {
            self.become_proxy(leader);
            return;
        }
        if !outcome.ok {
            // Flag cleared, cursor untouched: the batch is retried on the
            // next ready cycle.
            return;
        }
        let q = &mut self.queue;
        match kind {
            StageKind::Decrypt => {
                q.payload_decrypting_index = q.payload_decrypting_index.max(end_index)
            }
            StageKind::Permission => {
                q.permission_checking_index = q.permission_checking_index.max(end_index)
            }
            StageKind::Storage => q.storaging_index = q.storaging_index.max(end_index),
            StageKind::Sendack => q.sendacking_index = q.sendacking_index.max(end_index),
            StageKind::Deliver => q.delivering_index = q.delivering_index.max(end_index),
            StageKind::Forward => q.forwarding_index = q.forwarding_index.max(end_index),
        }
        self.release_consumed();
    }

    fn release_consumed(&mut self) {
        let q = &self.queue;
        let consumed = match self.role {
            PipelineRole::Leader => q
                .payload_decrypting_index
                .min(q.sendacking_index)
                .min(q.delivering_index),
            PipelineRole::Proxy { .. } => q.payload_decrypting_index.min(q.forwarding_index),
            PipelineRole::Unknown => return,
        };
        self.queue.truncate_to(consumed);
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.queue.is_empty() && self.last_activity.elapsed() >= timeout
    }

    /// Stage-cursor invariants; used by tests and debug assertions.
    pub fn cursors_consistent(&self) -> bool {
        let q = &self.queue;
        q.payload_decrypting_index <= q.last_index
            && q.forwarding_index <= q.payload_decrypting_index
            && q.permission_checking_index <= q.payload_decrypting_index
            && q.storaging_index <= q.permission_checking_index
            && q.sendacking_index <= q.storaging_index
            && q.delivering_index <= q.storaging_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg(id: u64) -> PipelineMessage {
        PipelineMessage {
            message_id: id,
            message_seq: 0,
            from_uid: "alice".into(),
            from_conn_id: 7,
            from_node_id: 1,
            is_encrypt: false,
            payload: Bytes::from_static(b"hi"),
            failed: false,
        }
    }

    fn ok_outcome() -> StageOutcome {
        StageOutcome {
            ok: true,
            ..Default::default()
        }
    }

    fn leader_channel() -> PipelineChannel {
        let mut ch = PipelineChannel::new("room", 2, 1 << 20, 1 << 20, 1 << 20);
        ch.become_leader();
        ch
    }

    #[test]
    fn leader_stages_progress_in_order() {
        let mut ch = leader_channel();
        ch.enqueue(msg(1));
        ch.enqueue(msg(2));

        // Only decrypt is eligible first.
        let actions = ch.ready();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, StageKind::Decrypt);
        assert_eq!(actions[0].messages.len(), 2);
        assert!(ch.cursors_consistent());

        // While decrypt is in flight nothing else schedules.
        assert!(ch.ready().is_empty());

        ch.apply_outcome(StageKind::Decrypt, 2, ok_outcome());
        let actions = ch.ready();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, StageKind::Permission);

        ch.apply_outcome(StageKind::Permission, 2, ok_outcome());
        let actions = ch.ready();
        assert_eq!(actions[0].kind, StageKind::Storage);

        let mut stored = ok_outcome();
        stored.seqs = vec![(1, 1), (2, 2)];
        ch.apply_outcome(StageKind::Storage, 2, stored);

        // Sendack and deliver run in parallel after storage.
        let actions = ch.ready();
        let kinds: Vec<StageKind> = actions.iter().map(|a| a.kind).collect();
        assert!(kinds.contains(&StageKind::Sendack));
        assert!(kinds.contains(&StageKind::Deliver));
        assert_eq!(actions[0].messages[0].message_seq, 1);

        ch.apply_outcome(StageKind::Sendack, 2, ok_outcome());
        ch.apply_outcome(StageKind::Deliver, 2, ok_outcome());
        assert!(ch.cursors_consistent());
        assert!(!ch.has_ready());
        assert!(ch.queue.is_empty(), "consumed prefix released");
    }

    #[test]
    fn failed_stage_retries_without_advancing() {
        let mut ch = leader_channel();
        ch.enqueue(msg(1));
        ch.apply_outcome(StageKind::Decrypt, 1, ok_outcome());
        ch.apply_outcome(StageKind::Permission, 1, ok_outcome());

        let actions = ch.ready();
        assert_eq!(actions[0].kind, StageKind::Storage);
        ch.apply_outcome(
            StageKind::Storage,
            1,
            StageOutcome {
                ok: false,
                ..Default::default()
            },
        );
        assert_eq!(ch.queue.storaging_index, 0);
        // Retried on the next cycle.
        let actions = ch.ready();
        assert_eq!(actions[0].kind, StageKind::Storage);
    }

    #[test]
    fn proxy_forwards_after_decrypt() {
        let mut ch = PipelineChannel::new("room", 2, 1 << 20, 1 << 20, 1 << 20);
        ch.become_proxy(9);
        ch.enqueue(msg(1));

        let actions = ch.ready();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].kind, StageKind::Decrypt);
        ch.apply_outcome(StageKind::Decrypt, 1, ok_outcome());

        let actions = ch.ready();
        assert_eq!(actions[0].kind, StageKind::Forward);
        assert_eq!(actions[0].leader, 9);
        ch.apply_outcome(StageKind::Forward, 1, ok_outcome());
        assert!(!ch.has_ready());
    }

    #[test]
    fn not_leader_outcome_flips_role() {
        let mut ch = leader_channel();
        ch.enqueue(msg(1));
        ch.apply_outcome(StageKind::Decrypt, 1, ok_outcome());
        ch.apply_outcome(StageKind::Permission, 1, ok_outcome());
        ch.apply_outcome(
            StageKind::Storage,
            1,
            StageOutcome {
                ok: false,
                new_leader: Some(4),
                ..Default::default()
            },
        );
        assert_eq!(ch.role(), PipelineRole::Proxy { leader: 4 });
        // The undelivered message now goes through the forward path.
        let actions = ch.ready();
        assert_eq!(actions[0].kind, StageKind::Forward);
    }

    #[test]
    fn failed_messages_are_skipped_by_later_stages() {
        let mut ch = leader_channel();
        ch.enqueue(msg(1));
        ch.enqueue(msg(2));
        let mut out = ok_outcome();
        out.failures = vec![1];
        ch.apply_outcome(StageKind::Decrypt, 2, out);
        let actions = ch.ready();
        let perm = &actions[0];
        assert_eq!(perm.kind, StageKind::Permission);
        // Both travel the queue, but the failed one carries the flag.
        assert!(perm.messages[0].failed);
        assert!(!perm.messages[1].failed);
    }
}
