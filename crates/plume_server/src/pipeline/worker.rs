//! Stage executors for the channel pipeline.
//!
//! Each [`StageAction`] runs here, off the channel lock: decrypt and
//! permission checks consult the store, storage proposes into the channel's
//! replicated log, sendack/deliver/forward talk to sinks, peer nodes and the
//! leader. Outcomes are applied back to the channel by the owning sub.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use plume_replica::{Log, NodeId};

use crate::cluster::Cluster;
use crate::conversation::ConversationManager;
use crate::error::ClusterError;
use crate::id::now_secs;
use crate::key::{display_channel_id, participants, CHANNEL_TYPE_PERSON};
use crate::options::NodeOptions;
use crate::sinks::{AckCode, AckSink, DeliverSink, PayloadDecryptor};
use crate::store::{MessageRecord, Store};

use super::channel::{StageAction, StageKind, StageOutcome};
use super::queue::PipelineMessage;
use super::tag::{NodeUsers, ReceiverTag, TagRegistry};

/// Delivery envelope replayed on the receiving node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliverEnvelope {
    pub channel_id: String,
    pub channel_type: u8,
    pub uids: Vec<String>,
    pub messages: Vec<WireMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub message_id: u64,
    pub message_seq: u64,
    pub from_uid: String,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            message_id: self.message_id,
            message_seq: self.message_seq,
            from_uid: self.from_uid.clone(),
            timestamp: self.timestamp,
            payload: Bytes::from(self.payload.clone()),
        }
    }
}

/// Proxy → leader batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    pub channel_id: String,
    pub channel_type: u8,
    pub messages: Vec<ForwardMessage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardMessage {
    pub message_id: u64,
    pub from_uid: String,
    pub from_conn_id: u64,
    pub from_node_id: NodeId,
    pub payload: Vec<u8>,
}

/// Leader → origin-node acknowledgements.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckEnvelope {
    pub acks: Vec<WireAck>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireAck {
    pub conn_id: u64,
    pub message_id: u64,
    pub message_seq: u64,
    pub code: AckCode,
}

pub struct PipelineCtx {
    pub opts: Arc<NodeOptions>,
    pub store: Arc<Store>,
    pub cluster: Arc<Cluster>,
    pub conversations: Arc<ConversationManager>,
    pub tags: Arc<TagRegistry>,
    pub deliver_sink: Arc<dyn DeliverSink>,
    pub ack_sink: Arc<dyn AckSink>,
    pub decryptor: Arc<dyn PayloadDecryptor>,
    pub http: reqwest::Client,
}

impl PipelineCtx {
    pub async fn execute(
        &self,
        channel_id: &str,
        channel_type: u8,
        action: &StageAction,
    ) -> StageOutcome {
        match action.kind {
            StageKind::Decrypt => self.run_decrypt(action).await,
            StageKind::Permission => self.run_permission(channel_id, channel_type, action).await,
            StageKind::Storage => self.run_storage(channel_id, channel_type, action).await,
            StageKind::Sendack => self.run_sendack(action).await,
            StageKind::Deliver => self.run_deliver(channel_id, channel_type, action).await,
            StageKind::Forward => self.run_forward(channel_id, channel_type, action).await,
        }
    }

    async fn run_decrypt(&self, action: &StageAction) -> StageOutcome {
        let mut outcome = StageOutcome {
            ok: true,
            ..Default::default()
        };
        for msg in &action.messages {
            if msg.failed || !msg.is_encrypt {
                continue;
            }
            let material = match self.store.user_key(&msg.from_uid) {
                Ok(m) => m,
                Err(err) => {
                    warn!(uid = %msg.from_uid, error = %err, "key material read failed");
                    outcome.ok = false;
                    return outcome;
                }
            };
            match self
                .decryptor
                .decrypt(&msg.from_uid, material.as_deref(), &msg.payload)
            {
                Ok(plain) => outcome.decrypted.push((msg.message_id, plain)),
                Err(err) => {
                    debug!(uid = %msg.from_uid, message_id = msg.message_id, error = %err, "payload decrypt failed");
                    outcome.failures.push(msg.message_id);
                    self.send_ack(msg, 0, AckCode::DecryptFailed).await;
                }
            }
        }
        outcome
    }

    async fn run_permission(
        &self,
        channel_id: &str,
        channel_type: u8,
        action: &StageAction,
    ) -> StageOutcome {
        let mut outcome = StageOutcome {
            ok: true,
            ..Default::default()
        };
        for msg in &action.messages {
            if msg.failed {
                continue;
            }
            match self.check_permission(channel_id, channel_type, &msg.from_uid) {
                Ok(true) => {}
                Ok(false) => {
                    outcome.failures.push(msg.message_id);
                    self.send_ack(msg, 0, AckCode::PermissionDenied).await;
                }
                Err(err) => {
                    warn!(channel_id, error = %err, "permission check failed");
                    outcome.ok = false;
                    return outcome;
                }
            }
        }
        outcome
    }

    fn check_permission(&self, channel_id: &str, channel_type: u8, uid: &str) -> Result<bool> {
        if self.store.is_denied(channel_id, channel_type, uid)? {
            return Ok(false);
        }
        if channel_type == CHANNEL_TYPE_PERSON {
            let allowed = participants(channel_id)
                .map(|(a, b)| a == uid || b == uid)
                .unwrap_or(false);
            return Ok(allowed);
        }
        self.store.is_subscriber(channel_id, channel_type, uid)
    }

    async fn run_storage(
        &self,
        channel_id: &str,
        channel_type: u8,
        action: &StageAction,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let msgs: Vec<&PipelineMessage> =
            action.messages.iter().filter(|m| !m.failed).collect();
        if msgs.is_empty() {
            outcome.ok = true;
            return outcome;
        }
        let now = now_secs();
        let logs: Vec<Log> = msgs
            .iter()
            .map(|m| {
                let record = MessageRecord {
                    message_id: m.message_id,
                    message_seq: 0,
                    from_uid: m.from_uid.clone(),
                    timestamp: now,
                    payload: m.payload.clone(),
                };
                Log {
                    index: 0,
                    term: 0,
                    id: m.message_id,
                    data: record.encode(),
                }
            })
            .collect();

        match self
            .cluster
            .propose_channel_messages(channel_id, channel_type, logs)
            .await
        {
            Ok(items) => {
                outcome.ok = true;
                outcome.seqs = items.into_iter().map(|i| (i.message_id, i.index)).collect();
            }
            Err(ClusterError::NotLeader { leader, .. }) => {
                debug!(channel_id, leader, "storage hit non-leader, switching role");
                if leader != 0 && leader != self.opts.node_id {
                    outcome.new_leader = Some(leader);
                }
            }
            Err(err) => {
                // A timed-out proposal may still commit; retrying is
                // at-least-once and consumers dedupe on message id.
                warn!(channel_id, error = %err, "channel storage propose failed");
            }
        }
        outcome
    }

    async fn run_sendack(&self, action: &StageAction) -> StageOutcome {
        let mut remote: Vec<(NodeId, WireAck)> = Vec::new();
        for msg in &action.messages {
            if msg.failed {
                // Error acks were emitted by the failing stage.
                continue;
            }
            if msg.from_node_id == self.opts.node_id {
                self.ack_sink
                    .ack(msg.from_conn_id, msg.message_id, msg.message_seq, AckCode::Ok);
            } else {
                remote.push((
                    msg.from_node_id,
                    WireAck {
                        conn_id: msg.from_conn_id,
                        message_id: msg.message_id,
                        message_seq: msg.message_seq,
                        code: AckCode::Ok,
                    },
                ));
            }
        }
        for node in dedup_nodes(remote.iter().map(|(n, _)| *n)) {
            let envelope = AckEnvelope {
                acks: remote
                    .iter()
                    .filter(|(n, _)| *n == node)
                    .map(|(_, a)| a.clone())
                    .collect(),
            };
            if let Err(err) = self.post_node(node, "/cluster/channel/ack", &envelope).await {
                warn!(node, error = %err, "remote ack failed");
            }
        }
        StageOutcome {
            ok: true,
            ..Default::default()
        }
    }

    async fn run_deliver(
        &self,
        channel_id: &str,
        channel_type: u8,
        action: &StageAction,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let records: Vec<MessageRecord> = action
            .messages
            .iter()
            .filter(|m| !m.failed)
            .map(|m| MessageRecord {
                message_id: m.message_id,
                message_seq: m.message_seq,
                from_uid: m.from_uid.clone(),
                timestamp: now_secs(),
                payload: m.payload.clone(),
            })
            .collect();
        if records.is_empty() {
            outcome.ok = true;
            return outcome;
        }

        let tag = match action.tag_key.as_deref().and_then(|k| self.tags.get(k)) {
            Some(tag) => tag,
            None => match self.make_receiver_tag(channel_id, channel_type) {
                Ok(tag) => {
                    // An empty subscriber set is not worth pinning; rebuild
                    // on the next delivery in case members arrived late.
                    if tag.nodes.is_empty() {
                        self.tags.release(&tag.key);
                    } else {
                        outcome.new_tag_key = Some(tag.key.clone());
                    }
                    tag
                }
                Err(err) => {
                    warn!(channel_id, error = %err, "receiver tag build failed");
                    return outcome;
                }
            },
        };

        let wire: Vec<WireMessage> = records
            .iter()
            .map(|r| WireMessage {
                message_id: r.message_id,
                message_seq: r.message_seq,
                from_uid: r.from_uid.clone(),
                timestamp: r.timestamp,
                payload: r.payload.to_vec(),
            })
            .collect();

        let mut all_ok = true;
        for entry in &tag.nodes {
            if entry.node_id == self.opts.node_id {
                self.deliver_local(channel_id, channel_type, &entry.uids, &records);
                continue;
            }
            let envelope = DeliverEnvelope {
                channel_id: channel_id.to_string(),
                channel_type,
                uids: entry.uids.clone(),
                messages: wire.clone(),
            };
            if let Err(err) = self
                .post_node(entry.node_id, "/cluster/channel/deliver", &envelope)
                .await
            {
                warn!(node = entry.node_id, channel_id, error = %err, "remote deliver failed");
                all_ok = false;
            }
        }
        outcome.ok = all_ok;
        outcome
    }

    /// Group the channel's subscribers by the slot leader owning each uid.
    fn make_receiver_tag(
        &self,
        channel_id: &str,
        channel_type: u8,
    ) -> Result<Arc<ReceiverTag>> {
        let subscribers: Vec<String> = if channel_type == CHANNEL_TYPE_PERSON {
            let (a, b) = participants(channel_id).context("person channel without fake id")?;
            vec![a, b]
        } else {
            self.store.subscribers(channel_id, channel_type)?
        };
        let mut nodes: Vec<NodeUsers> = Vec::new();
        for uid in subscribers {
            let node_id = self.cluster.slot_leader_of(&uid);
            match nodes.iter().position(|n| n.node_id == node_id) {
                Some(idx) => nodes[idx].uids.push(uid),
                None => nodes.push(NodeUsers {
                    node_id,
                    uids: vec![uid],
                }),
            }
        }
        Ok(self.tags.insert(nodes))
    }

    /// Local leg of a delivery: update conversation state for every resident
    /// uid, then replay to their connections.
    pub fn deliver_local(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: &[String],
        records: &[MessageRecord],
    ) {
        for uid in uids {
            self.conversations
                .update_on_deliver(uid, channel_id, channel_type, records);
            let display = display_channel_id(uid, channel_id, channel_type);
            self.deliver_sink
                .deliver(uid, &display, channel_type, records);
        }
    }

    /// Apply a batch of acknowledgements arriving from a channel leader.
    pub fn apply_acks(&self, envelope: &AckEnvelope) {
        for ack in &envelope.acks {
            self.ack_sink
                .ack(ack.conn_id, ack.message_id, ack.message_seq, ack.code);
        }
    }

    async fn run_forward(
        &self,
        channel_id: &str,
        channel_type: u8,
        action: &StageAction,
    ) -> StageOutcome {
        let mut outcome = StageOutcome::default();
        let messages: Vec<ForwardMessage> = action
            .messages
            .iter()
            .filter(|m| !m.failed)
            .map(|m| ForwardMessage {
                message_id: m.message_id,
                from_uid: m.from_uid.clone(),
                from_conn_id: m.from_conn_id,
                from_node_id: m.from_node_id,
                payload: m.payload.to_vec(),
            })
            .collect();
        if messages.is_empty() {
            outcome.ok = true;
            return outcome;
        }
        if action.leader == 0 {
            return outcome;
        }
        let envelope = ForwardEnvelope {
            channel_id: channel_id.to_string(),
            channel_type,
            messages,
        };
        match self
            .post_node(action.leader, "/cluster/channel/forward", &envelope)
            .await
        {
            Ok(()) => outcome.ok = true,
            Err(err) => {
                warn!(channel_id, leader = action.leader, error = %err, "forward failed");
            }
        }
        outcome
    }

    async fn send_ack(&self, msg: &PipelineMessage, seq: u64, code: AckCode) {
        if msg.from_node_id == self.opts.node_id {
            self.ack_sink.ack(msg.from_conn_id, msg.message_id, seq, code);
            return;
        }
        let envelope = AckEnvelope {
            acks: vec![WireAck {
                conn_id: msg.from_conn_id,
                message_id: msg.message_id,
                message_seq: seq,
                code,
            }],
        };
        if let Err(err) = self
            .post_node(msg.from_node_id, "/cluster/channel/ack", &envelope)
            .await
        {
            warn!(node = msg.from_node_id, error = %err, "remote error ack failed");
        }
    }

    async fn post_node<T: Serialize>(&self, node: NodeId, path: &str, body: &T) -> Result<()> {
        let base = self
            .opts
            .api_url_of(node)
            .with_context(|| format!("no api address for node {node}"))?;
        let url = format!("{base}{path}");
        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("post {url}"))?;
        anyhow::ensure!(
            resp.status().is_success(),
            "peer {node} answered {} for {path}",
            resp.status()
        );
        Ok(())
    }
}

fn dedup_nodes(iter: impl Iterator<Item = NodeId>) -> Vec<NodeId> {
    let mut out: Vec<NodeId> = Vec::new();
    for node in iter {
        if !out.contains(&node) {
            out.push(node);
        }
    }
    out
}
