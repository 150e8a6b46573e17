//! Channel message pipeline: manager and worker subs.
//!
//! Channels are sharded over a handful of subs by channel key. A sub owns its
//! channels' state machines, collects ready stage actions, and spawns each
//! action onto the runtime; outcomes are applied back under the channel lock.
//! Failed stages retry on the tick cadence rather than hot-looping.

pub mod channel;
pub mod queue;
pub mod tag;
pub mod worker;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use plume_replica::NodeId;

use crate::id::MessageIdGen;
use crate::key::{channel_key, internal_channel_id};

use channel::{PipelineChannel, PipelineRole, StageAction};
use queue::PipelineMessage;
use worker::{ForwardEnvelope, PipelineCtx};

pub struct PipelineManager {
    ctx: Arc<PipelineCtx>,
    subs: Vec<Arc<PipelineSub>>,
    id_gen: Arc<MessageIdGen>,
    shutdown: CancellationToken,
}

struct PipelineSub {
    notify: Notify,
    channels: Mutex<HashMap<String, PipelineChannel>>,
}

impl PipelineManager {
    pub fn start(
        ctx: Arc<PipelineCtx>,
        id_gen: Arc<MessageIdGen>,
        sub_count: usize,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let subs: Vec<Arc<PipelineSub>> = (0..sub_count.max(1))
            .map(|_| {
                Arc::new(PipelineSub {
                    notify: Notify::new(),
                    channels: Mutex::new(HashMap::new()),
                })
            })
            .collect();
        let manager = Arc::new(Self {
            ctx: ctx.clone(),
            subs: subs.clone(),
            id_gen,
            shutdown: shutdown.clone(),
        });
        for sub in subs {
            tokio::spawn(run_sub(
                sub,
                ctx.clone(),
                idle_timeout,
                shutdown.clone(),
            ));
        }
        manager
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn sub_for(&self, key: &str) -> &Arc<PipelineSub> {
        let idx = crc32fast::hash(key.as_bytes()) as usize % self.subs.len();
        &self.subs[idx]
    }

    /// Ingest a locally-published message. Person channels are remapped to
    /// their fake channel id on entry; the returned message id is what the
    /// eventual ack references.
    pub fn send_message(
        &self,
        from_uid: &str,
        from_conn_id: u64,
        wire_channel_id: &str,
        channel_type: u8,
        is_encrypt: bool,
        payload: Bytes,
    ) -> Result<u64> {
        let channel_id = internal_channel_id(from_uid, wire_channel_id, channel_type);
        let message_id = self.id_gen.next();
        let msg = PipelineMessage {
            message_id,
            message_seq: 0,
            from_uid: from_uid.to_string(),
            from_conn_id,
            from_node_id: self.ctx.opts.node_id,
            is_encrypt,
            payload,
            failed: false,
        };
        self.enqueue(&channel_id, channel_type, msg)?;
        Ok(message_id)
    }

    /// Leader-side ingestion of a proxy's forwarded batch. Origin identity is
    /// preserved so acks route back to the origin node.
    pub fn ingest_forwarded(&self, envelope: &ForwardEnvelope) -> Result<()> {
        for fwd in &envelope.messages {
            let msg = PipelineMessage {
                message_id: fwd.message_id,
                message_seq: 0,
                from_uid: fwd.from_uid.clone(),
                from_conn_id: fwd.from_conn_id,
                from_node_id: fwd.from_node_id,
                // Proxies decrypt before forwarding.
                is_encrypt: false,
                payload: Bytes::from(fwd.payload.clone()),
                failed: false,
            };
            self.enqueue(&envelope.channel_id, envelope.channel_type, msg)?;
        }
        Ok(())
    }

    fn enqueue(&self, channel_id: &str, channel_type: u8, msg: PipelineMessage) -> Result<()> {
        let key = channel_key(channel_id, channel_type);
        let sub = self.sub_for(&key);
        {
            let mut channels = sub.channels.lock().unwrap();
            if let Some(ch) = channels.get_mut(&key) {
                ch.enqueue(msg);
            } else {
                let mut created = self.new_channel(channel_id, channel_type)?;
                created.enqueue(msg);
                channels.insert(key.clone(), created);
            }
        }
        sub.notify.notify_one();
        Ok(())
    }

    fn new_channel(&self, channel_id: &str, channel_type: u8) -> Result<PipelineChannel> {
        let opts = &self.ctx.opts;
        let mut ch = PipelineChannel::new(
            channel_id,
            channel_type,
            opts.storage_max_size,
            opts.deliver_max_size,
            opts.forward_max_size,
        );
        let leader = self
            .ctx
            .cluster
            .leader_of_channel_for_read(channel_id, channel_type)
            .context("resolve channel leader")?;
        if leader == opts.node_id {
            ch.become_leader();
        } else if leader != 0 {
            ch.become_proxy(leader);
        }
        Ok(ch)
    }

    /// React to a leadership observation from the replica layer.
    pub fn update_leader(&self, channel_id: &str, channel_type: u8, leader: NodeId) {
        let key = channel_key(channel_id, channel_type);
        let sub = self.sub_for(&key);
        let mut channels = sub.channels.lock().unwrap();
        if let Some(ch) = channels.get_mut(&key) {
            if leader == self.ctx.opts.node_id {
                ch.become_leader();
            } else if leader != 0 {
                ch.become_proxy(leader);
            }
            sub.notify.notify_one();
        }
    }

    /// Test/introspection helper: number of live channels.
    pub fn channel_count(&self) -> usize {
        self.subs
            .iter()
            .map(|s| s.channels.lock().unwrap().len())
            .sum()
    }
}

async fn run_sub(
    sub: Arc<PipelineSub>,
    ctx: Arc<PipelineCtx>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        let mut do_tick = false;
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sub.notify.notified() => {}
            _ = interval.tick() => {
                do_tick = true;
            }
        }

        let mut jobs: Vec<(String, String, u8, StageAction)> = Vec::new();
        let mut released: Vec<String> = Vec::new();
        {
            let mut channels = sub.channels.lock().unwrap();
            if do_tick {
                channels.retain(|key, ch| {
                    if ch.is_idle(idle_timeout) {
                        debug!(channel = %key, "evicting idle channel");
                        if let Some(tag) = ch.receiver_tag_key.take() {
                            released.push(tag);
                        }
                        return false;
                    }
                    true
                });
            }
            for (key, ch) in channels.iter_mut() {
                if ch.role() == PipelineRole::Unknown && do_tick {
                    // Config may have been unreachable at creation; retry.
                    match ctx
                        .cluster
                        .leader_of_channel_for_read(&ch.channel_id, ch.channel_type)
                    {
                        Ok(leader) if leader == ctx.opts.node_id => ch.become_leader(),
                        Ok(leader) if leader != 0 => ch.become_proxy(leader),
                        Ok(_) => {}
                        Err(err) => warn!(channel = %key, error = %err, "role resolve failed"),
                    }
                }
                for action in ch.ready() {
                    jobs.push((key.clone(), ch.channel_id.clone(), ch.channel_type, action));
                }
            }
        }
        for tag in released {
            ctx.tags.release(&tag);
        }

        for (key, channel_id, channel_type, action) in jobs {
            let ctx = ctx.clone();
            let sub = sub.clone();
            tokio::spawn(async move {
                let outcome = ctx.execute(&channel_id, channel_type, &action).await;
                let progressed = outcome.ok || outcome.new_leader.is_some();
                let old_tag = {
                    let mut channels = sub.channels.lock().unwrap();
                    match channels.get_mut(&key) {
                        Some(ch) => {
                            let old = if outcome.new_tag_key.is_some() {
                                ch.receiver_tag_key.clone()
                            } else {
                                None
                            };
                            ch.apply_outcome(action.kind, action.end_index, outcome);
                            old
                        }
                        None => None,
                    }
                };
                if let Some(tag) = old_tag {
                    ctx.tags.release(&tag);
                }
                if progressed {
                    // A stuck stage waits for the tick instead of spinning.
                    sub.notify.notify_one();
                }
            });
        }
    }
}
