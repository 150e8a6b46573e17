//! Node assembly: storage, transport, reactors, managers, HTTP API.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api;
use crate::cluster::reactor::Reactor;
use crate::cluster::shard::LeaderChange;
use crate::cluster::slot::SlotCommand;
use crate::cluster::transport::{Frame, FrameKind, TcpTransport};
use crate::cluster::{Cluster, ClusterTransport, InboundHandler, ShardIdent};
use crate::conversation::ConversationManager;
use crate::error::{ClusterError, ClusterResult};
use crate::id::MessageIdGen;
use crate::key::channel_key;
use crate::options::{NodeOptions, PeerSpec};
use crate::pipeline::tag::TagRegistry;
use crate::pipeline::worker::PipelineCtx;
use crate::pipeline::PipelineManager;
use crate::sinks::{AckSink, DeliverSink, LogAckSink, LogDeliverSink, PayloadDecryptor, PlainDecryptor};
use crate::store::Store;

pub struct Node {
    pub opts: Arc<NodeOptions>,
    pub store: Arc<Store>,
    pub cluster: Arc<Cluster>,
    pub reactor: Arc<Reactor>,
    pub pipeline: Arc<PipelineManager>,
    pub pipeline_ctx: Arc<PipelineCtx>,
    pub conversations: Arc<ConversationManager>,
    pub tags: Arc<TagRegistry>,
    pub transport: Arc<TcpTransport>,
    pub http: reqwest::Client,
    api_addr: SocketAddr,
    cluster_addr: SocketAddr,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    pub async fn start(opts: NodeOptions) -> Result<Arc<Self>> {
        Self::start_with_sinks(
            opts,
            Arc::new(LogDeliverSink),
            Arc::new(LogAckSink),
            Arc::new(PlainDecryptor),
        )
        .await
    }

    pub async fn start_with_sinks(
        mut opts: NodeOptions,
        deliver_sink: Arc<dyn DeliverSink>,
        ack_sink: Arc<dyn AckSink>,
        decryptor: Arc<dyn PayloadDecryptor>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&opts.data_dir).context("create data dir")?;

        let api_listener = TcpListener::bind(opts.listen_api)
            .await
            .context("bind api listener")?;
        let api_addr = api_listener.local_addr()?;
        let cluster_listener = TcpListener::bind(opts.listen_cluster)
            .await
            .context("bind cluster listener")?;
        let cluster_addr = cluster_listener.local_addr()?;

        if opts.peers.is_empty() {
            // Single-node run: the member table is just us.
            opts.peers.push(PeerSpec {
                id: opts.node_id,
                addr: cluster_addr,
                api_url: format!("http://{api_addr}"),
            });
        }
        opts.validate()?;
        let opts = Arc::new(opts);

        let store = Arc::new(
            Store::open(opts.data_dir.join("store"), opts.db_shard_count)
                .context("open store")?,
        );
        let transport = TcpTransport::new(opts.node_id, opts.cluster_token.clone());
        let transport_dyn: Arc<dyn ClusterTransport> = transport.clone();
        let reactor = Reactor::start(opts.reactor_subs, opts.tick_interval);
        let id_gen = Arc::new(MessageIdGen::new(opts.node_id));
        let (cluster, leader_rx) = Cluster::new(
            opts.clone(),
            store.clone(),
            reactor.clone(),
            transport_dyn,
            id_gen.clone(),
        );
        cluster.bootstrap()?;

        let conversations = ConversationManager::new(16);
        let tags = TagRegistry::new();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build http client")?;

        let pipeline_ctx = Arc::new(PipelineCtx {
            opts: opts.clone(),
            store: store.clone(),
            cluster: cluster.clone(),
            conversations: conversations.clone(),
            tags: tags.clone(),
            deliver_sink,
            ack_sink,
            decryptor,
            http: http.clone(),
        });
        let pipeline = PipelineManager::start(
            pipeline_ctx.clone(),
            id_gen,
            opts.reactor_subs,
            opts.channel_idle_timeout,
        );

        for peer in &opts.peers {
            if peer.id != opts.node_id {
                transport.connect_peer(peer.id, peer.addr);
            }
        }
        let inbound: Arc<dyn InboundHandler> = cluster.clone();
        let listener_task = transport.spawn_listener(cluster_listener, inbound);

        let node = Arc::new(Self {
            opts: opts.clone(),
            store,
            cluster,
            reactor,
            pipeline,
            pipeline_ctx,
            conversations,
            tags,
            transport,
            http,
            api_addr,
            cluster_addr,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(vec![listener_task]),
        });

        let app = api::router(node.clone());
        let api_shutdown = node.shutdown.clone();
        let api_task = tokio::spawn(async move {
            let serve = axum::serve(api_listener, app)
                .with_graceful_shutdown(async move { api_shutdown.cancelled().await });
            if let Err(err) = serve.await {
                error!(error = %err, "api server exited");
            }
        });
        let leader_task = tokio::spawn(leader_change_loop(node.clone(), leader_rx));
        let flush_task = tokio::spawn(conversation_flush_loop(node.clone()));
        {
            let mut tasks = node.tasks.lock().unwrap();
            tasks.push(api_task);
            tasks.push(leader_task);
            tasks.push(flush_task);
        }

        info!(
            node = opts.node_id,
            api = %api_addr,
            cluster = %cluster_addr,
            "plume node started"
        );
        Ok(node)
    }

    pub fn api_addr(&self) -> SocketAddr {
        self.api_addr
    }

    pub fn cluster_addr(&self) -> SocketAddr {
        self.cluster_addr
    }

    /// Publish a message into a channel on behalf of a local connection.
    pub fn send_channel_message(
        &self,
        from_uid: &str,
        from_conn_id: u64,
        channel_id: &str,
        channel_type: u8,
        is_encrypt: bool,
        payload: Bytes,
    ) -> Result<u64> {
        self.pipeline.send_message(
            from_uid,
            from_conn_id,
            channel_id,
            channel_type,
            is_encrypt,
            payload,
        )
    }

    pub async fn add_subscribers(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> ClusterResult<()> {
        let cmd = SlotCommand::AddSubscribers {
            channel_id: channel_id.to_string(),
            channel_type,
            uids,
        };
        self.cluster.propose_slot_command(channel_id, &cmd).await
    }

    pub async fn add_denylist(
        &self,
        channel_id: &str,
        channel_type: u8,
        uids: Vec<String>,
    ) -> ClusterResult<()> {
        let cmd = SlotCommand::AddDenylist {
            channel_id: channel_id.to_string(),
            channel_type,
            uids,
        };
        self.cluster.propose_slot_command(channel_id, &cmd).await
    }

    pub async fn set_user_key(&self, uid: &str, material: Vec<u8>) -> ClusterResult<()> {
        let cmd = SlotCommand::SetUserKey {
            uid: uid.to_string(),
            material,
        };
        self.cluster.propose_slot_command(uid, &cmd).await
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cluster.stop();
        self.pipeline.stop();
        self.reactor.stop();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!(node = self.opts.node_id, "plume node stopped");
    }
}

/// Propagate leadership observations: keep channel configs persisted and
/// broadcast, and keep the pipeline's role in step with the replica layer.
async fn leader_change_loop(node: Arc<Node>, mut rx: mpsc::UnboundedReceiver<LeaderChange>) {
    let shutdown = node.shutdown.clone();
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => return,
            change = rx.recv() => match change {
                Some(c) => c,
                None => return,
            },
        };
        let ShardIdent::Channel {
            channel_id,
            channel_type,
        } = change.ident
        else {
            continue;
        };
        node.pipeline
            .update_leader(&channel_id, channel_type, change.leader);

        if change.leader != node.opts.node_id {
            continue;
        }
        // As the new leader, rewrite the config and tell the other replicas.
        let config = match node.store.channel_config(&channel_id, channel_type) {
            Ok(Some(mut cfg)) => {
                if cfg.leader_id == change.leader && cfg.term == change.term {
                    continue;
                }
                cfg.leader_id = change.leader;
                cfg.term = change.term;
                cfg
            }
            Ok(None) => continue,
            Err(err) => {
                warn!(%channel_id, error = %err, "config load failed on leader change");
                continue;
            }
        };
        if let Err(err) = node.store.save_channel_config(&config) {
            warn!(%channel_id, error = %err, "config save failed on leader change");
            continue;
        }
        let payload = match serde_json::to_vec(&config) {
            Ok(p) => p,
            Err(err) => {
                warn!(%channel_id, error = %err, "config encode failed");
                continue;
            }
        };
        let shard_no = channel_key(&channel_id, channel_type);
        for replica in &config.replicas {
            if *replica == node.opts.node_id {
                continue;
            }
            node.transport.send(
                *replica,
                Frame {
                    kind: FrameKind::ConfigMsg,
                    shard_no: shard_no.clone(),
                    payload: Bytes::from(payload.clone()),
                },
            );
        }
    }
}

/// Fold dirty conversation-cache rows into the replicated store.
async fn conversation_flush_loop(node: Arc<Node>) {
    let shutdown = node.shutdown.clone();
    let mut interval = tokio::time::interval(node.opts.conversation_flush_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }
        for dirty in node.conversations.snapshot_dirty() {
            let cmd = SlotCommand::UpsertConversations {
                uid: dirty.uid.clone(),
                rows: dirty.rows.clone(),
            };
            match node.cluster.propose_slot_command(&dirty.uid, &cmd).await {
                Ok(()) => node.conversations.mark_clean(&dirty.uid, &dirty.stamps),
                Err(ClusterError::NotLeader { .. }) => {
                    // Slot leadership moved; the new leader's cache takes over
                    // and these rows retry if it comes back here.
                }
                Err(err) => {
                    warn!(uid = %dirty.uid, error = %err, "conversation flush failed");
                }
            }
        }
    }
}
