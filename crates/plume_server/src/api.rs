//! HTTP surface: conversation operations, sync, and the node-internal
//! delivery/forward/ack endpoints.
//!
//! Every user-facing route resolves the uid's slot leader first; on a
//! mismatch the raw body (buffered once up front) is replayed to the leader
//! and the leader's response is mirrored back. Errors come back as
//! `{"msg": ...}` with a 4xx/5xx status.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use plume_replica::NodeId;

use crate::cluster::slot::SlotCommand;
use crate::error::ClusterError;
use crate::id::{now_ms, now_secs};
use crate::key::{channel_key, display_channel_id, internal_channel_id};
use crate::pipeline::worker::{AckEnvelope, DeliverEnvelope, ForwardEnvelope};
use crate::server::Node;
use crate::store::Conversation;

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/conversations/clearUnread", post(clear_unread))
        .route("/conversations/setUnread", post(set_unread))
        .route("/conversations/delete", post(delete_conversation))
        .route("/conversation/sync", post(sync_conversations))
        .route("/conversation/syncMessages", post(sync_messages))
        .route("/cluster/channel/forward", post(cluster_forward))
        .route("/cluster/channel/deliver", post(cluster_deliver))
        .route("/cluster/channel/ack", post(cluster_ack))
        .with_state(node)
}

// ---- request / response bodies --------------------------------------------

#[derive(Debug, Deserialize)]
struct ConversationChannelReq {
    uid: String,
    channel_id: String,
    channel_type: u8,
}

impl ConversationChannelReq {
    fn check(&self) -> Result<(), String> {
        if self.uid.trim().is_empty() {
            return Err("uid cannot be empty".into());
        }
        if self.channel_id.is_empty() || self.channel_type == 0 {
            return Err("channel_id or channel_type cannot be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SetUnreadReq {
    uid: String,
    channel_id: String,
    channel_type: u8,
    #[serde(default)]
    unread: u64,
    /// Only very large channels supply this; the server does not maintain
    /// their conversations.
    #[serde(default, rename = "message_seq")]
    _message_seq: u64,
}

#[derive(Debug, Deserialize)]
struct SyncReq {
    uid: String,
    #[serde(default)]
    version: u64,
    /// `channel_id:channel_type:last_msg_seq|...`
    #[serde(default)]
    last_msg_seqs: String,
    #[serde(default)]
    msg_count: u64,
    #[serde(default)]
    larges: Vec<LargeChannel>,
}

/// Accepted for wire compatibility; very large channels manage their own
/// conversation state client-side.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct LargeChannel {
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    channel_type: u8,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelRecentReq {
    pub channel_id: String,
    pub channel_type: u8,
    #[serde(default)]
    pub last_msg_seq: u64,
}

#[derive(Debug, Deserialize)]
struct SyncMessagesReq {
    uid: String,
    #[serde(default)]
    channels: Vec<ChannelRecentReq>,
    #[serde(default)]
    msg_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageResp {
    pub message_id: u64,
    pub message_seq: u64,
    pub from_uid: String,
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelRecentMessage {
    pub channel_id: String,
    pub channel_type: u8,
    pub messages: Vec<MessageResp>,
}

#[derive(Debug, Serialize)]
struct SyncConversationResp {
    channel_id: String,
    channel_type: u8,
    unread: u64,
    timestamp: u64,
    readed_to_msg_seq: u64,
    last_msg_seq: u64,
    version: u64,
    recents: Vec<MessageResp>,
}

// ---- handlers --------------------------------------------------------------

async fn clear_unread(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let req: ConversationChannelReq = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Err(msg) = req.check() {
        return error_response(StatusCode::BAD_REQUEST, &msg);
    }
    match forward_if_not_leader(&node, &req.uid, "/conversations/clearUnread", &body).await {
        Ok(Some(resp)) => return resp,
        Ok(None) => {}
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }

    let fake_channel_id = internal_channel_id(&req.uid, &req.channel_id, req.channel_type);
    let result = async {
        let last_msg_seq = node
            .store
            .last_msg_seq(&channel_key(&fake_channel_id, req.channel_type))?;
        let mut row = node
            .store
            .conversation(&req.uid, &fake_channel_id, req.channel_type)?
            .unwrap_or_else(|| blank_row(&req.uid, &fake_channel_id, req.channel_type));
        if row.readed_to_msg_seq < last_msg_seq {
            row.readed_to_msg_seq = last_msg_seq;
        }
        row.unread_count = 0;
        row.timestamp = now_secs();
        row.version = now_ms();
        anyhow::Ok(row)
    }
    .await;
    let row = match result {
        Ok(row) => row,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    if let Err(err) = persist_row(&node, &req.uid, row).await {
        return cluster_error_response(err);
    }
    node.conversations
        .remove(&req.uid, &fake_channel_id, req.channel_type);
    ok_response()
}

async fn set_unread(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let req: SetUnreadReq = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if req.uid.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "uid cannot be empty");
    }
    if req.channel_id.is_empty() || req.channel_type == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "channel_id or channel_type cannot be empty",
        );
    }
    match forward_if_not_leader(&node, &req.uid, "/conversations/setUnread", &body).await {
        Ok(Some(resp)) => return resp,
        Ok(None) => {}
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }

    let fake_channel_id = internal_channel_id(&req.uid, &req.channel_id, req.channel_type);
    let last_msg_seq = match node
        .store
        .last_msg_seq(&channel_key(&fake_channel_id, req.channel_type))
    {
        Ok(v) => v,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    // Overflowing unread clamps to a single unread message; an empty channel
    // clamps the read watermark at zero rather than wrapping.
    let (unread, readed_to_msg_seq) = if req.unread > last_msg_seq {
        (1u32, last_msg_seq.saturating_sub(1))
    } else if req.unread > 0 {
        (req.unread.min(u32::MAX as u64) as u32, last_msg_seq - req.unread)
    } else {
        (0, last_msg_seq)
    };

    let mut row = match node
        .store
        .conversation(&req.uid, &fake_channel_id, req.channel_type)
    {
        Ok(row) => row.unwrap_or_else(|| blank_row(&req.uid, &fake_channel_id, req.channel_type)),
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };
    row.readed_to_msg_seq = readed_to_msg_seq;
    row.unread_count = unread;
    row.timestamp = now_secs();
    row.version = now_ms();

    if let Err(err) = persist_row(&node, &req.uid, row).await {
        return cluster_error_response(err);
    }
    node.conversations
        .remove(&req.uid, &fake_channel_id, req.channel_type);
    ok_response()
}

async fn delete_conversation(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let req: ConversationChannelReq = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if let Err(msg) = req.check() {
        return error_response(StatusCode::BAD_REQUEST, &msg);
    }
    match forward_if_not_leader(&node, &req.uid, "/conversations/delete", &body).await {
        Ok(Some(resp)) => return resp,
        Ok(None) => {}
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }

    let fake_channel_id = internal_channel_id(&req.uid, &req.channel_id, req.channel_type);
    let cmd = SlotCommand::DeleteConversation {
        uid: req.uid.clone(),
        channel_id: fake_channel_id.clone(),
        channel_type: req.channel_type,
    };
    if let Err(err) = node.cluster.propose_slot_command(&req.uid, &cmd).await {
        return cluster_error_response(err);
    }
    node.conversations
        .remove(&req.uid, &fake_channel_id, req.channel_type);
    ok_response()
}

async fn sync_conversations(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let req: SyncReq = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    if req.uid.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "uid cannot be empty");
    }
    let _ = &req.larges;
    match forward_if_not_leader(&node, &req.uid, "/conversation/sync", &body).await {
        Ok(Some(resp)) => return resp,
        Ok(None) => {}
        Err(err) => return error_response(StatusCode::BAD_GATEWAY, &err.to_string()),
    }

    // Client-supplied per-channel floor, keyed by the wire channel id.
    let client_seqs = parse_last_msg_seqs(&req.last_msg_seqs);

    let mut conversations = match node.store.last_conversations(
        &req.uid,
        req.version,
        node.opts.conversation_user_max_count,
    ) {
        Ok(rows) => rows,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    };

    // Merge the hot cache over the persisted rows.
    let cache = node.conversations.user_cache(&req.uid);
    let mut cache_readed: HashMap<String, u64> = HashMap::new();
    for entry in &cache {
        if entry.readed_to_msg_seq > 0 {
            cache_readed.insert(
                channel_key(&entry.channel_id, entry.channel_type),
                entry.readed_to_msg_seq,
            );
        }
    }
    for entry in &cache {
        let found = conversations
            .iter()
            .position(|c| c.channel_id == entry.channel_id && c.channel_type == entry.channel_type);
        match found {
            Some(idx) => {
                let row = &mut conversations[idx];
                row.readed_to_msg_seq = row.readed_to_msg_seq.max(entry.readed_to_msg_seq);
            }
            None => conversations.push(entry.to_row(&req.uid)),
        }
    }

    let mut resps: Vec<SyncConversationResp> = Vec::with_capacity(conversations.len());
    let mut recent_reqs: Vec<ChannelRecentReq> = Vec::with_capacity(conversations.len());
    for row in &conversations {
        let display = display_channel_id(&req.uid, &row.channel_id, row.channel_type);
        let client_seq = client_seqs
            .get(&format!("{display}-{}", row.channel_type))
            .copied()
            .unwrap_or(0);
        let cache_seq = cache_readed
            .get(&channel_key(&row.channel_id, row.channel_type))
            .copied()
            .unwrap_or(0);
        let effective = row.readed_to_msg_seq.max(client_seq).max(cache_seq);
        recent_reqs.push(ChannelRecentReq {
            channel_id: display.clone(),
            channel_type: row.channel_type,
            last_msg_seq: effective,
        });
        resps.push(SyncConversationResp {
            channel_id: display,
            channel_type: row.channel_type,
            unread: u64::from(row.unread_count),
            timestamp: row.timestamp,
            readed_to_msg_seq: effective,
            last_msg_seq: 0,
            version: row.version,
            recents: Vec::new(),
        });
    }

    if req.msg_count > 0 && !recent_reqs.is_empty() {
        let recents = match recent_messages_for_cluster(
            &node,
            &req.uid,
            req.msg_count as usize,
            recent_reqs,
        )
        .await
        {
            Ok(r) => r,
            Err(err) => {
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string())
            }
        };
        for resp in &mut resps {
            let Some(recent) = recents.iter().find(|r| {
                r.channel_id == resp.channel_id && r.channel_type == resp.channel_type
            }) else {
                continue;
            };
            if let Some(newest) = recent.messages.first() {
                resp.last_msg_seq = newest.message_seq;
                resp.timestamp = newest.timestamp;
                resp.unread = newest.message_seq.saturating_sub(resp.readed_to_msg_seq);
            }
            resp.recents = recent.messages.clone();
        }
    }

    Json(resps).into_response()
}

async fn sync_messages(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let req: SyncMessagesReq = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let msg_count = if req.msg_count == 0 {
        node.opts.sync_default_msg_count
    } else {
        req.msg_count as usize
    };
    match recent_messages_local(&node, &req.uid, msg_count, &req.channels) {
        Ok(results) => Json(results).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn cluster_forward(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let envelope: ForwardEnvelope = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match node.pipeline.ingest_forwarded(&envelope) {
        Ok(()) => ok_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn cluster_deliver(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let envelope: DeliverEnvelope = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let records: Vec<_> = envelope.messages.iter().map(|m| m.to_record()).collect();
    node.pipeline_ctx.deliver_local(
        &envelope.channel_id,
        envelope.channel_type,
        &envelope.uids,
        &records,
    );
    ok_response()
}

async fn cluster_ack(State(node): State<Arc<Node>>, body: Bytes) -> Response {
    let envelope: AckEnvelope = match parse(&body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    node.pipeline_ctx.apply_acks(&envelope);
    ok_response()
}

// ---- recent-message assembly ----------------------------------------------

/// Fan recent-message reads out to each channel's leader, local subset
/// inline, peers in parallel. Any peer failure fails the whole request.
pub async fn recent_messages_for_cluster(
    node: &Arc<Node>,
    uid: &str,
    msg_count: usize,
    reqs: Vec<ChannelRecentReq>,
) -> Result<Vec<ChannelRecentMessage>> {
    let mut local: Vec<ChannelRecentReq> = Vec::new();
    let mut by_peer: HashMap<NodeId, Vec<ChannelRecentReq>> = HashMap::new();
    for req in reqs {
        let fake = internal_channel_id(uid, &req.channel_id, req.channel_type);
        let leader = node
            .cluster
            .leader_of_channel_for_read(&fake, req.channel_type)?;
        if leader == node.opts.node_id {
            local.push(req);
        } else {
            by_peer.entry(leader).or_default().push(req);
        }
    }

    let mut results: Vec<ChannelRecentMessage> = Vec::new();
    let mut fetches = FuturesUnordered::new();
    for (peer, peer_reqs) in by_peer {
        let node = node.clone();
        let uid = uid.to_string();
        fetches.push(async move {
            fetch_peer_messages(&node, peer, &uid, msg_count, peer_reqs).await
        });
    }
    // Peer results are collected on this side only, so the merge is safe.
    while let Some(result) = fetches.next().await {
        results.extend(result?);
    }
    results.extend(recent_messages_local(node, uid, msg_count, &local)?);
    Ok(results)
}

async fn fetch_peer_messages(
    node: &Arc<Node>,
    peer: NodeId,
    uid: &str,
    msg_count: usize,
    reqs: Vec<ChannelRecentReq>,
) -> Result<Vec<ChannelRecentMessage>> {
    let base = node
        .opts
        .api_url_of(peer)
        .with_context(|| format!("no api address for node {peer}"))?;
    let url = format!("{base}/conversation/syncMessages");
    debug!(%url, uid, count = reqs.len(), "fetch peer recent messages");
    let resp = node
        .http
        .post(&url)
        .json(&json!({
            "uid": uid,
            "msg_count": msg_count as u64,
            "channels": reqs,
        }))
        .send()
        .await
        .with_context(|| format!("request {url}"))?;
    anyhow::ensure!(
        resp.status().is_success(),
        "peer {peer} answered {}",
        resp.status()
    );
    let results: Vec<ChannelRecentMessage> = resp.json().await.context("decode peer messages")?;
    Ok(results)
}

/// Newest messages per channel from local storage, reverse-chronological.
pub fn recent_messages_local(
    node: &Arc<Node>,
    uid: &str,
    msg_count: usize,
    reqs: &[ChannelRecentReq],
) -> Result<Vec<ChannelRecentMessage>> {
    let mut out = Vec::with_capacity(reqs.len());
    for req in reqs {
        let fake = internal_channel_id(uid, &req.channel_id, req.channel_type);
        let end = if req.last_msg_seq > 0 {
            req.last_msg_seq - 1
        } else {
            0
        };
        let records = node.store.load_last_messages_with_end(
            &channel_key(&fake, req.channel_type),
            end,
            msg_count,
        )?;
        let mut messages: Vec<MessageResp> = records
            .into_iter()
            .map(|r| MessageResp {
                message_id: r.message_id,
                message_seq: r.message_seq,
                from_uid: r.from_uid,
                timestamp: r.timestamp,
                payload: r.payload.to_vec(),
            })
            .collect();
        messages.sort_by(|a, b| b.message_seq.cmp(&a.message_seq));
        out.push(ChannelRecentMessage {
            channel_id: req.channel_id.clone(),
            channel_type: req.channel_type,
            messages,
        });
    }
    Ok(out)
}

// ---- plumbing ---------------------------------------------------------------

fn parse<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, Response> {
    serde_json::from_slice(body)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &format!("bad request body: {err}")))
}

fn parse_last_msg_seqs(raw: &str) -> HashMap<String, u64> {
    let mut out = HashMap::new();
    for part in raw.split('|') {
        let fields: Vec<&str> = part.split(':').collect();
        if fields.len() != 3 {
            continue;
        }
        let Ok(channel_type) = fields[1].parse::<u8>() else {
            continue;
        };
        let Ok(seq) = fields[2].parse::<u64>() else {
            continue;
        };
        out.insert(format!("{}-{}", fields[0], channel_type), seq);
    }
    out
}

fn blank_row(uid: &str, channel_id: &str, channel_type: u8) -> Conversation {
    Conversation {
        uid: uid.to_string(),
        channel_id: channel_id.to_string(),
        channel_type,
        readed_to_msg_seq: 0,
        unread_count: 0,
        timestamp: 0,
        version: 0,
    }
}

async fn persist_row(node: &Arc<Node>, uid: &str, row: Conversation) -> Result<(), ClusterError> {
    let cmd = SlotCommand::UpsertConversations {
        uid: uid.to_string(),
        rows: vec![row],
    };
    node.cluster.propose_slot_command(uid, &cmd).await
}

/// Forward the buffered body to the uid's slot leader and mirror its reply.
async fn forward_if_not_leader(
    node: &Arc<Node>,
    uid: &str,
    path: &str,
    body: &Bytes,
) -> Result<Option<Response>> {
    let leader = node.cluster.slot_leader_of(uid);
    if leader == node.opts.node_id {
        return Ok(None);
    }
    let base = node
        .opts
        .api_url_of(leader)
        .with_context(|| format!("no api address for slot leader {leader}"))?;
    let url = format!("{base}{path}");
    debug!(%url, uid, "forwarding to slot leader");
    let upstream = node
        .http
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body.to_vec())
        .send()
        .await
        .with_context(|| format!("forward to {url}"))?;
    let status = upstream.status();
    let bytes = upstream.bytes().await.context("read forwarded response")?;
    let mut response = Response::new(axum::body::Body::from(bytes));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    Ok(Some(response))
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    warn!(%status, msg, "api error");
    (status, Json(json!({ "msg": msg }))).into_response()
}

fn cluster_error_response(err: ClusterError) -> Response {
    let status = match &err {
        ClusterError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        ClusterError::NotFound => StatusCode::OK,
        ClusterError::ProposeTimeout => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn ok_response() -> Response {
    Json(json!({ "status": 200 })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_msg_seqs_parser_skips_malformed_entries() {
        let map = parse_last_msg_seqs("bob:1:42|room:2:7|junk|a:b:c");
        assert_eq!(map.len(), 2);
        assert_eq!(map["bob-1"], 42);
        assert_eq!(map["room-2"], 7);
        assert!(parse_last_msg_seqs("").is_empty());
    }
}
