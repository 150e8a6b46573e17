//! Framed TCP transport between cluster nodes.
//!
//! Each frame is `{kind, shard_no, payload}` with a length prefix and crc32
//! over the body. The payload of channel/slot frames is an encoded replica
//! message. Delivery is best-effort: per-peer frames queue into a bounded
//! channel and a pump task owns the connection, reconnecting with backoff;
//! reliability lives in the replica protocol, not here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use plume_replica::{Log, Message, MessageKind, NodeId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ClusterTransport, InboundHandler};

/// Cap on a single frame body; anything larger is a protocol violation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;
/// Depth of each per-peer outbound queue; overflow drops the frame.
const PEER_QUEUE_DEPTH: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    ChannelMsg = 1,
    SlotMsg = 2,
    ConfigMsg = 3,
    Ping = 4,
    Pong = 5,
}

impl FrameKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::ChannelMsg,
            2 => Self::SlotMsg,
            3 => Self::ConfigMsg,
            4 => Self::Ping,
            5 => Self::Pong,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub shard_no: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn replica(kind: FrameKind, shard_no: &str, msg: &Message) -> Self {
        Self {
            kind,
            shard_no: shard_no.to_string(),
            payload: encode_message(msg),
        }
    }
}

// ---- codec ----------------------------------------------------------------

pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let body_len = 1 + 2 + frame.shard_no.len() + frame.payload.len();
    let mut out = Vec::with_capacity(8 + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    // crc fills in after the body is known
    out.extend_from_slice(&[0u8; 4]);
    out.push(frame.kind as u8);
    out.extend_from_slice(&(frame.shard_no.len() as u16).to_be_bytes());
    out.extend_from_slice(frame.shard_no.as_bytes());
    out.extend_from_slice(&frame.payload);
    let crc = crc32fast::hash(&out[8..]);
    out[4..8].copy_from_slice(&crc.to_be_bytes());
    out
}

pub fn decode_frame_body(body: &[u8]) -> Result<Frame> {
    ensure!(body.len() >= 3, "frame body too short");
    let kind = FrameKind::from_u8(body[0]).context("unknown frame kind")?;
    let shard_len = u16::from_be_bytes(body[1..3].try_into().unwrap()) as usize;
    ensure!(body.len() >= 3 + shard_len, "frame short shard key");
    let shard_no = String::from_utf8(body[3..3 + shard_len].to_vec())
        .context("shard key not utf-8")?;
    let payload = Bytes::copy_from_slice(&body[3 + shard_len..]);
    Ok(Frame {
        kind,
        shard_no,
        payload,
    })
}

pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    let encoded = encode_frame(frame);
    w.write_all(&encoded).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Result<Frame> {
    let mut header = [0u8; 8];
    r.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let expected_crc = u32::from_be_bytes(header[4..8].try_into().unwrap());
    ensure!(len > 0 && len <= MAX_FRAME_BYTES, "frame length {len} out of range");
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    ensure!(crc32fast::hash(&body) == expected_crc, "frame checksum mismatch");
    decode_frame_body(&body)
}

pub fn encode_message(msg: &Message) -> Bytes {
    let mut out = Vec::with_capacity(64 + msg.logs.iter().map(|l| l.data.len() + 24).sum::<usize>());
    out.push(msg.kind as u8);
    out.extend_from_slice(&msg.from.to_be_bytes());
    out.extend_from_slice(&msg.to.to_be_bytes());
    out.extend_from_slice(&msg.term.to_be_bytes());
    out.extend_from_slice(&msg.index.to_be_bytes());
    out.extend_from_slice(&msg.applying_index.to_be_bytes());
    out.extend_from_slice(&msg.committed_index.to_be_bytes());
    out.extend_from_slice(&msg.applied_index.to_be_bytes());
    out.push(u8::from(msg.reject));
    out.extend_from_slice(&(msg.logs.len() as u32).to_be_bytes());
    for log in &msg.logs {
        out.extend_from_slice(&log.index.to_be_bytes());
        out.extend_from_slice(&log.term.to_be_bytes());
        out.extend_from_slice(&log.id.to_be_bytes());
        out.extend_from_slice(&(log.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&log.data);
    }
    Bytes::from(out)
}

pub fn decode_message(data: &[u8]) -> Result<Message> {
    let mut off = 0usize;
    let kind = MessageKind::from_u8(read_u8(data, &mut off)?).context("unknown message kind")?;
    let mut msg = Message::new(kind);
    msg.from = read_u64(data, &mut off)?;
    msg.to = read_u64(data, &mut off)?;
    msg.term = read_u32(data, &mut off)?;
    msg.index = read_u64(data, &mut off)?;
    msg.applying_index = read_u64(data, &mut off)?;
    msg.committed_index = read_u64(data, &mut off)?;
    msg.applied_index = read_u64(data, &mut off)?;
    msg.reject = read_u8(data, &mut off)? != 0;
    let count = read_u32(data, &mut off)? as usize;
    let mut logs = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let index = read_u64(data, &mut off)?;
        let term = read_u32(data, &mut off)?;
        let id = read_u64(data, &mut off)?;
        let len = read_u32(data, &mut off)? as usize;
        ensure!(off + len <= data.len(), "message short log data");
        let payload = Bytes::copy_from_slice(&data[off..off + len]);
        off += len;
        logs.push(Log {
            index,
            term,
            id,
            data: payload,
        });
    }
    msg.logs = logs;
    Ok(msg)
}

// ---- TCP transport --------------------------------------------------------

pub struct TcpTransport {
    node_id: NodeId,
    token: String,
    peers: RwLock<HashMap<NodeId, mpsc::Sender<Frame>>>,
}

impl TcpTransport {
    pub fn new(node_id: NodeId, token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            token: token.into(),
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Register a peer and start its connection pump.
    pub fn connect_peer(self: &Arc<Self>, peer_id: NodeId, addr: SocketAddr) -> JoinHandle<()> {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        self.peers.write().unwrap().insert(peer_id, tx);
        let node_id = self.node_id;
        let token = self.token.clone();
        tokio::spawn(async move {
            peer_pump(node_id, peer_id, addr, token, rx).await;
        })
    }

    pub fn spawn_listener(
        self: &Arc<Self>,
        listener: TcpListener,
        handler: Arc<dyn InboundHandler>,
    ) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let token = token.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if let Err(err) = serve_conn(stream, token, handler).await {
                                debug!(%remote, error = %err, "cluster connection closed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "cluster accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        })
    }
}

impl ClusterTransport for TcpTransport {
    fn send(&self, to: NodeId, frame: Frame) {
        let peers = self.peers.read().unwrap();
        match peers.get(&to) {
            Some(tx) => {
                if tx.try_send(frame).is_err() {
                    warn!(to, "peer queue full, dropping frame");
                }
            }
            None => warn!(to, "send to unknown peer"),
        }
    }
}

async fn peer_pump(
    node_id: NodeId,
    peer_id: NodeId,
    addr: SocketAddr,
    token: String,
    mut rx: mpsc::Receiver<Frame>,
) {
    let mut backoff = Duration::from_millis(200);
    loop {
        let mut stream = match TcpStream::connect(addr).await {
            Ok(s) => {
                backoff = Duration::from_millis(200);
                s
            }
            Err(err) => {
                debug!(peer_id, %addr, error = %err, "peer connect failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let handshake = Frame {
            kind: FrameKind::Ping,
            shard_no: node_id.to_string(),
            payload: Bytes::from(token.clone().into_bytes()),
        };
        if write_frame(&mut stream, &handshake).await.is_err() {
            tokio::time::sleep(backoff).await;
            continue;
        }

        loop {
            match rx.recv().await {
                Some(frame) => {
                    if let Err(err) = write_frame(&mut stream, &frame).await {
                        warn!(peer_id, error = %err, "peer write failed, reconnecting");
                        break;
                    }
                }
                // Transport dropped; pump is done.
                None => return,
            }
        }
    }
}

async fn serve_conn(
    mut stream: TcpStream,
    token: String,
    handler: Arc<dyn InboundHandler>,
) -> Result<()> {
    let hs = read_frame(&mut stream).await.context("read handshake")?;
    if hs.kind != FrameKind::Ping || hs.payload.as_ref() != token.as_bytes() {
        bail!("handshake rejected");
    }
    let from: NodeId = hs.shard_no.parse().context("handshake node id")?;
    loop {
        let frame = read_frame(&mut stream).await?;
        handler.handle(from, frame);
    }
}

fn read_u8(data: &[u8], off: &mut usize) -> Result<u8> {
    ensure!(*off < data.len(), "message short u8");
    let v = data[*off];
    *off += 1;
    Ok(v)
}

fn read_u32(data: &[u8], off: &mut usize) -> Result<u32> {
    ensure!(*off + 4 <= data.len(), "message short u32");
    let v = u32::from_be_bytes(data[*off..*off + 4].try_into().unwrap());
    *off += 4;
    Ok(v)
}

fn read_u64(data: &[u8], off: &mut usize) -> Result<u64> {
    ensure!(*off + 8 <= data.len(), "message short u64");
    let v = u64::from_be_bytes(data[*off..*off + 8].try_into().unwrap());
    *off += 8;
    Ok(v)
}
