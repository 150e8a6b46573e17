//! Seams to the (out of scope) connection layer.
//!
//! The real server plugs connection-aware implementations in here; the
//! defaults log, and tests record. Keeping these as traits keeps the whole
//! pipeline runnable without any client protocol code.

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::MessageRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckCode {
    Ok,
    DecryptFailed,
    PermissionDenied,
}

/// Replays a delivered batch to a locally-connected user.
pub trait DeliverSink: Send + Sync + 'static {
    fn deliver(&self, uid: &str, channel_id: &str, channel_type: u8, messages: &[MessageRecord]);
}

/// Emits a send acknowledgement to the originating connection.
pub trait AckSink: Send + Sync + 'static {
    fn ack(&self, conn_id: u64, message_id: u64, message_seq: u64, code: AckCode);
}

/// Recovers plaintext from a sender's payload using their key material.
pub trait PayloadDecryptor: Send + Sync + 'static {
    fn decrypt(&self, uid: &str, key_material: Option<&[u8]>, payload: &[u8]) -> Result<Bytes>;
}

pub struct LogDeliverSink;

impl DeliverSink for LogDeliverSink {
    fn deliver(&self, uid: &str, channel_id: &str, channel_type: u8, messages: &[MessageRecord]) {
        debug!(uid, channel_id, channel_type, count = messages.len(), "deliver");
    }
}

pub struct LogAckSink;

impl AckSink for LogAckSink {
    fn ack(&self, conn_id: u64, message_id: u64, message_seq: u64, code: AckCode) {
        debug!(conn_id, message_id, message_seq, ?code, "sendack");
    }
}

/// Pass-through decryptor used when payloads arrive in the clear.
pub struct PlainDecryptor;

impl PayloadDecryptor for PlainDecryptor {
    fn decrypt(&self, _uid: &str, _key_material: Option<&[u8]>, payload: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }
}
