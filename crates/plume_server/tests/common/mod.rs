//! Shared helpers for node integration tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use plume_server::sinks::{AckCode, AckSink, DeliverSink, PayloadDecryptor};
use plume_server::store::MessageRecord;

#[derive(Clone, Debug)]
pub struct RecordedAck {
    pub conn_id: u64,
    pub message_id: u64,
    pub message_seq: u64,
    pub code: AckCode,
}

#[derive(Clone, Debug)]
pub struct RecordedDelivery {
    pub uid: String,
    pub channel_id: String,
    pub channel_type: u8,
    pub messages: Vec<MessageRecord>,
}

/// Records everything the pipeline pushes at the connection layer.
#[derive(Default)]
pub struct Recorder {
    pub acks: Mutex<Vec<RecordedAck>>,
    pub deliveries: Mutex<Vec<RecordedDelivery>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acks(&self) -> Vec<RecordedAck> {
        self.acks.lock().unwrap().clone()
    }

    pub fn deliveries_for(&self, uid: &str) -> Vec<RecordedDelivery> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.uid == uid)
            .cloned()
            .collect()
    }
}

pub struct RecorderDeliver(pub Arc<Recorder>);

impl DeliverSink for RecorderDeliver {
    fn deliver(&self, uid: &str, channel_id: &str, channel_type: u8, messages: &[MessageRecord]) {
        self.0.deliveries.lock().unwrap().push(RecordedDelivery {
            uid: uid.to_string(),
            channel_id: channel_id.to_string(),
            channel_type,
            messages: messages.to_vec(),
        });
    }
}

pub struct RecorderAck(pub Arc<Recorder>);

impl AckSink for RecorderAck {
    fn ack(&self, conn_id: u64, message_id: u64, message_seq: u64, code: AckCode) {
        self.0.acks.lock().unwrap().push(RecordedAck {
            conn_id,
            message_id,
            message_seq,
            code,
        });
    }
}

/// Fails any payload starting with the marker byte `0xff`; passes the rest
/// through so tests can drive both decrypt outcomes.
pub struct MarkerDecryptor;

impl PayloadDecryptor for MarkerDecryptor {
    fn decrypt(&self, _uid: &str, _key: Option<&[u8]>, payload: &[u8]) -> Result<Bytes> {
        if payload.first() == Some(&0xff) {
            anyhow::bail!("bad ciphertext");
        }
        Ok(Bytes::copy_from_slice(payload))
    }
}

/// Reserve a localhost address. The listener is dropped so the port can be
/// handed to a node; tests bind it again fast enough that reuse is safe.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Poll until `f` holds or the deadline passes.
pub async fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
