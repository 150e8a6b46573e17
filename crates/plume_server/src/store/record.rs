//! Binary codec for message records carried in channel log entries.
//!
//! The record is the log entry payload; the per-channel sequence is the log
//! index itself and is attached at read time rather than stored twice.

use anyhow::{ensure, Result};
use bytes::Bytes;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: u64,
    /// Log index of the entry this record was read from; zero before commit.
    pub message_seq: u64,
    pub from_uid: String,
    pub timestamp: u64,
    pub payload: Bytes,
}

impl MessageRecord {
    pub fn encode(&self) -> Bytes {
        let mut out = Vec::with_capacity(8 + 8 + 2 + self.from_uid.len() + 4 + self.payload.len());
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&(self.from_uid.len() as u16).to_be_bytes());
        out.extend_from_slice(self.from_uid.as_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Bytes::from(out)
    }

    pub fn decode(data: &[u8], message_seq: u64) -> Result<Self> {
        let mut offset = 0usize;
        let message_id = read_u64_at(data, &mut offset)?;
        let timestamp = read_u64_at(data, &mut offset)?;
        let uid_len = read_u16_at(data, &mut offset)? as usize;
        ensure!(offset + uid_len <= data.len(), "record short uid");
        let from_uid = String::from_utf8(data[offset..offset + uid_len].to_vec())?;
        offset += uid_len;
        let payload_len = read_u32_at(data, &mut offset)? as usize;
        ensure!(offset + payload_len <= data.len(), "record short payload");
        let payload = Bytes::copy_from_slice(&data[offset..offset + payload_len]);
        Ok(Self {
            message_id,
            message_seq,
            from_uid,
            timestamp,
            payload,
        })
    }
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> Result<u64> {
    ensure!(*offset + 8 <= data.len(), "record short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> Result<u32> {
    ensure!(*offset + 4 <= data.len(), "record short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

fn read_u16_at(data: &[u8], offset: &mut usize) -> Result<u16> {
    ensure!(*offset + 2 <= data.len(), "record short u16");
    let mut buf = [0u8; 2];
    buf.copy_from_slice(&data[*offset..*offset + 2]);
    *offset += 2;
    Ok(u16::from_be_bytes(buf))
}
