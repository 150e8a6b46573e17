//! Replicated-log rows and per-partition metadata.
//!
//! A channel's log doubles as its message store: entry payloads are encoded
//! [`MessageRecord`]s and the per-channel `message_seq` is simply the log
//! index, so `last_msg_seq` falls out of `last_index` for free.

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use plume_replica::{Log, Term};

use super::keys;
use super::record::MessageRecord;
use super::Store;

impl Store {
    /// Append a batch, replacing any conflicting suffix.
    ///
    /// Entries at or above `logs[0].index` are overwritten and anything the
    /// batch does not cover is deleted, which is exactly the follower
    /// conflict-resolution rule: the incoming (leader) suffix wins. Leader
    /// term start indexes are recorded as terms first appear and dropped for
    /// terms a truncation proves stale.
    pub fn append_logs(&self, shard_no: &str, logs: &[Log]) -> Result<()> {
        let Some(first) = logs.first() else {
            return Ok(());
        };
        let last = logs.last().expect("non-empty");
        let shard = self.shard(shard_no);
        let _guard = shard.write_lock.lock().unwrap();

        let old_last = self.log_last_index_locked(shard_no)?;
        let mut batch = self.keyspace().batch();

        // Truncate the tail the batch does not rewrite.
        if old_last > last.index {
            for index in (last.index + 1)..=old_last {
                batch.remove(&shard.logs, keys::log_key(shard_no, index));
            }
        }
        // A truncating rewrite also invalidates term bookkeeping above the
        // incoming term.
        if first.index <= old_last {
            let prefix = keys::term_start_prefix(shard_no);
            let mut stale = Vec::new();
            for item in shard.meta.prefix(prefix.clone()) {
                let (key, _) = item.context("scan term starts")?;
                if let Some(term) = keys::term_from_key(shard_no, &key) {
                    if term > first.term {
                        stale.push(key.to_vec());
                    }
                }
            }
            for key in stale {
                batch.remove(&shard.meta, key);
            }
        }

        let mut known_last_term = self.leader_last_term_locked(shard_no)?;
        if first.index <= old_last {
            known_last_term = known_last_term.min(first.term.saturating_sub(1));
        }
        for log in logs {
            ensure!(log.index > 0, "log index 0 is invalid");
            batch.insert(&shard.logs, keys::log_key(shard_no, log.index), encode_row(log));
            if log.term > known_last_term {
                batch.insert(
                    &shard.meta,
                    keys::term_start_key(shard_no, log.term),
                    log.index.to_be_bytes().to_vec(),
                );
                known_last_term = log.term;
            }
        }
        batch.commit().context("commit log append")?;
        Ok(())
    }

    /// Read `[start, end)` bounded by `limit_bytes` (zero = unbounded).
    /// `end == 0` means "through the last entry". At least one entry is
    /// returned when any exists in range, however large.
    pub fn read_logs(
        &self,
        shard_no: &str,
        start: u64,
        end: u64,
        limit_bytes: u64,
    ) -> Result<Vec<Log>> {
        ensure!(start > 0, "log reads are 1-based");
        let shard = self.shard(shard_no);
        let lo = keys::log_key(shard_no, start);
        let hi = if end == 0 {
            keys::log_key(shard_no, u64::MAX)
        } else {
            keys::log_key(shard_no, end)
        };
        let mut out = Vec::new();
        let mut used = 0u64;
        for item in shard.logs.range(lo..hi) {
            let (key, value) = item.context("scan logs")?;
            let index = keys::log_index_from_key(shard_no, &key)
                .context("malformed log key")?;
            let log = decode_row(index, &value)?;
            used += log.encoded_size();
            out.push(log);
            if limit_bytes > 0 && used >= limit_bytes {
                break;
            }
        }
        Ok(out)
    }

    pub fn log_last_index(&self, shard_no: &str) -> Result<u64> {
        self.log_last_index_locked(shard_no)
    }

    fn log_last_index_locked(&self, shard_no: &str) -> Result<u64> {
        let shard = self.shard(shard_no);
        let prefix = keys::log_prefix(shard_no);
        match shard.logs.prefix(prefix).rev().next() {
            Some(item) => {
                let (key, _) = item.context("read last log key")?;
                Ok(keys::log_index_from_key(shard_no, &key).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    pub fn log_last_index_and_term(&self, shard_no: &str) -> Result<(u64, Term)> {
        let shard = self.shard(shard_no);
        let prefix = keys::log_prefix(shard_no);
        match shard.logs.prefix(prefix).rev().next() {
            Some(item) => {
                let (key, value) = item.context("read last log")?;
                let index = keys::log_index_from_key(shard_no, &key).unwrap_or(0);
                let log = decode_row(index, &value)?;
                Ok((index, log.term))
            }
            None => Ok((0, 0)),
        }
    }

    pub fn applied_index(&self, shard_no: &str) -> Result<u64> {
        let shard = self.shard(shard_no);
        match shard.meta.get(keys::applied_index_key(shard_no))? {
            Some(v) => Ok(decode_u64(&v)?),
            None => Ok(0),
        }
    }

    pub fn set_applied_index(&self, shard_no: &str, index: u64) -> Result<()> {
        let shard = self.shard(shard_no);
        shard
            .meta
            .insert(keys::applied_index_key(shard_no), index.to_be_bytes().to_vec())
            .context("set applied index")?;
        Ok(())
    }

    pub fn leader_last_term(&self, shard_no: &str) -> Result<Term> {
        self.leader_last_term_locked(shard_no)
    }

    fn leader_last_term_locked(&self, shard_no: &str) -> Result<Term> {
        let shard = self.shard(shard_no);
        let prefix = keys::term_start_prefix(shard_no);
        match shard.meta.prefix(prefix).rev().next() {
            Some(item) => {
                let (key, _) = item.context("read last term")?;
                Ok(keys::term_from_key(shard_no, &key).unwrap_or(0))
            }
            None => Ok(0),
        }
    }

    pub fn leader_term_start_index(&self, shard_no: &str, term: Term) -> Result<u64> {
        let shard = self.shard(shard_no);
        match shard.meta.get(keys::term_start_key(shard_no, term))? {
            Some(v) => Ok(decode_u64(&v)?),
            None => Ok(0),
        }
    }

    // ---- message views over channel logs ---------------------------------

    pub fn last_msg_seq(&self, channel_key: &str) -> Result<u64> {
        self.log_last_index(channel_key)
    }

    /// The newest `limit` messages with `seq > end`, ascending by seq.
    pub fn load_last_messages_with_end(
        &self,
        channel_key: &str,
        end: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let shard = self.shard(channel_key);
        let prefix = keys::log_prefix(channel_key);
        let mut out = Vec::with_capacity(limit.min(64));
        for item in shard.logs.prefix(prefix).rev() {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item.context("scan messages")?;
            let Some(index) = keys::log_index_from_key(channel_key, &key) else {
                continue;
            };
            if index <= end {
                break;
            }
            let log = decode_row(index, &value)?;
            out.push(MessageRecord::decode(&log.data, index)?);
        }
        out.reverse();
        Ok(out)
    }

    /// Messages in `(start, end]` (zero `end` = open), ascending, capped.
    pub fn load_next_messages(
        &self,
        channel_key: &str,
        start: u64,
        end: u64,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let logs = self.read_logs(channel_key, start + 1, end, 0)?;
        let mut out = Vec::with_capacity(logs.len().min(limit));
        for log in logs.into_iter().take(limit) {
            out.push(MessageRecord::decode(&log.data, log.index)?);
        }
        Ok(out)
    }
}

fn encode_row(log: &Log) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 8 + 4 + log.data.len());
    out.extend_from_slice(&log.term.to_be_bytes());
    out.extend_from_slice(&log.id.to_be_bytes());
    out.extend_from_slice(&(log.data.len() as u32).to_be_bytes());
    out.extend_from_slice(&log.data);
    out
}

fn decode_row(index: u64, value: &[u8]) -> Result<Log> {
    ensure!(value.len() >= 16, "log row too short");
    let term = Term::from_be_bytes(value[0..4].try_into().unwrap());
    let id = u64::from_be_bytes(value[4..12].try_into().unwrap());
    let len = u32::from_be_bytes(value[12..16].try_into().unwrap()) as usize;
    ensure!(value.len() >= 16 + len, "log row short data");
    Ok(Log {
        index,
        term,
        id,
        data: Bytes::copy_from_slice(&value[16..16 + len]),
    })
}

fn decode_u64(v: &[u8]) -> Result<u64> {
    ensure!(v.len() == 8, "u64 cell of wrong width");
    Ok(u64::from_be_bytes(v.try_into().unwrap()))
}
