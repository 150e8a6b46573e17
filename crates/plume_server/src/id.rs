//! Snowflake-style message id generation.
//!
//! Layout: 41 bits of milliseconds since the plume epoch, 10 bits of node id,
//! 12 bits of per-millisecond sequence. Ids are unique across the cluster as
//! long as node ids stay below 1024, and sort roughly by creation time.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use plume_replica::NodeId;

/// 2023-01-01T00:00:00Z, keeps the millisecond field small.
const EPOCH_MS: u64 = 1_672_531_200_000;

const NODE_BITS: u64 = 10;
const SEQ_BITS: u64 = 12;

pub struct MessageIdGen {
    node_id: NodeId,
    state: Mutex<GenState>,
}

struct GenState {
    last_ms: u64,
    seq: u64,
}

impl MessageIdGen {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id: node_id & ((1 << NODE_BITS) - 1),
            state: Mutex::new(GenState { last_ms: 0, seq: 0 }),
        }
    }

    pub fn next(&self) -> u64 {
        let mut st = self.state.lock().unwrap();
        let mut now = now_ms().saturating_sub(EPOCH_MS);
        if now < st.last_ms {
            // Clock went backwards; keep issuing from the last observed
            // millisecond so ids stay monotonic.
            now = st.last_ms;
        }
        if now == st.last_ms {
            st.seq = (st.seq + 1) & ((1 << SEQ_BITS) - 1);
            if st.seq == 0 {
                st.last_ms += 1;
            }
        } else {
            st.last_ms = now;
            st.seq = 0;
        }
        (st.last_ms << (NODE_BITS + SEQ_BITS)) | (self.node_id << SEQ_BITS) | st.seq
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .min(u128::from(u64::MAX)) as u64
}

pub fn now_secs() -> u64 {
    now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_increasing() {
        let gen = MessageIdGen::new(7);
        let mut prev = 0u64;
        for _ in 0..10_000 {
            let id = gen.next();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn node_id_is_embedded() {
        let gen = MessageIdGen::new(42);
        let id = gen.next();
        assert_eq!((id >> SEQ_BITS) & ((1 << NODE_BITS) - 1), 42);
    }
}
