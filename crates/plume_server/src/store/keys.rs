//! Key encodings and shard routing for the embedded keyspace.
//!
//! Log rows live in per-shard partitions (`logs_{n}` / `meta_{n}`), routed by
//! a crc32 of the partition shard key so one busy partition cannot serialize
//! the whole store. Index suffixes are big-endian so lexicographic order is
//! numeric order.

/// Route a shard key (channel key or `slot-N`) to a KV shard.
pub fn db_shard(shard_no: &str, shard_count: u32) -> u32 {
    crc32fast::hash(shard_no.as_bytes()) % shard_count.max(1)
}

/// Slot routing for arbitrary string keys (uids, channel ids).
pub fn slot_for_key(key: &str, slot_count: u32) -> u32 {
    crc32fast::hash(key.as_bytes()) % slot_count.max(1)
}

pub fn log_key(shard_no: &str, index: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(shard_no.len() + 1 + 8);
    out.extend_from_slice(shard_no.as_bytes());
    out.push(0);
    out.extend_from_slice(&index.to_be_bytes());
    out
}

pub fn log_prefix(shard_no: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(shard_no.len() + 1);
    out.extend_from_slice(shard_no.as_bytes());
    out.push(0);
    out
}

pub fn log_index_from_key(shard_no: &str, key: &[u8]) -> Option<u64> {
    let prefix_len = shard_no.len() + 1;
    if key.len() != prefix_len + 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[prefix_len..]);
    Some(u64::from_be_bytes(buf))
}

pub fn applied_index_key(shard_no: &str) -> Vec<u8> {
    format!("applied/{shard_no}").into_bytes()
}

pub fn term_start_key(shard_no: &str, term: u32) -> Vec<u8> {
    let mut out = format!("term/{shard_no}/").into_bytes();
    out.extend_from_slice(&term.to_be_bytes());
    out
}

pub fn term_start_prefix(shard_no: &str) -> Vec<u8> {
    format!("term/{shard_no}/").into_bytes()
}

pub fn term_from_key(shard_no: &str, key: &[u8]) -> Option<u32> {
    let prefix_len = term_start_prefix(shard_no).len();
    if key.len() != prefix_len + 4 {
        return None;
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&key[prefix_len..]);
    Some(u32::from_be_bytes(buf))
}

pub fn conversation_key(uid: &str, channel_key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(uid.len() + 1 + channel_key.len());
    out.extend_from_slice(uid.as_bytes());
    out.push(0);
    out.extend_from_slice(channel_key.as_bytes());
    out
}

pub fn conversation_prefix(uid: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(uid.len() + 1);
    out.extend_from_slice(uid.as_bytes());
    out.push(0);
    out
}

pub fn subscriber_key(channel_key: &str, uid: &str) -> Vec<u8> {
    format!("sub/{channel_key}\0{uid}").into_bytes()
}

pub fn subscriber_prefix(channel_key: &str) -> Vec<u8> {
    format!("sub/{channel_key}\0").into_bytes()
}

pub fn denylist_key(channel_key: &str, uid: &str) -> Vec<u8> {
    format!("deny/{channel_key}\0{uid}").into_bytes()
}

pub fn channel_config_key(channel_key: &str) -> Vec<u8> {
    format!("cfg/{channel_key}").into_bytes()
}

pub fn user_key_key(uid: &str) -> Vec<u8> {
    format!("ukey/{uid}").into_bytes()
}

/// Recover the uid suffix of a subscriber-style key.
pub fn uid_from_prefixed_key(prefix: &[u8], key: &[u8]) -> Option<String> {
    if key.len() <= prefix.len() {
        return None;
    }
    String::from_utf8(key[prefix.len()..].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_keys_sort_numerically() {
        let a = log_key("2:room", 9);
        let b = log_key("2:room", 10);
        let c = log_key("2:room", 300);
        assert!(a < b && b < c);
        assert_eq!(log_index_from_key("2:room", &c).unwrap(), 300);
    }

    #[test]
    fn shard_routing_is_stable() {
        assert_eq!(db_shard("slot-3", 8), db_shard("slot-3", 8));
        assert!(db_shard("slot-3", 8) < 8);
        assert_eq!(slot_for_key("alice", 128), slot_for_key("alice", 128));
    }

    #[test]
    fn term_key_round_trips() {
        let key = term_start_key("slot-1", 42);
        assert_eq!(term_from_key("slot-1", &key).unwrap(), 42);
    }
}
