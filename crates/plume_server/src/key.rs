//! Shard keys, channel keys and the fake channel id for person channels.

/// Person-to-person channel. On the wire such a channel is identified by one
/// peer's uid; internally both sides map to the same fake channel id.
pub const CHANNEL_TYPE_PERSON: u8 = 1;
pub const CHANNEL_TYPE_GROUP: u8 = 2;

/// Shard key of a channel partition: `"{channel_type}:{channel_id}"`.
pub fn channel_key(channel_id: &str, channel_type: u8) -> String {
    format!("{channel_type}:{channel_id}")
}

pub fn parse_channel_key(key: &str) -> Option<(String, u8)> {
    let (t, id) = key.split_once(':')?;
    let channel_type = t.parse::<u8>().ok()?;
    if id.is_empty() {
        return None;
    }
    Some((id.to_string(), channel_type))
}

/// Shard key of a slot partition: `"slot-{id}"`.
pub fn slot_shard_no(slot_id: u32) -> String {
    format!("slot-{slot_id}")
}

pub fn parse_slot_shard_no(shard_no: &str) -> Option<u32> {
    shard_no.strip_prefix("slot-")?.parse().ok()
}

/// Canonical id of a person channel: the two participant uids joined in
/// lexicographic order, so both sides key the same conversation and log.
pub fn fake_channel_id(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}@{b}")
    } else {
        format!("{b}@{a}")
    }
}

pub fn is_fake_channel_id(channel_id: &str) -> bool {
    channel_id.contains('@')
}

/// Split a fake channel id back into its participants.
pub fn participants(fake_channel_id: &str) -> Option<(String, String)> {
    let (a, b) = fake_channel_id.split_once('@')?;
    Some((a.to_string(), b.to_string()))
}

/// Remap a wire-level channel id to the internal one. For person channels the
/// wire id is the peer uid; everything else passes through.
pub fn internal_channel_id(uid: &str, channel_id: &str, channel_type: u8) -> String {
    if channel_type == CHANNEL_TYPE_PERSON && !is_fake_channel_id(channel_id) {
        fake_channel_id(uid, channel_id)
    } else {
        channel_id.to_string()
    }
}

/// The id a given user sees for a channel: for person channels, the other
/// participant.
pub fn display_channel_id(uid: &str, channel_id: &str, channel_type: u8) -> String {
    if channel_type == CHANNEL_TYPE_PERSON {
        if let Some((a, b)) = participants(channel_id) {
            return if uid == a { b } else { a };
        }
    }
    channel_id.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_channel_id_is_commutative() {
        assert_eq!(fake_channel_id("alice", "bob"), fake_channel_id("bob", "alice"));
        assert_eq!(fake_channel_id("alice", "bob"), "alice@bob");
    }

    #[test]
    fn fake_channel_id_round_trips() {
        let id = fake_channel_id("carol", "bob");
        let (a, b) = participants(&id).unwrap();
        assert_eq!(fake_channel_id(&a, &b), id);
        assert_eq!(display_channel_id("bob", &id, CHANNEL_TYPE_PERSON), "carol");
        assert_eq!(display_channel_id("carol", &id, CHANNEL_TYPE_PERSON), "bob");
    }

    #[test]
    fn channel_key_round_trips() {
        let key = channel_key("room-1", CHANNEL_TYPE_GROUP);
        assert_eq!(key, "2:room-1");
        assert_eq!(
            parse_channel_key(&key).unwrap(),
            ("room-1".to_string(), CHANNEL_TYPE_GROUP)
        );
        assert_eq!(parse_slot_shard_no(&slot_shard_no(17)).unwrap(), 17);
    }

    #[test]
    fn internal_id_remaps_only_person_channels() {
        assert_eq!(
            internal_channel_id("alice", "bob", CHANNEL_TYPE_PERSON),
            "alice@bob"
        );
        assert_eq!(
            internal_channel_id("alice", "room", CHANNEL_TYPE_GROUP),
            "room"
        );
        assert_eq!(
            internal_channel_id("alice", "alice@bob", CHANNEL_TYPE_PERSON),
            "alice@bob"
        );
    }
}
