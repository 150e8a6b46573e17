//! Conversation HTTP API on a single node: unread accounting and sync.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};

use plume_server::key::{fake_channel_id, CHANNEL_TYPE_PERSON};
use plume_server::{Node, NodeOptions};

use common::{wait_until, MarkerDecryptor, Recorder, RecorderAck, RecorderDeliver};

struct TestNode {
    _dir: tempfile::TempDir,
    node: Arc<Node>,
    _recorder: Arc<Recorder>,
    http: reqwest::Client,
    base: String,
}

impl TestNode {
    async fn start() -> Self {
        let recorder = Recorder::new();
        let dir = tempfile::tempdir().unwrap();
        let opts = NodeOptions::single(1, dir.path());
        let node = Node::start_with_sinks(
            opts,
            Arc::new(RecorderDeliver(recorder.clone())),
            Arc::new(RecorderAck(recorder.clone())),
            Arc::new(MarkerDecryptor),
        )
        .await
        .unwrap();
        let base = format!("http://{}", node.api_addr());
        Self {
            _dir: dir,
            node,
            _recorder: recorder,
            http: reqwest::Client::new(),
            base,
        }
    }

    async fn post(&self, path: &str, body: Value) -> (reqwest::StatusCode, Value) {
        let resp = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status();
        let value = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, value)
    }

    /// Publish alice→bob messages until the person channel holds `count`.
    async fn seed_person_messages(&self, from: &str, to: &str, count: u64) {
        for i in 0..count {
            self.node
                .send_channel_message(
                    from,
                    1,
                    to,
                    CHANNEL_TYPE_PERSON,
                    false,
                    Bytes::from(format!("m{i}")),
                )
                .unwrap();
        }
        let key = format!("{CHANNEL_TYPE_PERSON}:{}", fake_channel_id(from, to));
        let node = self.node.clone();
        assert!(
            wait_until(Duration::from_secs(10), move || {
                node.store.last_msg_seq(&key).unwrap() >= count
            })
            .await,
            "messages never committed"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clear_unread_marks_everything_read() {
    let t = TestNode::start().await;
    t.seed_person_messages("alice", "bob", 4).await;

    let (status, body) = t
        .post(
            "/conversations/clearUnread",
            json!({"uid": "bob", "channel_id": "alice", "channel_type": 1}),
        )
        .await;
    assert!(status.is_success(), "body: {body}");

    let fake = fake_channel_id("alice", "bob");
    let node = t.node.clone();
    let fake2 = fake.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            node.store
                .conversation("bob", &fake2, 1)
                .unwrap()
                .map(|c| c.readed_to_msg_seq == 4 && c.unread_count == 0)
                .unwrap_or(false)
        })
        .await,
        "conversation row not updated"
    );
    t.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_unread_clamps_overflow_to_one() {
    let t = TestNode::start().await;
    t.seed_person_messages("alice", "bob", 10).await;

    let (status, body) = t
        .post(
            "/conversations/setUnread",
            json!({"uid": "bob", "channel_id": "alice", "channel_type": 1, "unread": 100}),
        )
        .await;
    assert!(status.is_success(), "body: {body}");

    let fake = fake_channel_id("alice", "bob");
    let node = t.node.clone();
    let fake2 = fake.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            node.store
                .conversation("bob", &fake2, 1)
                .unwrap()
                .map(|c| c.unread_count == 1 && c.readed_to_msg_seq == 9)
                .unwrap_or(false)
        })
        .await,
        "overflow clamp not applied"
    );

    // Plain set: unread 3 of 10 means read through 7.
    let (status, _) = t
        .post(
            "/conversations/setUnread",
            json!({"uid": "bob", "channel_id": "alice", "channel_type": 1, "unread": 3}),
        )
        .await;
    assert!(status.is_success());
    let node = t.node.clone();
    let fake2 = fake.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            node.store
                .conversation("bob", &fake2, 1)
                .unwrap()
                .map(|c| c.unread_count == 3 && c.readed_to_msg_seq == 7)
                .unwrap_or(false)
        })
        .await
    );
    t.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn set_unread_on_empty_channel_clamps_at_zero() {
    let t = TestNode::start().await;
    let (status, _) = t
        .post(
            "/conversations/setUnread",
            json!({"uid": "bob", "channel_id": "nobody", "channel_type": 1, "unread": 5}),
        )
        .await;
    assert!(status.is_success());

    let fake = fake_channel_id("bob", "nobody");
    let node = t.node.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            node.store
                .conversation("bob", &fake, 1)
                .unwrap()
                .map(|c| c.readed_to_msg_seq == 0 && c.unread_count == 1)
                .unwrap_or(false)
        })
        .await,
        "empty-channel clamp not applied"
    );
    t.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn delete_conversation_removes_row() {
    let t = TestNode::start().await;
    t.seed_person_messages("alice", "bob", 2).await;
    let fake = fake_channel_id("alice", "bob");

    // Make sure a row exists first.
    let (status, _) = t
        .post(
            "/conversations/clearUnread",
            json!({"uid": "bob", "channel_id": "alice", "channel_type": 1}),
        )
        .await;
    assert!(status.is_success());
    let node = t.node.clone();
    let fake2 = fake.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            node.store.conversation("bob", &fake2, 1).unwrap().is_some()
        })
        .await
    );

    let (status, _) = t
        .post(
            "/conversations/delete",
            json!({"uid": "bob", "channel_id": "alice", "channel_type": 1}),
        )
        .await;
    assert!(status.is_success());
    let node = t.node.clone();
    let fake2 = fake.clone();
    assert!(
        wait_until(Duration::from_secs(5), move || {
            node.store.conversation("bob", &fake2, 1).unwrap().is_none()
        })
        .await,
        "row not deleted"
    );
    t.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn validation_errors_are_400_with_msg_body() {
    let t = TestNode::start().await;
    let (status, body) = t
        .post(
            "/conversations/clearUnread",
            json!({"uid": "", "channel_id": "alice", "channel_type": 1}),
        )
        .await;
    assert_eq!(status.as_u16(), 400);
    assert!(body["msg"].as_str().unwrap().contains("uid"));

    let (status, _) = t
        .post("/conversations/setUnread", json!({"uid": "x"}))
        .await;
    assert_eq!(status.as_u16(), 400);
    t.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_merges_cache_over_persisted_rows() {
    let t = TestNode::start().await;
    // Seqs 1..=5 from alice.
    t.seed_person_messages("alice", "bob", 5).await;

    // Persisted row: read through 2 (unread 3 of 5).
    let (status, _) = t
        .post(
            "/conversations/setUnread",
            json!({"uid": "bob", "channel_id": "alice", "channel_type": 1, "unread": 3}),
        )
        .await;
    assert!(status.is_success());

    // Bob replies: seq 6, and his hot cache now knows readed=6.
    t.seed_person_messages("bob", "alice", 1).await;
    let node = t.node.clone();
    assert!(
        wait_until(Duration::from_secs(10), move || {
            node.conversations
                .user_cache("bob")
                .iter()
                .any(|c| c.readed_to_msg_seq == 6)
        })
        .await,
        "bob's cache never saw his own message"
    );

    // Client supplies a floor of 3; cache (6) wins over persisted (2).
    let (status, body) = t
        .post(
            "/conversation/sync",
            json!({
                "uid": "bob",
                "version": 0,
                "last_msg_seqs": "alice:1:3",
                "msg_count": 10,
            }),
        )
        .await;
    assert!(status.is_success(), "body: {body}");
    let list = body.as_array().expect("array of conversations");
    let convo = list
        .iter()
        .find(|c| c["channel_id"] == "alice")
        .expect("conversation with alice");
    assert_eq!(convo["readed_to_msg_seq"].as_u64().unwrap(), 6);
    assert_eq!(convo["last_msg_seq"].as_u64().unwrap(), 6);
    assert_eq!(convo["unread"].as_u64().unwrap(), 0);
    // Recents start at the effective floor: only seq 6 qualifies.
    let recents = convo["recents"].as_array().unwrap();
    assert_eq!(recents.len(), 1);
    assert_eq!(recents[0]["message_seq"].as_u64().unwrap(), 6);

    t.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sync_messages_defaults_to_fifteen_and_orders_newest_first() {
    let t = TestNode::start().await;
    t.seed_person_messages("alice", "bob", 20).await;

    let (status, body) = t
        .post(
            "/conversation/syncMessages",
            json!({
                "uid": "bob",
                "channels": [{"channel_id": "alice", "channel_type": 1, "last_msg_seq": 0}],
            }),
        )
        .await;
    assert!(status.is_success(), "body: {body}");
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    let messages = list[0]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 15, "default msg_count");
    // Reverse-chronological: newest first.
    assert_eq!(messages[0]["message_seq"].as_u64().unwrap(), 20);
    assert_eq!(messages[14]["message_seq"].as_u64().unwrap(), 6);

    t.node.shutdown().await;
}
