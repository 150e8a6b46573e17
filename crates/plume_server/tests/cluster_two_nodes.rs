//! Two-node cluster scenarios: request forwarding, channel replication,
//! proxy publishing and cross-node delivery.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use plume_replica::NodeId;
use plume_server::key::{channel_key, CHANNEL_TYPE_GROUP};
use plume_server::sinks::AckCode;
use plume_server::{Node, NodeOptions, PeerSpec};

use common::{free_addr, wait_until, MarkerDecryptor, Recorder, RecorderAck, RecorderDeliver};

struct TwoNodes {
    _dirs: (tempfile::TempDir, tempfile::TempDir),
    node1: Arc<Node>,
    node2: Arc<Node>,
    rec1: Arc<Recorder>,
    rec2: Arc<Recorder>,
}

impl TwoNodes {
    async fn start() -> Self {
        let c1 = free_addr();
        let c2 = free_addr();
        let a1 = free_addr();
        let a2 = free_addr();
        let peers = vec![
            PeerSpec {
                id: 1,
                addr: c1,
                api_url: format!("http://{a1}"),
            },
            PeerSpec {
                id: 2,
                addr: c2,
                api_url: format!("http://{a2}"),
            },
        ];

        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let rec1 = Recorder::new();
        let rec2 = Recorder::new();

        let mut opts1 = NodeOptions::new(1, dir1.path());
        opts1.listen_cluster = c1;
        opts1.listen_api = a1;
        opts1.slot_count = 8;
        opts1.replica_count = 2;
        opts1.peers = peers.clone();

        let mut opts2 = NodeOptions::new(2, dir2.path());
        opts2.listen_cluster = c2;
        opts2.listen_api = a2;
        opts2.slot_count = 8;
        opts2.replica_count = 2;
        opts2.peers = peers;

        let node1 = Node::start_with_sinks(
            opts1,
            Arc::new(RecorderDeliver(rec1.clone())),
            Arc::new(RecorderAck(rec1.clone())),
            Arc::new(MarkerDecryptor),
        )
        .await
        .unwrap();
        let node2 = Node::start_with_sinks(
            opts2,
            Arc::new(RecorderDeliver(rec2.clone())),
            Arc::new(RecorderAck(rec2.clone())),
            Arc::new(MarkerDecryptor),
        )
        .await
        .unwrap();

        Self {
            _dirs: (dir1, dir2),
            node1,
            node2,
            rec1,
            rec2,
        }
    }

    async fn stop(self) {
        self.node1.shutdown().await;
        self.node2.shutdown().await;
    }
}

/// First key with the given prefix whose slot leader is `leader`.
fn key_owned_by(node: &Node, leader: NodeId, prefix: &str) -> String {
    (0..10_000)
        .map(|i| format!("{prefix}{i}"))
        .find(|key| node.cluster.slot_leader_of(key) == leader)
        .expect("no key hashed onto the wanted leader")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clear_unread_forwards_to_slot_leader() {
    let t = TwoNodes::start().await;
    let uid = key_owned_by(&t.node1, 1, "user");
    let peer = key_owned_by(&t.node1, 2, "peer");
    // Both nodes converge on the same slot leader.
    let node2 = t.node2.clone();
    let uid_probe = uid.clone();
    assert!(
        wait_until(Duration::from_secs(10), move || {
            node2.cluster.slot_leader_of(&uid_probe) == 1
        })
        .await,
        "nodes never agreed on the slot leader"
    );

    // Seed the person channel so there is something to mark read. Publish on
    // whichever node leads the channel.
    let fake = plume_server::key::fake_channel_id(&uid, &peer);
    let channel_leader = t.node1.cluster.slot_leader_of(&fake);
    let publisher = if channel_leader == 1 { &t.node1 } else { &t.node2 };
    publisher
        .send_channel_message(&uid, 1, &peer, 1, false, Bytes::from_static(b"hello"))
        .unwrap();
    // Both nodes replicate the channel, and clearUnread reads the log on the
    // slot leader, so wait for the entry to land on both stores.
    let key = channel_key(&fake, 1);
    let (s1, s2) = (t.node1.store.clone(), t.node2.store.clone());
    let key2 = key.clone();
    assert!(
        wait_until(Duration::from_secs(15), move || {
            s1.last_msg_seq(&key2).unwrap() >= 1 && s2.last_msg_seq(&key2).unwrap() >= 1
        })
        .await,
        "seed message never replicated to both nodes"
    );

    // Hit the NON-leader node's API; it must forward to node 1.
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{}/conversations/clearUnread", t.node2.api_addr()))
        .json(&json!({"uid": uid, "channel_id": peer, "channel_type": 1}))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success(), "forwarded request failed");

    // The leader applied the mutation; replication lands it on both stores.
    let store1 = t.node1.store.clone();
    let uid2 = uid.clone();
    let fake2 = fake.clone();
    assert!(
        wait_until(Duration::from_secs(15), move || {
            store1
                .conversation(&uid2, &fake2, 1)
                .unwrap()
                .map(|c| c.readed_to_msg_seq >= 1 && c.unread_count == 0)
                .unwrap_or(false)
        })
        .await,
        "leader never applied the clearUnread"
    );
    let store2 = t.node2.store.clone();
    assert!(
        wait_until(Duration::from_secs(15), move || {
            store2
                .conversation(&uid, &fake, 1)
                .unwrap()
                .map(|c| c.unread_count == 0)
                .unwrap_or(false)
        })
        .await,
        "slot replication never reached the follower"
    );

    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_log_replicates_and_delivery_crosses_nodes() {
    let t = TwoNodes::start().await;
    // A channel led by node 1, one subscriber homed on each node.
    let room = key_owned_by(&t.node1, 1, "room");
    let ua = key_owned_by(&t.node1, 1, "ua");
    let ub = key_owned_by(&t.node1, 2, "ub");

    t.node1
        .add_subscribers(&room, CHANNEL_TYPE_GROUP, vec![ua.clone(), ub.clone()])
        .await
        .unwrap();

    t.node1
        .send_channel_message(&ua, 1, &room, CHANNEL_TYPE_GROUP, false, Bytes::from_static(b"cross"))
        .unwrap();

    // ub's slot leader is node 2, so its delivery travels node1 → node2.
    let rec2 = t.rec2.clone();
    let ub2 = ub.clone();
    assert!(
        wait_until(Duration::from_secs(15), move || {
            !rec2.deliveries_for(&ub2).is_empty()
        })
        .await,
        "cross-node delivery never arrived"
    );
    let delivery = &t.rec2.deliveries_for(&ub)[0];
    assert_eq!(delivery.messages[0].message_seq, 1);
    assert_eq!(delivery.messages[0].payload, Bytes::from_static(b"cross"));

    // ua is local to node 1.
    let rec1 = t.rec1.clone();
    let ua2 = ua.clone();
    assert!(
        wait_until(Duration::from_secs(15), move || {
            !rec1.deliveries_for(&ua2).is_empty()
        })
        .await
    );

    // The follower replica catches up through the pull loop.
    let store2 = t.node2.store.clone();
    let key = channel_key(&room, CHANNEL_TYPE_GROUP);
    assert!(
        wait_until(Duration::from_secs(15), move || {
            store2.last_msg_seq(&key).unwrap() >= 1
        })
        .await,
        "follower replica never synced the channel log"
    );

    t.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_node_forwards_publish_to_leader_and_acks_origin() {
    let t = TwoNodes::start().await;
    let room = key_owned_by(&t.node1, 1, "proxyroom");
    let ua = key_owned_by(&t.node1, 1, "pa");
    let ub = key_owned_by(&t.node1, 2, "pb");

    t.node1
        .add_subscribers(&room, CHANNEL_TYPE_GROUP, vec![ua.clone(), ub.clone()])
        .await
        .unwrap();

    // Publish on node 2, which is NOT the channel leader: the pipeline there
    // runs as a proxy and forwards the batch.
    let message_id = t
        .node2
        .send_channel_message(&ub, 9, &room, CHANNEL_TYPE_GROUP, false, Bytes::from_static(b"via proxy"))
        .unwrap();

    // The ack comes back to the origin node's connection layer with the
    // sequence the leader assigned.
    let rec2 = t.rec2.clone();
    assert!(
        wait_until(Duration::from_secs(15), move || {
            rec2.acks()
                .iter()
                .any(|a| a.message_id == message_id && a.code == AckCode::Ok && a.message_seq == 1)
        })
        .await,
        "origin node never saw the ack"
    );

    // And the message is in the leader's log.
    assert_eq!(
        t.node1
            .store
            .last_msg_seq(&channel_key(&room, CHANNEL_TYPE_GROUP))
            .unwrap(),
        1
    );

    t.stop().await;
}
