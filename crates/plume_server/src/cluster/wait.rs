//! Commit-wait tickets for proposed messages.
//!
//! A proposer registers the message ids of a batch and receives a one-shot
//! channel. The shard runtime records each id's assigned log index at propose
//! time and completes every fully-covered ticket when the apply path observes
//! the commit range. A timed-out ticket is abandoned by the caller; the
//! proposal itself is never rescinded.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::error::ClusterError;

/// Outcome for one proposed message: the log index it committed at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageItem {
    pub message_id: u64,
    pub index: u64,
}

pub type WaitResult = Result<Vec<MessageItem>, ClusterError>;

struct Waiter {
    key: String,
    pending: Vec<u64>,
    assigned: HashMap<u64, u64>,
    max_index: u64,
    tx: Option<oneshot::Sender<WaitResult>>,
}

#[derive(Default)]
pub struct MessageWait {
    waiters: Vec<Waiter>,
}

impl MessageWait {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_wait(&mut self, key: String, message_ids: Vec<u64>) -> oneshot::Receiver<WaitResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter {
            key,
            pending: message_ids,
            assigned: HashMap::new(),
            max_index: 0,
            tx: Some(tx),
        });
        rx
    }

    pub fn did_propose(&mut self, key: &str, message_id: u64, index: u64) {
        for w in &mut self.waiters {
            if w.key == key {
                if let Some(pos) = w.pending.iter().position(|id| *id == message_id) {
                    w.pending.swap_remove(pos);
                    w.assigned.insert(message_id, index);
                    w.max_index = w.max_index.max(index);
                }
                return;
            }
        }
    }

    /// Complete tickets fully contained in `[.., end_index)`.
    pub fn did_commit(&mut self, end_index: u64) {
        self.waiters.retain_mut(|w| {
            if !w.pending.is_empty() || w.max_index >= end_index {
                return true;
            }
            let mut items: Vec<MessageItem> = w
                .assigned
                .drain()
                .map(|(message_id, index)| MessageItem { message_id, index })
                .collect();
            items.sort_by_key(|i| i.index);
            if let Some(tx) = w.tx.take() {
                let _ = tx.send(Ok(items));
            }
            false
        });
    }

    /// Fail a ticket before its proposal was accepted (role changes, shutdown).
    pub fn fail(&mut self, key: &str, err: ClusterError) {
        self.waiters.retain_mut(|w| {
            if w.key != key {
                return true;
            }
            if let Some(tx) = w.tx.take() {
                let _ = tx.send(Err(err_clone(&err)));
            }
            false
        });
    }

    pub fn fail_all(&mut self, err: ClusterError) {
        for w in &mut self.waiters {
            if let Some(tx) = w.tx.take() {
                let _ = tx.send(Err(err_clone(&err)));
            }
        }
        self.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

// ClusterError is not Clone (anyhow inside); reproduce the variants tickets
// actually receive.
fn err_clone(err: &ClusterError) -> ClusterError {
    match err {
        ClusterError::NotLeader { shard, leader } => ClusterError::NotLeader {
            shard: shard.clone(),
            leader: *leader,
        },
        ClusterError::Stopped => ClusterError::Stopped,
        ClusterError::ProposeTimeout => ClusterError::ProposeTimeout,
        other => ClusterError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_completes_once_commit_covers_it() {
        let mut wait = MessageWait::new();
        let mut rx = wait.add_wait("k1".into(), vec![10, 11]);
        wait.did_propose("k1", 10, 5);
        wait.did_propose("k1", 11, 6);

        // Commit below the ticket's range leaves it pending.
        wait.did_commit(6);
        assert!(rx.try_recv().is_err());
        assert_eq!(wait.len(), 1);

        wait.did_commit(7);
        let items = rx.try_recv().unwrap().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], MessageItem { message_id: 10, index: 5 });
        assert_eq!(items[1], MessageItem { message_id: 11, index: 6 });
        assert!(wait.is_empty());
    }

    #[test]
    fn unproposed_ticket_never_completes() {
        let mut wait = MessageWait::new();
        let mut rx = wait.add_wait("k1".into(), vec![10, 11]);
        wait.did_propose("k1", 10, 5);
        wait.did_commit(100);
        assert!(rx.try_recv().is_err());
        assert_eq!(wait.len(), 1);
    }

    #[test]
    fn failed_ticket_reports_error() {
        let mut wait = MessageWait::new();
        let mut rx = wait.add_wait("k1".into(), vec![10]);
        wait.fail("k1", ClusterError::Stopped);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(ClusterError::Stopped)
        ));
    }
}
