//! Worker loops driving partitions through their tick/ready cycles.
//!
//! Partitions are assigned to one of N sub-loops by shard-key hash and are
//! only ever touched from their owning loop; everything that crosses loops
//! goes through the shared queues on the partition. A loop wakes on its tick
//! cadence or when an advance handle is poked (new proposal, inbound frame,
//! finished storage task) and re-runs each partition until quiescent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::ClusterError;

use super::shard::Partition;

/// Wakes the reactor loop owning one partition.
#[derive(Clone)]
pub struct AdvanceHandle(Arc<Notify>);

impl AdvanceHandle {
    pub fn notify(&self) {
        self.0.notify_one();
    }
}

pub struct ReactorSub {
    notify: Arc<Notify>,
    partitions: Mutex<HashMap<String, Partition>>,
}

pub struct Reactor {
    subs: Vec<Arc<ReactorSub>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl Reactor {
    pub fn start(sub_count: usize, tick_interval: Duration) -> Arc<Self> {
        let sub_count = sub_count.max(1);
        let shutdown = CancellationToken::new();
        let mut subs = Vec::with_capacity(sub_count);
        let mut handles = Vec::with_capacity(sub_count);
        for _ in 0..sub_count {
            let sub = Arc::new(ReactorSub {
                notify: Arc::new(Notify::new()),
                partitions: Mutex::new(HashMap::new()),
            });
            handles.push(tokio::spawn(run_sub(
                sub.clone(),
                tick_interval,
                shutdown.clone(),
            )));
            subs.push(sub);
        }
        Arc::new(Self {
            subs,
            handles: Mutex::new(handles),
            shutdown,
        })
    }

    fn sub_for(&self, shard_no: &str) -> &Arc<ReactorSub> {
        let idx = crc32fast::hash(shard_no.as_bytes()) as usize % self.subs.len();
        &self.subs[idx]
    }

    pub fn advance_handle(&self, shard_no: &str) -> AdvanceHandle {
        AdvanceHandle(self.sub_for(shard_no).notify.clone())
    }

    pub fn insert_partition(&self, partition: Partition) {
        let sub = self.sub_for(partition.shard_no());
        sub.partitions
            .lock()
            .unwrap()
            .insert(partition.shard_no().to_string(), partition);
        sub.notify.notify_one();
    }

    pub fn contains(&self, shard_no: &str) -> bool {
        self.sub_for(shard_no)
            .partitions
            .lock()
            .unwrap()
            .contains_key(shard_no)
    }

    /// Run `f` against a partition from outside its loop. Keep it short: the
    /// owning loop is blocked for the duration.
    pub fn with_partition<T>(
        &self,
        shard_no: &str,
        f: impl FnOnce(&mut Partition) -> T,
    ) -> Option<T> {
        let sub = self.sub_for(shard_no);
        let mut parts = sub.partitions.lock().unwrap();
        parts.get_mut(shard_no).map(f)
    }

    pub fn remove_partition(&self, shard_no: &str) {
        let sub = self.sub_for(shard_no);
        let removed = sub.partitions.lock().unwrap().remove(shard_no);
        if let Some(p) = removed {
            p.shared.wait.lock().unwrap().fail_all(ClusterError::Stopped);
        }
    }

    pub fn advance(&self, shard_no: &str) {
        self.sub_for(shard_no).notify.notify_one();
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

async fn run_sub(sub: Arc<ReactorSub>, tick_interval: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        let mut do_tick = false;
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sub.notify.notified() => {}
            _ = interval.tick() => {
                do_tick = true;
            }
        }

        let mut failed: Vec<String> = Vec::new();
        {
            let mut parts = sub.partitions.lock().unwrap();
            for (key, partition) in parts.iter_mut() {
                if do_tick {
                    partition.tick();
                }
                let mut rounds = 0u32;
                loop {
                    match partition.handle_events() {
                        Ok(has_event) => {
                            partition.process_ready();
                            if !has_event {
                                break;
                            }
                        }
                        Err(err) => {
                            // Crash-stop: drop the partition, it is rebuilt
                            // from persistent state on next use.
                            error!(shard = %key, error = %err, "partition failed");
                            failed.push(key.clone());
                            break;
                        }
                    }
                    rounds += 1;
                    if rounds > 1024 {
                        warn!(shard = %key, "partition did not quiesce, yielding");
                        break;
                    }
                }
            }
            for key in failed {
                if let Some(p) = parts.remove(&key) {
                    p.shared.wait.lock().unwrap().fail_all(ClusterError::Stopped);
                }
            }
        }
    }
}
