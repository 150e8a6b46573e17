//! One partition: a replica engine plus its event handler.
//!
//! The handler owns four queues (proposals, ordered durable-append tasks,
//! ordered apply tasks, unordered get-logs tasks) and drains them in six
//! fixed phases per cycle. Any phase that changes state reports an event and
//! the owning reactor loop re-runs the cycle until the partition is
//! quiescent. Storage work runs on the blocking pool; completions re-enter
//! through the task queues and re-arm the loop via the advance handle.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use plume_replica::{Log, Message, MessageKind, NodeId, Replica};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::ClusterError;
use crate::store::Store;

use super::reactor::AdvanceHandle;
use super::transport::{Frame, FrameKind};
use super::wait::MessageWait;
use super::{ClusterTransport, LogApplier, ShardIdent};

/// Externally-submitted proposal batch awaiting index/term assignment.
pub struct ProposeReq {
    pub key: String,
    pub logs: Vec<Log>,
}

/// Queues shared with producers outside the owning reactor loop.
pub struct PartitionShared {
    pub inbound: Mutex<VecDeque<Message>>,
    pub proposes: Mutex<VecDeque<ProposeReq>>,
    pub wait: Mutex<MessageWait>,
    pub leader: AtomicU64,
    pub term: AtomicU32,
}

impl PartitionShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inbound: Mutex::new(VecDeque::new()),
            proposes: Mutex::new(VecDeque::new()),
            wait: Mutex::new(MessageWait::new()),
            leader: AtomicU64::new(0),
            term: AtomicU32::new(0),
        })
    }
}

/// Completion slot for one in-flight storage task.
pub struct TaskState {
    finished: AtomicBool,
    resp: Mutex<Option<Message>>,
    error: Mutex<Option<String>>,
}

impl TaskState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            finished: AtomicBool::new(false),
            resp: Mutex::new(None),
            error: Mutex::new(None),
        })
    }

    fn finish_ok(&self, resp: Message) {
        *self.resp.lock().unwrap() = Some(resp);
        self.finished.store(true, Ordering::Release);
    }

    fn finish_err(&self, err: String) {
        *self.error.lock().unwrap() = Some(err);
        self.finished.store(true, Ordering::Release);
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Leadership observation emitted whenever a partition's view changes.
#[derive(Clone, Debug)]
pub struct LeaderChange {
    pub ident: ShardIdent,
    pub leader: NodeId,
    pub term: u32,
}

pub struct Partition {
    pub ident: ShardIdent,
    shard_no: String,
    node_id: NodeId,
    pub replica: Replica,
    pub shared: Arc<PartitionShared>,

    append_queue: VecDeque<Arc<TaskState>>,
    apply_queue: VecDeque<Arc<TaskState>>,
    get_queue: Vec<Arc<TaskState>>,
    pending_sync_resp: Option<Message>,

    store: Arc<Store>,
    applier: Arc<dyn LogApplier>,
    transport: Arc<dyn ClusterTransport>,
    advance: AdvanceHandle,
    leader_tx: mpsc::UnboundedSender<LeaderChange>,

    max_propose_logs: usize,
    sync_limit_bytes: u64,
    seen_leader: NodeId,
    seen_term: u32,
    pub last_activity: Instant,
}

impl Partition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ident: ShardIdent,
        replica: Replica,
        store: Arc<Store>,
        applier: Arc<dyn LogApplier>,
        transport: Arc<dyn ClusterTransport>,
        advance: AdvanceHandle,
        leader_tx: mpsc::UnboundedSender<LeaderChange>,
        max_propose_logs: usize,
        sync_limit_bytes: u64,
    ) -> Self {
        let shard_no = ident.shard_no();
        let node_id = replica.node_id();
        Self {
            ident,
            shard_no,
            node_id,
            replica,
            shared: PartitionShared::new(),
            append_queue: VecDeque::new(),
            apply_queue: VecDeque::new(),
            get_queue: Vec::new(),
            pending_sync_resp: None,
            store,
            applier,
            transport,
            advance,
            leader_tx,
            max_propose_logs,
            sync_limit_bytes,
            seen_leader: 0,
            seen_term: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn shard_no(&self) -> &str {
        &self.shard_no
    }

    pub fn tick(&mut self) {
        self.replica.tick();
    }

    /// Run the six phases once. `Ok(true)` means state moved and the caller
    /// should re-run after draining ready output.
    pub fn handle_events(&mut self) -> Result<bool> {
        let mut has_event = false;
        if self.handle_proposes()? {
            has_event = true;
        }
        if self.handle_append_results()? {
            has_event = true;
        }
        if self.handle_recv_messages()? {
            has_event = true;
        }
        if self.handle_sync_resp()? {
            has_event = true;
        }
        if self.handle_get_logs_results()? {
            has_event = true;
        }
        if self.handle_apply_results()? {
            has_event = true;
        }
        Ok(has_event)
    }

    fn handle_proposes(&mut self) -> Result<bool> {
        let mut has_event = false;
        let mut proposed = 0usize;
        loop {
            let req = self.shared.proposes.lock().unwrap().pop_front();
            let Some(mut req) = req else {
                break;
            };
            if req.logs.is_empty() {
                continue;
            }
            if !self.replica.is_leader() {
                self.shared.wait.lock().unwrap().fail(
                    &req.key,
                    ClusterError::NotLeader {
                        shard: self.shard_no.clone(),
                        leader: self.replica.leader_id(),
                    },
                );
                continue;
            }
            let term = self.replica.term();
            let mut index = self.replica.last_index();
            {
                let mut wait = self.shared.wait.lock().unwrap();
                for log in &mut req.logs {
                    index += 1;
                    log.index = index;
                    log.term = term;
                    wait.did_propose(&req.key, log.id, index);
                }
            }
            proposed += req.logs.len();
            let msg = self.replica.new_propose_message(req.logs);
            self.replica.step(msg).context("step propose")?;
            has_event = true;
            if self.max_propose_logs > 0 && proposed >= self.max_propose_logs {
                // Budget reached; yield to other partitions.
                break;
            }
        }
        Ok(has_event)
    }

    fn handle_append_results(&mut self) -> Result<bool> {
        let mut has_event = false;
        while let Some(front) = self.append_queue.front() {
            if !front.is_finished() {
                break;
            }
            let task = self.append_queue.pop_front().unwrap();
            if let Some(err) = task.error.lock().unwrap().take() {
                // Append failures are fatal to the partition (crash-stop).
                bail!("append log store failed: {err}");
            }
            let resp = task.resp.lock().unwrap().take().context("append task without resp")?;
            self.replica.step(resp).context("step store append resp")?;
            has_event = true;
        }
        Ok(has_event)
    }

    fn handle_recv_messages(&mut self) -> Result<bool> {
        let msgs: Vec<Message> = {
            let mut inbound = self.shared.inbound.lock().unwrap();
            inbound.drain(..).collect()
        };
        if msgs.is_empty() {
            return Ok(false);
        }
        self.last_activity = Instant::now();
        for msg in msgs {
            if msg.kind == MessageKind::SyncResp {
                // Handled by its own phase so log mutation stays ordered
                // behind append completions.
                self.pending_sync_resp = Some(msg);
                continue;
            }
            self.replica.step(msg).context("step recv message")?;
        }
        Ok(true)
    }

    fn handle_sync_resp(&mut self) -> Result<bool> {
        let Some(msg) = self.pending_sync_resp.take() else {
            return Ok(false);
        };
        self.replica.step(msg).context("step sync resp")?;
        Ok(true)
    }

    fn handle_get_logs_results(&mut self) -> Result<bool> {
        let mut has_event = false;
        let mut remaining = Vec::with_capacity(self.get_queue.len());
        for task in self.get_queue.drain(..) {
            if !task.is_finished() {
                remaining.push(task);
                continue;
            }
            if let Some(err) = task.error.lock().unwrap().take() {
                // Sync reads are retried by the follower; log and move on.
                warn!(shard = %self.shard_no, error = %err, "get logs task failed");
            }
            if let Some(resp) = task.resp.lock().unwrap().take() {
                self.replica.step(resp).context("step sync get resp")?;
            }
            has_event = true;
        }
        self.get_queue = remaining;
        Ok(has_event)
    }

    fn handle_apply_results(&mut self) -> Result<bool> {
        let mut has_event = false;
        while let Some(front) = self.apply_queue.front() {
            if !front.is_finished() {
                break;
            }
            let task = self.apply_queue.pop_front().unwrap();
            if let Some(err) = task.error.lock().unwrap().take() {
                bail!("apply log store failed: {err}");
            }
            let resp = task.resp.lock().unwrap().take().context("apply task without resp")?;
            let applied_to = resp.index;
            self.replica.step(resp).context("step apply logs resp")?;
            // Tickets resolve once the slice is applied, so a completed
            // propose-wait implies read-your-writes on the state machine.
            self.shared.wait.lock().unwrap().did_commit(applied_to + 1);
            has_event = true;
        }
        Ok(has_event)
    }

    /// Drain ready output: dispatch local storage work, send the rest.
    pub fn process_ready(&mut self) {
        if self.replica.has_ready() {
            let ready = self.replica.ready();
            for msg in ready.messages {
                if msg.to == self.node_id {
                    match msg.kind {
                        MessageKind::StoreAppend => self.start_append(msg),
                        MessageKind::SyncGet => self.start_get_logs(msg),
                        MessageKind::ApplyLogsReq => self.start_apply(msg),
                        other => {
                            warn!(shard = %self.shard_no, kind = other.as_str(), "unexpected local message");
                        }
                    }
                } else if msg.to == 0 {
                    warn!(shard = %self.shard_no, kind = msg.kind.as_str(), "message without target");
                } else {
                    let frame = Frame::replica(self.frame_kind(), &self.shard_no, &msg);
                    self.transport.send(msg.to, frame);
                }
            }
        }
        self.publish_state();
    }

    fn frame_kind(&self) -> FrameKind {
        match self.ident {
            ShardIdent::Slot(_) => FrameKind::SlotMsg,
            ShardIdent::Channel { .. } => FrameKind::ChannelMsg,
        }
    }

    fn publish_state(&mut self) {
        let leader = self.replica.leader_id();
        let term = self.replica.term();
        self.shared.leader.store(leader, Ordering::Relaxed);
        self.shared.term.store(term, Ordering::Relaxed);
        if leader != self.seen_leader || term != self.seen_term {
            self.seen_leader = leader;
            self.seen_term = term;
            if leader != 0 {
                let _ = self.leader_tx.send(LeaderChange {
                    ident: self.ident.clone(),
                    leader,
                    term,
                });
            }
        }
    }

    fn start_append(&mut self, msg: Message) {
        let Some(last) = msg.logs.last() else {
            return;
        };
        let task = TaskState::new();
        self.append_queue.push_back(task.clone());

        let resp = self.replica.new_store_append_resp(last.index);
        let store = self.store.clone();
        let shard_no = self.shard_no.clone();
        let advance = self.advance.clone();
        let logs = msg.logs;
        tokio::task::spawn_blocking(move || {
            match store.append_logs(&shard_no, &logs) {
                Ok(()) => task.finish_ok(resp),
                Err(err) => {
                    error!(shard = %shard_no, error = %err, "append logs failed");
                    task.finish_err(err.to_string());
                }
            }
            advance.notify();
        });
    }

    fn start_get_logs(&mut self, msg: Message) {
        if msg.index == 0 {
            return;
        }
        let task = TaskState::new();
        self.get_queue.push(task.clone());

        let mut resp = self.replica.new_sync_get_resp(msg.from, msg.index, Vec::new());
        let store = self.store.clone();
        let shard_no = self.shard_no.clone();
        let advance = self.advance.clone();
        let limit = self.sync_limit_bytes;
        let unstable = msg.logs;
        let start = msg.index;
        tokio::task::spawn_blocking(move || {
            let result = load_slice(&store, &shard_no, start, limit, unstable);
            match result {
                Ok(logs) => {
                    resp.logs = logs;
                    task.finish_ok(resp);
                }
                Err(err) => {
                    warn!(shard = %shard_no, error = %err, "load sync slice failed");
                    // Answer empty so the leader's fetch slot clears; the
                    // follower will simply ask again.
                    task.finish_ok(resp);
                }
            }
            advance.notify();
        });
    }

    fn start_apply(&mut self, msg: Message) {
        let applying = msg.applying_index;
        let committed = msg.committed_index;
        if committed <= applying {
            return;
        }
        let task = TaskState::new();
        self.apply_queue.push_back(task.clone());

        let resp = self.replica.new_apply_logs_resp(committed);
        let store = self.store.clone();
        let applier = self.applier.clone();
        let ident = self.ident.clone();
        let shard_no = self.shard_no.clone();
        let advance = self.advance.clone();
        tokio::task::spawn_blocking(move || {
            let result = (|| -> Result<()> {
                let logs = store.read_logs(&shard_no, applying + 1, committed + 1, 0)?;
                applier.apply(&ident, &logs)?;
                store.set_applied_index(&shard_no, committed)?;
                Ok(())
            })();
            match result {
                Ok(()) => task.finish_ok(resp),
                Err(err) => {
                    error!(shard = %shard_no, error = %err, "apply logs failed");
                    task.finish_err(err.to_string());
                }
            }
            advance.notify();
        });
    }
}

fn load_slice(
    store: &Store,
    shard_no: &str,
    start: u64,
    limit_bytes: u64,
    unstable: Vec<Log>,
) -> Result<Vec<Log>> {
    let stored_last = store.log_last_index(shard_no)?;
    let mut logs = if start <= stored_last {
        store.read_logs(shard_no, start, stored_last + 1, limit_bytes)?
    } else {
        Vec::new()
    };
    // Splice the in-memory suffix only when the stored read came back whole;
    // a byte-capped partial read must not leave an index gap.
    let read_through = logs
        .last()
        .map(|l| l.index)
        .unwrap_or_else(|| stored_last.min(start.saturating_sub(1)));
    if read_through >= stored_last {
        let mut next = read_through.max(start.saturating_sub(1)) + 1;
        for log in unstable {
            if log.index == next {
                next += 1;
                logs.push(log);
            }
        }
    }
    Ok(logs)
}
