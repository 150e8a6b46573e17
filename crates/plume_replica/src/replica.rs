//! Tick-driven replica engine.
//!
//! Replication is pull-based: the leader never pushes log deltas. Followers
//! periodically send `Sync(index = stable + 1)`; the leader answers with a
//! byte-bounded slice and piggybacks its term and commit index on every
//! response, empty ones included. A follower keeps at most one `Sync` in
//! flight and re-arms it when the response arrives or after a timeout.
//!
//! Commit requires a majority of replicas (the leader included) to have
//! persisted through an index, and the entry at that index must originate in
//! the leader's current term. Prior-term entries commit only by riding behind
//! a current-term commit.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, ensure, Result};
use rand::Rng;
use tracing::{debug, info, warn};

use crate::types::{Config, Log, Message, MessageKind, NodeId, Ready, Role, Term};

pub struct Replica {
    cfg: Config,

    role: Role,
    term: Term,
    leader_id: NodeId,
    voted_for: Option<NodeId>,
    votes: HashSet<NodeId>,

    /// Highest index in the log, unstable suffix included.
    last_index: u64,
    /// Term of the entry at `last_index` (best effort across truncation).
    last_term: Term,
    /// Highest index durably persisted.
    stable_index: u64,
    committed_index: u64,
    applied_index: u64,
    /// First index of the current leader term. Commit never advances into a
    /// range below this watermark (current-term safety clause).
    term_start_index: u64,

    /// Entries in `(stable_index, last_index]` awaiting durable append.
    unstable: VecDeque<Log>,

    /// Leader: next index each follower asked for. A request for `i` is an
    /// acknowledgement that the follower has persisted through `i - 1`.
    follower_sync: HashMap<NodeId, u64>,
    /// Leader: followers with an outstanding local `SyncGet` disk read.
    fetching: HashSet<NodeId>,

    /// Follower: highest commit index learned from the leader. Local commit
    /// trails this by the durability of the local log.
    leader_committed: u64,
    /// Follower: start index of the in-flight `Sync`, if any.
    sync_inflight: Option<u64>,
    sync_elapsed: u32,
    sync_soon: bool,
    /// Follower: the uncommitted suffix predates the current leader and must
    /// be re-validated against the leader's log before commit may advance.
    /// While set, pulls start at `committed + 1` instead of `stable + 1`.
    needs_resync: bool,

    /// In-flight self-addressed work.
    appending: bool,
    applying: bool,

    election_elapsed: u32,
    randomized_election_ticks: u32,
    heartbeat_elapsed: u32,

    outbox: Vec<Message>,
}

impl Replica {
    pub fn new(cfg: Config) -> Self {
        let randomized = randomized_timeout(cfg.election_ticks);
        Self {
            cfg,
            role: Role::Follower,
            term: 0,
            leader_id: 0,
            voted_for: None,
            votes: HashSet::new(),
            last_index: 0,
            last_term: 0,
            stable_index: 0,
            committed_index: 0,
            applied_index: 0,
            term_start_index: 0,
            unstable: VecDeque::new(),
            follower_sync: HashMap::new(),
            fetching: HashSet::new(),
            leader_committed: 0,
            sync_inflight: None,
            sync_elapsed: 0,
            sync_soon: false,
            needs_resync: false,
            appending: false,
            applying: false,
            election_elapsed: 0,
            randomized_election_ticks: randomized,
            heartbeat_elapsed: 0,
            outbox: Vec::new(),
        }
    }

    /// Restore indexes from persistent state at partition creation.
    pub fn set_initial_state(&mut self, last_index: u64, last_term: Term, applied_index: u64) {
        self.last_index = last_index;
        self.stable_index = last_index;
        self.last_term = last_term;
        self.applied_index = applied_index;
        self.committed_index = applied_index;
        self.leader_committed = applied_index;
    }

    pub fn shard_no(&self) -> &str {
        &self.cfg.shard_no
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader_id(&self) -> NodeId {
        self.leader_id
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn stable_index(&self) -> u64 {
        self.stable_index
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    pub fn replicas(&self) -> &[NodeId] {
        &self.cfg.replicas
    }

    pub fn set_replicas(&mut self, replicas: Vec<NodeId>) {
        self.follower_sync.retain(|id, _| replicas.contains(id));
        self.cfg.replicas = replicas;
    }

    // ---- role transitions -------------------------------------------------

    pub fn become_leader(&mut self, term: Term) {
        if self.role == Role::Leader && self.term == term {
            return;
        }
        self.term = self.term.max(term);
        self.role = Role::Leader;
        self.leader_id = self.cfg.node_id;
        self.term_start_index = self.last_index + 1;
        self.follower_sync.clear();
        self.fetching.clear();
        self.votes.clear();
        self.sync_inflight = None;
        self.sync_soon = false;
        self.heartbeat_elapsed = 0;
        info!(
            shard = %self.cfg.shard_no,
            term = self.term,
            last_index = self.last_index,
            "become leader"
        );
        self.broadcast_ping();
        self.maybe_commit();
        self.emit_local();
    }

    pub fn become_follower(&mut self, term: Term, leader: NodeId) {
        if term > self.term {
            self.voted_for = None;
        }
        self.term = self.term.max(term);
        self.role = Role::Follower;
        self.leader_id = leader;
        self.votes.clear();
        self.fetching.clear();
        self.follower_sync.clear();
        self.sync_inflight = None;
        self.sync_elapsed = 0;
        self.sync_soon = leader != 0;
        self.needs_resync = self.last_index > self.committed_index;
        self.election_elapsed = 0;
        self.randomized_election_ticks = randomized_timeout(self.cfg.election_ticks);
        info!(
            shard = %self.cfg.shard_no,
            term = self.term,
            leader,
            "become follower"
        );
        self.emit_local();
    }

    fn become_candidate(&mut self) {
        self.term += 1;
        self.role = Role::Candidate;
        self.leader_id = 0;
        self.voted_for = Some(self.cfg.node_id);
        self.votes.clear();
        self.votes.insert(self.cfg.node_id);
        self.sync_inflight = None;
        self.election_elapsed = 0;
        self.randomized_election_ticks = randomized_timeout(self.cfg.election_ticks);
        debug!(shard = %self.cfg.shard_no, term = self.term, "start election");

        if self.votes.len() >= self.cfg.quorum() {
            self.become_leader(self.term);
            return;
        }
        for &peer in &self.cfg.replicas.clone() {
            if peer == self.cfg.node_id {
                continue;
            }
            let mut m = self.base_message(MessageKind::VoteReq, peer);
            m.index = self.last_index;
            // VoteReq reuses applying_index to carry the candidate's last
            // log term for the up-to-date check.
            m.applying_index = u64::from(self.last_term);
            self.outbox.push(m);
        }
    }

    // ---- tick -------------------------------------------------------------

    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => self.tick_heartbeat(),
            Role::Follower => self.tick_follower(),
            Role::Candidate => self.tick_election(),
        }
        self.emit_local();
    }

    fn tick_heartbeat(&mut self) {
        self.heartbeat_elapsed += 1;
        if self.heartbeat_elapsed >= self.cfg.heartbeat_ticks {
            self.heartbeat_elapsed = 0;
            self.broadcast_ping();
        }
    }

    fn tick_follower(&mut self) {
        self.election_elapsed += 1;
        if self.election_elapsed >= self.randomized_election_ticks {
            self.become_candidate();
            return;
        }

        if self.leader_id == 0 {
            return;
        }
        self.sync_elapsed += 1;
        match self.sync_inflight {
            None => {
                if self.sync_elapsed >= self.cfg.sync_interval_ticks {
                    self.sync_soon = true;
                }
            }
            Some(index) => {
                if self.sync_elapsed >= self.cfg.sync_timeout_ticks {
                    warn!(shard = %self.cfg.shard_no, index, "sync timeout, re-arming");
                    self.sync_inflight = None;
                    self.sync_soon = true;
                }
            }
        }
    }

    fn tick_election(&mut self) {
        self.election_elapsed += 1;
        if self.election_elapsed >= self.randomized_election_ticks {
            self.become_candidate();
        }
    }

    // ---- step -------------------------------------------------------------

    pub fn step(&mut self, msg: Message) -> Result<()> {
        if msg.term > self.term {
            match msg.kind {
                // Messages only a live leader sends establish leadership.
                MessageKind::Ping | MessageKind::SyncResp => {
                    self.become_follower(msg.term, msg.from);
                }
                MessageKind::VoteReq | MessageKind::AppointLeader => {
                    // Adopt the term; leadership is resolved by the handler.
                    self.voted_for = None;
                    self.term = msg.term;
                    if self.role != Role::Follower {
                        self.become_follower(msg.term, 0);
                    }
                }
                _ => {
                    self.become_follower(msg.term, 0);
                }
            }
        }

        match msg.kind {
            MessageKind::Propose => self.step_propose(msg)?,
            MessageKind::Sync => self.step_sync(msg),
            MessageKind::SyncGetResp => self.step_sync_get_resp(msg),
            MessageKind::SyncResp => self.step_sync_resp(msg)?,
            MessageKind::StoreAppendResp => self.step_store_append_resp(msg)?,
            MessageKind::ApplyLogsResp => self.step_apply_logs_resp(msg)?,
            MessageKind::Ping => self.step_ping(msg),
            MessageKind::Pong => {}
            MessageKind::VoteReq => self.step_vote_req(msg),
            MessageKind::VoteResp => self.step_vote_resp(msg),
            MessageKind::AppointLeader => self.step_appoint_leader(msg),
            MessageKind::SyncGet | MessageKind::StoreAppend | MessageKind::ApplyLogsReq => {
                bail!(
                    "{} is a local request, not steppable into the replica",
                    msg.kind.as_str()
                );
            }
        }
        self.emit_local();
        Ok(())
    }

    fn step_propose(&mut self, msg: Message) -> Result<()> {
        ensure!(self.role == Role::Leader, "propose on non-leader");
        let Some(first) = msg.logs.first() else {
            return Ok(());
        };
        ensure!(
            first.index == self.last_index + 1,
            "propose index gap: first {} last {}",
            first.index,
            self.last_index
        );
        for log in msg.logs {
            self.last_index = log.index;
            self.last_term = log.term;
            self.unstable.push_back(log);
        }
        Ok(())
    }

    /// Leader side of the pull loop. The request index doubles as the
    /// follower's durability acknowledgement.
    fn step_sync(&mut self, msg: Message) {
        if self.role != Role::Leader || msg.term < self.term {
            return;
        }
        self.follower_sync.insert(msg.from, msg.index);
        self.maybe_commit();

        if msg.index > self.last_index {
            // Nothing to hand out; answer empty so term/commit still flow.
            let mut m = self.base_message(MessageKind::SyncResp, msg.from);
            m.index = msg.index;
            m.committed_index = self.committed_index;
            self.outbox.push(m);
            return;
        }
        if !self.fetching.insert(msg.from) {
            return;
        }
        // Ask the runtime for the slice; include the unstable suffix so the
        // disk read can be merged with entries not yet persisted.
        let mut m = self.base_message(MessageKind::SyncGet, self.cfg.node_id);
        m.from = msg.from;
        m.index = msg.index;
        m.logs = self
            .unstable
            .iter()
            .filter(|l| l.index >= msg.index)
            .cloned()
            .collect();
        self.outbox.push(m);
    }

    fn step_sync_get_resp(&mut self, msg: Message) {
        self.fetching.remove(&msg.to);
        if self.role != Role::Leader {
            return;
        }
        let mut m = self.base_message(MessageKind::SyncResp, msg.to);
        m.index = msg.index;
        m.committed_index = self.committed_index;
        m.logs = msg.logs;
        self.outbox.push(m);
    }

    /// Follower side of the pull loop: accept the slice, resolving conflicts
    /// by replacing the local uncommitted suffix with the leader's.
    fn step_sync_resp(&mut self, msg: Message) -> Result<()> {
        if self.role != Role::Follower || msg.term < self.term {
            return Ok(());
        }
        self.leader_id = msg.from;
        self.election_elapsed = 0;
        self.leader_committed = self.leader_committed.max(msg.committed_index);

        let expected = self.sync_inflight.take();
        self.sync_elapsed = 0;

        if msg.logs.is_empty() {
            if self.needs_resync
                && expected == Some(msg.index)
                && !self.appending
                && self.unstable.is_empty()
            {
                // We asked from committed + 1 and the leader had nothing:
                // its log ends at our commit point, so our uncommitted
                // suffix is stale. Abandon it; the store is rewritten by
                // whatever the leader appends next.
                self.last_index = self.committed_index;
                self.stable_index = self.committed_index;
                self.needs_resync = false;
            }
            self.advance_follower_commit();
            return Ok(());
        }

        // Only the response to our in-flight request mutates the log;
        // anything else is stale or duplicated by the transport.
        if expected != Some(msg.index) || self.appending || !self.unstable.is_empty() {
            self.sync_soon = true;
            self.advance_follower_commit();
            return Ok(());
        }
        let mut incoming: Vec<Log> = msg
            .logs
            .into_iter()
            .filter(|l| l.index > self.committed_index)
            .collect();
        if let Some(first) = incoming.first() {
            if first.index > self.last_index + 1 {
                // Gap: request again from our own frontier.
                self.sync_soon = true;
                self.advance_follower_commit();
                return Ok(());
            }
            if first.index <= self.last_index {
                // The leader's log wins over our uncommitted suffix. The
                // storage adapter truncates on append, so rolling the
                // stable watermark back is all that is needed here.
                let start = first.index;
                while self.unstable.back().is_some_and(|l| l.index >= start) {
                    self.unstable.pop_back();
                }
                if start <= self.stable_index {
                    self.stable_index = start - 1;
                }
                self.last_index = start - 1;
            }
            for log in incoming.drain(..) {
                ensure!(
                    log.index == self.last_index + 1,
                    "sync resp slice not contiguous at {}",
                    log.index
                );
                self.last_index = log.index;
                self.last_term = log.term;
                self.unstable.push_back(log);
            }
            self.needs_resync = false;
        }
        // More may be waiting on the leader; pull again as soon as this
        // batch is durable.
        self.sync_soon = true;

        self.advance_follower_commit();
        Ok(())
    }

    fn step_store_append_resp(&mut self, msg: Message) -> Result<()> {
        ensure!(!msg.reject, "store append failed at {}", msg.index);
        self.appending = false;
        if msg.index > self.stable_index {
            self.stable_index = msg.index;
        }
        while self
            .unstable
            .front()
            .is_some_and(|l| l.index <= self.stable_index)
        {
            self.unstable.pop_front();
        }
        if self.role == Role::Leader {
            self.maybe_commit();
        } else {
            self.advance_follower_commit();
        }
        Ok(())
    }

    fn step_apply_logs_resp(&mut self, msg: Message) -> Result<()> {
        self.applying = false;
        ensure!(
            msg.index <= self.committed_index,
            "applied index {} beyond committed {}",
            msg.index,
            self.committed_index
        );
        if msg.index > self.applied_index {
            self.applied_index = msg.index;
        }
        Ok(())
    }

    fn step_ping(&mut self, msg: Message) {
        if msg.term < self.term {
            return;
        }
        if self.role != Role::Follower {
            self.become_follower(msg.term, msg.from);
        }
        self.leader_id = msg.from;
        self.election_elapsed = 0;
        self.leader_committed = self.leader_committed.max(msg.committed_index);
        self.advance_follower_commit();

        let mut m = self.base_message(MessageKind::Pong, msg.from);
        m.index = self.last_index;
        self.outbox.push(m);
    }

    fn step_vote_req(&mut self, msg: Message) {
        let mut reject = msg.term < self.term;
        if !reject {
            if let Some(v) = self.voted_for {
                reject = v != msg.from;
            }
        }
        if !reject {
            let candidate_last_term = msg.applying_index as Term;
            let up_to_date = candidate_last_term > self.last_term
                || (candidate_last_term == self.last_term && msg.index >= self.last_index);
            reject = !up_to_date;
        }
        if !reject {
            self.voted_for = Some(msg.from);
            self.election_elapsed = 0;
        }
        let mut m = self.base_message(MessageKind::VoteResp, msg.from);
        m.reject = reject;
        self.outbox.push(m);
    }

    fn step_vote_resp(&mut self, msg: Message) {
        if self.role != Role::Candidate || msg.term < self.term || msg.reject {
            return;
        }
        self.votes.insert(msg.from);
        if self.votes.len() >= self.cfg.quorum() {
            self.become_leader(self.term);
        }
    }

    fn step_appoint_leader(&mut self, msg: Message) {
        let appointed = msg.index;
        if appointed == self.cfg.node_id {
            self.become_leader(msg.term.max(self.term));
        } else {
            self.become_follower(msg.term.max(self.term), appointed);
        }
    }

    // ---- commit machinery -------------------------------------------------

    fn maybe_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matches: Vec<u64> = Vec::with_capacity(self.cfg.replicas.len());
        for &id in &self.cfg.replicas {
            if id == self.cfg.node_id {
                // The leader's own vote counts only once persisted.
                matches.push(self.stable_index);
            } else {
                matches.push(
                    self.follower_sync
                        .get(&id)
                        .map(|next| next.saturating_sub(1))
                        .unwrap_or(0),
                );
            }
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let quorum = self.cfg.quorum();
        if quorum == 0 || quorum > matches.len() {
            return;
        }
        let candidate = matches[quorum - 1];
        if candidate > self.committed_index && candidate >= self.term_start_index {
            debug!(
                shard = %self.cfg.shard_no,
                committed = candidate,
                "commit advanced"
            );
            self.committed_index = candidate;
        }
    }

    fn advance_follower_commit(&mut self) {
        if self.needs_resync {
            // The suffix above committed is unvalidated; committing into it
            // could apply entries the current leader never had.
            return;
        }
        let target = self.leader_committed.min(self.stable_index);
        if target > self.committed_index {
            self.committed_index = target;
        }
    }

    // ---- ready ------------------------------------------------------------

    pub fn has_ready(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub fn ready(&mut self) -> Ready {
        Ready {
            messages: std::mem::take(&mut self.outbox),
        }
    }

    /// Emit any due self-addressed work and follower pulls. Invoked after
    /// every step and tick so progress never depends on external nudging.
    fn emit_local(&mut self) {
        // Durable append of the unstable suffix. Anything still unstable
        // with no append in flight has never been acknowledged by storage.
        if !self.appending {
            if let Some(last) = self.unstable.back() {
                let mut m = self.base_message(MessageKind::StoreAppend, self.cfg.node_id);
                m.index = last.index;
                m.logs = self.unstable.iter().cloned().collect();
                self.appending = true;
                self.outbox.push(m);
            }
        }

        // State-machine apply of newly committed entries.
        if !self.applying && self.committed_index > self.applied_index {
            let mut m = self.base_message(MessageKind::ApplyLogsReq, self.cfg.node_id);
            m.applying_index = self.applied_index;
            m.committed_index = self.committed_index;
            self.applying = true;
            self.outbox.push(m);
        }

        // Follower pull, one in flight, only when the local log is settled.
        if self.role == Role::Follower
            && self.leader_id != 0
            && self.sync_soon
            && self.sync_inflight.is_none()
            && !self.appending
            && self.unstable.is_empty()
        {
            self.sync_soon = false;
            self.sync_elapsed = 0;
            let start = if self.needs_resync {
                self.committed_index + 1
            } else {
                self.stable_index + 1
            };
            self.sync_inflight = Some(start);
            let mut m = self.base_message(MessageKind::Sync, self.leader_id);
            m.index = start;
            m.applied_index = self.applied_index;
            self.outbox.push(m);
        }
    }

    fn broadcast_ping(&mut self) {
        for &peer in &self.cfg.replicas.clone() {
            if peer == self.cfg.node_id {
                continue;
            }
            let mut m = self.base_message(MessageKind::Ping, peer);
            m.index = self.last_index;
            m.committed_index = self.committed_index;
            self.outbox.push(m);
        }
    }

    fn base_message(&self, kind: MessageKind, to: NodeId) -> Message {
        let mut m = Message::new(kind);
        m.from = self.cfg.node_id;
        m.to = to;
        m.term = self.term;
        m
    }

    // ---- message constructors used by the shard runtime -------------------

    pub fn new_propose_message(&self, logs: Vec<Log>) -> Message {
        let mut m = self.base_message(MessageKind::Propose, self.cfg.node_id);
        m.logs = logs;
        m
    }

    pub fn new_sync_get_resp(&self, follower: NodeId, start_index: u64, logs: Vec<Log>) -> Message {
        let mut m = self.base_message(MessageKind::SyncGetResp, follower);
        m.index = start_index;
        m.logs = logs;
        m
    }

    pub fn new_store_append_resp(&self, index: u64) -> Message {
        let mut m = self.base_message(MessageKind::StoreAppendResp, self.cfg.node_id);
        m.index = index;
        m
    }

    pub fn new_apply_logs_resp(&self, applied_index: u64) -> Message {
        let mut m = self.base_message(MessageKind::ApplyLogsResp, self.cfg.node_id);
        m.index = applied_index;
        m
    }
}

fn randomized_timeout(base: u32) -> u32 {
    let base = base.max(2);
    base + rand::thread_rng().gen_range(0..base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn log(index: u64, term: Term) -> Log {
        Log {
            index,
            term,
            id: index * 100,
            data: Bytes::from_static(b"payload"),
        }
    }

    fn leader(node: NodeId, replicas: Vec<NodeId>) -> Replica {
        let mut r = Replica::new(Config::new(node, "2:test", replicas));
        r.become_leader(1);
        r.ready();
        r
    }

    fn drain(r: &mut Replica) -> Vec<Message> {
        r.ready().messages
    }

    fn find(msgs: &[Message], kind: MessageKind) -> Option<Message> {
        msgs.iter().find(|m| m.kind == kind).cloned()
    }

    #[test]
    fn propose_emits_store_append_and_single_node_commits() {
        let mut r = leader(1, vec![1]);
        let propose = r.new_propose_message(vec![log(1, 1), log(2, 1)]);
        r.step(propose).unwrap();

        let msgs = drain(&mut r);
        let append = find(&msgs, MessageKind::StoreAppend).expect("store append");
        assert_eq!(append.logs.len(), 2);
        assert_eq!(append.index, 2);
        assert_eq!(r.committed_index(), 0);

        r.step(r.new_store_append_resp(2)).unwrap();
        assert_eq!(r.stable_index(), 2);
        assert_eq!(r.committed_index(), 2);

        let msgs = drain(&mut r);
        let apply = find(&msgs, MessageKind::ApplyLogsReq).expect("apply req");
        assert_eq!(apply.applying_index, 0);
        assert_eq!(apply.committed_index, 2);

        r.step(r.new_apply_logs_resp(2)).unwrap();
        assert_eq!(r.applied_index(), 2);
        assert!(r.applied_index() <= r.committed_index());
        assert!(r.committed_index() <= r.last_index());
    }

    #[test]
    fn leader_commits_on_majority_sync_ack() {
        let mut r = leader(1, vec![1, 2, 3]);
        r.step(r.new_propose_message(vec![log(1, 1), log(2, 1), log(3, 1)]))
            .unwrap();
        r.step(r.new_store_append_resp(3)).unwrap();
        drain(&mut r);
        // Own persistence alone is not a majority of three.
        assert_eq!(r.committed_index(), 0);

        // Follower 2 asks for index 4: it has persisted 1..=3.
        let mut sync = Message::new(MessageKind::Sync);
        sync.from = 2;
        sync.to = 1;
        sync.term = 1;
        sync.index = 4;
        r.step(sync).unwrap();
        assert_eq!(r.committed_index(), 3);

        // The isolated third follower catching up later changes nothing.
        let mut sync = Message::new(MessageKind::Sync);
        sync.from = 3;
        sync.to = 1;
        sync.term = 1;
        sync.index = 1;
        r.step(sync).unwrap();
        assert_eq!(r.committed_index(), 3);
    }

    #[test]
    fn leader_answers_sync_with_local_fetch_roundtrip() {
        let mut r = leader(1, vec![1, 2, 3]);
        r.step(r.new_propose_message(vec![log(1, 1), log(2, 1)]))
            .unwrap();
        r.step(r.new_store_append_resp(2)).unwrap();
        drain(&mut r);

        let mut sync = Message::new(MessageKind::Sync);
        sync.from = 2;
        sync.to = 1;
        sync.term = 1;
        sync.index = 1;
        r.step(sync).unwrap();

        let msgs = drain(&mut r);
        let get = find(&msgs, MessageKind::SyncGet).expect("sync get");
        assert_eq!(get.from, 2);
        assert_eq!(get.index, 1);

        // Runtime loads the slice and steps the response back in.
        r.step(r.new_sync_get_resp(2, 1, vec![log(1, 1), log(2, 1)]))
            .unwrap();
        let msgs = drain(&mut r);
        let resp = find(&msgs, MessageKind::SyncResp).expect("sync resp");
        assert_eq!(resp.to, 2);
        assert_eq!(resp.logs.len(), 2);
    }

    #[test]
    fn sync_request_beyond_last_gets_empty_heartbeat_resp() {
        let mut r = leader(1, vec![1, 2, 3]);
        let mut sync = Message::new(MessageKind::Sync);
        sync.from = 2;
        sync.to = 1;
        sync.term = 1;
        sync.index = 1;
        r.step(sync).unwrap();
        let msgs = drain(&mut r);
        let resp = find(&msgs, MessageKind::SyncResp).expect("empty resp");
        assert!(resp.logs.is_empty());
    }

    #[test]
    fn follower_pull_loop_appends_and_commits() {
        let mut f = Replica::new(Config::new(2, "2:test", vec![1, 2, 3]));
        f.become_follower(1, 1);
        let msgs = drain(&mut f);
        let sync = find(&msgs, MessageKind::Sync).expect("initial sync");
        assert_eq!(sync.index, 1);
        assert_eq!(sync.to, 1);

        let mut resp = Message::new(MessageKind::SyncResp);
        resp.from = 1;
        resp.to = 2;
        resp.term = 1;
        resp.index = 1;
        resp.committed_index = 2;
        resp.logs = vec![log(1, 1), log(2, 1), log(3, 1)];
        f.step(resp).unwrap();
        assert_eq!(f.last_index(), 3);
        // Commit waits for local durability.
        assert_eq!(f.committed_index(), 0);

        let msgs = drain(&mut f);
        let append = find(&msgs, MessageKind::StoreAppend).expect("append");
        assert_eq!(append.logs.len(), 3);

        f.step(f.new_store_append_resp(3)).unwrap();
        assert_eq!(f.stable_index(), 3);
        assert_eq!(f.committed_index(), 2);

        let msgs = drain(&mut f);
        assert!(find(&msgs, MessageKind::ApplyLogsReq).is_some());
        // The non-empty batch re-arms the pull immediately.
        let sync = find(&msgs, MessageKind::Sync).expect("re-armed sync");
        assert_eq!(sync.index, 4);
    }

    #[test]
    fn follower_truncates_uncommitted_suffix_on_conflict() {
        let mut f = Replica::new(Config::new(2, "2:test", vec![1, 2, 3]));
        f.become_follower(3, 1);
        drain(&mut f);

        // Old-term suffix 1..=3 persisted but never committed.
        let mut resp = Message::new(MessageKind::SyncResp);
        resp.from = 1;
        resp.to = 2;
        resp.term = 3;
        resp.index = 1;
        resp.logs = vec![log(1, 3), log(2, 3), log(3, 3)];
        f.step(resp).unwrap();
        f.step(f.new_store_append_resp(3)).unwrap();
        // The durable batch re-arms the pull; grab the armed start index.
        let msgs = drain(&mut f);
        let sync = find(&msgs, MessageKind::Sync).expect("re-armed sync");
        assert_eq!(sync.index, 4);
        assert_eq!(f.last_index(), 3);

        // A response from the term-4 leader converts us and arms a
        // re-validation pull from committed + 1 before anything commits.
        let mut resp = Message::new(MessageKind::SyncResp);
        resp.from = 3;
        resp.to = 2;
        resp.term = 4;
        resp.index = sync.index;
        resp.logs = vec![log(2, 4), log(3, 4)];
        f.step(resp).unwrap();
        let msgs = drain(&mut f);
        let resync = find(&msgs, MessageKind::Sync).expect("resync pull");
        assert_eq!(resync.to, 3);
        assert_eq!(resync.index, 1);
        assert_eq!(f.committed_index(), 0);

        // The new leader's log diverges from index 2 on; ours is replaced.
        let mut resp = Message::new(MessageKind::SyncResp);
        resp.from = 3;
        resp.to = 2;
        resp.term = 4;
        resp.index = resync.index;
        resp.logs = vec![log(1, 3), log(2, 4), log(3, 4)];
        f.step(resp).unwrap();
        assert_eq!(f.stable_index(), 0);
        assert_eq!(f.last_index(), 3);

        let msgs = drain(&mut f);
        let append = find(&msgs, MessageKind::StoreAppend).expect("rewrite append");
        assert_eq!(append.logs[0].index, 1);
        assert_eq!(append.logs[1].term, 4);
    }

    #[test]
    fn committed_entries_never_truncate() {
        let mut f = Replica::new(Config::new(2, "2:test", vec![1, 2, 3]));
        f.become_follower(1, 1);
        drain(&mut f);
        let mut resp = Message::new(MessageKind::SyncResp);
        resp.from = 1;
        resp.to = 2;
        resp.term = 1;
        resp.index = 1;
        resp.committed_index = 2;
        resp.logs = vec![log(1, 1), log(2, 1)];
        f.step(resp).unwrap();
        f.step(f.new_store_append_resp(2)).unwrap();
        let msgs = drain(&mut f);
        let sync = find(&msgs, MessageKind::Sync).expect("re-armed sync");
        assert_eq!(f.committed_index(), 2);

        // A conflicting slice that would rewrite committed entries is
        // filtered down to the suffix above the commit point.
        let mut resp = Message::new(MessageKind::SyncResp);
        resp.from = 1;
        resp.to = 2;
        resp.term = 1;
        resp.index = sync.index;
        resp.logs = vec![log(3, 1)];
        f.step(resp).unwrap();
        assert_eq!(f.committed_index(), 2);
        assert_eq!(f.last_index(), 3);
    }

    #[test]
    fn no_commit_of_prior_term_entries_without_current_term_entry() {
        // New leader at term 2 inherits entries from term 1.
        let mut r = Replica::new(Config::new(1, "2:test", vec![1, 2, 3]));
        r.set_initial_state(3, 1, 0);
        r.become_leader(2);
        drain(&mut r);

        // Both followers acknowledge everything through 3.
        for from in [2u64, 3] {
            let mut sync = Message::new(MessageKind::Sync);
            sync.from = from;
            sync.to = 1;
            sync.term = 2;
            sync.index = 4;
            r.step(sync).unwrap();
        }
        // Term-1 entries alone cannot commit under the term-2 leader.
        assert_eq!(r.committed_index(), 0);

        // A term-2 entry drags the whole prefix in.
        r.step(r.new_propose_message(vec![log(4, 2)])).unwrap();
        r.step(r.new_store_append_resp(4)).unwrap();
        for from in [2u64, 3] {
            let mut sync = Message::new(MessageKind::Sync);
            sync.from = from;
            sync.to = 1;
            sync.term = 2;
            sync.index = 5;
            r.step(sync).unwrap();
        }
        assert_eq!(r.committed_index(), 4);
    }

    #[test]
    fn higher_term_message_dethrones_leader() {
        let mut r = leader(1, vec![1, 2, 3]);
        let mut ping = Message::new(MessageKind::Ping);
        ping.from = 3;
        ping.to = 1;
        ping.term = 5;
        r.step(ping).unwrap();
        assert_eq!(r.role(), Role::Follower);
        assert_eq!(r.leader_id(), 3);
        assert_eq!(r.term(), 5);
    }

    #[test]
    fn election_timeout_starts_campaign_and_majority_wins() {
        let mut r = Replica::new(Config::new(1, "slot-7", vec![1, 2, 3]));
        // No leader; tick until the randomized timeout fires.
        for _ in 0..40 {
            r.tick();
            if r.role() == Role::Candidate {
                break;
            }
        }
        assert_eq!(r.role(), Role::Candidate);
        let msgs = drain(&mut r);
        let votes: Vec<_> = msgs
            .iter()
            .filter(|m| m.kind == MessageKind::VoteReq)
            .collect();
        assert_eq!(votes.len(), 2);
        let term = r.term();

        let mut resp = Message::new(MessageKind::VoteResp);
        resp.from = 2;
        resp.to = 1;
        resp.term = term;
        r.step(resp).unwrap();
        assert_eq!(r.role(), Role::Leader);
        assert_eq!(r.leader_id(), 1);
    }

    #[test]
    fn vote_rejected_for_stale_log() {
        let mut r = Replica::new(Config::new(2, "slot-7", vec![1, 2, 3]));
        r.set_initial_state(5, 2, 0);

        let mut req = Message::new(MessageKind::VoteReq);
        req.from = 3;
        req.to = 2;
        req.term = 3;
        req.index = 3; // candidate last index behind ours
        req.applying_index = 2; // candidate last term equal
        r.step(req).unwrap();
        let msgs = drain(&mut r);
        let resp = find(&msgs, MessageKind::VoteResp).unwrap();
        assert!(resp.reject);
    }

    #[test]
    fn one_vote_per_term() {
        let mut r = Replica::new(Config::new(2, "slot-7", vec![1, 2, 3]));
        let mut req = Message::new(MessageKind::VoteReq);
        req.from = 1;
        req.to = 2;
        req.term = 1;
        req.index = 0;
        r.step(req).unwrap();
        let msgs = drain(&mut r);
        assert!(!find(&msgs, MessageKind::VoteResp).unwrap().reject);

        let mut req = Message::new(MessageKind::VoteReq);
        req.from = 3;
        req.to = 2;
        req.term = 1;
        req.index = 0;
        r.step(req).unwrap();
        let msgs = drain(&mut r);
        assert!(find(&msgs, MessageKind::VoteResp).unwrap().reject);
    }

    #[test]
    fn appoint_leader_transfers_leadership() {
        let mut r = Replica::new(Config::new(2, "slot-7", vec![1, 2, 3]));
        let mut m = Message::new(MessageKind::AppointLeader);
        m.from = 1;
        m.to = 2;
        m.term = 4;
        m.index = 2;
        r.step(m).unwrap();
        assert_eq!(r.role(), Role::Leader);
        assert_eq!(r.term(), 4);
    }

    #[test]
    fn index_invariants_hold_through_random_walk() {
        let mut r = leader(1, vec![1, 2, 3]);
        let mut next = 1u64;
        for round in 0..50u64 {
            let logs: Vec<Log> = (0..(round % 3 + 1))
                .map(|i| log(next + i, r.term()))
                .collect();
            next += logs.len() as u64;
            r.step(r.new_propose_message(logs)).unwrap();
            if round % 2 == 0 {
                r.step(r.new_store_append_resp(r.last_index())).unwrap();
            }
            if round % 3 == 0 {
                let mut sync = Message::new(MessageKind::Sync);
                sync.from = 2;
                sync.to = 1;
                sync.term = r.term();
                sync.index = r.stable_index() + 1;
                r.step(sync).unwrap();
            }
            drain(&mut r);
            assert!(r.applied_index() <= r.committed_index());
            assert!(r.committed_index() <= r.last_index());
            assert!(r.stable_index() <= r.last_index());
        }
    }
}
