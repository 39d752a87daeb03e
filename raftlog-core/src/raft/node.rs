use super::log::LogEntry;
use super::message::{Message, Payload};
use super::state::{Checkpoint, Effects, Role, State};
use super::state_machine::{NoopMachine, StateMachine};
use super::status::{Health, PeerStatus, Status};
use super::storage::{MemoryStorage, Storage};
use super::timer::Timers;
use super::transport::{MessageHandler, Transport};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use raftlog_common::error::{RaftError, Result};
use raftlog_common::types::{ClusterConfig, LogIndex, NodeId, NodeMode, Reachability, Term};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

/// Timing and replication settings of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    pub vote_timeout: Duration,
    pub rpc_timeout: Duration, // How long a worker waits for a reply
    pub log_reduction: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(250),
            election_timeout: Duration::from_millis(500),
            vote_timeout: Duration::from_millis(150),
            rpc_timeout: Duration::from_millis(500),
            log_reduction: false,
        }
    }
}

impl From<&ClusterConfig> for NodeConfig {
    fn from(config: &ClusterConfig) -> Self {
        let election_timeout = Duration::from_millis(config.election_timeout_ms);
        Self {
            heartbeat_interval: Duration::from_millis(config.heartbeat_interval_ms),
            election_timeout,
            vote_timeout: Duration::from_millis(config.vote_timeout_ms),
            rpc_timeout: config
                .rpc_timeout_ms
                .map_or(election_timeout, Duration::from_millis),
            log_reduction: config.log_reduction,
        }
    }
}

/// Outcome of offering a command to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// Appended to the leader's log at this index.
    Accepted(LogIndex),
    /// Another node leads; send the command there.
    Redirect {
        leader: NodeId,
        address: Option<String>,
    },
    NoLeader,
}

/// Wake-up flag for a worker: at most one pending notification.
struct Signal {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Signal {
    fn new() -> Self {
        let (tx, rx) = channel::bounded(1);
        Self { tx, rx }
    }

    fn notify(&self) {
        let _ = self.tx.try_send(());
    }

    fn wait(&self, timeout: Duration) {
        let _ = self.rx.recv_timeout(timeout);
    }
}

/// Everything guarded by the node mutex.
struct Core {
    state: State,
    timers: Timers,
    active: bool,
    shut_down: bool,
    leader: Option<(NodeId, Option<String>)>,
    leadership_required: bool,
    last_heard: HashMap<NodeId, DateTime<Utc>>,
    synchronised: HashMap<NodeId, bool>,
}

impl Core {
    fn extend(&mut self, peer: &str) {
        self.timers.extend(peer, self.state.role(), self.leadership_required);
    }

    fn extend_all(&mut self) {
        self.timers.extend_all(self.state.role(), self.leadership_required);
    }

    fn is_leader(&self, name: &str) -> bool {
        self.leader.as_ref().map_or(false, |(leader, _)| leader == name)
    }
}

struct Shared {
    name: NodeId,
    mode: NodeMode,
    neighbours: Vec<NodeId>,
    request_address: Option<String>,
    config: NodeConfig,
    core: Mutex<Core>,
    applied: Condvar,
    machine: Mutex<Box<dyn StateMachine>>,
    storage: Box<dyn Storage>,
    transport: Arc<dyn Transport>,
    apply_signal: Signal,
    peer_signals: HashMap<NodeId, Signal>,
}

/// A consensus participant: one Raft state, driven by an apply worker,
/// one worker per neighbour and a transport subscription.
pub struct Node {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

pub struct NodeBuilder {
    name: NodeId,
    mode: NodeMode,
    neighbours: Vec<NodeId>,
    config: NodeConfig,
    request_address: Option<String>,
    transport: Arc<dyn Transport>,
    storage: Box<dyn Storage>,
    machine: Box<dyn StateMachine>,
}

impl NodeBuilder {
    pub fn mode(mut self, mode: NodeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn neighbours<I, S>(mut self, neighbours: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.neighbours = neighbours.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn request_address(mut self, address: impl Into<String>) -> Self {
        self.request_address = Some(address.into());
        self
    }

    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Box::new(storage);
        self
    }

    pub fn state_machine(mut self, machine: impl StateMachine + 'static) -> Self {
        self.machine = Box::new(machine);
        self
    }

    pub fn build(self) -> Result<Node> {
        let mut neighbours = self.neighbours;
        neighbours.retain(|n| *n != self.name);
        neighbours.sort();
        neighbours.dedup();

        let mut state = State::new(self.name.clone(), &neighbours);
        if let Some(persisted) = self.storage.retrieve()? {
            state.populate(persisted);
            info!(
                node = %self.name,
                term = state.current_term,
                head = state.log.index(),
                commit = state.commit_index,
                "restored persisted state"
            );
        }
        state.log_reduction = self.config.log_reduction;

        let timers = Timers::new(
            &neighbours,
            self.config.heartbeat_interval,
            self.config.election_timeout,
            self.config.vote_timeout,
        );

        let core = Core {
            state,
            timers,
            active: false,
            shut_down: false,
            leader: None,
            leadership_required: self.mode.requires_leadership(),
            last_heard: HashMap::new(),
            synchronised: neighbours.iter().map(|n| (n.clone(), false)).collect(),
        };

        let shared = Shared {
            peer_signals: neighbours.iter().map(|n| (n.clone(), Signal::new())).collect(),
            name: self.name,
            mode: self.mode,
            neighbours,
            request_address: self.request_address,
            config: self.config,
            core: Mutex::new(core),
            applied: Condvar::new(),
            machine: Mutex::new(self.machine),
            storage: self.storage,
            transport: self.transport,
            apply_signal: Signal::new(),
        };

        Ok(Node {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        })
    }
}

impl Node {
    pub fn builder(name: impl Into<NodeId>, transport: Arc<dyn Transport>) -> NodeBuilder {
        NodeBuilder {
            name: name.into(),
            mode: NodeMode::default(),
            neighbours: Vec::new(),
            config: NodeConfig::default(),
            request_address: None,
            transport,
            storage: Box::new(MemoryStorage::new()),
            machine: Box::new(NoopMachine),
        }
    }

    /// Builder for member `node_id` of `cluster`, with its mode, neighbours,
    /// timing and request address taken from the cluster configuration.
    pub fn from_cluster(cluster: &ClusterConfig, node_id: &str, transport: Arc<dyn Transport>) -> Result<NodeBuilder> {
        let address = cluster
            .node(node_id)
            .ok_or_else(|| RaftError::Config(format!("node {} is not a cluster member", node_id)))?;

        Ok(Node::builder(node_id, transport)
            .mode(address.mode)
            .neighbours(cluster.node_ids())
            .config(NodeConfig::from(cluster))
            .request_address(address.request_address()))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn mode(&self) -> NodeMode {
        self.shared.mode
    }

    pub fn neighbours(&self) -> &[NodeId] {
        &self.shared.neighbours
    }

    /// Start the apply worker, one worker per neighbour and the transport subscription.
    pub fn activate(&self) -> Result<()> {
        let shared = &self.shared;
        {
            let mut guard = shared.core.lock();
            let core = &mut *guard;
            if core.shut_down {
                return Err(RaftError::Inactive);
            }
            if core.active {
                return Ok(());
            }

            core.active = true;
            core.leadership_required = shared.mode.requires_leadership();
            core.extend_all();

            // Nobody else can vote: a lone eligible node leads right away
            if shared.neighbours.is_empty() && shared.mode.is_eligible(core.leadership_required, None) {
                core.state.set_role(Role::Candidate);
                core.state.become_leader();
                core.leader = Some((shared.name.clone(), shared.request_address.clone()));
                shared.persist(&core.state)?;
                shared.apply_signal.notify();
            }
            warn!(node = %shared.name, mode = %shared.mode, term = core.state.current_term, "node starting");
        }

        let mut workers = self.workers.lock();

        let apply = shared.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("{}-apply", shared.name))
                .spawn(move || apply.run_apply())?,
        );

        for peer in &shared.neighbours {
            let worker = shared.clone();
            let peer = peer.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("{}-{}", shared.name, peer))
                    .spawn(move || worker.run_peer(peer))?,
            );
        }

        let subscriber = shared.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("{}-subscribe", shared.name))
                .spawn(move || subscriber.run_subscribe())?,
        );

        Ok(())
    }

    /// Stop every worker, wait for them to finish and revert to follower.
    pub fn deactivate(&self) {
        let shared = &self.shared;
        {
            let mut core = shared.core.lock();
            if !core.active {
                return;
            }
            warn!(node = %shared.name, role = %core.state.role(), term = core.state.current_term, "deactivating node");
            core.active = false;
        }

        shared.transport.shutdown();
        shared.apply_signal.notify();
        shared.wake_peers();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!(node = %shared.name, "worker panicked");
            }
        }

        let mut core = shared.core.lock();
        core.state.set_role(Role::Follower);
        core.leader = None;
        shared.applied.notify_all();
    }

    /// Deactivate for good and flush the state to storage.
    pub fn shutdown(&self) {
        info!(node = %self.shared.name, "node shutting down");
        self.deactivate();

        let mut core = self.shared.core.lock();
        if core.shut_down {
            return;
        }
        core.shut_down = true;
        if let Err(e) = self.shared.persist(&core.state) {
            error!(node = %self.shared.name, error = %e, "failed to persist state on shutdown");
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.core.lock().state.is_leader()
    }

    /// The current leader, which may be this node.
    pub fn leader(&self) -> Option<NodeId> {
        let core = self.shared.core.lock();
        if core.state.is_leader() {
            return Some(self.shared.name.clone());
        }
        core.leader.as_ref().map(|(leader, _)| leader.clone())
    }

    /// Where commands should be sent.
    pub fn request_address(&self) -> Option<String> {
        let core = self.shared.core.lock();
        if core.state.is_leader() {
            return self.shared.request_address.clone();
        }
        core.leader.as_ref().and_then(|(_, address)| address.clone())
    }

    pub fn role(&self) -> Role {
        self.shared.core.lock().state.role()
    }

    pub fn term(&self) -> Term {
        self.shared.core.lock().state.current_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.shared.core.lock().state.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.shared.core.lock().state.last_applied
    }

    pub fn leadership_required(&self) -> bool {
        self.shared.core.lock().leadership_required
    }

    /// Append a command to the log if this node leads.
    pub fn append_entry(&self, command: impl Into<Bytes>) -> Result<Option<LogIndex>> {
        let shared = &self.shared;
        let mut core = shared.core.lock();
        if !core.active {
            return Err(RaftError::Inactive);
        }

        let index = core.state.append_log_entry(command);
        if let Some(index) = index {
            debug!(node = %shared.name, term = core.state.current_term, index, "appended log entry");
            shared.persist(&core.state)?;
            shared.wake_peers();
            shared.apply_signal.notify();
        }
        Ok(index)
    }

    /// Append a command, or point the caller at the node that can.
    pub fn propose(&self, command: impl Into<Bytes>) -> Result<Proposal> {
        if let Some(index) = self.append_entry(command)? {
            return Ok(Proposal::Accepted(index));
        }

        Ok(match self.leader() {
            Some(leader) => Proposal::Redirect {
                leader,
                address: self.request_address(),
            },
            None => Proposal::NoLeader,
        })
    }

    /// Block until `index` has been applied locally or `timeout` passes.
    pub fn wait_applied(&self, index: LogIndex, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut core = self.shared.core.lock();
        while core.state.last_applied < index {
            if self.shared.applied.wait_until(&mut core, deadline).timed_out() {
                return core.state.last_applied >= index;
            }
        }
        true
    }

    /// Retained entries from `from` onwards, at most `count` of them.
    pub fn entries(&self, from: LogIndex, count: Option<usize>) -> Vec<LogEntry> {
        self.shared.core.lock().state.log.slice(from, count)
    }

    /// The entry at `index`, or the log tail when `index` is 0.
    pub fn checkpoint(&self, index: LogIndex) -> Option<Checkpoint> {
        self.shared.core.lock().state.checkpoint(index)
    }

    /// Reset the log to end at `checkpoint`, committed and applied.
    pub fn reset_state(&self, checkpoint: &Checkpoint) -> Result<()> {
        let shared = &self.shared;
        let mut guard = shared.core.lock();
        let core = &mut *guard;
        error!(
            node = %shared.name,
            term = core.state.current_term,
            index = checkpoint.last_index,
            checkpoint_term = checkpoint.last_term,
            "resetting state"
        );

        core.state.set_role(Role::Follower);
        if core.is_leader(&shared.name) {
            core.leader = None;
        }
        core.state.set_checkpoint(checkpoint);
        let next = core.state.log.index() + 1;
        for peer in &shared.neighbours {
            core.state.next_index.insert(peer.clone(), next);
            core.state.match_index.insert(peer.clone(), 0);
        }
        shared.persist(&core.state)?;
        shared.applied.notify_all();
        Ok(())
    }

    pub fn status(&self) -> Status {
        let shared = &self.shared;
        let connected = shared.transport.connected();
        let core = shared.core.lock();
        let state = &core.state;

        let peers = shared
            .neighbours
            .iter()
            .map(|peer| {
                let status = PeerStatus {
                    connected: connected.contains(peer),
                    synchronised: core.synchronised.get(peer).copied().unwrap_or(false),
                    next_index: state.next_index.get(peer).copied().unwrap_or(0),
                    match_index: state.match_index.get(peer).copied().unwrap_or(0),
                    applied: state.cluster_applied.get(peer).copied().unwrap_or(0),
                    last_heard: core.last_heard.get(peer).copied(),
                };
                (peer.clone(), status)
            })
            .collect();

        let leader = if state.is_leader() {
            Some(shared.name.clone())
        } else {
            core.leader.as_ref().map(|(leader, _)| leader.clone())
        };
        let request_address = if state.is_leader() {
            shared.request_address.clone()
        } else {
            core.leader.as_ref().and_then(|(_, address)| address.clone())
        };

        let mut status = Status {
            name: shared.name.clone(),
            mode: shared.mode,
            role: state.role(),
            term: state.current_term,
            active: core.active,
            leader,
            request_address,
            leadership_required: core.leadership_required,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            log_offset: state.log.offset(),
            log_index: state.log.index(),
            log_reduction: state.log_reduction,
            commit_latency_ms: state.statistics.last_commit_latency().map(|d| d.num_milliseconds()),
            peers,
            health: Health::Red,
        };
        status.health = status.assess();
        status
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MessageHandler for Shared {
    fn on_message(&self, message: Message) -> Result<Option<Message>> {
        self.dispatch(message)
    }

    fn is_active(&self) -> bool {
        Shared::is_active(self)
    }
}

impl Shared {
    fn is_active(&self) -> bool {
        self.core.lock().active
    }

    fn persist(&self, state: &State) -> Result<()> {
        self.storage.persist(&state.snapshot())
    }

    fn wake_peers(&self) {
        for signal in self.peer_signals.values() {
            signal.notify();
        }
    }

    fn reachability(&self) -> Reachability {
        Reachability {
            connected: self.transport.connected().len(),
            neighbourhood: self.neighbours.len() + 1,
        }
    }

    /// Serialized entry point for every inbound message, requests and replies alike.
    fn dispatch(&self, message: Message) -> Result<Option<Message>> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if !core.active {
            debug!(%message, "ignoring message while inactive");
            return Ok(None);
        }

        debug!(role = %core.state.role(), term = core.state.current_term, %message, "message received");
        let sender = message.sender.clone();
        core.last_heard.insert(sender.clone(), Utc::now());

        let mut adopted = false;
        if core.state.adopt_term(message.term) {
            info!(peer = %sender, term = message.term, "behind the current term of peer");
            if core.is_leader(&self.name) {
                core.leader = None;
            }
            adopted = true;
        }

        let current = core.state.current_term;
        let (payload, mut effects) = match &message.payload {
            Payload::AppendEntries(req) => {
                if message.term >= current {
                    if !core.is_leader(&sender) {
                        warn!(term = current, leader = %sender, "accepted leadership");
                    }
                    core.leader = Some((sender.clone(), req.request_address.clone()));
                }

                let (resp, effects) = core.state.on_append_entries(message.term, req);
                debug!(granted = resp.granted, reason = %resp.reason, "append entries");
                if message.term >= current {
                    core.extend(&sender);
                }
                (Some(Payload::AppendResponse(resp)), effects)
            }
            Payload::VoteRequest(req) => {
                let (resp, effects) = core.state.on_vote_request(message.term, req);
                if resp.eligible && core.state.role() == Role::Follower {
                    core.extend(&sender);
                }

                let vote = core.state.voted_for.get(&core.state.current_term);
                core.leadership_required = self.mode == NodeMode::Active
                    || vote.map_or(true, |v| *v == self.name)
                    || !resp.granted;
                if self.mode == NodeMode::Reluctant && !resp.eligible {
                    info!(candidate = %sender, "candidate was not eligible");
                }
                (Some(Payload::VoteResponse(resp)), effects)
            }
            Payload::VoteResponse(resp) => (None, core.state.on_vote_response(&sender, message.term, resp)),
            Payload::AppendResponse(resp) => {
                let effects = core.state.on_append_response(&sender, resp);

                // An up to date active peer can take over from us
                let eligible = message.mode == NodeMode::Active
                    && core.state.match_index.get(&sender) == Some(&core.state.log.index());
                core.leadership_required &= !eligible;
                if self.mode == NodeMode::Reluctant && eligible {
                    info!(peer = %sender, "message sender is eligible");
                }
                (None, effects)
            }
        };
        effects.persist |= adopted;
        self.apply_effects(core, &sender, effects)?;

        if !self.neighbours.contains(&sender) {
            return Ok(None);
        }
        let term = core.state.current_term;
        Ok(payload.map(|payload| message.reply(&self.name, self.mode, term, payload)))
    }

    fn apply_effects(&self, core: &mut Core, peer: &str, effects: Effects) -> Result<()> {
        if effects.elected {
            warn!(role = %core.state.role(), term = core.state.current_term, "elected leader");
            core.leader = Some((self.name.clone(), self.request_address.clone()));
            core.timers.reset();
            for synchronised in core.synchronised.values_mut() {
                *synchronised = false;
            }
            self.wake_peers();
        }
        if effects.stepped_down {
            core.leadership_required = false;
            core.extend_all();
        }
        if let Some(synchronised) = effects.synchronised {
            core.synchronised.insert(peer.to_string(), synchronised);
        }
        if effects.back_off {
            core.timers.back_off(peer);
        }
        if effects.apply {
            self.apply_signal.notify();
        }
        if effects.persist {
            self.persist(&core.state)?;
        }
        Ok(())
    }

    /// Send `message` and feed the reply back through dispatch.
    fn exchange(&self, message: Message) -> Result<()> {
        let reply = self.transport.publish(message)?.wait(self.config.rpc_timeout)?;
        self.dispatch(reply)?;
        Ok(())
    }

    fn run_apply(&self) {
        let span = info_span!("raft", node = %self.name, mode = %self.mode);
        let _enter = span.enter();
        debug!("starting to apply entries");

        while self.is_active() {
            match self.apply_next() {
                Ok(true) => thread::yield_now(),
                Ok(false) => self.apply_signal.wait(self.config.heartbeat_interval),
                Err(e) => {
                    error!(error = %e, "failed to apply entry");
                    self.apply_signal.wait(self.config.heartbeat_interval);
                }
            }
        }
        debug!("apply worker stopped");
    }

    /// Hand the next committed entry to the state machine.
    fn apply_next(&self) -> Result<bool> {
        let entry = {
            let core = self.core.lock();
            let next = core.state.last_applied + 1;
            if !core.active || next > core.state.commit_index {
                return Ok(false);
            }
            match core.state.log.get(next) {
                Ok(entry) => entry.clone(),
                Err(e) => {
                    warn!(error = %e, "committed entry is not retained");
                    return Ok(false);
                }
            }
        };

        if !entry.is_noop() {
            // A command the machine rejects is skipped rather than retried forever
            if let Err(e) = self.machine.lock().apply(&entry) {
                error!(index = entry.index, error = %e, "state machine rejected entry, skipping it");
            }
        }

        let mut core = self.core.lock();
        // A concurrent reset may have moved the cursor
        if core.state.last_applied + 1 == entry.index {
            core.state.apply_next();
            self.persist(&core.state)?;
            info!(role = %core.state.role(), term = core.state.current_term, index = entry.index, "applied entry");
            self.applied.notify_all();
        }
        Ok(true)
    }

    fn run_subscribe(self: Arc<Self>) {
        let span = info_span!("raft", node = %self.name, mode = %self.mode);
        let _enter = span.enter();

        let transport = self.transport.clone();
        if let Err(e) = transport.subscribe(self) {
            error!(error = %e, "subscription failed");
        }
    }

    fn run_peer(&self, peer: NodeId) {
        let span = info_span!("raft", node = %self.name, mode = %self.mode, peer = %peer);
        let _enter = span.enter();
        let Some(signal) = self.peer_signals.get(&peer) else {
            return;
        };
        debug!("starting peer worker");

        loop {
            let wait = {
                let core = self.core.lock();
                if !core.active {
                    break;
                }
                // Leaders with entries to ship skip the wait
                if core.timers.is_backing_off(&peer) || !core.state.missing_entries(&peer) {
                    Some(core.timers.wait_for(&peer, core.state.role()))
                } else {
                    None
                }
            };
            if let Some(wait) = wait.filter(|w| !w.is_zero()) {
                signal.wait(wait);
            }
            if !self.is_active() {
                break;
            }

            if let Err(e) = self.on_timeout(&peer) {
                {
                    let mut core = self.core.lock();
                    core.synchronised.insert(peer.clone(), false);
                    core.extend(&peer);
                    core.timers.back_off(&peer);
                }
                self.transport.handle_exception(&peer, &e);
            }
        }
        debug!("peer worker stopped");
    }

    fn on_timeout(&self, peer: &str) -> Result<()> {
        let (role, missing, peer_due, all_due) = {
            let core = self.core.lock();
            (
                core.state.role(),
                core.state.missing_entries(peer),
                core.timers.has_timed_out(Some(peer)),
                core.timers.has_timed_out(None),
            )
        };

        match role {
            // A due heartbeat comes first so that eligibility is rechecked even while shipping entries
            Role::Leader if peer_due => self.on_timeout_leader(peer),
            Role::Leader if missing => self.on_behind_entries(peer),
            Role::Candidate if peer_due => self.on_timeout_candidate(peer),
            Role::Follower if all_due => self.on_timeout_follower(peer),
            _ => Ok(()),
        }
    }

    /// Ship the next chunk of missing entries to `peer`.
    fn on_behind_entries(&self, peer: &str) -> Result<()> {
        let message = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if !core.state.is_leader() {
                return Ok(());
            }
            let synchronised = core.synchronised.get(peer).copied().unwrap_or(false);
            let req = core
                .state
                .append_entries_request(peer, false, synchronised, self.request_address.clone());
            debug!(
                prev_index = req.prev_log_index,
                entries = req.entries.len(),
                synchronised,
                "sending missing entries"
            );
            Message::build(&self.name, self.mode, core.state.current_term, peer, Payload::AppendEntries(req))
        };

        self.exchange(message)?;
        self.core.lock().extend(peer);
        Ok(())
    }

    fn on_timeout_leader(&self, peer: &str) -> Result<()> {
        let reachability = self.reachability();
        let message = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if !core.state.is_leader() || !core.timers.has_timed_out(Some(peer)) {
                return Ok(());
            }

            if !self.mode.is_eligible(core.leadership_required, Some(reachability)) {
                warn!(
                    term = core.state.current_term,
                    connected = reachability.connected,
                    "no longer eligible, stepping down"
                );
                core.state.set_role(Role::Follower);
                core.leader = None;
                core.extend_all();
                drop(guard);
                self.transport.close(peer);
                return Ok(());
            }

            let synchronised = core.synchronised.get(peer).copied().unwrap_or(false);
            let req = core
                .state
                .append_entries_request(peer, true, synchronised, self.request_address.clone());
            core.extend(peer);
            debug!(term = core.state.current_term, "firing heartbeat");
            Message::build(&self.name, self.mode, core.state.current_term, peer, Payload::AppendEntries(req))
        };

        self.exchange(message)
    }

    fn on_timeout_candidate(&self, peer: &str) -> Result<()> {
        let message = {
            let mut guard = self.core.lock();
            let core = &mut *guard;
            if core.state.role() != Role::Candidate || !core.timers.has_timed_out(Some(peer)) {
                return Ok(());
            }

            if !self.mode.is_eligible(core.leadership_required, None) {
                info!(term = core.state.current_term, "no longer eligible, abandoning candidacy");
                core.state.set_role(Role::Follower);
                core.extend_all();
                return Ok(());
            }

            if core.state.increment_term(peer) {
                info!(term = core.state.current_term, "starting new election");
                self.persist(&core.state)?;
                core.timers.reset();
                self.wake_peers();
            }

            debug!(term = core.state.current_term, "sending vote request");
            let req = core.state.vote_request();
            Message::build(&self.name, self.mode, core.state.current_term, peer, Payload::VoteRequest(req))
        };

        let result = self.exchange(message);

        let mut core = self.core.lock();
        if !core.state.is_leader() {
            core.extend(peer);
        }
        result
    }

    fn on_timeout_follower(&self, peer: &str) -> Result<()> {
        let mut guard = self.core.lock();
        let core = &mut *guard;
        if core.state.role() != Role::Follower || !core.timers.has_timed_out(None) {
            return Ok(());
        }

        // The worker of the known leader decides; the others stand aside
        if core.leader.as_ref().map_or(false, |(leader, _)| leader != peer) {
            core.timers.defer(peer, Role::Follower, core.leadership_required);
            return Ok(());
        }

        if !self.mode.is_eligible(core.leadership_required, None) {
            if !core.leadership_required {
                info!(term = core.state.current_term, "leadership might be required of this node");
            }
            core.leadership_required = matches!(self.mode, NodeMode::Active | NodeMode::Reluctant);
            core.extend_all();
            return Ok(());
        }

        warn!(
            term = core.state.current_term,
            leader = ?core.leader.as_ref().map(|(leader, _)| leader),
            "converting to candidate"
        );
        core.leader = None;
        core.timers.reset();
        core.state.set_role(Role::Candidate);
        core.state.increment_term(peer);
        info!(term = core.state.current_term, "starting election");
        self.persist(&core.state)?;
        self.wake_peers();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state_machine::{KeyValueStore, KvCommand};
    use crate::raft::transport::InMemoryNetwork;

    fn fast_config() -> NodeConfig {
        NodeConfig {
            heartbeat_interval: Duration::from_millis(20),
            election_timeout: Duration::from_millis(80),
            vote_timeout: Duration::from_millis(40),
            rpc_timeout: Duration::from_millis(80),
            log_reduction: false,
        }
    }

    fn solo(storage: MemoryStorage) -> Node {
        let network = InMemoryNetwork::new();
        Node::builder("solo", Arc::new(network.transport("solo")))
            .config(fast_config())
            .request_address("127.0.0.1:9000")
            .storage(storage)
            .build()
            .unwrap()
    }

    #[test]
    fn test_config_from_cluster() {
        let cluster: ClusterConfig = serde_json::from_str(
            r#"{"nodes": [{"host": "h", "port": 1, "node_id": "a"}], "election_timeout_ms": 800}"#,
        )
        .unwrap();
        let config = NodeConfig::from(&cluster);

        assert_eq!(config.election_timeout, Duration::from_millis(800));
        assert_eq!(config.rpc_timeout, Duration::from_millis(800));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_from_cluster_rejects_unknown_member() {
        let cluster: ClusterConfig =
            serde_json::from_str(r#"{"nodes": [{"host": "h", "port": 1, "node_id": "a"}]}"#).unwrap();
        let network = InMemoryNetwork::new();

        assert!(Node::from_cluster(&cluster, "z", Arc::new(network.transport("z"))).is_err());
        let node = Node::from_cluster(&cluster, "a", Arc::new(network.transport("a")))
            .unwrap()
            .build()
            .unwrap();
        assert!(node.neighbours().is_empty());
    }

    #[test]
    fn test_inactive_node_rejects_commands() {
        let node = solo(MemoryStorage::new());
        assert!(matches!(node.append_entry("cmd"), Err(RaftError::Inactive)));
        assert_eq!(node.status().health, Health::Red);
    }

    #[test]
    fn test_single_node_leads_and_applies() {
        let node = solo(MemoryStorage::new());
        node.activate().unwrap();

        assert!(node.is_leader());
        assert_eq!(node.request_address().as_deref(), Some("127.0.0.1:9000"));
        // Index 1 holds the leader's no-op
        assert_eq!(node.propose("cmd-A").unwrap(), Proposal::Accepted(2));
        assert!(node.wait_applied(2, Duration::from_secs(2)));
        assert_eq!(node.commit_index(), 2);
        assert!(node.entries(1, None)[0].is_noop());

        node.shutdown();
        assert!(!node.is_active());
        assert!(node.activate().is_err());
    }

    #[test]
    fn test_restart_restores_persisted_log() {
        let storage = MemoryStorage::new();
        {
            let node = solo(storage.clone());
            node.activate().unwrap();
            node.append_entry("cmd-A").unwrap();
            node.append_entry("cmd-B").unwrap();
            assert!(node.wait_applied(3, Duration::from_secs(2)));
        }

        let node = solo(storage);
        assert_eq!(node.entries(1, None).len(), 3);
        assert_eq!(node.commit_index(), 3);
        assert_eq!(node.last_applied(), 3);
        assert_eq!(node.term(), 1);
    }

    #[test]
    fn test_reset_state_from_checkpoint() {
        let node = solo(MemoryStorage::new());
        node.activate().unwrap();
        for command in ["a", "b", "c"] {
            node.append_entry(command).unwrap();
        }
        assert!(node.wait_applied(4, Duration::from_secs(2)));

        let checkpoint = node.checkpoint(3).unwrap();
        assert_eq!(checkpoint.last_value, Bytes::from("b"));
        node.deactivate();
        node.reset_state(&checkpoint).unwrap();

        assert_eq!(node.role(), Role::Follower);
        assert_eq!(node.checkpoint(0).unwrap().last_index, 1);
        assert_eq!(node.entries(1, None).len(), 3);
        assert_eq!(node.last_applied(), 3);
        assert!(node.checkpoint(4).is_none());
    }

    #[test]
    fn test_rejected_command_does_not_stall_apply() {
        let store = Arc::new(parking_lot::Mutex::new(KeyValueStore::default()));
        let network = InMemoryNetwork::new();
        let node = Node::builder("solo", Arc::new(network.transport("solo")))
            .config(fast_config())
            .state_machine(store.clone())
            .build()
            .unwrap();
        node.activate().unwrap();

        node.append_entry(vec![0xffu8; 3]).unwrap();
        let command = KvCommand::Set("colour".into(), "blue".into()).encode().unwrap();
        let index = node.append_entry(command).unwrap().unwrap();

        assert!(node.wait_applied(index, Duration::from_secs(2)));
        assert_eq!(store.lock().get("colour").as_deref(), Some("blue"));
        assert_eq!(store.lock().applied(), index);
    }
}
