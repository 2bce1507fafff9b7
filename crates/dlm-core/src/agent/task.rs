//! The transaction agent task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use dlm_common::types::{AgentId, ClientId, HostId, Oid};

use crate::deadlock::{Cycle, Hop, ProbeAction, WaitTracker};
use crate::lock::{conflicts, DropReason, LockMode, Notice, ReqId};
use crate::manager::TransactionStats;
use crate::rpc::{AgentMsg, HostRequest, PeerMessage};
use crate::transport::Transport;

use super::{
    AgentHandle, AgentInfo, AgentStatus, Command, Deadlock, LockReply, LockResult, LockSpec,
    LockStatus, Requirement,
};

type LockKey = (HostId, Oid);

#[derive(Debug, Clone, Copy)]
struct Pending {
    req: ReqId,
    mode: LockMode,
    /// Re-queued after a surrender; the client believes it holds this lock.
    requeued: bool,
}

struct LockOp {
    oid: Oid,
    mode: LockMode,
    hosts: Vec<HostId>,
    requirement: Requirement,
    done: bool,
    reply: Option<oneshot::Sender<LockReply>>,
}

/// Settings for a new agent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AgentParams {
    pub id: AgentId,
    pub client: ClientId,
    pub caller: ClientId,
    pub abort_on_deadlock: bool,
    pub detection: bool,
}

/// State machine of one transaction.
pub(crate) struct Agent {
    id: AgentId,
    client: ClientId,
    abort_on_deadlock: bool,
    detection: bool,
    status: AgentStatus,
    inbox: mpsc::UnboundedReceiver<AgentMsg>,
    network: Arc<dyn Transport>,
    stats: Arc<TransactionStats>,
    tracker: WaitTracker,
    held: BTreeMap<LockKey, LockMode>,
    pending: BTreeMap<LockKey, Pending>,
    ops: Vec<LockOp>,
    awaiters: Vec<oneshot::Sender<LockResult>>,
    deadlocks: Vec<Deadlock>,
    touched: BTreeSet<HostId>,
    next_req: ReqId,
    /// Surrender requests not yet acknowledged.
    surrendering: usize,
}

impl Agent {
    /// Registers a new agent with the network, starts its task and returns
    /// the handle of `params.caller`.
    pub(crate) fn spawn(
        params: AgentParams,
        network: Arc<dyn Transport>,
        stats: Arc<TransactionStats>,
    ) -> AgentHandle {
        let (tx, inbox) = mpsc::unbounded_channel();
        network.register_agent(params.id, tx.clone());

        let agent = Agent {
            id: params.id,
            client: params.client,
            abort_on_deadlock: params.abort_on_deadlock,
            detection: params.detection,
            status: AgentStatus::Active,
            inbox,
            network: Arc::clone(&network),
            stats,
            tracker: WaitTracker::new(params.id),
            held: BTreeMap::new(),
            pending: BTreeMap::new(),
            ops: Vec::new(),
            awaiters: Vec::new(),
            deadlocks: Vec::new(),
            touched: BTreeSet::new(),
            next_req: 1,
            surrendering: 0,
        };
        tokio::spawn(agent.run());

        AgentHandle::new(params.id, params.client, params.caller, tx, network)
    }

    async fn run(mut self) {
        debug!(agent = %self.id, client = %self.client, "agent started");
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                AgentMsg::Command(command) => {
                    if self.on_command(command) {
                        break;
                    }
                }
                AgentMsg::Notice { host, notice } => self.on_notice(host, notice),
                AgentMsg::Peer { from, msg } => self.on_peer(from, msg),
            }
        }
        self.network.unregister_agent(self.id);
        debug!(agent = %self.id, "agent stopped");
    }

    /// Returns true once the agent has ended.
    fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Lock { spec, reply } => self.on_lock(spec, reply),
            Command::Await { reply } => {
                self.awaiters.push(reply);
                if self.status.is_terminal() {
                    self.fail_waiters();
                } else {
                    self.settle();
                }
            }
            Command::Info { reply } => {
                let _ = reply.send(self.info());
            }
            Command::End { reply } => {
                self.end();
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn on_lock(&mut self, spec: LockSpec, reply: Option<oneshot::Sender<LockReply>>) {
        if self.status.is_terminal() {
            if let Some(reply) = reply {
                let _ = reply.send(LockReply::HaveNone {
                    deadlocks: self.deadlocks.clone(),
                });
            }
            return;
        }

        let LockSpec {
            oid,
            mode,
            hosts,
            requirement,
        } = spec;
        let hosts = hosts.unwrap_or_else(|| vec![self.id.host()]);

        let satisfied_locally =
            requirement == Requirement::Any && hosts.iter().any(|h| self.holds(*h, &oid, mode));
        if !satisfied_locally {
            for &host in &hosts {
                self.request(host, &oid, mode);
            }
        }

        self.ops.push(LockOp {
            oid,
            mode,
            hosts,
            requirement,
            done: false,
            reply,
        });
        self.settle();
    }

    /// Sends a lock request unless an equal or stronger one is held or
    /// outstanding.
    fn request(&mut self, host: HostId, oid: &Oid, mode: LockMode) {
        if self.holds(host, oid, mode) {
            return;
        }
        let key = (host, oid.clone());
        let (mode, requeued) = match self.pending.get(&key) {
            Some(p) if p.mode.covers(mode) => return,
            Some(p) => (p.mode.stronger(mode), p.requeued),
            None => (mode, false),
        };

        let req = self.next_req;
        self.next_req += 1;
        self.pending.insert(
            key,
            Pending {
                req,
                mode,
                requeued,
            },
        );
        self.touched.insert(host);
        trace!(agent = %self.id, %host, %oid, %mode, req, "requesting");
        self.send_host(
            host,
            HostRequest::Lock {
                agent: self.id,
                req,
                oid: oid.clone(),
                mode,
            },
        );
    }

    fn on_notice(&mut self, host: HostId, notice: Notice) {
        if self.status.is_terminal() {
            trace!(agent = %self.id, %host, ?notice, "ignoring notice after {}", self.status);
            return;
        }

        let mut reprobe = false;
        match notice {
            Notice::Granted { req, oid, mode } => {
                let key = (host, oid);
                match self.pending.get(&key) {
                    Some(p) if p.req == req => {
                        self.pending.remove(&key);
                        self.tracker.clear_edge(host, &key.1);
                        debug!(agent = %self.id, %host, oid = %key.1, %mode, "granted");
                        self.held.insert(key, mode);
                    }
                    _ => {
                        trace!(agent = %self.id, %host, oid = %key.1, req, "stale grant");
                    }
                }
            }
            Notice::Queued {
                req,
                oid,
                mode,
                blockers,
            } => {
                let current = self
                    .pending
                    .get(&(host, oid.clone()))
                    .is_some_and(|p| p.req == req);
                if current {
                    debug!(agent = %self.id, %host, %oid, ?blockers, "queued");
                    let probes = self.tracker.set_blockers(host, oid, mode, blockers);
                    if self.detection {
                        for (to, probe) in probes {
                            self.send_peer(to, PeerMessage::Probe(probe));
                        }
                    }
                }
            }
            Notice::Dropped {
                oid,
                mode,
                reason,
                requeued,
            } => {
                let key = (host, oid);
                let was_held = self.held.remove(&key).is_some();
                match reason {
                    DropReason::Upgrade => {
                        debug!(agent = %self.id, %host, oid = %key.1, "upgrade requeued");
                    }
                    DropReason::Surrender if !was_held => {
                        // The grant was overtaken by a cancel, so the lock is
                        // no longer wanted. Withdraw the re-queued request.
                        debug!(agent = %self.id, %host, oid = %key.1, "surrendered unwanted lock");
                        if let Some(req) = requeued {
                            self.send_host(
                                host,
                                HostRequest::Cancel {
                                    agent: self.id,
                                    req,
                                    oid: key.1,
                                },
                            );
                        }
                    }
                    DropReason::Surrender => {
                        info!(agent = %self.id, %host, oid = %key.1, %mode, "surrendered lock");
                        self.stats.surrenders.fetch_add(1, AtomicOrdering::Relaxed);
                        self.deadlocks.push(Deadlock {
                            oid: key.1.clone(),
                            host,
                        });
                        if let Some(req) = requeued {
                            self.pending.insert(
                                key,
                                Pending {
                                    req,
                                    mode,
                                    requeued: true,
                                },
                            );
                        }
                    }
                }
            }
            Notice::Requeued { req, oid, .. } => {
                let current = self
                    .pending
                    .get(&(host, oid.clone()))
                    .is_some_and(|p| p.req == req);
                if current {
                    info!(agent = %self.id, %host, %oid, req, "surrendered queue position");
                    self.stats.surrenders.fetch_add(1, AtomicOrdering::Relaxed);
                    self.deadlocks.push(Deadlock { oid, host });
                }
            }
            Notice::SurrenderDone { waiter, released } => {
                debug!(agent = %self.id, %host, %waiter, released, "surrender done");
                if self.surrendering > 0 {
                    self.surrendering -= 1;
                    reprobe = self.surrendering == 0;
                }
            }
        }
        self.settle();
        if reprobe {
            self.reprobe();
        }
    }

    /// Probes every current blocker again. Cycles reported while the agent
    /// was surrendering were ignored and are found this way.
    fn reprobe(&mut self) {
        if !self.detection || self.status.is_terminal() {
            return;
        }
        let probes = self.tracker.restart_probes();
        if !probes.is_empty() {
            debug!(agent = %self.id, probes = probes.len(), "probing again after surrender");
        }
        for (to, probe) in probes {
            self.send_peer(to, PeerMessage::Probe(probe));
        }
    }

    fn on_peer(&mut self, from: AgentId, msg: PeerMessage) {
        if self.status.is_terminal() || !self.detection {
            return;
        }

        match msg {
            PeerMessage::Probe(probe) => {
                trace!(agent = %self.id, %from, initiator = %probe.id.initiator, "probe");
                match self.tracker.on_probe(probe) {
                    ProbeAction::Forward(probes) => {
                        for (to, probe) in probes {
                            self.send_peer(to, PeerMessage::Probe(probe));
                        }
                    }
                    ProbeAction::Cycle(cycle) => self.on_cycle(cycle),
                    ProbeAction::Discard => {}
                }
            }
            PeerMessage::Resolve(cycle) => {
                debug!(agent = %self.id, %from, %cycle, "asked to resolve");
                self.resolve(cycle);
            }
        }
    }

    fn on_cycle(&mut self, cycle: Cycle) {
        let Some(victim) = cycle.victim() else {
            return;
        };
        self.stats.deadlocks.fetch_add(1, AtomicOrdering::Relaxed);
        info!(agent = %self.id, %cycle, %victim, "deadlock detected");

        if victim == self.id {
            self.resolve(cycle);
        } else {
            self.send_peer(victim, PeerMessage::Resolve(cycle));
        }
    }

    /// Breaks `cycle` as its victim, by surrender or by abort.
    fn resolve(&mut self, cycle: Cycle) {
        if self.status == AgentStatus::Resolving {
            debug!(agent = %self.id, "already resolving");
            return;
        }
        let still_blocked = cycle
            .hop_from(self.id)
            .is_some_and(|hop| self.tracker.waits_for(hop.waits_for));
        let Some(into) = cycle.hop_into(self.id).cloned() else {
            return;
        };
        if !still_blocked {
            debug!(agent = %self.id, %cycle, "cycle already broken");
            return;
        }

        if self.abort_on_deadlock {
            self.abort(&into);
            return;
        }

        for contention in &into.contentions {
            self.send_host(
                contention.host,
                HostRequest::Surrender {
                    victim: self.id,
                    waiter: into.agent,
                    waiter_oid: contention.oid.clone(),
                },
            );
            self.surrendering += 1;
        }
        if self.surrendering > 0 {
            self.status = AgentStatus::Resolving;
            info!(
                agent = %self.id,
                waiter = %into.agent,
                requests = self.surrendering,
                "surrendering"
            );
        }
    }

    /// Aborts the transaction. `into` is the cycle edge this agent blocks;
    /// the locks it contends on are reported as the triggering objects.
    fn abort(&mut self, into: &Hop) {
        let mut triggering: Vec<Deadlock> = Vec::new();
        for contention in &into.contentions {
            let before = triggering.len();
            for ((host, oid), mode) in &self.held {
                if *host == contention.host
                    && conflicts(oid, *mode, &contention.oid, contention.mode)
                {
                    triggering.push(Deadlock {
                        oid: oid.clone(),
                        host: *host,
                    });
                }
            }
            if triggering.len() == before {
                triggering.push(Deadlock {
                    oid: contention.oid.clone(),
                    host: contention.host,
                });
            }
        }
        triggering.dedup();

        info!(agent = %self.id, triggering = triggering.len(), "aborting as deadlock victim");
        self.deadlocks.extend(triggering);
        self.status = AgentStatus::Aborted;
        self.stats.aborted.fetch_add(1, AtomicOrdering::Relaxed);
        self.release_everything();
        self.fail_waiters();
    }

    fn end(&mut self) {
        info!(
            agent = %self.id,
            status = %self.status,
            held = self.held.len(),
            pending = self.pending.len(),
            "ending transaction"
        );
        self.status = AgentStatus::Ended;
        self.stats.ended.fetch_add(1, AtomicOrdering::Relaxed);
        self.stats.active.fetch_sub(1, AtomicOrdering::Relaxed);
        self.release_everything();
        self.fail_waiters();
        self.network.unregister_agent(self.id);
    }

    /// Releases every hold and request on every host touched.
    fn release_everything(&mut self) {
        for host in self.touched.clone() {
            self.send_host(host, HostRequest::ReleaseAll { agent: self.id });
        }
        self.held.clear();
        self.pending.clear();
        self.tracker.clear();
        self.surrendering = 0;
    }

    /// Answers every outstanding call with `HaveNone`.
    fn fail_waiters(&mut self) {
        for op in self.ops.drain(..) {
            if let Some(reply) = op.reply {
                let _ = reply.send(LockReply::HaveNone {
                    deadlocks: self.deadlocks.clone(),
                });
            }
        }
        for reply in self.awaiters.drain(..) {
            let _ = reply.send(LockResult::new(
                LockStatus::HaveNone,
                self.deadlocks.clone(),
            ));
        }
    }

    /// Completes satisfied operations and recomputes the status.
    fn settle(&mut self) {
        if self.status.is_terminal() {
            return;
        }

        for i in 0..self.ops.len() {
            if self.ops[i].done {
                continue;
            }
            let op = &self.ops[i];
            let winner = match op.requirement {
                Requirement::All => op
                    .hosts
                    .iter()
                    .all(|h| self.holds(*h, &op.oid, op.mode))
                    .then_some(None),
                Requirement::Any => op
                    .hosts
                    .iter()
                    .find(|h| self.holds(**h, &op.oid, op.mode))
                    .map(|h| Some(*h)),
            };
            match winner {
                None => {}
                Some(None) => self.ops[i].done = true,
                Some(Some(host)) => self.finish_any(i, host),
            }
        }

        let requeued = self.pending.values().any(|p| p.requeued);
        if !requeued {
            for op in self.ops.iter_mut().filter(|op| op.done) {
                if let Some(reply) = op.reply.take() {
                    let _ = reply.send(LockReply::Ok {
                        deadlocks: self.deadlocks.clone(),
                    });
                }
            }
        }
        self.ops.retain(|op| !op.done || op.reply.is_some());

        if self.pending.is_empty() && self.ops.iter().all(|op| op.done) {
            for reply in self.awaiters.drain(..) {
                let _ = reply.send(LockResult::new(
                    LockStatus::HaveAllLocks,
                    self.deadlocks.clone(),
                ));
            }
        }

        if self.status == AgentStatus::Resolving && self.surrendering > 0 {
            return;
        }
        self.status = if self.pending.is_empty() {
            AgentStatus::Active
        } else {
            AgentStatus::Waiting
        };
    }

    /// Marks an `any` operation satisfied by `winner` and withdraws its
    /// requests on the other hosts, unless another open operation needs them.
    fn finish_any(&mut self, index: usize, winner: HostId) {
        let oid = self.ops[index].oid.clone();
        let losers: Vec<HostId> = self.ops[index]
            .hosts
            .iter()
            .copied()
            .filter(|h| *h != winner)
            .collect();
        self.ops[index].done = true;
        self.ops[index].hosts = vec![winner];

        for host in losers {
            let needed = self
                .ops
                .iter()
                .any(|op| !op.done && op.oid == oid && op.hosts.contains(&host));
            if needed {
                continue;
            }
            let key = (host, oid.clone());
            if let Some(p) = self.pending.remove(&key) {
                self.tracker.clear_edge(host, &oid);
                debug!(agent = %self.id, %host, %oid, req = p.req, "cancelling");
                self.send_host(
                    host,
                    HostRequest::Cancel {
                        agent: self.id,
                        req: p.req,
                        oid: oid.clone(),
                    },
                );
            }
        }
    }

    fn holds(&self, host: HostId, oid: &Oid, mode: LockMode) -> bool {
        self.held
            .get(&(host, oid.clone()))
            .is_some_and(|held| held.covers(mode))
    }

    fn info(&self) -> AgentInfo {
        AgentInfo {
            agent: self.id,
            client: self.client,
            status: self.status,
            held: self
                .held
                .iter()
                .map(|((h, o), m)| (*h, o.clone(), *m))
                .collect(),
            pending: self
                .pending
                .iter()
                .map(|((h, o), p)| (*h, o.clone(), p.mode))
                .collect(),
            deadlocks: self.deadlocks.clone(),
            abort_on_deadlock: self.abort_on_deadlock,
        }
    }

    fn send_host(&self, host: HostId, request: HostRequest) {
        let kind = request.kind();
        if let Err(e) = self.network.send_to_host(self.id.host(), host, request) {
            warn!(agent = %self.id, %host, kind, error = %e, "request not sent");
        }
    }

    fn send_peer(&self, to: AgentId, msg: PeerMessage) {
        let message = AgentMsg::Peer { from: self.id, msg };
        if let Err(e) = self.network.send_to_agent(self.id.host(), to, message) {
            debug!(agent = %self.id, %to, error = %e, "peer message not delivered");
        }
    }
}
