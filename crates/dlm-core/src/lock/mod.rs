//! Per-host lock table.
//!
//! This module implements the authoritative lock state of one host:
//! - Read (shared) and write (exclusive) locks on hierarchical OIDs
//! - A lock on an OID conflicts with locks on its ancestors and descendants
//! - FIFO wait queues with compatible batching on promotion
//! - Read-to-write upgrades, in place or by re-queueing
//! - Conditional surrender of locks to break deadlock cycles
//!
//! # Conflict Matrix
//!
//! ```text
//!                     │ Read │ Write │
//! ────────────────────┼──────┼───────┤
//!     Read            │  ✓   │   ✗   │
//!     Write           │  ✗   │   ✗   │
//! ```
//!
//! The matrix applies only to OIDs where one is a prefix of the other.
//! Locks on unrelated OIDs never conflict.
//!
//! # Layout
//!
//! Entries are flat, keyed by exact OID in a `BTreeMap`. The ancestors of an
//! OID are found by point lookups and the descendants by a range scan, since
//! they sort contiguously after the OID. Every queued request carries a
//! host-wide sequence number, so queue precedence is well defined between
//! requests on different but related entries.
//!
//! The table is a plain data structure. Every mutation returns the notices to
//! deliver to agents; the owning [`crate::server::LockServer`] task sends them.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;

use dlm_common::config::LockTableConfig;
use dlm_common::types::{AgentId, HostId, Oid};

/// Identifies one lock request of an agent. Echoed in notices so the agent
/// can discard answers to requests it has since replaced or cancelled.
pub type ReqId = u64;

/// Lock mode for an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
}

impl LockMode {
    /// Checks if this lock mode is compatible with another.
    #[inline]
    pub fn is_compatible_with(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Read, LockMode::Read))
    }

    /// Returns true if holding `self` satisfies a request for `other`.
    #[inline]
    pub fn covers(self, other: LockMode) -> bool {
        self == LockMode::Write || other == LockMode::Read
    }

    /// Returns the stronger of two lock modes.
    #[inline]
    pub fn stronger(self, other: LockMode) -> LockMode {
        self.max(other)
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => write!(f, "read"),
            LockMode::Write => write!(f, "write"),
        }
    }
}

/// Returns true if two lock requests conflict.
pub fn conflicts(a: &Oid, a_mode: LockMode, b: &Oid, b_mode: LockMode) -> bool {
    !a_mode.is_compatible_with(&b_mode) && a.overlaps(b)
}

/// Why an agent is blocked by another agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// The other agent holds a conflicting lock.
    Holder,
    /// The other agent has an earlier conflicting queued request.
    Waiter,
}

/// One outgoing wait-for edge of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Blocker {
    /// The blocking agent.
    pub agent: AgentId,
    /// Whether it blocks by holding or by queueing first.
    pub kind: BlockKind,
}

/// Why the table dropped a lock an agent was holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// A read-to-write upgrade could not be done in place.
    Upgrade,
    /// The lock was surrendered to break a deadlock.
    Surrender,
}

/// A message from a lock table to one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The request is granted; the agent now holds `mode` on `oid`.
    Granted {
        /// The granted request.
        req: ReqId,
        /// The locked object.
        oid: Oid,
        /// The mode now held (may be stronger than requested).
        mode: LockMode,
    },
    /// The request is queued behind `blockers`. Sent again whenever the
    /// blocker set changes.
    Queued {
        /// The queued request.
        req: ReqId,
        /// The requested object.
        oid: Oid,
        /// The requested mode.
        mode: LockMode,
        /// Agents this request currently waits for.
        blockers: Vec<Blocker>,
    },
    /// A held lock was taken away and, if `requeued` is set, re-queued at
    /// the tail under that request id.
    Dropped {
        /// The object no longer held.
        oid: Oid,
        /// The mode that was held.
        mode: LockMode,
        /// Why it was dropped.
        reason: DropReason,
        /// Request id of the re-queued request.
        requeued: Option<ReqId>,
    },
    /// A queued request was moved to the tail of the queue.
    Requeued {
        /// The moved request.
        req: ReqId,
        /// The requested object.
        oid: Oid,
        /// The requested mode.
        mode: LockMode,
    },
    /// A surrender request has been processed.
    SurrenderDone {
        /// The waiter the surrender was for.
        waiter: AgentId,
        /// Number of locks or queue positions given up.
        released: usize,
    },
}

/// A notice addressed to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Recipient.
    pub agent: AgentId,
    /// Payload.
    pub notice: Notice,
}

impl Outbound {
    fn new(agent: AgentId, notice: Notice) -> Self {
        Self { agent, notice }
    }
}

/// Outcome of a single request, as seen by the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Granted immediately.
    Granted,
    /// Queued.
    Queued,
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    mode: LockMode,
    req: ReqId,
}

#[derive(Debug, Clone)]
struct Waiter {
    agent: AgentId,
    req: ReqId,
    mode: LockMode,
    seq: u64,
    /// Blockers last reported to the agent.
    blockers: Vec<Blocker>,
}

/// Lock state of one exact OID.
#[derive(Debug)]
pub struct LockEntry {
    oid: Oid,
    holders: HashMap<AgentId, Holder>,
    /// Sorted by `seq`.
    queue: VecDeque<Waiter>,
}

impl LockEntry {
    fn new(oid: Oid) -> Self {
        Self {
            oid,
            holders: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn contains(&self, agent: AgentId) -> bool {
        self.holders.contains_key(&agent) || self.queue.iter().any(|w| w.agent == agent)
    }

    /// Returns true if the entry has neither holders nor waiters.
    pub fn is_free(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

/// Counters kept by a lock table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LockStats {
    /// Requests granted, immediately or by promotion.
    pub grants: u64,
    /// Requests that had to queue.
    pub waits: u64,
    /// Holds released by their owner.
    pub releases: u64,
    /// Upgrades done in place.
    pub upgrades: u64,
    /// Queued requests withdrawn.
    pub cancels: u64,
    /// Holds or queue positions given up to break a deadlock.
    pub surrenders: u64,
}

/// Point-in-time view of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    /// The object.
    pub oid: Oid,
    /// Holders sorted by agent.
    pub holders: Vec<(AgentId, LockMode)>,
    /// Waiters in queue order.
    pub waiters: Vec<(AgentId, LockMode)>,
}

/// Point-in-time view of a lock table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSnapshot {
    /// The host owning the table.
    pub host: HostId,
    /// Entries in OID order.
    pub entries: Vec<EntrySnapshot>,
    /// Counters.
    pub stats: LockStats,
}

impl TableSnapshot {
    /// Returns the entry for `oid`, if any.
    pub fn entry(&self, oid: &Oid) -> Option<&EntrySnapshot> {
        self.entries.iter().find(|e| &e.oid == oid)
    }

    /// Returns every pair of agents holding conflicting locks.
    ///
    /// Always empty for a correct table.
    pub fn conflicting_holders(&self) -> Vec<(AgentId, Oid, AgentId, Oid)> {
        let holds: Vec<(AgentId, &Oid, LockMode)> = self
            .entries
            .iter()
            .flat_map(|e| e.holders.iter().map(move |(a, m)| (*a, &e.oid, *m)))
            .collect();

        let mut found = Vec::new();
        for (i, (a, a_oid, a_mode)) in holds.iter().enumerate() {
            for (b, b_oid, b_mode) in &holds[i + 1..] {
                if a != b && conflicts(a_oid, *a_mode, b_oid, *b_mode) {
                    found.push((*a, (*a_oid).clone(), *b, (*b_oid).clone()));
                }
            }
        }
        found
    }

    /// Returns the mode `agent` holds on `oid`.
    pub fn held_by(&self, agent: AgentId, oid: &Oid) -> Option<LockMode> {
        self.entry(oid)?
            .holders
            .iter()
            .find(|(a, _)| *a == agent)
            .map(|(_, m)| *m)
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The lock table of one host.
pub struct LockTable {
    host: HostId,
    config: LockTableConfig,
    entries: BTreeMap<Oid, LockEntry>,
    /// Global enqueue order: seq -> (agent, oid).
    queued: BTreeMap<u64, (AgentId, Oid)>,
    /// Entries each agent appears in, as holder or waiter.
    agent_index: HashMap<AgentId, HashSet<Oid>>,
    next_seq: u64,
    stats: LockStats,
}

impl LockTable {
    /// Creates an empty lock table for `host`.
    pub fn new(host: HostId) -> Self {
        Self::with_config(host, LockTableConfig::default())
    }

    /// Creates a lock table with custom configuration.
    pub fn with_config(host: HostId, config: LockTableConfig) -> Self {
        Self {
            host,
            config,
            entries: BTreeMap::new(),
            queued: BTreeMap::new(),
            agent_index: HashMap::new(),
            next_seq: 1,
            stats: LockStats::default(),
        }
    }

    /// Returns the host owning this table.
    pub fn host(&self) -> HostId {
        self.host
    }

    /// Requests `mode` on `oid` for `agent`.
    ///
    /// Grants immediately if no other agent holds a conflicting lock and no
    /// other agent has an earlier conflicting request queued. Otherwise the
    /// request is queued and the agent is told who blocks it. A write request
    /// from a read holder is handled as an [`upgrade`](Self::upgrade).
    pub fn request(
        &mut self,
        agent: AgentId,
        req: ReqId,
        oid: Oid,
        mode: LockMode,
    ) -> (RequestOutcome, Vec<Outbound>) {
        if let Some(held) = self.held_mode(agent, &oid) {
            if held.covers(mode) {
                self.stats.grants += 1;
                let notice = Notice::Granted {
                    req,
                    oid,
                    mode: held,
                };
                return (RequestOutcome::Granted, vec![Outbound::new(agent, notice)]);
            }
            return self.upgrade(agent, req, oid);
        }

        if let Some(waiter) = self
            .entries
            .get_mut(&oid)
            .and_then(|e| e.queue.iter_mut().find(|w| w.agent == agent))
        {
            // Replace the queued request, keeping its position.
            waiter.req = req;
            waiter.mode = waiter.mode.stronger(mode);
            waiter.blockers.clear();
            let mut out = Vec::new();
            self.promote(&mut out);
            let outcome = if self.held_mode(agent, &oid).is_some() {
                RequestOutcome::Granted
            } else {
                RequestOutcome::Queued
            };
            return (outcome, out);
        }

        let blockers = self.blockers_for(agent, &oid, mode, None);
        if blockers.is_empty() {
            self.add_holder(agent, &oid, req, mode);
            self.stats.grants += 1;
            let notice = Notice::Granted { req, oid, mode };
            (RequestOutcome::Granted, vec![Outbound::new(agent, notice)])
        } else {
            self.stats.waits += 1;
            self.enqueue(agent, req, oid.clone(), mode, blockers.clone());
            let notice = Notice::Queued {
                req,
                oid,
                mode,
                blockers,
            };
            (RequestOutcome::Queued, vec![Outbound::new(agent, notice)])
        }
    }

    /// Upgrades a read hold of `agent` on `oid` to write.
    ///
    /// Succeeds in place iff no other agent holds a conflicting lock and no
    /// other agent has a conflicting request queued. Otherwise the read hold
    /// is dropped and a write request is appended to the queue, so the agent
    /// holds nothing on `oid` until it is granted.
    pub fn upgrade(
        &mut self,
        agent: AgentId,
        req: ReqId,
        oid: Oid,
    ) -> (RequestOutcome, Vec<Outbound>) {
        match self.held_mode(agent, &oid) {
            Some(LockMode::Read) => {}
            _ => return self.request(agent, req, oid, LockMode::Write),
        }

        let blockers = self.blockers_for(agent, &oid, LockMode::Write, None);
        if blockers.is_empty() {
            if let Some(holder) = self
                .entries
                .get_mut(&oid)
                .and_then(|e| e.holders.get_mut(&agent))
            {
                holder.mode = LockMode::Write;
                holder.req = req;
            }
            self.stats.upgrades += 1;
            let notice = Notice::Granted {
                req,
                oid,
                mode: LockMode::Write,
            };
            return (RequestOutcome::Granted, vec![Outbound::new(agent, notice)]);
        }

        let mut out = Vec::new();
        if let Some(entry) = self.entries.get_mut(&oid) {
            entry.holders.remove(&agent);
        }
        out.push(Outbound::new(
            agent,
            Notice::Dropped {
                oid: oid.clone(),
                mode: LockMode::Read,
                reason: DropReason::Upgrade,
                requeued: Some(req),
            },
        ));
        self.stats.waits += 1;
        self.enqueue(agent, req, oid.clone(), LockMode::Write, Vec::new());
        self.promote(&mut out);

        let outcome = if self.held_mode(agent, &oid).is_some() {
            RequestOutcome::Granted
        } else {
            RequestOutcome::Queued
        };
        (outcome, out)
    }

    /// Releases the hold of `agent` on `oid` and promotes waiters.
    ///
    /// Releasing something not held is a no-op.
    pub fn release(&mut self, agent: AgentId, oid: &Oid) -> Vec<Outbound> {
        let mut out = Vec::new();
        let removed = self
            .entries
            .get_mut(oid)
            .and_then(|e| e.holders.remove(&agent))
            .is_some();

        if removed {
            self.stats.releases += 1;
            self.unlink(agent, oid);
            self.promote(&mut out);
        }
        out
    }

    /// Withdraws request `req` of `agent` on `oid`.
    ///
    /// If the request was already granted, the grant wins and the lock is
    /// released as part of the cancellation.
    pub fn cancel(&mut self, agent: AgentId, req: ReqId, oid: &Oid) -> Vec<Outbound> {
        let Some(entry) = self.entries.get_mut(oid) else {
            return Vec::new();
        };

        if let Some(pos) = entry
            .queue
            .iter()
            .position(|w| w.agent == agent && w.req == req)
        {
            if let Some(waiter) = entry.queue.remove(pos) {
                self.queued.remove(&waiter.seq);
            }
            self.stats.cancels += 1;
            self.unlink(agent, oid);
            let mut out = Vec::new();
            self.promote(&mut out);
            return out;
        }

        let granted = entry.holders.get(&agent).is_some_and(|h| h.req == req);
        if granted {
            return self.release(agent, oid);
        }
        Vec::new()
    }

    /// Removes `agent` from every entry of this table, as holder and as
    /// waiter, then promotes waiters.
    pub fn release_all(&mut self, agent: AgentId) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(oids) = self.agent_index.remove(&agent) else {
            return out;
        };

        for oid in oids {
            let Some(entry) = self.entries.get_mut(&oid) else {
                continue;
            };
            if entry.holders.remove(&agent).is_some() {
                self.stats.releases += 1;
            }
            let mut kept = VecDeque::with_capacity(entry.queue.len());
            for waiter in entry.queue.drain(..) {
                if waiter.agent == agent {
                    self.queued.remove(&waiter.seq);
                    self.stats.cancels += 1;
                } else {
                    kept.push_back(waiter);
                }
            }
            entry.queue = kept;
        }

        self.promote(&mut out);
        out
    }

    /// Gives up locks of `victim` to let `waiter` proceed on `waiter_oid`.
    ///
    /// Only acts if `waiter` still has a request queued on `waiter_oid`.
    /// Every hold of `victim` that conflicts with that request is released
    /// and re-queued at the tail, and every conflicting request of `victim`
    /// queued ahead of it is moved to the tail. The victim always receives a
    /// [`Notice::SurrenderDone`].
    pub fn surrender(
        &mut self,
        victim: AgentId,
        waiter: AgentId,
        waiter_oid: &Oid,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let target = self
            .entries
            .get(waiter_oid)
            .and_then(|e| e.queue.iter().find(|w| w.agent == waiter))
            .map(|w| (w.mode, w.seq));

        let mut released = 0;
        if let Some((wait_mode, wait_seq)) = target {
            let holds: Vec<(Oid, Holder)> = self
                .related(waiter_oid)
                .into_iter()
                .filter_map(|e| e.holders.get(&victim).map(|h| (e.oid.clone(), *h)))
                .filter(|(_, h)| !h.mode.is_compatible_with(&wait_mode))
                .collect();
            let earlier: Vec<(Oid, u64)> = self
                .related(waiter_oid)
                .into_iter()
                .flat_map(|e| {
                    e.queue
                        .iter()
                        .filter(|w| {
                            w.agent == victim
                                && w.seq < wait_seq
                                && !w.mode.is_compatible_with(&wait_mode)
                        })
                        .map(|w| (e.oid.clone(), w.seq))
                })
                .collect();

            for (oid, holder) in holds {
                if let Some(entry) = self.entries.get_mut(&oid) {
                    entry.holders.remove(&victim);
                }
                self.enqueue(victim, holder.req, oid.clone(), holder.mode, Vec::new());
                self.stats.surrenders += 1;
                released += 1;
                out.push(Outbound::new(
                    victim,
                    Notice::Dropped {
                        oid,
                        mode: holder.mode,
                        reason: DropReason::Surrender,
                        requeued: Some(holder.req),
                    },
                ));
            }

            for (oid, seq) in earlier {
                let Some(entry) = self.entries.get_mut(&oid) else {
                    continue;
                };
                let Some(pos) = entry.queue.iter().position(|w| w.seq == seq) else {
                    continue;
                };
                let Some(moved) = entry.queue.remove(pos) else {
                    continue;
                };
                self.queued.remove(&seq);
                self.enqueue(victim, moved.req, oid.clone(), moved.mode, Vec::new());
                self.stats.surrenders += 1;
                released += 1;
                out.push(Outbound::new(
                    victim,
                    Notice::Requeued {
                        req: moved.req,
                        oid,
                        mode: moved.mode,
                    },
                ));
            }
        }

        self.promote(&mut out);
        out.push(Outbound::new(
            victim,
            Notice::SurrenderDone { waiter, released },
        ));
        out
    }

    /// Returns the mode `agent` holds on exactly `oid`.
    pub fn held_mode(&self, agent: AgentId, oid: &Oid) -> Option<LockMode> {
        self.entries
            .get(oid)
            .and_then(|e| e.holders.get(&agent))
            .map(|h| h.mode)
    }

    /// Returns true if `agent` has a request queued on exactly `oid`.
    pub fn is_queued(&self, agent: AgentId, oid: &Oid) -> bool {
        self.entries
            .get(oid)
            .is_some_and(|e| e.queue.iter().any(|w| w.agent == agent))
    }

    /// Returns the number of entries.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the number of queued requests.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Returns the counters.
    pub fn stats(&self) -> LockStats {
        self.stats
    }

    /// Captures the current state.
    pub fn snapshot(&self) -> TableSnapshot {
        let entries = self
            .entries
            .values()
            .map(|e| {
                let mut holders: Vec<(AgentId, LockMode)> =
                    e.holders.iter().map(|(a, h)| (*a, h.mode)).collect();
                holders.sort();
                EntrySnapshot {
                    oid: e.oid.clone(),
                    holders,
                    waiters: e.queue.iter().map(|w| (w.agent, w.mode)).collect(),
                }
            })
            .collect();

        TableSnapshot {
            host: self.host,
            entries,
            stats: self.stats,
        }
    }

    /// Entries whose OID is an ancestor of, equal to, or a descendant of `oid`.
    fn related(&self, oid: &Oid) -> Vec<&LockEntry> {
        let mut found: Vec<&LockEntry> = oid
            .ancestors()
            .filter_map(|a| self.entries.get(&a))
            .collect();
        found.extend(
            self.entries
                .range(oid.clone()..)
                .take_while(|(k, _)| oid.is_prefix_of(k))
                .map(|(_, e)| e),
        );
        found
    }

    /// Computes who blocks a request. `before` limits waiters to those
    /// enqueued earlier; `None` treats every queued request as earlier.
    fn blockers_for(
        &self,
        agent: AgentId,
        oid: &Oid,
        mode: LockMode,
        before: Option<u64>,
    ) -> Vec<Blocker> {
        let mut found: BTreeMap<AgentId, BlockKind> = BTreeMap::new();

        for entry in self.related(oid) {
            for (holder, h) in &entry.holders {
                if *holder != agent && !h.mode.is_compatible_with(&mode) {
                    found.insert(*holder, BlockKind::Holder);
                }
            }
            for w in &entry.queue {
                if w.agent == agent || before.is_some_and(|seq| w.seq >= seq) {
                    continue;
                }
                if !w.mode.is_compatible_with(&mode) {
                    found.entry(w.agent).or_insert(BlockKind::Waiter);
                }
            }
        }

        found
            .into_iter()
            .map(|(agent, kind)| Blocker { agent, kind })
            .collect()
    }

    fn add_holder(&mut self, agent: AgentId, oid: &Oid, req: ReqId, mode: LockMode) {
        let entry = self
            .entries
            .entry(oid.clone())
            .or_insert_with(|| LockEntry::new(oid.clone()));
        entry
            .holders
            .entry(agent)
            .and_modify(|h| {
                h.mode = h.mode.stronger(mode);
                h.req = req;
            })
            .or_insert(Holder { mode, req });
        self.agent_index
            .entry(agent)
            .or_default()
            .insert(oid.clone());
    }

    fn enqueue(
        &mut self,
        agent: AgentId,
        req: ReqId,
        oid: Oid,
        mode: LockMode,
        blockers: Vec<Blocker>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let entry = self
            .entries
            .entry(oid.clone())
            .or_insert_with(|| LockEntry::new(oid.clone()));
        entry.queue.push_back(Waiter {
            agent,
            req,
            mode,
            seq,
            blockers,
        });
        self.agent_index
            .entry(agent)
            .or_default()
            .insert(oid.clone());
        self.queued.insert(seq, (agent, oid));
    }

    /// Drops `oid` from the agent index once the agent no longer appears in it.
    fn unlink(&mut self, agent: AgentId, oid: &Oid) {
        let present = self.entries.get(oid).is_some_and(|e| e.contains(agent));
        if present {
            return;
        }
        if let Some(oids) = self.agent_index.get_mut(&agent) {
            oids.remove(oid);
            if oids.is_empty() {
                self.agent_index.remove(&agent);
            }
        }
    }

    /// Re-evaluates every queued request in enqueue order, granting each one
    /// that no longer conflicts with a holder or an earlier waiter and
    /// reporting changed blocker sets for the rest.
    ///
    /// A single pass suffices: a request is only ever blocked by holders and
    /// by requests with a smaller sequence number, all of which have been
    /// settled by the time it is evaluated.
    fn promote(&mut self, out: &mut Vec<Outbound>) {
        let order: Vec<(u64, AgentId, Oid)> = self
            .queued
            .iter()
            .map(|(seq, (agent, oid))| (*seq, *agent, oid.clone()))
            .collect();

        for (seq, agent, oid) in order {
            let Some(mode) = self
                .entries
                .get(&oid)
                .and_then(|e| e.queue.iter().find(|w| w.seq == seq))
                .map(|w| w.mode)
            else {
                continue;
            };

            let blockers = self.blockers_for(agent, &oid, mode, Some(seq));
            let Some(entry) = self.entries.get_mut(&oid) else {
                continue;
            };
            let Some(pos) = entry.queue.iter().position(|w| w.seq == seq) else {
                continue;
            };

            if blockers.is_empty() {
                let Some(waiter) = entry.queue.remove(pos) else {
                    continue;
                };
                self.queued.remove(&seq);
                let holder = entry
                    .holders
                    .entry(agent)
                    .and_modify(|h| {
                        h.mode = h.mode.stronger(waiter.mode);
                        h.req = waiter.req;
                    })
                    .or_insert(Holder {
                        mode: waiter.mode,
                        req: waiter.req,
                    });
                let granted = holder.mode;
                self.stats.grants += 1;
                out.push(Outbound::new(
                    agent,
                    Notice::Granted {
                        req: waiter.req,
                        oid,
                        mode: granted,
                    },
                ));
            } else if entry.queue[pos].blockers != blockers {
                let waiter = &mut entry.queue[pos];
                waiter.blockers = blockers.clone();
                out.push(Outbound::new(
                    agent,
                    Notice::Queued {
                        req: waiter.req,
                        oid,
                        mode: waiter.mode,
                        blockers,
                    },
                ));
            }
        }

        if self.config.gc_empty_entries {
            self.entries.retain(|_, e| !e.is_free());
        }
    }
}

impl fmt::Debug for LockTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("host", &self.host)
            .field("entries", &self.entries.len())
            .field("queued", &self.queued.len())
            .finish()
    }
}
