//! Distributed deadlock detection by edge chasing.
//!
//! No participant ever sees the whole wait-for graph. Each transaction agent
//! keeps only its own outgoing edges, as reported by the lock tables it is
//! queued on, in a [`WaitTracker`]. Cycles are found by forwarding probes
//! along those edges:
//!
//! ```text
//!   A ──probe{A,1}──▶ B ──probe{A,1}──▶ C ──probe{A,1}──▶ A   cycle!
//!   │  path: [A→B]      path: [A→B,B→C]   path: [A→B,B→C,C→A]
//! ```
//!
//! - When an agent gains a new blocker it starts a probe `{initiator, seq}`
//!   toward that blocker.
//! - A waiting agent forwards each probe once to every agent it waits for,
//!   appending its own hop. Agents that are not waiting drop probes.
//! - A probe that returns to its initiator confirms a cycle. A cycle of N
//!   agents is confirmed after N hops.
//! - A victim ignores further cycles while it is surrendering. Once every
//!   surrender is acknowledged it probes all of its blockers again, so a
//!   cycle it ignored is found anew.
//!
//! Forwarding is deduplicated by an arena holding, per initiator, the highest
//! probe sequence forwarded. Initiators number probes increasingly, so a
//! probe started after a new edge appeared is never suppressed by an older
//! one. The arena is cleared whenever the agent stops waiting.
//!
//! # Victim Selection
//!
//! The victim is the agent with the lowest [`AgentId`] in the cycle. Every
//! participant derives the same victim from the cycle alone, so detection of
//! the same cycle from several start points resolves it the same way.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use dlm_common::types::{AgentId, HostId, Oid};

use crate::lock::{BlockKind, Blocker, LockMode};

/// Identifies a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId {
    /// The agent that started the probe.
    pub initiator: AgentId,
    /// Increasing per initiator.
    pub seq: u64,
}

/// A request of the waiting agent that is blocked by the next agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contention {
    /// Host of the lock table the request is queued on.
    pub host: HostId,
    /// The requested object.
    pub oid: Oid,
    /// The requested mode.
    pub mode: LockMode,
    /// Whether the next agent blocks it as holder or as earlier waiter.
    pub kind: BlockKind,
}

/// One wait-for edge along a probe path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    /// The waiting agent.
    pub agent: AgentId,
    /// The agent it waits for.
    pub waits_for: AgentId,
    /// The requests of `agent` that `waits_for` blocks.
    pub contentions: Vec<Contention>,
}

/// A probe message travelling along wait-for edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Probe identity.
    pub id: ProbeId,
    /// Edges traversed so far, starting at the initiator.
    pub path: Vec<Hop>,
}

/// A confirmed wait-for cycle.
///
/// `hops[i].waits_for == hops[i + 1].agent`, and the last hop waits for the
/// first agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    hops: Vec<Hop>,
}

impl Cycle {
    /// Builds a cycle from a closed path. Returns `None` if the path is empty
    /// or not closed.
    pub fn from_path(hops: Vec<Hop>) -> Option<Self> {
        let first = hops.first()?.agent;
        let last = hops.last()?.waits_for;
        let linked = hops.windows(2).all(|w| w[0].waits_for == w[1].agent);
        (first == last && linked).then_some(Self { hops })
    }

    /// Returns the hops.
    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    /// Returns the number of agents in the cycle.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Returns true if the cycle has no hops. Never true for a built cycle.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Returns the agents in cycle order.
    pub fn agents(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.hops.iter().map(|h| h.agent)
    }

    /// Returns the deterministic victim: the lowest agent id in the cycle.
    pub fn victim(&self) -> Option<AgentId> {
        self.agents().min()
    }

    /// Returns the hop leaving `agent`.
    pub fn hop_from(&self, agent: AgentId) -> Option<&Hop> {
        self.hops.iter().find(|h| h.agent == agent)
    }

    /// Returns the hop entering `agent`, i.e. its predecessor's edge.
    pub fn hop_into(&self, agent: AgentId) -> Option<&Hop> {
        self.hops.iter().find(|h| h.waits_for == agent)
    }
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for hop in &self.hops {
            write!(f, "{} -> ", hop.agent)?;
        }
        match self.hops.first() {
            Some(hop) => write!(f, "{}", hop.agent),
            None => Ok(()),
        }
    }
}

/// What to do with a received probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeAction {
    /// Send each probe to its agent.
    Forward(Vec<(AgentId, Probe)>),
    /// The probe closed a cycle through this agent.
    Cycle(Cycle),
    /// Nothing to do.
    Discard,
}

#[derive(Debug, Clone)]
struct Edge {
    mode: LockMode,
    blockers: Vec<Blocker>,
}

/// The outgoing wait-for edges of one agent, and its probe state.
#[derive(Debug)]
pub struct WaitTracker {
    me: AgentId,
    edges: BTreeMap<(HostId, Oid), Edge>,
    /// Highest probe seq forwarded, per initiator.
    seen: HashMap<AgentId, u64>,
    next_seq: u64,
}

impl WaitTracker {
    /// Creates an empty tracker for `me`.
    pub fn new(me: AgentId) -> Self {
        Self {
            me,
            edges: BTreeMap::new(),
            seen: HashMap::new(),
            next_seq: 1,
        }
    }

    /// Returns true if any request of the agent is blocked.
    pub fn is_waiting(&self) -> bool {
        !self.edges.is_empty()
    }

    /// Returns every agent this agent waits for.
    pub fn blocking_agents(&self) -> BTreeSet<AgentId> {
        self.edges
            .values()
            .flat_map(|e| e.blockers.iter().map(|b| b.agent))
            .collect()
    }

    /// Returns true if this agent waits for `other`.
    pub fn waits_for(&self, other: AgentId) -> bool {
        self.edges
            .values()
            .any(|e| e.blockers.iter().any(|b| b.agent == other))
    }

    /// Records the blockers of a queued request on (`host`, `oid`).
    ///
    /// Returns a fresh probe for every agent that was not blocking this agent
    /// before.
    pub fn set_blockers(
        &mut self,
        host: HostId,
        oid: Oid,
        mode: LockMode,
        blockers: Vec<Blocker>,
    ) -> Vec<(AgentId, Probe)> {
        let before = self.blocking_agents();
        if blockers.is_empty() {
            self.edges.remove(&(host, oid));
        } else {
            self.edges.insert((host, oid), Edge { mode, blockers });
        }

        let fresh: Vec<AgentId> = self
            .blocking_agents()
            .difference(&before)
            .copied()
            .collect();
        self.expire();

        fresh.into_iter().map(|agent| self.start_probe(agent)).collect()
    }

    /// Starts a fresh probe toward every agent this agent waits for.
    ///
    /// Used when cycles through this agent may have been left unresolved,
    /// e.g. after it finished surrendering and ignored other cycles meanwhile.
    pub fn restart_probes(&mut self) -> Vec<(AgentId, Probe)> {
        self.blocking_agents()
            .into_iter()
            .map(|agent| self.start_probe(agent))
            .collect()
    }

    fn start_probe(&mut self, agent: AgentId) -> (AgentId, Probe) {
        let id = ProbeId {
            initiator: self.me,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let probe = Probe {
            id,
            path: vec![self.hop_to(agent)],
        };
        (agent, probe)
    }

    /// Forgets the edge of a request that was granted, dropped or cancelled.
    pub fn clear_edge(&mut self, host: HostId, oid: &Oid) {
        self.edges.remove(&(host, oid.clone()));
        self.expire();
    }

    /// Forgets everything.
    pub fn clear(&mut self) {
        self.edges.clear();
        self.seen.clear();
    }

    /// Handles a probe addressed to this agent.
    pub fn on_probe(&mut self, probe: Probe) -> ProbeAction {
        if probe.id.initiator == self.me {
            let still_waiting = probe
                .path
                .first()
                .is_some_and(|first| self.waits_for(first.waits_for));
            if !still_waiting {
                return ProbeAction::Discard;
            }
            return match Cycle::from_path(probe.path) {
                Some(cycle) => ProbeAction::Cycle(cycle),
                None => ProbeAction::Discard,
            };
        }

        if !self.is_waiting() || probe.path.iter().any(|h| h.agent == self.me) {
            return ProbeAction::Discard;
        }

        let Probe { id, path } = probe;
        match self.seen.get(&id.initiator) {
            Some(&seq) if seq >= id.seq => return ProbeAction::Discard,
            _ => {}
        }
        self.seen.insert(id.initiator, id.seq);

        let forwards = self
            .blocking_agents()
            .into_iter()
            .map(|next| {
                let mut hops = path.clone();
                hops.push(self.hop_to(next));
                (next, Probe { id, path: hops })
            })
            .collect();
        ProbeAction::Forward(forwards)
    }

    /// Builds this agent's hop toward `other`.
    fn hop_to(&self, other: AgentId) -> Hop {
        let contentions = self
            .edges
            .iter()
            .filter_map(|((host, oid), edge)| {
                edge.blockers
                    .iter()
                    .find(|b| b.agent == other)
                    .map(|b| Contention {
                        host: *host,
                        oid: oid.clone(),
                        mode: edge.mode,
                        kind: b.kind,
                    })
            })
            .collect();

        Hop {
            agent: self.me,
            waits_for: other,
            contentions,
        }
    }

    fn expire(&mut self) {
        if self.edges.is_empty() {
            self.seen.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const H1: HostId = HostId::new(1);

    fn agent(host: u64, seq: u64) -> AgentId {
        AgentId::new(HostId::new(host), seq)
    }

    fn oid(path: &str) -> Oid {
        Oid::parse(path).unwrap()
    }

    fn holder(agent: AgentId) -> Vec<Blocker> {
        vec![Blocker {
            agent,
            kind: BlockKind::Holder,
        }]
    }

    /// Delivers probes between trackers until none are in flight. Returns
    /// every confirmed cycle with the number of hops its probe travelled.
    fn run(
        trackers: &mut BTreeMap<AgentId, WaitTracker>,
        initial: Vec<(AgentId, Probe)>,
    ) -> Vec<(AgentId, Cycle, usize)> {
        let mut in_flight: VecDeque<(AgentId, Probe)> = initial.into_iter().collect();
        let mut found = Vec::new();
        while let Some((to, probe)) = in_flight.pop_front() {
            let hops = probe.path.len();
            let Some(tracker) = trackers.get_mut(&to) else {
                continue;
            };
            match tracker.on_probe(probe) {
                ProbeAction::Forward(next) => in_flight.extend(next),
                ProbeAction::Cycle(cycle) => found.push((to, cycle, hops)),
                ProbeAction::Discard => {}
            }
        }
        found
    }

    /// Builds a ring a0 -> a1 -> ... -> a(n-1) -> a0 where each agent holds
    /// `o{i}` and waits for `o{i+1}`. The edge into `closing` is added last.
    fn ring(
        agents: &[AgentId],
        closing: usize,
    ) -> (BTreeMap<AgentId, WaitTracker>, Vec<(AgentId, Probe)>) {
        let n = agents.len();
        let mut trackers: BTreeMap<AgentId, WaitTracker> =
            agents.iter().map(|a| (*a, WaitTracker::new(*a))).collect();

        let mut last = Vec::new();
        for step in 1..=n {
            let i = (closing + step) % n;
            let next = agents[(i + 1) % n];
            let probes = trackers.get_mut(&agents[i]).unwrap().set_blockers(
                H1,
                oid(&format!("o{}", (i + 1) % n)),
                LockMode::Write,
                holder(next),
            );
            if step < n {
                // Probes sent before the ring closes die at non-waiting agents.
                assert!(run(&mut trackers, probes).is_empty());
            } else {
                last = probes;
            }
        }
        (trackers, last)
    }

    #[test]
    fn test_two_agent_cycle() {
        let a = agent(1, 1);
        let b = agent(2, 1);
        let mut ta = WaitTracker::new(a);
        let mut tb = WaitTracker::new(b);

        let probes = ta.set_blockers(H1, oid("y"), LockMode::Write, holder(b));
        assert_eq!(probes.len(), 1);
        // b is not waiting yet: the probe dies.
        assert_eq!(tb.on_probe(probes[0].1.clone()), ProbeAction::Discard);

        let probes = tb.set_blockers(H1, oid("x"), LockMode::Write, holder(a));
        let ProbeAction::Forward(fwd) = ta.on_probe(probes[0].1.clone()) else {
            panic!("expected forward");
        };
        assert_eq!(fwd.len(), 1);
        assert_eq!(fwd[0].0, b);

        let ProbeAction::Cycle(cycle) = tb.on_probe(fwd[0].1.clone()) else {
            panic!("expected cycle");
        };
        assert_eq!(cycle.len(), 2);
        assert_eq!(cycle.victim(), Some(a));
        let into_a = cycle.hop_into(a).unwrap();
        assert_eq!(into_a.agent, b);
        assert_eq!(into_a.contentions[0].oid, oid("x"));
        assert_eq!(cycle.to_string(), "a2.1 -> a1.1 -> a2.1");
    }

    #[test]
    fn test_cycle_confirmed_in_n_hops() {
        for n in 2..=6 {
            let agents: Vec<AgentId> = (0..n).map(|i| agent(i % 3 + 1, i)).collect();
            let (mut trackers, probes) = ring(&agents, 0);
            let found = run(&mut trackers, probes);

            assert_eq!(found.len(), 1, "ring of {}", n);
            let (_, cycle, hops) = &found[0];
            assert_eq!(*hops, n as usize);
            assert_eq!(cycle.len(), n as usize);
        }
    }

    #[test]
    fn test_same_victim_from_any_start() {
        let agents = vec![agent(3, 1), agent(1, 9), agent(2, 4), agent(1, 2)];
        let mut victims = BTreeSet::new();
        for closing in 0..agents.len() {
            let (mut trackers, probes) = ring(&agents, closing);
            for (_, cycle, _) in run(&mut trackers, probes) {
                victims.insert(cycle.victim().unwrap());
            }
        }
        assert_eq!(victims.into_iter().collect::<Vec<_>>(), vec![agent(1, 2)]);
    }

    #[test]
    fn test_probe_forwarded_once() {
        let a = agent(1, 1);
        let b = agent(1, 2);
        let c = agent(1, 3);
        let mut tb = WaitTracker::new(b);
        tb.set_blockers(H1, oid("z"), LockMode::Write, holder(c));

        let probe = Probe {
            id: ProbeId {
                initiator: a,
                seq: 4,
            },
            path: vec![Hop {
                agent: a,
                waits_for: b,
                contentions: Vec::new(),
            }],
        };
        assert!(matches!(tb.on_probe(probe.clone()), ProbeAction::Forward(_)));
        assert_eq!(tb.on_probe(probe.clone()), ProbeAction::Discard);

        let older = Probe {
            id: ProbeId {
                initiator: a,
                seq: 3,
            },
            ..probe.clone()
        };
        assert_eq!(tb.on_probe(older), ProbeAction::Discard);

        // The arena expires once b stops waiting.
        tb.clear_edge(H1, &oid("z"));
        tb.set_blockers(H1, oid("z"), LockMode::Write, holder(c));
        assert!(matches!(tb.on_probe(probe), ProbeAction::Forward(_)));
    }

    #[test]
    fn test_stale_cycle_discarded() {
        let a = agent(1, 1);
        let b = agent(1, 2);
        let mut ta = WaitTracker::new(a);
        let mut tb = WaitTracker::new(b);

        ta.set_blockers(H1, oid("y"), LockMode::Write, holder(b));
        let probes = tb.set_blockers(H1, oid("x"), LockMode::Write, holder(a));
        let ProbeAction::Forward(fwd) = ta.on_probe(probes[0].1.clone()) else {
            panic!("expected forward");
        };

        // b was granted before the probe came back.
        tb.clear_edge(H1, &oid("x"));
        assert_eq!(tb.on_probe(fwd[0].1.clone()), ProbeAction::Discard);
    }

    #[test]
    fn test_only_new_blockers_start_probes() {
        let a = agent(1, 1);
        let b = agent(1, 2);
        let c = agent(1, 3);
        let mut ta = WaitTracker::new(a);

        assert_eq!(
            ta.set_blockers(H1, oid("x"), LockMode::Read, holder(b)).len(),
            1
        );
        let both = vec![
            Blocker {
                agent: b,
                kind: BlockKind::Holder,
            },
            Blocker {
                agent: c,
                kind: BlockKind::Waiter,
            },
        ];
        let probes = ta.set_blockers(H1, oid("x"), LockMode::Read, both);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].0, c);
        assert_eq!(probes[0].1.path[0].contentions[0].kind, BlockKind::Waiter);
        assert!(probes[0].1.id.seq > 1);

        assert!(ta
            .set_blockers(H1, oid("x"), LockMode::Read, Vec::new())
            .is_empty());
        assert!(!ta.is_waiting());
    }

    #[test]
    fn test_restart_finds_cycle_again() {
        let a = agent(1, 1);
        let b = agent(1, 2);
        let mut ta = WaitTracker::new(a);
        let mut tb = WaitTracker::new(b);

        let first = ta.set_blockers(H1, oid("y"), LockMode::Write, holder(b));
        tb.set_blockers(H1, oid("x"), LockMode::Write, holder(a));
        let ProbeAction::Forward(fwd) = tb.on_probe(first[0].1.clone()) else {
            panic!("expected forward");
        };
        assert!(matches!(ta.on_probe(fwd[0].1.clone()), ProbeAction::Cycle(_)));

        // Nothing changed, so b would suppress a replay of the old probe.
        assert_eq!(tb.on_probe(first[0].1.clone()), ProbeAction::Discard);

        let again = ta.restart_probes();
        assert_eq!(again.len(), 1);
        assert!(again[0].1.id.seq > first[0].1.id.seq);
        let ProbeAction::Forward(fwd) = tb.on_probe(again[0].1.clone()) else {
            panic!("expected forward");
        };
        let ProbeAction::Cycle(cycle) = ta.on_probe(fwd[0].1.clone()) else {
            panic!("expected cycle");
        };
        assert_eq!(cycle.victim(), Some(a));

        assert!(WaitTracker::new(b).restart_probes().is_empty());
    }

    #[test]
    fn test_cycle_from_path_requires_closure() {
        let a = agent(1, 1);
        let b = agent(1, 2);
        let hop = |from, to| Hop {
            agent: from,
            waits_for: to,
            contentions: Vec::new(),
        };

        assert!(Cycle::from_path(vec![hop(a, b)]).is_none());
        assert!(Cycle::from_path(Vec::new()).is_none());
        let cycle = Cycle::from_path(vec![hop(a, b), hop(b, a)]).unwrap();
        assert_eq!(cycle.hop_from(b).unwrap().waits_for, a);
    }
}
