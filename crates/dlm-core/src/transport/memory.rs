//! In-memory transport.
//!
//! Routes messages over unbounded channels inside one process. It can
//! simulate partitions between hosts: a message crossing a partitioned link
//! is parked, in order, and delivered once the link heals. An unreachable
//! host therefore looks exactly like a slow one to its peers.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use dlm_common::types::{AgentId, HostId};

use crate::rpc::{AgentMsg, HostRequest};

use super::{Transport, TransportError, TransportResult};

enum Envelope {
    Host(HostId, HostRequest),
    Agent(AgentId, AgentMsg),
}

impl Envelope {
    fn dest_host(&self) -> HostId {
        match self {
            Envelope::Host(host, _) => *host,
            Envelope::Agent(agent, _) => agent.host(),
        }
    }
}

struct Parked {
    from: HostId,
    envelope: Envelope,
}

#[derive(Default)]
struct Links {
    /// Blocked (from, to) pairs.
    partitions: HashSet<(HostId, HostId)>,
    /// Messages waiting for a link to heal, in send order.
    parked: VecDeque<Parked>,
}

/// A shared in-process network.
///
/// Lock servers and agents register their inboxes here; every participant
/// holding an `Arc<MemoryNetwork>` can reach every other.
pub struct MemoryNetwork {
    /// Senders to each host's lock server.
    hosts: DashMap<HostId, mpsc::UnboundedSender<HostRequest>>,
    /// Senders to each live agent.
    agents: DashMap<AgentId, mpsc::UnboundedSender<AgentMsg>>,
    /// Partitions and parked messages. Sends take this lock so that parking
    /// and flushing preserve per-link order.
    links: Mutex<Links>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    /// Creates a new memory network.
    pub fn new() -> Self {
        Self {
            hosts: DashMap::new(),
            agents: DashMap::new(),
            links: Mutex::new(Links::default()),
        }
    }

    /// Creates a new memory network wrapped in Arc.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Adds a one-way partition: messages from `from` to `to` are parked.
    pub fn add_partition(&self, from: HostId, to: HostId) {
        self.links.lock().partitions.insert((from, to));
    }

    /// Adds a bidirectional partition between two hosts.
    pub fn add_partition_bidirectional(&self, host1: HostId, host2: HostId) {
        let mut links = self.links.lock();
        links.partitions.insert((host1, host2));
        links.partitions.insert((host2, host1));
    }

    /// Removes a one-way partition and delivers what it held back.
    pub fn remove_partition(&self, from: HostId, to: HostId) {
        let mut links = self.links.lock();
        links.partitions.remove(&(from, to));
        self.flush(&mut links);
    }

    /// Partitions a host from every other registered host.
    pub fn isolate_host(&self, host: HostId) {
        let mut links = self.links.lock();
        for other in self.hosts.iter().map(|e| *e.key()) {
            if other != host {
                links.partitions.insert((host, other));
                links.partitions.insert((other, host));
            }
        }
    }

    /// Removes all partitions involving a host.
    pub fn heal_host(&self, host: HostId) {
        let mut links = self.links.lock();
        links.partitions.retain(|&(f, t)| f != host && t != host);
        self.flush(&mut links);
    }

    /// Removes all partitions.
    pub fn heal_all(&self) {
        let mut links = self.links.lock();
        links.partitions.clear();
        self.flush(&mut links);
    }

    /// Checks if there's a partition from `from` to `to`.
    pub fn is_partitioned(&self, from: HostId, to: HostId) -> bool {
        self.links.lock().partitions.contains(&(from, to))
    }

    /// Returns the number of messages waiting for a partition to heal.
    pub fn parked_count(&self) -> usize {
        self.links.lock().parked.len()
    }

    /// Returns the number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    fn send(&self, from: HostId, envelope: Envelope) -> TransportResult<()> {
        let mut links = self.links.lock();
        if links.partitions.contains(&(from, envelope.dest_host())) {
            links.parked.push_back(Parked { from, envelope });
            return Ok(());
        }
        self.deliver(envelope)
    }

    fn deliver(&self, envelope: Envelope) -> TransportResult<()> {
        match envelope {
            Envelope::Host(host, request) => {
                let sender = self
                    .hosts
                    .get(&host)
                    .ok_or(TransportError::UnknownHost(host))?;
                sender
                    .send(request)
                    .map_err(|_| TransportError::Closed(host.to_string()))
            }
            Envelope::Agent(agent, message) => {
                let sender = self
                    .agents
                    .get(&agent)
                    .ok_or(TransportError::UnknownAgent(agent))?;
                sender
                    .send(message)
                    .map_err(|_| TransportError::Closed(agent.to_string()))
            }
        }
    }

    /// Delivers parked messages whose link is open again, keeping the order
    /// of those still held back.
    fn flush(&self, links: &mut Links) {
        let parked = std::mem::take(&mut links.parked);
        for msg in parked {
            if links
                .partitions
                .contains(&(msg.from, msg.envelope.dest_host()))
            {
                links.parked.push_back(msg);
            } else if let Err(e) = self.deliver(msg.envelope) {
                debug!(from = %msg.from, error = %e, "dropping parked message");
            }
        }
    }
}

impl fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("hosts", &self.hosts.len())
            .field("agents", &self.agents.len())
            .finish()
    }
}

impl Transport for MemoryNetwork {
    fn send_to_host(
        &self,
        from: HostId,
        to: HostId,
        request: HostRequest,
    ) -> TransportResult<()> {
        if !self.hosts.contains_key(&to) {
            return Err(TransportError::UnknownHost(to));
        }
        self.send(from, Envelope::Host(to, request))
    }

    fn send_to_agent(&self, from: HostId, to: AgentId, message: AgentMsg) -> TransportResult<()> {
        self.send(from, Envelope::Agent(to, message))
    }

    fn has_host(&self, host: HostId) -> bool {
        self.hosts.contains_key(&host)
    }

    fn hosts(&self) -> Vec<HostId> {
        let mut hosts: Vec<HostId> = self.hosts.iter().map(|e| *e.key()).collect();
        hosts.sort();
        hosts
    }

    fn register_host(&self, host: HostId, inbox: mpsc::UnboundedSender<HostRequest>) {
        self.hosts.insert(host, inbox);
    }

    fn register_agent(&self, agent: AgentId, inbox: mpsc::UnboundedSender<AgentMsg>) {
        self.agents.insert(agent, inbox);
    }

    fn unregister_agent(&self, agent: AgentId) {
        self.agents.remove(&agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlm_common::types::Oid;

    use crate::lock::{LockMode, Notice};

    const H1: HostId = HostId::new(1);
    const H2: HostId = HostId::new(2);

    fn release(n: u64) -> HostRequest {
        HostRequest::ReleaseAll {
            agent: AgentId::new(H1, n),
        }
    }

    fn released_seq(request: HostRequest) -> u64 {
        match request {
            HostRequest::ReleaseAll { agent } => agent.seq(),
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_network_send_recv() {
        let network = MemoryNetwork::shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.register_host(H2, tx);

        network.send_to_host(H1, H2, release(1)).unwrap();
        assert_eq!(released_seq(rx.recv().await.unwrap()), 1);

        assert!(matches!(
            network.send_to_host(H1, HostId::new(9), release(1)),
            Err(TransportError::UnknownHost(_))
        ));
    }

    #[tokio::test]
    async fn test_partition_parks_in_order() {
        let network = MemoryNetwork::shared();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        network.register_host(H1, tx1);
        network.register_host(H2, tx2);

        network.add_partition(H1, H2);
        network.send_to_host(H1, H2, release(1)).unwrap();
        network.send_to_host(H1, H2, release(2)).unwrap();
        assert!(rx2.try_recv().is_err());
        assert_eq!(network.parked_count(), 2);

        // The reverse direction is open.
        network.send_to_host(H2, H1, release(3)).unwrap();
        assert_eq!(released_seq(rx1.recv().await.unwrap()), 3);

        network.heal_all();
        assert_eq!(released_seq(rx2.recv().await.unwrap()), 1);
        assert_eq!(released_seq(rx2.recv().await.unwrap()), 2);
        assert_eq!(network.parked_count(), 0);
    }

    #[tokio::test]
    async fn test_isolate_and_heal_host() {
        let network = MemoryNetwork::shared();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        network.register_host(H1, tx1);
        network.register_host(H2, tx2);

        network.isolate_host(H2);
        assert!(network.is_partitioned(H1, H2));
        assert!(network.is_partitioned(H2, H1));

        // Local traffic is never partitioned.
        network.send_to_host(H2, H2, release(4)).unwrap();
        assert_eq!(released_seq(rx2.recv().await.unwrap()), 4);

        network.send_to_host(H1, H2, release(5)).unwrap();
        assert!(rx2.try_recv().is_err());
        network.heal_host(H2);
        assert_eq!(released_seq(rx2.recv().await.unwrap()), 5);
    }

    #[tokio::test]
    async fn test_agent_routing() {
        let network = MemoryNetwork::shared();
        let agent = AgentId::new(H2, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        network.register_agent(agent, tx);

        let notice = Notice::Granted {
            req: 1,
            oid: Oid::parse("x").unwrap(),
            mode: LockMode::Read,
        };
        network
            .send_to_agent(
                H1,
                agent,
                AgentMsg::Notice {
                    host: H1,
                    notice: notice.clone(),
                },
            )
            .unwrap();
        match rx.recv().await.unwrap() {
            AgentMsg::Notice { host, notice: got } => {
                assert_eq!(host, H1);
                assert_eq!(got, notice);
            }
            other => panic!("unexpected message {:?}", other),
        }

        network.unregister_agent(agent);
        let result = network.send_to_agent(
            H1,
            agent,
            AgentMsg::Notice {
                host: H1,
                notice,
            },
        );
        assert!(matches!(result, Err(TransportError::UnknownAgent(_))));
        assert_eq!(network.agent_count(), 0);
    }
}
