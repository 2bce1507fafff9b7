//! Transaction lifecycle management.
//!
//! A [`Cluster`] starts one lock server per configured host on a shared
//! in-memory network and hands out a [`LockManager`] per host. The lock
//! manager creates transaction agents homed on its host and guarantees that
//! ending a transaction releases every lock it holds, on every host.
//!
//! # Example
//!
//! ```ignore
//! use dlm_common::{ClientId, DlmConfig};
//! use dlm_core::{Cluster, LockSpec, TxnOptions};
//!
//! let cluster = Cluster::start(DlmConfig::with_hosts([1, 2]))?;
//! let manager = cluster.local();
//! let caller = ClientId::new(1);
//!
//! let objects = vec![LockSpec::parse("db/t1")?];
//! let (txn, result) = manager
//!     .begin_transaction(caller, objects, TxnOptions::new())
//!     .await?;
//! assert!(result.have_all_locks());
//! manager.end_transaction(&txn).await?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use dlm_common::config::DlmConfig;
use dlm_common::error::{DlmError, DlmResult};
use dlm_common::types::{AgentId, ClientId, HostId};

use crate::agent::{resolve_spec, Agent, AgentHandle, AgentParams, LockResult, LockSpec, TxnOptions};
use crate::lock::TableSnapshot;
use crate::rpc::HostRequest;
use crate::server::LockServer;
use crate::transport::{MemoryNetwork, Transport};

/// Statistics about transactions.
#[derive(Debug, Default)]
pub struct TransactionStats {
    /// Total transactions started.
    pub started: AtomicU64,
    /// Total transactions ended.
    pub ended: AtomicU64,
    /// Total transactions aborted as deadlock victims.
    pub aborted: AtomicU64,
    /// Transactions started and not yet ended.
    pub active: AtomicU64,
    /// Total deadlock cycles confirmed.
    pub deadlocks: AtomicU64,
    /// Total locks and queue positions surrendered.
    pub surrenders: AtomicU64,
}

impl TransactionStats {
    /// Creates new stats.
    pub fn new() -> Self {
        Self::default()
    }
}

struct NodeInner {
    host: HostId,
    config: Arc<DlmConfig>,
    network: Arc<dyn Transport>,
    next_agent: AtomicU64,
    stats: Arc<TransactionStats>,
}

/// Creates and ends transactions homed on one host.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<NodeInner>,
}

impl LockManager {
    fn new(
        host: HostId,
        config: Arc<DlmConfig>,
        network: Arc<dyn Transport>,
        stats: Arc<TransactionStats>,
    ) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                host,
                config,
                network,
                next_agent: AtomicU64::new(1),
                stats,
            }),
        }
    }

    /// Returns the home host of agents created here.
    pub fn host(&self) -> HostId {
        self.inner.host
    }

    /// Returns the transaction statistics.
    pub fn stats(&self) -> &TransactionStats {
        &self.inner.stats
    }

    /// Starts a transaction without initial locks.
    pub fn begin(&self, caller: ClientId, options: TxnOptions) -> AgentHandle {
        let id = AgentId::new(
            self.inner.host,
            self.inner.next_agent.fetch_add(1, AtomicOrdering::SeqCst),
        );
        let params = AgentParams {
            id,
            client: options.client.unwrap_or(caller),
            caller,
            abort_on_deadlock: options
                .abort_on_deadlock
                .unwrap_or(self.inner.config.txn.abort_on_deadlock),
            detection: self.inner.config.deadlock_detection,
        };

        self.inner.stats.started.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.stats.active.fetch_add(1, AtomicOrdering::Relaxed);
        info!(agent = %id, client = %params.client, "transaction started");

        Agent::spawn(
            params,
            Arc::clone(&self.inner.network),
            Arc::clone(&self.inner.stats),
        )
    }

    /// Starts a transaction and requests `objects` in order.
    ///
    /// Returns the agent handle for `caller` together with the outcome of
    /// the initial requests. Invalid objects are rejected before the
    /// transaction is created.
    pub async fn begin_transaction(
        &self,
        caller: ClientId,
        objects: Vec<LockSpec>,
        options: TxnOptions,
    ) -> DlmResult<(AgentHandle, LockResult)> {
        let objects = objects
            .into_iter()
            .map(|spec| resolve_spec(spec, self.inner.host, self.inner.network.as_ref()))
            .collect::<DlmResult<Vec<_>>>()?;

        let handle = self.begin(caller, options);
        let client = handle.with_caller(handle.client());
        client.lock_objects(objects)?;
        let result = client.await_all_locks().await?;
        debug!(agent = %handle.agent_id(), status = ?result.status, "initial locks settled");
        Ok((handle, result))
    }

    /// Ends a transaction. Ending it again is a no-op.
    pub async fn end_transaction(&self, handle: &AgentHandle) -> DlmResult<()> {
        handle.end().await
    }
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("host", &self.inner.host)
            .finish()
    }
}

/// A set of hosts running in one process.
pub struct Cluster {
    config: Arc<DlmConfig>,
    network: Arc<MemoryNetwork>,
    nodes: BTreeMap<HostId, LockManager>,
    local: LockManager,
    stats: Arc<TransactionStats>,
    servers: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    /// Starts a lock server for every configured host.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: DlmConfig) -> DlmResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let network = MemoryNetwork::shared();
        let transport: Arc<dyn Transport> = network.clone();
        let stats = Arc::new(TransactionStats::new());

        let mut servers = Vec::with_capacity(config.hosts.len());
        let mut nodes = BTreeMap::new();
        for &host in &config.hosts {
            let server = LockServer::new(host, config.lock_table.clone(), Arc::clone(&transport));
            servers.push(tokio::spawn(server.run()));
            nodes.insert(
                host,
                LockManager::new(
                    host,
                    Arc::clone(&config),
                    Arc::clone(&transport),
                    Arc::clone(&stats),
                ),
            );
        }

        let local = nodes
            .get(&config.local_host)
            .cloned()
            .ok_or(DlmError::UnknownHost {
                host: config.local_host,
            })?;
        info!(hosts = config.hosts.len(), local = %config.local_host, "cluster started");

        Ok(Self {
            config,
            network,
            nodes,
            local,
            stats,
            servers: Mutex::new(servers),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DlmConfig {
        &self.config
    }

    /// Returns the member hosts.
    pub fn hosts(&self) -> Vec<HostId> {
        self.nodes.keys().copied().collect()
    }

    /// Returns the lock manager of `host`.
    pub fn node(&self, host: HostId) -> DlmResult<LockManager> {
        self.nodes
            .get(&host)
            .cloned()
            .ok_or(DlmError::UnknownHost { host })
    }

    /// Returns the lock manager of the configured local host.
    pub fn local(&self) -> LockManager {
        self.local.clone()
    }

    /// Returns the network, for partition control.
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }

    /// Cuts `host` off from every other host. Traffic is held back until
    /// the host is reconnected.
    pub fn isolate_host(&self, host: HostId) {
        info!(%host, "isolating host");
        self.network.isolate_host(host);
    }

    /// Reconnects `host` and delivers the traffic held back.
    pub fn reconnect_host(&self, host: HostId) {
        info!(%host, "reconnecting host");
        self.network.heal_host(host);
    }

    /// Returns the transaction statistics of all hosts.
    pub fn stats(&self) -> &TransactionStats {
        &self.stats
    }

    /// Returns a snapshot of the lock table of `host`.
    pub async fn snapshot(&self, host: HostId) -> DlmResult<TableSnapshot> {
        if !self.nodes.contains_key(&host) {
            return Err(DlmError::UnknownHost { host });
        }
        let (reply, rx) = oneshot::channel();
        self.network
            .send_to_host(host, host, HostRequest::Snapshot { reply })?;
        rx.await
            .map_err(|_| DlmError::internal(format!("lock server {} stopped", host)))
    }

    /// Stops every lock server and waits for them to exit.
    pub async fn shutdown(self) {
        for &host in self.nodes.keys() {
            let _ = self.network.send_to_host(host, host, HostRequest::Shutdown);
        }
        let servers = std::mem::take(&mut *self.servers.lock());
        for server in servers {
            let _ = server.await;
        }
        info!("cluster stopped");
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("hosts", &self.hosts())
            .field("local", &self.config.local_host)
            .finish()
    }
}
