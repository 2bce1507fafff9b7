//! # dlm-core
//!
//! Distributed lock manager engine.
//!
//! This crate serializes access to hierarchically named objects across a set
//! of cooperating hosts:
//!
//! - **Lock Tables**: one per host, owned by a single server task. Read and
//!   write locks on OIDs, where a lock conflicts with locks on its ancestors
//!   and descendants. FIFO queues with compatible batching.
//!
//! - **Transaction Agents**: one task per transaction. Issues requests to
//!   one or more hosts with an `all`/`any` requirement and owns every lock
//!   the transaction holds.
//!
//! - **Deadlock Detection**: edge chasing over the distributed wait-for
//!   relation. No global graph is ever built; a confirmed cycle is broken by
//!   its lowest agent, which surrenders the locks blocking its predecessor or
//!   aborts.
//!
//! - **Lifecycle**: `begin_transaction` / `end_transaction`, with ending
//!   releasing everything on every host.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Cluster                            │
//! │   ┌──────────────┐                      ┌──────────────┐     │
//! │   │ LockManager  │ begin_transaction    │ LockManager  │     │
//! │   │   (host 1)   │──────────┐           │   (host 2)   │     │
//! │   └──────────────┘          ▼           └──────────────┘     │
//! │                      ┌─────────────┐                         │
//! │                      │    Agent    │◀──── probes ────▶ Agent │
//! │                      └─────────────┘                         │
//! │                   requests │   ▲ notices                     │
//! │                            ▼   │                             │
//! │   ┌──────────────┐   ┌─────────────┐    ┌──────────────┐     │
//! │   │ LockServer 1 │◀─▶│MemoryNetwork│◀──▶│ LockServer 2 │     │
//! │   └──────────────┘   └─────────────┘    └──────────────┘     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use dlm_common::{ClientId, DlmConfig, HostId};
//! use dlm_core::{Cluster, LockSpec, TxnOptions};
//!
//! let cluster = Cluster::start(DlmConfig::with_hosts([1, 2]))?;
//! let manager = cluster.local();
//! let (txn, _) = manager
//!     .begin_transaction(ClientId::new(1), Vec::new(), TxnOptions::new())
//!     .await?;
//!
//! // Read [db,t1] on whichever host grants first.
//! let spec = LockSpec::parse("db/t1")?
//!     .read()
//!     .on_hosts([HostId::new(1), HostId::new(2)])
//!     .any();
//! let reply = txn.lock(spec).await?;
//! assert!(reply.is_ok());
//!
//! manager.end_transaction(&txn).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod deadlock;
pub mod lock;
pub mod manager;
pub mod rpc;
pub mod server;
pub mod transport;

pub use agent::{
    AgentHandle, AgentInfo, AgentStatus, Deadlock, LockReply, LockResult, LockSpec, LockStatus,
    Requirement, TxnOptions,
};
pub use deadlock::{Cycle, Probe, WaitTracker};
pub use lock::{LockMode, LockStats, LockTable, TableSnapshot};
pub use manager::{Cluster, LockManager, TransactionStats};
pub use transport::{MemoryNetwork, Transport, TransportError};
