//! Messages exchanged between lock tables and transaction agents.
//!
//! ```text
//!  ┌─────────┐      HostRequest       ┌────────────┐
//!  │  Agent  │───────────────────────▶│ LockServer │
//!  │         │◀───────────────────────│ (per host) │
//!  └─────────┘    AgentMsg::Notice    └────────────┘
//!     │  ▲
//!     │  │ AgentMsg::Peer (Probe / Resolve)
//!     ▼  │
//!  ┌─────────┐
//!  │  Agent  │
//!  └─────────┘
//! ```

use tokio::sync::oneshot;

use dlm_common::types::{AgentId, HostId, Oid};

use crate::agent::Command;
use crate::deadlock::{Cycle, Probe};
use crate::lock::{LockMode, Notice, ReqId, TableSnapshot};

/// A request to the lock table of one host.
#[derive(Debug)]
pub enum HostRequest {
    /// Request a lock.
    Lock {
        /// Requesting agent.
        agent: AgentId,
        /// Request id, echoed in the answer.
        req: ReqId,
        /// Object to lock.
        oid: Oid,
        /// Requested mode.
        mode: LockMode,
    },
    /// Withdraw a request, releasing it if it was already granted.
    Cancel {
        /// Requesting agent.
        agent: AgentId,
        /// The request to withdraw.
        req: ReqId,
        /// Requested object.
        oid: Oid,
    },
    /// Drop every hold and request of an agent.
    ReleaseAll {
        /// The agent.
        agent: AgentId,
    },
    /// Give up locks of `victim` that block `waiter` on `waiter_oid`.
    Surrender {
        /// The deadlock victim.
        victim: AgentId,
        /// The agent the victim blocks.
        waiter: AgentId,
        /// The object `waiter` is queued on.
        waiter_oid: Oid,
    },
    /// Return a snapshot of the table.
    Snapshot {
        /// Reply channel.
        reply: oneshot::Sender<TableSnapshot>,
    },
    /// Stop the server task.
    Shutdown,
}

impl HostRequest {
    /// Returns a short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            HostRequest::Lock { .. } => "lock",
            HostRequest::Cancel { .. } => "cancel",
            HostRequest::ReleaseAll { .. } => "release_all",
            HostRequest::Surrender { .. } => "surrender",
            HostRequest::Snapshot { .. } => "snapshot",
            HostRequest::Shutdown => "shutdown",
        }
    }
}

/// A message between transaction agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// A deadlock detection probe.
    Probe(Probe),
    /// A confirmed cycle, sent to its victim.
    Resolve(Cycle),
}

/// Anything delivered to an agent's inbox.
#[derive(Debug)]
pub enum AgentMsg {
    /// A call from the client holding the agent handle.
    Command(Command),
    /// A notice from the lock table of `host`.
    Notice {
        /// The sending host.
        host: HostId,
        /// The notice.
        notice: Notice,
    },
    /// A message from another agent.
    Peer {
        /// The sending agent.
        from: AgentId,
        /// The message.
        msg: PeerMessage,
    },
}
