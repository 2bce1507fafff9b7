//! Communication substrate between hosts and agents.
//!
//! Lock servers and transaction agents never share state. Everything they
//! exchange goes through a [`Transport`], which routes a message to a host's
//! lock server or to an agent's inbox.
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Host 1    │────▶│  Transport  │────▶│   Host 2    │
//! │             │◀────│   routing   │◀────│             │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! Messages from one sender host to one destination are delivered in order.
//! `MemoryNetwork` is the in-process implementation used by the cluster and
//! in tests.

mod memory;

pub use memory::MemoryNetwork;

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use dlm_common::error::DlmError;
use dlm_common::types::{AgentId, HostId};

use crate::rpc::{AgentMsg, HostRequest};

/// Errors that can occur in transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No lock server is registered for the host.
    #[error("unknown host: {0}")]
    UnknownHost(HostId),

    /// No inbox is registered for the agent, usually because it ended.
    #[error("unknown agent: {0}")]
    UnknownAgent(AgentId),

    /// The receiving task has stopped.
    #[error("channel closed to {0}")]
    Closed(String),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

impl From<TransportError> for DlmError {
    fn from(err: TransportError) -> Self {
        DlmError::transport(err.to_string())
    }
}

/// Trait for message routing implementations.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends a request from `from` to the lock server of `to`.
    fn send_to_host(&self, from: HostId, to: HostId, request: HostRequest)
        -> TransportResult<()>;

    /// Sends a message from `from` to the inbox of agent `to`.
    fn send_to_agent(&self, from: HostId, to: AgentId, message: AgentMsg) -> TransportResult<()>;

    /// Returns true if `host` is a member.
    fn has_host(&self, host: HostId) -> bool;

    /// Returns the member hosts, sorted.
    fn hosts(&self) -> Vec<HostId>;

    /// Registers the inbox of a lock server.
    fn register_host(&self, host: HostId, inbox: mpsc::UnboundedSender<HostRequest>);

    /// Registers the inbox of an agent.
    fn register_agent(&self, agent: AgentId, inbox: mpsc::UnboundedSender<AgentMsg>);

    /// Removes the inbox of an agent. Later messages to it fail with
    /// [`TransportError::UnknownAgent`].
    fn unregister_agent(&self, agent: AgentId);
}
