//! Core identifier types for the lock manager.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing a host id from being passed where a client id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Host identifier - names one participating host and its lock table.
///
/// # Example
///
/// ```rust
/// use dlm_common::types::HostId;
///
/// let host = HostId::new(2);
/// assert_eq!(host.as_u64(), 2);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct HostId(u64);

impl HostId {
    /// Creates a new `HostId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", self.0)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

impl From<u64> for HostId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<HostId> for u64 {
    #[inline]
    fn from(id: HostId) -> Self {
        id.0
    }
}

/// Transaction agent identifier.
///
/// An agent id is the pair (home host, local sequence). The derived ordering
/// compares the host first and the sequence second, which gives every
/// participant the same total order without coordination. Deadlock victim
/// selection relies on this.
///
/// # Example
///
/// ```rust
/// use dlm_common::types::{AgentId, HostId};
///
/// let a = AgentId::new(HostId::new(1), 7);
/// let b = AgentId::new(HostId::new(2), 1);
/// assert!(a < b);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId {
    host: HostId,
    seq: u64,
}

impl AgentId {
    /// Creates an agent id.
    #[inline]
    #[must_use]
    pub const fn new(host: HostId, seq: u64) -> Self {
        Self { host, seq }
    }

    /// Returns the host the agent lives on.
    #[inline]
    #[must_use]
    pub const fn host(self) -> HostId {
        self.host
    }

    /// Returns the host-local sequence number.
    #[inline]
    #[must_use]
    pub const fn seq(self) -> u64 {
        self.seq
    }
}

impl fmt::Debug for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgentId({}.{})", self.host.0, self.seq)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a{}.{}", self.host.0, self.seq)
    }
}

/// Client identity - the caller a transaction agent accepts requests from.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct ClientId(u64);

impl ClientId {
    /// Creates a new `ClientId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ClientId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}
