//! Type definitions shared by every crate of the lock manager.

mod ids;
mod oid;

pub use ids::{AgentId, ClientId, HostId};
pub use oid::Oid;
