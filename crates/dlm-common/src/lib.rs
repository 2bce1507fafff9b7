//! # dlm-common
//!
//! Common types, errors, and configuration for the distributed lock manager.
//!
//! - **Types**: identifiers (`HostId`, `AgentId`, `ClientId`) and the
//!   hierarchical object identifier `Oid`
//! - **Errors**: unified error handling with `DlmError`
//! - **Config**: cluster configuration loaded from TOML
//!
//! ## Example
//!
//! ```rust
//! use dlm_common::types::{HostId, Oid};
//! use dlm_common::error::DlmResult;
//!
//! fn example() -> DlmResult<()> {
//!     let host = HostId::new(1);
//!     let oid = Oid::from_strs(&["db", "t1"])?;
//!     assert_eq!(oid.len(), 2);
//!     let _ = host;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use config::DlmConfig;
pub use error::{DlmError, DlmResult, ErrorCode};
pub use types::{AgentId, ClientId, HostId, Oid};
