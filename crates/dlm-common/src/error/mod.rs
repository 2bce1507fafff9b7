//! Error handling for the lock manager.
//!
//! This module provides the unified error type and result alias used
//! across all crates of the workspace.

mod lock;

pub use lock::{DlmError, ErrorCode};

/// Result type alias for lock manager operations.
pub type DlmResult<T> = std::result::Result<T, DlmError>;
