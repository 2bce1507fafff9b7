//! Configuration for the lock manager.
//!
//! This module provides the cluster configuration structure used to start
//! lock tables and transaction managers.

mod cluster;

pub use cluster::{DlmConfig, DlmConfigBuilder, LockTableConfig, TxnDefaults};
