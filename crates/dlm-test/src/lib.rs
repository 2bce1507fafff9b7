//! # dlm-test
//!
//! Integration tests for the distributed lock manager.
//!
//! This crate contains:
//! - Multi-host lock scenarios
//! - Deadlock detection and resolution scenarios
//! - Partition scenarios
//! - Randomized mutual exclusion checks

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Test utilities and helpers
pub mod utils;

/// Workload generators
pub mod workload;
