//! Lock manager error types.
//!
//! Deadlock outcomes are not errors: they are reported as values carrying
//! the Deadlocks list. The variants here cover request validation, calls
//! into agents that no longer exist, transport failures and configuration.

use std::fmt;
use thiserror::Error;

use crate::types::{AgentId, ClientId, HostId};

/// Error codes for categorizing errors.
///
/// These codes are stable and can be used for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // General errors (0x0000 - 0x00FF)
    /// Internal error (bug).
    Internal = 0x0001,
    /// Invalid argument provided.
    InvalidArgument = 0x0003,

    // Validation errors (0x0100 - 0x01FF)
    /// Object identifier has no tokens.
    EmptyOid = 0x0100,
    /// Lock request names no hosts.
    EmptyHostSet = 0x0101,
    /// Host is not a cluster member.
    UnknownHost = 0x0102,
    /// Option key not recognized.
    UnknownOption = 0x0103,
    /// Option value could not be parsed.
    InvalidOption = 0x0104,
    /// Caller is not the agent's registered client.
    NotClient = 0x0105,

    // Transaction errors (0x0300 - 0x03FF)
    /// Agent has ended or never existed.
    AgentGone = 0x0300,

    // Cluster errors (0x0500 - 0x05FF)
    /// Message could not be delivered.
    Transport = 0x0500,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Validation",
            0x03 => "Transaction",
            0x05 => "Cluster",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The main error type for the lock manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DlmError {
    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    /// An object identifier must contain at least one token.
    #[error("object identifier must not be empty")]
    EmptyOid,

    /// A lock request must target at least one host.
    #[error("lock request names no hosts")]
    EmptyHostSet,

    /// The host is not part of the cluster.
    #[error("host {host} is not a cluster member")]
    UnknownHost {
        /// The unknown host.
        host: HostId,
    },

    /// The option key is not recognized.
    #[error("unrecognized option: {key}")]
    UnknownOption {
        /// The offending key.
        key: String,
    },

    /// The option value could not be parsed.
    #[error("invalid value {value:?} for option {key}")]
    InvalidOption {
        /// The option key.
        key: String,
        /// The rejected value.
        value: String,
    },

    /// The caller is not the client registered with the agent.
    #[error("caller {caller} is not the client of agent {agent}")]
    NotClient {
        /// The agent being called.
        agent: AgentId,
        /// The rejected caller.
        caller: ClientId,
    },

    // ==========================================================================
    // Transaction Errors
    // ==========================================================================
    /// The agent has ended or never existed.
    #[error("transaction agent {agent} is gone")]
    AgentGone {
        /// The missing agent.
        agent: AgentId,
    },

    // ==========================================================================
    // Cluster Errors
    // ==========================================================================
    /// A message could not be delivered.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
    },

    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// Internal error - this indicates a bug.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl DlmError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyOid => ErrorCode::EmptyOid,
            Self::EmptyHostSet => ErrorCode::EmptyHostSet,
            Self::UnknownHost { .. } => ErrorCode::UnknownHost,
            Self::UnknownOption { .. } => ErrorCode::UnknownOption,
            Self::InvalidOption { .. } => ErrorCode::InvalidOption,
            Self::NotClient { .. } => ErrorCode::NotClient,
            Self::AgentGone { .. } => ErrorCode::AgentGone,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Internal { .. } => ErrorCode::Internal,
            Self::InvalidConfig { .. } => ErrorCode::InvalidArgument,
        }
    }

    /// Returns true if the request was rejected before reaching any host.
    ///
    /// Validation errors leave the transaction unaffected.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyOid
                | Self::EmptyHostSet
                | Self::UnknownHost { .. }
                | Self::UnknownOption { .. }
                | Self::InvalidOption { .. }
                | Self::NotClient { .. }
        )
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }
}
