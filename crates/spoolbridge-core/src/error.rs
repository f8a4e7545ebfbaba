// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Unified error types for Spoolbridge.

use thiserror::Error;

/// Top-level error type for all Spoolbridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    // -- Local spooler --
    #[error("spooler unreachable: {0}")]
    SpoolerUnavailable(String),

    #[error("spooler rejected request: {0}")]
    SpoolerRequest(String),

    #[error("IPP request failed: {0}")]
    IppRequest(String),

    // -- Discovery --
    #[error("printer discovery failed: {0}")]
    Discovery(String),

    #[error("malformed browse packet: {0}")]
    BrowsePacket(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(i32),

    #[error("subscription error: {0}")]
    Subscription(String),

    // -- Provisioning --
    #[error("queue provisioning failed: {0}")]
    Provisioning(String),

    #[error("driver descriptor unavailable: {0}")]
    DescriptorUnavailable(String),

    // -- Host resources --
    #[error("network interface enumeration failed: {0}")]
    Interfaces(String),

    // -- Configuration --
    #[error("invalid value '{value}' for {directive}: {reason}")]
    Config {
        directive: String,
        value: String,
        reason: String,
    },

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Shorthand for a configuration error.
    pub fn config(directive: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            directive: directive.to_owned(),
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, BridgeError>;
