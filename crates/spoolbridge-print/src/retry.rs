// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Error classification and retry scheduling for the reconciliation loop.
//
// Transport failures are retried on the entry's own deadline with a fixed
// interval. Protocol failures drop or degrade the event or peer, policy
// rejections are discarded silently, and resource failures abort the
// operation at hand.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use spoolbridge_core::error::BridgeError;
use spoolbridge_core::types::{Deadline, ErrorClass};
use tracing::{debug, warn};

/// Fixed-interval retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Deadline for the next attempt after a failure at `now`.
    pub fn retry_deadline(&self, now: Instant) -> Deadline {
        Deadline::after(now, self.interval)
    }

    /// Decide how to reschedule after `err`. Every class is retried on the
    /// entry's deadline: the queue must eventually converge, and only the
    /// log level differs.
    pub fn reschedule(&self, err: &BridgeError, now: Instant) -> Deadline {
        let class = classify_error(err);
        match class {
            ErrorClass::Transport => {
                debug!(error = %err, retry_secs = self.interval.as_secs(), "transport failure, retrying")
            }
            _ => warn!(error = %err, ?class, retry_secs = self.interval.as_secs(), "operation failed, retrying"),
        }
        self.retry_deadline(now)
    }
}

/// Classify a `BridgeError` into an `ErrorClass`.
pub fn classify_error(err: &BridgeError) -> ErrorClass {
    match err {
        BridgeError::SpoolerUnavailable(_) => ErrorClass::Transport,
        BridgeError::IppRequest(detail) => classify_ipp_detail(detail),
        BridgeError::Discovery(_) => ErrorClass::Transport,

        BridgeError::SpoolerRequest(_) => ErrorClass::Protocol,
        BridgeError::BrowsePacket(_) => ErrorClass::Protocol,
        BridgeError::SubscriptionNotFound(_) => ErrorClass::Protocol,
        BridgeError::Subscription(_) => ErrorClass::Protocol,
        BridgeError::Serialization(_) => ErrorClass::Protocol,

        BridgeError::Config { .. } => ErrorClass::Policy,

        BridgeError::Provisioning(_) => ErrorClass::Resource,
        BridgeError::DescriptorUnavailable(_) => ErrorClass::Resource,
        BridgeError::Interfaces(_) => ErrorClass::Resource,

        BridgeError::Io(io_err) => match io_err.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted => ErrorClass::Transport,
            _ => ErrorClass::Resource,
        },
    }
}

/// IPP client errors carry the transport message or the status keyword.
fn classify_ipp_detail(detail: &str) -> ErrorClass {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("client-error") {
        ErrorClass::Protocol
    } else {
        ErrorClass::Transport
    }
}
