// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Change-notification tracking shared by the local spooler mirror and the
// BrowsePoll peers.
//
// The only question ever asked is "should the printer list be fetched
// again?".  A subscription that cannot be created, or that fails with
// anything other than an expired lease, degrades the source to fetching
// every time.

use std::time::Duration;

use tracing::{debug, warn};

use spoolbridge_core::error::BridgeError;

use crate::spooler::EventSubscriptions;

/// Subscription bookkeeping for one notification source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    /// Active subscription, if any.
    pub id: Option<i32>,
    /// Last notification sequence number consumed.
    pub sequence: i32,
    /// Cleared permanently once the source misbehaves.
    pub can_subscribe: bool,
}

impl Default for SubscriptionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionState {
    pub fn new() -> Self {
        Self {
            id: None,
            sequence: 0,
            can_subscribe: true,
        }
    }

    /// Decide whether the source's printer list must be re-fetched.
    pub async fn has_changes<E>(&mut self, source: &E, lease: Duration, label: &str) -> bool
    where
        E: EventSubscriptions + ?Sized,
    {
        if !self.can_subscribe {
            return true;
        }

        let Some(id) = self.id else {
            // First run: subscribe, then fetch everything once.
            self.subscribe(source, lease, label).await;
            return true;
        };

        match source.get_notifications(id, self.sequence + 1).await {
            Ok(batch) if batch.events > 0 => {
                debug!(source = label, events = batch.events, "printer events");
                if let Some(last) = batch.last_sequence {
                    self.sequence = last;
                }
                true
            }
            Ok(_) => {
                debug!(source = label, "no events");
                false
            }
            Err(BridgeError::SubscriptionNotFound(_)) => {
                debug!(source = label, "subscription lease expired, renewing");
                self.id = None;
                self.subscribe(source, lease, label).await;
                true
            }
            Err(e) => {
                warn!(source = label, error = %e, "notifications failed, falling back to polling");
                self.can_subscribe = false;
                if let Err(e) = source.cancel_subscription(id).await {
                    debug!(source = label, error = %e, "cancel after failure also failed");
                }
                self.id = None;
                self.sequence = 0;
                true
            }
        }
    }

    async fn subscribe<E>(&mut self, source: &E, lease: Duration, label: &str)
    where
        E: EventSubscriptions + ?Sized,
    {
        match source.create_subscription(lease).await {
            Ok(id) => {
                debug!(source = label, subscription_id = id, "subscribed to printer events");
                self.id = Some(id);
            }
            Err(e) => {
                warn!(source = label, error = %e, "cannot subscribe, falling back to polling");
                self.id = None;
                self.can_subscribe = false;
            }
        }
    }

    /// Cancel the subscription, if any. Failures are logged only.
    pub async fn cancel<E>(&mut self, source: &E, label: &str)
    where
        E: EventSubscriptions + ?Sized,
    {
        if let Some(id) = self.id.take() {
            match source.cancel_subscription(id).await {
                Ok(()) => debug!(source = label, subscription_id = id, "subscription cancelled"),
                Err(e) => warn!(source = label, error = %e, "cancelling subscription failed"),
            }
        }
    }
}
