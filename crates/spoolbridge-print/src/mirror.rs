// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Snapshot of the queues already present in the local spooler.
//
// The resolver consults it to learn which names and device URIs are taken
// and which queues a previous run of the daemon left behind.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use spoolbridge_core::error::Result;
use spoolbridge_core::types::LocalQueue;

use crate::spooler::Spooler;
use crate::subscription::SubscriptionState;

const LABEL: &str = "local spooler";

/// Name-indexed copy of the local spooler's queue list.
#[derive(Debug, Default)]
pub struct LocalMirror {
    /// Keyed by lower-cased queue name.
    queues: HashMap<String, LocalQueue>,
    subscription: SubscriptionState,
    /// Set by a successful fetch, cleared whenever the spooler reports
    /// changes that have not been fetched yet.
    fresh: bool,
}

impl LocalMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mirror holding exactly `queues`.
    pub fn from_queues(queues: Vec<LocalQueue>) -> Self {
        let mut mirror = Self::new();
        mirror.replace(queues);
        mirror
    }

    fn replace(&mut self, queues: Vec<LocalQueue>) {
        self.queues = queues
            .into_iter()
            .map(|q| (q.name.to_ascii_lowercase(), q))
            .collect();
        self.fresh = true;
    }

    pub fn by_name(&self, name: &str) -> Option<&LocalQueue> {
        self.queues.get(&name.to_ascii_lowercase())
    }

    pub fn by_uri(&self, uri: &str) -> Option<&LocalQueue> {
        self.queues
            .values()
            .find(|q| q.device_uri.as_deref().is_some_and(|u| u.eq_ignore_ascii_case(uri)))
    }

    /// Queues carrying our marker.
    pub fn owned(&self) -> impl Iterator<Item = &LocalQueue> {
        self.queues.values().filter(|q| q.owned_by_us)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Bring the snapshot up to date. Uses the change subscription when the
    /// spooler supports it, so an unchanged spooler costs one small request.
    /// Returns whether the queue list was re-fetched.
    pub async fn refresh<S>(&mut self, spooler: &S, lease: Duration) -> Result<bool>
    where
        S: Spooler + ?Sized,
    {
        if self.subscription.has_changes(spooler, lease, LABEL).await {
            // The events are consumed now; a failed fetch must not lose them.
            self.fresh = false;
        }
        if self.fresh {
            return Ok(false);
        }
        let queues = spooler.list_queues().await?;
        debug!(count = queues.len(), "local queue list refreshed");
        self.replace(queues);
        Ok(true)
    }

    /// Cancel the change subscription.
    pub async fn close<S>(&mut self, spooler: &S)
    where
        S: Spooler + ?Sized,
    {
        self.subscription.cancel(spooler, LABEL).await;
    }
}
