// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trait seams for everything the lifecycle engine asks of a spooler.
//
// The engine never talks IPP directly; it goes through `Spooler` (the local
// spooler) and `EventSubscriptions` (change notifications, shared with the
// BrowsePoll peers).  `IppSpooler` is the production implementation and
// `MemorySpooler` backs tests and dry runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use spoolbridge_core::error::Result;
use spoolbridge_core::types::{LocalQueue, QueueDriver};

/// Printer attributes flattened to attribute-name → display string.
/// Multi-valued attributes are joined with `", "`.
pub type PrinterAttributes = HashMap<String, String>;

/// Everything needed to create or modify one local queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub device_uri: String,
    /// `printer-info`: the discovery service name.
    pub info: String,
    /// `printer-location`: the remote host name.
    pub location: String,
    /// `None` creates a raw queue.
    pub driver: Option<QueueDriver>,
}

/// A local queue that may be advertised to other hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedQueue {
    pub printer_type: u32,
    pub state: u32,
    pub uri: String,
    pub location: String,
    pub info: String,
    pub make_model: String,
    pub auth_info_required: Option<String>,
    pub uuid: Option<String>,
    pub job_sheets: Option<(String, String)>,
    /// `*-default` values of string, keyword or name type, with the
    /// `-default` suffix stripped from the key.
    pub defaults: Vec<(String, String)>,
}

/// Result of one Get-Notifications call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationBatch {
    /// Number of printer events returned.
    pub events: usize,
    /// Highest sequence number seen in this batch.
    pub last_sequence: Option<i32>,
}

/// Pull-style printer event subscriptions.
#[async_trait]
pub trait EventSubscriptions: Send + Sync {
    /// Create a printer-event subscription with the given lease and return
    /// its id.
    async fn create_subscription(&self, lease: Duration) -> Result<i32>;

    /// Fetch events with a sequence number of at least `first_sequence`.
    /// An expired lease yields `BridgeError::SubscriptionNotFound`.
    async fn get_notifications(
        &self,
        subscription_id: i32,
        first_sequence: i32,
    ) -> Result<NotificationBatch>;

    async fn cancel_subscription(&self, subscription_id: i32) -> Result<()>;
}

/// The local spooler as seen by the lifecycle engine.
#[async_trait]
pub trait Spooler: EventSubscriptions {
    /// All local queues with their device URI and our marker.
    async fn list_queues(&self) -> Result<Vec<LocalQueue>>;

    /// Local queues with the metadata needed for advertisement.
    async fn list_shared_queues(&self) -> Result<Vec<SharedQueue>>;

    async fn create_or_modify_queue(&self, definition: &QueueDefinition) -> Result<()>;

    /// Delete a queue. Deleting a queue that does not exist succeeds.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Number of not-yet-completed jobs on the queue.
    async fn active_jobs(&self, name: &str) -> Result<usize>;

    /// Name of the system default queue, if any.
    async fn default_queue(&self) -> Result<Option<String>>;

    /// Get-Printer-Attributes against a remote printer.
    async fn printer_capabilities(&self, uri: &str) -> Result<PrinterAttributes>;
}
