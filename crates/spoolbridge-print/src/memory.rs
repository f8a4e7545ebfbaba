// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory spooler for dry runs and tests.
//
// Behaves like a local spooler: queues live in a map, mutations raise change
// events for subscribers, and generated driver files are read (consumed) at
// creation time.  Failure knobs let tests simulate an unreachable spooler or
// a rejected request.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use spoolbridge_core::error::{BridgeError, Result};
use spoolbridge_core::types::{LocalQueue, QueueDriver};

use crate::spooler::{
    EventSubscriptions, NotificationBatch, PrinterAttributes, QueueDefinition, SharedQueue,
    Spooler,
};

/// Driver as installed in a memory queue, with file contents captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstalledDriver {
    Descriptor(String),
    Script(String),
    Model(String),
}

/// One queue held by the memory spooler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryQueue {
    pub name: String,
    pub device_uri: String,
    pub info: String,
    pub location: String,
    pub owned_by_us: bool,
    pub shared: bool,
    pub driver: Option<InstalledDriver>,
}

#[derive(Debug, Default)]
struct MemoryState {
    /// Keyed by lower-cased name.
    queues: BTreeMap<String, MemoryQueue>,
    jobs: HashMap<String, usize>,
    default_queue: Option<String>,
    shared: Vec<SharedQueue>,
    capabilities: HashMap<String, PrinterAttributes>,
    unreachable: bool,
    /// Queue list requests still to fail; other calls keep working.
    list_failures: usize,
    reject_creates: bool,
    subscriptions_supported: bool,
    next_subscription: i32,
    /// Live subscriptions with the event count at creation time.
    live_subscriptions: Vec<(i32, i32)>,
    /// Sequence numbers of raised change events.
    events: Vec<i32>,
    creates: usize,
    deletes: usize,
}

/// A spooler that lives entirely in memory.
#[derive(Debug)]
pub struct MemorySpooler {
    state: Mutex<MemoryState>,
}

impl Default for MemorySpooler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySpooler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                subscriptions_supported: true,
                next_subscription: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reachable(state: &MemoryState) -> Result<()> {
        if state.unreachable {
            Err(BridgeError::SpoolerUnavailable("memory spooler offline".into()))
        } else {
            Ok(())
        }
    }

    fn list_allowed(state: &mut MemoryState) -> Result<()> {
        Self::reachable(state)?;
        if state.list_failures > 0 {
            state.list_failures -= 1;
            return Err(BridgeError::SpoolerUnavailable("memory spooler list timed out".into()));
        }
        Ok(())
    }

    fn raise_event(state: &mut MemoryState) {
        let next = state.events.last().copied().unwrap_or(0) + 1;
        state.events.push(next);
    }

    // -- knobs and inspection ----------------------------------------------

    /// Add a queue that some other tool created.
    pub fn add_foreign_queue(&self, name: &str, device_uri: &str) {
        self.insert_queue(name, device_uri, false);
    }

    /// Add a queue carrying our marker, as left behind by a previous run.
    pub fn add_owned_queue(&self, name: &str, device_uri: &str) {
        self.insert_queue(name, device_uri, true);
    }

    fn insert_queue(&self, name: &str, device_uri: &str, owned_by_us: bool) {
        let mut state = self.lock();
        state.queues.insert(
            name.to_ascii_lowercase(),
            MemoryQueue {
                name: name.to_owned(),
                device_uri: device_uri.to_owned(),
                info: String::new(),
                location: String::new(),
                owned_by_us,
                shared: false,
                driver: None,
            },
        );
        Self::raise_event(&mut state);
    }

    pub fn add_shared_queue(&self, queue: SharedQueue) {
        let mut state = self.lock();
        state.shared.push(queue);
        Self::raise_event(&mut state);
    }

    pub fn set_active_jobs(&self, name: &str, count: usize) {
        self.lock().jobs.insert(name.to_ascii_lowercase(), count);
    }

    pub fn set_default_queue(&self, name: Option<&str>) {
        self.lock().default_queue = name.map(str::to_owned);
    }

    pub fn set_capabilities(&self, uri: &str, attributes: PrinterAttributes) {
        self.lock().capabilities.insert(uri.to_owned(), attributes);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Fail the next `count` queue list requests while notifications keep
    /// flowing.
    pub fn fail_next_lists(&self, count: usize) {
        self.lock().list_failures = count;
    }

    pub fn set_reject_creates(&self, reject: bool) {
        self.lock().reject_creates = reject;
    }

    pub fn set_subscriptions_supported(&self, supported: bool) {
        self.lock().subscriptions_supported = supported;
    }

    /// Drop every live subscription, as a lease expiry would.
    pub fn expire_subscriptions(&self) {
        self.lock().live_subscriptions.clear();
    }

    pub fn queue(&self, name: &str) -> Option<MemoryQueue> {
        self.lock().queues.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.lock().queues.values().map(|q| q.name.clone()).collect()
    }

    /// Number of successful create-or-modify calls.
    pub fn create_count(&self) -> usize {
        self.lock().creates
    }

    /// Number of successful delete calls.
    pub fn delete_count(&self) -> usize {
        self.lock().deletes
    }
}

fn install(driver: &QueueDriver) -> Result<InstalledDriver> {
    let read = |path: &std::path::Path| {
        std::fs::read_to_string(path).map_err(|e| {
            BridgeError::SpoolerRequest(format!("cannot read {}: {e}", path.display()))
        })
    };
    Ok(match driver {
        QueueDriver::Descriptor(path) => InstalledDriver::Descriptor(read(path)?),
        QueueDriver::Script(path) => InstalledDriver::Script(read(path)?),
        QueueDriver::Model(model) => InstalledDriver::Model(model.clone()),
    })
}

#[async_trait]
impl EventSubscriptions for MemorySpooler {
    async fn create_subscription(&self, _lease: Duration) -> Result<i32> {
        let mut state = self.lock();
        Self::reachable(&state)?;
        if !state.subscriptions_supported {
            return Err(BridgeError::Subscription("subscriptions not supported".into()));
        }
        let id = state.next_subscription;
        state.next_subscription += 1;
        let start = state.events.last().copied().unwrap_or(0);
        state.live_subscriptions.push((id, start));
        Ok(id)
    }

    async fn get_notifications(
        &self,
        subscription_id: i32,
        first_sequence: i32,
    ) -> Result<NotificationBatch> {
        let state = self.lock();
        Self::reachable(&state)?;
        let Some(&(_, start)) = state
            .live_subscriptions
            .iter()
            .find(|(id, _)| *id == subscription_id)
        else {
            return Err(BridgeError::SubscriptionNotFound(subscription_id));
        };
        // Sequence numbers are per subscription and start at 1.
        let fresh: Vec<i32> = state
            .events
            .iter()
            .map(|seq| seq - start)
            .filter(|seq| *seq >= 1 && *seq >= first_sequence)
            .collect();
        Ok(NotificationBatch {
            events: fresh.len(),
            last_sequence: fresh.last().copied(),
        })
    }

    async fn cancel_subscription(&self, subscription_id: i32) -> Result<()> {
        let mut state = self.lock();
        Self::reachable(&state)?;
        state.live_subscriptions.retain(|(id, _)| *id != subscription_id);
        Ok(())
    }
}

#[async_trait]
impl Spooler for MemorySpooler {
    async fn list_queues(&self) -> Result<Vec<LocalQueue>> {
        let mut state = self.lock();
        Self::list_allowed(&mut state)?;
        Ok(state
            .queues
            .values()
            .map(|q| LocalQueue {
                name: q.name.clone(),
                device_uri: Some(q.device_uri.clone()),
                owned_by_us: q.owned_by_us,
            })
            .collect())
    }

    async fn list_shared_queues(&self) -> Result<Vec<SharedQueue>> {
        let mut state = self.lock();
        Self::list_allowed(&mut state)?;
        Ok(state.shared.clone())
    }

    async fn create_or_modify_queue(&self, definition: &QueueDefinition) -> Result<()> {
        let mut state = self.lock();
        Self::reachable(&state)?;
        if state.reject_creates {
            return Err(BridgeError::SpoolerRequest(format!(
                "CUPS-Add-Modify-Printer({}) rejected",
                definition.name
            )));
        }
        let key = definition.name.to_ascii_lowercase();
        let previous = state.queues.get(&key).and_then(|q| q.driver.clone());
        let driver = match &definition.driver {
            Some(driver) => Some(install(driver)?),
            None => previous,
        };
        info!(name = %definition.name, uri = %definition.device_uri, "memory spooler: queue created/modified");
        state.queues.insert(
            key,
            MemoryQueue {
                name: definition.name.clone(),
                device_uri: definition.device_uri.clone(),
                info: definition.info.clone(),
                location: definition.location.clone(),
                owned_by_us: true,
                shared: false,
                driver,
            },
        );
        state.creates += 1;
        Self::raise_event(&mut state);
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        Self::reachable(&state)?;
        if state.queues.remove(&name.to_ascii_lowercase()).is_none() {
            debug!(name, "memory spooler: queue already gone");
            return Ok(());
        }
        info!(name, "memory spooler: queue deleted");
        state.deletes += 1;
        Self::raise_event(&mut state);
        Ok(())
    }

    async fn active_jobs(&self, name: &str) -> Result<usize> {
        let state = self.lock();
        Self::reachable(&state)?;
        Ok(state.jobs.get(&name.to_ascii_lowercase()).copied().unwrap_or(0))
    }

    async fn default_queue(&self) -> Result<Option<String>> {
        let state = self.lock();
        Self::reachable(&state)?;
        Ok(state.default_queue.clone())
    }

    async fn printer_capabilities(&self, uri: &str) -> Result<PrinterAttributes> {
        let state = self.lock();
        state
            .capabilities
            .get(uri)
            .cloned()
            .ok_or_else(|| BridgeError::IppRequest(format!("Get-Printer-Attributes({uri}): no answer")))
    }
}
