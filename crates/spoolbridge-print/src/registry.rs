// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The printer registry: every remote printer we represent (or may represent)
// as a local queue, with its lifecycle state.
//
// Entries are keyed by `EntryId`.  Iteration follows insertion order so that
// scheduler passes and name lookups are deterministic, and a case-insensitive
// name index makes collision and failover lookups cheap.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use spoolbridge_core::types::{
    Deadline, EntryId, PrinterStatus, QueueDriver, ServiceIdentity,
};

use crate::mirror::LocalMirror;

/// What kind of remote device an entry stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PrinterOrigin {
    /// A queue shared by a remote spooler. Provisioned raw.
    RemoteQueue,
    /// A printer speaking IPP directly. Provisioned driverless.
    NetworkPrinter {
        /// Sanitized, comma-separated page description languages.
        pdl: String,
        /// Sanitized make and model.
        make_model: String,
    },
}

/// One remote printer entry.
#[derive(Debug, Clone)]
pub struct RemotePrinter {
    pub id: EntryId,
    /// Local queue name.
    pub name: String,
    /// Device URI of the local queue.
    pub uri: String,
    pub origin: PrinterOrigin,
    /// Driver to hand to the spooler on the next provisioning. `None` means
    /// raw for remote queues and "not synthesized yet" for network printers.
    pub driver: Option<QueueDriver>,
    pub status: PrinterStatus,
    pub deadline: Deadline,
    /// Primary entry this one duplicates. Duplicates are never provisioned.
    pub duplicate_of: Option<EntryId>,
    /// Sanitized remote host name. Empty for entries reconstructed at startup.
    pub host: String,
    pub service: ServiceIdentity,
    pub last_seen: DateTime<Utc>,
}

impl RemotePrinter {
    /// A fresh entry scheduled for immediate creation.
    pub fn new(
        name: &str,
        uri: &str,
        host: &str,
        service: ServiceIdentity,
        origin: PrinterOrigin,
        now: Instant,
    ) -> Self {
        Self {
            id: EntryId::new(),
            name: name.to_owned(),
            uri: uri.to_owned(),
            origin,
            driver: None,
            status: PrinterStatus::PendingCreate,
            deadline: Deadline::At(now),
            duplicate_of: None,
            host: host.to_owned(),
            service,
            last_seen: Utc::now(),
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate_of.is_some()
    }

    pub fn set_state(&mut self, status: PrinterStatus, deadline: Deadline) {
        self.status = status;
        self.deadline = deadline;
    }
}

/// Serializable view of an entry for the status file.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub name: String,
    pub uri: String,
    pub status: PrinterStatus,
    pub duplicate_of: Option<EntryId>,
    pub host: String,
    pub service: ServiceIdentity,
    pub origin: PrinterOrigin,
    pub last_seen: DateTime<Utc>,
}

/// The authoritative set of remote printer entries.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<EntryId, RemotePrinter>,
    order: Vec<EntryId>,
    by_name: HashMap<String, Vec<EntryId>>,
}

fn name_key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an entry and return its id.
    pub fn insert(&mut self, entry: RemotePrinter) -> EntryId {
        let id = entry.id;
        self.by_name.entry(name_key(&entry.name)).or_default().push(id);
        self.order.push(id);
        self.entries.insert(id, entry);
        id
    }

    pub fn remove(&mut self, id: EntryId) -> Option<RemotePrinter> {
        let entry = self.entries.remove(&id)?;
        self.order.retain(|other| *other != id);
        let key = name_key(&entry.name);
        if let Some(ids) = self.by_name.get_mut(&key) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_name.remove(&key);
            }
        }
        Some(entry)
    }

    pub fn get(&self, id: EntryId) -> Option<&RemotePrinter> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut RemotePrinter> {
        self.entries.get_mut(&id)
    }

    /// Entry ids in insertion order. A snapshot, so callers may mutate the
    /// registry while walking it.
    pub fn ids(&self) -> Vec<EntryId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePrinter> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Entries sharing `name`, case-insensitively, in insertion order.
    pub fn named<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a RemotePrinter> + 'a {
        self.by_name
            .get(&name_key(name))
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }

    /// The entry an announcement for `name` from `host` should update: same
    /// name, and either a blank host, a fading status, or the same host.
    pub fn find_match(&self, name: &str, host: &str) -> Option<EntryId> {
        self.named(name)
            .find(|p| p.host.is_empty() || p.status.is_fading() || p.host.eq_ignore_ascii_case(host))
            .map(|p| p.id)
    }

    /// The entry created for the given discovery identity.
    pub fn find_by_service(&self, service: &ServiceIdentity) -> Option<EntryId> {
        self.iter().find(|p| p.service.matches(service)).map(|p| p.id)
    }

    /// A duplicate of `id` reachable from another host, for failover.
    pub fn failover_candidate(&self, id: EntryId) -> Option<EntryId> {
        let primary = self.entries.get(&id)?;
        self.named(&primary.name)
            .find(|q| {
                q.id != id && q.is_duplicate() && !q.host.eq_ignore_ascii_case(&primary.host)
            })
            .map(|q| q.id)
    }

    /// Make `primary` the primary for every entry currently pointing at
    /// `old` (and `old` itself).
    pub fn redirect_duplicates(&mut self, old: EntryId, primary: EntryId) {
        for entry in self.entries.values_mut() {
            if entry.id != primary && (entry.id == old || entry.duplicate_of == Some(old)) {
                entry.duplicate_of = Some(primary);
            }
        }
    }

    /// Point `primary` at `backup`'s printer: copy the backup's URI,
    /// identity and driver, schedule `primary` for immediate re-creation and
    /// `backup` for immediate removal. Returns false if either is missing.
    pub fn fail_over(&mut self, primary: EntryId, backup: EntryId, now: Instant) -> bool {
        let Some(source) = self.entries.get_mut(&backup) else {
            return false;
        };
        source.set_state(PrinterStatus::Disappeared, Deadline::At(now));
        let (uri, host, service, origin, driver) = (
            source.uri.clone(),
            source.host.clone(),
            source.service.clone(),
            source.origin.clone(),
            source.driver.clone(),
        );

        let Some(target) = self.entries.get_mut(&primary) else {
            return false;
        };
        target.uri = uri;
        target.host = host;
        target.service = service;
        target.origin = origin;
        target.driver = driver;
        target.set_state(PrinterStatus::PendingCreate, Deadline::At(now));
        true
    }

    /// The earliest pending deadline, or `None` when nothing is scheduled.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .map(|p| p.deadline)
            .min()
            .and_then(|d| d.instant())
    }

    /// Non-duplicate entries per name. Used to check the uniqueness
    /// invariant.
    pub fn primaries_named(&self, name: &str) -> usize {
        self.named(name).filter(|p| !p.is_duplicate()).count()
    }

    /// Take over the queues a previous run left in the spooler. Each
    /// becomes an `Unconfirmed` raw entry that is removed at `deadline`
    /// unless an announcement confirms it first.
    pub fn adopt_leftovers(&mut self, mirror: &LocalMirror, deadline: Deadline, now: Instant) -> usize {
        let mut adopted = 0;
        for queue in mirror.owned() {
            let Some(uri) = queue.device_uri.as_deref() else {
                continue;
            };
            if self.named(&queue.name).next().is_some() {
                continue;
            }
            let mut entry = RemotePrinter::new(
                &queue.name,
                uri,
                "",
                ServiceIdentity::default(),
                PrinterOrigin::RemoteQueue,
                now,
            );
            entry.set_state(PrinterStatus::Unconfirmed, deadline);
            debug!(name = %queue.name, uri, "adopted queue from a previous run");
            self.insert(entry);
            adopted += 1;
        }
        adopted
    }

    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        self.iter()
            .map(|p| EntrySnapshot {
                id: p.id,
                name: p.name.clone(),
                uri: p.uri.clone(),
                status: p.status,
                duplicate_of: p.duplicate_of,
                host: p.host.clone(),
                service: p.service.clone(),
                origin: p.origin.clone(),
                last_seen: p.last_seen,
            })
            .collect()
    }
}
