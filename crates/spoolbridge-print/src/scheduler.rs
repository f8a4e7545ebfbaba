// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Reconciliation scheduler.
//
// One pass walks the registry in insertion order and applies the entry
// state machine against the local spooler: expire unconfirmed entries,
// remove disappeared queues (unless busy or the system default), provision
// pending ones, and leave confirmed ones alone. The caller arms a single
// timer for `Registry::next_deadline()` afterwards.

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use spoolbridge_core::error::Result;
use spoolbridge_core::types::{Deadline, EntryId, PrinterStatus};

use crate::provisioner::{Provisioner, release_driver};
use crate::registry::Registry;
use crate::retry::RetryPolicy;
use crate::spooler::Spooler;

/// What one pass did, by queue name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Queues created or modified.
    pub provisioned: Vec<String>,
    /// Entries destroyed (their local queue deleted unless a duplicate).
    pub removed: Vec<String>,
    /// Entries whose action failed or was deferred.
    pub retried: Vec<String>,
    /// Entries whose lease ran out while a live duplicate could take over.
    pub failed_over: Vec<String>,
}

impl PassReport {
    /// Whether this pass removed the last entry.
    pub fn emptied(&self, registry: &Registry) -> bool {
        !self.removed.is_empty() && registry.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.provisioned.is_empty()
            && self.removed.is_empty()
            && self.retried.is_empty()
            && self.failed_over.is_empty()
    }
}

/// Why a queue removal did not happen.
enum Removal {
    Done,
    Busy(usize),
    SystemDefault,
}

pub struct Scheduler {
    provisioner: Provisioner,
    retry: RetryPolicy,
    browse_timeout: Duration,
}

impl Scheduler {
    pub fn new(provisioner: Provisioner, retry: RetryPolicy, browse_timeout: Duration) -> Self {
        Self {
            provisioner,
            retry,
            browse_timeout,
        }
    }

    /// Apply every due transition.
    #[instrument(skip_all, fields(entries = registry.len()))]
    pub async fn run_pass<S>(&self, registry: &mut Registry, spooler: &S, now: Instant) -> PassReport
    where
        S: Spooler + ?Sized,
    {
        let mut report = PassReport::default();

        for id in registry.ids() {
            let backup = live_backup(registry, id);
            let Some(entry) = registry.get_mut(id) else {
                continue;
            };

            if entry.status == PrinterStatus::Unconfirmed && entry.deadline.is_due(now) {
                debug!(name = %entry.name, "not announced again, removing entry from previous session");
                entry.set_state(PrinterStatus::Disappeared, Deadline::At(now));
            }

            let status = entry.status;
            match status {
                PrinterStatus::Disappeared if entry.deadline.is_due(now) => {
                    if entry.is_duplicate() {
                        debug!(name = %entry.name, host = %entry.host, "removing duplicate entry");
                        report.removed.push(entry.name.clone());
                        discard(registry, id);
                        continue;
                    }
                    if let Some(backup_id) = backup {
                        // The backup brings its own driver, if any.
                        release_driver(entry);
                        let name = entry.name.clone();
                        registry.fail_over(id, backup_id, now);
                        info!(name = %name, "printer expired, switching to backup host");
                        report.failed_over.push(name);
                        continue;
                    }

                    let name = entry.name.clone();
                    match self.try_remove(&name, spooler).await {
                        Ok(Removal::Done) => {
                            info!(name = %name, "local queue removed");
                            discard(registry, id);
                            report.removed.push(name);
                        }
                        Ok(Removal::Busy(jobs)) => {
                            debug!(name = %name, jobs, "queue still has active jobs, removal deferred");
                            defer(registry, id, self.retry.retry_deadline(now));
                            report.retried.push(name);
                        }
                        Ok(Removal::SystemDefault) => {
                            debug!(name = %name, "queue is the system default, removal deferred");
                            defer(registry, id, self.retry.retry_deadline(now));
                            report.retried.push(name);
                        }
                        Err(e) => {
                            defer(registry, id, self.retry.reschedule(&e, now));
                            report.retried.push(name);
                        }
                    }
                }
                _ if status.is_pending_create() => {
                    if entry.is_duplicate() {
                        entry.deadline = Deadline::Never;
                        continue;
                    }
                    if !entry.deadline.is_due(now) {
                        continue;
                    }

                    match self.provisioner.provision(entry, spooler).await {
                        Ok(()) => {
                            if status == PrinterStatus::PendingCreateFromBroadcast {
                                debug!(name = %entry.name, secs = self.browse_timeout.as_secs(), "starting browse lease");
                                entry.set_state(
                                    PrinterStatus::Disappeared,
                                    Deadline::after(now, self.browse_timeout),
                                );
                            } else {
                                entry.set_state(PrinterStatus::Confirmed, Deadline::Never);
                            }
                            report.provisioned.push(entry.name.clone());
                        }
                        Err(e) => {
                            entry.deadline = self.retry.reschedule(&e, now);
                            report.retried.push(entry.name.clone());
                        }
                    }
                }
                _ => {}
            }
        }

        match registry.next_deadline() {
            Some(at) => debug!(in_secs = at.saturating_duration_since(now).as_secs(), "checking queues again"),
            None => debug!("listening"),
        }
        report
    }

    /// Force every entry out and run one last pass. Entries whose queue
    /// could not be removed are logged and left behind.
    #[instrument(skip_all)]
    pub async fn shutdown_pass<S>(&self, registry: &mut Registry, spooler: &S, now: Instant) -> PassReport
    where
        S: Spooler + ?Sized,
    {
        for id in registry.ids() {
            if let Some(entry) = registry.get_mut(id) {
                entry.set_state(PrinterStatus::Disappeared, Deadline::At(now));
            }
        }
        let report = self.run_pass(registry, spooler, now).await;
        for entry in registry.iter() {
            warn!(name = %entry.name, "local queue kept at shutdown");
        }
        report
    }

    async fn try_remove<S>(&self, name: &str, spooler: &S) -> Result<Removal>
    where
        S: Spooler + ?Sized,
    {
        let jobs = spooler.active_jobs(name).await?;
        if jobs > 0 {
            return Ok(Removal::Busy(jobs));
        }
        // Keep the user's default-printer choice.
        match spooler.default_queue().await {
            Ok(Some(default)) if default.eq_ignore_ascii_case(name) => {
                return Ok(Removal::SystemDefault);
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "cannot determine the system default printer"),
        }
        spooler.delete_queue(name).await?;
        Ok(Removal::Done)
    }
}

/// Drop an entry along with any driver files still kept for a retry.
fn discard(registry: &mut Registry, id: EntryId) {
    if let Some(mut entry) = registry.remove(id) {
        release_driver(&mut entry);
    }
}

fn defer(registry: &mut Registry, id: EntryId, deadline: Deadline) {
    if let Some(entry) = registry.get_mut(id) {
        entry.deadline = deadline;
    }
}

/// A duplicate of `id` on another host that is still being announced.
fn live_backup(registry: &Registry, id: EntryId) -> Option<EntryId> {
    registry
        .failover_candidate(id)
        .filter(|backup| registry.get(*backup).is_some_and(|q| !q.status.is_fading()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use spoolbridge_core::types::{
        Announcement, CapabilityHints, DiscoverySource, QueueSighting, ServiceIdentity,
    };

    use crate::memory::{InstalledDriver, MemorySpooler};
    use crate::mirror::LocalMirror;
    use crate::registry::{PrinterOrigin, RemotePrinter};
    use crate::resolver::{Resolver, ResolverPolicy};

    const TIMEOUT: Duration = Duration::from_secs(300);
    const RETRY: Duration = Duration::from_secs(10);

    fn scheduler(script_dir: &std::path::Path) -> Scheduler {
        Scheduler::new(
            Provisioner::new("/usr/lib/cups/filter").with_script_dir(script_dir),
            RetryPolicy::new(RETRY),
            TIMEOUT,
        )
    }

    fn resolver() -> Resolver {
        Resolver::new(ResolverPolicy {
            create_ipp_printer_queues: true,
            browse_timeout: TIMEOUT,
            withdraw_grace: Duration::ZERO,
        })
    }

    fn remote(name: &str, host: &str, now: Instant) -> RemotePrinter {
        RemotePrinter::new(
            name,
            &format!("ipp://{host}:631/printers/{name}"),
            host,
            ServiceIdentity::new(name, "_ipp._tcp", "local"),
            PrinterOrigin::RemoteQueue,
            now,
        )
    }

    #[tokio::test]
    async fn pending_entry_is_provisioned_and_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let now = Instant::now();
        let id = registry.insert(remote("Office", "alpha", now));

        let report = scheduler(dir.path()).run_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.provisioned, vec!["Office".to_string()]);
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.status, PrinterStatus::Confirmed);
        assert_eq!(entry.deadline, Deadline::Never);
        assert!(spooler.queue("Office").unwrap().owned_by_us);
        assert_eq!(registry.next_deadline(), None);
    }

    #[tokio::test]
    async fn driverless_scenario_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let now = Instant::now();
        let announcement = Announcement {
            source: DiscoverySource::Dnssd,
            host: "192.0.2.5".into(),
            port: 631,
            resource_path: "ipp/print".into(),
            service: ServiceIdentity::new("Acme Jet", "_ipp._tcp", "local"),
            hints: Some(CapabilityHints {
                pdl: Some("application/pdf".into()),
                ..Default::default()
            }),
        };
        let id = resolver()
            .announce(&mut registry, &LocalMirror::new(), &announcement, now)
            .entry_id()
            .unwrap();
        assert_eq!(registry.get(id).unwrap().status, PrinterStatus::PendingCreate);

        scheduler(dir.path()).run_pass(&mut registry, &spooler, now).await;
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.status, PrinterStatus::Confirmed);
        let queue = spooler.queue("printer").unwrap();
        assert_eq!(queue.device_uri, "ipp://192.0.2.5:631/ipp/print");
        assert!(matches!(queue.driver, Some(InstalledDriver::Script(ref s)) if s.contains("output-format=application/pdf")));
    }

    #[tokio::test]
    async fn broadcast_lease_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        let sighting = QueueSighting {
            source: DiscoverySource::LegacyBroadcast,
            uri: "ipp://192.0.2.9:631/printers/Office2".into(),
            info: "Office2".into(),
        };
        let id = resolver()
            .sighting(&mut registry, &LocalMirror::new(), &sighting, &[], now)
            .entry_id()
            .unwrap();
        assert_eq!(registry.get(id).unwrap().status, PrinterStatus::PendingCreateFromBroadcast);

        sched.run_pass(&mut registry, &spooler, now).await;
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.status, PrinterStatus::Disappeared);
        assert_eq!(entry.deadline, Deadline::after(now, TIMEOUT));
        assert!(spooler.queue("Office2").is_some());

        // Nothing happens before the lease runs out.
        sched.run_pass(&mut registry, &spooler, now + Duration::from_secs(299)).await;
        assert!(registry.get(id).is_some());

        let report = sched.run_pass(&mut registry, &spooler, now + TIMEOUT).await;
        assert_eq!(report.removed, vec!["Office2".to_string()]);
        assert!(registry.is_empty());
        assert!(report.emptied(&registry));
        assert!(spooler.queue("Office2").is_none());
    }

    #[tokio::test]
    async fn active_jobs_defer_removal() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        let id = registry.insert(remote("Office", "alpha", now));
        sched.run_pass(&mut registry, &spooler, now).await;

        spooler.set_active_jobs("Office", 2);
        registry.get_mut(id).unwrap().set_state(PrinterStatus::Disappeared, Deadline::At(now));
        let report = sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.retried, vec!["Office".to_string()]);
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.status, PrinterStatus::Disappeared);
        assert_eq!(entry.deadline, Deadline::after(now, RETRY));
        assert!(spooler.queue("Office").is_some());

        spooler.set_active_jobs("Office", 0);
        sched.run_pass(&mut registry, &spooler, now + RETRY).await;
        assert!(registry.get(id).is_none());
        assert!(spooler.queue("Office").is_none());
    }

    #[tokio::test]
    async fn system_default_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        let id = registry.insert(remote("Office", "alpha", now));
        sched.run_pass(&mut registry, &spooler, now).await;

        spooler.set_default_queue(Some("office"));
        registry.get_mut(id).unwrap().set_state(PrinterStatus::Disappeared, Deadline::At(now));
        sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(registry.get(id).unwrap().deadline, Deadline::after(now, RETRY));
        assert!(spooler.queue("Office").is_some());
    }

    #[tokio::test]
    async fn unreachable_spooler_retries_creation() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        spooler.set_unreachable(true);
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        let id = registry.insert(remote("Office", "alpha", now));

        let report = sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.retried.len(), 1);
        let entry = registry.get(id).unwrap();
        assert_eq!(entry.status, PrinterStatus::PendingCreate);
        assert_eq!(entry.deadline, Deadline::after(now, RETRY));

        spooler.set_unreachable(false);
        sched.run_pass(&mut registry, &spooler, now + RETRY).await;
        assert_eq!(registry.get(id).unwrap().status, PrinterStatus::Confirmed);
    }

    #[tokio::test]
    async fn duplicates_are_never_provisioned_and_leave_without_spooler_calls() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        let a = registry.insert(remote("Office", "alpha", now));
        let mut dup = remote("Office", "beta", now);
        dup.duplicate_of = Some(a);
        let b = registry.insert(dup);

        sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(spooler.create_count(), 1);
        assert_eq!(registry.get(b).unwrap().deadline, Deadline::Never);
        assert_eq!(spooler.queue("Office").unwrap().device_uri, "ipp://alpha:631/printers/Office");

        registry.get_mut(b).unwrap().set_state(PrinterStatus::Disappeared, Deadline::At(now));
        sched.run_pass(&mut registry, &spooler, now).await;
        assert!(registry.get(b).is_none());
        assert_eq!(spooler.delete_count(), 0);
        assert!(spooler.queue("Office").is_some());
    }

    #[tokio::test]
    async fn unconfirmed_entry_expires_in_the_same_pass() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        spooler.add_owned_queue("Old", "ipp://gone:631/printers/Old");
        let mut registry = Registry::new();
        let now = Instant::now();
        let mut old = remote("Old", "", now);
        old.set_state(PrinterStatus::Unconfirmed, Deadline::At(now));
        registry.insert(old);

        let report = scheduler(dir.path()).run_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.removed, vec!["Old".to_string()]);
        assert!(spooler.queue("Old").is_none());
    }

    #[tokio::test]
    async fn expiring_primary_fails_over_to_a_live_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        let a = registry.insert(remote("Office", "alpha", now));
        let mut dup = remote("Office", "beta", now);
        dup.duplicate_of = Some(a);
        dup.set_state(PrinterStatus::Confirmed, Deadline::Never);
        let b = registry.insert(dup);
        sched.run_pass(&mut registry, &spooler, now).await;

        registry.get_mut(a).unwrap().set_state(PrinterStatus::Disappeared, Deadline::At(now));
        let report = sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.failed_over, vec!["Office".to_string()]);
        // The backup entry went in the same pass; its queue never existed.
        assert!(registry.get(b).is_none());
        assert_eq!(spooler.delete_count(), 0);
        assert_eq!(registry.get(a).unwrap().status, PrinterStatus::PendingCreate);

        sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(spooler.queue("Office").unwrap().device_uri, "ipp://beta:631/printers/Office");
        assert_eq!(registry.get(a).unwrap().status, PrinterStatus::Confirmed);
        assert_eq!(registry.primaries_named("Office"), 1);
    }

    #[tokio::test]
    async fn shutdown_removes_every_created_queue() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        registry.insert(remote("Office", "alpha", now));
        registry.insert(remote("Lab", "beta", now));
        let a = registry.ids()[0];
        let mut dup = remote("Office", "gamma", now);
        dup.duplicate_of = Some(a);
        registry.insert(dup);
        sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(spooler.queue_names().len(), 2);

        let report = sched.shutdown_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.removed.len(), 3);
        assert!(report.failed_over.is_empty());
        assert!(registry.is_empty());
        assert!(spooler.queue_names().is_empty());
    }

    #[tokio::test]
    async fn scripts_kept_for_retry_are_deleted_with_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        spooler.set_reject_creates(true);
        let mut registry = Registry::new();
        let sched = scheduler(dir.path());
        let now = Instant::now();
        let announcement = Announcement {
            source: DiscoverySource::Dnssd,
            host: "192.0.2.5".into(),
            port: 631,
            resource_path: "ipp/print".into(),
            service: ServiceIdentity::new("Acme Jet", "_ipp._tcp", "local"),
            hints: Some(CapabilityHints {
                pdl: Some("application/pdf".into()),
                ..Default::default()
            }),
        };
        resolver().announce(&mut registry, &LocalMirror::new(), &announcement, now);

        let report = sched.run_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.retried.len(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        let report = sched.shutdown_pass(&mut registry, &spooler, now).await;
        assert_eq!(report.removed.len(), 1);
        assert!(registry.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
