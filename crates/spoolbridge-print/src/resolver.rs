// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Naming and deduplication resolver.
//
// Turns normalized discovery events into registry mutations: derives the
// local queue name and device URI, applies the driverless policy, resolves
// collisions with queues the local spooler already has, matches against
// existing entries (confirming, upgrading, or marking duplicates), and
// performs failover when a primary's announcement is withdrawn.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use chrono::Utc;
use ipp::prelude::Uri;
use tracing::{debug, info};

use spoolbridge_core::config::DaemonConfig;
use spoolbridge_core::sanitize::{SanitizeMode, sanitize};
use spoolbridge_core::types::{
    Announcement, Deadline, DiscoverySource, EntryId, PrinterStatus, QueueSighting,
    ServiceIdentity,
};

use crate::capabilities::has_portable_pdl;
use crate::mirror::LocalMirror;
use crate::registry::{PrinterOrigin, Registry, RemotePrinter};

/// Name given to network printers that publish no usable model string.
pub const PLACEHOLDER_NAME: &str = "printer";

const DEFAULT_IPP_PORT: u16 = 631;

/// Why an event did not lead to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Unparsable URI or empty queue name.
    Malformed,
    /// A spooler queue without a driver behind it.
    RawRemoteQueue,
    /// A native network printer while driverless provisioning is off.
    DriverlessDisabled,
    /// A native network printer advertising no portable PDL.
    UnknownPdl,
    /// Both `name` and `name@host` belong to foreign local queues.
    NameTaken,
    /// A foreign local queue already points at the printer's URI.
    ServedElsewhere,
    /// Our own legacy broadcast, echoed back.
    OwnBroadcast,
    /// A legacy or polled URI that names no spooler queue.
    NotAQueue,
}

/// Outcome of resolving one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A new entry was added.
    Created(EntryId),
    /// An existing entry was rescheduled for (re)creation.
    Updated(EntryId),
    /// An existing entry was matched; at most its status was confirmed.
    Unchanged(EntryId),
    Rejected(Rejection),
}

impl Resolution {
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            Self::Created(id) | Self::Updated(id) | Self::Unchanged(id) => Some(*id),
            Self::Rejected(_) => None,
        }
    }
}

/// Tunables the resolver needs.
#[derive(Debug, Clone, Copy)]
pub struct ResolverPolicy {
    pub create_ipp_printer_queues: bool,
    /// Lease granted to legacy and polled sightings.
    pub browse_timeout: Duration,
    /// Delay before a withdrawn printer's queue is removed.
    pub withdraw_grace: Duration,
}

impl ResolverPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            create_ipp_printer_queues: config.create_ipp_printer_queues,
            browse_timeout: config.browse_timeout(),
            withdraw_grace: config.withdraw_grace(),
        }
    }
}

impl Default for ResolverPolicy {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

/// Name, URI and kind derived from an announcement.
struct Candidate {
    name: String,
    uri: String,
    host: String,
    origin: PrinterOrigin,
}

#[derive(Debug, Default, Clone)]
pub struct Resolver {
    policy: ResolverPolicy,
}

impl Resolver {
    pub fn new(policy: ResolverPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ResolverPolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Announce
    // -----------------------------------------------------------------------

    /// Resolve an announcement against the registry and the local spooler.
    pub fn announce(
        &self,
        registry: &mut Registry,
        mirror: &LocalMirror,
        announcement: &Announcement,
        now: Instant,
    ) -> Resolution {
        let candidate = match self.candidate(announcement) {
            Ok(candidate) => candidate,
            Err(rejection) => {
                debug!(
                    host = %announcement.host,
                    resource = %announcement.resource_path,
                    ?rejection,
                    "announcement discarded"
                );
                return Resolution::Rejected(rejection);
            }
        };

        let mut name = candidate.name.clone();
        match mirror.by_uri(&candidate.uri) {
            Some(local) if !local.owned_by_us => {
                // Served by a queue somebody else set up.
                return match registry.find_match(&name, &candidate.host) {
                    Some(id) => Resolution::Unchanged(id),
                    None => {
                        debug!(uri = %candidate.uri, queue = %local.name, "printer already has a local queue, ignored");
                        Resolution::Rejected(Rejection::ServedElsewhere)
                    }
                };
            }
            Some(_) => {}
            None => {
                if is_foreign(mirror, &name) {
                    let fallback = format!("{}@{}", candidate.name, candidate.host);
                    debug!(taken = %name, fallback = %fallback, "queue name taken, using fallback");
                    if is_foreign(mirror, &fallback) {
                        debug!(name = %fallback, "fallback name also taken, printer ignored");
                        return Resolution::Rejected(Rejection::NameTaken);
                    }
                    name = fallback;
                }
            }
        }

        match registry.find_match(&name, &candidate.host) {
            Some(id) => update_entry(registry, id, candidate, &announcement.service, now),
            None => create_entry(registry, &name, candidate, &announcement.service, now),
        }
    }

    fn candidate(&self, announcement: &Announcement) -> Result<Candidate, Rejection> {
        let scheme = if announcement.service.is_secure() { "ipps" } else { "ipp" };
        let uri = assemble_uri(scheme, &announcement.host, announcement.port, &announcement.resource_path);
        let host = remote_host_label(&announcement.host);

        let resource = announcement.resource_path.as_str();
        let origin;
        let name;
        if let Some(queue) = strip_prefix_ignore_case(resource, "printers/") {
            if is_raw_remote_queue(announcement) {
                return Err(Rejection::RawRemoteQueue);
            }
            name = sanitize(queue, SanitizeMode::Name);
            origin = PrinterOrigin::RemoteQueue;
        } else if let Some(queue) = strip_prefix_ignore_case(resource, "classes/") {
            name = sanitize(queue, SanitizeMode::Name);
            origin = PrinterOrigin::RemoteQueue;
        } else {
            let hints = announcement.hints.clone().unwrap_or_default();
            name = hints
                .model_name()
                .map(|m| sanitize(m, SanitizeMode::Name))
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| PLACEHOLDER_NAME.to_owned());
            let pdl = hints
                .pdl
                .as_deref()
                .filter(|p| p.len() >= 3)
                .map(|p| sanitize(p, SanitizeMode::MimeList))
                .unwrap_or_default();

            if !self.policy.create_ipp_printer_queues {
                return Err(Rejection::DriverlessDisabled);
            }
            if pdl.is_empty() || !has_portable_pdl(&pdl) {
                return Err(Rejection::UnknownPdl);
            }
            let make_model = hints.ty.as_deref().map(|t| sanitize(t, SanitizeMode::Name)).unwrap_or_default();
            origin = PrinterOrigin::NetworkPrinter { pdl, make_model };
        }

        if name.is_empty() {
            return Err(Rejection::Malformed);
        }
        Ok(Candidate { name, uri, host, origin })
    }

    // -----------------------------------------------------------------------
    // Withdraw
    // -----------------------------------------------------------------------

    /// A DNS-SD service went away. Fails over to a duplicate on another host
    /// when one exists, otherwise schedules the entry for removal.
    pub fn withdraw(
        &self,
        registry: &mut Registry,
        service: &ServiceIdentity,
        now: Instant,
    ) -> Option<EntryId> {
        let id = registry.find_by_service(service)?;
        let is_duplicate = registry.get(id)?.is_duplicate();
        let backup = if is_duplicate { None } else { registry.failover_candidate(id) };

        match backup {
            Some(backup_id) => {
                registry.fail_over(id, backup_id, now);
                let entry = registry.get(id)?;
                info!(name = %entry.name, host = %entry.host, uri = %entry.uri, "printer disappeared, failing over to backup");
            }
            None => {
                let entry = registry.get_mut(id)?;
                entry.set_state(
                    PrinterStatus::Disappeared,
                    Deadline::after(now, self.policy.withdraw_grace),
                );
                info!(name = %entry.name, host = %entry.host, uri = %entry.uri, "printer disappeared, no backup available");
            }
        }
        Some(id)
    }

    // -----------------------------------------------------------------------
    // Legacy broadcast and BrowsePoll
    // -----------------------------------------------------------------------

    /// A remote spooler queue reported in URI form. Every resolved entry
    /// gets a fresh lease: pending creations become broadcast creations,
    /// everything else expires after the browse timeout unless seen again.
    pub fn sighting(
        &self,
        registry: &mut Registry,
        mirror: &LocalMirror,
        sighting: &QueueSighting,
        own_addresses: &[IpAddr],
        now: Instant,
    ) -> Resolution {
        let announcement = match self.sighting_announcement(sighting, own_addresses) {
            Ok(announcement) => announcement,
            Err(rejection) => {
                debug!(uri = %sighting.uri, ?rejection, "queue sighting discarded");
                return Resolution::Rejected(rejection);
            }
        };

        let resolution = self.announce(registry, mirror, &announcement, now);
        if let Some(entry) = resolution.entry_id().and_then(|id| registry.get_mut(id)) {
            if entry.status == PrinterStatus::PendingCreate {
                entry.status = PrinterStatus::PendingCreateFromBroadcast;
            } else if !entry.status.is_pending_create() {
                entry.set_state(
                    PrinterStatus::Disappeared,
                    Deadline::after(now, self.policy.browse_timeout),
                );
            }
        }
        resolution
    }

    fn sighting_announcement(
        &self,
        sighting: &QueueSighting,
        own_addresses: &[IpAddr],
    ) -> Result<Announcement, Rejection> {
        let parsed: Uri = sighting.uri.parse().map_err(|_| Rejection::Malformed)?;
        let host = parsed.host().ok_or(Rejection::Malformed)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        if let Ok(addr) = host.parse::<IpAddr>() {
            if own_addresses.contains(&addr) {
                return Err(Rejection::OwnBroadcast);
            }
        }

        let path = parsed.path();
        if strip_prefix_ignore_case(path, "/printers/").is_none()
            && strip_prefix_ignore_case(path, "/classes/").is_none()
        {
            return Err(Rejection::NotAQueue);
        }

        Ok(Announcement {
            source: sighting.source,
            host: host.to_owned(),
            port: parsed.port_u16().unwrap_or(DEFAULT_IPP_PORT),
            resource_path: path.trim_start_matches('/').to_owned(),
            service: ServiceIdentity::new(&sighting.info, "", ""),
            hints: None,
        })
    }

    /// The multicast browser is gone: every DNS-SD entry is scheduled for
    /// immediate removal. Returns how many entries were affected.
    pub fn browser_lost(&self, registry: &mut Registry, now: Instant) -> usize {
        let mut count = 0;
        for id in registry.ids() {
            if let Some(entry) = registry.get_mut(id) {
                if entry.service.is_dnssd() {
                    entry.set_state(PrinterStatus::Disappeared, Deadline::At(now));
                    count += 1;
                }
            }
        }
        count
    }
}

// ---------------------------------------------------------------------------
// Registry mutation
// ---------------------------------------------------------------------------

fn update_entry(
    registry: &mut Registry,
    id: EntryId,
    candidate: Candidate,
    service: &ServiceIdentity,
    now: Instant,
) -> Resolution {
    let Some(entry) = registry.get_mut(id) else {
        return Resolution::Rejected(Rejection::Malformed);
    };
    entry.last_seen = Utc::now();

    let upgrade = service.is_secure() && has_scheme(&entry.uri, "ipp");
    let moved = !after_scheme(&entry.uri).eq_ignore_ascii_case(after_scheme(&candidate.uri));

    let resolution = if upgrade || moved {
        info!(name = %entry.name, host = %candidate.host, uri = %candidate.uri, upgrade, "printer URI changed, recreating queue");
        entry.uri = candidate.uri;
        entry.host = candidate.host.clone();
        entry.service = service.clone();
        entry.origin = candidate.origin;
        entry.set_state(PrinterStatus::PendingCreate, Deadline::At(now));
        Resolution::Updated(id)
    } else {
        if entry.status.is_fading() {
            debug!(name = %entry.name, uri = %entry.uri, "entry confirmed");
            entry.set_state(PrinterStatus::Confirmed, Deadline::Never);
        }
        if entry.host.is_empty() {
            // Adopted at startup: learn what kind of device it is.
            entry.origin = candidate.origin;
        }
        Resolution::Unchanged(id)
    };

    if entry.host.is_empty() {
        entry.host = candidate.host;
    }
    if entry.service.name.is_empty() {
        entry.service.name = service.name.clone();
    }
    if entry.service.service_type.is_empty() {
        entry.service.service_type = service.service_type.clone();
    }
    if entry.service.domain.is_empty() {
        entry.service.domain = service.domain.clone();
    }
    resolution
}

fn create_entry(
    registry: &mut Registry,
    name: &str,
    candidate: Candidate,
    service: &ServiceIdentity,
    now: Instant,
) -> Resolution {
    let mut entry = RemotePrinter::new(
        name,
        &candidate.uri,
        &candidate.host,
        service.clone(),
        candidate.origin,
        now,
    );

    // The most recent live announcement is primary. A live primary keeps
    // its role; a fading one is demoted along with its duplicates.
    let primary = registry
        .named(name)
        .find(|q| !q.is_duplicate())
        .map(|q| (q.id, q.status.is_fading(), q.host.clone()));
    let demote = match primary {
        Some((primary_id, false, host)) => {
            debug!(name, host = %host, "printer already available through another host");
            entry.duplicate_of = Some(primary_id);
            None
        }
        Some((primary_id, true, host)) => {
            debug!(name, host = %host, "fading printer demoted to duplicate of the new one");
            Some(primary_id)
        }
        None => None,
    };

    info!(name, uri = %candidate.uri, host = %candidate.host, duplicate = entry.is_duplicate(), "new remote printer");
    let id = registry.insert(entry);
    if let Some(old) = demote {
        registry.redirect_duplicates(old, id);
    }
    Resolution::Created(id)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn is_foreign(mirror: &LocalMirror, name: &str) -> bool {
    mirror.by_name(name).is_some_and(|q| !q.owned_by_us)
}

/// A DNS-SD spooler queue is raw unless its `product` TXT value has the
/// `(...)` form. Without TXT data only a domain-less (legacy) announcement
/// passes.
fn is_raw_remote_queue(announcement: &Announcement) -> bool {
    match &announcement.hints {
        Some(hints) => !hints.has_driver_product(),
        None => {
            announcement.source == DiscoverySource::Dnssd && !announcement.service.domain.is_empty()
        }
    }
}

fn assemble_uri(scheme: &str, host: &str, port: u16, resource: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("{scheme}://[{host}]:{port}/{resource}")
    } else {
        format!("{scheme}://{host}:{port}/{resource}")
    }
}

/// Host name as used in fallback queue names: sanitized, `.local` dropped.
fn remote_host_label(host: &str) -> String {
    let mut label = sanitize(host, SanitizeMode::MimeList);
    for suffix in [".local.", ".local"] {
        if label.len() > suffix.len()
            && label[label.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
        {
            label.truncate(label.len() - suffix.len());
            break;
        }
    }
    label
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &value[prefix.len()..])
}

fn has_scheme(uri: &str, scheme: &str) -> bool {
    uri.split_once(':').is_some_and(|(s, _)| s.eq_ignore_ascii_case(scheme))
}

fn after_scheme(uri: &str) -> &str {
    uri.find(':').map_or(uri, |i| &uri[i..])
}
