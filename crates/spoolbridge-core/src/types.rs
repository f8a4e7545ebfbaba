// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Spoolbridge daemon.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub Uuid);

impl EntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a remote printer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrinterStatus {
    /// Reconstructed from a previous run, waiting for a fresh announcement.
    Unconfirmed,
    /// Local queue exists and the printer is still advertised.
    Confirmed,
    /// Local queue must be created or modified.
    PendingCreate,
    /// As `PendingCreate`, but the announcement carries an expiry lease.
    PendingCreateFromBroadcast,
    /// Scheduled for removal once the deadline passes.
    Disappeared,
}

impl PrinterStatus {
    /// Either of the two "create the queue" states.
    pub fn is_pending_create(self) -> bool {
        matches!(self, Self::PendingCreate | Self::PendingCreateFromBroadcast)
    }

    /// States in which a newer announcement may take over the entry.
    pub fn is_fading(self) -> bool {
        matches!(self, Self::Unconfirmed | Self::Disappeared)
    }
}

impl std::fmt::Display for PrinterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Unconfirmed => "unconfirmed",
            Self::Confirmed => "confirmed",
            Self::PendingCreate => "pending-create",
            Self::PendingCreateFromBroadcast => "pending-create-broadcast",
            Self::Disappeared => "disappeared",
        };
        f.write_str(label)
    }
}

/// When the scheduler must next look at an entry.
///
/// `At` sorts before `Never`, so the minimum over a set of deadlines is the
/// next timer to arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deadline {
    At(Instant),
    Never,
}

impl Deadline {
    pub fn after(now: Instant, delay: Duration) -> Self {
        Self::At(now + delay)
    }

    /// Whether the deadline has been reached at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self, Self::At(at) if *at <= now)
    }

    pub fn instant(&self) -> Option<Instant> {
        match self {
            Self::At(at) => Some(*at),
            Self::Never => None,
        }
    }
}

/// DNS-SD style identity of an announcement: instance name, service type and
/// domain. Legacy and BrowsePoll announcements carry the printer-info as the
/// name and leave type and domain empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub service_type: String,
    pub domain: String,
}

impl ServiceIdentity {
    pub fn new(name: &str, service_type: &str, domain: &str) -> Self {
        Self {
            name: name.to_owned(),
            service_type: service_type.to_owned(),
            domain: domain.to_owned(),
        }
    }

    /// Case-insensitive match on all three fields.
    pub fn matches(&self, other: &ServiceIdentity) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.service_type.eq_ignore_ascii_case(&other.service_type)
            && self.domain.eq_ignore_ascii_case(&other.domain)
    }

    /// Whether the announcement came in over TLS-secured IPP.
    pub fn is_secure(&self) -> bool {
        self.service_type.contains("_ipps")
    }

    pub fn is_dnssd(&self) -> bool {
        !self.service_type.is_empty()
    }
}

/// TXT-record hints a native network printer publishes alongside its
/// service announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityHints {
    /// `product` key, e.g. `(HP LaserJet 400)`.
    pub product: Option<String>,
    /// `usb_MDL` key.
    pub usb_model: Option<String>,
    /// `ty` key, the human-readable make and model.
    pub ty: Option<String>,
    /// `pdl` key, comma-separated MIME types.
    pub pdl: Option<String>,
}

impl CapabilityHints {
    /// First model string long enough to name a queue after, in TXT key
    /// priority order.
    pub fn model_name(&self) -> Option<&str> {
        [&self.product, &self.usb_model, &self.ty]
            .into_iter()
            .flatten()
            .map(String::as_str)
            .find(|v| v.len() >= 3)
    }

    /// Whether the `product` value has the `(...)` form a spooler uses when a
    /// driver stands behind the shared queue.
    pub fn has_driver_product(&self) -> bool {
        self.product
            .as_deref()
            .is_some_and(|p| p.len() >= 2 && p.starts_with('(') && p.ends_with(')'))
    }
}

/// Which transport produced an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoverySource {
    Dnssd,
    LegacyBroadcast,
    BrowsePoll,
}

/// A normalized "this printer is here" event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub source: DiscoverySource,
    pub host: String,
    pub port: u16,
    /// Resource path without the leading slash, e.g. `printers/Office` or
    /// `ipp/print`.
    pub resource_path: String,
    pub service: ServiceIdentity,
    pub hints: Option<CapabilityHints>,
}

/// A remote spooler queue seen through the legacy protocol or BrowsePoll,
/// still in URI form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSighting {
    pub source: DiscoverySource,
    pub uri: String,
    pub info: String,
}

/// Events produced by the discovery transports and drained by the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Announce(Announcement),
    Withdraw(ServiceIdentity),
    Sighting(QueueSighting),
    /// The multicast browser stopped delivering events.
    BrowserLost,
    /// The multicast browser is running again.
    BrowserRestored,
}

/// One queue as currently present in the local spooler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalQueue {
    pub name: String,
    pub device_uri: Option<String>,
    /// Carries our marker option, so a previous run created it.
    pub owned_by_us: bool,
}

/// How a queue's driver is provided. No driver at all means a raw queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDriver {
    /// Path of a generated driver descriptor (PPD) file.
    Descriptor(std::path::PathBuf),
    /// Path of a generated interface script.
    Script(std::path::PathBuf),
    /// A model the spooler already knows, e.g. `everywhere`.
    Model(String),
}

/// Error classification used for retry and degradation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Spooler or remote printer unreachable: retry on the entry's deadline.
    Transport,
    /// Malformed or unsupported protocol data: drop or degrade.
    Protocol,
    /// Rejected by policy: discard silently.
    Policy,
    /// Local resources (temp files, interfaces): abort the operation.
    Resource,
}

/// Printer-type bits used by the spooler and the legacy browse protocol.
pub mod printer_type {
    pub const CLASS: u32 = 0x0000_0001;
    pub const REMOTE: u32 = 0x0000_0002;
    pub const IMPLICIT: u32 = 0x0001_0000;
    pub const DELETE: u32 = 0x0010_0000;
    pub const NOT_SHARED: u32 = 0x0020_0000;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_ordering_puts_never_last() {
        let now = Instant::now();
        let soon = Deadline::after(now, Duration::from_secs(1));
        let later = Deadline::after(now, Duration::from_secs(5));
        assert!(soon < later);
        assert!(later < Deadline::Never);
        assert_eq!([later, Deadline::Never, soon].into_iter().min(), Some(soon));
    }

    #[test]
    fn deadline_due_check() {
        let now = Instant::now();
        assert!(Deadline::At(now).is_due(now));
        assert!(!Deadline::after(now, Duration::from_secs(1)).is_due(now));
        assert!(!Deadline::Never.is_due(now));
    }

    #[test]
    fn model_name_skips_short_values() {
        let hints = CapabilityHints {
            product: Some("()".into()),
            usb_model: Some("LaserJet 400".into()),
            ty: Some("HP LaserJet 400 M401dne".into()),
            pdl: None,
        };
        assert_eq!(hints.model_name(), Some("LaserJet 400"));
        assert_eq!(CapabilityHints::default().model_name(), None);
    }

    #[test]
    fn driver_product_requires_parentheses() {
        let mut hints = CapabilityHints {
            product: Some("(HP LaserJet)".into()),
            ..Default::default()
        };
        assert!(hints.has_driver_product());
        hints.product = Some("HP LaserJet".into());
        assert!(!hints.has_driver_product());
        hints.product = None;
        assert!(!hints.has_driver_product());
    }

    #[test]
    fn identity_match_ignores_case() {
        let a = ServiceIdentity::new("Office", "_ipp._tcp", "local");
        let b = ServiceIdentity::new("office", "_IPP._tcp", "LOCAL");
        assert!(a.matches(&b));
        assert!(!a.matches(&ServiceIdentity::new("Office", "_ipps._tcp", "local")));
        assert!(ServiceIdentity::new("x", "_ipps._tcp", "local").is_secure());
    }
}
