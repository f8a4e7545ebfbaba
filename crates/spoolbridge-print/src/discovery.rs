// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// mDNS service discovery for IPP and IPPS printers on the local network.
//
// We browse for `_ipp._tcp.local.` (plain IPP) and `_ipps._tcp.local.`
// (TLS-secured IPP) using the `mdns-sd` crate.  Each service type is drained
// on its own thread and turned into `DiscoveryEvent`s pushed into the event
// loop's channel.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use spoolbridge_core::error::{BridgeError, Result};
use spoolbridge_core::types::{
    Announcement, CapabilityHints, DiscoveryEvent, DiscoverySource, ServiceIdentity,
};

/// mDNS service type for plain IPP.
const IPP_SERVICE: &str = "_ipp._tcp.local.";

/// mDNS service type for TLS-secured IPP.
const IPPS_SERVICE: &str = "_ipps._tcp.local.";

/// Resource path assumed when a printer publishes no `rp` key.
const DEFAULT_RESOURCE: &str = "ipp/print";

/// Continuous DNS-SD browser feeding the event loop.
pub struct DnssdBrowser {
    daemon: ServiceDaemon,
}

impl DnssdBrowser {
    /// Spawn the mDNS daemon thread. Browsing starts with [`start`].
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| BridgeError::Discovery(format!("failed to start mDNS daemon: {e}")))?;
        Ok(Self { daemon })
    }

    /// Browse both IPP service types and forward events into `events`.
    pub fn start(&self, events: UnboundedSender<DiscoveryEvent>) -> Result<()> {
        for service_type in [IPP_SERVICE, IPPS_SERVICE] {
            let receiver = self
                .daemon
                .browse(service_type)
                .map_err(|e| BridgeError::Discovery(format!("browse {service_type}: {e}")))?;
            spawn_listener(service_type, receiver, events.clone())?;
        }
        info!("mDNS printer discovery started");
        Ok(())
    }

    /// Shut down the mDNS daemon. The listener threads end with it.
    pub fn shutdown(self) -> Result<()> {
        let _status_rx = self
            .daemon
            .shutdown()
            .map_err(|e| BridgeError::Discovery(format!("daemon shutdown: {e}")))?;
        info!("mDNS daemon shut down");
        Ok(())
    }
}

/// Drain one browse channel until the search stops or the daemon goes away,
/// then report the browser as lost.
fn spawn_listener(
    service_type: &'static str,
    receiver: mdns_sd::Receiver<ServiceEvent>,
    events: UnboundedSender<DiscoveryEvent>,
) -> Result<()> {
    std::thread::Builder::new()
        .name(format!("mdns-{service_type}"))
        .spawn(move || {
            let mut running = false;
            while let Ok(event) = receiver.recv() {
                let forwarded = match event {
                    ServiceEvent::SearchStarted(stype) => {
                        if running {
                            continue;
                        }
                        debug!(service_type = %stype, "mDNS search started");
                        running = true;
                        DiscoveryEvent::BrowserRestored
                    }
                    ServiceEvent::ServiceFound(stype, fullname) => {
                        debug!(service_type = %stype, name = %fullname, "service found");
                        continue;
                    }
                    ServiceEvent::ServiceResolved(info) => match resolved(&info, service_type) {
                        Some(announcement) => DiscoveryEvent::Announce(announcement),
                        None => {
                            warn!(name = %info.get_fullname(), "resolved service has no host");
                            continue;
                        }
                    },
                    ServiceEvent::ServiceRemoved(stype, fullname) => {
                        info!(service_type = %stype, name = %fullname, "service removed");
                        DiscoveryEvent::Withdraw(split_fullname(&fullname, service_type))
                    }
                    ServiceEvent::SearchStopped(stype) => {
                        debug!(service_type = %stype, "mDNS search stopped");
                        break;
                    }
                };
                if events.send(forwarded).is_err() {
                    // Event loop gone: nothing left to report to.
                    return;
                }
            }
            warn!(service_type, "mDNS browser lost");
            report_browser_lost(&events);
        })
        .map(|_| ())
        .map_err(|e| BridgeError::Discovery(format!("failed to spawn mDNS listener thread: {e}")))
}

/// Tell the event loop the browser is gone. Returns whether anyone was
/// listening.
pub fn report_browser_lost(events: &UnboundedSender<DiscoveryEvent>) -> bool {
    match events.send(DiscoveryEvent::BrowserLost) {
        Ok(()) => true,
        Err(_) => {
            debug!("event loop gone, browser loss not delivered");
            false
        }
    }
}

/// Convert a resolved `ServiceInfo` into an announcement.
fn resolved(info: &ServiceInfo, service_type: &str) -> Option<Announcement> {
    let hostname = info.get_hostname().trim_end_matches('.');
    let host = if hostname.is_empty() {
        // Prefer IPv4 for wider printer compatibility.
        let addresses = info.get_addresses();
        let ip: IpAddr = addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addresses.iter().next())
            .copied()?;
        ip.to_string()
    } else {
        hostname.to_owned()
    };

    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_ascii_lowercase(), p.val_str().to_owned()))
        .collect();

    Some(announcement(
        info.get_fullname(),
        service_type,
        &host,
        info.get_port(),
        &txt,
    ))
}

/// Build the announcement for one resolved service. `txt` keys are
/// lowercase.
pub fn announcement(
    fullname: &str,
    service_type: &str,
    host: &str,
    port: u16,
    txt: &HashMap<String, String>,
) -> Announcement {
    let resource_path = txt
        .get("rp")
        .map(|rp| rp.trim_start_matches('/').to_owned())
        .unwrap_or_else(|| DEFAULT_RESOURCE.to_owned());

    Announcement {
        source: DiscoverySource::Dnssd,
        host: host.to_owned(),
        port,
        resource_path,
        service: split_fullname(fullname, service_type),
        hints: capability_hints(txt),
    }
}

/// TXT keys that describe the printer. No TXT data at all yields `None`.
pub fn capability_hints(txt: &HashMap<String, String>) -> Option<CapabilityHints> {
    if txt.is_empty() {
        return None;
    }
    let value = |key: &str| txt.get(key).filter(|v| !v.is_empty()).cloned();
    Some(CapabilityHints {
        product: value("product"),
        usb_model: value("usb_mdl"),
        ty: value("ty"),
        pdl: value("pdl"),
    })
}

/// Split `Office._ipp._tcp.local.` into instance name, service type and
/// domain.
pub fn split_fullname(fullname: &str, service_type: &str) -> ServiceIdentity {
    let (stype, domain) = service_type
        .trim_end_matches('.')
        .rsplit_once('.')
        .unwrap_or((service_type, ""));

    let suffix = format!(".{service_type}");
    let name = fullname
        .strip_suffix(&suffix)
        .or_else(|| fullname.strip_suffix(suffix.trim_end_matches('.')))
        .unwrap_or(fullname);

    ServiceIdentity::new(&unescape_instance(name), stype, domain)
}

/// Undo DNS-SD escaping of dots and backslashes in instance names.
fn unescape_instance(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}
