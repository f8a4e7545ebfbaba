// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Advertisement mirror: re-broadcasts the local spooler's shared queues in
// the legacy browse protocol, one packet per interface with the
// interface's own address in the printer URI.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use ipp::prelude::Uri;
use tracing::{debug, warn};

use spoolbridge_core::error::Result;
use spoolbridge_core::types::printer_type;

use crate::legacy::{BrowsePacket, strip_quotes};
use crate::netif::NetInterface;
use crate::spooler::{SharedQueue, Spooler};
use crate::subscription::SubscriptionState;

/// One advertisable queue, ready to be stamped with an interface address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseData {
    pub packet: BrowsePacket,
}

impl BrowseData {
    /// `None` for queues that are not shared.
    pub fn from_shared(queue: &SharedQueue, lease: Duration) -> Option<Self> {
        if queue.printer_type & printer_type::NOT_SHARED != 0 {
            return None;
        }

        let mut options = Vec::new();
        if let Some(auth) = queue.auth_info_required.as_deref() {
            if auth != "none" {
                options.push(("auth-info-required".to_owned(), auth.to_owned()));
            }
        }
        if let Some(uuid) = &queue.uuid {
            options.push(("uuid".to_owned(), uuid.clone()));
        }
        if let Some((start, end)) = &queue.job_sheets {
            options.push(("job-sheets".to_owned(), format!("{start},{end}")));
        }
        options.extend(queue.defaults.iter().cloned());

        Some(Self {
            packet: BrowsePacket {
                printer_type: queue.printer_type,
                state: queue.state,
                uri: queue.uri.clone(),
                location: strip_quotes(&queue.location),
                info: strip_quotes(&queue.info),
                make_model: strip_quotes(&queue.make_model),
                lease_duration: Some(lease.as_secs()),
                options,
            },
        })
    }

    /// The packet as sent on an interface with address `address`.
    pub fn packet_for(&self, address: Ipv4Addr) -> Result<String> {
        let mut packet = self.packet.clone();
        if let Some(uri) = rewrite_host(&packet.uri, address) {
            packet.uri = uri;
        }
        packet.encode()
    }
}

#[derive(Debug, Clone)]
pub struct AdvertisementMirror {
    data: Vec<BrowseData>,
    lease: Duration,
    subscription: SubscriptionState,
    /// Set until a successful refresh has read every reported change.
    stale: bool,
}

impl AdvertisementMirror {
    pub fn new(lease: Duration) -> Self {
        Self {
            data: Vec::new(),
            lease,
            subscription: SubscriptionState::new(),
            stale: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Re-read the shared queues from the spooler.
    pub async fn refresh<S>(&mut self, spooler: &S) -> Result<()>
    where
        S: Spooler + ?Sized,
    {
        let queues = spooler.list_shared_queues().await?;
        self.data = queues
            .iter()
            .filter_map(|q| BrowseData::from_shared(q, self.lease))
            .collect();
        self.stale = false;
        debug!(shared = self.data.len(), "advertisement data refreshed");
        Ok(())
    }

    /// Refresh only when the spooler reports queue changes, or when the
    /// spooler cannot deliver change notifications at all. Returns whether
    /// a refresh happened.
    pub async fn refresh_if_changed<S>(&mut self, spooler: &S) -> Result<bool>
    where
        S: Spooler + ?Sized,
    {
        if self
            .subscription
            .has_changes(spooler, self.lease, "local spooler")
            .await
        {
            // Cleared only by a successful refresh.
            self.stale = true;
        }
        if !self.stale {
            return Ok(false);
        }
        self.refresh(spooler).await?;
        Ok(true)
    }

    /// Drop the change subscription on the local spooler.
    pub async fn close<S>(&mut self, spooler: &S)
    where
        S: Spooler + ?Sized,
    {
        self.subscription.cancel(spooler, "local spooler").await;
    }

    /// Every (destination, packet) pair for one advertisement round.
    /// Oversize packets are skipped.
    pub fn packets(&self, interfaces: &[NetInterface]) -> Vec<(SocketAddr, String)> {
        let mut out = Vec::with_capacity(self.data.len() * interfaces.len());
        for data in &self.data {
            for iface in interfaces {
                match data.packet_for(iface.address) {
                    Ok(packet) => out.push((iface.broadcast, packet)),
                    Err(e) => warn!(interface = %iface.name, error = %e, "packet not sent"),
                }
            }
        }
        out
    }
}

/// Replace the host part of `uri` (usually `localhost`) with `address`.
fn rewrite_host(uri: &str, address: Ipv4Addr) -> Option<String> {
    let parsed: Uri = uri.parse().ok()?;
    let scheme = parsed.scheme_str().unwrap_or("ipp");
    let port = parsed.port_u16().unwrap_or(631);
    let path = parsed.path_and_query().map_or("/", |p| p.as_str());
    Some(format!("{scheme}://{address}:{port}{path}"))
}
