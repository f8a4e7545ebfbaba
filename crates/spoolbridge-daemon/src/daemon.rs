// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The spoolbridged event loop.
//
// One task owns the registry and every component that touches it. Discovery
// events, legacy browse packets, the reconciliation deadline, the browse
// interval, the auto-shutdown timer and signals are all arms of a single
// `tokio::select!`, so the registry is only ever mutated from here.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use spoolbridge_core::config::{AutoShutdownMode, DaemonConfig};
use spoolbridge_core::error::Result;
use spoolbridge_core::types::{Deadline, DiscoveryEvent, QueueSighting};
use spoolbridge_print::discovery;
use spoolbridge_print::legacy::MAX_PACKET;
use spoolbridge_print::netif::{self, NetInterface};
use spoolbridge_print::{
    AccessFilter, AdvertisementMirror, BrowsePacket, BrowsePollPeer, DnssdBrowser, IppEndpoint,
    LocalMirror, PassReport, Provisioner, Registry, Resolver, ResolverPolicy, RetryPolicy,
    Scheduler, Spooler,
};

use crate::status::write_status;

/// How often the spooler is tried at startup before giving up.
const STARTUP_ATTEMPTS: u32 = 30;

pub struct Daemon<S> {
    config: DaemonConfig,
    spooler: S,
    registry: Registry,
    mirror: LocalMirror,
    adverts: AdvertisementMirror,
    resolver: Resolver,
    scheduler: Scheduler,
    access: AccessFilter,
    peers: Vec<BrowsePollPeer>,
    interfaces: Vec<NetInterface>,
    own_addresses: Vec<IpAddr>,
    auto_shutdown: bool,
    shutdown_at: Option<Instant>,
}

impl<S: Spooler> Daemon<S> {
    pub fn new(config: DaemonConfig, spooler: S) -> Self {
        let scheduler = Scheduler::new(
            Provisioner::new(config.filter_dir.clone()),
            RetryPolicy::new(config.retry_interval()),
            config.browse_timeout(),
        );
        Self {
            registry: Registry::new(),
            mirror: LocalMirror::new(),
            adverts: AdvertisementMirror::new(config.browse_timeout()),
            resolver: Resolver::new(ResolverPolicy::from_config(&config)),
            scheduler,
            access: AccessFilter::from_config(&config),
            peers: config.browse_poll.iter().cloned().map(BrowsePollPeer::new).collect(),
            interfaces: Vec::new(),
            own_addresses: Vec::new(),
            auto_shutdown: config.auto_shutdown == AutoShutdownMode::On,
            shutdown_at: None,
            spooler,
            config,
        }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[cfg(test)]
    pub fn spooler(&self) -> &S {
        &self.spooler
    }

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------

    /// Run until a termination signal or auto-shutdown, then remove every
    /// queue this process created.
    pub async fn run(mut self) -> Result<()> {
        self.startup().await?;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let browser = if self.config.browse_remote_protocols.dnssd {
            start_browser(&events_tx)
        } else {
            None
        };
        let socket = self.bind_browse_socket().await;

        let mut browse_tick = tokio::time::interval(self.config.browse_interval());
        browse_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut term = signal(SignalKind::terminate())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let mut buf = vec![0u8; MAX_PACKET];

        info!(
            remote_printers = self.registry.len(),
            poll_peers = self.peers.len(),
            "spoolbridged running"
        );

        loop {
            let reconcile_at = self.registry.next_deadline();
            let shutdown_at = self.shutdown_at;

            tokio::select! {
                Some(event) = events.recv() => {
                    self.handle_event(event, Instant::now()).await;
                }

                received = recv_packet(socket.as_ref(), &mut buf) => match received {
                    Ok((len, from)) => self.handle_packet(&buf[..len], from, Instant::now()).await,
                    Err(e) => warn!(error = %e, "browse socket receive failed"),
                },

                () = sleep_until(reconcile_at) => {
                    self.reconcile(Instant::now()).await;
                }

                _ = browse_tick.tick() => {
                    self.browse_round(socket.as_ref()).await;
                }

                () = sleep_until(shutdown_at) => {
                    if self.shutdown_due(Instant::now()) {
                        info!("no remote printers left, auto-shutdown");
                        break;
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("interrupted");
                    break;
                }

                _ = term.recv() => {
                    info!("SIGTERM received");
                    break;
                }

                _ = usr1.recv() => self.disable_auto_shutdown(),

                _ = usr2.recv() => self.enable_auto_shutdown(Instant::now()),
            }
        }

        self.shutdown().await;
        drop(events_tx);
        if let Some(browser) = browser {
            if let Err(e) = browser.shutdown() {
                warn!(error = %e, "mDNS browser did not shut down cleanly");
            }
        }
        info!("spoolbridged stopped");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Startup and shutdown
    // -----------------------------------------------------------------------

    /// Wait for the spooler, then take over queues left by a previous run.
    pub async fn startup(&mut self) -> Result<()> {
        self.wait_for_spooler().await?;
        self.refresh_mirror().await;
        self.refresh_interfaces();

        // Broadcast peers announce only every BrowseInterval, so leftovers
        // get a whole lease to be seen again.
        let delay = if self.config.browse_remote_protocols.cups {
            self.config.browse_timeout()
        } else {
            self.config.confirm_timeout()
        };
        let now = Instant::now();
        let adopted = self
            .registry
            .adopt_leftovers(&self.mirror, Deadline::after(now, delay), now);
        if adopted > 0 {
            info!(adopted, wait_secs = delay.as_secs(), "queues from a previous run await confirmation");
        }
        self.update_auto_shutdown(now);
        Ok(())
    }

    async fn wait_for_spooler(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.spooler.list_queues().await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < STARTUP_ATTEMPTS => {
                    warn!(attempt, error = %e, "spooler not ready, waiting");
                    tokio::time::sleep(self.config.retry_interval()).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "spooler never became available");
                    return Err(e);
                }
            }
        }
    }

    /// Remove every queue we created and drop our subscriptions. Failures
    /// are logged only.
    pub async fn shutdown(&mut self) {
        info!(entries = self.registry.len(), "shutting down, removing remote printer queues");
        let report = self
            .scheduler
            .shutdown_pass(&mut self.registry, &self.spooler, Instant::now())
            .await;
        debug!(removed = report.removed.len(), kept = self.registry.len(), "final pass done");
        self.publish_status().await;

        for peer in &mut self.peers {
            match IppEndpoint::for_peer(&peer.config) {
                Ok(endpoint) => peer.close(&endpoint).await,
                Err(e) => warn!(peer = %peer.label(), error = %e, "BrowsePoll subscription not cancelled"),
            }
        }
        self.mirror.close(&self.spooler).await;
        self.adverts.close(&self.spooler).await;
    }

    async fn bind_browse_socket(&self) -> Option<UdpSocket> {
        if !self.config.browse_local_protocols.cups && !self.config.browse_remote_protocols.cups {
            return None;
        }
        let port = self.config.browse_port;
        let socket = match UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(port, error = %e, "legacy browse socket unavailable");
                return None;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            warn!(port, error = %e, "cannot enable broadcast on browse socket");
        }
        info!(port, "legacy browse socket bound");
        Some(socket)
    }

    // -----------------------------------------------------------------------
    // Event handling
    // -----------------------------------------------------------------------

    pub async fn handle_event(&mut self, event: DiscoveryEvent, now: Instant) {
        match event {
            DiscoveryEvent::Announce(announcement) => {
                self.refresh_mirror().await;
                let resolution =
                    self.resolver
                        .announce(&mut self.registry, &self.mirror, &announcement, now);
                debug!(
                    service = %announcement.service.name,
                    host = %announcement.host,
                    ?resolution,
                    "announcement resolved"
                );
            }
            DiscoveryEvent::Withdraw(service) => {
                if self.resolver.withdraw(&mut self.registry, &service, now).is_none() {
                    debug!(service = %service.name, "withdrawn service was not tracked");
                }
            }
            DiscoveryEvent::Sighting(sighting) => self.sighting(&sighting, now).await,
            DiscoveryEvent::BrowserLost => {
                let affected = self.resolver.browser_lost(&mut self.registry, now);
                warn!(affected, "mDNS browser lost, its printers will be removed");
                self.reconcile(now).await;
                if self.config.auto_shutdown == AutoShutdownMode::FollowBrowser {
                    self.enable_auto_shutdown(now);
                }
            }
            DiscoveryEvent::BrowserRestored => {
                info!("mDNS browser running");
                if self.config.auto_shutdown == AutoShutdownMode::FollowBrowser {
                    self.disable_auto_shutdown();
                }
            }
        }
        self.update_auto_shutdown(now);
    }

    /// One datagram from the legacy browse socket.
    pub async fn handle_packet(&mut self, data: &[u8], from: SocketAddr, now: Instant) {
        if !self.config.browse_remote_protocols.cups {
            return;
        }
        if !self.access.allows(from.ip()) {
            debug!(source = %from, "browse packet refused by BrowseAllow");
            return;
        }
        let text = String::from_utf8_lossy(data);
        let packet = match BrowsePacket::parse(&text) {
            Ok(packet) => packet,
            Err(e) => {
                debug!(source = %from, error = %e, "browse packet dropped");
                return;
            }
        };
        if packet.is_delete() {
            debug!(uri = %packet.uri, "delete notice ignored, entry expires with its lease");
            return;
        }
        self.sighting(&packet.to_sighting(), now).await;
        self.update_auto_shutdown(now);
    }

    async fn sighting(&mut self, sighting: &QueueSighting, now: Instant) {
        self.refresh_mirror().await;
        let resolution = self.resolver.sighting(
            &mut self.registry,
            &self.mirror,
            sighting,
            &self.own_addresses,
            now,
        );
        debug!(uri = %sighting.uri, source = ?sighting.source, ?resolution, "queue sighting resolved");
    }

    async fn refresh_mirror(&mut self) {
        let lease = self.config.browse_interval();
        if let Err(e) = self.mirror.refresh(&self.spooler, lease).await {
            warn!(error = %e, "local queue list not refreshed");
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Run one reconciliation pass and publish the result.
    pub async fn reconcile(&mut self, now: Instant) -> PassReport {
        let report = self
            .scheduler
            .run_pass(&mut self.registry, &self.spooler, now)
            .await;
        if !report.is_idle() {
            info!(
                provisioned = report.provisioned.len(),
                removed = report.removed.len(),
                retried = report.retried.len(),
                failed_over = report.failed_over.len(),
                "reconciliation pass"
            );
        }
        self.publish_status().await;
        self.update_auto_shutdown(now);
        report
    }

    async fn publish_status(&self) {
        if let Some(path) = &self.config.status_file {
            if let Err(e) = write_status(path, &self.registry).await {
                warn!(path = %path.display(), error = %e, "status file not written");
            }
        }
    }

    /// Browse interval: re-read interfaces, advertise, poll peers.
    async fn browse_round(&mut self, socket: Option<&UdpSocket>) {
        self.refresh_interfaces();

        if self.config.browse_local_protocols.cups {
            if let Some(socket) = socket {
                for (destination, packet) in self.advertisement_packets().await {
                    if let Err(e) = socket.send_to(packet.as_bytes(), destination).await {
                        warn!(destination = %destination, error = %e, "browse packet not sent");
                    }
                }
            }
        }

        if !self.peers.is_empty() {
            self.poll_peers(Instant::now()).await;
        }
    }

    fn refresh_interfaces(&mut self) {
        match netif::broadcast_interfaces(self.config.browse_port) {
            Ok(interfaces) => {
                self.own_addresses = netif::own_addresses(&interfaces);
                self.interfaces = interfaces;
            }
            Err(e) => warn!(error = %e, "keeping the previous interface list"),
        }
    }

    /// Packets for this advertisement round, one per shared queue and
    /// interface.
    pub async fn advertisement_packets(&mut self) -> Vec<(SocketAddr, String)> {
        if let Err(e) = self.adverts.refresh_if_changed(&self.spooler).await {
            warn!(error = %e, "shared queue list not refreshed");
        }
        self.adverts.packets(&self.interfaces)
    }

    async fn poll_peers(&mut self, now: Instant) {
        let lease = self.config.browse_interval();
        let mut sightings = Vec::new();
        for peer in &mut self.peers {
            match IppEndpoint::for_peer(&peer.config) {
                Ok(endpoint) => sightings.extend(peer.poll(&endpoint, lease).await),
                Err(e) => warn!(peer = %peer.label(), error = %e, "BrowsePoll peer skipped"),
            }
        }
        for sighting in &sightings {
            self.sighting(sighting, now).await;
        }
        self.update_auto_shutdown(now);
    }

    // -----------------------------------------------------------------------
    // Auto-shutdown
    // -----------------------------------------------------------------------

    /// SIGUSR2, or the mDNS browser going away in follow mode.
    pub fn enable_auto_shutdown(&mut self, now: Instant) {
        if !self.auto_shutdown {
            info!("auto-shutdown enabled");
        }
        self.auto_shutdown = true;
        self.update_auto_shutdown(now);
    }

    /// SIGUSR1, or the mDNS browser coming back in follow mode.
    pub fn disable_auto_shutdown(&mut self) {
        if self.auto_shutdown {
            info!("auto-shutdown disabled");
        }
        self.auto_shutdown = false;
        self.shutdown_at = None;
    }

    /// Arm the timer when the registry is empty, cancel it otherwise.
    fn update_auto_shutdown(&mut self, now: Instant) {
        if !self.auto_shutdown || !self.registry.is_empty() {
            if self.shutdown_at.take().is_some() {
                debug!("auto-shutdown timer cancelled");
            }
            return;
        }
        if self.shutdown_at.is_none() {
            let timeout = self.config.auto_shutdown_timeout();
            info!(timeout_secs = timeout.as_secs(), "no remote printers, auto-shutdown armed");
            self.shutdown_at = Some(now + timeout);
        }
    }

    pub fn shutdown_due(&self, now: Instant) -> bool {
        self.shutdown_at.is_some_and(|at| at <= now)
    }
}

/// Start DNS-SD browsing. Failure is reported to the loop as a lost
/// browser so follow mode can react.
fn start_browser(events: &UnboundedSender<DiscoveryEvent>) -> Option<DnssdBrowser> {
    let started = DnssdBrowser::new().and_then(|browser| {
        browser.start(events.clone())?;
        Ok(browser)
    });
    match started {
        Ok(browser) => Some(browser),
        Err(e) => {
            warn!(error = %e, "mDNS browsing unavailable");
            discovery::report_browser_lost(events);
            None
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn recv_packet(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}
