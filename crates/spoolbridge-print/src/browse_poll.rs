// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// BrowsePoll client: pulls the shared-printer list from a remote spooler
// instead of waiting for its broadcasts.
//
// Each poll first asks the peer's change subscription whether anything
// happened. Only then is the printer list fetched again; otherwise the
// previously seen printers are replayed so their leases stay fresh.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use spoolbridge_core::config::PollPeerConfig;
use spoolbridge_core::error::Result;
use spoolbridge_core::types::{DiscoverySource, QueueSighting};

use crate::spooler::EventSubscriptions;
use crate::subscription::SubscriptionState;

/// One shared printer as reported by a polled peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolledPrinter {
    /// `printer-uri-supported`.
    pub uri: String,
    /// `printer-info`.
    pub info: String,
}

/// The network side of one BrowsePoll peer.
#[async_trait]
pub trait PollTransport: EventSubscriptions {
    /// The peer's shared, local (non-remote, non-implicit) printers.
    async fn shared_printers(&self) -> Result<Vec<PolledPrinter>>;
}

/// Poll state for one configured peer.
#[derive(Debug, Clone)]
pub struct BrowsePollPeer {
    pub config: PollPeerConfig,
    pub subscription: SubscriptionState,
    /// Last printer list fetched, replayed as keep-alive.
    printers: Vec<PolledPrinter>,
}

impl BrowsePollPeer {
    pub fn new(config: PollPeerConfig) -> Self {
        Self {
            config,
            subscription: SubscriptionState::new(),
            printers: Vec::new(),
        }
    }

    pub fn label(&self) -> String {
        self.config.label()
    }

    pub fn printers(&self) -> &[PolledPrinter] {
        &self.printers
    }

    /// Run one poll and return the sightings to feed into the resolver.
    ///
    /// A failed printer fetch yields nothing; the entries of this peer then
    /// age out through their leases unless a later poll succeeds.
    #[instrument(skip_all, fields(peer = %self.config.label()))]
    pub async fn poll<T>(&mut self, transport: &T, lease: Duration) -> Vec<QueueSighting>
    where
        T: PollTransport + ?Sized,
    {
        let label = self.label();
        let changed = self.subscription.has_changes(transport, lease, &label).await;

        if changed {
            match transport.shared_printers().await {
                Ok(printers) => {
                    info!(peer = %label, printers = printers.len(), "fetched shared printers");
                    self.printers = printers;
                }
                Err(e) => {
                    warn!(peer = %label, error = %e, "fetching shared printers failed");
                    return Vec::new();
                }
            }
        } else {
            debug!(peer = %label, printers = self.printers.len(), "no changes, replaying keep-alive");
        }

        self.printers
            .iter()
            .map(|p| QueueSighting {
                source: DiscoverySource::BrowsePoll,
                uri: p.uri.clone(),
                info: p.info.clone(),
            })
            .collect()
    }

    /// Cancel the peer's subscription at shutdown.
    pub async fn close<T>(&mut self, transport: &T)
    where
        T: PollTransport + ?Sized,
    {
        let label = self.label();
        self.subscription.cancel(transport, &label).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use spoolbridge_core::error::BridgeError;

    use crate::spooler::NotificationBatch;

    const LEASE: Duration = Duration::from_secs(60);

    /// A peer spooler held in memory.
    #[derive(Default)]
    struct FakePeer {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        printers: Vec<PolledPrinter>,
        /// Pending event count for the live subscription.
        pending: usize,
        sequence: i32,
        subscription: Option<i32>,
        no_subscriptions: bool,
        offline: bool,
        fetches: usize,
        cancelled: Vec<i32>,
    }

    impl FakePeer {
        fn with_printers(names: &[&str]) -> Self {
            let peer = Self::default();
            peer.state.lock().unwrap().printers = names
                .iter()
                .map(|n| PolledPrinter {
                    uri: format!("ipp://peer:631/printers/{n}"),
                    info: (*n).to_owned(),
                })
                .collect();
            peer
        }

        fn add_printer(&self, name: &str) {
            let mut state = self.state.lock().unwrap();
            state.printers.push(PolledPrinter {
                uri: format!("ipp://peer:631/printers/{name}"),
                info: name.to_owned(),
            });
            state.pending += 1;
        }

        fn fetches(&self) -> usize {
            self.state.lock().unwrap().fetches
        }
    }

    #[async_trait]
    impl EventSubscriptions for FakePeer {
        async fn create_subscription(&self, _lease: Duration) -> Result<i32> {
            let mut state = self.state.lock().unwrap();
            if state.no_subscriptions {
                return Err(BridgeError::IppRequest("client-error-operation-not-supported".into()));
            }
            state.subscription = Some(7);
            Ok(7)
        }

        async fn get_notifications(&self, id: i32, _first: i32) -> Result<NotificationBatch> {
            let mut state = self.state.lock().unwrap();
            if state.subscription != Some(id) {
                return Err(BridgeError::SubscriptionNotFound(id));
            }
            let events = std::mem::take(&mut state.pending);
            state.sequence += events as i32;
            Ok(NotificationBatch {
                events,
                last_sequence: (events > 0).then_some(state.sequence),
            })
        }

        async fn cancel_subscription(&self, id: i32) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.cancelled.push(id);
            state.subscription = None;
            Ok(())
        }
    }

    #[async_trait]
    impl PollTransport for FakePeer {
        async fn shared_printers(&self) -> Result<Vec<PolledPrinter>> {
            let mut state = self.state.lock().unwrap();
            if state.offline {
                return Err(BridgeError::SpoolerUnavailable("peer:631 refused".into()));
            }
            state.fetches += 1;
            Ok(state.printers.clone())
        }
    }

    fn peer() -> BrowsePollPeer {
        BrowsePollPeer::new(PollPeerConfig::parse("peer", 631))
    }

    #[tokio::test]
    async fn first_poll_fetches_and_subscribes() {
        let transport = FakePeer::with_printers(&["Lab", "Office"]);
        let mut peer = peer();
        let sightings = peer.poll(&transport, LEASE).await;
        assert_eq!(sightings.len(), 2);
        assert!(sightings.iter().all(|s| s.source == DiscoverySource::BrowsePoll));
        assert_eq!(sightings[0].uri, "ipp://peer:631/printers/Lab");
        assert_eq!(peer.subscription.id, Some(7));
        assert_eq!(transport.fetches(), 1);
    }

    #[tokio::test]
    async fn unchanged_peer_is_replayed_without_fetching() {
        let transport = FakePeer::with_printers(&["Lab"]);
        let mut peer = peer();
        peer.poll(&transport, LEASE).await;

        let sightings = peer.poll(&transport, LEASE).await;
        assert_eq!(sightings.len(), 1);
        assert_eq!(transport.fetches(), 1);
    }

    #[tokio::test]
    async fn events_trigger_a_fresh_fetch() {
        let transport = FakePeer::with_printers(&["Lab"]);
        let mut peer = peer();
        peer.poll(&transport, LEASE).await;

        transport.add_printer("Annex");
        let sightings = peer.poll(&transport, LEASE).await;
        assert_eq!(sightings.len(), 2);
        assert_eq!(transport.fetches(), 2);
        assert_eq!(peer.subscription.sequence, 1);
    }

    #[tokio::test]
    async fn expired_subscription_is_recreated() {
        let transport = FakePeer::with_printers(&["Lab"]);
        let mut peer = peer();
        peer.poll(&transport, LEASE).await;

        transport.state.lock().unwrap().subscription = None;
        peer.poll(&transport, LEASE).await;
        assert_eq!(transport.fetches(), 2);
        assert!(peer.subscription.can_subscribe);
        assert_eq!(peer.subscription.id, Some(7));
    }

    #[tokio::test]
    async fn peers_without_subscriptions_are_fetched_every_time() {
        let transport = FakePeer::with_printers(&["Lab"]);
        transport.state.lock().unwrap().no_subscriptions = true;
        let mut peer = peer();
        peer.poll(&transport, LEASE).await;
        peer.poll(&transport, LEASE).await;
        assert!(!peer.subscription.can_subscribe);
        assert_eq!(transport.fetches(), 2);
    }

    #[tokio::test]
    async fn fetch_failure_yields_no_sightings() {
        let transport = FakePeer::with_printers(&["Lab"]);
        transport.state.lock().unwrap().offline = true;
        let mut peer = peer();
        assert!(peer.poll(&transport, LEASE).await.is_empty());
        assert!(peer.printers().is_empty());
    }

    #[tokio::test]
    async fn close_cancels_the_subscription() {
        let transport = FakePeer::with_printers(&["Lab"]);
        let mut peer = peer();
        peer.poll(&transport, LEASE).await;
        peer.close(&transport).await;
        assert_eq!(transport.state.lock().unwrap().cancelled, vec![7]);
        assert_eq!(peer.subscription.id, None);
    }
}
