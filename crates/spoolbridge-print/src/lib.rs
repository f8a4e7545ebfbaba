// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolbridge print: remote-printer lifecycle engine, the spooler seam and
// the discovery transports.  This crate bridges between the core domain
// types defined in `spoolbridge-core` and the local spooler and the network.

pub mod access;
pub mod advertise;
pub mod browse_poll;
pub mod capabilities;
pub mod discovery;
pub mod ipp_client;
pub mod ipp_spooler;
pub mod legacy;
pub mod memory;
pub mod mirror;
pub mod netif;
pub mod provisioner;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod spooler;
pub mod subscription;

pub use access::AccessFilter;
pub use advertise::AdvertisementMirror;
pub use browse_poll::{BrowsePollPeer, PollTransport};
pub use discovery::DnssdBrowser;
pub use ipp_client::IppEndpoint;
pub use ipp_spooler::IppSpooler;
pub use legacy::BrowsePacket;
pub use memory::MemorySpooler;
pub use mirror::LocalMirror;
pub use provisioner::Provisioner;
pub use registry::{Registry, RemotePrinter};
pub use resolver::{Resolution, Resolver, ResolverPolicy};
pub use retry::RetryPolicy;
pub use scheduler::{PassReport, Scheduler};
pub use spooler::Spooler;
