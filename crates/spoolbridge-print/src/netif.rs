// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Broadcast-capable network interfaces.
//
// Advertisements go out once per interface with the interface address in
// the URI, and the same list tells us which legacy packets are our own.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use if_addrs::IfAddr;
use tracing::debug;

use spoolbridge_core::error::{BridgeError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInterface {
    pub name: String,
    pub address: Ipv4Addr,
    /// Broadcast address and browse port packets are sent to.
    pub broadcast: SocketAddr,
}

/// Non-loopback IPv4 interfaces that have a broadcast address.
pub fn broadcast_interfaces(port: u16) -> Result<Vec<NetInterface>> {
    let addrs = if_addrs::get_if_addrs()
        .map_err(|e| BridgeError::Interfaces(format!("cannot list interfaces: {e}")))?;

    let interfaces: Vec<NetInterface> = addrs
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => v4.broadcast.map(|broadcast| NetInterface {
                name: iface.name.clone(),
                address: v4.ip,
                broadcast: SocketAddr::V4(SocketAddrV4::new(broadcast, port)),
            }),
            IfAddr::V6(_) => None,
        })
        .collect();

    debug!(count = interfaces.len(), "network interfaces refreshed");
    Ok(interfaces)
}

/// Addresses that identify this host in received packets.
pub fn own_addresses(interfaces: &[NetInterface]) -> Vec<IpAddr> {
    interfaces.iter().map(|i| IpAddr::V4(i.address)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_addresses_follow_interfaces() {
        let interfaces = vec![NetInterface {
            name: "eth0".into(),
            address: Ipv4Addr::new(192, 0, 2, 1),
            broadcast: "192.0.2.255:631".parse().unwrap(),
        }];
        assert_eq!(own_addresses(&interfaces), vec![IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))]);
    }

    #[test]
    fn enumeration_skips_loopback() {
        // Whatever the host has, loopback never shows up.
        if let Ok(interfaces) = broadcast_interfaces(631) {
            assert!(interfaces.iter().all(|i| !i.address.is_loopback()));
            assert!(interfaces.iter().all(|i| i.broadcast.port() == 631));
        }
    }
}
