// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Source-address filter for inbound legacy browse packets.

use std::net::IpAddr;

use spoolbridge_core::config::{AllowRule, DaemonConfig};

/// `BrowseAllow` rules. With no rules, or `BrowseAllow all`, every source
/// is accepted.
#[derive(Debug, Clone, Default)]
pub struct AccessFilter {
    allow_all: bool,
    rules: Vec<AllowRule>,
}

impl AccessFilter {
    pub fn new(allow_all: bool, rules: Vec<AllowRule>) -> Self {
        Self { allow_all, rules }
    }

    pub fn from_config(config: &DaemonConfig) -> Self {
        Self::new(config.browse_allow_all, config.browse_allow.clone())
    }

    pub fn allows(&self, source: IpAddr) -> bool {
        if self.allow_all || self.rules.is_empty() {
            return true;
        }
        // IPv4 peers on a dual-stack socket arrive as `::ffff:a.b.c.d`.
        let source = source.to_canonical();
        self.rules.iter().any(|rule| rule_matches(rule, source))
    }
}

fn rule_matches(rule: &AllowRule, source: IpAddr) -> bool {
    match rule {
        AllowRule::Address(addr) => addr.to_canonical() == source,
        AllowRule::Network { addr, mask } => match (source, addr, mask) {
            (IpAddr::V4(s), IpAddr::V4(a), IpAddr::V4(m)) => {
                u32::from(s) & u32::from(*m) == u32::from(*a)
            }
            (IpAddr::V6(s), IpAddr::V6(a), IpAddr::V6(m)) => {
                u128::from(s) & u128::from(*m) == u128::from(*a)
            }
            _ => false,
        },
        AllowRule::Invalid(_) => false,
    }
}
