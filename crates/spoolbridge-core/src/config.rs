// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Daemon configuration.
//
// Two on-disk forms are accepted: the classic directive file
// (`BrowseRemoteProtocols dnssd cups`, one directive per line, `#` comments)
// and a JSON serialization of `DaemonConfig`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BridgeError, Result};

/// Separators accepted between tokens of multi-valued directives.
const TOKEN_SEPARATORS: &[char] = &[' ', '\t', ','];

/// Which browse protocols are enabled for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseProtocols {
    /// Multicast DNS service discovery.
    pub dnssd: bool,
    /// The legacy UDP broadcast protocol.
    pub cups: bool,
}

impl BrowseProtocols {
    pub fn is_empty(&self) -> bool {
        !self.dnssd && !self.cups
    }

    /// Parse a token list such as `dnssd cups` or `none`. Unknown tokens are
    /// logged and skipped.
    pub fn parse(value: &str) -> Self {
        let mut protocols = Self::default();
        for token in value.split(TOKEN_SEPARATORS).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "dnssd" => protocols.dnssd = true,
                "cups" => protocols.cups = true,
                "none" => {}
                other => debug!(protocol = other, "unknown browse protocol, ignoring"),
            }
        }
        protocols
    }
}

/// A remote spooler polled with BrowsePoll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPeerConfig {
    pub server: String,
    pub port: u16,
    /// IPP version forced for requests to this peer, `None` for the default.
    pub version: Option<(u8, u8)>,
}

impl PollPeerConfig {
    /// Parse `server[:port][/version=X.Y]`.
    pub fn parse(value: &str, default_port: u16) -> Self {
        let (address, option) = match value.split_once('/') {
            Some((address, option)) => (address, Some(option)),
            None => (value, None),
        };

        let version = option.and_then(|opt| {
            let parsed = match opt.to_ascii_lowercase().as_str() {
                "version=1.0" => Some((1, 0)),
                "version=1.1" => Some((1, 1)),
                "version=2.0" => Some((2, 0)),
                "version=2.1" => Some((2, 1)),
                "version=2.2" => Some((2, 2)),
                _ => None,
            };
            if parsed.is_none() {
                debug!(option = opt, "ignoring unknown BrowsePoll server option");
            }
            parsed
        });

        let (server, port) = match address.split_once(':') {
            Some((server, port)) => (server, port.parse().unwrap_or(default_port)),
            None => (address, default_port),
        };

        Self {
            server: server.to_owned(),
            port,
            version,
        }
    }

    /// `host:port` label used in logs.
    pub fn label(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

/// One `BrowseAllow` rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllowRule {
    /// A single source address.
    Address(IpAddr),
    /// `addr/mask`: matches when `source & mask == addr`. Both are of the
    /// same address family.
    Network { addr: IpAddr, mask: IpAddr },
    /// A value that could not be parsed. Never matches.
    Invalid(String),
}

impl AllowRule {
    /// Parse an IPv4 or IPv6 address, `addr/bits` or `addr/mask`. IPv6
    /// addresses may be bracketed.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        let parsed = match value.split_once('/') {
            Some((addr, mask)) if mask.contains(['.', ':']) => {
                match (parse_ip(addr), mask.parse::<IpAddr>()) {
                    (Some(addr), Ok(mask)) if addr.is_ipv4() == mask.is_ipv4() => {
                        Some(Self::Network { addr, mask })
                    }
                    _ => None,
                }
            }
            Some((addr, bits)) => parse_ip(addr)
                .and_then(|addr| format!("{addr}/{bits}").parse::<IpNet>().ok())
                .map(|net| Self::Network {
                    addr: net.addr(),
                    mask: net.netmask(),
                }),
            None => parse_ip(value).map(Self::Address),
        };
        parsed.unwrap_or_else(|| Self::Invalid(value.to_owned()))
    }
}

fn parse_ip(value: &str) -> Option<IpAddr> {
    let bare = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .unwrap_or(value);
    bare.parse().ok()
}

/// Auto-shutdown policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoShutdownMode {
    /// Run until told to stop.
    #[default]
    Off,
    /// Exit once the registry has been empty for the configured timeout.
    On,
    /// Turn auto-shutdown on while the multicast browser is unavailable and
    /// off while it runs.
    FollowBrowser,
}

impl FromStr for AutoShutdownMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on" | "yes" | "true" | "1" => Ok(Self::On),
            "off" | "no" | "false" | "0" => Ok(Self::Off),
            "avahi" => Ok(Self::FollowBrowser),
            _ => Err(BridgeError::config(
                "AutoShutdown",
                s,
                "expected on, off or avahi",
            )),
        }
    }
}

/// Persistent daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Protocols used to advertise local shared queues.
    pub browse_local_protocols: BrowseProtocols,
    /// Protocols used to discover remote printers.
    pub browse_remote_protocols: BrowseProtocols,
    /// Remote spoolers to poll.
    pub browse_poll: Vec<PollPeerConfig>,
    /// `BrowseAllow all` was given.
    pub browse_allow_all: bool,
    /// Source address rules for legacy packets. Empty allows everyone.
    pub browse_allow: Vec<AllowRule>,
    /// Create queues for native IPP network printers (driverless).
    pub create_ipp_printer_queues: bool,
    pub auto_shutdown: AutoShutdownMode,
    /// Seconds the registry must stay empty before auto-shutdown fires.
    pub auto_shutdown_timeout_secs: u64,
    /// Seconds between advertisements and BrowsePoll passes.
    pub browse_interval_secs: u64,
    /// Lease of a legacy announcement, also advertised as `lease-duration`.
    pub browse_timeout_secs: u64,
    /// UDP port of the legacy browse protocol and default BrowsePoll port.
    pub browse_port: u16,
    /// Seconds a reconstructed queue waits for its first announcement.
    pub confirm_timeout_secs: u64,
    /// Fixed backoff for failed spooler operations.
    pub retry_interval_secs: u64,
    /// Grace period between a withdrawal and queue removal.
    pub withdraw_grace_secs: u64,
    /// Address of the local spooler.
    pub spooler_uri: String,
    /// Directory holding the format-converting filters used by interface
    /// scripts.
    pub filter_dir: PathBuf,
    /// Where to write a JSON registry snapshot after each pass.
    pub status_file: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            browse_local_protocols: BrowseProtocols::default(),
            browse_remote_protocols: BrowseProtocols {
                dnssd: true,
                cups: false,
            },
            browse_poll: Vec::new(),
            browse_allow_all: false,
            browse_allow: Vec::new(),
            create_ipp_printer_queues: false,
            auto_shutdown: AutoShutdownMode::Off,
            auto_shutdown_timeout_secs: 30,
            browse_interval_secs: 60,
            browse_timeout_secs: 300,
            browse_port: 631,
            confirm_timeout_secs: 10,
            retry_interval_secs: 10,
            withdraw_grace_secs: 0,
            spooler_uri: "ipp://localhost:631".into(),
            filter_dir: PathBuf::from("/usr/lib/cups/filter"),
            status_file: None,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no configuration file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        let config = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text)?
        } else {
            Self::parse_directives(&text)?
        };
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Pretty JSON form of the effective configuration.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse the directive file format, starting from the defaults.
    pub fn parse_directives(text: &str) -> Result<Self> {
        let mut config = Self::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (directive, value) = match line.split_once(char::is_whitespace) {
                Some((d, v)) => (d, v.trim()),
                None => (line, ""),
            };
            debug!(directive, value, "reading config");

            match directive.to_ascii_lowercase().as_str() {
                "browseprotocols" => {
                    let protocols = BrowseProtocols::parse(value);
                    config.browse_local_protocols = protocols;
                    config.browse_remote_protocols = protocols;
                }
                "browselocalprotocols" => {
                    config.browse_local_protocols = BrowseProtocols::parse(value);
                }
                "browseremoteprotocols" => {
                    config.browse_remote_protocols = BrowseProtocols::parse(value);
                }
                "browsepoll" if !value.is_empty() => {
                    let peer = PollPeerConfig::parse(value, config.browse_port);
                    debug!(peer = %peer.label(), "adding BrowsePoll server");
                    config.browse_poll.push(peer);
                }
                "browseallow" => {
                    if value.eq_ignore_ascii_case("all") {
                        config.browse_allow_all = true;
                    } else {
                        let rule = AllowRule::parse(value);
                        if let AllowRule::Invalid(v) = &rule {
                            debug!(value = %v, "BrowseAllow value not understood");
                        }
                        config.browse_allow.push(rule);
                    }
                }
                "createippprinterqueues" => {
                    config.create_ipp_printer_queues = parse_bool(directive, value)?;
                }
                "autoshutdown" => {
                    for token in value.split(TOKEN_SEPARATORS).filter(|t| !t.is_empty()) {
                        if token.eq_ignore_ascii_case("none") {
                            continue;
                        }
                        match token.parse::<AutoShutdownMode>() {
                            Ok(mode) => config.auto_shutdown = mode,
                            Err(_) => debug!(mode = token, "unknown auto shutdown mode"),
                        }
                    }
                }
                "autoshutdowntimeout" => {
                    config.auto_shutdown_timeout_secs = parse_secs(directive, value)?;
                }
                "browseinterval" => {
                    config.browse_interval_secs = parse_secs(directive, value)?;
                }
                "browsetimeout" => {
                    config.browse_timeout_secs = parse_secs(directive, value)?;
                }
                "browseport" => {
                    config.browse_port = value
                        .parse()
                        .map_err(|_| BridgeError::config(directive, value, "expected a port number"))?;
                }
                "filterdir" if !value.is_empty() => {
                    config.filter_dir = PathBuf::from(value);
                }
                _ => debug!(directive, "unknown directive, ignoring"),
            }
        }

        Ok(config)
    }

    pub fn browse_interval(&self) -> Duration {
        Duration::from_secs(self.browse_interval_secs)
    }

    pub fn browse_timeout(&self) -> Duration {
        Duration::from_secs(self.browse_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn withdraw_grace(&self) -> Duration {
        Duration::from_secs(self.withdraw_grace_secs)
    }

    pub fn auto_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.auto_shutdown_timeout_secs)
    }

    /// True when no discovery or advertisement is configured at all.
    pub fn has_nothing_to_do(&self) -> bool {
        self.browse_local_protocols.is_empty()
            && self.browse_remote_protocols.is_empty()
            && self.browse_poll.is_empty()
    }
}

fn parse_bool(directive: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(BridgeError::config(directive, value, "expected yes or no")),
    }
}

fn parse_secs(directive: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| BridgeError::config(directive, value, "expected a non-negative number of seconds"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn defaults_browse_dnssd_only() {
        let config = DaemonConfig::default();
        assert!(config.browse_remote_protocols.dnssd);
        assert!(!config.browse_remote_protocols.cups);
        assert!(config.browse_local_protocols.is_empty());
        assert_eq!(config.browse_timeout(), Duration::from_secs(300));
        assert!(!config.has_nothing_to_do());
    }

    #[test]
    fn parses_a_full_directive_file() {
        let text = "\
# comment
BrowseRemoteProtocols dnssd,cups
BrowseLocalProtocols cups
BrowsePoll printhost:8631/version=1.1
BrowsePoll otherhost
BrowseAllow 192.168.1.0/24
BrowseAllow 10.0.0.0/255.0.0.0
BrowseAllow 172.16.0.9
CreateIPPPrinterQueues yes
AutoShutdown avahi
AutoShutdownTimeout 15
";
        let config = DaemonConfig::parse_directives(text).unwrap();
        assert!(config.browse_remote_protocols.dnssd && config.browse_remote_protocols.cups);
        assert!(config.browse_local_protocols.cups && !config.browse_local_protocols.dnssd);
        assert_eq!(
            config.browse_poll,
            vec![
                PollPeerConfig {
                    server: "printhost".into(),
                    port: 8631,
                    version: Some((1, 1)),
                },
                PollPeerConfig {
                    server: "otherhost".into(),
                    port: 631,
                    version: None,
                },
            ]
        );
        assert_eq!(config.browse_allow.len(), 3);
        assert!(config.create_ipp_printer_queues);
        assert_eq!(config.auto_shutdown, AutoShutdownMode::FollowBrowser);
        assert_eq!(config.auto_shutdown_timeout_secs, 15);
    }

    #[test]
    fn browse_protocols_none_disables_both_directions() {
        let config = DaemonConfig::parse_directives("BrowseProtocols none").unwrap();
        assert!(config.has_nothing_to_do());
    }

    #[test]
    fn invalid_timeout_is_rejected() {
        let err = DaemonConfig::parse_directives("AutoShutdownTimeout -4").unwrap_err();
        assert!(matches!(err, BridgeError::Config { .. }));
    }

    #[test]
    fn invalid_boolean_is_rejected() {
        assert!(DaemonConfig::parse_directives("CreateIPPPrinterQueues maybe").is_err());
    }

    #[test]
    fn allow_rule_forms() {
        assert_eq!(
            AllowRule::parse("192.168.1.7"),
            AllowRule::Address(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7)))
        );
        assert_eq!(
            AllowRule::parse("192.168.1.0/24"),
            AllowRule::Network {
                addr: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)),
                mask: IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)),
            }
        );
        assert_eq!(
            AllowRule::parse("10.0.0.0/255.0.0.0"),
            AllowRule::Network {
                addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)),
                mask: IpAddr::V4(Ipv4Addr::new(255, 0, 0, 0)),
            }
        );
        assert!(matches!(AllowRule::parse("10.0.0.0/40"), AllowRule::Invalid(_)));
        assert!(matches!(AllowRule::parse("printserver"), AllowRule::Invalid(_)));
    }

    #[test]
    fn allow_rule_ipv6_forms() {
        assert_eq!(
            AllowRule::parse("[2001:db8::7]"),
            AllowRule::Address(IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 7)))
        );
        assert_eq!(
            AllowRule::parse("2001:db8::/32"),
            AllowRule::Network {
                addr: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0)),
                mask: IpAddr::V6(Ipv6Addr::new(0xffff, 0xffff, 0, 0, 0, 0, 0, 0)),
            }
        );
        assert_eq!(
            AllowRule::parse("fe80::/ffc0::"),
            AllowRule::Network {
                addr: IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0)),
                mask: IpAddr::V6(Ipv6Addr::new(0xffc0, 0, 0, 0, 0, 0, 0, 0)),
            }
        );
        assert!(matches!(AllowRule::parse("2001:db8::/129"), AllowRule::Invalid(_)));
        assert!(matches!(AllowRule::parse("10.0.0.0/ffff::"), AllowRule::Invalid(_)));
    }

    #[test]
    fn poll_peer_ignores_unknown_version() {
        let peer = PollPeerConfig::parse("host:abc/version=9.9", 631);
        assert_eq!(peer.server, "host");
        assert_eq!(peer.port, 631);
        assert_eq!(peer.version, None);
    }

    #[test]
    fn auto_shutdown_mode_parsing() {
        assert_eq!("Yes".parse::<AutoShutdownMode>().unwrap(), AutoShutdownMode::On);
        assert_eq!("0".parse::<AutoShutdownMode>().unwrap(), AutoShutdownMode::Off);
        assert_eq!(
            "AVAHI".parse::<AutoShutdownMode>().unwrap(),
            AutoShutdownMode::FollowBrowser
        );
        assert!("sometimes".parse::<AutoShutdownMode>().is_err());
    }

    #[test]
    fn load_reads_json_and_directive_files() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("spoolbridged.json");
        let mut config = DaemonConfig::default();
        config.create_ipp_printer_queues = true;
        std::fs::write(&json_path, config.to_json().unwrap()).unwrap();
        assert!(DaemonConfig::load(&json_path).unwrap().create_ipp_printer_queues);

        let conf_path = dir.path().join("spoolbridged.conf");
        std::fs::write(&conf_path, "BrowseTimeout 120\n").unwrap();
        assert_eq!(DaemonConfig::load(&conf_path).unwrap().browse_timeout_secs, 120);

        let missing = dir.path().join("absent.conf");
        assert_eq!(DaemonConfig::load(&missing).unwrap().browse_timeout_secs, 300);
    }
}
