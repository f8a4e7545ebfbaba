// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Legacy UDP browse protocol codec.
//
// A packet is one line:
//
//   type state uri "location" "info" "make-and-model" lease-duration=N [opt=value ...]
//
// `type` and `state` are hex. Option values escape space, quotes and
// backslash with a preceding backslash.

use spoolbridge_core::error::{BridgeError, Result};
use spoolbridge_core::types::{DiscoverySource, QueueSighting, printer_type};

/// Largest datagram either side accepts; packets this long or longer are
/// not sent.
pub const MAX_PACKET: usize = 2048;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrowsePacket {
    pub printer_type: u32,
    pub state: u32,
    pub uri: String,
    pub location: String,
    pub info: String,
    pub make_model: String,
    pub lease_duration: Option<u64>,
    pub options: Vec<(String, String)>,
}

impl BrowsePacket {
    /// Parse a received packet. Extra fields after the URI are optional,
    /// but an unterminated quoted field rejects the whole packet.
    pub fn parse(packet: &str) -> Result<Self> {
        let packet = packet.trim_end_matches('\0');
        let mut rest = packet;

        let printer_type = next_token(&mut rest)
            .and_then(|t| u32::from_str_radix(t, 16).ok())
            .ok_or_else(|| BridgeError::BrowsePacket("missing or invalid type".into()))?;
        let state = next_token(&mut rest)
            .and_then(|t| u32::from_str_radix(t, 16).ok())
            .ok_or_else(|| BridgeError::BrowsePacket("missing or invalid state".into()))?;
        let uri = next_token(&mut rest)
            .ok_or_else(|| BridgeError::BrowsePacket("missing uri".into()))?
            .to_owned();

        let mut quoted = Vec::with_capacity(3);
        while quoted.len() < 3 {
            rest = rest.trim_start();
            let Some(body) = rest.strip_prefix('"') else {
                break;
            };
            let end = body
                .find('"')
                .ok_or_else(|| BridgeError::BrowsePacket("unterminated quoted field".into()))?;
            quoted.push(body[..end].to_owned());
            rest = &body[end + 1..];
        }
        let mut quoted = quoted.into_iter();

        let mut parsed = Self {
            printer_type,
            state,
            uri,
            location: quoted.next().unwrap_or_default(),
            info: quoted.next().unwrap_or_default(),
            make_model: quoted.next().unwrap_or_default(),
            ..Default::default()
        };

        for token in split_escaped(rest) {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            if key == "lease-duration" {
                parsed.lease_duration = value.parse().ok();
            } else {
                parsed.options.push((key.to_owned(), value.to_owned()));
            }
        }
        Ok(parsed)
    }

    /// Serialize for sending. Fails when the result would not fit in one
    /// datagram.
    pub fn encode(&self) -> Result<String> {
        let mut line = format!(
            "{:x} {:x} {} \"{}\" \"{}\" \"{}\"",
            self.printer_type,
            self.state,
            self.uri,
            strip_quotes(&self.location),
            strip_quotes(&self.info),
            strip_quotes(&self.make_model),
        );
        if let Some(lease) = self.lease_duration {
            line.push_str(&format!(" lease-duration={lease}"));
        }
        for (key, value) in &self.options {
            line.push(' ');
            line.push_str(key);
            line.push('=');
            line.push_str(&escape_value(value));
        }
        line.push('\n');

        if line.len() >= MAX_PACKET {
            return Err(BridgeError::BrowsePacket(format!(
                "oversize packet ({} bytes) for {}",
                line.len(),
                self.uri
            )));
        }
        Ok(line)
    }

    /// Deletion notices are not acted on; the entry expires by lease.
    pub fn is_delete(&self) -> bool {
        self.printer_type & printer_type::DELETE != 0
    }

    pub fn to_sighting(&self) -> QueueSighting {
        QueueSighting {
            source: DiscoverySource::LegacyBroadcast,
            uri: self.uri.clone(),
            info: self.info.clone(),
        }
    }
}

/// Backslash-escape space, quotes and backslash.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, ' ' | '"' | '\'' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn strip_quotes(value: &str) -> String {
    value.chars().filter(|c| *c != '"').collect()
}

fn next_token<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (token, tail) = trimmed.split_at(end);
    *rest = tail;
    Some(token)
}

/// Split on unescaped whitespace, resolving backslash escapes.
fn split_escaped(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
