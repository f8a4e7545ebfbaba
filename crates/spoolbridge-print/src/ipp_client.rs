// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Async IPP endpoint used for the local spooler and the BrowsePoll peers.
//
// Uses the `ipp` crate's async API to send:
//   - Get-Printer-Attributes        (RFC 8011 §4.2.5)
//   - CUPS-Get-Printers             (CUPS extension)
//   - Create-Printer-Subscriptions  (RFC 3995 §11.1.2)
//   - Get-Notifications             (RFC 3996 §5)
//   - Cancel-Subscription           (RFC 3995 §11.2.7)

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ipp::prelude::*;
use tracing::{debug, error, info, instrument};

use spoolbridge_core::config::PollPeerConfig;
use spoolbridge_core::error::{BridgeError, Result};
use spoolbridge_core::types::printer_type;

use crate::browse_poll::{PollTransport, PolledPrinter};
use crate::spooler::{EventSubscriptions, NotificationBatch, PrinterAttributes};

/// Printer events a change subscription asks for.
pub const PRINTER_EVENTS: [&str; 6] = [
    "printer-added",
    "printer-changed",
    "printer-config-changed",
    "printer-modified",
    "printer-deleted",
    "printer-state-changed",
];

/// Attribute values of one printer group, keyed by attribute name.
pub type AttributeValues = HashMap<String, IppValue>;

/// Printer-type filter for CUPS-Get-Printers: printers whose type, masked
/// with `mask`, equals `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeFilter {
    pub mask: u32,
    pub value: u32,
}

impl TypeFilter {
    /// Local, shared, non-implicit printers only.
    pub fn shared_local() -> Self {
        Self {
            mask: printer_type::REMOTE | printer_type::IMPLICIT | printer_type::NOT_SHARED,
            value: 0,
        }
    }
}

/// One IPP server (or printer) reachable at a fixed URI.
#[derive(Debug, Clone)]
pub struct IppEndpoint {
    uri: Uri,
    version: IppVersion,
}

impl IppEndpoint {
    /// Create an endpoint for an `ipp://` or `ipps://` URI.
    pub fn new(uri: &str) -> Result<Self> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| BridgeError::IppRequest(format!("invalid URI '{uri}': {e}")))?;
        Ok(Self {
            uri: parsed,
            version: IppVersion::v1_1(),
        })
    }

    /// Endpoint for a configured BrowsePoll peer.
    pub fn for_peer(peer: &PollPeerConfig) -> Result<Self> {
        let endpoint = Self::new(&format!("ipp://{}:{}/", peer.server, peer.port))?;
        Ok(match peer.version {
            Some(version) => endpoint.with_version(version),
            None => endpoint,
        })
    }

    /// Force the IPP version sent in requests. Unknown pairs keep 1.1.
    pub fn with_version(mut self, (major, minor): (u8, u8)) -> Self {
        self.version = match (major, minor) {
            (1, 0) => IppVersion::v1_0(),
            (2, 0) => IppVersion::v2_0(),
            (2, 1) => IppVersion::v2_1(),
            (2, 2) => IppVersion::v2_2(),
            _ => IppVersion::v1_1(),
        };
        self
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The same server with a different resource path, e.g. `/admin/`.
    pub fn at_path(&self, path: &str) -> Result<Self> {
        let scheme = self.uri.scheme_str().unwrap_or("ipp");
        let authority = self.uri.authority().map_or("localhost", |a| a.as_str());
        let mut endpoint = Self::new(&format!("{scheme}://{authority}{path}"))?;
        endpoint.version = self.version;
        Ok(endpoint)
    }

    /// A new request for `operation`, optionally targeting `printer_uri`.
    pub fn request(&self, operation: Operation, printer_uri: Option<&str>) -> Result<IppRequestResponse> {
        let target = match printer_uri {
            Some(uri) => Some(
                uri.parse::<Uri>()
                    .map_err(|e| BridgeError::IppRequest(format!("invalid URI '{uri}': {e}")))?,
            ),
            None => None,
        };
        Ok(IppRequestResponse::new(self.version, operation, target))
    }

    /// Send a request and return the response whatever its status.
    pub async fn send_raw(&self, name: &str, request: IppRequestResponse) -> Result<IppRequestResponse> {
        let client = AsyncIppClient::new(self.uri.clone());
        debug!(uri = %self.uri, operation = name, "sending IPP request");
        client
            .send(request)
            .await
            .map_err(|e| BridgeError::IppRequest(format!("{name}: {e}")))
    }

    /// Send a request and fail on any non-success status.
    pub async fn send(&self, name: &str, request: IppRequestResponse) -> Result<IppRequestResponse> {
        let response = self.send_raw(name, request).await?;
        let code = response.header().status_code();
        if !code.is_success() {
            error!(uri = %self.uri, operation = name, status = ?code, "IPP request failed");
            return Err(BridgeError::SpoolerRequest(format!(
                "{name} returned status {code:?}"
            )));
        }
        Ok(response)
    }

    /// Query the printer for its capabilities and current state.
    ///
    /// Sends a Get-Printer-Attributes operation and returns the response as a
    /// flat map of attribute names to their string representations.
    #[instrument(skip(self), fields(uri = %self.uri))]
    pub async fn get_printer_attributes(&self) -> Result<PrinterAttributes> {
        let operation = IppOperationBuilder::get_printer_attributes(self.uri.clone()).build();
        let client = AsyncIppClient::new(self.uri.clone());

        debug!("sending Get-Printer-Attributes");
        let response = client
            .send(operation)
            .await
            .map_err(|e| BridgeError::IppRequest(format!("Get-Printer-Attributes: {e}")))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Get-Printer-Attributes failed");
            return Err(BridgeError::SpoolerRequest(format!(
                "Get-Printer-Attributes returned status {code:?}"
            )));
        }

        let attrs = flatten_attributes(response.attributes());
        debug!(count = attrs.len(), "received printer attributes");
        Ok(attrs)
    }

    /// CUPS-Get-Printers: one value map per printer.
    #[instrument(skip(self, requested), fields(uri = %self.uri))]
    pub async fn cups_get_printers(
        &self,
        filter: Option<TypeFilter>,
        requested: &[&str],
    ) -> Result<Vec<AttributeValues>> {
        let mut request = self.request(Operation::CupsGetPrinters, None)?;
        add_operation(&mut request, "requested-attributes", keywords(requested));
        if let Some(filter) = filter {
            add_operation(&mut request, "printer-type-mask", IppValue::Enum(filter.mask as i32));
            add_operation(&mut request, "printer-type", IppValue::Enum(filter.value as i32));
        }

        let response = self.send("CUPS-Get-Printers", request).await?;
        let printers: Vec<AttributeValues> = response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
            .map(|group| {
                group
                    .attributes()
                    .iter()
                    .map(|(name, attr)| (name.clone(), attr.value().clone()))
                    .collect()
            })
            .collect();
        debug!(count = printers.len(), "received printer list");
        Ok(printers)
    }
}

#[async_trait]
impl EventSubscriptions for IppEndpoint {
    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn create_subscription(&self, lease: Duration) -> Result<i32> {
        let target = self.uri.to_string();
        let mut request = self.request(Operation::CreatePrinterSubscriptions, Some(&target))?;
        let interval = i32::try_from(lease.as_secs()).unwrap_or(i32::MAX);
        add_subscription(&mut request, "notify-pull-method", IppValue::Keyword("ippget".into()));
        add_subscription(&mut request, "notify-charset", IppValue::Charset("utf-8".into()));
        add_subscription(&mut request, "notify-events", keywords(&PRINTER_EVENTS));
        add_subscription(&mut request, "notify-time-interval", IppValue::Integer(interval));
        add_subscription(&mut request, "notify-lease-duration", IppValue::Integer(interval));

        let response = self
            .send("Create-Printer-Subscriptions", request)
            .await
            .map_err(|e| BridgeError::Subscription(e.to_string()))?;

        let id = find_integer(response.attributes(), "notify-subscription-id").ok_or_else(|| {
            BridgeError::Subscription("response carries no notify-subscription-id".into())
        })?;
        info!(subscription_id = id, "created printer subscription");
        Ok(id)
    }

    async fn get_notifications(
        &self,
        subscription_id: i32,
        first_sequence: i32,
    ) -> Result<NotificationBatch> {
        let target = self.uri.to_string();
        let mut request = self.request(Operation::GetNotifications, Some(&target))?;
        add_operation(&mut request, "notify-subscription-ids", IppValue::Integer(subscription_id));
        add_operation(&mut request, "notify-sequence-numbers", IppValue::Integer(first_sequence));
        add_operation(&mut request, "notify-wait", IppValue::Boolean(false));

        let response = self.send_raw("Get-Notifications", request).await?;
        let code = response.header().status_code();
        if code == StatusCode::ClientErrorNotFound {
            return Err(BridgeError::SubscriptionNotFound(subscription_id));
        }
        if !code.is_success() {
            return Err(BridgeError::Subscription(format!(
                "Get-Notifications({subscription_id}) returned status {code:?}"
            )));
        }

        let mut batch = NotificationBatch::default();
        for group in response
            .attributes()
            .groups_of(DelimiterTag::EventNotificationAttributes)
        {
            batch.events += 1;
            if let Some(IppValue::Integer(seq)) = group
                .attributes()
                .get("notify-sequence-number")
                .map(|a| a.value())
            {
                batch.last_sequence = Some(batch.last_sequence.map_or(*seq, |s| s.max(*seq)));
            }
        }
        Ok(batch)
    }

    async fn cancel_subscription(&self, subscription_id: i32) -> Result<()> {
        let target = self.uri.to_string();
        let mut request = self.request(Operation::CancelSubscription, Some(&target))?;
        add_operation(&mut request, "notify-subscription-id", IppValue::Integer(subscription_id));

        let response = self.send_raw("Cancel-Subscription", request).await?;
        let code = response.header().status_code();
        if code.is_success() || code == StatusCode::ClientErrorNotFound {
            Ok(())
        } else {
            Err(BridgeError::Subscription(format!(
                "Cancel-Subscription({subscription_id}) returned status {code:?}"
            )))
        }
    }
}

#[async_trait]
impl PollTransport for IppEndpoint {
    async fn shared_printers(&self) -> Result<Vec<PolledPrinter>> {
        let printers = self
            .cups_get_printers(
                Some(TypeFilter::shared_local()),
                &["printer-uri-supported", "printer-info"],
            )
            .await?;
        Ok(printers.iter().filter_map(polled_printer).collect())
    }
}

// ---------------------------------------------------------------------------
// Helper functions for building requests and parsing responses
// ---------------------------------------------------------------------------

pub fn add_operation(request: &mut IppRequestResponse, name: &str, value: IppValue) {
    request
        .attributes_mut()
        .add(DelimiterTag::OperationAttributes, IppAttribute::new(name, value));
}

pub fn add_printer(request: &mut IppRequestResponse, name: &str, value: IppValue) {
    request
        .attributes_mut()
        .add(DelimiterTag::PrinterAttributes, IppAttribute::new(name, value));
}

fn add_subscription(request: &mut IppRequestResponse, name: &str, value: IppValue) {
    request
        .attributes_mut()
        .add(DelimiterTag::SubscriptionAttributes, IppAttribute::new(name, value));
}

pub fn keywords(values: &[&str]) -> IppValue {
    IppValue::Array(
        values
            .iter()
            .map(|v| IppValue::Keyword((*v).to_owned()))
            .collect(),
    )
}

/// Display form of a value. Multi-valued attributes are joined with `", "`.
pub fn value_text(value: &IppValue) -> String {
    match value {
        IppValue::Keyword(s)
        | IppValue::TextWithoutLanguage(s)
        | IppValue::NameWithoutLanguage(s)
        | IppValue::Uri(s)
        | IppValue::MimeMediaType(s)
        | IppValue::Charset(s)
        | IppValue::NaturalLanguage(s)
        | IppValue::OctetString(s) => s.clone(),
        IppValue::Integer(i) | IppValue::Enum(i) => i.to_string(),
        IppValue::Boolean(b) => b.to_string(),
        IppValue::Array(values) => values.iter().map(value_text).collect::<Vec<_>>().join(", "),
        other => format!("{other}"),
    }
}

/// First string of a possibly multi-valued attribute.
pub fn first_text(values: &AttributeValues, name: &str) -> Option<String> {
    match values.get(name)? {
        IppValue::Array(items) => items.first().map(value_text),
        value => Some(value_text(value)),
    }
}

pub fn integer(values: &AttributeValues, name: &str) -> Option<i32> {
    match values.get(name)? {
        IppValue::Integer(i) | IppValue::Enum(i) => Some(*i),
        _ => None,
    }
}

/// Flatten all attribute groups in an IPP response into a single map.
fn flatten_attributes(attrs: &IppAttributes) -> PrinterAttributes {
    let mut map = HashMap::new();
    for group in attrs.groups() {
        for (name, attr) in group.attributes() {
            map.insert(name.clone(), value_text(attr.value()));
        }
    }
    map
}

fn find_integer(attrs: &IppAttributes, name: &str) -> Option<i32> {
    attrs.groups().iter().find_map(|group| {
        match group.attributes().get(name).map(|a| a.value()) {
            Some(IppValue::Integer(i)) => Some(*i),
            _ => None,
        }
    })
}

fn polled_printer(values: &AttributeValues) -> Option<PolledPrinter> {
    let uri = first_text(values, "printer-uri-supported")?;
    Some(PolledPrinter {
        uri,
        info: first_text(values, "printer-info").unwrap_or_default(),
    })
}
