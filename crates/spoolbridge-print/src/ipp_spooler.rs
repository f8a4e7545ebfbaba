// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The local CUPS-compatible spooler, spoken to over IPP.
//
// Read-only operations go to the server root; queue administration goes to
// `/admin/`.  Every queue we create carries the marker option so that a
// later run can recognise it.

use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use ipp::prelude::*;
use tracing::{debug, info, instrument};

use spoolbridge_core::error::{BridgeError, Result};
use spoolbridge_core::types::{LocalQueue, QueueDriver};

use crate::ipp_client::{
    AttributeValues, IppEndpoint, add_operation, add_printer, first_text, integer, keywords,
    value_text,
};
use crate::provisioner::MARKER_OPTION;
use crate::spooler::{
    EventSubscriptions, NotificationBatch, PrinterAttributes, QueueDefinition, SharedQueue,
    Spooler,
};

/// `printer-state` value for an idle printer.
const PRINTER_STATE_IDLE: i32 = 3;

/// Attributes needed to build advertisement data.
const SHARED_QUEUE_ATTRIBUTES: [&str; 9] = [
    "printer-type",
    "printer-state",
    "printer-uri-supported",
    "printer-info",
    "printer-location",
    "printer-make-and-model",
    "auth-info-required",
    "printer-uuid",
    "job-template",
];

/// Spooler reached through IPP at a base URI such as `ipp://localhost:631`.
#[derive(Debug, Clone)]
pub struct IppSpooler {
    root: IppEndpoint,
    admin: IppEndpoint,
}

impl IppSpooler {
    pub fn new(base_uri: &str) -> Result<Self> {
        let root = IppEndpoint::new(base_uri)?.at_path("/")?;
        let admin = root.at_path("/admin/")?;
        Ok(Self { root, admin })
    }

    /// `printer-uri` of a local queue.
    fn queue_uri(&self, name: &str) -> String {
        let authority = self
            .root
            .uri()
            .authority()
            .map_or("localhost", |a| a.as_str());
        format!("ipp://{authority}/printers/{name}")
    }

    fn marker_attribute() -> String {
        format!("{MARKER_OPTION}-default")
    }
}

#[async_trait]
impl EventSubscriptions for IppSpooler {
    async fn create_subscription(&self, lease: Duration) -> Result<i32> {
        self.root.create_subscription(lease).await
    }

    async fn get_notifications(
        &self,
        subscription_id: i32,
        first_sequence: i32,
    ) -> Result<NotificationBatch> {
        self.root.get_notifications(subscription_id, first_sequence).await
    }

    async fn cancel_subscription(&self, subscription_id: i32) -> Result<()> {
        self.root.cancel_subscription(subscription_id).await
    }
}

#[async_trait]
impl Spooler for IppSpooler {
    async fn list_queues(&self) -> Result<Vec<LocalQueue>> {
        let marker = Self::marker_attribute();
        let printers = self
            .root
            .cups_get_printers(None, &["printer-name", "device-uri", marker.as_str()])
            .await
            .map_err(spooler_unavailable)?;
        Ok(printers
            .iter()
            .filter_map(|values| local_queue(values, &marker))
            .collect())
    }

    async fn list_shared_queues(&self) -> Result<Vec<SharedQueue>> {
        let printers = self
            .root
            .cups_get_printers(None, &SHARED_QUEUE_ATTRIBUTES)
            .await
            .map_err(spooler_unavailable)?;
        Ok(printers.iter().filter_map(shared_queue).collect())
    }

    #[instrument(skip_all, fields(name = %definition.name, uri = %definition.device_uri))]
    async fn create_or_modify_queue(&self, definition: &QueueDefinition) -> Result<()> {
        let target = self.queue_uri(&definition.name);
        let mut request = self.admin.request(Operation::CupsAddModifyPrinter, Some(&target))?;

        add_printer(&mut request, "device-uri", IppValue::Uri(definition.device_uri.clone()));
        add_printer(
            &mut request,
            "printer-info",
            IppValue::TextWithoutLanguage(definition.info.clone()),
        );
        add_printer(
            &mut request,
            "printer-location",
            IppValue::TextWithoutLanguage(definition.location.clone()),
        );
        add_printer(
            &mut request,
            &Self::marker_attribute(),
            IppValue::NameWithoutLanguage("true".into()),
        );
        add_printer(&mut request, "printer-is-shared", IppValue::Boolean(false));
        add_printer(&mut request, "printer-state", IppValue::Enum(PRINTER_STATE_IDLE));
        add_printer(&mut request, "printer-is-accepting-jobs", IppValue::Boolean(true));

        match &definition.driver {
            None => {}
            Some(QueueDriver::Model(model)) => {
                add_operation(&mut request, "ppd-name", IppValue::NameWithoutLanguage(model.clone()));
            }
            Some(QueueDriver::Script(path)) | Some(QueueDriver::Descriptor(path)) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    BridgeError::Provisioning(format!("cannot read {}: {e}", path.display()))
                })?;
                *request.payload_mut() = IppPayload::new(Cursor::new(bytes));
            }
        }

        self.admin.send("CUPS-Add-Modify-Printer", request).await?;
        info!("queue created or modified");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_queue(&self, name: &str) -> Result<()> {
        let target = self.queue_uri(name);
        let request = self.admin.request(Operation::CupsDeletePrinter, Some(&target))?;
        let response = self.admin.send_raw("CUPS-Delete-Printer", request).await?;
        let code = response.header().status_code();
        if code == StatusCode::ClientErrorNotFound {
            debug!("queue already gone");
            return Ok(());
        }
        if !code.is_success() {
            return Err(BridgeError::SpoolerRequest(format!(
                "CUPS-Delete-Printer({name}) returned status {code:?}"
            )));
        }
        info!("queue deleted");
        Ok(())
    }

    async fn active_jobs(&self, name: &str) -> Result<usize> {
        let target = self.queue_uri(name);
        let mut request = self.root.request(Operation::GetJobs, Some(&target))?;
        add_operation(&mut request, "which-jobs", IppValue::Keyword("not-completed".into()));
        add_operation(&mut request, "requested-attributes", keywords(&["job-id"]));

        let response = self.root.send("Get-Jobs", request).await?;
        Ok(response
            .attributes()
            .groups_of(DelimiterTag::JobAttributes)
            .count())
    }

    async fn default_queue(&self) -> Result<Option<String>> {
        let mut request = self.root.request(Operation::CupsGetDefault, None)?;
        add_operation(&mut request, "requested-attributes", keywords(&["printer-name"]));

        let response = self.root.send_raw("CUPS-Get-Default", request).await?;
        let code = response.header().status_code();
        if code == StatusCode::ClientErrorNotFound {
            return Ok(None);
        }
        if !code.is_success() {
            return Err(BridgeError::SpoolerRequest(format!(
                "CUPS-Get-Default returned status {code:?}"
            )));
        }
        Ok(response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
            .find_map(|group| group.attributes().get("printer-name"))
            .map(|attr| value_text(attr.value())))
    }

    async fn printer_capabilities(&self, uri: &str) -> Result<PrinterAttributes> {
        IppEndpoint::new(uri)?.get_printer_attributes().await
    }
}

/// A failed listing means the spooler itself cannot be reached.
fn spooler_unavailable(err: BridgeError) -> BridgeError {
    match err {
        BridgeError::IppRequest(detail) => BridgeError::SpoolerUnavailable(detail),
        other => other,
    }
}

fn local_queue(values: &AttributeValues, marker: &str) -> Option<LocalQueue> {
    let name = first_text(values, "printer-name")?;
    Some(LocalQueue {
        name,
        device_uri: first_text(values, "device-uri"),
        owned_by_us: first_text(values, marker).is_some_and(|v| v.eq_ignore_ascii_case("true")),
    })
}

/// Advertisement metadata of one queue. Queues missing any of the display
/// fields are skipped.
fn shared_queue(values: &AttributeValues) -> Option<SharedQueue> {
    let printer_type = u32::try_from(integer(values, "printer-type")?).ok()?;
    let state = u32::try_from(integer(values, "printer-state")?).ok()?;

    let job_sheets = match values.get("job-sheets-default") {
        Some(IppValue::Array(items)) if items.len() == 2 => {
            Some((value_text(&items[0]), value_text(&items[1])))
        }
        _ => None,
    };

    let mut defaults: Vec<(String, String)> = values
        .iter()
        .filter(|(name, _)| name.as_str() != "job-sheets-default")
        .filter_map(|(name, value)| {
            let option = name.strip_suffix("-default")?;
            let text = match value {
                IppValue::Array(items) => items.first().and_then(default_text)?,
                value => default_text(value)?,
            };
            Some((option.to_owned(), text))
        })
        .collect();
    defaults.sort();

    Some(SharedQueue {
        printer_type,
        state,
        uri: first_text(values, "printer-uri-supported")?,
        location: first_text(values, "printer-location")?,
        info: first_text(values, "printer-info")?,
        make_model: first_text(values, "printer-make-and-model")?,
        auth_info_required: first_text(values, "auth-info-required"),
        uuid: first_text(values, "printer-uuid"),
        job_sheets,
        defaults,
    })
}

/// Only keyword, string and name defaults are advertised.
fn default_text(value: &IppValue) -> Option<String> {
    match value {
        IppValue::Keyword(s) | IppValue::OctetString(s) | IppValue::NameWithoutLanguage(s) => {
            Some(s.clone())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: Vec<(&str, IppValue)>) -> AttributeValues {
        pairs.into_iter().map(|(k, v)| (k.to_owned(), v)).collect()
    }

    fn shared_values() -> AttributeValues {
        values(vec![
            ("printer-type", IppValue::Enum(0x801c)),
            ("printer-state", IppValue::Enum(3)),
            ("printer-uri-supported", IppValue::Uri("ipp://localhost:631/printers/Lab".into())),
            ("printer-info", IppValue::TextWithoutLanguage("Lab".into())),
            ("printer-location", IppValue::TextWithoutLanguage("Room 2".into())),
            ("printer-make-and-model", IppValue::TextWithoutLanguage("Acme Laser".into())),
            ("auth-info-required", IppValue::Keyword("none".into())),
            ("printer-uuid", IppValue::Uri("urn:uuid:42".into())),
            (
                "job-sheets-default",
                IppValue::Array(vec![
                    IppValue::NameWithoutLanguage("none".into()),
                    IppValue::NameWithoutLanguage("none".into()),
                ]),
            ),
            ("media-default", IppValue::Keyword("iso_a4_210x297mm".into())),
            ("copies-default", IppValue::Integer(1)),
        ])
    }

    #[test]
    fn spooler_paths() {
        let spooler = IppSpooler::new("ipp://localhost:631").unwrap();
        assert_eq!(spooler.admin.uri().path(), "/admin/");
        assert_eq!(spooler.queue_uri("Lab"), "ipp://localhost:631/printers/Lab");
    }

    #[test]
    fn marker_marks_our_queues() {
        let marker = IppSpooler::marker_attribute();
        assert_eq!(marker, "spoolbridge-default");

        let ours = values(vec![
            ("printer-name", IppValue::NameWithoutLanguage("Lab".into())),
            ("device-uri", IppValue::Uri("ipp://lab:631/printers/Lab".into())),
            (marker.as_str(), IppValue::NameWithoutLanguage("true".into())),
        ]);
        let queue = local_queue(&ours, &marker).unwrap();
        assert!(queue.owned_by_us);
        assert_eq!(queue.device_uri.as_deref(), Some("ipp://lab:631/printers/Lab"));

        let foreign = values(vec![("printer-name", IppValue::NameWithoutLanguage("USB".into()))]);
        assert!(!local_queue(&foreign, &marker).unwrap().owned_by_us);
    }

    #[test]
    fn shared_queue_collects_string_defaults() {
        let queue = shared_queue(&shared_values()).unwrap();
        assert_eq!(queue.printer_type, 0x801c);
        assert_eq!(queue.job_sheets, Some(("none".into(), "none".into())));
        assert_eq!(queue.uuid.as_deref(), Some("urn:uuid:42"));
        assert_eq!(
            queue.defaults,
            vec![("media".to_owned(), "iso_a4_210x297mm".to_owned())]
        );
    }

    #[test]
    fn shared_queue_needs_display_fields() {
        let mut incomplete = shared_values();
        incomplete.remove("printer-make-and-model");
        assert!(shared_queue(&incomplete).is_none());
    }

    #[test]
    fn listing_failures_mean_unavailable() {
        let err = spooler_unavailable(BridgeError::IppRequest("connection refused".into()));
        assert!(matches!(err, BridgeError::SpoolerUnavailable(_)));
    }
}
