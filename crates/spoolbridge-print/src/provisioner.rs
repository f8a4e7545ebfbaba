// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Queue provisioner: turns a registry entry into a local spooler queue.
//
// Remote spooler queues become raw queues so the remote side's driver does
// the rendering.  Native network printers get a driver: first the
// descriptor synthesizer is asked (IPP Everywhere printers map onto the
// spooler's built-in `everywhere` model), and failing that an interface
// script is written that pipes jobs through a generic format-converting
// filter with the printer's PDL and model baked in.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use spoolbridge_core::error::{BridgeError, Result};
use spoolbridge_core::sanitize::{SanitizeMode, sanitize};
use spoolbridge_core::types::QueueDriver;

use crate::capabilities::PrinterCapabilities;
use crate::registry::{PrinterOrigin, RemotePrinter};
use crate::spooler::{QueueDefinition, Spooler};

/// Marker option stored on every queue we create. The spooler reports it
/// back as the `spoolbridge-default` attribute.
pub const MARKER_OPTION: &str = "spoolbridge";

/// Generic filter the interface script hands jobs to.
pub const CONVERTING_FILTER: &str = "pdftoippprinter";

/// Produces a driver for a native network printer from its capabilities.
pub trait DescriptorSynthesizer: Send + Sync {
    fn synthesize(&self, queue_name: &str, caps: &PrinterCapabilities) -> Result<QueueDriver>;
}

/// Uses the spooler's built-in IPP Everywhere model when the printer
/// qualifies.
#[derive(Debug, Default, Clone, Copy)]
pub struct EverywhereModel;

impl DescriptorSynthesizer for EverywhereModel {
    fn synthesize(&self, queue_name: &str, caps: &PrinterCapabilities) -> Result<QueueDriver> {
        if caps.is_ipp_everywhere() {
            Ok(QueueDriver::Model("everywhere".into()))
        } else {
            Err(BridgeError::DescriptorUnavailable(format!(
                "{queue_name} is not an IPP Everywhere printer"
            )))
        }
    }
}

/// Builds queue definitions and issues the create-or-modify call.
pub struct Provisioner {
    filter_dir: PathBuf,
    script_dir: PathBuf,
    synthesizer: Box<dyn DescriptorSynthesizer>,
}

impl Provisioner {
    pub fn new(filter_dir: impl Into<PathBuf>) -> Self {
        Self {
            filter_dir: filter_dir.into(),
            script_dir: std::env::temp_dir(),
            synthesizer: Box::new(EverywhereModel),
        }
    }

    /// Write interface scripts into `dir` instead of the system temp dir.
    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    pub fn with_synthesizer(mut self, synthesizer: Box<dyn DescriptorSynthesizer>) -> Self {
        self.synthesizer = synthesizer;
        self
    }

    /// The spooler-facing definition of an entry's queue.
    pub fn definition(entry: &RemotePrinter) -> QueueDefinition {
        QueueDefinition {
            name: entry.name.clone(),
            device_uri: entry.uri.clone(),
            info: entry.service.name.clone(),
            location: entry.host.clone(),
            driver: entry.driver.clone(),
        }
    }

    /// Create or modify the entry's local queue.
    ///
    /// On failure the entry keeps whatever driver was prepared so the next
    /// attempt can reuse it.  On success generated files are deleted.
    #[instrument(skip_all, fields(name = %entry.name, uri = %entry.uri))]
    pub async fn provision<S>(&self, entry: &mut RemotePrinter, spooler: &S) -> Result<()>
    where
        S: Spooler + ?Sized,
    {
        if entry.driver.is_none() {
            if let PrinterOrigin::NetworkPrinter { pdl, make_model } = &entry.origin {
                let driver = self
                    .driverless(&entry.name, &entry.uri, pdl, make_model, spooler)
                    .await?;
                entry.driver = Some(driver);
            }
        }

        let definition = Self::definition(entry);
        spooler.create_or_modify_queue(&definition).await?;
        info!(driver = ?definition.driver, "local queue created/modified");

        release_driver(entry);
        Ok(())
    }

    async fn driverless<S>(
        &self,
        name: &str,
        uri: &str,
        pdl: &str,
        make_model: &str,
        spooler: &S,
    ) -> Result<QueueDriver>
    where
        S: Spooler + ?Sized,
    {
        let mut model = make_model.to_owned();
        match spooler.printer_capabilities(uri).await {
            Ok(attrs) => {
                let caps = PrinterCapabilities::from_attributes(&attrs);
                match self.synthesizer.synthesize(name, &caps) {
                    Ok(driver) => return Ok(driver),
                    Err(e) => debug!(error = %e, "no driver descriptor, using interface script"),
                }
                if model.is_empty() {
                    if let Some(m) = &caps.make_and_model {
                        model = sanitize(m, SanitizeMode::Name);
                    }
                }
            }
            Err(e) => debug!(error = %e, "capability query failed, using interface script"),
        }
        self.write_script(name, pdl, &model)
    }

    fn write_script(&self, name: &str, pdl: &str, make_model: &str) -> Result<QueueDriver> {
        let script = interface_script(name, pdl, make_model, &self.filter_dir);

        let mut file = tempfile::Builder::new()
            .prefix("spoolbridge-")
            .suffix(".sh")
            .tempfile_in(&self.script_dir)
            .map_err(|e| BridgeError::Provisioning(format!("cannot create interface script: {e}")))?;
        file.write_all(script.as_bytes())
            .map_err(|e| BridgeError::Provisioning(format!("cannot write interface script: {e}")))?;
        let path = file
            .into_temp_path()
            .keep()
            .map_err(|e| BridgeError::Provisioning(format!("cannot keep interface script: {e}")))?;

        debug!(path = %path.display(), "interface script written");
        Ok(QueueDriver::Script(path))
    }
}

/// Delete generated driver files once the spooler has consumed them or the
/// entry no longer needs them.
pub(crate) fn release_driver(entry: &mut RemotePrinter) {
    match entry.driver.take() {
        Some(QueueDriver::Descriptor(path)) | Some(QueueDriver::Script(path)) => {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "cannot remove consumed driver file");
            }
        }
        // Model references cost nothing to keep.
        Some(model @ QueueDriver::Model(_)) => entry.driver = Some(model),
        None => {}
    }
}

/// Text of the System V style interface script for a driverless queue.
///
/// `pdl` and `make_model` must already be sanitized; they are embedded in a
/// double-quoted shell string.
pub fn interface_script(name: &str, pdl: &str, make_model: &str, filter_dir: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         # Interface script generated by spoolbridged for {name}\n\
         if [ $# -lt 5 -o $# -gt 6 ]; then\n\
         \x20 echo \"ERROR: $0 job-id user title copies options [file]\" >&2\n\
         \x20 exit 1\n\
         fi\n\
         if [ $# = 6 ]; then\n\
         \x20 exec \"$0\" \"$1\" \"$2\" \"$3\" \"$4\" \"$5\" < \"$6\"\n\
         fi\n\
         extra_options=\"output-format={pdl} make-and-model={make_model}\"\n\
         {filter} \"$1\" \"$2\" \"$3\" \"$4\" \"$5 $extra_options\"\n",
        filter = filter_dir.join(CONVERTING_FILTER).display(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;

    use spoolbridge_core::types::ServiceIdentity;

    use crate::memory::{InstalledDriver, MemorySpooler};

    fn network_printer(now: Instant) -> RemotePrinter {
        RemotePrinter::new(
            "printer",
            "ipp://192.0.2.5:631/ipp/print",
            "192.0.2.5",
            ServiceIdentity::new("Acme Jet", "_ipp._tcp", "local"),
            PrinterOrigin::NetworkPrinter {
                pdl: "application/pdf".into(),
                make_model: "Acme-Jet".into(),
            },
            now,
        )
    }

    #[test]
    fn script_bakes_in_pdl_model_and_filter() {
        let script = interface_script(
            "printer",
            "application/pdf",
            "Acme-Jet",
            Path::new("/usr/lib/cups/filter"),
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("extra_options=\"output-format=application/pdf make-and-model=Acme-Jet\""));
        assert!(script.contains("/usr/lib/cups/filter/pdftoippprinter \"$1\""));
        assert!(script.contains("  exit 1\n"));
    }

    #[test]
    fn definition_carries_identity() {
        let entry = network_printer(Instant::now());
        let def = Provisioner::definition(&entry);
        assert_eq!(def.name, "printer");
        assert_eq!(def.info, "Acme Jet");
        assert_eq!(def.location, "192.0.2.5");
        assert_eq!(def.driver, None);
    }

    #[tokio::test]
    async fn remote_queue_is_created_raw() {
        let spooler = MemorySpooler::new();
        let mut entry = RemotePrinter::new(
            "Office",
            "ipp://alpha:631/printers/Office",
            "alpha",
            ServiceIdentity::new("Office", "_ipp._tcp", "local"),
            PrinterOrigin::RemoteQueue,
            Instant::now(),
        );
        Provisioner::new("/usr/lib/cups/filter")
            .provision(&mut entry, &spooler)
            .await
            .unwrap();
        let queue = spooler.queue("Office").unwrap();
        assert_eq!(queue.driver, None);
        assert_eq!(queue.device_uri, "ipp://alpha:631/printers/Office");
    }

    #[tokio::test]
    async fn unreachable_printer_falls_back_to_script_and_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        let mut entry = network_printer(Instant::now());

        Provisioner::new("/usr/lib/cups/filter")
            .with_script_dir(dir.path())
            .provision(&mut entry, &spooler)
            .await
            .unwrap();

        match spooler.queue("printer").unwrap().driver {
            Some(InstalledDriver::Script(text)) => {
                assert!(text.contains("output-format=application/pdf"));
            }
            other => panic!("expected an interface script, got {other:?}"),
        }
        assert_eq!(entry.driver, None);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn everywhere_printer_uses_the_builtin_model() {
        let spooler = MemorySpooler::new();
        let mut attrs = HashMap::new();
        attrs.insert("document-format-supported".into(), "image/pwg-raster".into());
        spooler.set_capabilities("ipp://192.0.2.5:631/ipp/print", attrs);
        let mut entry = network_printer(Instant::now());

        Provisioner::new("/usr/lib/cups/filter")
            .provision(&mut entry, &spooler)
            .await
            .unwrap();

        assert_eq!(
            spooler.queue("printer").unwrap().driver,
            Some(InstalledDriver::Model("everywhere".into()))
        );
        assert_eq!(entry.driver, Some(QueueDriver::Model("everywhere".into())));
    }

    #[tokio::test]
    async fn failed_create_keeps_the_prepared_script() {
        let dir = tempfile::tempdir().unwrap();
        let spooler = MemorySpooler::new();
        spooler.set_reject_creates(true);
        let mut entry = network_printer(Instant::now());
        let provisioner = Provisioner::new("/usr/lib/cups/filter").with_script_dir(dir.path());

        assert!(provisioner.provision(&mut entry, &spooler).await.is_err());
        let Some(QueueDriver::Script(path)) = entry.driver.clone() else {
            panic!("script should be kept for the retry");
        };
        assert!(path.exists());

        spooler.set_reject_creates(false);
        provisioner.provision(&mut entry, &spooler).await.unwrap();
        assert!(!path.exists());
    }
}
