// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer capabilities relevant to driverless provisioning.
//
// Parsed from a Get-Printer-Attributes answer; decides whether the spooler's
// built-in IPP Everywhere model can drive the printer.

use std::collections::HashSet;

use crate::spooler::PrinterAttributes;

/// Page description languages the host can produce without a vendor driver.
pub const PORTABLE_PDLS: [&str; 5] = [
    "application/postscript",
    "application/pdf",
    "image/pwg-raster",
    "application/vnd.hp-PCL",
    "application/vnd.hp-PCLXL",
];

/// Whether a comma-separated PDL list names at least one portable language.
pub fn has_portable_pdl(pdl: &str) -> bool {
    let pdl = pdl.to_ascii_lowercase();
    PORTABLE_PDLS
        .iter()
        .any(|known| pdl.contains(&known.to_ascii_lowercase()))
}

/// Parsed printer capabilities from IPP Get-Printer-Attributes.
#[derive(Debug, Clone, Default)]
pub struct PrinterCapabilities {
    /// Supported document format MIME types.
    pub document_formats_supported: HashSet<String>,
    /// `ipp-features-supported` keywords.
    pub ipp_features: HashSet<String>,
    /// `printer-make-and-model`, when present.
    pub make_and_model: Option<String>,
}

impl PrinterCapabilities {
    /// Parse capabilities from raw IPP printer attributes.
    pub fn from_attributes(attrs: &PrinterAttributes) -> Self {
        Self {
            document_formats_supported: parse_set(attrs.get("document-format-supported")),
            ipp_features: parse_set(attrs.get("ipp-features-supported")),
            make_and_model: attrs
                .get("printer-make-and-model")
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty()),
        }
    }

    /// Whether the printer accepts a given document format.
    pub fn supports_format(&self, mime_type: &str) -> bool {
        self.document_formats_supported
            .iter()
            .any(|f| f.eq_ignore_ascii_case(mime_type))
    }

    /// IPP Everywhere printers speak PWG raster or say so explicitly.
    pub fn is_ipp_everywhere(&self) -> bool {
        self.supports_format("image/pwg-raster")
            || self
                .ipp_features
                .iter()
                .any(|f| f.eq_ignore_ascii_case("ipp-everywhere"))
    }
}

/// Split a multi-valued attribute into a set.
fn parse_set(value: Option<&String>) -> HashSet<String> {
    match value {
        Some(v) => v
            .split([',', ';'])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn portable_pdl_detection_is_case_insensitive() {
        assert!(has_portable_pdl("application/pdf"));
        assert!(has_portable_pdl("image/urf,IMAGE/PWG-RASTER"));
        assert!(has_portable_pdl("application/vnd.hp-pclxl"));
        assert!(!has_portable_pdl("image/urf,image/jpeg"));
        assert!(!has_portable_pdl(""));
    }

    #[test]
    fn everywhere_from_pwg_raster() {
        let mut attrs = HashMap::new();
        attrs.insert(
            "document-format-supported".into(),
            "application/pdf, image/pwg-raster".into(),
        );
        attrs.insert("printer-make-and-model".into(), "Acme Jet 5".into());
        let caps = PrinterCapabilities::from_attributes(&attrs);
        assert!(caps.is_ipp_everywhere());
        assert_eq!(caps.make_and_model.as_deref(), Some("Acme Jet 5"));
    }

    #[test]
    fn everywhere_from_feature_keyword() {
        let mut attrs = HashMap::new();
        attrs.insert("ipp-features-supported".into(), "airprint-1.7, ipp-everywhere".into());
        assert!(PrinterCapabilities::from_attributes(&attrs).is_ipp_everywhere());
    }

    #[test]
    fn pdf_only_printer_is_not_everywhere() {
        let mut attrs = HashMap::new();
        attrs.insert("document-format-supported".into(), "application/pdf".into());
        let caps = PrinterCapabilities::from_attributes(&attrs);
        assert!(caps.supports_format("APPLICATION/PDF"));
        assert!(!caps.is_ipp_everywhere());
    }
}
