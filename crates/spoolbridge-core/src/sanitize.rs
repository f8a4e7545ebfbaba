// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Queue-name and MIME-list sanitizer.
//
// Every name that ends up as a local queue name (or as a parameter baked into
// an interface script) passes through here first.

/// Which extra characters survive sanitizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeMode {
    /// Queue names: ASCII letters, digits and `_`.
    Name,
    /// MIME type lists and host names: additionally `/`, `.` and `,`.
    MimeList,
}

impl SanitizeMode {
    fn keeps(self, c: char) -> bool {
        if c.is_ascii_alphanumeric() || c == '_' {
            return true;
        }
        matches!(self, Self::MimeList) && matches!(c, '/' | '.' | ',')
    }
}

/// Replace every run of disallowed characters with a single `-` and trim
/// dashes from both ends.
pub fn sanitize(input: &str, mode: SanitizeMode) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if mode.keeps(c) {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_owned()
}
