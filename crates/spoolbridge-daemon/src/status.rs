// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Status file: a JSON array of registry entries rewritten after each pass.

use std::path::Path;

use spoolbridge_core::error::Result;
use spoolbridge_print::Registry;

/// Write the registry snapshot to `path`, replacing it atomically.
pub async fn write_status(path: &Path, registry: &Registry) -> Result<()> {
    let json = serde_json::to_string_pretty(&registry.snapshot())?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
