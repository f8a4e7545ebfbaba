// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Spoolbridge core: types, configuration and error definitions shared by the
// lifecycle engine and the daemon binary.

pub mod config;
pub mod error;
pub mod sanitize;
pub mod types;

pub use config::DaemonConfig;
pub use error::BridgeError;
pub use types::*;
