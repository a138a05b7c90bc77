// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default value for the `host` label when `LOG_HOST` is not set.

use tracing::warn;

const UNKNOWN_HOST: &str = "unknown";

/// The machine's hostname, or `"unknown"` when it cannot be read.
#[must_use]
pub fn get_hostname() -> String {
    let name = match nix::unistd::gethostname() {
        Ok(name) => name,
        Err(e) => {
            warn!("gethostname failed: {e}, host label set to '{UNKNOWN_HOST}'");
            return UNKNOWN_HOST.to_string();
        }
    };
    match name.into_string() {
        Ok(name) if !name.is_empty() => name,
        Ok(_) => UNKNOWN_HOST.to_string(),
        Err(raw) => {
            warn!("Hostname {raw:?} is not valid UTF-8, host label set to '{UNKNOWN_HOST}'");
            UNKNOWN_HOST.to_string()
        }
    }
}
