// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use core::time::Duration;
use tracing::error;

/// Builds a reqwest client with optional proxy configuration and timeout.
/// The timeout applies to each request, independently of any retry backoff.
pub fn build_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(270))
        .tcp_keepalive(Duration::from_secs(120));
    if let Some(proxy) = proxy_url {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    builder.build()
}

/// Like [`build_client`], but falls back to a direct connection when the proxy
/// configuration cannot be used.
///
/// # Errors
///
/// Returns the builder error when even a direct client cannot be built.
pub fn get_client(
    proxy_url: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    build_client(proxy_url, timeout).or_else(|e| {
        if proxy_url.is_none() {
            return Err(e);
        }
        error!("Unable to parse proxy configuration: {e}, falling back to direct connection");
        build_client(None, timeout)
    })
}
