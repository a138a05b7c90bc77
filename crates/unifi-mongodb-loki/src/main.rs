// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::future::Future;
use std::io;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use loki_shipper::{
    config::ShipperConfig,
    loki::{LokiClient, LokiClientConfig},
    mapper::RecordMapper,
    pipeline::{Pipeline, PipelineConfig},
    position::FilePositionStore,
    source::mongo::MongoChangeSource,
};

const EXIT_FATAL: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
pub async fn main() -> ExitCode {
    let verbose = env::args()
        .skip(1)
        .any(|arg| arg == "-v" || arg == "--verbose");

    let config = match ShipperConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // logging is not configured yet
            eprintln!("Invalid configuration: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let log_level = if verbose { "debug" } else { config.log_level.as_str() };
    if let Err(e) = init_logging(log_level) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }
    debug!("Logging subsystem enabled");

    info!(
        "Forwarding {} collections from database '{}' to {}",
        config.collections.len(),
        config.mongodb_database,
        config.loki_url
    );

    let source = MongoChangeSource::new(&config.mongodb_conn_str, &config.mongodb_database);
    let store = FilePositionStore::new(config.position_path.clone());
    let mapper = RecordMapper::new(config.host.clone(), config.flatten_payload);
    let client = match LokiClient::new(LokiClientConfig {
        url: config.loki_url.clone(),
        tenant_id: config.loki_tenant_id.clone(),
        username: config.loki_username.clone(),
        password: config.loki_password.clone(),
        https_proxy: config.https_proxy.clone(),
        timeout: config.timeout,
        retry_strategy: config.retry_strategy.clone(),
    }) {
        Ok(client) => client,
        Err(e) => {
            error!("Exiting: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };
    let mut pipeline = Pipeline::new(source, store, mapper, client, PipelineConfig::from(&config));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(shutdown.clone()));

    match pipeline.run(shutdown).await {
        Ok(()) => {
            info!("Shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Exiting: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = format!("h2=off,hyper=off,rustls=off,mongodb=warn,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter)?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM.
async fn wait_for_shutdown(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())?.recv().await;
        Ok::<(), io::Error>(())
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<io::Result<()>>();

    cancel_on_signal(tokio::signal::ctrl_c(), terminate, shutdown).await;
}

/// Cancels `shutdown` once either signal fires. A listener that fails to
/// register is logged and left out, the other one keeps waiting.
async fn cancel_on_signal<C, T>(ctrl_c: C, terminate: T, shutdown: CancellationToken)
where
    C: Future<Output = io::Result<()>>,
    T: Future<Output = io::Result<()>>,
{
    let ctrl_c = async {
        match ctrl_c.await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    let terminate = async {
        match terminate.await {
            Ok(()) => info!("Received SIGTERM, shutting down"),
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::{pending, ready};
    use tokio::time::{sleep, timeout, Duration};

    fn failed() -> io::Result<()> {
        Err(io::Error::other("signal driver unavailable"))
    }

    #[tokio::test]
    async fn test_failed_ctrl_c_listener_does_not_cancel() {
        let shutdown = CancellationToken::new();
        let listener = tokio::spawn(cancel_on_signal(
            ready(failed()),
            pending(),
            shutdown.clone(),
        ));

        sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_cancelled());
        listener.abort();
    }

    #[tokio::test]
    async fn test_sigterm_still_cancels_after_ctrl_c_failure() {
        let shutdown = CancellationToken::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let terminate = async move {
            let _ = rx.await;
            Ok::<(), io::Error>(())
        };
        let listener = tokio::spawn(cancel_on_signal(
            ready(failed()),
            terminate,
            shutdown.clone(),
        ));

        sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_cancelled());
        tx.send(()).unwrap();
        timeout(Duration::from_secs(2), listener)
            .await
            .expect("listener did not finish")
            .unwrap();
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_ctrl_c_cancels() {
        let shutdown = CancellationToken::new();
        cancel_on_signal(ready(Ok::<(), io::Error>(())), pending(), shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }
}
