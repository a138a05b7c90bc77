// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors surfaced by a [`ChangeSource`](crate::source::ChangeSource).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The stored resume position is no longer available on the source.
    #[error("Resume position expired: {0}")]
    ResumeExpired(String),

    #[error("Change source unavailable: {0}")]
    Unavailable(String),

    /// `next` was called on a source that is not open.
    #[error("Change source is closed")]
    Closed,
}

/// Errors from building or pushing with a [`LokiClient`](crate::loki::LokiClient).
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Transient failures persisted until the retry ceiling was reached.
    #[error("Delivery failed after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u64, last_error: String },

    /// The sink refused the batch with a client error. Never retried.
    #[error("Delivery rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("Failed to build push payload: {0}")]
    Payload(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PositionStoreError {
    #[error("Position file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Position file path has no file name: {0}")]
    InvalidPath(String),
}

/// Fatal conditions that stop the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
