// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Resumable, ordered change subscriptions.
//!
//! A [`ChangeSource`] hides which database provides the change feed. The
//! pipeline only sees [`ChangeEvent`]s for inserts into the monitored
//! collections, each carrying the [`ResumePosition`] that marks it consumed.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::position::ResumePosition;

pub mod memory;
pub mod mongo;

/// Generic structured record. No per-collection schema is applied.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Collections written by the UniFi controller that carry log-like records.
pub const UNIFI_COLLECTIONS: [&str; 7] = [
    "admin_activity_log",
    "alarm",
    "alert",
    "event",
    "inspection_log",
    "threat_log_view",
    "trigger_log",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
    Other(String),
}

impl OperationKind {
    pub fn is_insert(&self) -> bool {
        matches!(self, OperationKind::Insert)
    }
}

impl From<&str> for OperationKind {
    fn from(value: &str) -> Self {
        match value {
            "insert" => OperationKind::Insert,
            "update" => OperationKind::Update,
            "replace" => OperationKind::Replace,
            "delete" => OperationKind::Delete,
            other => OperationKind::Other(other.to_string()),
        }
    }
}

/// One notification from a monitored collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    pub operation: OperationKind,
    /// The inserted document. Sources may fail to provide it.
    pub document: Option<Record>,
    pub position: ResumePosition,
}

/// Capability interface over a resumable change stream.
#[async_trait]
pub trait ChangeSource: Send {
    /// Opens the subscription strictly after `resume_from`, or at "now" when it is `None`.
    ///
    /// # Errors
    ///
    /// [`SourceError::ResumeExpired`] when the source no longer holds the history
    /// needed to resume from `resume_from`; [`SourceError::Unavailable`] otherwise.
    async fn open(
        &mut self,
        resume_from: Option<ResumePosition>,
        collections: &[String],
    ) -> Result<(), SourceError>;

    /// Waits for the next insert into a monitored collection.
    ///
    /// Never times out. Non-insert operations and unmonitored collections are
    /// skipped. Implementations must be cancel safe, since the pipeline races
    /// this call against its shutdown signal.
    async fn next(&mut self) -> Result<ChangeEvent, SourceError>;

    async fn close(&mut self);

    /// Position up to which every change has been read, surfaced or skipped.
    ///
    /// Never points past an event that `next` has not returned yet. The
    /// pipeline saves it while idle so skipped changes still move the stored
    /// position forward.
    fn current_position(&self) -> Option<ResumePosition>;
}
