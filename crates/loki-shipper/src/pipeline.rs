// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The consume → map → deliver → persist loop.
//!
//! # Lifecycle
//!
//! ```text
//!   Starting ──(source opened)──> Streaming ──(shutdown)──> Draining ──> Stopped
//!       │  │                          │                        ^
//!       │  └──────(shutdown)──────────┼────────────────────────┘
//!       └──────(fatal error)──────────┴────────────────────────────────> Stopped
//! ```
//!
//! The position store is written only after the sink accepted a batch, and
//! always with the position of the last event in that batch. A crash can
//! therefore duplicate at most the batch in flight, and never skip one.
//!
//! While no batch is open, the pipeline periodically saves the source's own
//! position. It covers changes the source skipped, so a quiet set of monitored
//! collections does not leave the stored position behind the source's history.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ShipperConfig;
use crate::error::{PipelineError, SourceError};
use crate::loki::{DeliveryBatch, LokiClient};
use crate::mapper::RecordMapper;
use crate::position::{PositionStore, ResumePosition};
use crate::source::{ChangeEvent, ChangeSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Loading the stored position and opening the source.
    Starting,
    Streaming,
    /// Shutdown requested, finishing the in-flight batch.
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub collections: Vec<String>,
    /// A batch is pushed as soon as it holds this many lines.
    pub batch_max_size: usize,
    /// Longest wait for more events once a batch has its first line.
    pub batch_linger: Duration,
    /// Idle time after which the source's current position is saved.
    pub checkpoint_interval: Duration,
}

impl From<&ShipperConfig> for PipelineConfig {
    fn from(config: &ShipperConfig) -> Self {
        Self {
            collections: config.collections.clone(),
            batch_max_size: config.batch_max_size,
            batch_linger: config.batch_linger,
            checkpoint_interval: config.checkpoint_interval,
        }
    }
}

/// Lines gathered for one push, with the position of the last event among them.
#[derive(Default)]
struct PendingBatch {
    batch: DeliveryBatch,
    position: Option<ResumePosition>,
}

/// Why gathering a batch stopped.
enum BatchEnd {
    /// Size or linger limit reached.
    Complete,
    /// No event arrived within the checkpoint interval.
    Idle,
    Shutdown,
    Source(SourceError),
}

pub struct Pipeline<S, P> {
    source: S,
    store: P,
    mapper: RecordMapper,
    client: LokiClient,
    config: PipelineConfig,
    /// Last position confirmed by the sink.
    position: Option<ResumePosition>,
    /// Set while `position` has not made it to the store.
    unsaved: bool,
    state_tx: watch::Sender<PipelineState>,
}

impl<S, P> Pipeline<S, P>
where
    S: ChangeSource,
    P: PositionStore,
{
    pub fn new(
        source: S,
        store: P,
        mapper: RecordMapper,
        client: LokiClient,
        config: PipelineConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Starting);
        Self {
            source,
            store,
            mapper,
            client,
            config,
            position: None,
            unsaved: false,
            state_tx,
        }
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> PipelineState {
        *self.state_tx.borrow()
    }

    /// Last position the sink confirmed, whether or not it was persisted.
    pub fn position(&self) -> Option<&ResumePosition> {
        self.position.as_ref()
    }

    fn set_state(&self, state: PipelineState) {
        debug!("Pipeline state: {state:?}");
        self.state_tx.send_replace(state);
    }

    /// Runs until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// # Errors
    ///
    /// [`PipelineError::SourceUnavailable`] when the source cannot be opened or
    /// fails while streaming; [`PipelineError::Delivery`] when a batch was
    /// rejected or ran out of retries. In both cases the stored position still
    /// points before the batch that was not delivered.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        self.set_state(PipelineState::Starting);
        let result = self.stream(&shutdown).await;
        self.source.close().await;
        if let Err(e) = &result {
            error!("Pipeline stopped on fatal error: {e}");
        }
        self.set_state(PipelineState::Stopped);
        result
    }

    async fn stream(&mut self, shutdown: &CancellationToken) -> Result<(), PipelineError> {
        self.position = self.store.load();
        self.unsaved = false;
        if self.position.is_none() {
            info!("No stored resume position, forwarding events from now on");
        }
        if !self.open(shutdown).await? {
            info!("Shutdown requested while opening the change source");
            self.set_state(PipelineState::Draining);
            self.drain();
            return Ok(());
        }
        self.set_state(PipelineState::Streaming);
        info!("Waiting for changes...");

        loop {
            let (pending, end) = self.collect(shutdown).await;
            if matches!(end, BatchEnd::Shutdown) {
                self.set_state(PipelineState::Draining);
            }

            self.deliver(pending).await?;

            match end {
                BatchEnd::Complete => {}
                BatchEnd::Idle => self.checkpoint(),
                BatchEnd::Shutdown => {
                    self.drain();
                    return Ok(());
                }
                BatchEnd::Source(e) => {
                    if !self.recover(e, shutdown).await? {
                        self.set_state(PipelineState::Draining);
                        self.drain();
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Opens the source from the stored position, falling back to now when
    /// that position has expired. Returns `false` if shutdown came first.
    async fn open(&mut self, shutdown: &CancellationToken) -> Result<bool, PipelineError> {
        let resume_from = self.position.clone();
        let opened = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(false),
            opened = self.source.open(resume_from, &self.config.collections) => opened,
        };
        match opened {
            Ok(()) => Ok(true),
            Err(SourceError::ResumeExpired(reason)) => {
                warn!(
                    "Stored resume position is no longer available ({reason}), \
                     discarding it and starting from now: changes made since it was stored are lost"
                );
                self.position = None;
                self.open_from_now(shutdown).await
            }
            Err(e) => Err(PipelineError::SourceUnavailable(e.to_string())),
        }
    }

    async fn open_from_now(&mut self, shutdown: &CancellationToken) -> Result<bool, PipelineError> {
        let opened = tokio::select! {
            biased;
            () = shutdown.cancelled() => return Ok(false),
            opened = self.source.open(None, &self.config.collections) => opened,
        };
        opened
            .map(|()| true)
            .map_err(|e| PipelineError::SourceUnavailable(e.to_string()))
    }

    /// Handles a source error raised while streaming. Returns `false` if
    /// shutdown came before the source could be reopened.
    async fn recover(
        &mut self,
        error: SourceError,
        shutdown: &CancellationToken,
    ) -> Result<bool, PipelineError> {
        match error {
            SourceError::ResumeExpired(reason) => {
                warn!(
                    "Change stream lost its position ({reason}), reopening from now: \
                     changes made in between are lost"
                );
                self.source.close().await;
                self.open_from_now(shutdown).await
            }
            other => Err(PipelineError::SourceUnavailable(other.to_string())),
        }
    }

    /// Gathers the next batch.
    async fn collect(&mut self, shutdown: &CancellationToken) -> (PendingBatch, BatchEnd) {
        let mut pending = PendingBatch::default();

        // no linger deadline on the first event, idle periods are normal
        let first = tokio::select! {
            biased;
            () = shutdown.cancelled() => return (pending, BatchEnd::Shutdown),
            next = self.source.next() => next,
            () = sleep(self.config.checkpoint_interval) => return (pending, BatchEnd::Idle),
        };
        match first {
            Ok(event) => self.add(&mut pending, event),
            Err(e) => return (pending, BatchEnd::Source(e)),
        }

        let deadline = Instant::now() + self.config.batch_linger;
        while pending.batch.len() < self.config.batch_max_size {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => return (pending, BatchEnd::Shutdown),
                () = sleep_until(deadline) => break,
                next = self.source.next() => next,
            };
            match next {
                Ok(event) => self.add(&mut pending, event),
                Err(e) => return (pending, BatchEnd::Source(e)),
            }
        }
        (pending, BatchEnd::Complete)
    }

    fn add(&self, pending: &mut PendingBatch, event: ChangeEvent) {
        let position = event.position.clone();
        pending.batch.push(self.mapper.map(event));
        pending.position = Some(position);
    }

    async fn deliver(&mut self, pending: PendingBatch) -> Result<(), PipelineError> {
        let Some(position) = pending.position else {
            return Ok(());
        };
        debug!("Delivering batch of {} lines", pending.batch.len());
        self.client.push(&pending.batch).await?;
        self.advance(position);
        Ok(())
    }

    /// Saves the source's position while no batch is open. Every event it
    /// covers was either delivered or skipped by the source.
    fn checkpoint(&mut self) {
        let Some(position) = self.source.current_position() else {
            return;
        };
        if self.position.as_ref() == Some(&position) {
            if self.unsaved {
                self.persist();
            }
            return;
        }
        debug!("Source moved past skipped changes, saving its position");
        self.advance(position);
    }

    fn advance(&mut self, position: ResumePosition) {
        self.position = Some(position);
        self.persist();
    }

    fn persist(&mut self) {
        let Some(position) = &self.position else {
            return;
        };
        match self.store.save(position) {
            Ok(()) => self.unsaved = false,
            Err(e) => {
                warn!("Failed to persist resume position, will retry after the next delivery: {e}");
                self.unsaved = true;
            }
        }
    }

    fn drain(&mut self) {
        if self.unsaved {
            info!("Retrying save of the final resume position");
            self.persist();
        }
        info!("Pipeline drained");
    }
}
