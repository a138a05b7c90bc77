// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory change source.
//!
//! [`MemoryLog`] is an append-only log shared between writers and any number of
//! [`MemoryChangeSource`] readers. Old entries can be purged to reproduce a
//! source that lost the history a stored position refers to.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

use super::{ChangeEvent, ChangeSource, OperationKind, Record};
use crate::error::SourceError;
use crate::position::ResumePosition;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    collection: String,
    operation: OperationKind,
    document: Option<Record>,
}

#[derive(Debug, Default)]
struct LogState {
    entries: VecDeque<Entry>,
    first_retained: u64,
    next_seq: u64,
    closed: bool,
}

impl LogState {
    fn entry_at(&self, seq: u64) -> Option<&Entry> {
        if seq < self.first_retained || seq >= self.next_seq {
            return None;
        }
        self.entries.get((seq - self.first_retained) as usize)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<LogState>>,
    notify: Arc<Notify>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Appends an entry and wakes waiting readers. Returns the entry's position.
    pub fn append(
        &self,
        collection: &str,
        operation: OperationKind,
        document: Option<Record>,
    ) -> ResumePosition {
        let seq = {
            let mut state = self.lock();
            let seq = state.next_seq;
            state.entries.push_back(Entry {
                seq,
                collection: collection.to_string(),
                operation,
                document,
            });
            state.next_seq += 1;
            seq
        };
        self.notify.notify_waiters();
        position_for(seq)
    }

    pub fn insert(&self, collection: &str, document: Record) -> ResumePosition {
        self.append(collection, OperationKind::Insert, Some(document))
    }

    /// Drops every entry up to and including `position`.
    pub fn purge_through(&self, position: &ResumePosition) {
        let Some(seq) = seq_of(position) else {
            return;
        };
        let mut state = self.lock();
        while state.entries.front().is_some_and(|e| e.seq <= seq) {
            state.entries.pop_front();
        }
        state.first_retained = state.first_retained.max(seq + 1).min(state.next_seq);
    }

    /// Makes the log unavailable. Readers fail once they catch up.
    pub fn shut_down(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().next_seq as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn position_for(seq: u64) -> ResumePosition {
    ResumePosition::new(seq.to_be_bytes().to_vec())
}

fn seq_of(position: &ResumePosition) -> Option<u64> {
    let bytes: [u8; 8] = position.as_bytes().try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Reader over a [`MemoryLog`].
#[derive(Debug)]
pub struct MemoryChangeSource {
    log: MemoryLog,
    cursor: u64,
    collections: Option<Vec<String>>,
    position: Option<ResumePosition>,
}

impl MemoryChangeSource {
    pub fn new(log: MemoryLog) -> Self {
        Self {
            log,
            cursor: 0,
            collections: None,
            position: None,
        }
    }
}

#[async_trait]
impl ChangeSource for MemoryChangeSource {
    async fn open(
        &mut self,
        resume_from: Option<ResumePosition>,
        collections: &[String],
    ) -> Result<(), SourceError> {
        let state = self.log.lock();
        if state.closed {
            return Err(SourceError::Unavailable("memory log is shut down".to_string()));
        }
        self.cursor = match &resume_from {
            None => state.next_seq,
            Some(position) => {
                let seq = seq_of(position).ok_or_else(|| {
                    SourceError::ResumeExpired(format!("unrecognised position {position:?}"))
                })?;
                if seq >= state.next_seq || seq + 1 < state.first_retained {
                    return Err(SourceError::ResumeExpired(format!(
                        "position {seq} is outside retained history {}..{}",
                        state.first_retained, state.next_seq
                    )));
                }
                seq + 1
            }
        };
        drop(state);
        self.position = resume_from;
        self.collections = Some(collections.to_vec());
        Ok(())
    }

    async fn next(&mut self) -> Result<ChangeEvent, SourceError> {
        let Some(collections) = self.collections.as_ref() else {
            return Err(SourceError::Closed);
        };
        loop {
            let notified = self.log.notify.notified();
            {
                let state = self.log.lock();
                if let Some(entry) = state.entry_at(self.cursor) {
                    let position = position_for(entry.seq);
                    self.cursor += 1;
                    self.position = Some(position.clone());
                    if entry.operation.is_insert() && collections.contains(&entry.collection) {
                        return Ok(ChangeEvent {
                            collection: entry.collection.clone(),
                            operation: entry.operation.clone(),
                            document: entry.document.clone(),
                            position,
                        });
                    }
                    continue;
                }
                if self.cursor < state.first_retained {
                    return Err(SourceError::ResumeExpired(format!(
                        "position {} was purged while reading",
                        self.cursor
                    )));
                }
                if state.closed {
                    return Err(SourceError::Unavailable(
                        "memory log is shut down".to_string(),
                    ));
                }
            }
            notified.await;
        }
    }

    async fn close(&mut self) {
        self.collections = None;
    }

    fn current_position(&self) -> Option<ResumePosition> {
        self.position.clone()
    }
}
