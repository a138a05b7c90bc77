// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable resume position tracking.
//!
//! The pipeline only advances the stored position after the sink accepted the
//! corresponding log lines, so the file always points at the last event that
//! was confirmed delivered.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::PositionStoreError;

/// Opaque marker meaning "this event and everything before it has been forwarded".
///
/// Only the [`ChangeSource`](crate::source::ChangeSource) that produced a
/// position knows how to interpret its bytes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ResumePosition(Vec<u8>);

impl ResumePosition {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ResumePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResumePosition({} bytes)", self.0.len())
    }
}

/// Storage contract for the resume position.
pub trait PositionStore: Send {
    /// Returns `None` when nothing usable has been persisted, which callers treat
    /// as "start from now".
    fn load(&self) -> Option<ResumePosition>;

    /// Replaces the persisted position.
    ///
    /// # Errors
    ///
    /// Returns [`PositionStoreError`] when the position could not be written.
    fn save(&mut self, position: &ResumePosition) -> Result<(), PositionStoreError>;
}

/// Keeps the position in a single local file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FilePositionStore {
    path: PathBuf,
}

impl FilePositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> Result<PathBuf, PositionStoreError> {
        let file_name = self
            .path
            .file_name()
            .ok_or_else(|| PositionStoreError::InvalidPath(self.path.display().to_string()))?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        Ok(self.path.with_file_name(temp_name))
    }
}

impl PositionStore for FilePositionStore {
    fn load(&self) -> Option<ResumePosition> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => {
                warn!(
                    "Position file {} is empty, starting from now",
                    self.path.display()
                );
                None
            }
            Ok(bytes) => {
                debug!(
                    "Loaded resume position ({} bytes) from {}",
                    bytes.len(),
                    self.path.display()
                );
                Some(ResumePosition::new(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No position file at {}", self.path.display());
                None
            }
            Err(e) => {
                warn!(
                    "Unable to read position file {}: {e}, starting from now",
                    self.path.display()
                );
                None
            }
        }
    }

    fn save(&mut self, position: &ResumePosition) -> Result<(), PositionStoreError> {
        let temp_path = self.temp_path()?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(position.as_bytes())?;
        file.sync_all()?;
        drop(file);

        // rename replaces the old file in one step, readers never see a partial token
        fs::rename(&temp_path, &self.path)?;
        debug!("Wrote {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::new(dir.path().join("resume_token.bin"));
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_load_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume_token.bin");
        fs::write(&path, b"").unwrap();
        let store = FilePositionStore::new(path);
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_load_directory_is_not_fatal() {
        let dir = tempdir().unwrap();
        let store = FilePositionStore::new(dir.path());
        assert_eq!(store.load(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("resume_token.bin");
        let mut store = FilePositionStore::new(&path);

        store.save(&ResumePosition::new(vec![1, 2, 3])).unwrap();
        store.save(&ResumePosition::new(vec![4, 5])).unwrap();

        assert_eq!(store.load(), Some(ResumePosition::new(vec![4, 5])));
        assert!(!dir.path().join("resume_token.bin.tmp").exists());

        let reopened = FilePositionStore::new(&path);
        assert_eq!(reopened.load(), Some(ResumePosition::new(vec![4, 5])));
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("resume_token.bin");
        let mut store = FilePositionStore::new(&path);

        store.save(&ResumePosition::new(vec![9])).unwrap();
        assert_eq!(fs::read(&path).unwrap(), vec![9]);
    }

    #[test]
    fn test_save_failure_is_reported() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let mut store = FilePositionStore::new(blocker.join("resume_token.bin"));

        assert!(store.save(&ResumePosition::new(vec![1])).is_err());
    }

    #[test]
    fn test_debug_hides_token_bytes() {
        let position = ResumePosition::new(vec![0xde, 0xad]);
        assert_eq!(format!("{position:?}"), "ResumePosition(2 bytes)");
    }
}
