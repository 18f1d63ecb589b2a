//! Recording index: where finished and in-progress MP4 files are recorded.
//!
//! The database behind it is an external collaborator; [`MemoryRecordingIndex`]
//! is used by the binary and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type RecordingId = u64;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("recording {0} not found")]
    NotFound(RecordingId),

    #[error("index unavailable: {0}")]
    Unavailable(String),
}

impl From<IndexError> for nvr_core::Error {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound(_) => Self::NotFound(err.to_string()),
            IndexError::Unavailable(_) => Self::Transient(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingRow {
    pub stream_name: String,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub size_bytes: u64,
    pub complete: bool,
}

#[async_trait]
pub trait RecordingIndex: Send + Sync {
    async fn add_recording(
        &self,
        stream_name: &str,
        path: &Path,
        started_at: DateTime<Utc>,
    ) -> Result<RecordingId, IndexError>;

    /// Periodic progress for a file still being written.
    async fn update_recording(&self, id: RecordingId, duration: Duration, size_bytes: u64) -> Result<(), IndexError>;

    async fn finalize_recording(
        &self,
        id: RecordingId,
        ended_at: DateTime<Utc>,
        duration: Duration,
        size_bytes: u64,
    ) -> Result<(), IndexError>;

    /// Drop a row whose file never received a sample.
    async fn discard_recording(&self, id: RecordingId) -> Result<(), IndexError>;
}

#[derive(Debug, Default)]
pub struct MemoryRecordingIndex {
    next_id: AtomicU64,
    rows: RwLock<BTreeMap<RecordingId, RecordingRow>>,
}

impl MemoryRecordingIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, id: RecordingId) -> Option<RecordingRow> {
        self.rows.read().get(&id).cloned()
    }

    /// Rows for one stream, oldest first.
    #[must_use]
    pub fn recordings(&self, stream_name: &str) -> Vec<RecordingRow> {
        self.rows
            .read()
            .values()
            .filter(|row| row.stream_name == stream_name)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }
}

#[async_trait]
impl RecordingIndex for MemoryRecordingIndex {
    async fn add_recording(
        &self,
        stream_name: &str,
        path: &Path,
        started_at: DateTime<Utc>,
    ) -> Result<RecordingId, IndexError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.rows.write().insert(
            id,
            RecordingRow {
                stream_name: stream_name.to_string(),
                path: path.to_path_buf(),
                started_at,
                ended_at: None,
                duration: Duration::ZERO,
                size_bytes: 0,
                complete: false,
            },
        );
        Ok(id)
    }

    async fn update_recording(&self, id: RecordingId, duration: Duration, size_bytes: u64) -> Result<(), IndexError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(IndexError::NotFound(id))?;
        row.duration = duration;
        row.size_bytes = size_bytes;
        Ok(())
    }

    async fn finalize_recording(
        &self,
        id: RecordingId,
        ended_at: DateTime<Utc>,
        duration: Duration,
        size_bytes: u64,
    ) -> Result<(), IndexError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(IndexError::NotFound(id))?;
        row.ended_at = Some(ended_at);
        row.duration = duration;
        row.size_bytes = size_bytes;
        row.complete = true;
        Ok(())
    }

    async fn discard_recording(&self, id: RecordingId) -> Result<(), IndexError> {
        self.rows
            .write()
            .remove(&id)
            .map(|_| ())
            .ok_or(IndexError::NotFound(id))
    }
}
