//! Live MP4 writers and session signals keyed by stream name.
//!
//! Sessions never hold references to each other or to the health monitor;
//! the restart path reaches them through this table.

use crate::index::RecordingId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nvr_broker::RecorderReconnect;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// The MP4 file a rotator is currently writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterHandle {
    pub path: PathBuf,
    pub recording_id: RecordingId,
    pub started_at: DateTime<Utc>,
}

/// Shared between one session, its rotator and the registry.
#[derive(Debug)]
pub struct SessionSignals {
    reconnect: Notify,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last written packet; 0 = none yet.
    last_packet_ms: AtomicU64,
}

impl Default for SessionSignals {
    fn default() -> Self {
        Self {
            reconnect: Notify::new(),
            epoch: Instant::now(),
            last_packet_ms: AtomicU64::new(0),
        }
    }
}

impl SessionSignals {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_reconnect(&self) {
        self.reconnect.notify_one();
    }

    /// Resolves once a reconnect was requested (including before the call).
    pub async fn reconnect_requested(&self) {
        self.reconnect.notified().await;
    }

    pub fn touch(&self) {
        let ms = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_packet_ms.store(ms.max(1), Ordering::Release);
    }

    #[must_use]
    pub fn last_packet_at(&self) -> Option<Instant> {
        match self.last_packet_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(self.epoch + Duration::from_millis(ms)),
        }
    }

    #[must_use]
    pub fn since_last_packet(&self) -> Option<Duration> {
        self.last_packet_at().map(|at| at.elapsed())
    }
}

#[derive(Debug, Default)]
pub struct WriterRegistry {
    sessions: DashMap<String, Arc<SessionSignals>>,
    writers: DashMap<String, WriterHandle>,
}

impl WriterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signals for `stream`, created on first use.
    pub fn attach(&self, stream: &str) -> Arc<SessionSignals> {
        self.sessions
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(SessionSignals::new()))
            .clone()
    }

    pub fn detach(&self, stream: &str) {
        self.sessions.remove(stream);
        self.writers.remove(stream);
    }

    #[must_use]
    pub fn signals(&self, stream: &str) -> Option<Arc<SessionSignals>> {
        self.sessions.get(stream).map(|s| s.clone())
    }

    /// Returns the handle previously registered for `stream`, if any.
    pub fn register(&self, stream: &str, handle: WriterHandle) -> Option<WriterHandle> {
        self.writers.insert(stream.to_string(), handle)
    }

    pub fn unregister(&self, stream: &str) -> Option<WriterHandle> {
        self.writers.remove(stream).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn writer(&self, stream: &str) -> Option<WriterHandle> {
        self.writers.get(stream).map(|h| h.clone())
    }

    #[must_use]
    pub fn active_writers(&self) -> usize {
        self.writers.len()
    }

    pub fn signal_reconnect(&self, stream: &str) -> bool {
        self.sessions.get(stream).is_some_and(|signals| {
            signals.request_reconnect();
            true
        })
    }
}

impl RecorderReconnect for WriterRegistry {
    fn signal_reconnect_all(&self) -> usize {
        let mut signalled = 0;
        for entry in &self.sessions {
            entry.value().request_reconnect();
            signalled += 1;
        }
        debug!(signalled, "Reconnect signalled to media sessions");
        signalled
    }
}
