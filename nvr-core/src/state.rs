//! Local per-stream state shared between media sessions (writers) and the
//! health monitor (reader).

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Inactive,
    Starting,
    Active,
    Stopping,
    Error,
    Reconnecting,
}

impl StreamState {
    /// States the health monitor treats as failing.
    #[must_use]
    pub const fn is_failing(self) -> bool {
        matches!(self, Self::Error | Self::Reconnecting)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inactive => "inactive",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamStatus {
    pub state: StreamState,
    pub reconnect_attempts: u32,
    pub last_reregistration: Option<Instant>,
    pub updated_at: Instant,
}

impl StreamStatus {
    fn new(state: StreamState) -> Self {
        Self {
            state,
            reconnect_attempts: 0,
            last_reregistration: None,
            updated_at: Instant::now(),
        }
    }
}

/// Keyed state table. Cheap to clone; all clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct StreamStateTable {
    inner: Arc<DashMap<String, StreamStatus>>,
}

impl StreamStateTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<StreamStatus> {
        self.inner.get(name).map(|entry| *entry)
    }

    #[must_use]
    pub fn state(&self, name: &str) -> StreamState {
        self.get(name).map_or(StreamState::Inactive, |s| s.state)
    }

    pub fn set_state(&self, name: &str, state: StreamState) {
        let mut entry = self
            .inner
            .entry(name.to_string())
            .or_insert_with(|| StreamStatus::new(state));
        entry.state = state;
        entry.updated_at = Instant::now();
        if state == StreamState::Active {
            entry.reconnect_attempts = 0;
        }
    }

    /// Enter `Reconnecting` and bump the attempt counter, returning the new count.
    pub fn record_reconnect_attempt(&self, name: &str) -> u32 {
        let mut entry = self
            .inner
            .entry(name.to_string())
            .or_insert_with(|| StreamStatus::new(StreamState::Reconnecting));
        entry.state = StreamState::Reconnecting;
        entry.reconnect_attempts = entry.reconnect_attempts.saturating_add(1);
        entry.updated_at = Instant::now();
        entry.reconnect_attempts
    }

    /// Forget reconnect history after a successful re-registration.
    pub fn clear_reconnect(&self, name: &str) {
        if let Some(mut entry) = self.inner.get_mut(name) {
            entry.reconnect_attempts = 0;
            if entry.state.is_failing() {
                entry.state = StreamState::Starting;
            }
            entry.updated_at = Instant::now();
        }
    }

    pub fn mark_reregistered(&self, name: &str, at: Instant) {
        let mut entry = self
            .inner
            .entry(name.to_string())
            .or_insert_with(|| StreamStatus::new(StreamState::Inactive));
        entry.last_reregistration = Some(at);
    }

    pub fn remove(&self, name: &str) {
        self.inner.remove(name);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, StreamStatus)> {
        self.inner
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}
