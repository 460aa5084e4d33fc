//! Application state for the devfarm API

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devfarm_core::{DeviceHandle, DeviceManager};
use parking_lot::Mutex;

use crate::error::ApiError;

/// Shortest default request timeout, longer than one full flash deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(660);

/// Allowance for proxy setup and remote latency on top of the waits
const REQUEST_SLACK: Duration = Duration::from_secs(120);

/// A handle held on behalf of an HTTP caller
#[derive(Debug, Clone)]
pub struct HeldSession {
    pub handle: DeviceHandle,
    pub acquired_at: DateTime<Utc>,
}

/// Handles acquired through the API, keyed by session id.
///
/// The cloud session lock is the only exclusion between callers; this
/// registry just remembers what to release.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    held: Mutex<HashMap<u64, HeldSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: DeviceHandle) -> HeldSession {
        let held = HeldSession {
            handle,
            acquired_at: Utc::now(),
        };
        self.held
            .lock()
            .insert(held.handle.session_id(), held.clone());
        held
    }

    /// Remove a session so exactly one caller gets to release it
    pub fn take(&self, session_id: u64) -> Result<HeldSession, ApiError> {
        self.held
            .lock()
            .remove(&session_id)
            .ok_or_else(|| ApiError::NotFound(format!("Session not found: {}", session_id)))
    }

    /// Put back a session whose release failed
    pub fn restore(&self, held: HeldSession) {
        self.held.lock().insert(held.handle.session_id(), held);
    }

    /// Held sessions ordered by session id
    pub fn list(&self) -> Vec<HeldSession> {
        let mut sessions: Vec<HeldSession> = self.held.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.handle.session_id());
        sessions
    }

    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }
}

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    manager: Arc<DeviceManager>,
    sessions: Arc<SessionRegistry>,
    request_timeout: Duration,
}

impl AppState {
    /// State whose request timeout covers the largest allowed retry budget
    pub fn new(manager: DeviceManager) -> Self {
        let request_timeout = Self::acquisition_timeout(&manager);
        Self {
            manager: Arc::new(manager),
            sessions: Arc::new(SessionRegistry::new()),
            request_timeout,
        }
    }

    /// Request timeout long enough for an acquisition at `max_retry_budget`
    pub fn acquisition_timeout(manager: &DeviceManager) -> Duration {
        let config = manager.config();
        config
            .acquisition_window(config.max_retry_budget)
            .saturating_add(REQUEST_SLACK)
            .max(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Override the derived timeout. Acquisitions still run to completion
    /// past it; a handle that arrives after the caller is gone is released.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }
}
