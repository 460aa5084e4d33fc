//! Device acquisition and session handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use devfarm_core::{Device, FarmError, Filter, Proxies};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::{AppState, HeldSession};

#[derive(Debug, Deserialize)]
pub struct AcquireRequest {
    /// Capability filter; must carry `build` and `memory`
    pub filter: Filter,
    /// Search/flash rounds; falls back to the configured default
    #[serde(default)]
    pub retry_budget: Option<u32>,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub session_id: u64,
    pub device: Device,
    pub proxy_host: String,
    pub proxies: Proxies,
    pub acquired_at: DateTime<Utc>,
    pub release: String,
}

impl From<HeldSession> for SessionResponse {
    fn from(held: HeldSession) -> Self {
        let session_id = held.handle.session_id();
        Self {
            session_id,
            device: held.handle.device,
            proxy_host: held.handle.proxy_host,
            proxies: held.handle.proxies,
            acquired_at: held.acquired_at,
            release: format!("/sessions/{}/release", session_id),
        }
    }
}

#[derive(Serialize)]
pub struct SessionsResponse {
    pub items: Vec<SessionResponse>,
}

/// POST /devices/acquire
/// Find or flash a device matching the filter and lock it for the caller
pub async fn acquire_device(
    State(state): State<AppState>,
    Json(request): Json<AcquireRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let retry_budget = request
        .retry_budget
        .unwrap_or(state.manager().config().default_retry_budget);

    // Acquisition outlives this request if the caller goes away or the
    // request times out; whoever ends up holding the handle releases it.
    let (tx, rx) = oneshot::channel();
    let task_state = state.clone();
    tokio::spawn(async move {
        let result = task_state
            .manager()
            .acquire_device(&request.filter, retry_budget)
            .await;
        if let Err(Ok(handle)) = tx.send(result) {
            let session_id = handle.session_id();
            warn!(session_id, "Caller gone before acquisition finished, releasing device");
            if let Err(e) = task_state.manager().release_device(handle).await {
                warn!(session_id, error = %e, "Failed to release abandoned device");
            }
        }
    });

    let handle = rx
        .await
        .map_err(|_| ApiError::Internal("acquisition task ended without a result".to_string()))??;
    info!(
        session_id = handle.session_id(),
        device_id = handle.device.id,
        "Device acquired"
    );

    let held = state.sessions().insert(handle);
    Ok((StatusCode::CREATED, Json(held.into())))
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<SessionsResponse> {
    let items = state
        .sessions()
        .list()
        .into_iter()
        .map(SessionResponse::from)
        .collect();
    Json(SessionsResponse { items })
}

/// POST /sessions/{session_id}/release
/// Hand a device back to the pool
pub async fn release_session(
    State(state): State<AppState>,
    Path(session_id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let held = state.sessions().take(session_id)?;

    if let Err(e) = state.manager().release_device(held.handle.clone()).await {
        // A session the cloud no longer knows is gone for good
        if !matches!(e, FarmError::NotFound(_)) {
            warn!(session_id, error = %e, "Release failed, keeping session registered");
            state.sessions().restore(held);
        }
        return Err(e.into());
    }

    info!(session_id, "Device released");
    Ok(StatusCode::NO_CONTENT)
}
