//! Device inventory handlers

use axum::extract::{Path, State};
use axum::Json;
use devfarm_core::{Device, DeviceProperties};
use serde::Serialize;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct DevicesResponse {
    pub items: Vec<DeviceInfo>,
}

#[derive(Serialize)]
pub struct DeviceInfo {
    #[serde(flatten)]
    pub device: Device,
    pub available: bool,
    pub properties: String,
}

impl From<Device> for DeviceInfo {
    fn from(device: Device) -> Self {
        Self {
            available: device.is_available(),
            properties: format!("/devices/{}/properties", device.id),
            device,
        }
    }
}

/// GET /devices
/// List every device the cloud account can see
pub async fn list_devices(State(state): State<AppState>) -> Result<Json<DevicesResponse>, ApiError> {
    let devices = state.manager().get_devices().await?;
    Ok(Json(DevicesResponse {
        items: devices.into_iter().map(DeviceInfo::from).collect(),
    }))
}

/// GET /devices/{device_id}/properties
pub async fn device_properties(
    State(state): State<AppState>,
    Path(device_id): Path<u64>,
) -> Result<Json<DeviceProperties>, ApiError> {
    let properties = state.manager().get_device_properties(device_id).await?;
    Ok(Json(properties))
}
