//! Testdroid REST API wire types

use chrono::{DateTime, TimeZone, Utc};
use devfarm_core::{Device, DeviceProperty, FlashRun, RunOutcome, RunParameter, RunState};
use serde::{Deserialize, Serialize};

// =============================================================================
// Envelopes
// =============================================================================

/// Paged list envelope used by every collection endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Error body returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    #[serde(default)]
    pub status_code: Option<u16>,
}

// =============================================================================
// Auth
// =============================================================================

/// OAuth2 password-grant token response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Lifetime in seconds
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

fn default_expires_in() -> u64 {
    300
}

// =============================================================================
// Devices and labels
// =============================================================================

/// Label group, e.g. "Build version"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelGroup {
    pub id: u64,
    pub display_name: String,
}

/// Label inside a group; devices carry labels
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: u64,
    pub display_name: String,
}

/// Property record as served by `/devices/{id}/properties`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDto {
    pub property_group_name: String,
    pub display_name: String,
}

impl From<PropertyDto> for DeviceProperty {
    fn from(dto: PropertyDto) -> Self {
        DeviceProperty::new(dto.property_group_name, dto.display_name)
    }
}

// =============================================================================
// Projects and runs
// =============================================================================

/// A project; the flash job lives in one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDto {
    pub id: u64,
    pub name: String,
}

/// A test run of a project
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDto {
    pub id: u64,
    pub project_id: u64,
    pub state: RunState,
    /// Creation time in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

impl From<RunDto> for FlashRun {
    fn from(dto: RunDto) -> Self {
        FlashRun {
            id: dto.id,
            job_id: dto.project_id,
            state: dto.state,
            outcome: dto.outcome,
            created_at: dto.create_time.and_then(millis_to_utc),
        }
    }
}

impl From<&FlashRun> for RunDto {
    fn from(run: &FlashRun) -> Self {
        RunDto {
            id: run.id,
            project_id: run.job_id,
            state: run.state,
            create_time: run.created_at.map(|t| t.timestamp_millis()),
            outcome: run.outcome,
        }
    }
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

/// Run configuration parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterDto {
    pub id: u64,
    pub key: String,
    pub value: String,
}

impl From<ParameterDto> for RunParameter {
    fn from(dto: ParameterDto) -> Self {
        RunParameter {
            id: dto.id,
            key: dto.key,
            value: dto.value,
        }
    }
}

// =============================================================================
// Sessions and proxies
// =============================================================================

/// Body of `POST /me/device-sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub device_id: u64,
    /// Session timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// A device session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDto {
    pub id: u64,
    pub device: Device,
}

/// A proxy opened for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDto {
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_dto_converts_create_time() {
        let dto: RunDto = serde_json::from_str(
            r#"{"id": 9, "projectId": 3, "state": "RUNNING", "createTime": 1700000000000}"#,
        )
        .unwrap();
        let run = FlashRun::from(dto);
        assert_eq!(run.job_id, 3);
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.created_at.unwrap().timestamp(), 1_700_000_000);
        assert!(run.outcome.is_none());
    }

    #[test]
    fn test_unknown_run_state_tolerated() {
        let dto: RunDto =
            serde_json::from_str(r#"{"id": 9, "projectId": 3, "state": "QUEUED"}"#).unwrap();
        assert_eq!(dto.state, RunState::Unknown);
    }

    #[test]
    fn test_device_page_keeps_extra_fields() {
        let page: Page<Device> = serde_json::from_str(
            r#"{"data": [{"id": 1, "displayName": "flame", "online": true, "locked": false, "softwareVersion": "4.4"}]}"#,
        )
        .unwrap();
        let device = &page.data[0];
        assert!(device.is_available());
        assert_eq!(device.attributes["softwareVersion"], "4.4");
    }
}
