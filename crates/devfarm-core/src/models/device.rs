//! Device, session and proxy models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A remote handset as reported by the device cloud.
///
/// The cloud owns this record. The orchestrator only observes it and changes
/// it indirectly by starting sessions or flashing runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Cloud-assigned identifier
    pub id: u64,
    /// Human-readable name (e.g. "flame")
    #[serde(default)]
    pub display_name: String,
    /// Device agent is connected
    #[serde(default)]
    pub online: bool,
    /// Device is held by another session
    #[serde(default)]
    pub locked: bool,
    /// Everything else the cloud reports, kept opaque
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Device {
    /// Create a device with no extra attributes
    pub fn new(id: u64, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            online: false,
            locked: false,
            attributes: BTreeMap::new(),
        }
    }

    /// Online and not locked by anyone
    pub fn is_available(&self) -> bool {
        self.online && !self.locked
    }
}

/// An exclusive lock on one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: u64,
    pub device: Device,
}

/// One raw property record of a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProperty {
    /// Property group, e.g. "Build version"
    #[serde(alias = "propertyGroupName")]
    pub group_name: String,
    /// Value as displayed by the cloud
    #[serde(alias = "displayName")]
    pub display_value: String,
}

impl DeviceProperty {
    pub fn new(group_name: impl Into<String>, display_value: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            display_value: display_value.into(),
        }
    }
}

/// Device control protocols exposed through session proxies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// Android debug bridge
    Adb,
    /// Gecko remote automation
    Marionette,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Adb => "adb",
            ProxyProtocol::Marionette => "marionette",
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network endpoint forwarding one protocol to a session's device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub protocol: ProxyProtocol,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Both proxies of an acquired device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxies {
    pub adb: ProxyEndpoint,
    pub marionette: ProxyEndpoint,
}

/// Exclusive access to one device, handed to the caller of `acquire_device`.
///
/// Only constructed once the session and both proxies exist. Hand it back to
/// `release_device` to unlock the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub session: Session,
    pub device: Device,
    pub proxies: Proxies,
    /// Fixed address the proxy ports are reachable on
    pub proxy_host: String,
}

impl DeviceHandle {
    pub fn session_id(&self) -> u64 {
        self.session.id
    }
}
