//! Testdroid connection settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// OAuth client id the Testdroid web API expects
pub const DEFAULT_OAUTH_CLIENT_ID: &str = "testdroid-cloud-api";

/// Where and as whom to talk to the cloud
#[derive(Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Base URL, e.g. "https://cloud.testdroid.com"
    pub url: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_oauth_client_id")]
    pub oauth_client_id: String,

    /// Per-request timeout in seconds (default: 11 minutes, longer than a flash)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Label group holding build labels
    #[serde(default = "default_build_label_group")]
    pub build_label_group: String,
}

impl CloudConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: String::new(),
            password: String::new(),
            oauth_client_id: default_oauth_client_id(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            build_label_group: default_build_label_group(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl std::fmt::Debug for CloudConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("oauth_client_id", &self.oauth_client_id)
            .field("timeout_secs", &self.timeout_secs)
            .field("build_label_group", &self.build_label_group)
            .finish()
    }
}

fn default_oauth_client_id() -> String {
    DEFAULT_OAUTH_CLIENT_ID.to_string()
}

fn default_timeout_secs() -> u64 {
    11 * 60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_build_label_group() -> String {
    "Build version".to_string()
}
