//! Daemon configuration file

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use devfarm_client::CloudConfig;
use devfarm_core::OrchestratorConfig;
use serde::Deserialize;

/// Contents of `devfarmd.toml`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Device cloud connection; required unless running against the fake cloud
    #[serde(default)]
    pub cloud: Option<CloudConfig>,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound for one request; derived from the retry budget when unset
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: None,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    18090
}

impl DaemonConfig {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply command-line overrides on top of the file
    pub fn merge_with_args(
        mut self,
        port: Option<u16>,
        cloud_url: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        if let Some(port) = port {
            self.server.port = port;
        }
        if let Some(url) = cloud_url {
            match self.cloud.as_mut() {
                Some(cloud) => cloud.url = url.to_string(),
                None => self.cloud = Some(CloudConfig::new(url)),
            }
        }
        if let Some(cloud) = self.cloud.as_mut() {
            if let Some(username) = username {
                cloud.username = username.to_string();
            }
            if let Some(password) = password {
                cloud.password = password.to_string();
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devfarm_core::SelectionStrategy;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = DaemonConfig::parse("").unwrap();
        assert_eq!(config.server.port, 18090);
        assert_eq!(config.server.request_timeout(), None);
        assert!(config.cloud.is_none());
        assert_eq!(config.orchestrator.search.attempts, 5);
        assert_eq!(config.orchestrator.default_retry_budget, 2);
    }

    #[test]
    fn test_partial_orchestrator_table() {
        let config = DaemonConfig::parse(
            r#"
            [server]
            port = 9000
            request_timeout_secs = 900

            [cloud]
            url = "https://cloud.testdroid.com"
            username = "ci@example.com"

            [orchestrator]
            proxy_host = "10.1.2.3"
            selection = "random"

            [orchestrator.flash]
            job_name = "flash-fxos"
            build_param = "FLAME_ZIP_URL"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.request_timeout(), Some(Duration::from_secs(900)));
        let cloud = config.cloud.unwrap();
        assert_eq!(cloud.url, "https://cloud.testdroid.com");
        assert_eq!(cloud.timeout_secs, 660);
        assert_eq!(config.orchestrator.proxy_host, "10.1.2.3");
        assert_eq!(config.orchestrator.selection, SelectionStrategy::Random);
        assert_eq!(config.orchestrator.flash.build_param, "FLAME_ZIP_URL");
        assert_eq!(config.orchestrator.flash.memory_param, "memory");
        assert_eq!(config.orchestrator.session.attempts, 5);
    }

    #[test]
    fn test_args_override_file() {
        let config = DaemonConfig::parse("[cloud]\nurl = \"https://a.example\"\n")
            .unwrap()
            .merge_with_args(Some(8081), None, Some("user"), Some("secret"));

        assert_eq!(config.server.port, 8081);
        let cloud = config.cloud.unwrap();
        assert_eq!(cloud.url, "https://a.example");
        assert_eq!(cloud.username, "user");
        assert_eq!(cloud.password, "secret");
    }

    #[test]
    fn test_cloud_url_arg_creates_cloud_section() {
        let config = DaemonConfig::default().merge_with_args(
            None,
            Some("https://b.example"),
            Some("user"),
            None,
        );
        let cloud = config.cloud.unwrap();
        assert_eq!(cloud.url, "https://b.example");
        assert_eq!(cloud.username, "user");
    }
}
