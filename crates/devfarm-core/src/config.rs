//! Orchestrator configuration
//!
//! Every tunable has a serde default so the daemon can embed this as a
//! partially-filled `[orchestrator]` TOML table.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FarmError, FarmResult};
use crate::selection::SelectionStrategy;

/// Longest flash deadline accepted (one day)
pub const MAX_DEADLINE_SECS: u64 = 24 * 60 * 60;
/// Longest signature lifetime accepted (30 days)
pub const MAX_TTL_SECS: u64 = 30 * 24 * 60 * 60;

/// Top-level orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Online device search
    #[serde(default)]
    pub search: SearchConfig,

    /// Session start retries
    #[serde(default)]
    pub session: SessionConfig,

    /// Flashing job
    #[serde(default)]
    pub flash: FlashJobConfig,

    /// Build URL signing credentials
    #[serde(default)]
    pub signing: SigningConfig,

    /// Address the proxy ports are reachable on
    #[serde(default = "default_proxy_host")]
    pub proxy_host: String,

    /// How to pick among several eligible devices
    #[serde(default)]
    pub selection: SelectionStrategy,

    /// Retry budget used when a caller does not name one
    #[serde(default = "default_retry_budget")]
    pub default_retry_budget: u32,

    /// Largest retry budget a caller may ask for
    #[serde(default = "default_max_retry_budget")]
    pub max_retry_budget: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            session: SessionConfig::default(),
            flash: FlashJobConfig::default(),
            signing: SigningConfig::default(),
            proxy_host: default_proxy_host(),
            selection: SelectionStrategy::default(),
            default_retry_budget: default_retry_budget(),
            max_retry_budget: default_max_retry_budget(),
        }
    }
}

fn default_proxy_host() -> String {
    "localhost".to_string()
}

fn default_retry_budget() -> u32 {
    2
}

fn default_max_retry_budget() -> u32 {
    5
}

/// Online device search settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Query attempts before giving up (default: 5)
    #[serde(default = "default_search_attempts")]
    pub attempts: u32,

    /// Delay between empty results in milliseconds (default: 2s)
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            attempts: default_search_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl SearchConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Session start settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Tries per device (default: 5)
    #[serde(default = "default_session_attempts")]
    pub attempts: u32,

    /// Delay between failed tries in milliseconds (default: 2s)
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,

    /// Session timeout passed to the cloud, if any
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            attempts: default_session_attempts(),
            delay_ms: default_delay_ms(),
            timeout_secs: None,
        }
    }
}

impl SessionConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn default_search_attempts() -> u32 {
    5
}

fn default_session_attempts() -> u32 {
    5
}

fn default_delay_ms() -> u64 {
    2_000
}

/// Flashing job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashJobConfig {
    /// Name of the job template (default: "flash-fxos")
    #[serde(default = "default_job_name")]
    pub job_name: String,

    /// Run parameter receiving the signed build URL
    #[serde(default = "default_build_param")]
    pub build_param: String,

    /// Run parameter receiving the memory requirement
    #[serde(default = "default_memory_param")]
    pub memory_param: String,

    /// Poll interval in milliseconds (default: 2s)
    #[serde(default = "default_delay_ms")]
    pub poll_interval_ms: u64,

    /// Wall-clock deadline from run creation in seconds (default: 10 minutes)
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Ask the cloud to abort a run that missed its deadline
    #[serde(default = "default_true")]
    pub abort_on_timeout: bool,
}

impl Default for FlashJobConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            build_param: default_build_param(),
            memory_param: default_memory_param(),
            poll_interval_ms: default_delay_ms(),
            deadline_secs: default_deadline_secs(),
            abort_on_timeout: true,
        }
    }
}

impl FlashJobConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

fn default_job_name() -> String {
    "flash-fxos".to_string()
}

fn default_build_param() -> String {
    "build".to_string()
}

fn default_memory_param() -> String {
    "memory".to_string()
}

fn default_deadline_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

/// Credentials used to sign build URLs
#[derive(Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    #[serde(default)]
    pub client_id: String,

    #[serde(default)]
    pub access_token: String,

    /// Signature validity in seconds (default: 1 hour)
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            access_token: String::new(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("client_id", &self.client_id)
            .field("access_token", &"<redacted>")
            .field("ttl_secs", &self.ttl_secs)
            .finish()
    }
}

fn default_ttl_secs() -> u64 {
    crate::signer::DEFAULT_TTL_SECS
}

impl OrchestratorConfig {
    /// Create a builder for programmatic configuration
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder {
            config: OrchestratorConfig::default(),
        }
    }

    /// Reject settings that would make acquisition spin, never search, or overflow
    pub fn validate(&self) -> FarmResult<()> {
        fn invalid(message: String) -> FarmResult<()> {
            Err(FarmError::InvalidConfig(message))
        }

        if self.search.attempts == 0 {
            return invalid("search.attempts must be at least 1".to_string());
        }
        if self.session.attempts == 0 {
            return invalid("session.attempts must be at least 1".to_string());
        }
        if self.flash.poll_interval_ms == 0 {
            return invalid("flash.poll_interval_ms must be positive".to_string());
        }
        if self.flash.deadline_secs == 0 || self.flash.deadline_secs > MAX_DEADLINE_SECS {
            return invalid(format!(
                "flash.deadline_secs must be within 1..={}",
                MAX_DEADLINE_SECS
            ));
        }
        if self.signing.ttl_secs == 0 || self.signing.ttl_secs > MAX_TTL_SECS {
            return invalid(format!("signing.ttl_secs must be within 1..={}", MAX_TTL_SECS));
        }
        if self.max_retry_budget == 0 {
            return invalid("max_retry_budget must be at least 1".to_string());
        }
        if self.default_retry_budget == 0 || self.default_retry_budget > self.max_retry_budget {
            return invalid(format!(
                "default_retry_budget must be within 1..={}",
                self.max_retry_budget
            ));
        }
        Ok(())
    }

    /// Time `retry_budget` rounds take when every wait runs to its limit.
    ///
    /// Counts one candidate per session phase; each extra candidate adds
    /// another round of session tries. Remote call latency is not included.
    pub fn acquisition_window(&self, retry_budget: u32) -> Duration {
        let session_tries = self
            .session
            .delay()
            .saturating_mul(self.session.attempts.saturating_sub(1));
        let search_waits = self
            .search
            .delay()
            .saturating_mul(self.search.attempts.saturating_sub(1));
        let round = session_tries
            .saturating_add(self.flash.deadline())
            .saturating_add(search_waits)
            .saturating_add(session_tries);
        round.saturating_mul(retry_budget)
    }
}

/// Builder for OrchestratorConfig
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    /// Set the signing credentials
    pub fn credentials(mut self, client_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        self.config.signing.client_id = client_id.into();
        self.config.signing.access_token = access_token.into();
        self
    }

    /// Set the proxy host
    pub fn proxy_host(mut self, host: impl Into<String>) -> Self {
        self.config.proxy_host = host.into();
        self
    }

    /// Set the device selection strategy
    pub fn selection(mut self, selection: SelectionStrategy) -> Self {
        self.config.selection = selection;
        self
    }

    /// Set search attempts and delay
    pub fn search(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.config.search = SearchConfig { attempts, delay_ms };
        self
    }

    /// Set session tries per device and delay
    pub fn session(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.config.session.attempts = attempts;
        self.config.session.delay_ms = delay_ms;
        self
    }

    /// Set flash poll interval and deadline
    pub fn flash_timing(mut self, poll_interval_ms: u64, deadline_secs: u64) -> Self {
        self.config.flash.poll_interval_ms = poll_interval_ms;
        self.config.flash.deadline_secs = deadline_secs;
        self
    }

    /// Set the run parameter receiving the build URL
    pub fn build_param(mut self, key: impl Into<String>) -> Self {
        self.config.flash.build_param = key.into();
        self
    }

    /// Set the flash job name
    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.config.flash.job_name = name.into();
        self
    }

    /// Build the configuration
    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.search.attempts, 5);
        assert_eq!(config.search.delay(), Duration::from_secs(2));
        assert_eq!(config.session.attempts, 5);
        assert_eq!(config.flash.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.flash.deadline(), Duration::from_secs(600));
        assert_eq!(config.flash.job_name, "flash-fxos");
        assert_eq!(config.signing.ttl_secs, 3600);
        assert_eq!(config.selection, SelectionStrategy::FirstMatch);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: OrchestratorConfig = serde_json::from_str(
            r#"{"proxy_host": "10.0.0.5", "flash": {"deadline_secs": 60}, "selection": "random"}"#,
        )
        .unwrap();
        assert_eq!(config.proxy_host, "10.0.0.5");
        assert_eq!(config.flash.deadline_secs, 60);
        assert_eq!(config.flash.poll_interval_ms, 2_000);
        assert_eq!(config.selection, SelectionStrategy::Random);
        assert_eq!(config.default_retry_budget, 2);
    }

    #[test]
    fn test_defaults_are_valid() {
        OrchestratorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_out_of_range_values() {
        let cases: [fn(&mut OrchestratorConfig); 9] = [
            |c| c.search.attempts = 0,
            |c| c.session.attempts = 0,
            |c| c.flash.poll_interval_ms = 0,
            |c| c.flash.deadline_secs = 0,
            |c| c.flash.deadline_secs = u64::MAX,
            |c| c.signing.ttl_secs = u64::MAX,
            |c| c.default_retry_budget = 0,
            |c| c.default_retry_budget = 6,
            |c| c.max_retry_budget = 0,
        ];
        for mutate in cases {
            let mut config = OrchestratorConfig::default();
            mutate(&mut config);
            assert!(matches!(
                config.validate(),
                Err(FarmError::InvalidConfig(_))
            ));
        }
    }

    #[test]
    fn test_acquisition_window_covers_flash_deadlines() {
        let config = OrchestratorConfig::default();
        // 8s of session retries, 600s deadline, 8s of searching, 8s of session retries
        assert_eq!(config.acquisition_window(1), Duration::from_secs(624));
        assert_eq!(config.acquisition_window(2), Duration::from_secs(1248));
        assert!(config.acquisition_window(u32::MAX) > Duration::from_secs(600));
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = OrchestratorConfig::builder()
            .credentials("client", "s3cret")
            .build();
        let debug = format!("{:?}", config.signing);
        assert!(!debug.contains("s3cret"));
    }
}
