//! Testdroid HTTP client implementation

use std::time::{Duration, Instant};

use devfarm_core::models::value_to_string;
use devfarm_core::{Device, DeviceProperty, DeviceQuery, Filter, ProxyProtocol};
use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::CloudConfig;
use crate::error::{Result, TestdroidError};
use crate::types::*;

/// Refresh tokens this long before the cloud would expire them
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Filter keys whose Testdroid field name differs
const FIELD_ALIASES: &[(&str, &str)] = &[("type", "displayName")];

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn new(response: TokenResponse) -> Self {
        Self {
            value: response.access_token,
            expires_at: Instant::now() + Duration::from_secs(response.expires_in),
        }
    }

    fn is_fresh(&self) -> bool {
        Instant::now() + TOKEN_REFRESH_MARGIN < self.expires_at
    }
}

/// Testdroid (Bitbar) REST API client
///
/// Authenticates with the OAuth password grant on first use and caches the
/// access token until shortly before it expires. A request rejected with
/// 401 re-authenticates once and is replayed.
pub struct TestdroidClient {
    client: Client,
    base_url: Url,
    config: CloudConfig,
    token: RwLock<Option<CachedToken>>,
    label_group_id: RwLock<Option<u64>>,
}

impl TestdroidClient {
    /// Create a new client from connection settings
    pub fn new(config: CloudConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .build()?;

        let base_url = Url::parse(&config.url)?;

        Ok(Self {
            client,
            base_url,
            config,
            token: RwLock::new(None),
            label_group_id: RwLock::new(None),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // =========================================================================
    // Auth
    // =========================================================================

    async fn access_token(&self) -> Result<String> {
        let cached = self
            .token
            .read()
            .as_ref()
            .filter(|t| t.is_fresh())
            .map(|t| t.value.clone());
        if let Some(token) = cached {
            return Ok(token);
        }

        let fresh = self.authenticate().await?;
        let value = fresh.value.clone();
        *self.token.write() = Some(fresh);
        Ok(value)
    }

    #[instrument(skip(self))]
    async fn authenticate(&self) -> Result<CachedToken> {
        let url = self.url("/oauth/token")?;
        let form = [
            ("client_id", self.config.oauth_client_id.as_str()),
            ("grant_type", "password"),
            ("username", self.config.username.as_str()),
            ("password", self.config.password.as_str()),
        ];

        let response = self.client.post(url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorResponse>().await {
                Ok(err) => err.message,
                Err(_) => format!("HTTP {}", status),
            };
            return Err(TestdroidError::AuthFailed(message));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| TestdroidError::ParseError(e.to_string()))?;
        info!(
            username = %self.config.username,
            expires_in = token.expires_in,
            "Authenticated with Testdroid"
        );
        Ok(CachedToken::new(token))
    }

    // =========================================================================
    // Devices and labels
    // =========================================================================

    /// List every device
    #[instrument(skip(self))]
    pub async fn devices(&self) -> Result<Vec<Device>> {
        let url = self.url("/api/v2/devices")?;
        self.get_page(url, &[("limit", "0".to_string())]).await
    }

    /// Devices matching `query`; an unknown build label matches nothing
    #[instrument(skip(self))]
    pub async fn devices_matching(&self, query: &DeviceQuery) -> Result<Vec<Device>> {
        let url = self.url("/api/v2/devices")?;
        let mut params = vec![("limit", "0".to_string())];
        if let Some(filter) = filter_expression(&query.criteria) {
            params.push(("filter", filter));
        }

        if let Some(build) = &query.build_label {
            match self.build_label(build).await? {
                Some(label) => params.push(("label_id[]", label.id.to_string())),
                None => {
                    debug!(build = %build, "Build was never flashed");
                    return Ok(Vec::new());
                }
            }
        }

        self.get_page(url, &params).await
    }

    /// Look up the label for `build` in the build label group
    #[instrument(skip(self))]
    pub async fn build_label(&self, build: &str) -> Result<Option<Label>> {
        let group_id = match self.build_label_group_id().await? {
            Some(id) => id,
            None => return Ok(None),
        };
        let url = self.url(&format!("/api/v2/label-groups/{}/labels", group_id))?;
        let labels: Vec<Label> = self
            .get_page(url, &[("filter", eq_filter("displayName", build))])
            .await?;
        Ok(labels.into_iter().find(|l| l.display_name == build))
    }

    async fn build_label_group_id(&self) -> Result<Option<u64>> {
        let cached = *self.label_group_id.read();
        if cached.is_some() {
            return Ok(cached);
        }

        let name = &self.config.build_label_group;
        let url = self.url("/api/v2/label-groups")?;
        let groups: Vec<LabelGroup> = self
            .get_page(url, &[("filter", eq_filter("displayName", name))])
            .await?;
        let id = groups
            .into_iter()
            .find(|g| &g.display_name == name)
            .map(|g| g.id);
        match id {
            Some(id) => *self.label_group_id.write() = Some(id),
            None => warn!(group = %name, "Build label group does not exist"),
        }
        Ok(id)
    }

    /// Raw property records of a device
    #[instrument(skip(self))]
    pub async fn properties(&self, device_id: u64) -> Result<Vec<DeviceProperty>> {
        let url = self.url(&format!("/api/v2/devices/{}/properties", device_id))?;
        let records: Vec<PropertyDto> = self.get_page(url, &[("limit", "0".to_string())]).await?;
        Ok(records.into_iter().map(DeviceProperty::from).collect())
    }

    // =========================================================================
    // Projects and runs
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn find_project(&self, name: &str) -> Result<Option<ProjectDto>> {
        let url = self.url("/api/v2/me/projects")?;
        let projects: Vec<ProjectDto> = self
            .get_page(url, &[("filter", eq_filter("name", name))])
            .await?;
        Ok(projects.into_iter().find(|p| p.name == name))
    }

    #[instrument(skip(self))]
    pub async fn create_project(&self, name: &str) -> Result<ProjectDto> {
        let url = self.url("/api/v2/me/projects")?;
        let form = [("name", name.to_string())];
        let response = self
            .send(|client| client.post(url.clone()).form(&form))
            .await?;
        self.handle_response(response).await
    }

    #[instrument(skip(self))]
    pub async fn create_test_run(&self, project_id: u64) -> Result<RunDto> {
        let url = self.url(&format!("/api/v2/me/projects/{}/runs", project_id))?;
        let response = self.send(|client| client.post(url.clone())).await?;
        self.handle_response(response).await
    }

    #[instrument(skip(self))]
    pub async fn test_run(&self, project_id: u64, run_id: u64) -> Result<RunDto> {
        let url = self.run_url(project_id, run_id, "")?;
        let response = self.send(|client| client.get(url.clone())).await?;
        self.handle_response(response).await
    }

    #[instrument(skip(self))]
    pub async fn test_run_parameters(
        &self,
        project_id: u64,
        run_id: u64,
    ) -> Result<Vec<ParameterDto>> {
        let url = self.run_url(project_id, run_id, "/config/parameters")?;
        self.get_page(url, &[("limit", "0".to_string())]).await
    }

    #[instrument(skip(self))]
    pub async fn delete_test_run_parameter(
        &self,
        project_id: u64,
        run_id: u64,
        parameter_id: u64,
    ) -> Result<()> {
        let url = self.run_url(
            project_id,
            run_id,
            &format!("/config/parameters/{}", parameter_id),
        )?;
        let response = self
            .send(|client| client.request(Method::DELETE, url.clone()))
            .await?;
        self.handle_empty(response).await
    }

    #[instrument(skip(self, value))]
    pub async fn create_test_run_parameter(
        &self,
        project_id: u64,
        run_id: u64,
        key: &str,
        value: &str,
    ) -> Result<ParameterDto> {
        let url = self.run_url(project_id, run_id, "/config/parameters")?;
        let form = [("key", key.to_string()), ("value", value.to_string())];
        let response = self
            .send(|client| client.post(url.clone()).form(&form))
            .await?;
        self.handle_response(response).await
    }

    #[instrument(skip(self))]
    pub async fn start_test_run(
        &self,
        project_id: u64,
        run_id: u64,
        device_ids: &[u64],
    ) -> Result<()> {
        let url = self.run_url(project_id, run_id, "/start")?;
        let form: Vec<(&str, String)> = device_ids
            .iter()
            .map(|id| ("usedDeviceIds[]", id.to_string()))
            .collect();
        let response = self
            .send(|client| client.post(url.clone()).form(&form))
            .await?;
        self.handle_empty(response).await
    }

    #[instrument(skip(self))]
    pub async fn abort_test_run(&self, project_id: u64, run_id: u64) -> Result<()> {
        let url = self.run_url(project_id, run_id, "/abort")?;
        let response = self.send(|client| client.post(url.clone())).await?;
        self.handle_empty(response).await
    }

    // =========================================================================
    // Sessions and proxies
    // =========================================================================

    #[instrument(skip(self))]
    pub async fn start_device_session(
        &self,
        device_id: u64,
        timeout: Option<Duration>,
    ) -> Result<SessionDto> {
        let url = self.url("/api/v2/me/device-sessions")?;
        let body = StartSessionRequest {
            device_id,
            timeout: timeout.map(|t| t.as_secs()),
        };
        let response = self
            .send(|client| client.post(url.clone()).json(&body))
            .await?;
        self.handle_response(response).await
    }

    #[instrument(skip(self))]
    pub async fn stop_device_session(&self, session_id: u64) -> Result<()> {
        let url = self.url(&format!("/api/v2/me/device-sessions/{}/release", session_id))?;
        let response = self.send(|client| client.post(url.clone())).await?;
        self.handle_empty(response).await
    }

    /// Open a proxy. The cloud may take minutes to answer this one.
    #[instrument(skip(self))]
    pub async fn proxy(&self, protocol: ProxyProtocol, session_id: u64) -> Result<ProxyDto> {
        let url = self.url(&format!(
            "/api/v2/me/device-sessions/{}/proxies/{}",
            session_id, protocol
        ))?;
        let response = self.send(|client| client.get(url.clone())).await?;
        self.handle_response(response).await
    }

    // =========================================================================
    // Helper Methods
    // =========================================================================

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn run_url(&self, project_id: u64, run_id: u64, suffix: &str) -> Result<Url> {
        self.url(&format!(
            "/api/v2/me/projects/{}/runs/{}{}",
            project_id, run_id, suffix
        ))
    }

    /// Send an authenticated request, re-authenticating once on 401
    async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let token = self.access_token().await?;
        let response = build(&self.client).bearer_auth(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!("Access token rejected, re-authenticating");
        *self.token.write() = None;
        let token = self.access_token().await?;
        Ok(build(&self.client).bearer_auth(&token).send().await?)
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        url: Url,
        params: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let response = self
            .send(|client| client.get(url.clone()).query(params))
            .await?;
        self.handle_response::<Page<T>>(response)
            .await
            .map(|page| page.data)
    }

    /// Handle response and parse JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| TestdroidError::ParseError(e.to_string()))
        } else {
            Err(self.extract_error_from_status(response, status).await)
        }
    }

    /// Handle a response whose body is ignored
    async fn handle_empty(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(self.extract_error_from_status(response, status).await)
        }
    }

    async fn extract_error_from_status(
        &self,
        response: reqwest::Response,
        status: StatusCode,
    ) -> TestdroidError {
        let message = match response.json::<ErrorResponse>().await {
            Ok(err) => err.message,
            Err(_) => format!("HTTP {}", status),
        };

        match status {
            StatusCode::NOT_FOUND => TestdroidError::NotFound(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TestdroidError::AuthFailed(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TestdroidError::Timeout,
            _ => TestdroidError::server_error(status.as_u16(), message),
        }
    }
}

/// Render criteria in Testdroid's `field_eq_value;...` filter syntax.
///
/// Criteria that are not strings or primitives are skipped.
pub fn filter_expression(criteria: &Filter) -> Option<String> {
    let clauses: Vec<String> = criteria
        .iter()
        .filter_map(|(key, value)| match value_to_string(value) {
            Some(value) => Some(eq_filter(field_name(key), &value)),
            None => {
                warn!(key = %key, "Ignoring non-scalar filter value");
                None
            }
        })
        .collect();

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(";"))
    }
}

fn field_name(key: &str) -> &str {
    FIELD_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, field)| *field)
        .unwrap_or(key)
}

fn eq_filter(field: &str, value: &str) -> String {
    format!("{}_eq_{}", field, value)
}
