//! Test utilities for devfarm-client
//!
//! [`StubTestdroid`] serves the subset of the Testdroid API the client uses,
//! backed by a [`FakeDeviceCloud`]. [`TestServer`] runs any router on an
//! ephemeral port and hands back a client pointed at it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use devfarm_core::{
    DeviceCloud, DeviceQuery, FakeDeviceCloud, FarmError, Filter, FlashJob, FlashRun,
    ProxyProtocol, RunState,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;

use crate::client::TestdroidClient;
use crate::config::CloudConfig;
use crate::error::Result;
use crate::types::*;

const BUILD_LABEL_GROUP_ID: u64 = 1;

/// A test server that automatically shuts down when dropped
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: TestdroidClient,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Serve `router` and build a client with the stub's credentials
    pub async fn start(router: Router) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        // Give server a moment to start
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut config = CloudConfig::new(format!("http://{}", addr))
            .with_credentials(StubTestdroid::USERNAME, StubTestdroid::PASSWORD);
        config.timeout_secs = 5;
        config.connect_timeout_secs = 2;
        let client = TestdroidClient::new(config)?;

        Ok(Self {
            addr,
            client,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Get the base URL of the test server
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Shutdown the server gracefully
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Stub of the Testdroid API over a [`FakeDeviceCloud`]
#[derive(Clone)]
pub struct StubTestdroid {
    inner: Arc<StubState>,
}

struct StubState {
    cloud: Arc<FakeDeviceCloud>,
    tokens: Mutex<Vec<String>>,
    token_requests: AtomicU32,
    /// Label ids are indexes into this list
    labels: Mutex<Vec<String>>,
}

impl StubTestdroid {
    pub const USERNAME: &'static str = "tester";
    pub const PASSWORD: &'static str = "hunter2";

    pub fn new(cloud: Arc<FakeDeviceCloud>) -> Self {
        Self {
            inner: Arc::new(StubState {
                cloud,
                tokens: Mutex::new(Vec::new()),
                token_requests: AtomicU32::new(0),
                labels: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn cloud(&self) -> &Arc<FakeDeviceCloud> {
        &self.inner.cloud
    }

    /// Number of password grants served
    pub fn token_requests(&self) -> u32 {
        self.inner.token_requests.load(Ordering::SeqCst)
    }

    /// Forget every issued token so the next request gets a 401
    pub fn revoke_tokens(&self) {
        self.inner.tokens.lock().clear();
    }

    pub fn router(&self) -> Router {
        let runs = "/api/v2/me/projects/{project_id}/runs/{run_id}";
        Router::new()
            .route("/oauth/token", post(issue_token))
            .route("/api/v2/devices", get(list_devices))
            .route("/api/v2/devices/{device_id}/properties", get(device_properties))
            .route("/api/v2/label-groups", get(label_groups))
            .route("/api/v2/label-groups/{group_id}/labels", get(labels))
            .route("/api/v2/me/projects", get(find_projects).post(create_project))
            .route("/api/v2/me/projects/{project_id}/runs", post(create_run))
            .route(runs, get(get_run))
            .route(&format!("{}/start", runs), post(start_run))
            .route(&format!("{}/abort", runs), post(abort_run))
            .route(
                &format!("{}/config/parameters", runs),
                get(list_parameters).post(create_parameter),
            )
            .route(
                &format!("{}/config/parameters/{{parameter_id}}", runs),
                delete(delete_parameter),
            )
            .route("/api/v2/me/device-sessions", post(start_session))
            .route(
                "/api/v2/me/device-sessions/{session_id}/release",
                post(release_session),
            )
            .route(
                "/api/v2/me/device-sessions/{session_id}/proxies/{protocol}",
                get(get_proxy),
            )
            .with_state(self.clone())
    }

    fn authorize(&self, headers: &HeaderMap) -> std::result::Result<(), StubError> {
        let token = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        match token {
            Some(token) if self.inner.tokens.lock().iter().any(|t| t == token) => Ok(()),
            _ => Err(StubError(StatusCode::UNAUTHORIZED, "invalid token".to_string())),
        }
    }

    fn label_id(&self, name: &str) -> u64 {
        let mut labels = self.inner.labels.lock();
        let index = match labels.iter().position(|l| l == name) {
            Some(index) => index,
            None => {
                labels.push(name.to_string());
                labels.len() - 1
            }
        };
        index as u64 + 1
    }

    fn label_name(&self, id: u64) -> Option<String> {
        let index = usize::try_from(id.checked_sub(1)?).ok()?;
        self.inner.labels.lock().get(index).cloned()
    }
}

struct StubError(StatusCode, String);

impl IntoResponse for StubError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            message: self.1,
            status_code: Some(self.0.as_u16()),
        };
        (self.0, Json(body)).into_response()
    }
}

impl From<FarmError> for StubError {
    fn from(e: FarmError) -> Self {
        let status =
            StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        StubError(status, e.to_string())
    }
}

type StubResult<T> = std::result::Result<Json<T>, StubError>;

/// Parse `field_eq_value;...` back into filter criteria
fn parse_filter(expression: Option<&String>) -> Filter {
    let mut filter = Filter::new();
    let Some(expression) = expression else {
        return filter;
    };
    for clause in expression.split(';') {
        if let Some((field, value)) = clause.split_once("_eq_") {
            let key = if field == "displayName" { "type" } else { field };
            filter = filter.with(key, value);
        }
    }
    filter
}

fn run_ref(project_id: u64, run_id: u64) -> FlashRun {
    FlashRun {
        id: run_id,
        job_id: project_id,
        state: RunState::Unknown,
        outcome: None,
        created_at: None,
    }
}

async fn issue_token(
    State(stub): State<StubTestdroid>,
    Form(form): Form<HashMap<String, String>>,
) -> StubResult<TokenResponse> {
    let valid = form.get("grant_type").map(String::as_str) == Some("password")
        && form.get("username").map(String::as_str) == Some(StubTestdroid::USERNAME)
        && form.get("password").map(String::as_str) == Some(StubTestdroid::PASSWORD);
    if !valid {
        return Err(StubError(StatusCode::UNAUTHORIZED, "bad credentials".to_string()));
    }

    let count = stub.inner.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    let token = format!("stub-token-{}", count);
    stub.inner.tokens.lock().push(token.clone());
    Ok(Json(TokenResponse {
        access_token: token,
        expires_in: 3600,
        refresh_token: None,
    }))
}

async fn list_devices(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> StubResult<Page<devfarm_core::Device>> {
    stub.authorize(&headers)?;
    let mut query = DeviceQuery::from_filter(&parse_filter(params.get("filter")));
    if let Some(label_id) = params.get("label_id[]") {
        let name = label_id
            .parse()
            .ok()
            .and_then(|id| stub.label_name(id))
            .ok_or_else(|| StubError(StatusCode::NOT_FOUND, "unknown label".to_string()))?;
        query = query.with_build_label(name);
    }

    let devices = if query.criteria.is_empty() && query.build_label.is_none() {
        stub.cloud().list_devices().await?
    } else {
        stub.cloud().query_devices(&query).await?
    };
    Ok(Json(Page::new(devices)))
}

async fn device_properties(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path(device_id): Path<u64>,
) -> StubResult<Page<PropertyDto>> {
    stub.authorize(&headers)?;
    let records = stub.cloud().device_properties(device_id).await?;
    Ok(Json(Page::new(
        records
            .into_iter()
            .map(|p| PropertyDto {
                property_group_name: p.group_name,
                display_name: p.display_value,
            })
            .collect(),
    )))
}

async fn label_groups(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
) -> StubResult<Page<LabelGroup>> {
    stub.authorize(&headers)?;
    Ok(Json(Page::new(vec![LabelGroup {
        id: BUILD_LABEL_GROUP_ID,
        display_name: "Build version".to_string(),
    }])))
}

async fn labels(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path(group_id): Path<u64>,
    Query(params): Query<HashMap<String, String>>,
) -> StubResult<Page<Label>> {
    stub.authorize(&headers)?;
    if group_id != BUILD_LABEL_GROUP_ID {
        return Err(StubError(StatusCode::NOT_FOUND, "unknown label group".to_string()));
    }
    let name = params
        .get("filter")
        .and_then(|f| f.strip_prefix("displayName_eq_"))
        .unwrap_or_default();
    if name.is_empty() {
        return Ok(Json(Page::new(Vec::new())));
    }
    Ok(Json(Page::new(vec![Label {
        id: stub.label_id(name),
        display_name: name.to_string(),
    }])))
}

async fn find_projects(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> StubResult<Page<ProjectDto>> {
    stub.authorize(&headers)?;
    let name = params
        .get("filter")
        .and_then(|f| f.strip_prefix("name_eq_"))
        .unwrap_or_default();
    let projects = stub
        .cloud()
        .job(name)
        .map(|job| ProjectDto {
            id: job.id,
            name: job.name,
        })
        .into_iter()
        .collect();
    Ok(Json(Page::new(projects)))
}

async fn create_project(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> StubResult<ProjectDto> {
    stub.authorize(&headers)?;
    let name = form.get("name").cloned().unwrap_or_default();
    let job = stub.cloud().get_or_create_job(&name).await?;
    Ok(Json(ProjectDto {
        id: job.id,
        name: job.name,
    }))
}

async fn create_run(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path(project_id): Path<u64>,
) -> StubResult<RunDto> {
    stub.authorize(&headers)?;
    let job = FlashJob {
        id: project_id,
        name: String::new(),
    };
    let run = stub.cloud().create_run(&job).await?;
    Ok(Json(RunDto::from(&run)))
}

async fn get_run(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path((project_id, run_id)): Path<(u64, u64)>,
) -> StubResult<RunDto> {
    stub.authorize(&headers)?;
    let run = stub.cloud().get_run(&run_ref(project_id, run_id)).await?;
    Ok(Json(RunDto::from(&run)))
}

async fn start_run(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path((project_id, run_id)): Path<(u64, u64)>,
    Form(form): Form<Vec<(String, String)>>,
) -> std::result::Result<StatusCode, StubError> {
    stub.authorize(&headers)?;
    let device_ids: Vec<u64> = form
        .iter()
        .filter(|(k, _)| k == "usedDeviceIds[]")
        .filter_map(|(_, v)| v.parse().ok())
        .collect();
    stub.cloud()
        .start_run(&run_ref(project_id, run_id), &device_ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn abort_run(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path((project_id, run_id)): Path<(u64, u64)>,
) -> std::result::Result<StatusCode, StubError> {
    stub.authorize(&headers)?;
    stub.cloud().abort_run(&run_ref(project_id, run_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_parameters(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path((project_id, run_id)): Path<(u64, u64)>,
) -> StubResult<Page<ParameterDto>> {
    stub.authorize(&headers)?;
    let parameters = stub
        .cloud()
        .list_run_parameters(&run_ref(project_id, run_id))
        .await?;
    Ok(Json(Page::new(
        parameters
            .into_iter()
            .map(|p| ParameterDto {
                id: p.id,
                key: p.key,
                value: p.value,
            })
            .collect(),
    )))
}

async fn create_parameter(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path((project_id, run_id)): Path<(u64, u64)>,
    Form(form): Form<HashMap<String, String>>,
) -> StubResult<ParameterDto> {
    stub.authorize(&headers)?;
    let (Some(key), Some(value)) = (form.get("key"), form.get("value")) else {
        return Err(StubError(StatusCode::BAD_REQUEST, "key and value required".to_string()));
    };
    let parameter = stub
        .cloud()
        .create_run_parameter(&run_ref(project_id, run_id), key, value)
        .await?;
    Ok(Json(ParameterDto {
        id: parameter.id,
        key: parameter.key,
        value: parameter.value,
    }))
}

async fn delete_parameter(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path((project_id, run_id, parameter_id)): Path<(u64, u64, u64)>,
) -> std::result::Result<StatusCode, StubError> {
    stub.authorize(&headers)?;
    stub.cloud()
        .delete_run_parameter(&run_ref(project_id, run_id), parameter_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_session(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Json(body): Json<StartSessionRequest>,
) -> StubResult<SessionDto> {
    stub.authorize(&headers)?;
    let session = stub
        .cloud()
        .start_session(body.device_id, body.timeout.map(Duration::from_secs))
        .await?;
    Ok(Json(SessionDto {
        id: session.id,
        device: session.device,
    }))
}

async fn release_session(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path(session_id): Path<u64>,
) -> std::result::Result<StatusCode, StubError> {
    stub.authorize(&headers)?;
    stub.cloud().stop_session(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_proxy(
    State(stub): State<StubTestdroid>,
    headers: HeaderMap,
    Path((session_id, protocol)): Path<(u64, ProxyProtocol)>,
) -> StubResult<ProxyDto> {
    stub.authorize(&headers)?;
    let proxy = stub.cloud().get_proxy(protocol, session_id).await?;
    Ok(Json(ProxyDto {
        port: proxy.port,
        host: proxy.host,
    }))
}
