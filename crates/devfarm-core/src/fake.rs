//! In-memory device cloud for tests and demo mode
//!
//! Models just enough of a device farm to drive the orchestrator end to end:
//! devices with attributes and build labels, job runs that finish after a
//! number of polls, sessions that lock devices, and proxies with ascending
//! ports. Every call is recorded in a [`CallLog`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::cloud::DeviceCloud;
use crate::error::{FarmError, FarmResult};
use crate::models::{
    value_to_string, Device, DeviceProperty, DeviceQuery, FlashJob, FlashRun, ProxyEndpoint,
    ProxyProtocol, RunOutcome, RunParameter, RunState, Session, BUILD_KEY,
};
use crate::signer::strip_signature;

const FIRST_PROXY_PORT: u16 = 15_000;

/// How a device answers session requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionBehavior {
    #[default]
    Accept,
    /// Refuse the next `n` requests, then accept
    FailTimes(u32),
    AlwaysFail,
}

/// How started runs progress
#[derive(Debug, Clone, PartialEq)]
pub struct FlashBehavior {
    /// Polls until the run reports finished; `None` never finishes
    pub polls_until_finished: Option<u32>,
    pub outcome: RunOutcome,
    /// Flashed devices come back online; otherwise they drop offline
    pub device_online_after: bool,
}

impl Default for FlashBehavior {
    fn default() -> Self {
        Self::finishes_after(2)
    }
}

impl FlashBehavior {
    pub fn finishes_after(polls: u32) -> Self {
        Self {
            polls_until_finished: Some(polls.max(1)),
            outcome: RunOutcome::Succeeded,
            device_online_after: true,
        }
    }

    pub fn never_finishes() -> Self {
        Self {
            polls_until_finished: None,
            outcome: RunOutcome::Succeeded,
            device_online_after: true,
        }
    }

    pub fn with_outcome(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Flashing succeeds but leaves the device offline
    pub fn device_stays_offline(mut self) -> Self {
        self.device_online_after = false;
        self
    }
}

/// How run polls fail before the run is consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFailure {
    /// The next `n` polls fail with a remote error
    Transient(u32),
    /// Every poll is rejected as a bad request
    Rejected,
}

/// A device as seeded into the fake
#[derive(Debug, Clone)]
pub struct FakeDevice {
    device: Device,
    build: Option<String>,
    properties: Vec<DeviceProperty>,
    sessions: SessionBehavior,
}

impl FakeDevice {
    /// Offline, unlocked device whose `type` attribute is `device_type`
    pub fn new(id: u64, device_type: &str) -> Self {
        let mut device = Device::new(id, device_type);
        device
            .attributes
            .insert("type".to_string(), device_type.into());
        Self {
            device,
            build: None,
            properties: Vec::new(),
            sessions: SessionBehavior::Accept,
        }
    }

    pub fn online(mut self) -> Self {
        self.device.online = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.device.locked = true;
        self
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.device.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Label the device as already running `build`
    pub fn flashed_with(mut self, build: &str) -> Self {
        self.build = Some(build.to_string());
        self
    }

    pub fn with_property(mut self, group: &str, value: &str) -> Self {
        self.properties.push(DeviceProperty::new(group, value));
        self
    }

    pub fn sessions(mut self, behavior: SessionBehavior) -> Self {
        self.sessions = behavior;
        self
    }

    fn matches(&self, query: &DeviceQuery) -> bool {
        let criteria_match = query.criteria.iter().all(|(key, wanted)| {
            let wanted = value_to_string(wanted);
            let actual = self.device.attributes.get(key).and_then(value_to_string);
            wanted.is_some() && wanted == actual
        });
        let label_match = match &query.build_label {
            Some(build) => self.build.as_deref() == Some(build.as_str()),
            None => true,
        };
        criteria_match && label_match
    }
}

/// Every call the fake has served
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    /// When each inventory query arrived
    pub query_devices: Vec<Instant>,
    /// Device id of each session request, in order
    pub start_session: Vec<u64>,
    pub stop_session: Vec<u64>,
    pub created_runs: Vec<u64>,
    pub deleted_parameters: Vec<u64>,
    pub created_parameters: Vec<(String, String)>,
    pub started_runs: Vec<(u64, Vec<u64>)>,
    pub get_run: u32,
    pub aborted_runs: Vec<u64>,
    pub proxies: Vec<(ProxyProtocol, u64)>,
    remote_calls: u32,
}

impl CallLog {
    /// Total number of remote calls of any kind
    pub fn total(&self) -> u32 {
        self.remote_calls
    }
}

#[derive(Debug)]
struct FakeRun {
    run: FlashRun,
    parameters: Vec<RunParameter>,
    device_ids: Vec<u64>,
    polls_remaining: Option<u32>,
}

#[derive(Debug, Default)]
struct FakeState {
    devices: Vec<FakeDevice>,
    jobs: Vec<FlashJob>,
    runs: HashMap<u64, FakeRun>,
    /// session id -> device id
    sessions: HashMap<u64, u64>,
    stale_parameters: Vec<(String, String)>,
    flash: FlashBehavior,
    failing_proxy: Option<ProxyProtocol>,
    proxy_delay: Option<Duration>,
    failing_queries: bool,
    failing_polls: Option<PollFailure>,
    /// Run parameter holding the build a finished run labels devices with
    build_param: String,
    /// (device id, queries served before it comes online)
    pending_online: Vec<(u64, usize)>,
    next_id: u64,
    next_port: u16,
    calls: CallLog,
}

impl FakeState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn device_mut(&mut self, device_id: u64) -> FarmResult<&mut FakeDevice> {
        self.devices
            .iter_mut()
            .find(|d| d.device.id == device_id)
            .ok_or_else(|| FarmError::NotFound(format!("device {}", device_id)))
    }

    fn run_mut(&mut self, run_id: u64) -> FarmResult<&mut FakeRun> {
        self.runs
            .get_mut(&run_id)
            .ok_or_else(|| FarmError::NotFound(format!("run {}", run_id)))
    }

    fn complete_run(&mut self, run_id: u64) {
        let flash = self.flash.clone();
        let build_param = self.build_param.clone();
        let (device_ids, build) = match self.runs.get_mut(&run_id) {
            Some(fake_run) => {
                fake_run.run.state = RunState::Finished;
                fake_run.run.outcome = Some(flash.outcome);
                let build = fake_run
                    .parameters
                    .iter()
                    .find(|p| p.key == build_param)
                    .map(|p| strip_signature(&p.value));
                (fake_run.device_ids.clone(), build)
            }
            None => return,
        };

        if flash.outcome != RunOutcome::Succeeded {
            return;
        }
        for device_id in device_ids {
            if let Ok(fake) = self.device_mut(device_id) {
                fake.build = build.clone();
                fake.device.online = flash.device_online_after;
                fake.device.locked = false;
            }
        }
    }
}

/// In-memory [`DeviceCloud`]
pub struct FakeDeviceCloud {
    state: Mutex<FakeState>,
}

impl Default for FakeDeviceCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDeviceCloud {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id: 1_000,
                next_port: FIRST_PROXY_PORT,
                build_param: BUILD_KEY.to_string(),
                ..FakeState::default()
            }),
        }
    }

    /// A small farm for demo mode: two online flames and an offline keon
    pub fn sample() -> Self {
        let cloud = Self::new();
        cloud.add_device(
            FakeDevice::new(1, "flame")
                .online()
                .with_attribute("memory", 319)
                .with_property("Build version", "unflashed"),
        );
        cloud.add_device(
            FakeDevice::new(2, "flame")
                .online()
                .with_attribute("memory", 1024)
                .with_property("Build version", "unflashed"),
        );
        cloud.add_device(
            FakeDevice::new(3, "keon")
                .with_attribute("memory", 512)
                .with_property("Build version", "unflashed"),
        );
        cloud
    }

    pub fn add_device(&self, device: FakeDevice) {
        self.state.lock().devices.push(device);
    }

    /// Current cloud-side view of a device
    pub fn device(&self, device_id: u64) -> Option<Device> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.device.id == device_id)
            .map(|d| d.device.clone())
    }

    /// Build the device is labelled with, if any
    pub fn device_build(&self, device_id: u64) -> Option<String> {
        self.state
            .lock()
            .devices
            .iter()
            .find(|d| d.device.id == device_id)
            .and_then(|d| d.build.clone())
    }

    /// Job template called `name`, if one was created
    pub fn job(&self, name: &str) -> Option<FlashJob> {
        self.state.lock().jobs.iter().find(|j| j.name == name).cloned()
    }

    /// Device goes online once `after_queries` inventory queries were served
    pub fn bring_online_after_queries(&self, device_id: u64, after_queries: usize) {
        self.state
            .lock()
            .pending_online
            .push((device_id, after_queries));
    }

    pub fn set_flash_behavior(&self, behavior: FlashBehavior) {
        self.state.lock().flash = behavior;
    }

    /// Parameter every new run inherits
    pub fn seed_stale_parameter(&self, key: &str, value: &str) {
        self.state
            .lock()
            .stale_parameters
            .push((key.to_string(), value.to_string()));
    }

    pub fn fail_proxy(&self, protocol: ProxyProtocol) {
        self.state.lock().failing_proxy = Some(protocol);
    }

    /// Answer every proxy request only after `delay`
    pub fn delay_proxies(&self, delay: Duration) {
        self.state.lock().proxy_delay = Some(delay);
    }

    pub fn fail_run_polls(&self, failure: PollFailure) {
        self.state.lock().failing_polls = Some(failure);
    }

    /// Run parameter the flashed build is read from (default: `build`)
    pub fn set_build_param(&self, key: &str) {
        self.state.lock().build_param = key.to_string();
    }

    pub fn fail_queries(&self, fail: bool) {
        self.state.lock().failing_queries = fail;
    }

    /// Snapshot of the call log
    pub fn calls(&self) -> CallLog {
        self.state.lock().calls.clone()
    }

    /// Ids of sessions currently open
    pub fn open_sessions(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[async_trait]
impl DeviceCloud for FakeDeviceCloud {
    async fn list_devices(&self) -> FarmResult<Vec<Device>> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        Ok(state.devices.iter().map(|d| d.device.clone()).collect())
    }

    async fn query_devices(&self, query: &DeviceQuery) -> FarmResult<Vec<Device>> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        let served = state.calls.query_devices.len();
        state.calls.query_devices.push(Instant::now());

        let due: Vec<u64> = state
            .pending_online
            .iter()
            .filter(|(_, after)| served >= *after)
            .map(|(id, _)| *id)
            .collect();
        state.pending_online.retain(|(_, after)| served < *after);
        for device_id in due {
            if let Ok(fake) = state.device_mut(device_id) {
                fake.device.online = true;
            }
        }

        if state.failing_queries {
            return Err(FarmError::Remote("inventory unavailable".to_string()));
        }
        Ok(state
            .devices
            .iter()
            .filter(|d| d.matches(query))
            .map(|d| d.device.clone())
            .collect())
    }

    async fn device_properties(&self, device_id: u64) -> FarmResult<Vec<DeviceProperty>> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        Ok(state.device_mut(device_id)?.properties.clone())
    }

    async fn get_or_create_job(&self, name: &str) -> FarmResult<FlashJob> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        if let Some(job) = state.jobs.iter().find(|j| j.name == name) {
            return Ok(job.clone());
        }
        let job = FlashJob {
            id: state.allocate_id(),
            name: name.to_string(),
        };
        state.jobs.push(job.clone());
        Ok(job)
    }

    async fn create_run(&self, job: &FlashJob) -> FarmResult<FlashRun> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        let run = FlashRun {
            id: state.allocate_id(),
            job_id: job.id,
            state: RunState::Created,
            outcome: None,
            created_at: Some(chrono::Utc::now()),
        };
        let stale = state.stale_parameters.clone();
        let parameters = stale
            .into_iter()
            .map(|(key, value)| RunParameter {
                id: state.allocate_id(),
                key,
                value,
            })
            .collect();
        state.calls.created_runs.push(run.id);
        state.runs.insert(
            run.id,
            FakeRun {
                run: run.clone(),
                parameters,
                device_ids: Vec::new(),
                polls_remaining: None,
            },
        );
        Ok(run)
    }

    async fn list_run_parameters(&self, run: &FlashRun) -> FarmResult<Vec<RunParameter>> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        Ok(state.run_mut(run.id)?.parameters.clone())
    }

    async fn delete_run_parameter(&self, run: &FlashRun, parameter_id: u64) -> FarmResult<()> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        let fake_run = state.run_mut(run.id)?;
        let before = fake_run.parameters.len();
        fake_run.parameters.retain(|p| p.id != parameter_id);
        if fake_run.parameters.len() == before {
            return Err(FarmError::NotFound(format!("parameter {}", parameter_id)));
        }
        state.calls.deleted_parameters.push(parameter_id);
        Ok(())
    }

    async fn create_run_parameter(
        &self,
        run: &FlashRun,
        key: &str,
        value: &str,
    ) -> FarmResult<RunParameter> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        let parameter = RunParameter {
            id: state.allocate_id(),
            key: key.to_string(),
            value: value.to_string(),
        };
        state.run_mut(run.id)?.parameters.push(parameter.clone());
        state
            .calls
            .created_parameters
            .push((key.to_string(), value.to_string()));
        Ok(parameter)
    }

    async fn start_run(&self, run: &FlashRun, device_ids: &[u64]) -> FarmResult<()> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        let polls = state.flash.polls_until_finished;
        let fake_run = state.run_mut(run.id)?;
        fake_run.run.state = RunState::Running;
        fake_run.device_ids = device_ids.to_vec();
        fake_run.polls_remaining = polls;
        state
            .calls
            .started_runs
            .push((run.id, device_ids.to_vec()));
        Ok(())
    }

    async fn get_run(&self, run: &FlashRun) -> FarmResult<FlashRun> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        state.calls.get_run += 1;

        match state.failing_polls {
            Some(PollFailure::Transient(n)) if n > 0 => {
                state.failing_polls = Some(PollFailure::Transient(n - 1));
                return Err(FarmError::Remote(format!("run {} status unavailable", run.id)));
            }
            Some(PollFailure::Rejected) => {
                return Err(FarmError::InvalidRequest(format!("run {} rejected", run.id)));
            }
            _ => {}
        }

        let fake_run = state.run_mut(run.id)?;
        let due = match (fake_run.run.state, fake_run.polls_remaining.as_mut()) {
            (RunState::Running, Some(remaining)) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            _ => false,
        };
        if due {
            state.complete_run(run.id);
        }
        Ok(state.run_mut(run.id)?.run.clone())
    }

    async fn abort_run(&self, run: &FlashRun) -> FarmResult<()> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        state.run_mut(run.id)?.run.state = RunState::Aborted;
        state.calls.aborted_runs.push(run.id);
        Ok(())
    }

    async fn start_session(
        &self,
        device_id: u64,
        _timeout: Option<Duration>,
    ) -> FarmResult<Session> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        state.calls.start_session.push(device_id);

        let fake = state.device_mut(device_id)?;
        let behavior = fake.sessions;
        match behavior {
            SessionBehavior::Accept => {}
            SessionBehavior::FailTimes(0) => fake.sessions = SessionBehavior::Accept,
            SessionBehavior::FailTimes(n) => {
                fake.sessions = if n == 1 {
                    SessionBehavior::Accept
                } else {
                    SessionBehavior::FailTimes(n - 1)
                };
                return Err(FarmError::Remote(format!(
                    "device {} is not ready",
                    device_id
                )));
            }
            SessionBehavior::AlwaysFail => {
                return Err(FarmError::Remote(format!(
                    "device {} refused the session",
                    device_id
                )));
            }
        }
        if !fake.device.is_available() {
            return Err(FarmError::Remote(format!("device {} is busy", device_id)));
        }
        fake.device.locked = true;
        let device = fake.device.clone();

        let session_id = state.allocate_id();
        state.sessions.insert(session_id, device_id);
        Ok(Session {
            id: session_id,
            device,
        })
    }

    async fn stop_session(&self, session_id: u64) -> FarmResult<()> {
        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        state.calls.stop_session.push(session_id);

        let device_id = state
            .sessions
            .remove(&session_id)
            .ok_or_else(|| FarmError::NotFound(format!("session {}", session_id)))?;
        if let Ok(fake) = state.device_mut(device_id) {
            fake.device.locked = false;
        }
        Ok(())
    }

    async fn get_proxy(
        &self,
        protocol: ProxyProtocol,
        session_id: u64,
    ) -> FarmResult<ProxyEndpoint> {
        let delay = self.state.lock().proxy_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.calls.remote_calls += 1;
        state.calls.proxies.push((protocol, session_id));

        if !state.sessions.contains_key(&session_id) {
            return Err(FarmError::NotFound(format!("session {}", session_id)));
        }
        if state.failing_proxy == Some(protocol) {
            return Err(FarmError::Remote(format!("{} proxy unavailable", protocol)));
        }
        let port = state.next_port;
        state.next_port = state.next_port.wrapping_add(1);
        Ok(ProxyEndpoint {
            protocol,
            port,
            host: None,
        })
    }
}
