//! DeviceCloud trait - the capability interface the orchestrator drives

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FarmError, FarmResult};
use crate::models::{
    Device, DeviceProperty, DeviceQuery, FlashJob, FlashRun, ProxyEndpoint, ProxyProtocol,
    RunParameter, Session,
};

/// Everything the orchestrator needs from a remote device farm.
///
/// Implementations:
/// - `TestdroidClient` (devfarm-client) - the Testdroid/Bitbar REST API
/// - [`FakeDeviceCloud`](crate::fake::FakeDeviceCloud) - in-memory, for tests and demos
///
/// Every method is a suspension point. Implementations must be safe to share
/// between concurrent acquisitions.
#[async_trait]
pub trait DeviceCloud: Send + Sync {
    // =========================================================================
    // Inventory
    // =========================================================================

    /// List every device the account can see
    async fn list_devices(&self) -> FarmResult<Vec<Device>>;

    /// List devices matching `query`. No online/locked filtering is applied.
    async fn query_devices(&self, query: &DeviceQuery) -> FarmResult<Vec<Device>>;

    /// Raw `(group, value)` property records of a device
    async fn device_properties(&self, device_id: u64) -> FarmResult<Vec<DeviceProperty>>;

    // =========================================================================
    // Jobs and runs
    // =========================================================================

    /// Find the job template called `name`, creating it if missing
    async fn get_or_create_job(&self, name: &str) -> FarmResult<FlashJob>;

    /// Create a new run of `job`. The run may inherit stale parameters.
    async fn create_run(&self, job: &FlashJob) -> FarmResult<FlashRun>;

    /// Parameters currently attached to `run`
    async fn list_run_parameters(&self, run: &FlashRun) -> FarmResult<Vec<RunParameter>>;

    /// Remove one parameter from `run`
    async fn delete_run_parameter(&self, run: &FlashRun, parameter_id: u64) -> FarmResult<()>;

    /// Attach a parameter to `run`
    async fn create_run_parameter(
        &self,
        run: &FlashRun,
        key: &str,
        value: &str,
    ) -> FarmResult<RunParameter>;

    /// Start `run` on the given devices
    async fn start_run(&self, run: &FlashRun, device_ids: &[u64]) -> FarmResult<()>;

    /// Fetch the current state of `run`
    async fn get_run(&self, run: &FlashRun) -> FarmResult<FlashRun>;

    /// Abort `run` (default: not supported)
    async fn abort_run(&self, run: &FlashRun) -> FarmResult<()> {
        let _ = run;
        Err(FarmError::NotSupported("abort_run".to_string()))
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Lock `device_id` into a new session
    async fn start_session(
        &self,
        device_id: u64,
        timeout: Option<Duration>,
    ) -> FarmResult<Session>;

    /// Release a session
    async fn stop_session(&self, session_id: u64) -> FarmResult<()>;

    /// Open a protocol proxy for a session
    async fn get_proxy(
        &self,
        protocol: ProxyProtocol,
        session_id: u64,
    ) -> FarmResult<ProxyEndpoint>;
}
