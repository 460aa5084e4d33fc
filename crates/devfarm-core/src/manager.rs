//! DeviceManager - the device acquisition orchestrator
//!
//! Composes the online device finder, the session acquirer and the flash
//! driver into one operation: "give me a usable device for this filter".
//!
//! ```text
//! sign build URL (once)
//!   │
//!   ▼
//! ┌─► find (1 attempt) ──► acquire session ──► ok ─────────────┐
//! │                            │ none                          │
//! │                            ▼                               │
//! │                        flash device ──► err (last try) ──► fail
//! │                            │ ok                            │
//! │                            ▼                               │
//! │          find (full budget) ──► acquire session ──► ok ────┤
//! │                                     │ none                 │
//! └──────── retry budget left ◄─────────┘                      ▼
//!                                              open adb + marionette proxies
//!                                                               │
//!                                                               ▼
//!                                                          DeviceHandle
//! ```

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::cloud::DeviceCloud;
use crate::config::OrchestratorConfig;
use crate::error::{FarmError, FarmResult};
use crate::models::{
    Device, DeviceHandle, DeviceQuery, Filter, Proxies, ProxyEndpoint, ProxyProtocol, Session,
};
use crate::properties::{normalize_properties, DeviceProperties};
use crate::signer;

/// Arbitrates access to the devices of one cloud account.
///
/// Holds no per-request state, so one manager can serve many concurrent
/// acquisitions. Exclusive access between callers comes from the cloud's
/// session locks alone.
#[derive(Clone)]
pub struct DeviceManager {
    pub(crate) cloud: Arc<dyn DeviceCloud>,
    pub(crate) config: OrchestratorConfig,
}

impl DeviceManager {
    pub fn new(cloud: Arc<dyn DeviceCloud>, config: OrchestratorConfig) -> Self {
        Self { cloud, config }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn cloud(&self) -> &Arc<dyn DeviceCloud> {
        &self.cloud
    }

    /// Every device the account can see
    pub async fn get_devices(&self) -> FarmResult<Vec<Device>> {
        self.cloud.list_devices().await
    }

    /// Normalized property mapping of one device
    pub async fn get_device_properties(&self, device_id: u64) -> FarmResult<DeviceProperties> {
        let records = self.cloud.device_properties(device_id).await?;
        Ok(normalize_properties(records))
    }

    /// Acquire exclusive access to a device matching `filter`.
    ///
    /// `filter` must carry `build` and `memory`; both are checked before any
    /// remote call. Up to `retry_budget` search/flash rounds are made.
    pub async fn acquire_device(
        &self,
        filter: &Filter,
        retry_budget: u32,
    ) -> FarmResult<DeviceHandle> {
        self.config.validate()?;
        if retry_budget == 0 || retry_budget > self.config.max_retry_budget {
            return Err(FarmError::InvalidRequest(format!(
                "retry budget must be within 1..={}",
                self.config.max_retry_budget
            )));
        }
        let build = filter
            .build()
            .ok_or_else(|| FarmError::InvalidRequest("filter is missing 'build'".to_string()))?;
        if filter.memory().is_none() {
            return Err(FarmError::InvalidRequest(
                "filter is missing 'memory'".to_string(),
            ));
        }

        // One signature for the whole acquisition window
        let signing = &self.config.signing;
        let signed = signer::sign_url(
            &build,
            &signing.client_id,
            &signing.access_token,
            signing.ttl_secs,
        )?;
        let flash_filter = filter.with_build(signed);
        let query = DeviceQuery::from_filter(filter).with_build_label(build.clone());

        info!(
            criteria = %query.criteria,
            build = %build,
            retry_budget,
            "Acquiring device"
        );

        let session = self
            .acquire_with_retries(&query, &flash_filter, retry_budget)
            .await?;
        let guard = SessionGuard::new(self.cloud.clone(), session.id);
        self.attach_proxies(session, guard).await
    }

    /// Release the session behind `handle`, unlocking its device.
    pub async fn release_device(&self, handle: DeviceHandle) -> FarmResult<()> {
        info!(
            session_id = handle.session.id,
            device_id = handle.device.id,
            "Releasing device"
        );
        self.cloud.stop_session(handle.session.id).await
    }

    async fn acquire_with_retries(
        &self,
        query: &DeviceQuery,
        flash_filter: &Filter,
        retry_budget: u32,
    ) -> FarmResult<Session> {
        for attempt in 1..=retry_budget {
            let last_attempt = attempt == retry_budget;

            let devices = self.search(query, 1).await;
            if let Some(session) = self.acquire_session(&devices).await {
                return Ok(session);
            }

            info!(attempt, retry_budget, "No flashed device available, flashing one");
            match self.flash_device(flash_filter).await {
                Ok(device) => info!(device_id = device.id, "Flash finished"),
                Err(e) if last_attempt => return Err(e),
                Err(e) => {
                    warn!(attempt, retry_budget, error = %e, "Flashing failed, retrying");
                    continue;
                }
            }

            // Flash completion does not mean the device is usable yet
            let devices = self.search(query, self.config.search.attempts).await;
            if let Some(session) = self.acquire_session(&devices).await {
                return Ok(session);
            }
            warn!(attempt, retry_budget, "Flashed device did not become available");
        }

        Err(FarmError::NoSessionAvailable {
            attempts: retry_budget,
        })
    }

    /// Finder errors only mean "nothing usable right now" to the acquisition loop
    async fn search(&self, query: &DeviceQuery, attempts: u32) -> Vec<Device> {
        self.find_online_devices(query, attempts)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Device search failed");
                Vec::new()
            })
    }

    async fn attach_proxies(
        &self,
        session: Session,
        mut guard: SessionGuard,
    ) -> FarmResult<DeviceHandle> {
        match self.open_proxies(session.id).await {
            Ok(proxies) => {
                guard.disarm();
                info!(
                    session_id = session.id,
                    device_id = session.device.id,
                    adb_port = proxies.adb.port,
                    marionette_port = proxies.marionette.port,
                    "Device acquired"
                );
                Ok(DeviceHandle {
                    device: session.device.clone(),
                    session,
                    proxies,
                    proxy_host: self.config.proxy_host.clone(),
                })
            }
            Err(e) => {
                warn!(session_id = session.id, error = %e, "Proxy setup failed, releasing session");
                if let Err(stop_err) = self.cloud.stop_session(session.id).await {
                    error!(
                        session_id = session.id,
                        error = %stop_err,
                        "Failed to release session after proxy failure"
                    );
                }
                guard.disarm();
                Err(e)
            }
        }
    }

    async fn open_proxies(&self, session_id: u64) -> FarmResult<Proxies> {
        let adb = self.open_proxy(ProxyProtocol::Adb, session_id).await?;
        let marionette = self.open_proxy(ProxyProtocol::Marionette, session_id).await?;
        Ok(Proxies { adb, marionette })
    }

    async fn open_proxy(
        &self,
        protocol: ProxyProtocol,
        session_id: u64,
    ) -> FarmResult<ProxyEndpoint> {
        self.cloud
            .get_proxy(protocol, session_id)
            .await
            .map_err(|e| FarmError::ProxyCreationFailed {
                protocol: protocol.to_string(),
                session_id,
                message: e.to_string(),
            })
    }
}

/// Releases a session if the acquisition holding it is dropped.
///
/// An acquisition future can be cancelled at any await point. A session
/// started but not yet handed out is then stopped on a background task.
struct SessionGuard {
    cloud: Arc<dyn DeviceCloud>,
    session_id: u64,
    armed: bool,
}

impl SessionGuard {
    fn new(cloud: Arc<dyn DeviceCloud>, session_id: u64) -> Self {
        Self {
            cloud,
            session_id,
            armed: true,
        }
    }

    /// The session has been handed on or released explicitly
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let session_id = self.session_id;
        warn!(session_id, "Acquisition cancelled, releasing session");

        let cloud = self.cloud.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = cloud.stop_session(session_id).await {
                        error!(session_id, error = %e, "Failed to release cancelled session");
                    }
                });
            }
            Err(_) => error!(session_id, "No runtime left to release cancelled session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, FakeDeviceCloud};

    fn manager(cloud: Arc<FakeDeviceCloud>) -> DeviceManager {
        let config = OrchestratorConfig::builder()
            .credentials("client", "token")
            .build();
        DeviceManager::new(cloud, config)
    }

    #[tokio::test]
    async fn test_missing_build_fails_without_remote_calls() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        let manager = manager(cloud.clone());

        let filter = Filter::new().with("type", "flame").with("memory", "512");
        let err = manager.acquire_device(&filter, 2).await.unwrap_err();

        assert!(matches!(err, FarmError::InvalidRequest(_)));
        assert_eq!(cloud.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_missing_memory_fails_without_remote_calls() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        let manager = manager(cloud.clone());

        let filter = Filter::new().with("type", "flame").with("build", "http://b/x.zip");
        let err = manager.acquire_device(&filter, 2).await.unwrap_err();

        assert!(matches!(err, FarmError::InvalidRequest(_)));
        assert_eq!(cloud.calls().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquisition_releases_session() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(FakeDevice::new(1, "flame").online().flashed_with("http://b/x.zip"));
        cloud.delay_proxies(std::time::Duration::from_secs(150));
        let manager = manager(cloud.clone());

        let filter = Filter::new()
            .with("type", "flame")
            .with("memory", "512")
            .with("build", "http://b/x.zip");
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(60),
            manager.acquire_device(&filter, 1),
        )
        .await;
        assert!(outcome.is_err());

        // let the release spawned on drop run
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        assert_eq!(cloud.calls().start_session, vec![1]);
        assert!(cloud.open_sessions().is_empty());
        assert!(!cloud.device(1).unwrap().locked);
    }

    #[tokio::test]
    async fn test_budget_above_maximum_rejected() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        let manager = manager(cloud.clone());

        let filter = Filter::new()
            .with("type", "flame")
            .with("memory", "512")
            .with("build", "http://b/x.zip");
        let max = manager.config().max_retry_budget;
        let err = manager.acquire_device(&filter, max + 1).await.unwrap_err();

        assert!(matches!(err, FarmError::InvalidRequest(_)));
        assert_eq!(cloud.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_zero_budget_rejected() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        let manager = manager(cloud.clone());

        let filter = Filter::new()
            .with("type", "flame")
            .with("memory", "512")
            .with("build", "http://b/x.zip");
        let err = manager.acquire_device(&filter, 0).await.unwrap_err();

        assert!(matches!(err, FarmError::InvalidRequest(_)));
        assert_eq!(cloud.calls().total(), 0);
    }

    #[tokio::test]
    async fn test_properties_are_normalized() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(
            FakeDevice::new(3, "flame")
                .with_property("Build version", "a")
                .with_property("Build version", "b"),
        );
        let manager = manager(cloud);

        let props = manager.get_device_properties(3).await.unwrap();
        assert_eq!(
            props.get("build_version"),
            Some(&crate::PropertyValue::Multiple(vec![
                "a".to_string(),
                "b".to_string()
            ]))
        );
    }

    #[tokio::test]
    async fn test_release_unlocks_device() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(FakeDevice::new(1, "flame").online().flashed_with("http://b/x.zip"));
        let manager = manager(cloud.clone());

        let filter = Filter::new()
            .with("type", "flame")
            .with("memory", "512")
            .with("build", "http://b/x.zip");
        let handle = manager.acquire_device(&filter, 1).await.unwrap();
        assert!(cloud.device(1).unwrap().locked);

        manager.release_device(handle).await.unwrap();
        assert!(!cloud.device(1).unwrap().locked);
    }
}
