//! Online device search

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::FarmResult;
use crate::manager::DeviceManager;
use crate::models::{Device, DeviceQuery};

impl DeviceManager {
    /// Poll the cloud until some device matching `query` is online and unlocked.
    ///
    /// Makes at most `attempts` queries, sleeping the configured search delay
    /// between empty results. Returns an empty list once attempts run out. A
    /// failing query is retried like an empty one; only a failure on the last
    /// attempt is returned as an error.
    pub async fn find_online_devices(
        &self,
        query: &DeviceQuery,
        attempts: u32,
    ) -> FarmResult<Vec<Device>> {
        let delay = self.config.search.delay();

        for attempt in 1..=attempts {
            match self.cloud.query_devices(query).await {
                Ok(devices) => {
                    let matched = devices.len();
                    let available: Vec<Device> =
                        devices.into_iter().filter(Device::is_available).collect();

                    if !available.is_empty() {
                        debug!(
                            attempt,
                            matched,
                            available = available.len(),
                            "Found online devices"
                        );
                        return Ok(self.config.selection.order(available));
                    }
                    debug!(attempt, attempts, matched, "No online, unlocked device yet");
                }
                Err(e) if attempt == attempts => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Device query failed");
                }
            }

            if attempt < attempts {
                sleep(delay).await;
            }
        }

        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::OrchestratorConfig;
    use crate::fake::{FakeDevice, FakeDeviceCloud};
    use crate::manager::DeviceManager;
    use crate::models::{DeviceQuery, Filter};

    fn flame_query() -> DeviceQuery {
        DeviceQuery::from_filter(&Filter::new().with("type", "flame"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_inventory_polls_every_attempt() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());

        let devices = manager.find_online_devices(&flame_query(), 3).await.unwrap();

        assert!(devices.is_empty());
        let calls = cloud.calls();
        assert_eq!(calls.query_devices.len(), 3);
        for pair in calls.query_devices.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_online_unlocked_devices_returned() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(FakeDevice::new(1, "flame"));
        cloud.add_device(FakeDevice::new(2, "flame").online().locked());
        cloud.add_device(FakeDevice::new(3, "flame").online());
        cloud.add_device(FakeDevice::new(4, "keon").online());
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());

        let devices = manager.find_online_devices(&flame_query(), 5).await.unwrap();

        let ids: Vec<u64> = devices.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![3]);
        assert_eq!(cloud.calls().query_devices.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_coming_online_is_picked_up() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(FakeDevice::new(1, "flame"));
        cloud.bring_online_after_queries(1, 2);
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());

        let devices = manager.find_online_devices(&flame_query(), 5).await.unwrap();

        assert_eq!(devices.len(), 1);
        assert_eq!(cloud.calls().query_devices.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_on_last_attempt_propagates() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.fail_queries(true);
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());

        let result = manager.find_online_devices(&flame_query(), 2).await;

        assert!(result.is_err());
        assert_eq!(cloud.calls().query_devices.len(), 2);
    }
}
