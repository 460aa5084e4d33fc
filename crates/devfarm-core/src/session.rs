//! Session acquisition

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::manager::DeviceManager;
use crate::models::{Device, Session};

impl DeviceManager {
    /// Lock the first device in `devices` that accepts a session.
    ///
    /// Each device gets the configured number of tries with a fixed delay in
    /// between. A device that has just come online often refuses sessions
    /// for a few seconds while its agent warms up; the tries absorb that, not
    /// permanent failures. Returns `None` when every device refused.
    pub async fn acquire_session(&self, devices: &[Device]) -> Option<Session> {
        if devices.is_empty() {
            return None;
        }

        let attempts = self.config.session.attempts;
        let delay = self.config.session.delay();
        let timeout = self.config.session.timeout();

        for device in devices {
            for attempt in 1..=attempts {
                match self.cloud.start_session(device.id, timeout).await {
                    Ok(session) => {
                        info!(
                            device_id = device.id,
                            session_id = session.id,
                            attempt,
                            "Session started"
                        );
                        return Some(session);
                    }
                    Err(e) => {
                        debug!(
                            device_id = device.id,
                            retries_left = attempts - attempt,
                            error = %e,
                            "Could not start device session"
                        );
                        if attempt < attempts {
                            sleep(delay).await;
                        }
                    }
                }
            }
            warn!(device_id = device.id, attempts, "Device refused every session attempt");
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::OrchestratorConfig;
    use crate::fake::{FakeDevice, FakeDeviceCloud, SessionBehavior};
    use crate::manager::DeviceManager;

    #[tokio::test]
    async fn test_empty_candidates_make_no_calls() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());

        assert!(manager.acquire_session(&[]).await.is_none());
        assert_eq!(cloud.calls().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refusing_devices_get_five_tries_each() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(
            FakeDevice::new(1, "flame")
                .online()
                .sessions(SessionBehavior::AlwaysFail),
        );
        cloud.add_device(
            FakeDevice::new(2, "flame")
                .online()
                .sessions(SessionBehavior::AlwaysFail),
        );
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());
        let devices = vec![cloud.device(1).unwrap(), cloud.device(2).unwrap()];

        let start = tokio::time::Instant::now();
        let session = manager.acquire_session(&devices).await;

        assert!(session.is_none());
        assert_eq!(cloud.calls().start_session, vec![1, 1, 1, 1, 1, 2, 2, 2, 2, 2]);
        // 4 gaps per device
        assert_eq!(start.elapsed(), Duration::from_secs(16));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warming_device_eventually_accepts() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(
            FakeDevice::new(1, "flame")
                .online()
                .sessions(SessionBehavior::FailTimes(2)),
        );
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());
        let devices = vec![cloud.device(1).unwrap()];

        let session = manager.acquire_session(&devices).await.unwrap();

        assert_eq!(session.device.id, 1);
        assert_eq!(cloud.calls().start_session, vec![1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_to_next_device() {
        let cloud = Arc::new(FakeDeviceCloud::new());
        cloud.add_device(
            FakeDevice::new(1, "flame")
                .online()
                .sessions(SessionBehavior::AlwaysFail),
        );
        cloud.add_device(FakeDevice::new(2, "flame").online());
        let manager = DeviceManager::new(cloud.clone(), OrchestratorConfig::default());
        let devices = vec![cloud.device(1).unwrap(), cloud.device(2).unwrap()];

        let session = manager.acquire_session(&devices).await.unwrap();

        assert_eq!(session.device.id, 2);
        assert_eq!(cloud.calls().start_session, vec![1, 1, 1, 1, 1, 2]);
    }
}
