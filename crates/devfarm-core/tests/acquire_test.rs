//! End-to-end acquisition against the in-memory cloud

use std::sync::Arc;

use devfarm_core::{
    verify_signed_url, DeviceManager, FakeDevice, FakeDeviceCloud, FarmError, Filter,
    FlashBehavior, OrchestratorConfig, ProxyProtocol, RunOutcome, SessionBehavior,
};
use pretty_assertions::assert_eq;

const BUILD: &str = "http://example/build.zip";

fn filter() -> Filter {
    Filter::new()
        .with("type", "flame")
        .with("memory", "512")
        .with("build", BUILD)
}

fn manager(cloud: &Arc<FakeDeviceCloud>) -> DeviceManager {
    let config = OrchestratorConfig::builder()
        .credentials("client", "token")
        .proxy_host("10.0.0.5")
        .build();
    DeviceManager::new(cloud.clone(), config)
}

#[tokio::test(start_paused = true)]
async fn test_flashed_device_is_used_without_flashing() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(7, "flame").online().flashed_with(BUILD));
    let manager = manager(&cloud);

    let handle = manager.acquire_device(&filter(), 2).await.unwrap();

    assert_eq!(handle.device.id, 7);
    assert_eq!(handle.proxy_host, "10.0.0.5");
    assert_eq!(handle.proxies.adb.protocol, ProxyProtocol::Adb);
    assert_eq!(handle.proxies.marionette.protocol, ProxyProtocol::Marionette);
    assert_ne!(handle.proxies.adb.port, handle.proxies.marionette.port);

    let calls = cloud.calls();
    assert!(calls.created_runs.is_empty());
    assert_eq!(calls.start_session, vec![7]);
    assert_eq!(cloud.open_sessions(), vec![handle.session.id]);
}

#[tokio::test(start_paused = true)]
async fn test_unflashed_inventory_is_flashed_then_acquired() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(7, "flame").online());
    let manager = manager(&cloud);

    let handle = manager.acquire_device(&filter(), 2).await.unwrap();

    assert_eq!(handle.device.id, 7);
    let calls = cloud.calls();
    assert_eq!(calls.created_runs.len(), 1);
    assert_eq!(calls.started_runs[0].1, vec![7]);
    assert_eq!(cloud.device_build(7).as_deref(), Some(BUILD));
}

#[tokio::test(start_paused = true)]
async fn test_flash_receives_signed_build() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(7, "flame").online());
    let manager = manager(&cloud);

    manager.acquire_device(&filter(), 1).await.unwrap();

    let calls = cloud.calls();
    let (key, signed) = &calls.created_parameters[0];
    assert_eq!(key, "build");
    assert!(signed.starts_with("http://example/build.zip?bewit="));

    let now = chrono::Utc::now().timestamp() as u64;
    verify_signed_url(signed, "client", "token", now).unwrap();
    assert_eq!(calls.created_parameters[1], ("memory".to_string(), "512".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_failed_flash_is_retried_within_budget() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(7, "flame").online());
    cloud.set_flash_behavior(FlashBehavior::finishes_after(1).with_outcome(RunOutcome::Failed));
    let manager = manager(&cloud);

    let err = manager.acquire_device(&filter(), 2).await.unwrap_err();

    assert!(matches!(err, FarmError::FlashJobFailed { .. }));
    assert_eq!(cloud.calls().created_runs.len(), 2);
    assert!(cloud.open_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refused_sessions_exhaust_budget() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(
        FakeDevice::new(7, "flame")
            .online()
            .sessions(SessionBehavior::AlwaysFail),
    );
    let manager = manager(&cloud);

    let err = manager.acquire_device(&filter(), 2).await.unwrap_err();

    match err {
        FarmError::NoSessionAvailable { attempts } => assert_eq!(attempts, 2),
        other => panic!("expected NoSessionAvailable, got {:?}", other),
    }
    assert_eq!(cloud.calls().created_runs.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_flashed_device_offline_exhausts_search() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(7, "flame").online());
    cloud.set_flash_behavior(FlashBehavior::finishes_after(1).device_stays_offline());
    let manager = manager(&cloud);

    let err = manager.acquire_device(&filter(), 1).await.unwrap_err();

    assert!(matches!(err, FarmError::NoSessionAvailable { attempts: 1 }));
    let calls = cloud.calls();
    assert_eq!(calls.created_runs.len(), 1);
    // initial search, flash candidate lookup, full post-flash search
    assert_eq!(calls.query_devices.len(), 1 + 1 + 5);
    assert!(calls.start_session.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_proxy_failure_releases_session() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(7, "flame").online().flashed_with(BUILD));
    cloud.fail_proxy(ProxyProtocol::Marionette);
    let manager = manager(&cloud);

    let err = manager.acquire_device(&filter(), 2).await.unwrap_err();

    match err {
        FarmError::ProxyCreationFailed { protocol, .. } => assert_eq!(protocol, "marionette"),
        other => panic!("expected ProxyCreationFailed, got {:?}", other),
    }
    assert!(cloud.open_sessions().is_empty());
    assert!(!cloud.device(7).unwrap().locked);
    assert_eq!(cloud.calls().stop_session.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_get_distinct_devices() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(1, "flame").online().flashed_with(BUILD));
    cloud.add_device(FakeDevice::new(2, "flame").online().flashed_with(BUILD));
    let manager = manager(&cloud);

    let (filter_a, filter_b) = (filter(), filter());
    let (a, b) = tokio::join!(
        manager.acquire_device(&filter_a, 1),
        manager.acquire_device(&filter_b, 1)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.device.id, b.device.id);
    manager.release_device(a).await.unwrap();
    manager.release_device(b).await.unwrap();
    assert!(cloud.open_sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_custom_build_parameter_labels_flashed_device() {
    let cloud = Arc::new(FakeDeviceCloud::new());
    cloud.add_device(FakeDevice::new(7, "flame").online());
    cloud.set_build_param("FLAME_ZIP_URL");
    let config = OrchestratorConfig::builder()
        .credentials("client", "token")
        .build_param("FLAME_ZIP_URL")
        .build();
    let manager = DeviceManager::new(cloud.clone(), config);

    let handle = manager.acquire_device(&filter(), 1).await.unwrap();

    assert_eq!(handle.device.id, 7);
    assert_eq!(cloud.calls().created_parameters[0].0, "FLAME_ZIP_URL");
    assert_eq!(cloud.device_build(7).as_deref(), Some(BUILD));
}
