//! Integration tests for devfarm-client
//!
//! These tests spin up the stub Testdroid API and drive it through the real
//! HTTP client, so the client and the wire types stay in sync.

use std::sync::Arc;

use devfarm_client::testing::{StubTestdroid, TestServer};
use devfarm_client::{CloudConfig, TestdroidClient, TestdroidError};
use devfarm_core::{
    DeviceCloud, DeviceManager, DeviceQuery, FakeDevice, FakeDeviceCloud, FarmError, Filter,
    OrchestratorConfig, PropertyValue, ProxyProtocol,
};
use pretty_assertions::assert_eq;

const BUILD: &str = "http://builds.example/flame/b2g.zip";

/// A second client on the same server, owned by the caller
fn client_for(server: &TestServer) -> TestdroidClient {
    let config = CloudConfig::new(server.base_url())
        .with_credentials(StubTestdroid::USERNAME, StubTestdroid::PASSWORD);
    TestdroidClient::new(config).unwrap()
}

async fn start(cloud: FakeDeviceCloud) -> (StubTestdroid, TestServer) {
    let stub = StubTestdroid::new(Arc::new(cloud));
    let server = TestServer::start(stub.router()).await.unwrap();
    (stub, server)
}

#[tokio::test]
async fn test_list_devices_authenticates_once() {
    let (stub, server) = start(FakeDeviceCloud::sample()).await;

    let devices = server.client.devices().await.unwrap();
    assert_eq!(devices.len(), 3);
    assert_eq!(devices[0].display_name, "flame");

    server.client.devices().await.unwrap();
    assert_eq!(stub.token_requests(), 1);
}

#[tokio::test]
async fn test_revoked_token_is_refreshed() {
    let (stub, server) = start(FakeDeviceCloud::sample()).await;

    server.client.devices().await.unwrap();
    stub.revoke_tokens();
    let devices = server.client.devices().await.unwrap();

    assert_eq!(devices.len(), 3);
    assert_eq!(stub.token_requests(), 2);
}

#[tokio::test]
async fn test_bad_credentials_rejected() {
    let (_stub, server) = start(FakeDeviceCloud::sample()).await;
    let config = CloudConfig::new(server.base_url()).with_credentials("tester", "wrong");
    let client = TestdroidClient::new(config).unwrap();

    let err = client.devices().await.unwrap_err();
    assert!(matches!(err, TestdroidError::AuthFailed(_)));
}

#[tokio::test]
async fn test_query_by_criteria_and_build_label() {
    let cloud = FakeDeviceCloud::new();
    cloud.add_device(FakeDevice::new(1, "flame").online().flashed_with(BUILD));
    cloud.add_device(FakeDevice::new(2, "flame").online());
    cloud.add_device(FakeDevice::new(3, "keon").online().flashed_with(BUILD));
    let (_stub, server) = start(cloud).await;

    let query = DeviceQuery::from_filter(&Filter::new().with("type", "flame"));
    let ids: Vec<u64> = server
        .client
        .query_devices(&query)
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec![1, 2]);

    let labelled = query.clone().with_build_label(BUILD);
    let ids: Vec<u64> = server
        .client
        .query_devices(&labelled)
        .await
        .unwrap()
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec![1]);

    let never_flashed = query.with_build_label("http://builds.example/other.zip");
    assert!(server
        .client
        .query_devices(&never_flashed)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let (_stub, server) = start(FakeDeviceCloud::sample()).await;

    let err = server.client.stop_session(4242).await.unwrap_err();
    assert!(matches!(err, FarmError::NotFound(_)));
}

#[tokio::test]
async fn test_session_and_proxies_round_trip() {
    let cloud = FakeDeviceCloud::new();
    cloud.add_device(FakeDevice::new(1, "flame").online());
    let (stub, server) = start(cloud).await;

    let session = server.client.start_session(1, None).await.unwrap();
    assert_eq!(session.device.id, 1);
    assert!(session.device.locked);

    let adb = server
        .client
        .get_proxy(ProxyProtocol::Adb, session.id)
        .await
        .unwrap();
    assert_eq!(adb.protocol, ProxyProtocol::Adb);

    server.client.stop_session(session.id).await.unwrap();
    assert!(stub.cloud().open_sessions().is_empty());
}

#[tokio::test]
async fn test_properties_over_http() {
    let cloud = FakeDeviceCloud::new();
    cloud.add_device(
        FakeDevice::new(5, "flame")
            .with_property("Build version", "1.0")
            .with_property("Build version", "2.0"),
    );
    let (_stub, server) = start(cloud).await;
    let manager = DeviceManager::new(Arc::new(client_for(&server)), OrchestratorConfig::default());

    let props = manager.get_device_properties(5).await.unwrap();
    assert_eq!(
        props["build_version"],
        PropertyValue::Multiple(vec!["1.0".to_string(), "2.0".to_string()])
    );
}

#[tokio::test]
async fn test_acquire_flashes_over_http() {
    let cloud = FakeDeviceCloud::new();
    cloud.add_device(FakeDevice::new(1, "flame").online());
    cloud.seed_stale_parameter("FLAME_ZIP_URL", "http://builds.example/stale.zip");
    let stub = StubTestdroid::new(Arc::new(cloud));
    let server = TestServer::start(stub.router()).await.unwrap();

    let config = OrchestratorConfig::builder()
        .credentials("client", "token")
        .search(5, 10)
        .session(5, 10)
        .flash_timing(10, 30)
        .build();
    let manager = DeviceManager::new(Arc::new(client_for(&server)), config);

    let filter = Filter::new()
        .with("type", "flame")
        .with("memory", "512")
        .with("build", BUILD);
    let handle = manager.acquire_device(&filter, 2).await.unwrap();

    assert_eq!(handle.device.id, 1);
    let calls = stub.cloud().calls();
    assert_eq!(calls.created_runs.len(), 1);
    assert_eq!(calls.deleted_parameters.len(), 1);
    assert_eq!(stub.cloud().device_build(1).as_deref(), Some(BUILD));
    assert!(stub.cloud().job("flash-fxos").is_some());

    manager.release_device(handle).await.unwrap();
    assert!(stub.cloud().open_sessions().is_empty());
}
