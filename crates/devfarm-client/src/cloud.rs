//! DeviceCloud implementation over the Testdroid API

use std::time::Duration;

use async_trait::async_trait;
use devfarm_core::{
    Device, DeviceCloud, DeviceProperty, DeviceQuery, FarmResult, FlashJob, FlashRun,
    ProxyEndpoint, ProxyProtocol, RunParameter, Session,
};
use tracing::info;

use crate::client::TestdroidClient;

#[async_trait]
impl DeviceCloud for TestdroidClient {
    async fn list_devices(&self) -> FarmResult<Vec<Device>> {
        Ok(self.devices().await?)
    }

    async fn query_devices(&self, query: &DeviceQuery) -> FarmResult<Vec<Device>> {
        Ok(self.devices_matching(query).await?)
    }

    async fn device_properties(&self, device_id: u64) -> FarmResult<Vec<DeviceProperty>> {
        Ok(self.properties(device_id).await?)
    }

    async fn get_or_create_job(&self, name: &str) -> FarmResult<FlashJob> {
        let project = match self.find_project(name).await? {
            Some(project) => project,
            None => {
                info!(project = %name, "Creating flash project");
                self.create_project(name).await?
            }
        };
        Ok(FlashJob {
            id: project.id,
            name: project.name,
        })
    }

    async fn create_run(&self, job: &FlashJob) -> FarmResult<FlashRun> {
        Ok(self.create_test_run(job.id).await?.into())
    }

    async fn list_run_parameters(&self, run: &FlashRun) -> FarmResult<Vec<RunParameter>> {
        let parameters = self.test_run_parameters(run.job_id, run.id).await?;
        Ok(parameters.into_iter().map(RunParameter::from).collect())
    }

    async fn delete_run_parameter(&self, run: &FlashRun, parameter_id: u64) -> FarmResult<()> {
        Ok(self
            .delete_test_run_parameter(run.job_id, run.id, parameter_id)
            .await?)
    }

    async fn create_run_parameter(
        &self,
        run: &FlashRun,
        key: &str,
        value: &str,
    ) -> FarmResult<RunParameter> {
        Ok(self
            .create_test_run_parameter(run.job_id, run.id, key, value)
            .await?
            .into())
    }

    async fn start_run(&self, run: &FlashRun, device_ids: &[u64]) -> FarmResult<()> {
        Ok(self.start_test_run(run.job_id, run.id, device_ids).await?)
    }

    async fn get_run(&self, run: &FlashRun) -> FarmResult<FlashRun> {
        Ok(self.test_run(run.job_id, run.id).await?.into())
    }

    async fn abort_run(&self, run: &FlashRun) -> FarmResult<()> {
        Ok(self.abort_test_run(run.job_id, run.id).await?)
    }

    async fn start_session(
        &self,
        device_id: u64,
        timeout: Option<Duration>,
    ) -> FarmResult<Session> {
        let session = self.start_device_session(device_id, timeout).await?;
        Ok(Session {
            id: session.id,
            device: session.device,
        })
    }

    async fn stop_session(&self, session_id: u64) -> FarmResult<()> {
        Ok(self.stop_device_session(session_id).await?)
    }

    async fn get_proxy(
        &self,
        protocol: ProxyProtocol,
        session_id: u64,
    ) -> FarmResult<ProxyEndpoint> {
        let proxy = self.proxy(protocol, session_id).await?;
        Ok(ProxyEndpoint {
            protocol,
            port: proxy.port,
            host: proxy.host,
        })
    }
}
