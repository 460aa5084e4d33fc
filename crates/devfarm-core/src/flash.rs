//! Flash job driver
//!
//! Flashing runs as a job on the cloud: a fresh run is created, its
//! parameters reset to the requested build and memory, a candidate device is
//! pinned, and the run is polled until it settles or the deadline passes.

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{FarmError, FarmResult};
use crate::manager::DeviceManager;
use crate::models::{Device, DeviceQuery, Filter, FlashRun, RunState};

impl DeviceManager {
    /// Flash some device matching `filter` with the build it names.
    ///
    /// `filter` carries the signed build URL; only its non-build, non-memory
    /// entries select the candidate device. Returns the device the run was
    /// pinned to once the run finishes successfully.
    pub async fn flash_device(&self, filter: &Filter) -> FarmResult<Device> {
        self.config.validate()?;
        let build = filter
            .build()
            .ok_or_else(|| FarmError::InvalidRequest("filter is missing 'build'".to_string()))?;
        let memory = filter
            .memory()
            .ok_or_else(|| FarmError::InvalidRequest("filter is missing 'memory'".to_string()))?;
        let query = DeviceQuery::from_filter(filter);
        let flash = &self.config.flash;

        let job = self.cloud.get_or_create_job(&flash.job_name).await?;
        let run = self.cloud.create_run(&job).await?;
        let created = Instant::now();
        info!(
            job = %job.name,
            job_id = job.id,
            run_id = run.id,
            created_at = ?run.created_at,
            "Flash run created"
        );

        self.reset_run_parameters(&run, &build, &memory).await?;

        let candidates: Vec<Device> = self
            .cloud
            .query_devices(&query)
            .await?
            .into_iter()
            .filter(Device::is_available)
            .collect();
        let device = self
            .config
            .selection
            .pick(&candidates)
            .cloned()
            .ok_or_else(|| FarmError::NoCandidateDevice(query.criteria.to_string()))?;

        self.cloud.start_run(&run, &[device.id]).await?;
        info!(run_id = run.id, device_id = device.id, "Flash run started");

        let finished = self.await_run(run, created).await?;
        info!(
            run_id = finished.id,
            device_id = device.id,
            elapsed_secs = created.elapsed().as_secs(),
            "Flash run finished"
        );
        Ok(device)
    }

    /// Drop whatever parameters the run inherited, then set build and memory.
    async fn reset_run_parameters(
        &self,
        run: &FlashRun,
        build: &str,
        memory: &str,
    ) -> FarmResult<()> {
        let stale = self.cloud.list_run_parameters(run).await?;
        for parameter in &stale {
            debug!(run_id = run.id, key = %parameter.key, "Deleting stale run parameter");
            self.cloud.delete_run_parameter(run, parameter.id).await?;
        }

        let flash = &self.config.flash;
        self.cloud
            .create_run_parameter(run, &flash.build_param, build)
            .await?;
        self.cloud
            .create_run_parameter(run, &flash.memory_param, memory)
            .await?;
        Ok(())
    }

    /// Poll `run` until it reaches a terminal state.
    ///
    /// The deadline counts from `created`. No poll is issued once it has
    /// passed; the run is aborted (best effort) and the wait fails.
    async fn await_run(&self, run: FlashRun, created: Instant) -> FarmResult<FlashRun> {
        let flash = &self.config.flash;
        let poll = flash.poll_interval();
        let deadline = created.checked_add(flash.deadline()).ok_or_else(|| {
            FarmError::InvalidConfig(format!("deadline of {}s overflows", flash.deadline_secs))
        })?;
        let mut last_state = run.state;

        loop {
            match self.cloud.get_run(&run).await {
                Ok(current) => {
                    last_state = current.state;
                    if current.has_failed() {
                        return Err(FarmError::FlashJobFailed {
                            run_id: current.id,
                            state: current.state,
                            reason: match current.outcome {
                                Some(outcome) => format!("run outcome {:?}", outcome),
                                None => format!("run ended in state {}", current.state),
                            },
                        });
                    }
                    if current.state == RunState::Finished {
                        return Ok(current);
                    }
                    debug!(run_id = run.id, state = %current.state, "Flash run in progress");
                }
                Err(e) if e.is_transient() => {
                    warn!(run_id = run.id, error = %e, "Polling flash run failed");
                }
                Err(e) => return Err(e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                sleep(poll.min(remaining)).await;
            }
            if Instant::now() >= deadline {
                return Err(self.time_out(&run, last_state, created).await);
            }
        }
    }

    async fn time_out(&self, run: &FlashRun, state: RunState, created: Instant) -> FarmError {
        let elapsed_secs = created.elapsed().as_secs();
        warn!(run_id = run.id, %state, elapsed_secs, "Flash run timed out");

        if self.config.flash.abort_on_timeout {
            if let Err(e) = self.cloud.abort_run(run).await {
                warn!(run_id = run.id, error = %e, "Failed to abort timed out run");
            }
        }

        FarmError::FlashTimeout {
            run_id: run.id,
            state,
            elapsed_secs,
        }
    }
}
