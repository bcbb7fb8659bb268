//! Engine that reports the deployment plan without touching the backend

use guisrv_common::protocol::WorkerRequest;
use serde_json::Value;
use std::thread;
use std::time::Duration;
use tracing::info;

use crate::engine::{DeploymentEngine, EngineError};
use guisrv_common::plan::{plan, summary};

#[derive(Debug, Default)]
pub struct DryRunEngine {
    /// Pause after each reported step
    step_delay: Duration,
}

impl DryRunEngine {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }
}

impl DeploymentEngine for DryRunEngine {
    fn deploy(
        &mut self,
        request: &WorkerRequest,
        progress: &mut dyn FnMut(&str),
    ) -> Result<Value, EngineError> {
        info!(job_id = request.job_id, name = %request.name, "Dry run");
        for step in plan(&request.bundle) {
            progress(&step.describe());
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
        }

        let mut payload = summary(&request.bundle);
        payload["dryRun"] = Value::Bool(true);
        Ok(payload)
    }
}
