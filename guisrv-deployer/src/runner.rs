//! One job, from stdin request to stdout report

use guisrv_common::protocol::{decode_line, encode_line, WorkerMessage, WorkerRequest};
use guisrv_common::Result;
use std::io::{BufRead, Write};
use tracing::{info, warn};

use crate::engine::DeploymentEngine;

fn report<W: Write>(output: &mut W, message: &WorkerMessage) -> Result<()> {
    output.write_all(encode_line(message)?.as_bytes())?;
    output.flush()?;
    Ok(())
}

/// Read one request, deploy it and report the outcome
///
/// Always ends with exactly one terminal message unless `output` itself
/// fails. Returns whether the deployment succeeded.
pub fn run_job<R: BufRead, W: Write>(
    mut input: R,
    output: &mut W,
    engine: &mut dyn DeploymentEngine,
) -> Result<bool> {
    let mut line = String::new();
    input.read_line(&mut line)?;

    let request: WorkerRequest = match decode_line(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Invalid job request: {}", e);
            report(output, &WorkerMessage::failure(format!("invalid job request: {}", e)))?;
            return Ok(false);
        }
    };
    info!(job_id = request.job_id, name = %request.name, "Job received");

    // Progress write errors surface on the terminal report
    let outcome = engine.deploy(&request, &mut |message: &str| {
        let _ = report(&mut *output, &WorkerMessage::progress(message));
    });

    match outcome {
        Ok(payload) => {
            report(output, &WorkerMessage::Result { payload })?;
            Ok(true)
        }
        Err(e) => {
            warn!(job_id = request.job_id, "Deployment failed: {}", e);
            report(output, &WorkerMessage::failure(e.to_string()))?;
            Ok(false)
        }
    }
}
