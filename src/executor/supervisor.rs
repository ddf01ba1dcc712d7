use std::sync::Arc;

use tracing::{info, warn};

use crate::config::SupervisorConfig;
use crate::error::{ChronosError, Result};
use crate::executor::runner::{CommandRunner, ExecutionResult};
use crate::scheduler::Job;

/// Runs a claimed job until it succeeds or its attempts for the current
/// occurrence are used up.
pub struct Supervisor {
    runner: Arc<dyn CommandRunner>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(runner: Arc<dyn CommandRunner>, config: SupervisorConfig) -> Self {
        Self { runner, config }
    }

    pub async fn run_it(&self, job: &mut Job) -> Result<ExecutionResult> {
        while !job.failed() {
            job.record_attempt();
            let result = self.runner.run(job, self.config.timeout).await;
            if result.succeeded() {
                info!(job_id = %job.id, attempt = job.current_retries, "Job succeeded");
                return Ok(result);
            }

            warn!(
                job_id = %job.id,
                attempt = job.current_retries,
                retries = job.retries,
                error = ?result.error,
                "Job attempt failed"
            );
            if !job.failed() && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }
        }
        Err(ChronosError::ExhaustedRetries(job.id.clone()))
    }
}
