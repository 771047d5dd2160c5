// Maintenance Job - Retention cleanup for the automation execution log

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::info;

use super::{JobError, JobResult};
use crate::store::ExecutionStore;

pub struct MaintenanceJob {
    executions: Arc<dyn ExecutionStore>,
}

impl MaintenanceJob {
    pub fn new(executions: Arc<dyn ExecutionStore>) -> Self {
        Self { executions }
    }

    /// Delete finished executions older than `retention_days`. Pending and
    /// running executions are never removed.
    pub async fn purge_executions(&self, retention_days: u32) -> JobResult<u64> {
        if retention_days == 0 {
            return Err(JobError::ConfigError("execution retention must be at least one day".into()));
        }

        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let removed = self
            .executions
            .purge_executions(cutoff)
            .await
            .map_err(|e| JobError::Store(e.to_string()))?;

        info!("Purged {} automation executions completed before {}", removed, cutoff);
        Ok(removed)
    }
}
