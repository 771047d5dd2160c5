// Job Scheduler - Central scheduler for the pipeline's background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{MaintenanceJob, StageSweepJob, TimeTriggerJob};
use crate::automation::{AutomationEngine, AutomationRule, Trigger};
use crate::pipeline::PipelineStateMachine;
use crate::store::{ExecutionStore, PipelineStore};

/// Number of job runs kept in memory.
const MAX_EXECUTION_LOGS: usize = 100;

/// Cron used to pick up added or deactivated time-based rules.
const RULE_SYNC_CRON: &str = "30 * * * * *";

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Storage error: {0}")]
    Store(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub sweep_interval_minutes: u32,
    pub maintenance_cron: String,
    pub execution_retention_days: u32,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            // Stage sweep - every 5 minutes
            sweep_interval_minutes: 5,
            // Maintenance - daily at 3 AM
            maintenance_cron: "0 0 3 * * *".to_string(),
            execution_retention_days: 30,
        }
    }
}

/// Minute steps that divide an hour evenly.
const SWEEP_STEPS: [u32; 12] = [1, 2, 3, 4, 5, 6, 10, 12, 15, 20, 30, 60];

impl JobConfig {
    /// Sweep interval rounded down to a divisor of 60 minutes. Other steps
    /// would leave a short gap at the top of each hour.
    pub fn sweep_interval(&self) -> u32 {
        SWEEP_STEPS
            .iter()
            .rev()
            .copied()
            .find(|step| *step <= self.sweep_interval_minutes)
            .unwrap_or(1)
    }

    pub fn sweep_cron(&self) -> String {
        match self.sweep_interval() {
            60 => "0 0 * * * *".to_string(),
            step => format!("0 */{} * * * *", step),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

impl JobExecutionLog {
    fn finished(job_name: &str, started_at: DateTime<Utc>, items_processed: i32, errors: Vec<String>) -> Self {
        let completed_at = Utc::now();
        let status = if errors.is_empty() {
            JobStatus::Completed
        } else if items_processed > 0 {
            JobStatus::PartialFailure
        } else {
            JobStatus::Failed
        };

        Self {
            id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            started_at,
            completed_at: Some(completed_at),
            status,
            items_processed,
            errors,
            duration_ms: Some((completed_at - started_at).num_milliseconds()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Completed,
    Failed,
    PartialFailure,
}

type ExecutionLogs = Arc<RwLock<Vec<JobExecutionLog>>>;

async fn push_log(logs: &ExecutionLogs, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    if logs.len() > MAX_EXECUTION_LOGS {
        logs.remove(0);
    }
}

async fn run_sweep(job: &StageSweepJob) -> JobExecutionLog {
    let started_at = Utc::now();
    info!("Running stage sweep job");

    match job.run().await {
        Ok(result) => JobExecutionLog::finished("Stage Sweep", started_at, result.advanced, result.errors),
        Err(e) => {
            error!("Stage sweep failed: {}", e);
            JobExecutionLog::finished("Stage Sweep", started_at, 0, vec![e.to_string()])
        }
    }
}

async fn run_maintenance(job: &MaintenanceJob, retention_days: u32) -> JobExecutionLog {
    let started_at = Utc::now();
    info!("Running execution log cleanup");

    match job.purge_executions(retention_days).await {
        Ok(removed) => JobExecutionLog::finished(
            "Execution Log Cleanup",
            started_at,
            i32::try_from(removed).unwrap_or(i32::MAX),
            Vec::new(),
        ),
        Err(e) => {
            error!("Execution log cleanup failed: {}", e);
            JobExecutionLog::finished("Execution Log Cleanup", started_at, 0, vec![e.to_string()])
        }
    }
}

/// Shared state needed to (re)schedule time-based rule jobs from inside a job.
#[derive(Clone)]
struct RuleJobs {
    scheduler: TokioScheduler,
    engine: Arc<AutomationEngine>,
    pipeline_store: Arc<dyn PipelineStore>,
    logs: ExecutionLogs,
    scheduled: Arc<RwLock<HashMap<Uuid, (String, Uuid)>>>,
}

impl RuleJobs {
    /// Add jobs for new or rescheduled time-based rules and drop jobs whose
    /// rule is gone or inactive.
    async fn sync(&self) -> JobResult<()> {
        let rules = self.engine.time_based_rules().await;
        let wanted: HashSet<(Uuid, &str)> = rules
            .iter()
            .filter_map(|r| match &r.trigger {
                Trigger::TimeBased { schedule, .. } => Some((r.id, schedule.as_str())),
                _ => None,
            })
            .collect();

        let stale: Vec<(Uuid, Uuid)> = {
            let scheduled = self.scheduled.read().await;
            scheduled
                .iter()
                .filter(|(rule_id, (schedule, _))| !wanted.contains(&(**rule_id, schedule.as_str())))
                .map(|(rule_id, (_, job_id))| (*rule_id, *job_id))
                .collect()
        };
        for (rule_id, job_id) in stale {
            self.scheduler.remove(&job_id).await?;
            self.scheduled.write().await.remove(&rule_id);
            info!("Unscheduled time-based rule {}", rule_id);
        }

        for rule in rules {
            if self.scheduled.read().await.contains_key(&rule.id) {
                continue;
            }
            if let Err(e) = self.schedule(rule.clone()).await {
                warn!("Could not schedule rule '{}': {}", rule.name, e);
            }
        }

        Ok(())
    }

    async fn schedule(&self, rule: Arc<AutomationRule>) -> JobResult<()> {
        let Trigger::TimeBased { schedule, .. } = &rule.trigger else {
            return Ok(());
        };

        let engine = self.engine.clone();
        let store = self.pipeline_store.clone();
        let logs = self.logs.clone();
        let job_rule = rule.clone();

        let job = Job::new_async(schedule.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            let store = store.clone();
            let logs = logs.clone();
            let rule = job_rule.clone();

            Box::pin(async move {
                let started_at = Utc::now();
                let job_name = format!("Rule: {}", rule.name);

                let log = match TimeTriggerJob::new(engine, store).run(&rule).await {
                    Ok(result) => {
                        JobExecutionLog::finished(&job_name, started_at, result.executions_queued, result.errors)
                    }
                    Err(e) => {
                        error!("Time trigger for rule '{}' failed: {}", rule.name, e);
                        JobExecutionLog::finished(&job_name, started_at, 0, vec![e.to_string()])
                    }
                };
                push_log(&logs, log).await;
            })
        })?;

        let job_id = self.scheduler.add(job).await?;
        self.scheduled.write().await.insert(rule.id, (schedule.clone(), job_id));
        info!("Scheduled time-based rule '{}' at '{}'", rule.name, schedule);

        Ok(())
    }
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    pipeline: Arc<PipelineStateMachine>,
    pipeline_store: Arc<dyn PipelineStore>,
    executions: Arc<dyn ExecutionStore>,
    config: JobConfig,
    execution_logs: ExecutionLogs,
    rule_jobs: RuleJobs,
}

impl JobScheduler {
    pub async fn new(
        pipeline: Arc<PipelineStateMachine>,
        pipeline_store: Arc<dyn PipelineStore>,
        engine: Arc<AutomationEngine>,
        executions: Arc<dyn ExecutionStore>,
        config: JobConfig,
    ) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;
        let execution_logs: ExecutionLogs = Arc::new(RwLock::new(Vec::new()));

        let rule_jobs = RuleJobs {
            scheduler: scheduler.clone(),
            engine,
            pipeline_store: pipeline_store.clone(),
            logs: execution_logs.clone(),
            scheduled: Arc::new(RwLock::new(HashMap::new())),
        };

        Ok(Self {
            scheduler,
            pipeline,
            pipeline_store,
            executions,
            config,
            execution_logs,
            rule_jobs,
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        // Schedule Stage Sweep
        self.schedule_stage_sweep().await?;

        // Schedule Execution Log Cleanup
        self.schedule_maintenance().await?;

        // Schedule Time-Based Rules
        self.rule_jobs.sync().await?;
        self.schedule_rule_sync().await?;

        // Start the scheduler
        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_stage_sweep(&self) -> JobResult<()> {
        let cron_expr = self.config.sweep_cron();

        let pipeline = self.pipeline.clone();
        let store = self.pipeline_store.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let pipeline = pipeline.clone();
            let store = store.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log = run_sweep(&StageSweepJob::new(pipeline, store)).await;
                push_log(&logs, log).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled stage sweep every {} minutes", self.config.sweep_interval());

        Ok(())
    }

    async fn schedule_maintenance(&self) -> JobResult<()> {
        let executions = self.executions.clone();
        let retention_days = self.config.execution_retention_days;
        let logs = self.execution_logs.clone();

        let job = Job::new_async(self.config.maintenance_cron.as_str(), move |_uuid, _lock| {
            let executions = executions.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log = run_maintenance(&MaintenanceJob::new(executions), retention_days).await;
                push_log(&logs, log).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled execution log cleanup at '{}'", self.config.maintenance_cron);

        Ok(())
    }

    async fn schedule_rule_sync(&self) -> JobResult<()> {
        let rule_jobs = self.rule_jobs.clone();

        let job = Job::new_async(RULE_SYNC_CRON, move |_uuid, _lock| {
            let rule_jobs = rule_jobs.clone();

            Box::pin(async move {
                debug!("Syncing time-based rule jobs");
                if let Err(e) = rule_jobs.sync().await {
                    warn!("Time-based rule sync failed: {}", e);
                }
            })
        })?;

        self.scheduler.add(job).await?;
        Ok(())
    }

    /// Pick up rule changes without waiting for the next sync tick.
    pub async fn sync_rules(&self) -> JobResult<()> {
        self.rule_jobs.sync().await
    }

    pub async fn scheduled_rules(&self) -> Vec<Uuid> {
        self.rule_jobs.scheduled.read().await.keys().copied().collect()
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<JobExecutionLog> {
        let log = match job_name {
            "stage_sweep" => {
                run_sweep(&StageSweepJob::new(self.pipeline.clone(), self.pipeline_store.clone())).await
            }
            "maintenance" => {
                run_maintenance(
                    &MaintenanceJob::new(self.executions.clone()),
                    self.config.execution_retention_days,
                )
                .await
            }
            _ => return Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        };

        push_log(&self.execution_logs, log.clone()).await;
        Ok(log)
    }
}
