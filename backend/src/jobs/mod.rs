// Background Jobs
//
// Scheduled work for the pipeline: the stage sweep that auto-advances idle
// leads, execution log retention, and time-based automation rules. Jobs are
// scheduled with tokio-cron-scheduler.

pub mod maintenance;
pub mod scheduler;
pub mod stage_sweep;
pub mod time_triggers;

pub use maintenance::MaintenanceJob;
pub use scheduler::{JobConfig, JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};
pub use stage_sweep::{StageSweepJob, SweepResult};
pub use time_triggers::{TickResult, TimeTriggerJob};
