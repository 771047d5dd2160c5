// Stage Sweep Job - Advances leads that sat in a stage past its auto-advance threshold

use chrono::{DateTime, Duration, Utc};
use funnel_shared::TransitionKind;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{JobError, JobResult};
use crate::pipeline::{PipelineStateMachine, StageMove};
use crate::store::PipelineStore;

pub const SWEEP_ACTOR: &str = "system:stage-sweep";

pub struct StageSweepJob {
    pipeline: Arc<PipelineStateMachine>,
    store: Arc<dyn PipelineStore>,
}

#[derive(Debug, Default)]
pub struct SweepResult {
    pub candidates: i32,
    pub advanced: i32,
    pub errors: Vec<String>,
}

impl StageSweepJob {
    pub fn new(pipeline: Arc<PipelineStateMachine>, store: Arc<dyn PipelineStore>) -> Self {
        Self { pipeline, store }
    }

    pub async fn run(&self) -> JobResult<SweepResult> {
        self.run_at(Utc::now()).await
    }

    /// Sweep as of `now`. A failure on one lead is recorded and the sweep
    /// moves on to the next candidate.
    pub async fn run_at(&self, now: DateTime<Utc>) -> JobResult<SweepResult> {
        let mut result = SweepResult::default();

        for transition in self.pipeline.registry().auto_advance_transitions() {
            let Some(days) = transition.auto_advance_after_days else {
                continue;
            };
            let threshold = now - Duration::days(i64::from(days));

            let stale = self
                .store
                .find_stale(transition.from, threshold)
                .await
                .map_err(|e| JobError::Store(e.to_string()))?;

            debug!(
                "{} leads in {} entered before {}",
                stale.len(),
                transition.from,
                threshold
            );

            for record in stale {
                result.candidates += 1;

                let request = StageMove::new(record.lead_id, transition.to, SWEEP_ACTOR, TransitionKind::Automatic)
                    .expecting(transition.from)
                    .with_notes(&format!("No activity in {} for {} days", transition.from, days));

                match self.pipeline.move_to_stage(request).await {
                    Ok(_) => result.advanced += 1,
                    Err(e) => {
                        warn!(
                            "Failed to advance lead {} from {} to {}: {}",
                            record.lead_id, transition.from, transition.to, e
                        );
                        result.errors.push(format!("{}: {}", record.lead_id, e));
                    }
                }
            }
        }

        info!(
            "Stage sweep complete: {} candidates, {} advanced, {} errors",
            result.candidates,
            result.advanced,
            result.errors.len()
        );

        Ok(result)
    }
}
