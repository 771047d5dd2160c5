// Pipeline metrics - Per-stage counts, dwell time and conversion from the raw history

use chrono::{DateTime, Utc};
use funnel_shared::{HistoryEntry, PipelineMetrics, PipelineRecord, Stage, StageMetrics};
use std::collections::HashMap;

use super::StageRegistry;

#[derive(Default)]
struct Tally {
    open: u64,
    entered: u64,
    exited: u64,
    exited_forward: u64,
    dwell_days: f64,
}

/// Aggregate current records and history into per-stage metrics.
///
/// `avg_days_in_stage` averages completed stays (history entries leaving the
/// stage). `conversion_rate` is the share of exits that did not go to LOST.
pub fn pipeline_metrics(
    registry: &StageRegistry,
    records: &[PipelineRecord],
    history: &[HistoryEntry],
    now: DateTime<Utc>,
) -> PipelineMetrics {
    let mut tallies: HashMap<Stage, Tally> = HashMap::new();

    for record in records {
        tallies.entry(record.current_stage).or_default().open += 1;
    }

    for entry in history {
        tallies.entry(entry.to_stage).or_default().entered += 1;
        if let Some(from) = entry.from_stage {
            let tally = tallies.entry(from).or_default();
            tally.exited += 1;
            tally.dwell_days += entry.duration_in_prior_stage_days;
            if entry.to_stage != Stage::Lost {
                tally.exited_forward += 1;
            }
        }
    }

    let stages = registry
        .stages()
        .into_iter()
        .map(|stage| {
            let tally = tallies.remove(&stage).unwrap_or_default();
            let (avg, conversion) = if tally.exited > 0 {
                (
                    Some(tally.dwell_days / tally.exited as f64),
                    Some(tally.exited_forward as f64 / tally.exited as f64),
                )
            } else {
                (None, None)
            };

            StageMetrics {
                stage,
                open_count: tally.open,
                entered_count: tally.entered,
                exited_count: tally.exited,
                avg_days_in_stage: avg,
                conversion_rate: conversion,
            }
        })
        .collect();

    let won_count = records.iter().filter(|r| r.won == Some(true)).count() as u64;
    let lost_count = records.iter().filter(|r| r.won == Some(false)).count() as u64;
    let closed = won_count + lost_count;

    PipelineMetrics {
        stages,
        total_records: records.len() as u64,
        won_count,
        lost_count,
        win_rate: (closed > 0).then(|| won_count as f64 / closed as f64),
        generated_at: now,
    }
}
