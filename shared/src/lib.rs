use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A named position in the sales pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    New,
    InitialContact,
    Qualification,
    Presentation,
    Proposal,
    Negotiation,
    Won,
    Lost,
    FollowUp,
}

impl Stage {
    pub const ALL: [Stage; 9] = [
        Stage::New,
        Stage::InitialContact,
        Stage::Qualification,
        Stage::Presentation,
        Stage::Proposal,
        Stage::Negotiation,
        Stage::Won,
        Stage::Lost,
        Stage::FollowUp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::InitialContact => "INITIAL_CONTACT",
            Self::Qualification => "QUALIFICATION",
            Self::Presentation => "PRESENTATION",
            Self::Proposal => "PROPOSAL",
            Self::Negotiation => "NEGOTIATION",
            Self::Won => "WON",
            Self::Lost => "LOST",
            Self::FollowUp => "FOLLOW_UP",
        }
    }

    /// WON and LOST close the deal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Won | Self::Lost)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage '{0}'")]
pub struct ParseStageError(pub String);

impl FromStr for Stage {
    type Err = ParseStageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

/// What caused a stage change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransitionKind {
    Manual,
    Automatic,
    Scheduled,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Automatic => "AUTOMATIC",
            Self::Scheduled => "SCHEDULED",
        }
    }
}

impl FromStr for TransitionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MANUAL" => Ok(Self::Manual),
            "AUTOMATIC" => Ok(Self::Automatic),
            "SCHEDULED" => Ok(Self::Scheduled),
            other => Err(format!("unknown transition kind '{}'", other)),
        }
    }
}

/// Pipeline state of a single lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub current_stage: Stage,
    pub stage_entered_at: DateTime<Utc>,
    /// Set iff `current_stage` is terminal.
    pub closed_at: Option<DateTime<Utc>>,
    /// `Some(true)` for WON, `Some(false)` for LOST, `None` while open.
    pub won: Option<bool>,
    pub loss_reason: Option<String>,
    pub probability_percent: u8,
    pub expected_close_date: Option<NaiveDate>,
    pub last_activity_at: DateTime<Utc>,
    pub assigned_owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRecord {
    pub fn is_closed(&self) -> bool {
        self.current_stage.is_terminal()
    }

    /// Fractional days spent in the current stage as of `now`.
    pub fn days_in_stage(&self, now: DateTime<Utc>) -> f64 {
        (now - self.stage_entered_at).num_milliseconds() as f64 / MILLIS_PER_DAY
    }
}

pub const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Append-only audit entry written with every accepted transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub lead_id: Uuid,
    pub from_stage: Option<Stage>,
    pub to_stage: Stage,
    pub transition_kind: TransitionKind,
    pub duration_in_prior_stage_days: f64,
    pub actor: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-stage aggregates exposed to reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage: Stage,
    pub open_count: u64,
    pub entered_count: u64,
    pub exited_count: u64,
    pub avg_days_in_stage: Option<f64>,
    pub conversion_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub stages: Vec<StageMetrics>,
    pub total_records: u64,
    pub won_count: u64,
    pub lost_count: u64,
    pub win_rate: Option<f64>,
    pub generated_at: DateTime<Utc>,
}
