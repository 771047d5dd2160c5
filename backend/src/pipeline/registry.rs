// Stage Registry - Catalog of pipeline stages and the legal moves between them

use funnel_shared::Stage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Stage {0} is not configured in the registry")]
    UnknownStage(Stage),
    #[error("No transition configured from {from} to {to}")]
    TransitionNotFound { from: Stage, to: Stage },
    #[error("Invalid registry configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Failed to read registry file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse registry: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A declared edge between two stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: Stage,
    pub to: Stage,
    #[serde(default = "default_allowed")]
    pub allowed: bool,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub auto_advance_after_days: Option<u32>,
    /// Marks an edge that leaves a terminal stage.
    #[serde(default)]
    pub reopen: bool,
}

fn default_allowed() -> bool {
    true
}

impl Transition {
    pub fn allowed(from: Stage, to: Stage) -> Self {
        Self {
            from,
            to,
            allowed: true,
            requires_approval: false,
            auto_advance_after_days: None,
            reopen: false,
        }
    }

    pub fn forbidden(from: Stage, to: Stage) -> Self {
        Self {
            allowed: false,
            ..Self::allowed(from, to)
        }
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn auto_advance_after(mut self, days: u32) -> Self {
        self.auto_advance_after_days = Some(days);
        self
    }

    pub fn reopening(mut self) -> Self {
        self.reopen = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub stage: Stage,
    pub probability: u8,
}

/// Serialized form of a registry, as loaded from `PIPELINE_REGISTRY_PATH`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub stages: Vec<StageDefinition>,
    pub transitions: Vec<Transition>,
}

#[derive(Debug, Clone)]
pub struct StageRegistry {
    probabilities: HashMap<Stage, u8>,
    transitions: HashMap<(Stage, Stage), Transition>,
}

impl StageRegistry {
    /// Build a registry from configuration, rejecting inconsistent catalogs.
    pub fn new(config: RegistryConfig) -> Result<Self, RegistryError> {
        let mut probabilities = HashMap::new();
        for definition in &config.stages {
            if definition.probability > 100 {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "probability for {} must be between 0 and 100, got {}",
                    definition.stage, definition.probability
                )));
            }
            if probabilities.insert(definition.stage, definition.probability).is_some() {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "stage {} is defined more than once",
                    definition.stage
                )));
            }
        }

        if !probabilities.contains_key(&Stage::New) {
            return Err(RegistryError::InvalidConfiguration(
                "the initial stage NEW must be defined".to_string(),
            ));
        }

        let mut transitions = HashMap::new();
        let mut auto_sources = HashSet::new();
        for transition in config.transitions {
            for stage in [transition.from, transition.to] {
                if !probabilities.contains_key(&stage) {
                    return Err(RegistryError::UnknownStage(stage));
                }
            }

            if transition.from.is_terminal() && transition.allowed && !transition.reopen {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "{} -> {} leaves a terminal stage and must be marked reopen",
                    transition.from, transition.to
                )));
            }

            if let Some(days) = transition.auto_advance_after_days {
                if days == 0 || !transition.allowed || transition.requires_approval {
                    return Err(RegistryError::InvalidConfiguration(format!(
                        "auto-advance {} -> {} needs a positive day count on an allowed edge without approval",
                        transition.from, transition.to
                    )));
                }
                if !auto_sources.insert(transition.from) {
                    return Err(RegistryError::InvalidConfiguration(format!(
                        "stage {} has more than one auto-advance edge",
                        transition.from
                    )));
                }
            }

            let key = (transition.from, transition.to);
            if transitions.insert(key, transition).is_some() {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "transition {} -> {} is declared more than once",
                    key.0, key.1
                )));
            }
        }

        Ok(Self {
            probabilities,
            transitions,
        })
    }

    pub fn from_json(json: &str) -> Result<Self, RegistryError> {
        let config: RegistryConfig = serde_json::from_str(json)?;
        Self::new(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// The stock sales pipeline.
    pub fn sales_default() -> Self {
        let config = default_config();
        Self {
            probabilities: config
                .stages
                .into_iter()
                .map(|d| (d.stage, d.probability))
                .collect(),
            transitions: config
                .transitions
                .into_iter()
                .map(|t| ((t.from, t.to), t))
                .collect(),
        }
    }

    pub fn is_transition_allowed(&self, from: Stage, to: Stage) -> bool {
        self.transitions
            .get(&(from, to))
            .map(|t| t.allowed)
            .unwrap_or(false)
    }

    pub fn get_transition(&self, from: Stage, to: Stage) -> Result<&Transition, RegistryError> {
        self.transitions
            .get(&(from, to))
            .ok_or(RegistryError::TransitionNotFound { from, to })
    }

    pub fn probability_for(&self, stage: Stage) -> Result<u8, RegistryError> {
        self.probabilities
            .get(&stage)
            .copied()
            .ok_or(RegistryError::UnknownStage(stage))
    }

    pub fn stages(&self) -> Vec<Stage> {
        let mut stages: Vec<Stage> = self.probabilities.keys().copied().collect();
        stages.sort();
        stages
    }

    pub fn transitions_from(&self, stage: Stage) -> Vec<&Transition> {
        let mut out: Vec<&Transition> = self
            .transitions
            .values()
            .filter(|t| t.from == stage && t.allowed)
            .collect();
        out.sort_by_key(|t| t.to);
        out
    }

    pub fn auto_advance_transitions(&self) -> Vec<&Transition> {
        let mut out: Vec<&Transition> = self
            .transitions
            .values()
            .filter(|t| t.auto_advance_after_days.is_some())
            .collect();
        out.sort_by_key(|t| (t.from, t.to));
        out
    }

    /// Configuration view, ordered for stable output.
    pub fn snapshot(&self) -> RegistryConfig {
        let stages: BTreeMap<Stage, u8> = self.probabilities.iter().map(|(s, p)| (*s, *p)).collect();
        let mut transitions: Vec<Transition> = self.transitions.values().cloned().collect();
        transitions.sort_by_key(|t| (t.from, t.to));

        RegistryConfig {
            stages: stages
                .into_iter()
                .map(|(stage, probability)| StageDefinition { stage, probability })
                .collect(),
            transitions,
        }
    }
}

impl Default for StageRegistry {
    fn default() -> Self {
        Self::sales_default()
    }
}

pub fn default_config() -> RegistryConfig {
    use Stage::*;

    let stages = [
        (New, 10),
        (InitialContact, 20),
        (Qualification, 30),
        (Presentation, 50),
        (Proposal, 60),
        (Negotiation, 80),
        (FollowUp, 15),
        (Won, 100),
        (Lost, 0),
    ]
    .into_iter()
    .map(|(stage, probability)| StageDefinition { stage, probability })
    .collect();

    let transitions = vec![
        Transition::allowed(New, InitialContact),
        Transition::allowed(New, Qualification),
        Transition::allowed(New, Lost),
        Transition::allowed(InitialContact, Qualification),
        Transition::allowed(InitialContact, FollowUp).auto_advance_after(7),
        Transition::allowed(InitialContact, Lost),
        Transition::allowed(Qualification, Presentation),
        Transition::allowed(Qualification, FollowUp),
        Transition::allowed(Qualification, Lost),
        Transition::allowed(Presentation, Proposal),
        Transition::allowed(Presentation, FollowUp),
        Transition::allowed(Presentation, Lost),
        Transition::allowed(Proposal, Negotiation),
        Transition::allowed(Proposal, Won),
        Transition::allowed(Proposal, FollowUp).auto_advance_after(14),
        Transition::allowed(Proposal, Lost),
        Transition::allowed(Negotiation, Proposal),
        Transition::allowed(Negotiation, Won),
        Transition::allowed(Negotiation, FollowUp),
        Transition::allowed(Negotiation, Lost),
        Transition::allowed(FollowUp, InitialContact),
        Transition::allowed(FollowUp, Qualification),
        Transition::allowed(FollowUp, Presentation),
        Transition::allowed(FollowUp, Proposal),
        Transition::allowed(FollowUp, Negotiation),
        Transition::allowed(FollowUp, Lost).auto_advance_after(30),
        Transition::forbidden(Qualification, Won),
    ];

    RegistryConfig {
        stages,
        transitions,
    }
}
