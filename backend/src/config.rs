use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

use crate::jobs::JobConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: String,
    /// Postgres connection string. Without one the service keeps its state in memory.
    pub database_url: Option<String>,
    /// JSON stage registry. The built-in sales pipeline is used when unset.
    pub registry_path: Option<String>,
    pub automation: AutomationConfig,
    pub jobs: JobConfig,
    pub delivery: DeliveryConfig,
}

/// Automation engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Number of execution workers
    pub workers: usize,
    /// Deepest event chain that may still trigger rules
    pub max_chain_depth: u32,
    /// Per-attempt action timeout (seconds)
    pub action_timeout_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_chain_depth: 3,
            action_timeout_secs: 30,
        }
    }
}

/// Where notifications go
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryConfig {
    pub webhook_url: Option<String>,
}

impl DeliveryConfig {
    /// Check if webhook delivery is configured
    pub fn is_configured(&self) -> bool {
        self.webhook_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(name: &str, default: T) -> T {
    optional(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let automation_defaults = AutomationConfig::default();
        let job_defaults = JobConfig::default();

        let automation = AutomationConfig {
            workers: parse_or("AUTOMATION_WORKERS", automation_defaults.workers),
            max_chain_depth: parse_or("AUTOMATION_MAX_CHAIN_DEPTH", automation_defaults.max_chain_depth),
            action_timeout_secs: parse_or("AUTOMATION_ACTION_TIMEOUT_SECS", automation_defaults.action_timeout_secs),
        };
        if automation.workers == 0 {
            anyhow::bail!("AUTOMATION_WORKERS must be at least 1");
        }
        if automation.action_timeout_secs == 0 {
            anyhow::bail!("AUTOMATION_ACTION_TIMEOUT_SECS must be at least 1");
        }

        let jobs = JobConfig {
            sweep_interval_minutes: parse_or("SWEEP_INTERVAL_MINUTES", job_defaults.sweep_interval_minutes),
            maintenance_cron: optional("MAINTENANCE_CRON").unwrap_or(job_defaults.maintenance_cron),
            execution_retention_days: parse_or("EXECUTION_LOG_RETENTION_DAYS", job_defaults.execution_retention_days),
        };

        Ok(Config {
            server_addr: optional("SERVER_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: optional("DATABASE_URL"),
            registry_path: optional("PIPELINE_REGISTRY_PATH"),
            automation,
            jobs,
            delivery: DeliveryConfig {
                webhook_url: optional("DELIVERY_WEBHOOK_URL"),
            },
        })
    }
}
