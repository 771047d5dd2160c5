use serde::Serialize;
use sqlx::{PgPool, Postgres, migrate::MigrateDatabase, postgres::PgPoolOptions};
use std::time::Duration;

/// Database pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum idle time before a connection is closed
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl PoolConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            max_connections: env_number("DB_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            min_connections: env_number("DB_MIN_CONNECTIONS").unwrap_or(defaults.min_connections),
            acquire_timeout: env_number("DB_ACQUIRE_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
            idle_timeout: defaults.idle_timeout,
        };

        // A minimum above the maximum makes the pool refuse to start.
        Self {
            min_connections: config.min_connections.min(config.max_connections),
            ..config
        }
    }
}

/// Connect to Postgres, creating the database if needed
pub async fn create_pool(database_url: &str, config: PoolConfig) -> anyhow::Result<PgPool> {
    if !Postgres::database_exists(database_url).await? {
        Postgres::create_database(database_url).await?;
        tracing::info!("Database created successfully");
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    tracing::info!(
        "Database pool created: max={}, min={}, acquire_timeout={}s",
        config.max_connections,
        config.min_connections,
        config.acquire_timeout.as_secs()
    );

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Database status reported by the health endpoint
#[derive(Debug, Serialize)]
pub struct DatabaseHealth {
    pub reachable: bool,
    pub pool_size: u32,
    pub idle: u32,
}

pub async fn health_check(pool: &PgPool) -> DatabaseHealth {
    let reachable = sqlx::query("SELECT 1").execute(pool).await.is_ok();
    DatabaseHealth {
        reachable,
        pool_size: pool.size(),
        idle: pool.num_idle() as u32,
    }
}
