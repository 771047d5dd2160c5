// Common test utilities and shared test setup
use sqlx::PgPool;

pub mod helpers;
pub mod integration;

pub struct TestContext {
    pub db_pool: PgPool,
}

impl TestContext {
    /// Connect to `TEST_DATABASE_URL` and run migrations. Returns `None` when
    /// no test database is configured so database tests can be skipped.
    pub async fn from_env() -> Option<Self> {
        let database_url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        let ctx = Self { db_pool: pool };
        ctx.cleanup().await;
        Some(ctx)
    }

    pub async fn cleanup(&self) {
        for table in [
            "pipeline_history",
            "pipeline_records",
            "automation_executions",
            "automation_rules",
        ] {
            sqlx::query(&format!("TRUNCATE TABLE {} CASCADE", table))
                .execute(&self.db_pool)
                .await
                .expect("Failed to truncate test table");
        }
    }
}
