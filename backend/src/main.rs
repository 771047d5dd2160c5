use axum::http::Method;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod automation;
mod config;
mod database;
mod error;
mod handlers;
mod jobs;
mod pipeline;
mod services;
mod store;

pub use error::{ApiError, ApiResult, AppError};

#[cfg(test)]
mod tests;

use automation::{ActionExecutor, AutomationEngine, EventPublisher, ExecutionQueue, RuleRunner};
use config::AutomationConfig;
use jobs::JobScheduler;
use pipeline::{PipelineStateMachine, StageRegistry};
use services::{DeliveryService, InMemoryEntities, LogDelivery, WebhookDelivery};
use store::{ExecutionStore, InMemoryStore, PgStore, PipelineStore, RuleStore};

/// How long shutdown waits for queued automation to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Stores {
    pub pipeline: Arc<dyn PipelineStore>,
    pub rules: Arc<dyn RuleStore>,
    pub executions: Arc<dyn ExecutionStore>,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            pipeline: store.clone(),
            rules: store.clone(),
            executions: store,
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(PgStore::new(pool));
        Self {
            pipeline: store.clone(),
            rules: store.clone(),
            executions: store,
        }
    }
}

pub struct AppState {
    pub pipeline: Arc<PipelineStateMachine>,
    pub engine: Arc<AutomationEngine>,
    pub entities: Arc<InMemoryEntities>,
    pub publisher: EventPublisher,
    pub queue: Arc<ExecutionQueue>,
    pub scheduler: Option<Arc<JobScheduler>>,
    pub db_pool: Option<PgPool>,
}

impl AppState {
    /// Wire the pipeline and the automation engine together and start the
    /// event dispatcher and execution workers.
    pub async fn build(
        config: &AutomationConfig,
        registry: StageRegistry,
        stores: Stores,
        entities: Arc<InMemoryEntities>,
        delivery: Arc<dyn DeliveryService>,
    ) -> anyhow::Result<Self> {
        let (publisher, subscriber) = EventPublisher::channel();

        let pipeline = Arc::new(PipelineStateMachine::new(
            Arc::new(registry),
            stores.pipeline.clone(),
            publisher.clone(),
        ));

        let queue = ExecutionQueue::new();
        let engine = Arc::new(
            AutomationEngine::new(
                stores.rules.clone(),
                stores.executions.clone(),
                queue.clone(),
                config.max_chain_depth,
            )
            .await?,
        );

        let executor = ActionExecutor::new(
            pipeline.clone(),
            entities.clone(),
            delivery,
            publisher.clone(),
            Duration::from_secs(config.action_timeout_secs),
        );
        let runner = Arc::new(RuleRunner::new(
            executor,
            pipeline.clone(),
            entities.clone(),
            stores.rules,
            stores.executions,
        ));

        queue.spawn_workers(config.workers, runner);
        engine.spawn_dispatcher(subscriber);

        Ok(Self {
            pipeline,
            engine,
            entities,
            publisher,
            queue,
            scheduler: None,
            db_pool: None,
        })
    }

    /// Resolve once every published event has been dispatched and every
    /// execution it produced has finished.
    pub async fn drain(&self) {
        loop {
            let published = self.publisher.published();
            if self.publisher.in_flight() == 0 {
                self.queue.wait_idle().await;
                if self.publisher.in_flight() == 0 && self.publisher.published() == published {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "funnel_backend=info,tower_http=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;

    let registry = match &config.registry_path {
        Some(path) => {
            tracing::info!("Loading stage registry from {}", path);
            StageRegistry::from_file(path)?
        }
        None => StageRegistry::sales_default(),
    };

    let db_pool = match &config.database_url {
        Some(url) => {
            let pool = database::create_pool(url, database::PoolConfig::from_env()).await?;
            database::migrate(&pool).await?;
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, pipeline state is kept in memory only");
            None
        }
    };
    let stores = match &db_pool {
        Some(pool) => Stores::postgres(pool.clone()),
        None => Stores::in_memory(),
    };

    let delivery: Arc<dyn DeliveryService> = match &config.delivery.webhook_url {
        Some(url) if config.delivery.is_configured() => Arc::new(WebhookDelivery::new(url)),
        _ => Arc::new(LogDelivery),
    };

    let mut state = AppState::build(
        &config.automation,
        registry,
        stores.clone(),
        Arc::new(InMemoryEntities::new()),
        delivery,
    )
    .await?;
    state.db_pool = db_pool;

    let scheduler = Arc::new(
        JobScheduler::new(
            state.pipeline.clone(),
            stores.pipeline,
            state.engine.clone(),
            stores.executions,
            config.jobs.clone(),
        )
        .await?,
    );
    scheduler.start().await?;
    state.scheduler = Some(scheduler.clone());

    let app_state = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH])
        .allow_headers(Any);

    let app = handlers::api_router(app_state.clone()).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    );

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    if tokio::time::timeout(DRAIN_TIMEOUT, app_state.drain()).await.is_err() {
        tracing::warn!("Automation still busy after {}s, exiting anyway", DRAIN_TIMEOUT.as_secs());
    }

    Ok(())
}
