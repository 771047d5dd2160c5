// Postgres-backed store tests. Skipped unless TEST_DATABASE_URL is set.

use chrono::{Duration, Utc};
use funnel_shared::Stage;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use uuid::Uuid;

use crate::Stores;
use crate::automation::actions::presets;
use crate::automation::{AutomationExecution, AutomationRule, EventPublisher, ExecutionStatus, Trigger, TriggerEvent};
use crate::config::AutomationConfig;
use crate::pipeline::{PipelineError, PipelineStateMachine, StageMove, StageRegistry};
use crate::store::{ExecutionFilter, ExecutionStore, PgStore, PipelineStore, RuleStore};
use crate::tests::TestContext;
use crate::tests::fixtures::{LeadFixture, qualification_rule};
use crate::tests::helpers::TestApp;

fn machine(store: Arc<PgStore>) -> PipelineStateMachine {
    PipelineStateMachine::new(Arc::new(StageRegistry::sales_default()), store, EventPublisher::disabled())
}

#[tokio::test]
#[serial]
async fn test_pg_create_is_idempotent_and_moves_append_history() {
    let Some(ctx) = TestContext::from_env().await else {
        return;
    };
    let store = Arc::new(PgStore::new(ctx.db_pool.clone()));
    let pipeline = machine(store.clone());
    let lead = Uuid::new_v4();

    let first = pipeline.create(lead, Some("maria@example.com".into())).await.unwrap();
    let second = pipeline.create(lead, None).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.assigned_owner.as_deref(), Some("maria@example.com"));

    pipeline
        .move_to_stage(StageMove::manual(lead, Stage::Qualification, "maria"))
        .await
        .unwrap();
    let err = pipeline
        .move_to_stage(StageMove::manual(lead, Stage::Won, "maria"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));

    let history = store.history(lead).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].to_stage, Stage::Qualification);
    assert_eq!(history[0].from_stage, Some(Stage::New));
    assert_eq!(history[1].from_stage, None);

    let record = store.find_record(lead).await.unwrap().unwrap();
    assert_eq!(record.current_stage, Stage::Qualification);
    assert_eq!(record.probability_percent, 30);
    assert_eq!(store.find_in_stage(Stage::Qualification).await.unwrap().len(), 1);
    assert!(
        store
            .find_stale(Stage::Qualification, Utc::now() - Duration::days(1))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
#[serial]
async fn test_pg_rules_round_trip_with_stats() {
    let Some(ctx) = TestContext::from_env().await else {
        return;
    };
    let store = PgStore::new(ctx.db_pool.clone());
    let rule = qualification_rule(200_000.0).with_priority(5);

    store.save_rule(&rule).await.unwrap();
    store.record_outcome(rule.id, true, Utc::now()).await.unwrap();
    store.record_outcome(rule.id, false, Utc::now()).await.unwrap();

    let loaded = store.get_rule(rule.id).await.unwrap().unwrap();
    assert_eq!(loaded.name, rule.name);
    assert_eq!(loaded.priority, 5);
    assert_eq!(loaded.trigger, rule.trigger);
    assert_eq!(loaded.conditions, rule.conditions);
    assert_eq!(loaded.actions, rule.actions);
    assert_eq!(
        (loaded.stats.execution_count, loaded.stats.success_count, loaded.stats.error_count),
        (2, 1, 1)
    );
    assert_eq!(store.list_rules().await.unwrap().len(), 1);
    assert!(store.get_rule(Uuid::new_v4()).await.unwrap().is_none());

    let paused = store.set_rule_active(rule.id, false, Utc::now()).await.unwrap().unwrap();
    assert!(!paused.is_active);
    assert_eq!(paused.stats.execution_count, 2);
    assert!(!store.get_rule(rule.id).await.unwrap().unwrap().is_active);
    assert!(store.set_rule_active(Uuid::new_v4(), true, Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
#[serial]
async fn test_pg_terminal_executions_are_immutable_and_purgeable() {
    let Some(ctx) = TestContext::from_env().await else {
        return;
    };
    let store = PgStore::new(ctx.db_pool.clone());
    let rule = AutomationRule::new("Flag", Trigger::Manual).with_action(presets::set_field("flag", json!(true)));
    store.save_rule(&rule).await.unwrap();

    let lead = Uuid::new_v4();
    let mut done = AutomationExecution::new(&rule, TriggerEvent::manual(rule.id, lead, "maria"));
    store.save_execution(&done).await.unwrap();
    done.start();
    done.finish(ExecutionStatus::Completed);
    store.save_execution(&done).await.unwrap();

    let mut rewrite = done.clone();
    rewrite.status = ExecutionStatus::Failed;
    assert!(store.save_execution(&rewrite).await.is_err());
    assert_eq!(
        store.get_execution(done.id).await.unwrap().unwrap().status,
        ExecutionStatus::Completed
    );

    let pending = AutomationExecution::new(&rule, TriggerEvent::manual(rule.id, lead, "maria"));
    store.save_execution(&pending).await.unwrap();
    assert_eq!(store.count_executions(rule.id, Some(lead), None).await.unwrap(), 2);
    assert_eq!(
        store
            .list_executions(&ExecutionFilter {
                entity_id: Some(lead),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap()
            .len(),
        1
    );

    let purged = store.purge_executions(Utc::now() + Duration::minutes(1)).await.unwrap();
    assert_eq!(purged, 1);
    assert!(store.get_execution(done.id).await.unwrap().is_none());
    assert!(store.get_execution(pending.id).await.unwrap().is_some());
}

#[tokio::test]
#[serial]
async fn test_pg_backed_automation_end_to_end() {
    let Some(ctx) = TestContext::from_env().await else {
        return;
    };
    let app = TestApp::with_stores(
        AutomationConfig {
            workers: 2,
            max_chain_depth: 3,
            action_timeout_secs: 5,
        },
        Stores::postgres(ctx.db_pool.clone()),
    )
    .await;
    let rule = app.state.engine.create_rule(qualification_rule(200_000.0)).await.unwrap();

    let lead = LeadFixture::with_ingresos(260_000);
    app.add_lead(&lead).await;
    app.state
        .pipeline
        .move_to_stage(StageMove::manual(lead.id, Stage::Qualification, "maria"))
        .await
        .unwrap();
    app.settle().await;

    let executions = app.executions_for(rule.id).await;
    assert_eq!(executions.len(), 1);
    assert!(executions[0].is_success());
    assert_eq!(app.delivery.sent().await.len(), 1);
}
