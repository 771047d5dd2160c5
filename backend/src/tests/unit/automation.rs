use funnel_shared::Stage;
use serde_json::json;
use std::sync::Arc;

use crate::automation::actions::presets;
use crate::automation::{
    Action, ActionKind, ActionStatus, AutomationError, AutomationRule, ExecutionStatus, LogLevel, RuleSettings,
    Trigger, TriggerEvent,
};
use crate::pipeline::StageMove;
use crate::services::EntityDataAccess;
use crate::store::{InMemoryStore, RuleStore};
use crate::tests::fixtures::{LeadFixture, qualification_rule, rule_on_stage};
use crate::tests::helpers::TestApp;

async fn move_lead(app: &TestApp, lead: &LeadFixture, path: &[Stage]) {
    for stage in path {
        app.state
            .pipeline
            .move_to_stage(StageMove::manual(lead.id, *stage, "rep"))
            .await
            .unwrap();
    }
}

fn broken_notify() -> Action {
    Action::new(
        "Alert escalation inbox",
        ActionKind::Notify {
            target: "broken@example.com".to_string(),
            message: "{{name}} needs attention".to_string(),
            channel: None,
        },
    )
    .with_retry(2, 1)
}

#[tokio::test]
async fn test_false_condition_completes_without_running_actions() {
    let app = TestApp::new().await;
    let rule = app.state.engine.create_rule(qualification_rule(200_000.0)).await.unwrap();

    let lead = LeadFixture::with_ingresos(150_000);
    app.add_lead(&lead).await;
    move_lead(&app, &lead, &[Stage::Qualification]).await;
    app.settle().await;

    let executions = app.executions_for(rule.id).await;
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.successful_actions, 0);
    assert_eq!(execution.failed_actions, 0);
    assert_eq!(execution.skipped_actions, 2);
    assert!(execution.action_results.iter().all(|r| r.status == ActionStatus::Skipped));

    assert!(app.delivery.sent().await.is_empty());
    assert!(app.entities.follow_ups_for(lead.id).await.is_empty());
}

#[tokio::test]
async fn test_true_condition_notifies_owner_and_creates_follow_up() {
    let app = TestApp::new().await;
    let rule = app.state.engine.create_rule(qualification_rule(200_000.0)).await.unwrap();

    let lead = LeadFixture::with_ingresos(250_000);
    app.add_lead(&lead).await;
    move_lead(&app, &lead, &[Stage::Qualification]).await;
    app.settle().await;

    let executions = app.executions_for(rule.id).await;
    assert_eq!(executions.len(), 1);
    assert!(executions[0].is_success());
    assert_eq!(executions[0].successful_actions, 2);

    let sent = app.delivery.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, lead.owner);
    assert_eq!(sent[0].1.message, format!("{} from {} is qualified", lead.name, lead.company));

    let follow_ups = app.entities.follow_ups_for(lead.id).await;
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].title, "Schedule discovery call");
    assert_eq!(follow_ups[0].created_by_rule, Some(rule.id));

    let stats = app.state.engine.get_rule(rule.id).await.unwrap().stats;
    assert_eq!((stats.execution_count, stats.success_count), (1, 1));
}

#[tokio::test]
async fn test_inactive_rule_never_executes() {
    let app = TestApp::new().await;
    let rule = app
        .state
        .engine
        .create_rule(qualification_rule(0.0).inactive())
        .await
        .unwrap();

    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    move_lead(&app, &lead, &[Stage::Qualification]).await;
    app.settle().await;

    assert!(app.executions_for(rule.id).await.is_empty());
    assert!(app.delivery.sent().await.is_empty());
}

#[tokio::test]
async fn test_tolerated_failure_keeps_going() {
    let app = TestApp::new().await;
    app.delivery.fail_for("broken@example.com").await;
    let rule = app
        .state
        .engine
        .create_rule(
            rule_on_stage("Escalate", Stage::InitialContact)
                .with_action(broken_notify().continue_on_error(true))
                .with_action(presets::set_field("escalated", json!(true))),
        )
        .await
        .unwrap();

    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    move_lead(&app, &lead, &[Stage::InitialContact]).await;
    app.settle().await;

    let execution = &app.executions_for(rule.id).await[0];
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(!execution.is_success());
    assert_eq!(execution.action_results[0].status, ActionStatus::Failed);
    assert_eq!(execution.action_results[0].retry_count, 2);
    assert!(execution.action_results[0].error.is_some());
    assert_eq!(execution.action_results[1].status, ActionStatus::Success);
    assert_eq!(app.entities.get_entity(lead.id).await.unwrap()["escalated"], json!(true));

    let stats = app.state.engine.get_rule(rule.id).await.unwrap().stats;
    assert_eq!(stats.error_count, 1);
}

#[tokio::test]
async fn test_halting_failure_skips_remaining_actions() {
    let app = TestApp::new().await;
    app.delivery.fail_for("broken@example.com").await;
    let rule = app
        .state
        .engine
        .create_rule(
            rule_on_stage("Escalate", Stage::InitialContact)
                .with_action(broken_notify().continue_on_error(false))
                .with_action(presets::set_field("escalated", json!(true))),
        )
        .await
        .unwrap();

    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    move_lead(&app, &lead, &[Stage::InitialContact]).await;
    app.settle().await;

    let execution = &app.executions_for(rule.id).await[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(
        (execution.successful_actions, execution.failed_actions, execution.skipped_actions),
        (0, 1, 1)
    );
    assert!(!app.entities.get_entity(lead.id).await.unwrap().contains_key("escalated"));
}

#[tokio::test]
async fn test_rule_stop_on_error_applies_to_actions_without_override() {
    let app = TestApp::new().await;
    app.delivery.fail_for("broken@example.com").await;
    let rule = app
        .state
        .engine
        .create_rule(
            rule_on_stage("Escalate", Stage::InitialContact)
                .with_action(broken_notify().with_retry(0, 1))
                .with_action(presets::set_field("escalated", json!(true)))
                .with_settings(RuleSettings {
                    stop_on_error: true,
                    ..Default::default()
                }),
        )
        .await
        .unwrap();

    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    move_lead(&app, &lead, &[Stage::InitialContact]).await;
    app.settle().await;

    let execution = &app.executions_for(rule.id).await[0];
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.action_results[0].retry_count, 0);
    assert_eq!(execution.action_results[1].status, ActionStatus::Skipped);
}

#[tokio::test]
async fn test_rule_ping_pong_stops_at_chain_depth() {
    let app = TestApp::new().await;
    let to_qualification = app
        .state
        .engine
        .create_rule(rule_on_stage("Requalify", Stage::FollowUp).with_action(presets::move_to(Stage::Qualification)))
        .await
        .unwrap();
    let to_follow_up = app
        .state
        .engine
        .create_rule(rule_on_stage("Park", Stage::Qualification).with_action(presets::move_to(Stage::FollowUp)))
        .await
        .unwrap();

    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    move_lead(&app, &lead, &[Stage::InitialContact, Stage::FollowUp]).await;
    app.settle().await;

    // depths 0 and 2 fire "Requalify", 1 and 3 fire "Park", depth 4 is dropped
    assert_eq!(app.executions_for(to_qualification.id).await.len(), 2);
    assert_eq!(app.executions_for(to_follow_up.id).await.len(), 2);

    let record = app.state.pipeline.get(lead.id).await.unwrap();
    assert_eq!(record.current_stage, Stage::FollowUp);
    assert_eq!(app.state.pipeline.get_history(lead.id).await.unwrap().len(), 7);
}

#[tokio::test]
async fn test_per_entity_limit_caps_executions() {
    let app = TestApp::new().await;
    let rule = app
        .state
        .engine
        .create_rule(
            AutomationRule::new(
                "Score changed",
                Trigger::FieldUpdate {
                    field: "score".to_string(),
                },
            )
            .with_action(presets::set_field("rescored", json!(true)))
            .with_settings(RuleSettings {
                max_executions_per_entity: Some(2),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    let limited = LeadFixture::default();
    let other = LeadFixture::default();
    app.add_lead(&limited).await;
    app.add_lead(&other).await;

    for score in 1..=3 {
        app.state
            .publisher
            .publish(TriggerEvent::field_updated(limited.id, "score", None, json!(score)));
    }
    app.state
        .publisher
        .publish(TriggerEvent::field_updated(other.id, "score", None, json!(1)));
    app.settle().await;

    let executions = app.executions_for(rule.id).await;
    assert_eq!(executions.iter().filter(|e| e.entity_id == limited.id).count(), 2);
    assert_eq!(executions.iter().filter(|e| e.entity_id == other.id).count(), 1);
}

#[tokio::test]
async fn test_manual_run_only_for_manual_rules() {
    let app = TestApp::new().await;
    let lead = LeadFixture::default();
    app.add_lead(&lead).await;

    let staged = app.state.engine.create_rule(qualification_rule(0.0)).await.unwrap();
    let err = app
        .state
        .engine
        .run_manual(staged.id, lead.id, "maria")
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::NotManual(id) if id == staged.id));

    let manual = app
        .state
        .engine
        .create_rule(
            AutomationRule::new("Mark reviewed", Trigger::Manual)
                .with_action(presets::set_field("reviewed", json!("{{company}}"))),
        )
        .await
        .unwrap();
    let ids = app.state.engine.run_manual(manual.id, lead.id, "maria").await.unwrap();
    assert_eq!(ids.len(), 1);
    app.settle().await;

    let execution = app.state.engine.get_execution(ids[0]).await.unwrap();
    assert!(execution.is_success());
    assert_eq!(app.entities.get_entity(lead.id).await.unwrap()["reviewed"], json!(lead.company));
}

#[tokio::test]
async fn test_invalid_rule_is_rejected_on_create() {
    let app = TestApp::new().await;
    let err = app
        .state
        .engine
        .create_rule(AutomationRule::new("Nothing to do", Trigger::EntityCreated))
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::Validation(_)));

    let err = app
        .state
        .engine
        .create_rule(
            AutomationRule::new("Far future", Trigger::EntityCreated)
                .with_action(presets::follow_up_in(100_000_000, "call")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::Validation(_)));
    assert!(app.state.engine.list_rules().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stored_rule_with_out_of_range_follow_up_still_finishes() {
    let store = Arc::new(InMemoryStore::new());
    let app = TestApp::with_memory_store(store.clone()).await;

    // Saved straight to the store, as a rule loaded from an older database would be.
    let rule = AutomationRule::new("Far future", Trigger::EntityCreated)
        .with_action(presets::follow_up_in(100_000_000, "call"))
        .with_action(presets::set_field("welcomed", json!(true)));
    store.save_rule(&rule).await.unwrap();
    app.state.engine.reload_rules().await.unwrap();

    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    app.settle().await;

    let executions = app.executions_for(rule.id).await;
    assert_eq!(executions.len(), 1);
    let execution = &executions[0];
    assert!(execution.status.is_terminal());
    assert_eq!(execution.action_results[0].status, ActionStatus::Failed);
    assert_eq!(execution.action_results[0].retry_count, 0);
    assert_eq!(execution.action_results[1].status, ActionStatus::Success);
    assert!(app.entities.follow_ups_for(lead.id).await.is_empty());

    let stats = app.state.engine.get_rule(rule.id).await.unwrap().stats;
    assert_eq!((stats.execution_count, stats.error_count), (1, 1));
}

#[tokio::test]
async fn test_unsaved_start_marks_execution_failed() {
    let store = Arc::new(InMemoryStore::new());
    let app = TestApp::with_memory_store(store.clone()).await;
    let rule = app
        .state
        .engine
        .create_rule(
            AutomationRule::new("Mark reviewed", Trigger::Manual)
                .with_action(presets::set_field("reviewed", json!(true))),
        )
        .await
        .unwrap();
    let lead = LeadFixture::default();
    app.add_lead(&lead).await;

    store.fail_running_saves(true);
    let ids = app.state.engine.run_manual(rule.id, lead.id, "maria").await.unwrap();
    app.settle().await;

    let execution = app.state.engine.get_execution(ids[0]).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.skipped_actions, 1);
    assert!(execution.completed_at.is_some());
    assert!(
        execution
            .logs
            .iter()
            .any(|l| l.level == LogLevel::Error && l.message.contains("could not be persisted"))
    );
    assert!(!app.entities.get_entity(lead.id).await.unwrap().contains_key("reviewed"));

    let stats = app.state.engine.get_rule(rule.id).await.unwrap().stats;
    assert_eq!((stats.execution_count, stats.success_count, stats.error_count), (1, 0, 1));
}

#[tokio::test]
async fn test_deactivating_keeps_recorded_stats() {
    let app = TestApp::new().await;
    let rule = app
        .state
        .engine
        .create_rule(
            AutomationRule::new("Mark reviewed", Trigger::Manual)
                .with_action(presets::set_field("reviewed", json!(true))),
        )
        .await
        .unwrap();
    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    app.state.engine.run_manual(rule.id, lead.id, "maria").await.unwrap();
    app.settle().await;

    let updated = app.state.engine.set_active(rule.id, false).await.unwrap();
    assert!(!updated.is_active);
    assert_eq!(updated.stats.execution_count, 1);
    assert_eq!(app.state.engine.get_rule(rule.id).await.unwrap().stats.success_count, 1);
    assert!(matches!(
        app.state.engine.set_active(uuid::Uuid::new_v4(), true).await,
        Err(AutomationError::RuleNotFound(_))
    ));
}
