use futures::future::join_all;
use funnel_shared::{Stage, TransitionKind};
use std::sync::Arc;
use uuid::Uuid;

use crate::automation::EventPublisher;
use crate::automation::actions::presets;
use crate::pipeline::registry::default_config;
use crate::pipeline::{
    PipelineError, PipelineStateMachine, StageMove, StageRegistry, Transition, UNSPECIFIED_LOSS_REASON,
};
use crate::services::EntityDataAccess;
use crate::store::InMemoryStore;
use crate::tests::fixtures::{LeadFixture, rule_on_stage};
use crate::tests::helpers::TestApp;

fn machine() -> Arc<PipelineStateMachine> {
    Arc::new(PipelineStateMachine::new(
        Arc::new(StageRegistry::sales_default()),
        Arc::new(InMemoryStore::new()),
        EventPublisher::disabled(),
    ))
}

#[tokio::test]
async fn test_lead_lifecycle_scenario() {
    let pipeline = machine();
    let lead = Uuid::new_v4();

    let record = pipeline.create(lead, None).await.unwrap();
    assert_eq!(record.current_stage, Stage::New);
    assert_eq!(record.probability_percent, 10);
    let history = pipeline.get_history(lead).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!((history[0].from_stage, history[0].to_stage), (None, Stage::New));

    let record = pipeline
        .move_to_stage(StageMove::manual(lead, Stage::Qualification, "maria"))
        .await
        .unwrap();
    assert_eq!(record.current_stage, Stage::Qualification);
    assert_eq!(record.probability_percent, 30);
    assert_eq!(pipeline.get_history(lead).await.unwrap().len(), 2);

    let err = pipeline
        .move_to_stage(StageMove::manual(lead, Stage::Won, "maria"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::InvalidTransition {
            from: Stage::Qualification,
            to: Stage::Won
        }
    ));
    assert_eq!(pipeline.get_history(lead).await.unwrap().len(), 2);
    assert_eq!(pipeline.get(lead).await.unwrap().current_stage, Stage::Qualification);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_moves_from_same_stage_serialize() {
    let pipeline = machine();
    let lead = Uuid::new_v4();
    pipeline.create(lead, None).await.unwrap();

    let attempts = (0..8).map(|i| {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            pipeline
                .move_to_stage(StageMove::manual(lead, Stage::InitialContact, &format!("rep-{}", i)))
                .await
        })
    });
    let results: Vec<_> = join_all(attempts).await.into_iter().map(|r| r.unwrap()).collect();

    let succeeded = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, PipelineError::InvalidTransition { .. }))
    );

    let history = pipeline.get_history(lead).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].from_stage, Some(Stage::New));
}

#[tokio::test]
async fn test_history_grows_by_one_per_move_in_order() {
    let pipeline = machine();
    let lead = Uuid::new_v4();
    pipeline.create(lead, None).await.unwrap();

    let path = [
        Stage::InitialContact,
        Stage::Qualification,
        Stage::Presentation,
        Stage::Proposal,
        Stage::Negotiation,
    ];
    for (i, stage) in path.iter().enumerate() {
        pipeline.move_to_stage(StageMove::manual(lead, *stage, "rep")).await.unwrap();
        assert_eq!(pipeline.get_history(lead).await.unwrap().len(), i + 2);
    }

    let mut history = pipeline.get_history(lead).await.unwrap();
    history.reverse();
    for pair in history.windows(2) {
        assert_eq!(pair[1].from_stage, Some(pair[0].to_stage));
        assert!(pair[1].created_at >= pair[0].created_at);
        assert!(pair[1].duration_in_prior_stage_days >= 0.0);
    }
}

#[tokio::test]
async fn test_reopen_after_loss_needs_approval_and_clears_outcome() {
    let mut config = default_config();
    config
        .transitions
        .push(Transition::allowed(Stage::Lost, Stage::Qualification).with_approval().reopening());
    let pipeline = PipelineStateMachine::new(
        Arc::new(StageRegistry::new(config).unwrap()),
        Arc::new(InMemoryStore::new()),
        EventPublisher::disabled(),
    );
    let lead = Uuid::new_v4();
    pipeline.create(lead, None).await.unwrap();

    let lost = pipeline.move_to_stage(StageMove::manual(lead, Stage::Lost, "rep")).await.unwrap();
    assert_eq!(lost.won, Some(false));
    assert_eq!(lost.loss_reason.as_deref(), Some(UNSPECIFIED_LOSS_REASON));

    let err = pipeline
        .move_to_stage(StageMove::manual(lead, Stage::Qualification, "rep"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ApprovalRequired { .. }));

    let reopened = pipeline
        .move_to_stage(StageMove::manual(lead, Stage::Qualification, "rep").approved_by("director"))
        .await
        .unwrap();
    assert!(reopened.closed_at.is_none());
    assert!(reopened.won.is_none() && reopened.loss_reason.is_none());
    assert_eq!(reopened.probability_percent, 30);

    let history = pipeline.get_history(lead).await.unwrap();
    assert!(history[0].notes.as_deref().is_some_and(|n| n.contains("approved by director")));
}

#[tokio::test]
async fn test_stage_change_event_reaches_automation() {
    let app = TestApp::new().await;
    let rule = app
        .state
        .engine
        .create_rule(
            rule_on_stage("Contacted", Stage::InitialContact)
                .with_action(presets::set_field("contacted", serde_json::json!(true))),
        )
        .await
        .unwrap();

    let lead = LeadFixture::default();
    app.add_lead(&lead).await;
    app.state
        .pipeline
        .move_to_stage(StageMove::new(lead.id, Stage::InitialContact, "importer", TransitionKind::Automatic))
        .await
        .unwrap();
    app.settle().await;

    let executions = app.executions_for(rule.id).await;
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].entity_id, lead.id);
    assert_eq!(app.entities.get_entity(lead.id).await.unwrap()["contacted"], serde_json::json!(true));
}
