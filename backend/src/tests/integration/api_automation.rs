use axum::http::{Method, StatusCode};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::tests::fixtures::LeadFixture;
use crate::tests::helpers::{TestApp, send_json};

fn qualification_rule_json() -> Value {
    json!({
        "name": "High revenue lead qualified",
        "priority": 10,
        "trigger": { "type": "stage_change", "to": "QUALIFICATION" },
        "conditions": [
            { "field": "ingresos", "operator": "gt", "value": { "source": "static", "value": 200000 } }
        ],
        "actions": [
            {
                "name": "Notify owner",
                "type": "notify",
                "config": { "target": "{{assigned_owner}}", "message": "{{name}} is qualified" }
            },
            {
                "name": "Discovery call",
                "type": "create_follow_up",
                "config": { "title": "Call {{company}}", "due_in_days": 2 }
            }
        ]
    })
}

fn manual_rule_json() -> Value {
    json!({
        "name": "Flag for review",
        "trigger": { "type": "manual" },
        "actions": [
            { "name": "Flag", "type": "update_field", "config": { "field": "needs_review", "value": true } }
        ]
    })
}

#[tokio::test]
async fn test_rule_created_over_http_runs_on_stage_change() {
    let app = TestApp::new().await;
    let router = app.router();

    let (status, rule) = send_json(
        &router,
        Method::POST,
        "/api/v1/automation/rules",
        Some(qualification_rule_json()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(rule["is_active"], true);
    assert_eq!(rule["condition_logic"], "AND");
    assert_eq!(rule["actions"][1]["type"], "create_follow_up");
    assert_eq!(rule["stats"]["execution_count"], 0);

    let lead = LeadFixture::with_ingresos(320_000);
    app.add_lead(&lead).await;
    send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead.id),
        Some(json!({ "to_stage": "QUALIFICATION", "actor": "maria" })),
    )
    .await;
    app.settle().await;

    let (status, executions) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/automation/executions?rule_id={}", rule["id"].as_str().unwrap()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let executions = executions.as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["status"], "completed");
    assert_eq!(executions[0]["successful_actions"], 2);
    assert_eq!(executions[0]["triggered_by"]["kind"]["to_stage"], "QUALIFICATION");

    let (_, follow_ups) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/entities/{}/follow-ups", lead.id),
        None,
    )
    .await;
    assert_eq!(follow_ups[0]["title"], format!("Call {}", lead.company));
    assert_eq!(app.delivery.sent().await[0].0, lead.owner);
}

#[tokio::test]
async fn test_invalid_rules_are_rejected() {
    let app = TestApp::new().await;
    let router = app.router();

    let mut no_actions = manual_rule_json();
    no_actions["actions"] = json!([]);
    let (status, body) = send_json(&router, Method::POST, "/api/v1/automation/rules", Some(no_actions)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(body["details"]["actions"].is_array());

    let bad_schedule = json!({
        "name": "Nightly",
        "trigger": { "type": "time_based", "schedule": "every night" },
        "actions": [
            { "name": "Flag", "type": "update_field", "config": { "field": "stale", "value": true } }
        ]
    });
    let (status, body) = send_json(&router, Method::POST, "/api/v1/automation/rules", Some(bad_schedule)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["details"]["rule"][0].as_str().unwrap().contains("cron"));

    let (_, rules) = send_json(&router, Method::GET, "/api/v1/automation/rules", None).await;
    assert!(rules.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_rules_are_listed_by_priority() {
    let app = TestApp::new().await;
    let router = app.router();

    let mut low = manual_rule_json();
    low["name"] = json!("Low");
    low["priority"] = json!(1);
    let mut high = manual_rule_json();
    high["name"] = json!("High");
    high["priority"] = json!(50);
    for rule in [low, high] {
        send_json(&router, Method::POST, "/api/v1/automation/rules", Some(rule)).await;
    }

    let (_, rules) = send_json(&router, Method::GET, "/api/v1/automation/rules", None).await;
    let names: Vec<&str> = rules.as_array().unwrap().iter().map(|r| r["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["High", "Low"]);
}

#[tokio::test]
async fn test_manual_run_and_execution_lookup() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = LeadFixture::default();
    app.add_lead(&lead).await;

    let (_, rule) = send_json(&router, Method::POST, "/api/v1/automation/rules", Some(manual_rule_json())).await;
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/automation/rules/{}/run", rule_id),
        Some(json!({ "entity_id": lead.id, "requested_by": "maria" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let execution_id = body["execution_ids"][0].as_str().unwrap().to_string();
    app.settle().await;

    let (status, execution) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/automation/executions/{}", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(execution["status"], "completed");
    assert_eq!(execution["entity_id"], lead.id.to_string());

    let (_, entity) = send_json(&router, Method::GET, &format!("/api/v1/entities/{}", lead.id), None).await;
    assert_eq!(entity["needs_review"], true);

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/automation/executions/{}/cancel", execution_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    let (status, _) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/automation/executions/{}", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, executions) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/automation/executions?entity_id={}&limit=5", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(executions.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_deactivated_rule_does_not_run() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = LeadFixture::default();
    app.add_lead(&lead).await;

    let (_, rule) = send_json(&router, Method::POST, "/api/v1/automation/rules", Some(manual_rule_json())).await;
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let (status, rule) = send_json(
        &router,
        Method::PUT,
        &format!("/api/v1/automation/rules/{}/active", rule_id),
        Some(json!({ "is_active": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rule["is_active"], false);

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/automation/rules/{}/run", rule_id),
        Some(json!({ "entity_id": lead.id, "requested_by": "maria" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["execution_ids"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_running_a_stage_rule_manually_is_a_bad_request() {
    let app = TestApp::new().await;
    let router = app.router();
    let (_, rule) = send_json(
        &router,
        Method::POST,
        "/api/v1/automation/rules",
        Some(qualification_rule_json()),
    )
    .await;

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/automation/rules/{}/run", rule["id"].as_str().unwrap()),
        Some(json!({ "entity_id": Uuid::new_v4(), "requested_by": "maria" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, _) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/automation/rules/{}", Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_entity_update_fires_field_rules() {
    let app = TestApp::new().await;
    let router = app.router();
    let (status, rule) = send_json(
        &router,
        Method::POST,
        "/api/v1/automation/rules",
        Some(json!({
            "name": "Big budget",
            "trigger": { "type": "field_update", "field": "ingresos" },
            "conditions": [
                { "field": "event.new_value", "operator": "greater_than", "value": { "source": "static", "value": 100000 } }
            ],
            "actions": [
                { "name": "Tag", "type": "update_field", "config": { "field": "tier", "value": "enterprise" } }
            ]
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let entity = Uuid::new_v4();

    // first write creates the entity and fires nothing
    let (status, _) = send_json(
        &router,
        Method::PUT,
        &format!("/api/v1/entities/{}", entity),
        Some(json!({ "name": "Acme", "ingresos": 50000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    app.settle().await;

    let (status, body) = send_json(
        &router,
        Method::PUT,
        &format!("/api/v1/entities/{}", entity),
        Some(json!({ "name": "Acme", "ingresos": 150000 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ingresos"], 150000);
    app.settle().await;

    let (_, executions) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/automation/executions?rule_id={}", rule["id"].as_str().unwrap()),
        None,
    )
    .await;
    assert_eq!(executions.as_array().unwrap().len(), 1);

    let (_, body) = send_json(&router, Method::GET, &format!("/api/v1/entities/{}", entity), None).await;
    assert_eq!(body["tier"], "enterprise");
}

#[tokio::test]
async fn test_jobs_endpoints_without_scheduler() {
    let app = TestApp::new().await;
    let (status, body) = send_json(&app.router(), Method::GET, "/api/v1/jobs/logs", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
}
