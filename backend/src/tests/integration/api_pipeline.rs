use axum::http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;

use crate::tests::helpers::{TestApp, send_json};

#[tokio::test]
async fn test_create_and_move_lead() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = Uuid::new_v4();

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}", lead),
        Some(json!({ "assigned_owner": "maria@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["current_stage"], "NEW");
    assert_eq!(body["probability_percent"], 10);
    assert_eq!(body["assigned_owner"], "maria@example.com");

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "QUALIFICATION", "actor": "maria", "notes": "Budget confirmed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["current_stage"], "QUALIFICATION");
    assert_eq!(body["probability_percent"], 30);

    let (status, body) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/pipeline/{}/history", lead),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let history = body.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["from_stage"], "NEW");
    assert_eq!(history[0]["to_stage"], "QUALIFICATION");
    assert_eq!(history[0]["notes"], "Budget confirmed");
    assert_eq!(history[1]["from_stage"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_create_without_body_is_idempotent() {
    let app = TestApp::new().await;
    let router = app.router();
    let uri = format!("/api/v1/pipeline/{}", Uuid::new_v4());

    let (status, first) = send_json(&router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, second) = send_json(&router, Method::POST, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["id"], second["id"]);

    let (_, history) = send_json(&router, Method::GET, &format!("{}/history", uri), None).await;
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_forbidden_transition_is_a_conflict() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = Uuid::new_v4();
    send_json(&router, Method::POST, &format!("/api/v1/pipeline/{}", lead), None).await;
    send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "QUALIFICATION", "actor": "maria" })),
    )
    .await;

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "WON", "actor": "maria" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_TRANSITION");

    let (_, record) = send_json(&router, Method::GET, &format!("/api/v1/pipeline/{}", lead), None).await;
    assert_eq!(record["current_stage"], "QUALIFICATION");
}

#[tokio::test]
async fn test_closing_as_lost_records_reason() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = Uuid::new_v4();
    send_json(&router, Method::POST, &format!("/api/v1/pipeline/{}", lead), None).await;

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "LOST", "actor": "maria", "loss_reason": "Went with a competitor" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["won"], false);
    assert_eq!(body["loss_reason"], "Went with a competitor");
    assert_eq!(body["probability_percent"], 0);
    assert!(body["closed_at"].is_string());

    let (status, _) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "QUALIFICATION", "actor": "maria" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_lead_is_not_found() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = Uuid::new_v4();

    let (status, body) = send_json(&router, Method::GET, &format!("/api/v1/pipeline/{}", lead), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send_json(&router, Method::GET, &format!("/api/v1/pipeline/{}/history", lead), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "QUALIFICATION", "actor": "maria" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_move_requires_actor() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = Uuid::new_v4();
    send_json(&router, Method::POST, &format!("/api/v1/pipeline/{}", lead), None).await;

    let (status, body) = send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "QUALIFICATION", "actor": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert_eq!(body["details"]["actor"][0], "actor is required");
}

#[tokio::test]
async fn test_update_owner_and_close_date() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = Uuid::new_v4();
    send_json(&router, Method::POST, &format!("/api/v1/pipeline/{}", lead), None).await;

    let (status, body) = send_json(
        &router,
        Method::PATCH,
        &format!("/api/v1/pipeline/{}", lead),
        Some(json!({ "assigned_owner": "jon@example.com", "expected_close_date": "2026-12-31" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["assigned_owner"], "jon@example.com");
    assert_eq!(body["expected_close_date"], "2026-12-31");
    assert_eq!(body["current_stage"], "NEW");
}

#[tokio::test]
async fn test_metrics_and_registry() {
    let app = TestApp::new().await;
    let router = app.router();
    for to in ["QUALIFICATION", "LOST"] {
        let lead = Uuid::new_v4();
        send_json(&router, Method::POST, &format!("/api/v1/pipeline/{}", lead), None).await;
        send_json(
            &router,
            Method::POST,
            &format!("/api/v1/pipeline/{}/move", lead),
            Some(json!({ "to_stage": to, "actor": "maria" })),
        )
        .await;
    }

    let (status, metrics) = send_json(&router, Method::GET, "/api/v1/pipeline/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics["total_records"], 2);
    assert_eq!(metrics["lost_count"], 1);
    assert_eq!(metrics["won_count"], 0);

    let (status, registry) = send_json(&router, Method::GET, "/api/v1/pipeline/registry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(registry["stages"].as_array().unwrap().len(), 9);
    let forbidden = registry["transitions"]
        .as_array()
        .unwrap()
        .iter()
        .find(|t| t["from"] == "QUALIFICATION" && t["to"] == "WON")
        .cloned();
    assert!(forbidden.is_none_or(|t| t["allowed"] == false));
}

#[tokio::test]
async fn test_health_reports_in_memory_storage() {
    let app = TestApp::new().await;
    let (status, body) = send_json(&app.router(), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["storage"], "memory");
    assert_eq!(body["database"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_next_stages_follow_registry() {
    let app = TestApp::new().await;
    let router = app.router();
    let lead = Uuid::new_v4();
    send_json(&router, Method::POST, &format!("/api/v1/pipeline/{}", lead), None).await;
    send_json(
        &router,
        Method::POST,
        &format!("/api/v1/pipeline/{}/move", lead),
        Some(json!({ "to_stage": "QUALIFICATION", "actor": "maria" })),
    )
    .await;

    let (status, body) = send_json(
        &router,
        Method::GET,
        &format!("/api/v1/pipeline/{}/next-stages", lead),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let targets: Vec<&str> = body.as_array().unwrap().iter().map(|t| t["to"].as_str().unwrap()).collect();
    assert!(targets.contains(&"PRESENTATION"));
    assert!(targets.contains(&"LOST"));
    assert!(!targets.contains(&"WON"));
}
