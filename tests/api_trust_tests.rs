//! HTTP 端到端测试
//! 需要 TEST_DATABASE_URL 指向可用的 Postgres，因此默认 ignore：
//! cargo test -- --ignored

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;
use trust_system::{auth::JwtService, routes};
use uuid::Uuid;

mod common;
use common::{create_test_config, setup_test_db};

async fn test_app() -> (Router, String) {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let jwt = JwtService::from_config(&config).expect("jwt service");
    let token = jwt
        .generate_access_token(
            &Uuid::new_v4(),
            "platform-admin",
            None,
            vec!["superuser".to_string()],
        )
        .expect("token");

    let app = routes::create_router(config, pool).expect("router");
    (app, token)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
#[ignore]
async fn test_health_endpoint() {
    let (app, _) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
#[ignore]
async fn test_ledger_requires_token() {
    let (app, _) = test_app().await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/ledger/audit-logs")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore]
async fn test_unknown_filter_key_is_rejected() {
    let (app, token) = test_app().await;

    // 过滤键打错直接 400，不静默忽略
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/ledger/audit-logs?tennant_id=abc")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
#[ignore]
async fn test_login_attempt_intake_and_query() {
    let (app, token) = test_app().await;

    let request_body = json!({
        "email": "alice@x.test",
        "success": false,
        "failure_reason": "bad password"
    });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/events/login-attempts")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/ledger/login-attempts?email=alice@x.test")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    assert_eq!(json["login_attempts"][0]["email"], "alice@x.test");
}

#[tokio::test]
#[ignore]
async fn test_case_creation_via_api() {
    let (app, token) = test_app().await;

    let request_body = json!({
        "title": "Suspicious logins",
        "case_type": "security",
        "priority": "high"
    });

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/cases")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["status"], "open");
    assert!(json["case_number"].as_str().unwrap().starts_with("CASE-"));
    assert!(json["investigated_at"].is_null());
    assert!(json["resolved_at"].is_null());
    assert!(json["closed_at"].is_null());

    // 导出 JSON 形态的审计链
    let case_id = json["id"].as_str().unwrap().to_string();
    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/cases/{}/export?format=json", case_id))
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert!(json["generated_at"].is_string());
    assert_eq!(json["status"], "open");
}

#[tokio::test]
#[ignore]
async fn test_detection_scan_endpoint() {
    let (app, token) = test_app().await;

    let request_body = json!({
        "from": "2026-08-15T00:00:00Z",
        "to": "2026-08-15T01:00:00Z"
    });

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/detection/scan")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::from(request_body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["partial"], false);
    assert!(json["findings"].as_array().unwrap().is_empty());
}
