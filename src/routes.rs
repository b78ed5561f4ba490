//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

use crate::{
    auth::JwtService,
    config::AppConfig,
    error::AppError,
    handlers,
    middleware::AppState,
    services::{CaseService, DetectionService, ExportService, LedgerService, SessionService},
};

/// 创建应用路由
pub fn create_router(config: AppConfig, db: sqlx::PgPool) -> Result<Router, AppError> {
    let jwt_service = Arc::new(JwtService::from_config(&config)?);

    let ledger_service = Arc::new(LedgerService::new(db.clone()));
    let session_service = Arc::new(SessionService::new(db.clone(), ledger_service.clone()));
    let detection_service = Arc::new(DetectionService::new(db.clone(), config.detection.clone()));
    let case_service = Arc::new(CaseService::new(
        db.clone(),
        config.case.clone(),
        ledger_service.clone(),
    ));
    let export_service = Arc::new(ExportService::new(
        db.clone(),
        config.export.clone(),
        case_service.clone(),
        ledger_service.clone(),
    ));

    let state = Arc::new(AppState {
        config,
        db,
        ledger_service,
        session_service,
        detection_service,
        case_service,
        export_service,
        jwt_service: jwt_service.clone(),
    });

    // 公开端点（健康检查与指标）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics_export));

    // 需要认证的路由
    let authenticated_routes = Router::new()
        // 身份层写入（平台令牌）
        .route(
            "/api/v1/events/login-attempts",
            post(handlers::ingest::record_login_attempt),
        )
        .route(
            "/api/v1/events/sessions",
            post(handlers::ingest::record_session),
        )
        .route(
            "/api/v1/events/sessions/{id}/end",
            post(handlers::ingest::end_session),
        )
        .route(
            "/api/v1/events/password-changes",
            post(handlers::ingest::record_password_change),
        )
        // 账本查询
        .route(
            "/api/v1/ledger/login-attempts",
            get(handlers::ledger::list_login_attempts),
        )
        .route(
            "/api/v1/ledger/sessions",
            get(handlers::ledger::list_sessions),
        )
        .route(
            "/api/v1/ledger/password-changes",
            get(handlers::ledger::list_password_changes),
        )
        .route(
            "/api/v1/ledger/audit-logs",
            get(handlers::ledger::list_audit_logs),
        )
        .route(
            "/api/v1/ledger/export",
            get(handlers::ledger::export_audit_logs),
        )
        // 会话登记簿
        .route(
            "/api/v1/sessions/active",
            get(handlers::session::list_active_sessions),
        )
        .route(
            "/api/v1/sessions/{id}/revoke",
            post(handlers::session::revoke_session),
        )
        .route(
            "/api/v1/sessions/revoke-all",
            post(handlers::session::revoke_all_sessions),
        )
        // 异常检测
        .route("/api/v1/detection/scan", post(handlers::detection::scan))
        // 调查案件
        .route(
            "/api/v1/cases",
            get(handlers::case::list_cases).post(handlers::case::create_case),
        )
        .route("/api/v1/cases/{id}", get(handlers::case::get_case))
        .route(
            "/api/v1/cases/{id}/status",
            put(handlers::case::update_case_status),
        )
        .route(
            "/api/v1/cases/{id}/notes",
            post(handlers::case::add_case_note),
        )
        .route(
            "/api/v1/cases/{id}/evidence",
            post(handlers::case::add_case_evidence),
        )
        .route(
            "/api/v1/cases/{id}/export",
            get(handlers::case::export_case),
        )
        .layer(axum::middleware::from_fn_with_state(
            jwt_service,
            crate::auth::middleware::jwt_auth_middleware,
        ));

    let router = public_routes
        .merge(authenticated_routes)
        .layer(axum::middleware::from_fn(
            crate::middleware::request_tracking_middleware,
        ))
        .with_state(state);

    Ok(router)
}
