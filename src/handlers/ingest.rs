//! 身份层写入端点
//! 登录尝试、会话、密码变更由外部身份层上报，要求平台级令牌

use crate::{
    auth::AuthContext,
    error::AppError,
    middleware::{client_ip, AppState},
    models::ledger::{NewLoginAttempt, NewPasswordChange, NewSession, SessionEnd},
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// 上报一次登录尝试
pub async fn record_login_attempt(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    headers: HeaderMap,
    Json(mut req): Json<NewLoginAttempt>,
) -> Result<impl IntoResponse, AppError> {
    auth_context.require_platform_scope()?;

    if req.ip_address.is_none() {
        req.ip_address = client_ip(&headers, state.config.security.trust_proxy);
    }

    let record = state.ledger_service.append_login_attempt(req).await?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// 上报新会话（成功登录后）
pub async fn record_session(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    headers: HeaderMap,
    Json(mut req): Json<NewSession>,
) -> Result<impl IntoResponse, AppError> {
    auth_context.require_platform_scope()?;

    if req.ip_address.is_none() {
        req.ip_address = client_ip(&headers, state.config.security.trust_proxy);
    }

    let session = state.ledger_service.append_session(req).await?;

    Ok((StatusCode::CREATED, Json(session)))
}

/// 上报会话结束（登出或过期）
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<SessionEnd>,
) -> Result<impl IntoResponse, AppError> {
    auth_context.require_platform_scope()?;

    state
        .session_service
        .end_session(id, req.reason.as_deref())
        .await?;

    Ok(Json(json!({ "session_id": id, "ended": true })))
}

/// 上报一次密码变更
pub async fn record_password_change(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    headers: HeaderMap,
    Json(mut req): Json<NewPasswordChange>,
) -> Result<impl IntoResponse, AppError> {
    auth_context.require_platform_scope()?;

    if req.ip_address.is_none() {
        req.ip_address = client_ip(&headers, state.config.security.trust_proxy);
    }

    let record = state.ledger_service.append_password_change(req).await?;

    Ok((StatusCode::CREATED, Json(record)))
}
