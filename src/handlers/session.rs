//! 会话登记簿的 HTTP 处理器

use crate::{
    auth::AuthContext, error::AppError, middleware::AppState, models::ledger::SessionFilters,
};
use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActiveSessionQuery {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

/// 列出活跃会话
pub async fn list_active_sessions(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Query(query): Query<ActiveSessionQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filters = SessionFilters {
        tenant_id: query.tenant_id,
        user_id: query.user_id,
        is_active: Some(true),
        from: None,
        to: None,
    };

    let sessions = state
        .session_service
        .list_active_sessions(&auth_context, filters)
        .await?;

    Ok(Json(json!({
        "sessions": sessions,
        "count": sessions.len()
    })))
}

/// 吊销单个会话（幂等）
pub async fn revoke_session(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.session_service.revoke(&auth_context, id).await?;

    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RevokeAllRequest {
    pub user_id: Uuid,
    pub except_session_id: Option<Uuid>,
}

/// 批量吊销某用户的全部活跃会话
pub async fn revoke_all_sessions(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<RevokeAllRequest>,
) -> Result<impl IntoResponse, AppError> {
    auth_context.require_platform_scope()?;

    let count = state
        .session_service
        .revoke_all(&auth_context, req.user_id, req.except_session_id)
        .await?;

    Ok(Json(json!({
        "user_id": req.user_id,
        "revoked": count
    })))
}
