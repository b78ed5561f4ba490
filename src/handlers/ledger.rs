//! 账本查询与导出的 HTTP 处理器

use crate::{
    auth::AuthContext,
    error::AppError,
    middleware::AppState,
    models::ledger::*,
    services::ExportFormat,
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

fn default_limit() -> i64 {
    50
}

// 查询 DTO 都是封闭结构：过滤键打错直接报 400，不静默忽略

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginAttemptQuery {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub success: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionQuery {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub is_active: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PasswordChangeQuery {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub change_type: Option<PasswordChangeType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditLogQuery {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: Option<String>,
    pub severity: Option<AuditSeverity>,
    pub tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl AuditLogQuery {
    fn split(self) -> (AuditLogFilters, Pagination) {
        (
            AuditLogFilters {
                tenant_id: self.tenant_id,
                user_id: self.user_id,
                action: self.action,
                severity: self.severity,
                tag: self.tag,
                from: self.from,
                to: self.to,
            },
            Pagination::clamped(self.limit, self.offset),
        )
    }
}

/// 查询登录尝试历史
pub async fn list_login_attempts(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Query(query): Query<LoginAttemptQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filters = LoginAttemptFilters {
        tenant_id: query.tenant_id,
        user_id: query.user_id,
        email: query.email,
        success: query.success,
        from: query.from,
        to: query.to,
    };
    let page = Pagination::clamped(query.limit, query.offset);

    let attempts = state
        .ledger_service
        .query_login_attempts(&auth_context, filters, page)
        .await?;

    Ok(Json(json!({
        "login_attempts": attempts,
        "count": attempts.len()
    })))
}

/// 查询会话历史
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Query(query): Query<SessionQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filters = SessionFilters {
        tenant_id: query.tenant_id,
        user_id: query.user_id,
        is_active: query.is_active,
        from: query.from,
        to: query.to,
    };
    let page = Pagination::clamped(query.limit, query.offset);

    let sessions = state
        .ledger_service
        .query_sessions(&auth_context, filters, page)
        .await?;

    Ok(Json(json!({
        "sessions": sessions,
        "count": sessions.len()
    })))
}

/// 查询密码变更历史
pub async fn list_password_changes(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Query(query): Query<PasswordChangeQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filters = PasswordChangeFilters {
        tenant_id: query.tenant_id,
        user_id: query.user_id,
        change_type: query.change_type,
        from: query.from,
        to: query.to,
    };
    let page = Pagination::clamped(query.limit, query.offset);

    let changes = state
        .ledger_service
        .query_password_changes(&auth_context, filters, page)
        .await?;

    Ok(Json(json!({
        "password_changes": changes,
        "count": changes.len()
    })))
}

/// 查询审计日志
pub async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Query(query): Query<AuditLogQuery>,
) -> Result<impl IntoResponse, AppError> {
    let (filters, page) = query.split();

    let entries = state
        .ledger_service
        .query_audit_entries(&auth_context, filters, page)
        .await?;

    Ok(Json(json!({
        "audit_logs": entries,
        "count": entries.len()
    })))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerExportQuery {
    pub format: ExportFormat,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: Option<String>,
    pub severity: Option<AuditSeverity>,
    pub tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 流式导出审计账本区段
/// 响应体逐页生成；客户端断开即停止生产
pub async fn export_audit_logs(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Query(query): Query<LedgerExportQuery>,
) -> Result<Response, AppError> {
    let format = query.format;
    if format == ExportFormat::Pdf {
        return Err(AppError::validation(
            "pdf export is only supported for case audit trails",
        ));
    }

    let filters = AuditLogFilters {
        tenant_id: query.tenant_id,
        user_id: query.user_id,
        action: query.action,
        severity: query.severity,
        tag: query.tag,
        from: query.from,
        to: query.to,
    };

    // 提前解析租户，授权错误要在流开始前返回
    auth_context.effective_tenant(filters.tenant_id)?;

    let (tx, rx) = mpsc::channel(16);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let export_service = state.export_service.clone();
    tokio::spawn(async move {
        if let Err(e) = export_service
            .stream_audit_entries(&auth_context, filters, format, tx, cancel_rx)
            .await
        {
            tracing::warn!(error = %e, "Ledger export stream terminated");
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx));

    Response::builder()
        .header(header::CONTENT_TYPE, format.content_type())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"audit-ledger.{}\"", format.extension()),
        )
        .body(body)
        .map_err(|e| AppError::internal(&format!("response build failed: {}", e)))
}
