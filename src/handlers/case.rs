//! 调查案件的 HTTP 处理器

use crate::{
    auth::AuthContext,
    error::AppError,
    middleware::AppState,
    models::{case::*, ledger::Pagination},
    services::ExportFormat,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseQuery {
    pub status: Option<CaseStatus>,
    pub priority: Option<CasePriority>,
    pub case_type: Option<CaseType>,
    pub assigned_to: Option<Uuid>,
    pub related_tenant_id: Option<Uuid>,
    pub tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

/// 创建案件
pub async fn create_case(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(req): Json<CreateCaseRequest>,
) -> Result<impl IntoResponse, AppError> {
    let case = state.case_service.create(&auth_context, req).await?;

    Ok((StatusCode::CREATED, Json(case)))
}

/// 查询案件列表
pub async fn list_cases(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Query(query): Query<CaseQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filters = CaseFilters {
        status: query.status,
        priority: query.priority,
        case_type: query.case_type,
        assigned_to: query.assigned_to,
        related_tenant_id: query.related_tenant_id,
        tag: query.tag,
        from: query.from,
        to: query.to,
    };

    let page = Pagination::clamped(query.limit, query.offset);
    let cases = state
        .case_service
        .list(&auth_context, filters, page.limit, page.offset)
        .await?;

    Ok(Json(json!({
        "cases": cases,
        "count": cases.len()
    })))
}

/// 案件详情（含备注与证据）
pub async fn get_case(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let case = state
        .case_service
        .get_with_children(&auth_context, id)
        .await?;

    Ok(Json(case))
}

/// 状态转换
pub async fn update_case_status(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateCaseStatusRequest>,
) -> Result<impl IntoResponse, AppError> {
    let case = state
        .case_service
        .update_status(&auth_context, id, req)
        .await?;

    Ok(Json(case))
}

/// 追加备注
pub async fn add_case_note(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<AddNoteRequest>,
) -> Result<impl IntoResponse, AppError> {
    let note = state.case_service.add_note(&auth_context, id, req).await?;

    Ok((StatusCode::CREATED, Json(note)))
}

/// 链接证据
pub async fn add_case_evidence(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<AddEvidenceRequest>,
) -> Result<impl IntoResponse, AppError> {
    let evidence = state
        .case_service
        .add_evidence(&auth_context, id, req)
        .await?;

    Ok((StatusCode::CREATED, Json(evidence)))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseExportQuery {
    pub format: ExportFormat,
}

/// 导出案件审计链
pub async fn export_case(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Path(id): Path<Uuid>,
    Query(query): Query<CaseExportQuery>,
) -> Result<Response, AppError> {
    let document = state
        .export_service
        .export_case_audit_trail(&auth_context, id, query.format)
        .await?;

    Response::builder()
        .header(header::CONTENT_TYPE, document.content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", document.filename),
        )
        .body(document.bytes.into())
        .map_err(|e| AppError::internal(&format!("response build failed: {}", e)))
}
