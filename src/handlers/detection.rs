//! 异常检测的 HTTP 处理器

use crate::{
    auth::AuthContext, error::AppError, middleware::AppState, models::finding::DetectionWindow,
};
use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

/// 按需扫描一段账本窗口
/// 结果即算即走，不落库；同一快照重跑得到相同结论
pub async fn scan(
    State(state): State<Arc<AppState>>,
    auth_context: AuthContext,
    Json(window): Json<DetectionWindow>,
) -> Result<impl IntoResponse, AppError> {
    let report = state.detection_service.detect(&auth_context, window).await?;

    Ok(Json(report))
}
