//! JWT 认证中间件与调用方范围

use crate::{auth::jwt::JwtService, error::AppError};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use uuid::Uuid;

/// 认证上下文（附加到请求扩展）
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub username: String,
    /// 调用方所属租户；平台账号为 None
    pub tenant_id: Option<Uuid>,
    pub roles: Vec<String>,
}

impl AuthContext {
    /// 是否持有平台范围（超级用户）
    pub fn is_superuser(&self) -> bool {
        self.roles.iter().any(|r| r == "superuser")
    }

    /// 租户隔离边界：在查询层解析生效租户，不信任调用方传入的过滤器
    ///
    /// 超级用户可指定任意租户，None 表示平台全景视图；
    /// 普通调用方无论请求什么都被钉死在自己的租户上，
    /// 没有租户归属的普通调用方直接拒绝。
    pub fn effective_tenant(&self, requested: Option<Uuid>) -> Result<Option<Uuid>, AppError> {
        if self.is_superuser() {
            return Ok(requested);
        }

        match self.tenant_id {
            Some(own) => {
                if let Some(req) = requested {
                    if req != own {
                        tracing::warn!(
                            user_id = %self.user_id,
                            requested_tenant = %req,
                            "Cross-tenant filter rejected, pinned to caller tenant"
                        );
                    }
                }
                Ok(Some(own))
            }
            None => Err(AppError::Forbidden),
        }
    }

    /// 平台范围操作（批量吊销、身份层写入）要求超级用户
    pub fn require_platform_scope(&self) -> Result<(), AppError> {
        if self.is_superuser() {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}

// 实现 FromRequestParts 以便在 handler 中直接提取 AuthContext
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(AppError::Unauthorized)
    }
}

/// 从 Authorization 头提取令牌
pub fn extract_token(headers: &HeaderMap) -> Result<String, AppError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").map(|t| t.to_string()))
        .ok_or(AppError::Unauthorized)
}

/// JWT 认证中间件 - 必须认证
pub async fn jwt_auth_middleware(
    State(jwt_service): State<Arc<JwtService>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    // 从 Authorization 头提取令牌
    let token = extract_token(req.headers())?;

    // 验证令牌
    let claims = jwt_service.validate_access_token(&token)?;

    // 创建认证上下文
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AppError::Unauthorized)?;
    let auth_context = AuthContext {
        user_id,
        username: claims.username,
        tenant_id: claims.tenant_id,
        roles: claims.roles,
    };

    // 附加到请求扩展
    req.extensions_mut().insert(auth_context);

    Ok(next.run(req).await)
}
