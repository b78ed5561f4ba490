//! 会话注册表服务
//! 活跃会话视图、定点吊销与批量吊销

use crate::{
    auth::AuthContext,
    error::AppError,
    models::ledger::{Session, SessionFilters},
    repository::session_repo::SessionRepository,
    services::ledger_service::{LedgerService, TrustAction},
};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// 吊销结果
#[derive(Debug, Clone, Serialize)]
pub struct RevokeOutcome {
    pub session_id: Uuid,
    /// 本次调用是否实际吊销了会话；已不活跃时为 false（幂等，不是错误）
    pub revoked: bool,
}

pub struct SessionService {
    db: PgPool,
    ledger_service: Arc<LedgerService>,
}

impl SessionService {
    pub fn new(db: PgPool, ledger_service: Arc<LedgerService>) -> Self {
        Self { db, ledger_service }
    }

    /// 列出活跃会话
    /// 读取前先惰性回收已过期的会话（幂等副作用）
    #[instrument(skip(self, caller, filters))]
    pub async fn list_active_sessions(
        &self,
        caller: &AuthContext,
        filters: SessionFilters,
    ) -> Result<Vec<Session>, AppError> {
        let tenant_id = caller.effective_tenant(filters.tenant_id)?;
        let now = chrono::Utc::now();

        let repo = SessionRepository::new(self.db.clone());

        let reconciled = repo.reconcile_expired(now).await?;
        if reconciled > 0 {
            tracing::debug!(reconciled, "Expired sessions reconciled");
        }

        repo.list_active(tenant_id, filters.user_id, now).await
    }

    /// 吊销单个会话
    /// 幂等：已不活跃的会话再次吊销不报错也不重复改写 logout_at；
    /// 不存在的会话返回 NotFound
    #[instrument(skip(self, caller))]
    pub async fn revoke(
        &self,
        caller: &AuthContext,
        session_id: Uuid,
    ) -> Result<RevokeOutcome, AppError> {
        let repo = SessionRepository::new(self.db.clone());

        let session = repo
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("session"))?;

        // 租户调用方只能吊销本租户的会话
        if !caller.is_superuser() && session.tenant_id != caller.tenant_id {
            return Err(AppError::Forbidden);
        }

        let revoked = repo.revoke(session_id, chrono::Utc::now()).await? > 0;

        if revoked {
            info!(session_id = %session_id, "Session revoked");
            self.ledger_service
                .record_action(TrustAction::SessionRevoke, caller, "session", Some(session_id), None)
                .await;
        }

        Ok(RevokeOutcome {
            session_id,
            revoked,
        })
    }

    /// 身份层上报的会话结束（登出/过期）
    /// 与吊销共用同一条只此一次的 true -> false 路径
    #[instrument(skip(self))]
    pub async fn end_session(&self, session_id: Uuid, reason: Option<&str>) -> Result<(), AppError> {
        let repo = SessionRepository::new(self.db.clone());

        repo.find_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::not_found("session"))?;

        let ended = repo.revoke(session_id, chrono::Utc::now()).await? > 0;
        if ended {
            tracing::debug!(session_id = %session_id, reason = reason.unwrap_or("logout"), "Session ended");
        }

        Ok(())
    }

    /// 批量吊销某用户的全部活跃会话，可保留一个（通常是调用方自己的会话）
    /// 单条语句基于吊销时刻的快照；之后新建的会话不在本次范围内
    #[instrument(skip(self, caller))]
    pub async fn revoke_all(
        &self,
        caller: &AuthContext,
        user_id: Uuid,
        except_session_id: Option<Uuid>,
    ) -> Result<u64, AppError> {
        let repo = SessionRepository::new(self.db.clone());
        let count = repo
            .revoke_all(user_id, except_session_id, chrono::Utc::now())
            .await?;

        info!(user_id = %user_id, count, "Bulk session revoke");

        self.ledger_service
            .record_action(
                TrustAction::SessionRevokeAll,
                caller,
                "session",
                None,
                Some(serde_json::json!({
                    "user_id": user_id,
                    "revoked": count,
                    "except": except_session_id,
                })),
            )
            .await;

        metrics::counter!("sessions.revoked").increment(count);
        Ok(count)
    }
}
