//! Session repository (会话注册表数据访问)
//! 活跃会话视图、吊销与过期回收

use crate::{error::AppError, models::ledger::Session};
use chrono::{DateTime, Utc};
use uuid::Uuid;
use sqlx::PgPool;

pub struct SessionRepository {
    db: PgPool,
}

impl SessionRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 按 id 查找会话
    pub async fn find_by_id(&self, session_id: Uuid) -> Result<Option<Session>, AppError> {
        let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
            .bind(session_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(session)
    }

    /// 列出未过期的活跃会话
    pub async fn list_active(
        &self,
        tenant_id: Option<Uuid>,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE is_active = true AND expires_at > $1
              AND ($2::uuid IS NULL OR tenant_id = $2)
              AND ($3::uuid IS NULL OR user_id = $3)
            ORDER BY login_at DESC
            "#,
        )
        .bind(now)
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(sessions)
    }

    /// 惰性回收：把已过期但仍标记活跃的会话置为不活跃
    /// 幂等，作为读取的副作用执行
    pub async fn reconcile_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET is_active = false, updated_at = $1
            WHERE is_active = true AND expires_at <= $1
            "#,
        )
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// 吊销单个会话，仅在当前活跃时生效
    /// 返回实际吊销的行数（0 表示已经不活跃）
    pub async fn revoke(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET is_active = false, logout_at = $2, updated_at = $2
            WHERE id = $1 AND is_active = true
            "#,
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// 批量吊销某用户的全部活跃会话，可排除一个会话
    /// 单条语句执行，快照之后创建的会话不受影响
    pub async fn revoke_all(
        &self,
        user_id: Uuid,
        except_session_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET is_active = false, logout_at = $3, updated_at = $3
            WHERE user_id = $1 AND is_active = true
              AND ($2::uuid IS NULL OR id <> $2)
            "#,
        )
        .bind(user_id)
        .bind(except_session_id)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}
