//! 事件账本服务
//! 只增写入、租户隔离的查询，以及子系统自身的审计落账

use crate::{
    auth::AuthContext,
    error::AppError,
    models::ledger::*,
    repository::ledger_repo::LedgerRepository,
};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

/// 子系统自身写入账本的操作类型
#[derive(Debug, Clone, Copy)]
pub enum TrustAction {
    CaseCreate,
    CaseStatusChange,
    CaseNoteAdd,
    CaseEvidenceAdd,
    CaseExport,
    SessionRevoke,
    SessionRevokeAll,
    LedgerExport,
}

impl TrustAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustAction::CaseCreate => "case.create",
            TrustAction::CaseStatusChange => "case.status_change",
            TrustAction::CaseNoteAdd => "case.note_add",
            TrustAction::CaseEvidenceAdd => "case.evidence_add",
            TrustAction::CaseExport => "case.export",
            TrustAction::SessionRevoke => "session.revoke",
            TrustAction::SessionRevokeAll => "session.revoke_all",
            TrustAction::LedgerExport => "ledger.export",
        }
    }
}

pub struct LedgerService {
    db: PgPool,
}

impl LedgerService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    // ==================== 身份层写入 ====================

    /// 记录一次登录尝试（成功或失败）
    #[instrument(skip(self, req))]
    pub async fn append_login_attempt(&self, req: NewLoginAttempt) -> Result<LoginAttempt, AppError> {
        req.validate()?;

        let record = LoginAttempt {
            id: Uuid::new_v4(),
            email: req.email,
            user_id: req.user_id,
            tenant_id: req.tenant_id,
            ip_address: req.ip_address,
            user_agent: req.user_agent,
            device_info: req.device_info,
            success: req.success,
            failure_reason: req.failure_reason,
            attempted_at: req.attempted_at.unwrap_or_else(chrono::Utc::now),
        };

        let repo = LedgerRepository::new(self.db.clone());
        repo.insert_login_attempt(&record).await?;

        metrics::counter!("ledger.login_attempts.appended").increment(1);
        Ok(record)
    }

    /// 记录一个新会话（成功登录后由身份层上报）
    #[instrument(skip(self, req))]
    pub async fn append_session(&self, req: NewSession) -> Result<Session, AppError> {
        req.validate()?;

        let now = chrono::Utc::now();
        let login_at = req.login_at.unwrap_or(now);

        if req.expires_at <= login_at {
            return Err(AppError::validation("expires_at must be after login_at"));
        }

        let session = Session {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            tenant_id: req.tenant_id,
            ip_address: req.ip_address,
            user_agent: req.user_agent,
            device_info: req.device_info,
            login_at,
            logout_at: None,
            expires_at: req.expires_at,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let repo = LedgerRepository::new(self.db.clone());
        repo.insert_session(&session).await?;

        metrics::counter!("ledger.sessions.appended").increment(1);
        Ok(session)
    }

    /// 记录一次密码变更
    #[instrument(skip(self, req))]
    pub async fn append_password_change(
        &self,
        req: NewPasswordChange,
    ) -> Result<PasswordChangeRecord, AppError> {
        let record = PasswordChangeRecord {
            id: Uuid::new_v4(),
            user_id: req.user_id,
            tenant_id: req.tenant_id,
            changed_by: req.changed_by,
            change_type: req.change_type,
            ip_address: req.ip_address,
            user_agent: req.user_agent,
            device_info: req.device_info,
            changed_at: req.changed_at.unwrap_or_else(chrono::Utc::now),
            metadata: req.metadata,
        };

        let repo = LedgerRepository::new(self.db.clone());
        repo.insert_password_change(&record).await?;

        metrics::counter!("ledger.password_changes.appended").increment(1);
        Ok(record)
    }

    /// 写入审计日志条目
    pub async fn append_audit_entry(&self, entry: AuditLogEntry) -> Result<(), AppError> {
        if entry.action.is_empty() {
            return Err(AppError::validation("audit action must not be empty"));
        }

        let repo = LedgerRepository::new(self.db.clone());
        repo.insert_audit_entry(&entry).await?;
        Ok(())
    }

    /// 记录子系统自身的操作审计
    /// 尽力而为的旁路：失败只记日志，绝不影响主操作的结果
    pub async fn record_action(
        &self,
        action: TrustAction,
        caller: &AuthContext,
        resource_type: &str,
        resource_id: Option<Uuid>,
        details: Option<serde_json::Value>,
    ) {
        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            action: action.as_str().to_string(),
            resource_type: Some(resource_type.to_string()),
            resource_id,
            user_id: Some(caller.user_id),
            tenant_id: caller.tenant_id,
            severity: AuditSeverity::Info,
            tags: vec!["trust".to_string()],
            ip_address: None,
            user_agent: None,
            request_id: None,
            details,
            created_at: chrono::Utc::now(),
        };

        if let Err(e) = self.append_audit_entry(entry).await {
            tracing::warn!(
                action = action.as_str(),
                error = %e,
                "Failed to record trust audit entry"
            );
        }
    }

    // ==================== 租户隔离的查询 ====================
    // 生效租户在这里解析，过滤器里调用方传入的 tenant_id 不被信任

    /// 查询登录尝试
    #[instrument(skip(self, caller, filters))]
    pub async fn query_login_attempts(
        &self,
        caller: &AuthContext,
        mut filters: LoginAttemptFilters,
        page: Pagination,
    ) -> Result<Vec<LoginAttempt>, AppError> {
        filters.tenant_id = caller.effective_tenant(filters.tenant_id)?;

        let repo = LedgerRepository::new(self.db.clone());
        repo.query_login_attempts(&filters, page).await
    }

    /// 查询会话历史
    #[instrument(skip(self, caller, filters))]
    pub async fn query_sessions(
        &self,
        caller: &AuthContext,
        mut filters: SessionFilters,
        page: Pagination,
    ) -> Result<Vec<Session>, AppError> {
        filters.tenant_id = caller.effective_tenant(filters.tenant_id)?;

        let repo = LedgerRepository::new(self.db.clone());
        repo.query_sessions(&filters, page).await
    }

    /// 导出用的审计日志分页（时间升序，次序稳定）
    #[instrument(skip(self, caller, filters))]
    pub async fn export_audit_entries(
        &self,
        caller: &AuthContext,
        mut filters: AuditLogFilters,
        page: Pagination,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        filters.tenant_id = caller.effective_tenant(filters.tenant_id)?;

        let repo = LedgerRepository::new(self.db.clone());
        repo.export_audit_entries(&filters, page).await
    }

    /// 查询密码变更历史
    #[instrument(skip(self, caller, filters))]
    pub async fn query_password_changes(
        &self,
        caller: &AuthContext,
        mut filters: PasswordChangeFilters,
        page: Pagination,
    ) -> Result<Vec<PasswordChangeRecord>, AppError> {
        filters.tenant_id = caller.effective_tenant(filters.tenant_id)?;

        let repo = LedgerRepository::new(self.db.clone());
        repo.query_password_changes(&filters, page).await
    }

    /// 查询审计日志
    #[instrument(skip(self, caller, filters))]
    pub async fn query_audit_entries(
        &self,
        caller: &AuthContext,
        mut filters: AuditLogFilters,
        page: Pagination,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        filters.tenant_id = caller.effective_tenant(filters.tenant_id)?;

        let repo = LedgerRepository::new(self.db.clone());
        repo.query_audit_entries(&filters, page).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_action_names() {
        assert_eq!(TrustAction::CaseCreate.as_str(), "case.create");
        assert_eq!(TrustAction::CaseStatusChange.as_str(), "case.status_change");
        assert_eq!(TrustAction::SessionRevoke.as_str(), "session.revoke");
        assert_eq!(TrustAction::SessionRevokeAll.as_str(), "session.revoke_all");
        assert_eq!(TrustAction::LedgerExport.as_str(), "ledger.export");
    }

    #[test]
    fn test_trust_action_dotted_format() {
        let actions = [
            TrustAction::CaseCreate,
            TrustAction::CaseStatusChange,
            TrustAction::CaseNoteAdd,
            TrustAction::CaseEvidenceAdd,
            TrustAction::CaseExport,
            TrustAction::SessionRevoke,
            TrustAction::SessionRevokeAll,
            TrustAction::LedgerExport,
        ];

        for action in actions {
            assert!(action.as_str().contains('.'));
        }
    }
}
