//! Ledger repository (事件账本数据访问)
//! 只增不改：登录尝试、会话、密码变更、审计日志

use crate::{
    error::AppError,
    models::ledger::*,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct LedgerRepository {
    db: PgPool,
}

impl LedgerRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    // ==================== 写入 ====================

    /// 插入登录尝试
    pub async fn insert_login_attempt(&self, record: &LoginAttempt) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO login_attempts (
                id, email, user_id, tenant_id, ip_address, user_agent, device_info,
                success, failure_reason, attempted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(&record.email)
        .bind(record.user_id)
        .bind(record.tenant_id)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(&record.device_info)
        .bind(record.success)
        .bind(&record.failure_reason)
        .bind(record.attempted_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 插入会话
    pub async fn insert_session(&self, session: &Session) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, tenant_id, ip_address, user_agent, device_info,
                login_at, logout_at, expires_at, is_active, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(session.tenant_id)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(&session.device_info)
        .bind(session.login_at)
        .bind(session.logout_at)
        .bind(session.expires_at)
        .bind(session.is_active)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 插入密码变更记录
    pub async fn insert_password_change(
        &self,
        record: &PasswordChangeRecord,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO password_changes (
                id, user_id, tenant_id, changed_by, change_type, ip_address,
                user_agent, device_info, changed_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.tenant_id)
        .bind(record.changed_by)
        .bind(record.change_type)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(&record.device_info)
        .bind(record.changed_at)
        .bind(&record.metadata)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 插入审计日志条目
    pub async fn insert_audit_entry(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log_entries (
                id, action, resource_type, resource_id, user_id, tenant_id,
                severity, tags, ip_address, user_agent, request_id, details, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.action)
        .bind(&entry.resource_type)
        .bind(entry.resource_id)
        .bind(entry.user_id)
        .bind(entry.tenant_id)
        .bind(entry.severity)
        .bind(&entry.tags)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(&entry.request_id)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    // ==================== 查询 ====================

    /// 查询登录尝试（默认最新在前）
    pub async fn query_login_attempts(
        &self,
        filters: &LoginAttemptFilters,
        page: Pagination,
    ) -> Result<Vec<LoginAttempt>, AppError> {
        let mut query = String::from("SELECT * FROM login_attempts WHERE 1=1");
        let mut index = 0;

        if filters.tenant_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND tenant_id = ${}", index));
        }
        if filters.user_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND user_id = ${}", index));
        }
        if filters.email.is_some() {
            index += 1;
            query.push_str(&format!(" AND email = ${}", index));
        }
        if filters.success.is_some() {
            index += 1;
            query.push_str(&format!(" AND success = ${}", index));
        }
        if filters.from.is_some() {
            index += 1;
            query.push_str(&format!(" AND attempted_at >= ${}", index));
        }
        if filters.to.is_some() {
            index += 1;
            query.push_str(&format!(" AND attempted_at <= ${}", index));
        }

        query.push_str(&format!(
            " ORDER BY attempted_at DESC LIMIT ${} OFFSET ${}",
            index + 1,
            index + 2
        ));

        let mut query_builder = sqlx::query_as::<_, LoginAttempt>(&query);

        if let Some(tenant_id) = filters.tenant_id {
            query_builder = query_builder.bind(tenant_id);
        }
        if let Some(user_id) = filters.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(email) = &filters.email {
            query_builder = query_builder.bind(email);
        }
        if let Some(success) = filters.success {
            query_builder = query_builder.bind(success);
        }
        if let Some(from) = filters.from {
            query_builder = query_builder.bind(from);
        }
        if let Some(to) = filters.to {
            query_builder = query_builder.bind(to);
        }

        let attempts = query_builder
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.db)
            .await?;

        Ok(attempts)
    }

    /// 查询会话
    pub async fn query_sessions(
        &self,
        filters: &SessionFilters,
        page: Pagination,
    ) -> Result<Vec<Session>, AppError> {
        let mut query = String::from("SELECT * FROM sessions WHERE 1=1");
        let mut index = 0;

        if filters.tenant_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND tenant_id = ${}", index));
        }
        if filters.user_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND user_id = ${}", index));
        }
        if filters.is_active.is_some() {
            index += 1;
            query.push_str(&format!(" AND is_active = ${}", index));
        }
        if filters.from.is_some() {
            index += 1;
            query.push_str(&format!(" AND login_at >= ${}", index));
        }
        if filters.to.is_some() {
            index += 1;
            query.push_str(&format!(" AND login_at <= ${}", index));
        }

        query.push_str(&format!(
            " ORDER BY login_at DESC LIMIT ${} OFFSET ${}",
            index + 1,
            index + 2
        ));

        let mut query_builder = sqlx::query_as::<_, Session>(&query);

        if let Some(tenant_id) = filters.tenant_id {
            query_builder = query_builder.bind(tenant_id);
        }
        if let Some(user_id) = filters.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(is_active) = filters.is_active {
            query_builder = query_builder.bind(is_active);
        }
        if let Some(from) = filters.from {
            query_builder = query_builder.bind(from);
        }
        if let Some(to) = filters.to {
            query_builder = query_builder.bind(to);
        }

        let sessions = query_builder
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.db)
            .await?;

        Ok(sessions)
    }

    /// 查询密码变更历史
    pub async fn query_password_changes(
        &self,
        filters: &PasswordChangeFilters,
        page: Pagination,
    ) -> Result<Vec<PasswordChangeRecord>, AppError> {
        let mut query = String::from("SELECT * FROM password_changes WHERE 1=1");
        let mut index = 0;

        if filters.tenant_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND tenant_id = ${}", index));
        }
        if filters.user_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND user_id = ${}", index));
        }
        if filters.change_type.is_some() {
            index += 1;
            query.push_str(&format!(" AND change_type = ${}", index));
        }
        if filters.from.is_some() {
            index += 1;
            query.push_str(&format!(" AND changed_at >= ${}", index));
        }
        if filters.to.is_some() {
            index += 1;
            query.push_str(&format!(" AND changed_at <= ${}", index));
        }

        query.push_str(&format!(
            " ORDER BY changed_at DESC LIMIT ${} OFFSET ${}",
            index + 1,
            index + 2
        ));

        let mut query_builder = sqlx::query_as::<_, PasswordChangeRecord>(&query);

        if let Some(tenant_id) = filters.tenant_id {
            query_builder = query_builder.bind(tenant_id);
        }
        if let Some(user_id) = filters.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(change_type) = filters.change_type {
            query_builder = query_builder.bind(change_type);
        }
        if let Some(from) = filters.from {
            query_builder = query_builder.bind(from);
        }
        if let Some(to) = filters.to {
            query_builder = query_builder.bind(to);
        }

        let records = query_builder
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.db)
            .await?;

        Ok(records)
    }

    /// 查询审计日志（最新优先）
    pub async fn query_audit_entries(
        &self,
        filters: &AuditLogFilters,
        page: Pagination,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        self.query_audit_entries_ordered(filters, page, false).await
    }

    /// 导出用的审计日志查询：时间升序、稳定次序键，保证逐页导出可复现
    pub async fn export_audit_entries(
        &self,
        filters: &AuditLogFilters,
        page: Pagination,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        self.query_audit_entries_ordered(filters, page, true).await
    }

    async fn query_audit_entries_ordered(
        &self,
        filters: &AuditLogFilters,
        page: Pagination,
        ascending: bool,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        let mut query = String::from("SELECT * FROM audit_log_entries WHERE 1=1");
        let mut index = 0;

        if filters.tenant_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND tenant_id = ${}", index));
        }
        if filters.user_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND user_id = ${}", index));
        }
        if filters.action.is_some() {
            index += 1;
            query.push_str(&format!(" AND action = ${}", index));
        }
        if filters.severity.is_some() {
            index += 1;
            query.push_str(&format!(" AND severity = ${}", index));
        }
        if filters.tag.is_some() {
            index += 1;
            query.push_str(&format!(" AND ${} = ANY(tags)", index));
        }
        if filters.from.is_some() {
            index += 1;
            query.push_str(&format!(" AND created_at >= ${}", index));
        }
        if filters.to.is_some() {
            index += 1;
            query.push_str(&format!(" AND created_at <= ${}", index));
        }

        let order = if ascending {
            "created_at ASC, id ASC"
        } else {
            "created_at DESC"
        };
        query.push_str(&format!(
            " ORDER BY {} LIMIT ${} OFFSET ${}",
            order,
            index + 1,
            index + 2
        ));

        let mut query_builder = sqlx::query_as::<_, AuditLogEntry>(&query);

        if let Some(tenant_id) = filters.tenant_id {
            query_builder = query_builder.bind(tenant_id);
        }
        if let Some(user_id) = filters.user_id {
            query_builder = query_builder.bind(user_id);
        }
        if let Some(action) = &filters.action {
            query_builder = query_builder.bind(action);
        }
        if let Some(severity) = filters.severity {
            query_builder = query_builder.bind(severity);
        }
        if let Some(tag) = &filters.tag {
            query_builder = query_builder.bind(tag);
        }
        if let Some(from) = filters.from {
            query_builder = query_builder.bind(from);
        }
        if let Some(to) = filters.to {
            query_builder = query_builder.bind(to);
        }

        let entries = query_builder
            .bind(page.limit)
            .bind(page.offset)
            .fetch_all(&self.db)
            .await?;

        Ok(entries)
    }

    // ==================== 检测窗口加载 ====================
    // 升序、带稳定次序键，保证同一快照的重复扫描产出相同输入

    /// 窗口内的登录尝试（按时间升序）
    pub async fn login_attempts_in_window(
        &self,
        tenant_id: Option<Uuid>,
        user_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LoginAttempt>, AppError> {
        let attempts = sqlx::query_as::<_, LoginAttempt>(
            r#"
            SELECT * FROM login_attempts
            WHERE attempted_at >= $1 AND attempted_at <= $2
              AND ($3::uuid IS NULL OR tenant_id = $3)
              AND ($4::uuid IS NULL OR user_id = $4)
            ORDER BY attempted_at ASC, id ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(attempts)
    }

    /// 窗口内的会话（按登录时间升序）
    pub async fn sessions_in_window(
        &self,
        tenant_id: Option<Uuid>,
        user_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Session>, AppError> {
        let sessions = sqlx::query_as::<_, Session>(
            r#"
            SELECT * FROM sessions
            WHERE login_at >= $1 AND login_at <= $2
              AND ($3::uuid IS NULL OR tenant_id = $3)
              AND ($4::uuid IS NULL OR user_id = $4)
            ORDER BY login_at ASC, id ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(sessions)
    }

    /// 窗口内的审计日志（按创建时间升序）
    pub async fn audit_entries_in_window(
        &self,
        tenant_id: Option<Uuid>,
        user_id: Option<Uuid>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AuditLogEntry>, AppError> {
        let entries = sqlx::query_as::<_, AuditLogEntry>(
            r#"
            SELECT * FROM audit_log_entries
            WHERE created_at >= $1 AND created_at <= $2
              AND ($3::uuid IS NULL OR tenant_id = $3)
              AND ($4::uuid IS NULL OR user_id = $4)
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(from)
        .bind(to)
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }

    // ==================== 证据解析 ====================

    /// 按种类检查账本记录是否存在
    pub async fn record_exists(&self, table: LedgerTable, id: Uuid) -> Result<bool, AppError> {
        let query = match table {
            LedgerTable::LoginAttempts => {
                "SELECT EXISTS(SELECT 1 FROM login_attempts WHERE id = $1)"
            }
            LedgerTable::Sessions => "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = $1)",
            LedgerTable::PasswordChanges => {
                "SELECT EXISTS(SELECT 1 FROM password_changes WHERE id = $1)"
            }
            LedgerTable::AuditLogEntries => {
                "SELECT EXISTS(SELECT 1 FROM audit_log_entries WHERE id = $1)"
            }
        };

        let exists: bool = sqlx::query(query)
            .bind(id)
            .fetch_one(&self.db)
            .await?
            .get(0);

        Ok(exists)
    }

    /// 按 id 取回单条记录的 JSON 表示（导出时实时解析证据用）
    pub async fn fetch_record_json(
        &self,
        table: LedgerTable,
        id: Uuid,
    ) -> Result<Option<serde_json::Value>, AppError> {
        let record = match table {
            LedgerTable::LoginAttempts => sqlx::query_as::<_, LoginAttempt>(
                "SELECT * FROM login_attempts WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(|r| serde_json::to_value(r).unwrap_or_default()),
            LedgerTable::Sessions => {
                sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.db)
                    .await?
                    .map(|r| serde_json::to_value(r).unwrap_or_default())
            }
            LedgerTable::PasswordChanges => sqlx::query_as::<_, PasswordChangeRecord>(
                "SELECT * FROM password_changes WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(|r| serde_json::to_value(r).unwrap_or_default()),
            LedgerTable::AuditLogEntries => sqlx::query_as::<_, AuditLogEntry>(
                "SELECT * FROM audit_log_entries WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .map(|r| serde_json::to_value(r).unwrap_or_default()),
        };

        Ok(record)
    }
}

/// 账本表种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerTable {
    LoginAttempts,
    Sessions,
    PasswordChanges,
    AuditLogEntries,
}
