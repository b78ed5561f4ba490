//! 事件账本领域模型
//! 登录尝试、会话、密码变更、审计日志，全部只增不改

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// 审计日志严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "audit_severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }
}

/// 密码变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "password_change_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PasswordChangeType {
    /// 用户自助重置
    SelfReset,
    /// 管理员重置
    AdminReset,
    /// 管理员直接修改
    AdminChange,
    /// 策略强制重置
    ForcedReset,
}

/// 登录尝试记录（成功与失败都记录，写入后不可变）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoginAttempt {
    pub id: Uuid,
    pub email: String,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// 会话记录
/// is_active 只允许 true -> false 一次，不允许复活
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: String,
    pub login_at: DateTime<Utc>,
    pub logout_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 密码变更记录（不可变，每次变更一行）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PasswordChangeRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub changed_by: Option<Uuid>,
    pub change_type: PasswordChangeType,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<String>,
    pub changed_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// 审计日志条目，检测器与导出消费的规范记录
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub action: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub severity: AuditSeverity,
    pub tags: Vec<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ==================== 查询过滤器 ====================
// 封闭的按类型过滤器结构体：未知键直接拒绝，不静默忽略

/// 登录尝试查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginAttemptFilters {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub success: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 会话查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionFilters {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub is_active: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 密码变更查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PasswordChangeFilters {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub change_type: Option<PasswordChangeType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 审计日志查询过滤器
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditLogFilters {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action: Option<String>,
    pub severity: Option<AuditSeverity>,
    pub tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 分页参数
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl Pagination {
    pub const MAX_LIMIT: i64 = 500;

    /// 收敛调用方分页参数：limit 限定在 1..=MAX_LIMIT，offset 非负
    /// 越界值截断而不是报错
    pub fn clamped(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset: offset.max(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}

// ==================== 身份层写入 DTO ====================

/// 身份层上报的登录尝试
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct NewLoginAttempt {
    #[validate(email)]
    pub email: String,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    /// 缺省为接收时间
    pub attempted_at: Option<DateTime<Utc>>,
}

/// 身份层上报的新会话
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct NewSession {
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[validate(length(min = 1))]
    pub device_info: String,
    pub login_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// 会话结束原因
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionEnd {
    pub reason: Option<String>,
}

/// 身份层上报的密码变更
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewPasswordChange {
    pub user_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub changed_by: Option<Uuid>,
    pub change_type: PasswordChangeType,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub device_info: Option<String>,
    pub changed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}
