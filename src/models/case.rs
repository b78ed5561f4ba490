//! 调查案件领域模型
//! 案件状态机、案件备注与证据链接

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// 案件状态
/// open -> investigating -> resolved -> closed，closed 为终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "case_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Open,
    Investigating,
    Resolved,
    Closed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Open => "open",
            CaseStatus::Investigating => "investigating",
            CaseStatus::Resolved => "resolved",
            CaseStatus::Closed => "closed",
        }
    }

    /// 状态转换表
    /// closed 不接受任何转换；resolved 可回退 investigating 重开；
    /// investigating 可回退 open 重新指派
    pub fn can_transition_to(&self, to: CaseStatus) -> bool {
        use CaseStatus::*;
        matches!(
            (self, to),
            (Open, Investigating)
                | (Investigating, Resolved)
                | (Resolved, Closed)
                | (Investigating, Open)
                | (Resolved, Investigating)
        )
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 案件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "case_priority", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CasePriority {
    Low,
    Medium,
    High,
    Critical,
}

/// 案件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "case_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CaseType {
    Anomaly,
    Security,
    Compliance,
    Abuse,
    Other,
}

/// 备注类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "note_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NoteType {
    Note,
    Finding,
    Evidence,
    Action,
}

/// 证据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "evidence_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    AuditLog,
    Session,
    LoginAttempt,
    PasswordChange,
    File,
    Other,
}

impl EvidenceType {
    /// 可在账本中解析的证据类型；file/other 只做弱链接
    pub fn resolves_against_ledger(&self) -> bool {
        !matches!(self, EvidenceType::File | EvidenceType::Other)
    }
}

/// 调查案件，只能通过状态转换修改
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InvestigationCase {
    pub id: Uuid,
    /// 创建时生成，永不复用
    pub case_number: String,
    pub title: String,
    pub description: Option<String>,
    pub status: CaseStatus,
    pub priority: CasePriority,
    pub case_type: CaseType,
    pub related_user_id: Option<Uuid>,
    pub related_tenant_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    pub created_by: Uuid,
    pub resolved_by: Option<Uuid>,
    pub opened_at: DateTime<Utc>,
    pub investigated_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// 案件备注，只增不改不删
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CaseNote {
    pub id: Uuid,
    pub case_id: Uuid,
    pub note: String,
    pub note_type: NoteType,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// 案件证据，指向账本/文件存储的弱引用，不拥有被引用记录的生命周期
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CaseEvidence {
    pub id: Uuid,
    pub case_id: Uuid,
    pub evidence_type: EvidenceType,
    pub evidence_id: Uuid,
    pub evidence_source: Option<String>,
    pub description: Option<String>,
    pub added_by: Uuid,
    pub added_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// 案件及其子记录
#[derive(Debug, Clone, Serialize)]
pub struct CaseWithChildren {
    #[serde(flatten)]
    pub case: InvestigationCase,
    pub notes: Vec<CaseNote>,
    pub evidence: Vec<CaseEvidence>,
}

// ==================== 请求 DTO ====================

/// 创建案件请求
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CreateCaseRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: Option<String>,
    pub case_type: CaseType,
    pub priority: Option<CasePriority>,
    pub related_user_id: Option<Uuid>,
    pub related_tenant_id: Option<Uuid>,
    pub assigned_to: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// 状态转换请求
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateCaseStatusRequest {
    pub status: CaseStatus,
    pub resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub assigned_to: Option<Uuid>,
}

/// 追加备注请求
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AddNoteRequest {
    #[validate(length(min = 1))]
    pub note: String,
    pub note_type: NoteType,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// 链接证据请求
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddEvidenceRequest {
    pub evidence_type: EvidenceType,
    pub evidence_id: Uuid,
    pub evidence_source: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// 案件查询过滤器（封闭结构，未知键拒绝）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaseFilters {
    pub status: Option<CaseStatus>,
    pub priority: Option<CasePriority>,
    pub case_type: Option<CaseType>,
    pub assigned_to: Option<Uuid>,
    pub related_tenant_id: Option<Uuid>,
    pub tag: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}
