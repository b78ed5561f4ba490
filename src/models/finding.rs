//! 异常检测领域模型
//! Finding 是派生数据：每次扫描重新计算，从不落库

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ledger::{AuditLogEntry, LoginAttempt, Session};

/// 异常类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingType {
    FailedLogins,
    MultipleIps,
    UnusualActivity,
    SuspiciousPattern,
}

impl FindingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FindingType::FailedLogins => "failed_logins",
            FindingType::MultipleIps => "multiple_ips",
            FindingType::UnusualActivity => "unusual_activity",
            FindingType::SuspiciousPattern => "suspicious_pattern",
        }
    }
}

/// 异常严重级别，按溢出比例分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FindingSeverity {
    /// 按实际值相对阈值的溢出比例分级
    /// < 2x 低，< 4x 中，< 8x 高，否则严重
    pub fn from_overflow_ratio(ratio: f64) -> Self {
        if ratio < 2.0 {
            FindingSeverity::Low
        } else if ratio < 4.0 {
            FindingSeverity::Medium
        } else if ratio < 8.0 {
            FindingSeverity::High
        } else {
            FindingSeverity::Critical
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FindingSeverity::Low => "low",
            FindingSeverity::Medium => "medium",
            FindingSeverity::High => "high",
            FindingSeverity::Critical => "critical",
        }
    }
}

/// 支撑异常结论的证据引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingEvidence {
    /// 记录种类: login_attempt / session / audit_log
    pub kind: String,
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub details: String,
}

/// 检测产出的异常信号（派生，不持久化）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyFinding {
    pub finding_type: FindingType,
    pub severity: FindingSeverity,
    pub description: String,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub evidence: Vec<FindingEvidence>,
    /// 等于检测窗口的结束时间，保证重复扫描产出一致
    pub detected_at: DateTime<Utc>,
}

/// 检测窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionWindow {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

/// 检测的账本输入快照
/// 某一种记录加载失败时对应字段为 None，由调用方标记 partial
#[derive(Debug, Default)]
pub struct LedgerWindow {
    pub login_attempts: Option<Vec<LoginAttempt>>,
    pub sessions: Option<Vec<Session>>,
    pub audit_entries: Option<Vec<AuditLogEntry>>,
    /// 窗口之前的基线审计条目（unusual_activity 用）
    pub baseline_entries: Option<Vec<AuditLogEntry>>,
}

/// 一次扫描的结果
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub findings: Vec<AnomalyFinding>,
    /// 账本窗口部分不可用时为 true，结果仅覆盖可用数据
    pub partial: bool,
    pub window_from: DateTime<Utc>,
    pub window_to: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_from_overflow_ratio() {
        assert_eq!(FindingSeverity::from_overflow_ratio(1.2), FindingSeverity::Low);
        assert_eq!(FindingSeverity::from_overflow_ratio(1.99), FindingSeverity::Low);
        assert_eq!(FindingSeverity::from_overflow_ratio(2.0), FindingSeverity::Medium);
        assert_eq!(FindingSeverity::from_overflow_ratio(4.0), FindingSeverity::High);
        assert_eq!(FindingSeverity::from_overflow_ratio(8.0), FindingSeverity::Critical);
        assert_eq!(FindingSeverity::from_overflow_ratio(100.0), FindingSeverity::Critical);
    }

    #[test]
    fn test_finding_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&FindingType::FailedLogins).unwrap(),
            r#""failed_logins""#
        );
        assert_eq!(FindingType::MultipleIps.as_str(), "multiple_ips");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(FindingSeverity::Low < FindingSeverity::Medium);
        assert!(FindingSeverity::High < FindingSeverity::Critical);
    }
}
