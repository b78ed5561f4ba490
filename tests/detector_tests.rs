//! 异常检测器的纯逻辑测试
//! 不依赖数据库：直接构造账本窗口输入

use chrono::{DateTime, Duration, TimeZone, Utc};
use trust_system::models::{
    finding::{DetectionWindow, FindingSeverity, FindingType, LedgerWindow},
    ledger::{AuditLogEntry, AuditSeverity, LoginAttempt, Session},
};
use trust_system::services::detection_service::run_heuristics;
use uuid::Uuid;

mod common;
use common::test_detection_config;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 15, 12, 0, 0).unwrap()
}

fn window() -> DetectionWindow {
    DetectionWindow {
        tenant_id: None,
        user_id: None,
        from: t0(),
        to: t0() + Duration::hours(1),
    }
}

fn failed_attempt(email: &str, minute: i64) -> LoginAttempt {
    LoginAttempt {
        id: Uuid::new_v4(),
        email: email.to_string(),
        user_id: None,
        tenant_id: None,
        ip_address: Some("10.0.0.1".to_string()),
        user_agent: None,
        device_info: None,
        success: false,
        failure_reason: Some("bad password".to_string()),
        attempted_at: t0() + Duration::minutes(minute),
    }
}

fn successful_attempt(user_id: Uuid, ip: &str, minute: i64) -> LoginAttempt {
    LoginAttempt {
        id: Uuid::new_v4(),
        email: "user@x.test".to_string(),
        user_id: Some(user_id),
        tenant_id: None,
        ip_address: Some(ip.to_string()),
        user_agent: None,
        device_info: None,
        success: true,
        failure_reason: None,
        attempted_at: t0() + Duration::minutes(minute),
    }
}

fn session_from(user_id: Uuid, ip: &str, minute: i64) -> Session {
    let login_at = t0() + Duration::minutes(minute);
    Session {
        id: Uuid::new_v4(),
        user_id,
        tenant_id: None,
        ip_address: Some(ip.to_string()),
        user_agent: None,
        device_info: "browser".to_string(),
        login_at,
        logout_at: None,
        expires_at: login_at + Duration::hours(8),
        is_active: true,
        created_at: login_at,
        updated_at: login_at,
    }
}

fn audit_entry(
    user_id: Uuid,
    action: &str,
    severity: AuditSeverity,
    tags: &[&str],
    at: DateTime<Utc>,
) -> AuditLogEntry {
    AuditLogEntry {
        id: Uuid::new_v4(),
        action: action.to_string(),
        resource_type: None,
        resource_id: None,
        user_id: Some(user_id),
        tenant_id: None,
        severity,
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ip_address: None,
        user_agent: None,
        request_id: None,
        details: None,
        created_at: at,
    }
}

#[test]
fn test_failed_logins_six_failures_within_ten_minutes() {
    // 阈值 5 次/15 分钟；10 分钟内 6 次失败 => 恰好一条 low 级 finding，证据 6 条
    let attempts: Vec<LoginAttempt> = (0..6)
        .map(|i| failed_attempt("alice@x.test", i * 2))
        .collect();

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(vec![]),
        audit_entries: Some(vec![]),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());

    assert_eq!(findings.len(), 1);
    let finding = &findings[0];
    assert_eq!(finding.finding_type, FindingType::FailedLogins);
    assert_eq!(finding.severity, FindingSeverity::Low);
    assert_eq!(finding.evidence.len(), 6);
    assert_eq!(finding.detected_at, window().to);
}

#[test]
fn test_failed_logins_below_threshold_is_silent() {
    let attempts: Vec<LoginAttempt> = (0..4)
        .map(|i| failed_attempt("bob@x.test", i * 2))
        .collect();

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(vec![]),
        audit_entries: Some(vec![]),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());
    assert!(findings.is_empty());
}

#[test]
fn test_failed_logins_severity_scales_with_overflow() {
    // 20 次失败 / 阈值 5 = 4 倍溢出 => high
    let attempts: Vec<LoginAttempt> = (0..20)
        .map(|i| failed_attempt("carol@x.test", i / 2))
        .collect();

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(vec![]),
        audit_entries: Some(vec![]),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].severity, FindingSeverity::High);
}

#[test]
fn test_unrelated_subjects_do_not_share_counters() {
    // 两个账号各 3 次失败，都不超阈值
    let mut attempts: Vec<LoginAttempt> = Vec::new();
    for i in 0..3 {
        attempts.push(failed_attempt("dave@x.test", i * 3));
        attempts.push(failed_attempt("erin@x.test", i * 3 + 1));
    }
    attempts.sort_by_key(|a| a.attempted_at);

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(vec![]),
        audit_entries: Some(vec![]),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());
    assert!(findings.is_empty());
}

#[test]
fn test_multiple_ips_over_limit() {
    let user_id = Uuid::new_v4();

    // 成功登录 + 会话共 4 个独立 IP，超过上限 3
    let attempts = vec![
        successful_attempt(user_id, "10.0.0.1", 1),
        successful_attempt(user_id, "10.0.0.2", 5),
    ];
    let sessions = vec![
        session_from(user_id, "10.0.0.3", 10),
        session_from(user_id, "10.0.0.4", 20),
    ];

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(sessions),
        audit_entries: Some(vec![]),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].finding_type, FindingType::MultipleIps);
    assert_eq!(findings[0].user_id, Some(user_id));
    assert_eq!(findings[0].evidence.len(), 4);
}

#[test]
fn test_multiple_ips_at_limit_is_silent() {
    let user_id = Uuid::new_v4();

    let attempts = vec![
        successful_attempt(user_id, "10.0.0.1", 1),
        successful_attempt(user_id, "10.0.0.2", 5),
        successful_attempt(user_id, "10.0.0.3", 9),
    ];

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(vec![]),
        audit_entries: Some(vec![]),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());
    assert!(findings.is_empty());
}

#[test]
fn test_unusual_activity_requires_baseline_sample() {
    let user_id = Uuid::new_v4();

    // 基线只有 3 个活跃小时，低于 baseline_min_hours=12 => 冷启动跳过
    let baseline: Vec<AuditLogEntry> = (0..3)
        .map(|h| {
            audit_entry(
                user_id,
                "grade.update",
                AuditSeverity::Info,
                &[],
                t0() - Duration::days(2) + Duration::hours(h),
            )
        })
        .collect();

    let entries: Vec<AuditLogEntry> = (0..50)
        .map(|i| {
            audit_entry(
                user_id,
                "grade.update",
                AuditSeverity::Info,
                &[],
                t0() + Duration::minutes(i),
            )
        })
        .collect();

    let input = LedgerWindow {
        login_attempts: Some(vec![]),
        sessions: Some(vec![]),
        audit_entries: Some(entries),
        baseline_entries: Some(baseline),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());
    assert!(findings.is_empty());
}

#[test]
fn test_unusual_activity_over_baseline_median() {
    let user_id = Uuid::new_v4();

    // 基线 14 个活跃小时，每小时 1 条 => 中位数 1/h
    let baseline: Vec<AuditLogEntry> = (0..14)
        .map(|h| {
            audit_entry(
                user_id,
                "grade.update",
                AuditSeverity::Info,
                &[],
                t0() - Duration::days(3) + Duration::hours(h),
            )
        })
        .collect();

    // 窗口内单小时 4 条，超过 3 x 1
    let entries: Vec<AuditLogEntry> = (0..4)
        .map(|i| {
            audit_entry(
                user_id,
                "grade.update",
                AuditSeverity::Info,
                &[],
                t0() + Duration::minutes(i * 5),
            )
        })
        .collect();

    let input = LedgerWindow {
        login_attempts: Some(vec![]),
        sessions: Some(vec![]),
        audit_entries: Some(entries),
        baseline_entries: Some(baseline),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());

    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].finding_type, FindingType::UnusualActivity);
    assert_eq!(findings[0].severity, FindingSeverity::Low);
    assert_eq!(findings[0].evidence.len(), 4);
}

#[test]
fn test_suspicious_pattern_escalates_flagged_user() {
    let user_id = Uuid::new_v4();

    // 该用户既触发 failed_logins，又有 critical 级安全事件
    let mut attempts: Vec<LoginAttempt> = (0..6)
        .map(|i| failed_attempt("frank@x.test", i * 2))
        .collect();
    for attempt in &mut attempts {
        attempt.user_id = Some(user_id);
    }

    let entries = vec![audit_entry(
        user_id,
        "role.escalate",
        AuditSeverity::Critical,
        &["security"],
        t0() + Duration::minutes(30),
    )];

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(vec![]),
        audit_entries: Some(entries),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());

    assert_eq!(findings.len(), 2);
    let escalated = findings
        .iter()
        .find(|f| f.finding_type == FindingType::SuspiciousPattern)
        .expect("escalated finding missing");
    assert_eq!(escalated.severity, FindingSeverity::Critical);
    assert_eq!(escalated.user_id, Some(user_id));
}

#[test]
fn test_suspicious_pattern_needs_prior_finding() {
    let user_id = Uuid::new_v4();

    // critical 安全事件但没有其他异常 => 不升级
    let entries = vec![audit_entry(
        user_id,
        "role.escalate",
        AuditSeverity::Critical,
        &["security"],
        t0() + Duration::minutes(30),
    )];

    let input = LedgerWindow {
        login_attempts: Some(vec![]),
        sessions: Some(vec![]),
        audit_entries: Some(entries),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());
    assert!(findings.is_empty());
}

#[test]
fn test_missing_record_kind_skips_only_its_heuristics() {
    let user_id = Uuid::new_v4();

    // 登录尝试不可用，审计类启发式照常工作
    let entries = vec![audit_entry(
        user_id,
        "role.escalate",
        AuditSeverity::Critical,
        &["security"],
        t0() + Duration::minutes(30),
    )];

    let input = LedgerWindow {
        login_attempts: None,
        sessions: Some(vec![]),
        audit_entries: Some(entries),
        baseline_entries: Some(vec![]),
    };

    let findings = run_heuristics(&input, &test_detection_config(), &window());
    // 没有登录数据就没有 failed_logins，也就没有可升级的用户
    assert!(findings.is_empty());
}

#[test]
fn test_detection_is_deterministic() {
    let user_id = Uuid::new_v4();

    let mut attempts: Vec<LoginAttempt> = (0..8)
        .map(|i| failed_attempt("grace@x.test", i))
        .collect();
    for attempt in &mut attempts {
        attempt.user_id = Some(user_id);
    }
    let sessions = vec![
        session_from(user_id, "10.0.0.1", 1),
        session_from(user_id, "10.0.0.2", 2),
    ];
    let entries = vec![audit_entry(
        user_id,
        "role.escalate",
        AuditSeverity::Critical,
        &["authentication"],
        t0() + Duration::minutes(10),
    )];

    let input = LedgerWindow {
        login_attempts: Some(attempts),
        sessions: Some(sessions),
        audit_entries: Some(entries),
        baseline_entries: Some(vec![]),
    };

    let config = test_detection_config();
    let first = run_heuristics(&input, &config, &window());
    let second = run_heuristics(&input, &config, &window());

    // 同一快照、同一配置，两次扫描逐字节一致（含顺序）
    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}
