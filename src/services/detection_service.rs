//! 异常检测服务
//! 纯函数启发式：同一账本快照、同一窗口、同一配置 => 逐字节相同的结果。
//! Finding 从不落库，每次扫描重新计算。

use crate::{
    auth::AuthContext,
    config::DetectionConfig,
    error::AppError,
    models::{
        finding::*,
        ledger::{AuditLogEntry, AuditSeverity, LoginAttempt, Session},
    },
    repository::ledger_repo::LedgerRepository,
};
use chrono::{DateTime, Duration, DurationRound, Utc};
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{instrument, warn};
use uuid::Uuid;

pub struct DetectionService {
    db: PgPool,
    config: DetectionConfig,
}

impl DetectionService {
    pub fn new(db: PgPool, config: DetectionConfig) -> Self {
        Self { db, config }
    }

    /// 对一段账本窗口执行按需扫描
    /// 部分账本不可用时不让整次扫描失败：跳过受影响的启发式并标记 partial
    #[instrument(skip(self, caller))]
    pub async fn detect(
        &self,
        caller: &AuthContext,
        mut window: DetectionWindow,
    ) -> Result<ScanReport, AppError> {
        window.tenant_id = caller.effective_tenant(window.tenant_id)?;

        if window.to <= window.from {
            return Err(AppError::validation("detection window must have from < to"));
        }

        let repo = LedgerRepository::new(self.db.clone());
        let mut partial = false;

        let login_attempts = match repo
            .login_attempts_in_window(window.tenant_id, window.user_id, window.from, window.to)
            .await
        {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Login attempts unavailable for scan window");
                partial = true;
                None
            }
        };

        let sessions = match repo
            .sessions_in_window(window.tenant_id, window.user_id, window.from, window.to)
            .await
        {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Sessions unavailable for scan window");
                partial = true;
                None
            }
        };

        let audit_entries = match repo
            .audit_entries_in_window(window.tenant_id, window.user_id, window.from, window.to)
            .await
        {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Audit entries unavailable for scan window");
                partial = true;
                None
            }
        };

        let baseline_from = window.from - Duration::days(self.config.baseline_days as i64);
        let baseline_entries = match repo
            .audit_entries_in_window(window.tenant_id, window.user_id, baseline_from, window.from)
            .await
        {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(error = %e, "Baseline audit entries unavailable for scan window");
                partial = true;
                None
            }
        };

        let input = LedgerWindow {
            login_attempts,
            sessions,
            audit_entries,
            baseline_entries,
        };

        let findings = run_heuristics(&input, &self.config, &window);

        metrics::counter!("detection.scans").increment(1);
        metrics::histogram!("detection.findings_per_scan").record(findings.len() as f64);

        Ok(ScanReport {
            findings,
            partial,
            window_from: window.from,
            window_to: window.to,
        })
    }
}

/// 检测主体识别键
/// 优先 user_id，匿名失败尝试回退到 email
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SubjectKey {
    subject: String,
    tenant_id: Option<Uuid>,
    user_id: Option<Uuid>,
}

impl SubjectKey {
    fn from_attempt(attempt: &LoginAttempt) -> Self {
        Self {
            subject: attempt
                .user_id
                .map(|u| u.to_string())
                .unwrap_or_else(|| attempt.email.clone()),
            tenant_id: attempt.tenant_id,
            user_id: attempt.user_id,
        }
    }
}

/// 纯启发式核心：无时钟、无随机、无全局状态
/// detected_at 取窗口结束时间，保证审计复跑结果一致
pub fn run_heuristics(
    input: &LedgerWindow,
    config: &DetectionConfig,
    window: &DetectionWindow,
) -> Vec<AnomalyFinding> {
    let mut findings = Vec::new();

    if let Some(attempts) = &input.login_attempts {
        findings.extend(detect_failed_logins(attempts, config, window.to));
        findings.extend(detect_multiple_ips(
            attempts,
            input.sessions.as_deref().unwrap_or(&[]),
            config,
            window.to,
        ));
    }

    if let (Some(entries), Some(baseline)) = (&input.audit_entries, &input.baseline_entries) {
        findings.extend(detect_unusual_activity(entries, baseline, config, window.to));
    }

    if let Some(entries) = &input.audit_entries {
        let escalations = detect_suspicious_pattern(entries, &findings, window.to);
        findings.extend(escalations);
    }

    // 稳定排序，保证同一输入产出同一顺序
    findings.sort_by(|a, b| {
        (a.finding_type, a.user_id, a.description.as_str()).cmp(&(
            b.finding_type,
            b.user_id,
            b.description.as_str(),
        ))
    });

    findings
}

/// failed_logins：滑动窗口内失败次数超阈值
/// 严重级别按溢出比例分级，证据为贡献的全部尝试
fn detect_failed_logins(
    attempts: &[LoginAttempt],
    config: &DetectionConfig,
    detected_at: DateTime<Utc>,
) -> Vec<AnomalyFinding> {
    let window = Duration::minutes(config.failed_login_window_mins as i64);
    let threshold = config.failed_login_threshold as usize;

    // 按主体分组，保持无关主体互不影响
    let mut by_subject: BTreeMap<SubjectKey, Vec<&LoginAttempt>> = BTreeMap::new();
    for attempt in attempts.iter().filter(|a| !a.success) {
        by_subject
            .entry(SubjectKey::from_attempt(attempt))
            .or_default()
            .push(attempt);
    }

    let mut findings = Vec::new();

    for (key, failed) in by_subject {
        // 输入已按时间升序；双指针找密度最高的子窗口
        let mut best: Option<(usize, usize)> = None; // (start, len)
        let mut start = 0;
        for end in 0..failed.len() {
            while failed[end].attempted_at - failed[start].attempted_at > window {
                start += 1;
            }
            let len = end - start + 1;
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((start, len));
            }
        }

        let Some((start, len)) = best else { continue };
        if len < threshold {
            continue;
        }

        let contributing = &failed[start..start + len];
        let ratio = len as f64 / threshold as f64;

        findings.push(AnomalyFinding {
            finding_type: FindingType::FailedLogins,
            severity: FindingSeverity::from_overflow_ratio(ratio),
            description: format!(
                "{} failed login attempts for {} within {} minutes (threshold {})",
                len, key.subject, config.failed_login_window_mins, threshold
            ),
            user_id: key.user_id,
            tenant_id: key.tenant_id,
            evidence: contributing
                .iter()
                .map(|a| FindingEvidence {
                    kind: "login_attempt".to_string(),
                    id: a.id,
                    timestamp: a.attempted_at,
                    details: a
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "failed login".to_string()),
                })
                .collect(),
            detected_at,
        });
    }

    findings
}

/// multiple_ips：有成功登录的用户在窗口内出现过多独立 IP
fn detect_multiple_ips(
    attempts: &[LoginAttempt],
    sessions: &[Session],
    config: &DetectionConfig,
    detected_at: DateTime<Utc>,
) -> Vec<AnomalyFinding> {
    // 只看窗口内成功登录过的用户
    let successful_users: BTreeSet<Uuid> = attempts
        .iter()
        .filter(|a| a.success)
        .filter_map(|a| a.user_id)
        .collect();

    let mut findings = Vec::new();

    for user_id in successful_users {
        // IP -> 首个观察到的证据记录；BTreeMap 保证证据按 IP 排序稳定
        let mut ips: BTreeMap<&str, FindingEvidence> = BTreeMap::new();
        let mut tenant_id = None;

        for attempt in attempts.iter().filter(|a| a.user_id == Some(user_id)) {
            tenant_id = tenant_id.or(attempt.tenant_id);
            if let Some(ip) = attempt.ip_address.as_deref() {
                ips.entry(ip).or_insert_with(|| FindingEvidence {
                    kind: "login_attempt".to_string(),
                    id: attempt.id,
                    timestamp: attempt.attempted_at,
                    details: format!("login from {}", ip),
                });
            }
        }
        for session in sessions.iter().filter(|s| s.user_id == user_id) {
            tenant_id = tenant_id.or(session.tenant_id);
            if let Some(ip) = session.ip_address.as_deref() {
                ips.entry(ip).or_insert_with(|| FindingEvidence {
                    kind: "session".to_string(),
                    id: session.id,
                    timestamp: session.login_at,
                    details: format!("session from {}", ip),
                });
            }
        }

        let distinct = ips.len();
        if distinct <= config.max_distinct_ips as usize {
            continue;
        }

        let ratio = distinct as f64 / config.max_distinct_ips as f64;

        findings.push(AnomalyFinding {
            finding_type: FindingType::MultipleIps,
            severity: FindingSeverity::from_overflow_ratio(ratio),
            description: format!(
                "user {} seen from {} distinct IP addresses (limit {})",
                user_id, distinct, config.max_distinct_ips
            ),
            user_id: Some(user_id),
            tenant_id,
            evidence: ips.into_values().collect(),
            detected_at,
        });
    }

    findings
}

/// unusual_activity：用户每小时审计量偏离自身 7 天基线
/// 基线样本不足时跳过，避免冷启动误报
fn detect_unusual_activity(
    entries: &[AuditLogEntry],
    baseline: &[AuditLogEntry],
    config: &DetectionConfig,
    detected_at: DateTime<Utc>,
) -> Vec<AnomalyFinding> {
    // 基线：用户 -> 有活动的小时桶 -> 条数
    let mut baseline_hours: BTreeMap<Uuid, BTreeMap<DateTime<Utc>, usize>> = BTreeMap::new();
    for entry in baseline {
        let Some(user_id) = entry.user_id else { continue };
        let Ok(bucket) = entry.created_at.duration_trunc(Duration::hours(1)) else {
            continue;
        };
        *baseline_hours
            .entry(user_id)
            .or_default()
            .entry(bucket)
            .or_default() += 1;
    }

    // 窗口：用户 -> 小时桶 -> 条目
    let mut window_hours: BTreeMap<Uuid, BTreeMap<DateTime<Utc>, Vec<&AuditLogEntry>>> =
        BTreeMap::new();
    for entry in entries {
        let Some(user_id) = entry.user_id else { continue };
        let Ok(bucket) = entry.created_at.duration_trunc(Duration::hours(1)) else {
            continue;
        };
        window_hours
            .entry(user_id)
            .or_default()
            .entry(bucket)
            .or_default()
            .push(entry);
    }

    let mut findings = Vec::new();

    for (user_id, buckets) in window_hours {
        let Some(history) = baseline_hours.get(&user_id) else {
            continue;
        };
        if history.len() < config.baseline_min_hours as usize {
            continue;
        }

        let median = median_of(history.values().copied());
        let limit = config.activity_multiplier * median;

        // 取最早的超限桶作为证据来源，保证确定性
        let Some((bucket, peak_entries)) = buckets
            .iter()
            .find(|(_, entries)| entries.len() as f64 > limit)
        else {
            continue;
        };

        let ratio = peak_entries.len() as f64 / limit;
        let tenant_id = peak_entries.iter().find_map(|e| e.tenant_id);

        findings.push(AnomalyFinding {
            finding_type: FindingType::UnusualActivity,
            severity: FindingSeverity::from_overflow_ratio(ratio),
            description: format!(
                "user {} produced {} audit entries in hour {} against a median of {:.1}/h",
                user_id,
                peak_entries.len(),
                bucket.format("%Y-%m-%dT%H:00Z"),
                median
            ),
            user_id: Some(user_id),
            tenant_id,
            evidence: peak_entries
                .iter()
                .map(|e| FindingEvidence {
                    kind: "audit_log".to_string(),
                    id: e.id,
                    timestamp: e.created_at,
                    details: e.action.clone(),
                })
                .collect(),
            detected_at,
        });
    }

    findings
}

/// suspicious_pattern：critical 级安全审计事件与同窗口内同一用户的
/// failed_logins/multiple_ips 结论叠加，升级为复合异常
fn detect_suspicious_pattern(
    entries: &[AuditLogEntry],
    prior_findings: &[AnomalyFinding],
    detected_at: DateTime<Utc>,
) -> Vec<AnomalyFinding> {
    let flagged_users: BTreeSet<Uuid> = prior_findings
        .iter()
        .filter(|f| {
            matches!(
                f.finding_type,
                FindingType::FailedLogins | FindingType::MultipleIps
            )
        })
        .filter_map(|f| f.user_id)
        .collect();

    entries
        .iter()
        .filter(|e| e.severity == AuditSeverity::Critical)
        .filter(|e| {
            e.tags
                .iter()
                .any(|t| t == "security" || t == "authentication")
        })
        .filter_map(|entry| {
            let user_id = entry.user_id?;
            if !flagged_users.contains(&user_id) {
                return None;
            }

            Some(AnomalyFinding {
                finding_type: FindingType::SuspiciousPattern,
                severity: FindingSeverity::Critical,
                description: format!(
                    "critical security event '{}' coincides with login anomalies for user {}",
                    entry.action, user_id
                ),
                user_id: Some(user_id),
                tenant_id: entry.tenant_id,
                evidence: vec![FindingEvidence {
                    kind: "audit_log".to_string(),
                    id: entry.id,
                    timestamp: entry.created_at,
                    details: entry.action.clone(),
                }],
                detected_at,
            })
        })
        .collect()
}

/// 中位数（偶数个取中间两数平均）
fn median_of(values: impl Iterator<Item = usize>) -> f64 {
    let mut sorted: Vec<usize> = values.collect();
    sorted.sort_unstable();

    if sorted.is_empty() {
        return 0.0;
    }

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    }
}
