//! 服务层集成测试
//! 需要 TEST_DATABASE_URL 指向可用的 Postgres，因此默认 ignore：
//! cargo test -- --ignored

use chrono::{Duration, Utc};
use std::sync::Arc;
use trust_system::{
    error::AppError,
    models::{
        case::*,
        ledger::{AuditLogFilters, NewSession, SessionFilters},
    },
    services::{CaseService, ExportFormat, ExportService, LedgerService, SessionService},
};
use tokio::sync::watch;
use uuid::Uuid;

mod common;
use common::{create_test_config, setup_test_db, superuser_context};

fn new_session(user_id: Uuid) -> NewSession {
    NewSession {
        user_id,
        tenant_id: None,
        ip_address: Some("10.0.0.1".to_string()),
        user_agent: None,
        device_info: "integration-test".to_string(),
        login_at: None,
        expires_at: Utc::now() + Duration::hours(8),
    }
}

#[tokio::test]
#[ignore]
async fn test_session_revoke_is_idempotent() {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let ledger = Arc::new(LedgerService::new(pool.clone()));
    let sessions = SessionService::new(pool, ledger.clone());
    let caller = superuser_context();

    let session = ledger
        .append_session(new_session(Uuid::new_v4()))
        .await
        .unwrap();

    let first = sessions.revoke(&caller, session.id).await.unwrap();
    assert!(first.revoked);

    // 再次吊销：不报错，也不再次生效
    let second = sessions.revoke(&caller, session.id).await.unwrap();
    assert!(!second.revoked);

    // 不存在的会话才是 NotFound
    let missing = sessions.revoke(&caller, Uuid::new_v4()).await;
    assert!(matches!(missing, Err(AppError::NotFound(_))));
}

#[tokio::test]
#[ignore]
async fn test_revoke_all_spares_excepted_session() {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let ledger = Arc::new(LedgerService::new(pool.clone()));
    let sessions = SessionService::new(pool, ledger.clone());
    let caller = superuser_context();

    let user_id = Uuid::new_v4();
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(ledger.append_session(new_session(user_id)).await.unwrap().id);
    }
    let keep = ids[0];

    let revoked = sessions.revoke_all(&caller, user_id, Some(keep)).await.unwrap();
    assert_eq!(revoked, 2);

    let active = sessions
        .list_active_sessions(&caller, SessionFilters::default())
        .await
        .unwrap();
    let active_ids: Vec<Uuid> = active
        .iter()
        .filter(|s| s.user_id == user_id)
        .map(|s| s.id)
        .collect();
    assert_eq!(active_ids, vec![keep]);
}

#[tokio::test]
#[ignore]
async fn test_expired_sessions_reconciled_lazily() {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let ledger = Arc::new(LedgerService::new(pool.clone()));
    let sessions = SessionService::new(pool.clone(), ledger.clone());
    let caller = superuser_context();

    let user_id = Uuid::new_v4();
    let session = ledger.append_session(new_session(user_id)).await.unwrap();

    // 直接把过期时间改到过去，模拟时间流逝
    sqlx::query("UPDATE sessions SET expires_at = $1 WHERE id = $2")
        .bind(Utc::now() - Duration::minutes(1))
        .bind(session.id)
        .execute(&pool)
        .await
        .unwrap();

    let active = sessions
        .list_active_sessions(&caller, SessionFilters::default())
        .await
        .unwrap();
    assert!(active.iter().all(|s| s.id != session.id));

    // 惰性回收已把标志落库
    let (is_active,): (bool,) =
        sqlx::query_as("SELECT is_active FROM sessions WHERE id = $1")
            .bind(session.id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(!is_active);
}

fn case_request(title: &str) -> CreateCaseRequest {
    CreateCaseRequest {
        title: title.to_string(),
        description: None,
        case_type: CaseType::Security,
        priority: Some(CasePriority::High),
        related_user_id: None,
        related_tenant_id: None,
        assigned_to: None,
        tags: vec![],
        metadata: serde_json::Value::Null,
    }
}

#[tokio::test]
#[ignore]
async fn test_case_creation_defaults_and_numbering() {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let ledger = Arc::new(LedgerService::new(pool.clone()));
    let cases = CaseService::new(pool, config.case.clone(), ledger);
    let caller = superuser_context();

    let first = cases
        .create(&caller, case_request("Suspicious logins"))
        .await
        .unwrap();

    assert_eq!(first.status, CaseStatus::Open);
    assert!(first.investigated_at.is_none());
    assert!(first.resolved_at.is_none());
    assert!(first.closed_at.is_none());

    // CASE-YYYYMMDD-NNNN
    let parts: Vec<&str> = first.case_number.split('-').collect();
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], "CASE");
    assert_eq!(parts[1].len(), 8);
    assert_eq!(parts[2].len(), 4);

    // 同日第二个案件编号递增且不复用
    let second = cases
        .create(&caller, case_request("Another case"))
        .await
        .unwrap();
    assert_ne!(first.case_number, second.case_number);
    assert_eq!(parts[1], second.case_number.split('-').nth(1).unwrap());
}

#[tokio::test]
#[ignore]
async fn test_case_lifecycle_and_terminal_close() {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let ledger = Arc::new(LedgerService::new(pool.clone()));
    let cases = CaseService::new(pool, config.case.clone(), ledger);
    let caller = superuser_context();

    let case = cases
        .create(&caller, case_request("Lifecycle"))
        .await
        .unwrap();

    let case = cases
        .update_status(
            &caller,
            case.id,
            UpdateCaseStatusRequest {
                status: CaseStatus::Investigating,
                resolution: None,
                resolution_notes: None,
                assigned_to: Some(caller.user_id),
            },
        )
        .await
        .unwrap();
    assert!(case.investigated_at.is_some());

    // 缺少 resolution 的 resolved 被拒绝
    let missing_resolution = cases
        .update_status(
            &caller,
            case.id,
            UpdateCaseStatusRequest {
                status: CaseStatus::Resolved,
                resolution: None,
                resolution_notes: None,
                assigned_to: None,
            },
        )
        .await;
    assert!(matches!(missing_resolution, Err(AppError::Validation(_))));

    let case = cases
        .update_status(
            &caller,
            case.id,
            UpdateCaseStatusRequest {
                status: CaseStatus::Resolved,
                resolution: Some("false positive".to_string()),
                resolution_notes: None,
                assigned_to: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(case.resolved_by, Some(caller.user_id));

    let case = cases
        .update_status(
            &caller,
            case.id,
            UpdateCaseStatusRequest {
                status: CaseStatus::Closed,
                resolution: None,
                resolution_notes: None,
                assigned_to: None,
            },
        )
        .await
        .unwrap();
    assert!(case.closed_at.is_some());

    // closed 是终态
    let reopen = cases
        .update_status(
            &caller,
            case.id,
            UpdateCaseStatusRequest {
                status: CaseStatus::Investigating,
                resolution: None,
                resolution_notes: None,
                assigned_to: None,
            },
        )
        .await;
    assert!(matches!(
        reopen,
        Err(AppError::InvalidStateTransition {
            from: CaseStatus::Closed,
            to: CaseStatus::Investigating
        })
    ));

    // 但仍然接受备注，且强制为 note 类型
    let note = cases
        .add_note(
            &caller,
            case.id,
            AddNoteRequest {
                note: "post-close remark".to_string(),
                note_type: NoteType::Action,
                metadata: serde_json::Value::Null,
            },
        )
        .await
        .unwrap();
    assert_eq!(note.note_type, NoteType::Note);
}

#[tokio::test]
#[ignore]
async fn test_evidence_resolution_and_idempotence() {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let ledger = Arc::new(LedgerService::new(pool.clone()));
    let cases = CaseService::new(pool, config.case.clone(), ledger.clone());
    let caller = superuser_context();

    let case = cases
        .create(&caller, case_request("Evidence"))
        .await
        .unwrap();
    let session = ledger
        .append_session(new_session(Uuid::new_v4()))
        .await
        .unwrap();

    let request = AddEvidenceRequest {
        evidence_type: EvidenceType::Session,
        evidence_id: session.id,
        evidence_source: None,
        description: None,
        metadata: serde_json::Value::Null,
    };

    let first = cases
        .add_evidence(&caller, case.id, request.clone())
        .await
        .unwrap();
    // 重复链接幂等：不报错，不产生第二行，返回的是已落库的那行
    let second = cases
        .add_evidence(&caller, case.id, request)
        .await
        .unwrap();
    assert_eq!(second.id, first.id);

    let children = cases.get_with_children(&caller, case.id).await.unwrap();
    assert_eq!(children.evidence.len(), 1);
    assert_eq!(children.evidence[0].id, first.id);

    // 不存在的账本记录拒绝链接
    let dangling = cases
        .add_evidence(
            &caller,
            case.id,
            AddEvidenceRequest {
                evidence_type: EvidenceType::AuditLog,
                evidence_id: Uuid::new_v4(),
                evidence_source: None,
                description: None,
                metadata: serde_json::Value::Null,
            },
        )
        .await;
    assert!(matches!(dangling, Err(AppError::NotFound(_))));
}

#[tokio::test]
#[ignore]
async fn test_file_export_cancel_removes_partial_file() {
    let config = create_test_config();
    let pool = setup_test_db(&config).await;

    let ledger = Arc::new(LedgerService::new(pool.clone()));
    let cases = Arc::new(CaseService::new(
        pool.clone(),
        config.case.clone(),
        ledger.clone(),
    ));
    let exports = ExportService::new(pool, config.export.clone(), cases, ledger.clone());
    let caller = superuser_context();

    let path = std::env::temp_dir().join(format!("trust-export-{}.csv", Uuid::new_v4()));
    let tmp_path = path.with_extension("csv.tmp");

    // 进入分页循环前取消已经生效，半成品必须被删掉
    let (cancel_tx, cancel_rx) = watch::channel(false);
    cancel_tx.send(true).unwrap();

    let cancelled = exports
        .export_audit_entries_to_file(
            &caller,
            AuditLogFilters::default(),
            ExportFormat::Csv,
            &path,
            cancel_rx,
        )
        .await;

    assert!(matches!(cancelled, Err(AppError::Cancelled(_))));
    assert!(!path.exists());
    assert!(!tmp_path.exists());

    // 未取消时写 tmp 然后原子重命名到目标路径
    let (_keep_tx, cancel_rx) = watch::channel(false);
    exports
        .export_audit_entries_to_file(
            &caller,
            AuditLogFilters::default(),
            ExportFormat::Csv,
            &path,
            cancel_rx,
        )
        .await
        .unwrap();

    assert!(path.exists());
    assert!(!tmp_path.exists());
    tokio::fs::remove_file(&path).await.unwrap();
}
