//! 调查案件服务
//! 状态机校验、乐观并发、证据解析全部在这一层完成

use crate::{
    auth::AuthContext,
    config::CaseConfig,
    error::AppError,
    models::case::*,
    repository::{
        case_repo::CaseRepository,
        ledger_repo::{LedgerRepository, LedgerTable},
    },
    services::ledger_service::{LedgerService, TrustAction},
};
use chrono::Utc;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

pub struct CaseService {
    db: PgPool,
    config: CaseConfig,
    ledger_service: Arc<LedgerService>,
}

impl CaseService {
    pub fn new(db: PgPool, config: CaseConfig, ledger_service: Arc<LedgerService>) -> Self {
        Self {
            db,
            config,
            ledger_service,
        }
    }

    fn repo(&self) -> CaseRepository {
        CaseRepository::new(self.db.clone())
    }

    /// 租户可见性：平台管理员全量可见，租户调用方只能看到本租户案件
    /// 越权访问一律报 NotFound，不泄露案件是否存在
    fn ensure_visible(&self, caller: &AuthContext, case: &InvestigationCase) -> Result<(), AppError> {
        if caller.is_superuser() {
            return Ok(());
        }
        if case.related_tenant_id.is_some() && case.related_tenant_id == caller.tenant_id {
            return Ok(());
        }
        Err(AppError::not_found("Case"))
    }

    /// 创建案件，状态固定为 open
    #[instrument(skip(self, caller, req))]
    pub async fn create(
        &self,
        caller: &AuthContext,
        mut req: CreateCaseRequest,
    ) -> Result<InvestigationCase, AppError> {
        req.validate()?;
        req.related_tenant_id = caller.effective_tenant(req.related_tenant_id)?;

        let now = Utc::now();
        let case_number = self
            .repo()
            .next_case_number(&self.config.number_prefix, now)
            .await?;

        let case = InvestigationCase {
            id: Uuid::new_v4(),
            case_number,
            title: req.title,
            description: req.description,
            status: CaseStatus::Open,
            priority: req.priority.unwrap_or(CasePriority::Medium),
            case_type: req.case_type,
            related_user_id: req.related_user_id,
            related_tenant_id: req.related_tenant_id,
            assigned_to: req.assigned_to,
            created_by: caller.user_id,
            resolved_by: None,
            opened_at: now,
            investigated_at: None,
            resolved_at: None,
            closed_at: None,
            resolution: None,
            resolution_notes: None,
            tags: req.tags,
            metadata: req.metadata,
            updated_at: now,
        };

        self.repo().insert(&case).await?;

        info!(case_id = %case.id, case_number = %case.case_number, "Investigation case created");
        metrics::counter!("cases.created").increment(1);

        self.ledger_service
            .record_action(
                TrustAction::CaseCreate,
                caller,
                "investigation_case",
                Some(case.id),
                Some(serde_json::json!({ "case_number": case.case_number })),
            )
            .await;

        Ok(case)
    }

    /// 按 id 取案件（含可见性检查）
    pub async fn get(&self, caller: &AuthContext, case_id: Uuid) -> Result<InvestigationCase, AppError> {
        let case = self
            .repo()
            .find_by_id(case_id)
            .await?
            .ok_or_else(|| AppError::not_found("Case"))?;

        self.ensure_visible(caller, &case)?;
        Ok(case)
    }

    /// 案件详情：案件本体 + 备注（时间序）+ 证据（时间序）
    #[instrument(skip(self, caller))]
    pub async fn get_with_children(
        &self,
        caller: &AuthContext,
        case_id: Uuid,
    ) -> Result<CaseWithChildren, AppError> {
        let case = self.get(caller, case_id).await?;
        let repo = self.repo();

        let notes = repo.list_notes(case_id).await?;
        let evidence = repo.list_evidence(case_id).await?;

        Ok(CaseWithChildren {
            case,
            notes,
            evidence,
        })
    }

    /// 案件列表查询
    #[instrument(skip(self, caller, filters))]
    pub async fn list(
        &self,
        caller: &AuthContext,
        mut filters: CaseFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InvestigationCase>, AppError> {
        filters.related_tenant_id = caller.effective_tenant(filters.related_tenant_id)?;
        self.repo().list(&filters, limit, offset).await
    }

    /// 状态转换
    /// 转换表之外的 (from, to) 报 InvalidStateTransition；
    /// 竞争失败报 ConcurrentModification，由调用方重读重试
    #[instrument(skip(self, caller, req))]
    pub async fn update_status(
        &self,
        caller: &AuthContext,
        case_id: Uuid,
        req: UpdateCaseStatusRequest,
    ) -> Result<InvestigationCase, AppError> {
        let mut case = self.get(caller, case_id).await?;

        let from = case.status;
        let to = req.status;

        if !from.can_transition_to(to) {
            return Err(AppError::InvalidStateTransition { from, to });
        }
        if to == CaseStatus::Resolved && req.resolution.as_deref().unwrap_or("").is_empty() {
            return Err(AppError::validation(
                "resolution is required when resolving a case",
            ));
        }

        let expected_status = from;
        let expected_updated_at = case.updated_at;
        let now = Utc::now();

        case.status = to;
        case.updated_at = now;
        if let Some(assigned_to) = req.assigned_to {
            case.assigned_to = Some(assigned_to);
        }

        match (from, to) {
            (CaseStatus::Open, CaseStatus::Investigating) => {
                case.investigated_at = Some(now);
            }
            (CaseStatus::Investigating, CaseStatus::Resolved) => {
                case.resolved_at = Some(now);
                case.resolved_by = Some(caller.user_id);
                case.resolution = req.resolution.clone();
                case.resolution_notes = req.resolution_notes.clone();
            }
            (CaseStatus::Resolved, CaseStatus::Closed) => {
                case.closed_at = Some(now);
            }
            (CaseStatus::Investigating, CaseStatus::Open) => {
                case.investigated_at = None;
            }
            (CaseStatus::Resolved, CaseStatus::Investigating) => {
                case.resolved_at = None;
                case.resolved_by = None;
                case.resolution = None;
                case.resolution_notes = None;
            }
            _ => unreachable!("transition table already validated"),
        }

        let rows = self
            .repo()
            .update_status_guarded(&case, expected_status, expected_updated_at)
            .await?;

        if rows == 0 {
            // 区分案件消失与并发竞争
            return match self.repo().find_by_id(case_id).await? {
                Some(_) => {
                    warn!(case_id = %case_id, "Lost case status race, caller must retry");
                    Err(AppError::ConcurrentModification)
                }
                None => Err(AppError::not_found("Case")),
            };
        }

        info!(case_id = %case_id, from = %from, to = %to, "Case status changed");
        metrics::counter!("cases.transitions").increment(1);

        self.ledger_service
            .record_action(
                TrustAction::CaseStatusChange,
                caller,
                "investigation_case",
                Some(case_id),
                Some(serde_json::json!({ "from": from.as_str(), "to": to.as_str() })),
            )
            .await;

        Ok(case)
    }

    /// 追加备注，任何状态都允许
    /// 已关闭案件的备注强制归为 note 类型，只留痕不改变案件
    #[instrument(skip(self, caller, req))]
    pub async fn add_note(
        &self,
        caller: &AuthContext,
        case_id: Uuid,
        req: AddNoteRequest,
    ) -> Result<CaseNote, AppError> {
        req.validate()?;
        let case = self.get(caller, case_id).await?;

        let note_type = if case.status == CaseStatus::Closed {
            NoteType::Note
        } else {
            req.note_type
        };

        let note = CaseNote {
            id: Uuid::new_v4(),
            case_id,
            note: req.note,
            note_type,
            created_by: caller.user_id,
            created_at: Utc::now(),
            metadata: req.metadata,
        };

        self.repo().insert_note(&note).await?;

        self.ledger_service
            .record_action(
                TrustAction::CaseNoteAdd,
                caller,
                "case_note",
                Some(note.id),
                None,
            )
            .await;

        Ok(note)
    }

    /// 链接证据
    /// 账本类证据必须能解析到现存记录；重复链接幂等
    #[instrument(skip(self, caller, req))]
    pub async fn add_evidence(
        &self,
        caller: &AuthContext,
        case_id: Uuid,
        req: AddEvidenceRequest,
    ) -> Result<CaseEvidence, AppError> {
        let _case = self.get(caller, case_id).await?;

        if req.evidence_type.resolves_against_ledger() {
            let table = ledger_table_for(req.evidence_type);
            let ledger = LedgerRepository::new(self.db.clone());
            if !ledger.record_exists(table, req.evidence_id).await? {
                return Err(AppError::not_found("Referenced ledger record"));
            }
        }

        let evidence = CaseEvidence {
            id: Uuid::new_v4(),
            case_id,
            evidence_type: req.evidence_type,
            evidence_id: req.evidence_id,
            evidence_source: req.evidence_source,
            description: req.description,
            added_by: caller.user_id,
            added_at: Utc::now(),
            metadata: req.metadata,
        };

        let inserted = self.repo().insert_evidence(&evidence).await?;
        if inserted == 0 {
            // 冲突时返回已落库的行，调用方永远拿不到未持久化的 id
            info!(case_id = %case_id, evidence_id = %req.evidence_id, "Duplicate evidence link ignored");
            return self
                .repo()
                .find_evidence(case_id, evidence.evidence_type, evidence.evidence_id)
                .await?
                .ok_or(AppError::ConcurrentModification);
        }

        self.ledger_service
            .record_action(
                TrustAction::CaseEvidenceAdd,
                caller,
                "case_evidence",
                Some(evidence.id),
                None,
            )
            .await;

        Ok(evidence)
    }
}

/// 账本类证据对应的底层表
fn ledger_table_for(evidence_type: EvidenceType) -> LedgerTable {
    match evidence_type {
        EvidenceType::AuditLog => LedgerTable::AuditLogEntries,
        EvidenceType::Session => LedgerTable::Sessions,
        EvidenceType::LoginAttempt => LedgerTable::LoginAttempts,
        EvidenceType::PasswordChange => LedgerTable::PasswordChanges,
        EvidenceType::File | EvidenceType::Other => {
            unreachable!("file/other evidence is not ledger-resolvable")
        }
    }
}
