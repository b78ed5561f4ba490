//! Case repository (调查案件数据访问)
//! 案件、备注、证据与案件编号计数器

use crate::{error::AppError, models::case::*};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct CaseRepository {
    db: PgPool,
}

impl CaseRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 生成下一个案件编号：前缀-日期-当日序号
    /// 计数器行级锁保证同一天内编号单调且不复用
    pub async fn next_case_number(
        &self,
        prefix: &str,
        now: DateTime<Utc>,
    ) -> Result<String, AppError> {
        let day = now.date_naive();

        let counter: i32 = sqlx::query(
            r#"
            INSERT INTO case_counters (day, counter)
            VALUES ($1, 1)
            ON CONFLICT (day) DO UPDATE SET counter = case_counters.counter + 1
            RETURNING counter
            "#,
        )
        .bind(day)
        .fetch_one(&self.db)
        .await?
        .get(0);

        Ok(format!("{}-{}-{:04}", prefix, day.format("%Y%m%d"), counter))
    }

    /// 插入案件
    pub async fn insert(&self, case: &InvestigationCase) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO investigation_cases (
                id, case_number, title, description, status, priority, case_type,
                related_user_id, related_tenant_id, assigned_to, created_by, resolved_by,
                opened_at, investigated_at, resolved_at, closed_at,
                resolution, resolution_notes, tags, metadata, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7,
                $8, $9, $10, $11, $12,
                $13, $14, $15, $16,
                $17, $18, $19, $20, $21
            )
            "#,
        )
        .bind(case.id)
        .bind(&case.case_number)
        .bind(&case.title)
        .bind(&case.description)
        .bind(case.status)
        .bind(case.priority)
        .bind(case.case_type)
        .bind(case.related_user_id)
        .bind(case.related_tenant_id)
        .bind(case.assigned_to)
        .bind(case.created_by)
        .bind(case.resolved_by)
        .bind(case.opened_at)
        .bind(case.investigated_at)
        .bind(case.resolved_at)
        .bind(case.closed_at)
        .bind(&case.resolution)
        .bind(&case.resolution_notes)
        .bind(&case.tags)
        .bind(&case.metadata)
        .bind(case.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 按 id 查找案件
    pub async fn find_by_id(&self, case_id: Uuid) -> Result<Option<InvestigationCase>, AppError> {
        let case = sqlx::query_as::<_, InvestigationCase>(
            "SELECT * FROM investigation_cases WHERE id = $1",
        )
        .bind(case_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(case)
    }

    /// 查询案件列表
    pub async fn list(
        &self,
        filters: &CaseFilters,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<InvestigationCase>, AppError> {
        let mut query = String::from("SELECT * FROM investigation_cases WHERE 1=1");
        let mut index = 0;

        if filters.status.is_some() {
            index += 1;
            query.push_str(&format!(" AND status = ${}", index));
        }
        if filters.priority.is_some() {
            index += 1;
            query.push_str(&format!(" AND priority = ${}", index));
        }
        if filters.case_type.is_some() {
            index += 1;
            query.push_str(&format!(" AND case_type = ${}", index));
        }
        if filters.assigned_to.is_some() {
            index += 1;
            query.push_str(&format!(" AND assigned_to = ${}", index));
        }
        if filters.related_tenant_id.is_some() {
            index += 1;
            query.push_str(&format!(" AND related_tenant_id = ${}", index));
        }
        if filters.tag.is_some() {
            index += 1;
            query.push_str(&format!(" AND ${} = ANY(tags)", index));
        }
        if filters.from.is_some() {
            index += 1;
            query.push_str(&format!(" AND opened_at >= ${}", index));
        }
        if filters.to.is_some() {
            index += 1;
            query.push_str(&format!(" AND opened_at <= ${}", index));
        }

        query.push_str(&format!(
            " ORDER BY opened_at DESC LIMIT ${} OFFSET ${}",
            index + 1,
            index + 2
        ));

        let mut query_builder = sqlx::query_as::<_, InvestigationCase>(&query);

        if let Some(status) = filters.status {
            query_builder = query_builder.bind(status);
        }
        if let Some(priority) = filters.priority {
            query_builder = query_builder.bind(priority);
        }
        if let Some(case_type) = filters.case_type {
            query_builder = query_builder.bind(case_type);
        }
        if let Some(assigned_to) = filters.assigned_to {
            query_builder = query_builder.bind(assigned_to);
        }
        if let Some(tenant_id) = filters.related_tenant_id {
            query_builder = query_builder.bind(tenant_id);
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

        let cases = query_builder
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.db)
            .await?;

        Ok(cases)
    }

    /// 乐观并发的状态更新
    /// 仅当 (status, updated_at) 仍与读取时一致才写入；返回生效行数，
    /// 0 表示竞争失败（或案件已不存在，由调用方区分）
    pub async fn update_status_guarded(
        &self,
        case: &InvestigationCase,
        expected_status: CaseStatus,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE investigation_cases
            SET status = $1, assigned_to = $2, resolved_by = $3,
                investigated_at = $4, resolved_at = $5, closed_at = $6,
                resolution = $7, resolution_notes = $8, updated_at = $9
            WHERE id = $10 AND status = $11 AND updated_at = $12
            "#,
        )
        .bind(case.status)
        .bind(case.assigned_to)
        .bind(case.resolved_by)
        .bind(case.investigated_at)
        .bind(case.resolved_at)
        .bind(case.closed_at)
        .bind(&case.resolution)
        .bind(&case.resolution_notes)
        .bind(case.updated_at)
        .bind(case.id)
        .bind(expected_status)
        .bind(expected_updated_at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    // ==================== 备注 ====================

    /// 追加备注
    pub async fn insert_note(&self, note: &CaseNote) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO case_notes (id, case_id, note, note_type, created_by, created_at, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(note.id)
        .bind(note.case_id)
        .bind(&note.note)
        .bind(note.note_type)
        .bind(note.created_by)
        .bind(note.created_at)
        .bind(&note.metadata)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// 按时间顺序列出案件备注
    pub async fn list_notes(&self, case_id: Uuid) -> Result<Vec<CaseNote>, AppError> {
        let notes = sqlx::query_as::<_, CaseNote>(
            "SELECT * FROM case_notes WHERE case_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(case_id)
        .fetch_all(&self.db)
        .await?;

        Ok(notes)
    }

    // ==================== 证据 ====================

    /// 链接证据，重复链接幂等（同案件同类型同 id 只保留一行）
    /// 返回实际插入的行数
    /// 按唯一键 (case_id, evidence_type, evidence_id) 查找证据链接
    pub async fn find_evidence(
        &self,
        case_id: Uuid,
        evidence_type: EvidenceType,
        evidence_id: Uuid,
    ) -> Result<Option<CaseEvidence>, AppError> {
        let evidence = sqlx::query_as::<_, CaseEvidence>(
            r#"
            SELECT * FROM case_evidence
            WHERE case_id = $1 AND evidence_type = $2 AND evidence_id = $3
            "#,
        )
        .bind(case_id)
        .bind(evidence_type)
        .bind(evidence_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(evidence)
    }

    pub async fn insert_evidence(&self, evidence: &CaseEvidence) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO case_evidence (
                id, case_id, evidence_type, evidence_id, evidence_source,
                description, added_by, added_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (case_id, evidence_type, evidence_id) DO NOTHING
            "#,
        )
        .bind(evidence.id)
        .bind(evidence.case_id)
        .bind(evidence.evidence_type)
        .bind(evidence.evidence_id)
        .bind(&evidence.evidence_source)
        .bind(&evidence.description)
        .bind(evidence.added_by)
        .bind(evidence.added_at)
        .bind(&evidence.metadata)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// 按时间顺序列出案件证据
    pub async fn list_evidence(&self, case_id: Uuid) -> Result<Vec<CaseEvidence>, AppError> {
        let evidence = sqlx::query_as::<_, CaseEvidence>(
            "SELECT * FROM case_evidence WHERE case_id = $1 ORDER BY added_at ASC, id ASC",
        )
        .bind(case_id)
        .fetch_all(&self.db)
        .await?;

        Ok(evidence)
    }
}
