//! 审计导出服务
//! 案件审计链与账本区段的确定性序列化（CSV / JSON / PDF）
//! 除 generated_at 头部字段外，同一数据的两次导出逐字节相同

use crate::{
    auth::AuthContext,
    config::ExportConfig,
    error::AppError,
    models::{
        case::{CaseEvidence, CaseWithChildren, EvidenceType},
        ledger::{AuditLogEntry, AuditLogFilters, Pagination},
    },
    repository::ledger_repo::{LedgerRepository, LedgerTable},
    services::{
        case_service::CaseService,
        ledger_service::{LedgerService, TrustAction},
    },
};
use axum::body::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::{path::Path, sync::Arc};
use tokio::{
    fs,
    io::AsyncWriteExt,
    sync::{mpsc, watch},
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 导出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Pdf,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv; charset=utf-8",
            ExportFormat::Json => "application/json",
            ExportFormat::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Json => "json",
            ExportFormat::Pdf => "pdf",
        }
    }
}

/// 渲染完成的导出文档
pub struct ExportDocument {
    pub filename: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

/// 证据行及其导出时刻解析出的账本记录
/// 账本记录不在链接时快照，导出之间内容可合法变化
#[derive(Debug, Serialize)]
struct ResolvedEvidence<'a> {
    #[serde(flatten)]
    evidence: &'a CaseEvidence,
    resolved: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct CaseAuditTrail<'a> {
    generated_at: String,
    #[serde(flatten)]
    case: &'a CaseWithChildren,
    resolved_evidence: Vec<ResolvedEvidence<'a>>,
}

pub struct ExportService {
    db: PgPool,
    config: ExportConfig,
    case_service: Arc<CaseService>,
    ledger_service: Arc<LedgerService>,
}

impl ExportService {
    pub fn new(
        db: PgPool,
        config: ExportConfig,
        case_service: Arc<CaseService>,
        ledger_service: Arc<LedgerService>,
    ) -> Self {
        Self {
            db,
            config,
            case_service,
            ledger_service,
        }
    }

    // ==================== 案件审计链 ====================

    /// 导出单个案件的完整审计链
    /// 顺序固定：案件头、备注（时间序）、证据（时间序，含实时解析的账本记录）
    #[instrument(skip(self, caller))]
    pub async fn export_case_audit_trail(
        &self,
        caller: &AuthContext,
        case_id: Uuid,
        format: ExportFormat,
    ) -> Result<ExportDocument, AppError> {
        let children = self.case_service.get_with_children(caller, case_id).await?;
        let resolved = self.resolve_evidence(&children.evidence).await?;
        let generated_at = rfc3339(Utc::now());

        let bytes = match format {
            ExportFormat::Json => {
                let trail = CaseAuditTrail {
                    generated_at,
                    case: &children,
                    resolved_evidence: children
                        .evidence
                        .iter()
                        .zip(resolved.iter().cloned())
                        .map(|(evidence, resolved)| ResolvedEvidence { evidence, resolved })
                        .collect(),
                };
                let mut out = serde_json::to_vec_pretty(&trail)
                    .map_err(|e| AppError::internal(&format!("JSON render failed: {}", e)))?;
                out.push(b'\n');
                out
            }
            ExportFormat::Csv => render_case_csv(&children, &resolved, &generated_at)?,
            ExportFormat::Pdf => render_pdf(&case_lines(&children, &resolved, &generated_at)),
        };

        info!(case_id = %case_id, format = format.extension(), size = bytes.len(), "Case audit trail exported");
        metrics::counter!("exports.case_audit_trail").increment(1);

        self.ledger_service
            .record_action(
                TrustAction::CaseExport,
                caller,
                "investigation_case",
                Some(case_id),
                Some(serde_json::json!({ "format": format.extension() })),
            )
            .await;

        Ok(ExportDocument {
            filename: format!("{}.{}", children.case.case_number, format.extension()),
            content_type: format.content_type(),
            bytes,
        })
    }

    /// 逐条实时解析证据指向的账本记录
    /// 解析失败（记录同期被清理）不让导出失败，留空并告警
    async fn resolve_evidence(
        &self,
        evidence: &[CaseEvidence],
    ) -> Result<Vec<Option<serde_json::Value>>, AppError> {
        let ledger = LedgerRepository::new(self.db.clone());
        let mut resolved = Vec::with_capacity(evidence.len());

        for item in evidence {
            if !item.evidence_type.resolves_against_ledger() {
                resolved.push(None);
                continue;
            }
            let table = match item.evidence_type {
                EvidenceType::AuditLog => LedgerTable::AuditLogEntries,
                EvidenceType::Session => LedgerTable::Sessions,
                EvidenceType::LoginAttempt => LedgerTable::LoginAttempts,
                EvidenceType::PasswordChange => LedgerTable::PasswordChanges,
                EvidenceType::File | EvidenceType::Other => continue,
            };
            match ledger.fetch_record_json(table, item.evidence_id).await {
                Ok(record) => {
                    if record.is_none() {
                        warn!(evidence_id = %item.evidence_id, "Linked ledger record no longer resolvable");
                    }
                    resolved.push(record);
                }
                Err(e) => {
                    warn!(evidence_id = %item.evidence_id, error = %e, "Evidence resolution failed");
                    resolved.push(None);
                }
            }
        }

        Ok(resolved)
    }

    // ==================== 账本区段流式导出 ====================

    /// 流式导出审计账本区段到 HTTP 响应体
    /// 逐页拉取，页间检查取消标志；接收端关闭即停止生产
    #[instrument(skip(self, caller, filters, tx, cancel))]
    pub async fn stream_audit_entries(
        &self,
        caller: &AuthContext,
        filters: AuditLogFilters,
        format: ExportFormat,
        tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
        cancel: watch::Receiver<bool>,
    ) -> Result<u64, AppError> {
        if format == ExportFormat::Pdf {
            return Err(AppError::validation(
                "pdf export is only supported for case audit trails",
            ));
        }

        let mut sink = ChannelSink { tx };
        let count = self
            .drive_audit_export(caller, filters, format, &mut sink, cancel)
            .await?;

        metrics::counter!("exports.ledger_stream").increment(1);
        Ok(count)
    }

    /// 导出审计账本区段到文件
    /// 先写 `*.tmp` 再原子重命名；取消时删除半成品并返回 Cancelled
    #[instrument(skip(self, caller, filters, cancel))]
    pub async fn export_audit_entries_to_file(
        &self,
        caller: &AuthContext,
        filters: AuditLogFilters,
        format: ExportFormat,
        path: &Path,
        cancel: watch::Receiver<bool>,
    ) -> Result<u64, AppError> {
        if format == ExportFormat::Pdf {
            return Err(AppError::validation(
                "pdf export is only supported for case audit trails",
            ));
        }

        let tmp_path = path.with_extension(format!("{}.tmp", format.extension()));
        let file = fs::File::create(&tmp_path)
            .await
            .map_err(|e| AppError::internal(&format!("cannot create export file: {}", e)))?;
        let mut sink = FileSink { file };

        let result = self
            .drive_audit_export(caller, filters, format, &mut sink, cancel)
            .await;

        match result {
            Ok(count) => {
                sink.file
                    .flush()
                    .await
                    .map_err(|e| AppError::internal(&format!("export flush failed: {}", e)))?;
                fs::rename(&tmp_path, path)
                    .await
                    .map_err(|e| AppError::internal(&format!("export rename failed: {}", e)))?;
                info!(path = %path.display(), records = count, "Ledger export written");
                Ok(count)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&tmp_path).await {
                    warn!(path = %tmp_path.display(), error = %cleanup, "Stale export tmp file left behind");
                }
                Err(e)
            }
        }
    }

    /// 分页驱动循环，两种出口（channel / 文件）共用
    async fn drive_audit_export(
        &self,
        caller: &AuthContext,
        filters: AuditLogFilters,
        format: ExportFormat,
        sink: &mut dyn ExportSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<u64, AppError> {
        let generated_at = rfc3339(Utc::now());

        sink.write(match format {
            ExportFormat::Csv => csv_export_header(&generated_at)?,
            ExportFormat::Json => {
                format!("{{\"generated_at\":\"{}\",\"records\":[", generated_at).into_bytes()
            }
            ExportFormat::Pdf => unreachable!("rejected before the page loop"),
        })
        .await?;

        let mut offset = 0i64;
        let mut count = 0u64;
        let mut first = true;

        loop {
            if *cancel.borrow() {
                return Err(AppError::cancelled("export cancelled by caller"));
            }

            let remaining = self.config.max_records - count as i64;
            if remaining <= 0 {
                warn!(max_records = self.config.max_records, "Export truncated at record cap");
                break;
            }

            let page = Pagination {
                limit: self.config.page_size.min(remaining),
                offset,
            };
            let entries = self
                .ledger_service
                .export_audit_entries(caller, filters.clone(), page)
                .await?;
            if entries.is_empty() {
                break;
            }

            let chunk = match format {
                ExportFormat::Csv => encode_page_csv(&entries)?,
                ExportFormat::Json => encode_page_json(&entries, &mut first)?,
                ExportFormat::Pdf => unreachable!(),
            };
            sink.write(chunk).await?;

            count += entries.len() as u64;
            offset += entries.len() as i64;
        }

        if format == ExportFormat::Json {
            sink.write(format!("],\"count\":{}}}\n", count).into_bytes())
                .await?;
        }

        self.ledger_service
            .record_action(
                TrustAction::LedgerExport,
                caller,
                "audit_log_entries",
                None,
                Some(serde_json::json!({ "format": format.extension(), "count": count })),
            )
            .await;

        Ok(count)
    }
}

// ==================== 导出出口 ====================

#[async_trait::async_trait]
trait ExportSink: Send {
    async fn write(&mut self, chunk: Vec<u8>) -> Result<(), AppError>;
}

struct ChannelSink {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

#[async_trait::async_trait]
impl ExportSink for ChannelSink {
    async fn write(&mut self, chunk: Vec<u8>) -> Result<(), AppError> {
        self.tx
            .send(Ok(Bytes::from(chunk)))
            .await
            .map_err(|_| AppError::cancelled("export consumer disconnected"))
    }
}

struct FileSink {
    file: fs::File,
}

#[async_trait::async_trait]
impl ExportSink for FileSink {
    async fn write(&mut self, chunk: Vec<u8>) -> Result<(), AppError> {
        self.file
            .write_all(&chunk)
            .await
            .map_err(|e| AppError::internal(&format!("export write failed: {}", e)))
    }
}

// ==================== 编码 ====================

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt<T: ToString>(value: &Option<T>) -> String {
    value.as_ref().map(|v| v.to_string()).unwrap_or_default()
}

const AUDIT_CSV_COLUMNS: [&str; 13] = [
    "id",
    "created_at",
    "action",
    "resource_type",
    "resource_id",
    "user_id",
    "tenant_id",
    "severity",
    "tags",
    "ip_address",
    "user_agent",
    "request_id",
    "details",
];

/// 区段导出的 CSV 头：generated_at 单列一行，之后是固定列头
fn csv_export_header(generated_at: &str) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    writer
        .write_record(["generated_at", generated_at])
        .and_then(|_| writer.write_record(AUDIT_CSV_COLUMNS))
        .map_err(csv_error)?;
    writer.into_inner().map_err(|e| csv_error(e.into_error().into()))
}

fn encode_page_csv(entries: &[AuditLogEntry]) -> Result<Vec<u8>, AppError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for entry in entries {
        writer
            .write_record([
                entry.id.to_string(),
                rfc3339(entry.created_at),
                entry.action.clone(),
                opt(&entry.resource_type),
                opt(&entry.resource_id),
                opt(&entry.user_id),
                opt(&entry.tenant_id),
                entry.severity.as_str().to_string(),
                entry.tags.join(";"),
                opt(&entry.ip_address),
                opt(&entry.user_agent),
                opt(&entry.request_id),
                entry
                    .details
                    .as_ref()
                    .map(|d| d.to_string())
                    .unwrap_or_default(),
            ])
            .map_err(csv_error)?;
    }
    writer.into_inner().map_err(|e| csv_error(e.into_error().into()))
}

fn encode_page_json(entries: &[AuditLogEntry], first: &mut bool) -> Result<Vec<u8>, AppError> {
    let mut out = Vec::new();
    for entry in entries {
        if *first {
            *first = false;
        } else {
            out.push(b',');
        }
        let record = serde_json::to_vec(entry)
            .map_err(|e| AppError::internal(&format!("JSON render failed: {}", e)))?;
        out.extend_from_slice(&record);
    }
    Ok(out)
}

fn csv_error(e: csv::Error) -> AppError {
    AppError::internal(&format!("CSV render failed: {}", e))
}

// ==================== 案件渲染 ====================

/// 案件审计链的 CSV 形态：分节平铺，节内时间序
fn render_case_csv(
    children: &CaseWithChildren,
    resolved: &[Option<serde_json::Value>],
    generated_at: &str,
) -> Result<Vec<u8>, AppError> {
    let case = &children.case;
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    let result = (|| -> Result<(), csv::Error> {
        writer.write_record(["generated_at", generated_at])?;

        writer.write_record(["section", "case"])?;
        writer.write_record([
            "case_number",
            "title",
            "status",
            "priority_and_type",
            "related_user_id",
            "related_tenant_id",
            "assigned_to",
            "opened_at",
            "investigated_at",
            "resolved_at",
            "closed_at",
            "resolution",
        ])?;
        writer.write_record([
            case.case_number.clone(),
            case.title.clone(),
            case.status.as_str().to_string(),
            format!("{:?}/{:?}", case.priority, case.case_type).to_lowercase(),
            opt(&case.related_user_id),
            opt(&case.related_tenant_id),
            opt(&case.assigned_to),
            rfc3339(case.opened_at),
            case.investigated_at.map(rfc3339).unwrap_or_default(),
            case.resolved_at.map(rfc3339).unwrap_or_default(),
            case.closed_at.map(rfc3339).unwrap_or_default(),
            case.resolution.clone().unwrap_or_default(),
        ])?;

        writer.write_record(["section", "notes"])?;
        writer.write_record(["created_at", "note_type", "created_by", "note"])?;
        for note in &children.notes {
            writer.write_record([
                rfc3339(note.created_at),
                format!("{:?}", note.note_type).to_lowercase(),
                note.created_by.to_string(),
                note.note.clone(),
            ])?;
        }

        writer.write_record(["section", "evidence"])?;
        writer.write_record([
            "added_at",
            "evidence_type",
            "evidence_id",
            "added_by",
            "description",
            "resolved_record",
        ])?;
        for (evidence, record) in children.evidence.iter().zip(resolved) {
            writer.write_record([
                rfc3339(evidence.added_at),
                format!("{:?}", evidence.evidence_type).to_lowercase(),
                evidence.evidence_id.to_string(),
                evidence.added_by.to_string(),
                evidence.description.clone().unwrap_or_default(),
                record.as_ref().map(|r| r.to_string()).unwrap_or_default(),
            ])?;
        }

        Ok(())
    })();
    result.map_err(csv_error)?;

    writer.into_inner().map_err(|e| csv_error(e.into_error().into()))
}

/// 案件审计链的文本行形态（PDF 用）
fn case_lines(
    children: &CaseWithChildren,
    resolved: &[Option<serde_json::Value>],
    generated_at: &str,
) -> Vec<String> {
    let case = &children.case;
    let mut lines = vec![
        format!("Audit trail for case {}", case.case_number),
        format!("Generated at: {}", generated_at),
        String::new(),
        format!("Title: {}", case.title),
        format!("Status: {}", case.status),
        format!("Opened at: {}", rfc3339(case.opened_at)),
    ];
    if let Some(resolution) = &case.resolution {
        lines.push(format!("Resolution: {}", resolution));
    }

    lines.push(String::new());
    lines.push(format!("Notes ({})", children.notes.len()));
    for note in &children.notes {
        lines.push(format!(
            "  {} [{:?}] {}",
            rfc3339(note.created_at),
            note.note_type,
            note.note
        ));
    }

    lines.push(String::new());
    lines.push(format!("Evidence ({})", children.evidence.len()));
    for (evidence, record) in children.evidence.iter().zip(resolved) {
        lines.push(format!(
            "  {} [{:?}] {} {}",
            rfc3339(evidence.added_at),
            evidence.evidence_type,
            evidence.evidence_id,
            if record.is_some() {
                "(resolved)"
            } else {
                "(unresolved)"
            }
        ));
    }

    lines
}

// ==================== PDF ====================
// 最小的确定性 PDF 1.4 写出器：单字体、固定行距、正确的 xref 表。
// 输入相同则输出逐字节相同。

const PDF_LINES_PER_PAGE: usize = 54;

fn render_pdf(lines: &[String]) -> Vec<u8> {
    let pages: Vec<&[String]> = if lines.is_empty() {
        vec![&[]]
    } else {
        lines.chunks(PDF_LINES_PER_PAGE).collect()
    };

    // 对象布局：1 Catalog, 2 Pages, 3 Font, 然后每页两个对象（Page, Contents）
    let total_objects = 3 + pages.len() * 2;
    let mut objects: Vec<Vec<u8>> = Vec::with_capacity(total_objects);

    let kids: Vec<String> = (0..pages.len())
        .map(|i| format!("{} 0 R", 4 + i * 2))
        .collect();

    objects.push(b"<< /Type /Catalog /Pages 2 0 R >>".to_vec());
    objects.push(
        format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids.join(" "),
            pages.len()
        )
        .into_bytes(),
    );
    objects.push(b"<< /Type /Font /Subtype /Type1 /BaseFont /Helvetica >>".to_vec());

    for (i, page_lines) in pages.iter().enumerate() {
        let contents_ref = 5 + i * 2;
        objects.push(
            format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] \
                 /Resources << /Font << /F1 3 0 R >> >> /Contents {} 0 R >>",
                contents_ref
            )
            .into_bytes(),
        );

        let mut text = String::from("BT /F1 10 Tf 36 756 Td 13 TL\n");
        for line in page_lines.iter() {
            text.push_str(&format!("({}) Tj T*\n", escape_pdf_text(line)));
        }
        text.push_str("ET");

        objects.push(
            format!("<< /Length {} >>\nstream\n{}\nendstream", text.len(), text).into_bytes(),
        );
    }

    let mut out = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::with_capacity(objects.len());

    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n", i + 1).as_bytes());
        out.extend_from_slice(body);
        out.extend_from_slice(b"\nendobj\n");
    }

    let xref_offset = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            xref_offset
        )
        .as_bytes(),
    );

    out
}

/// PDF 字符串字面量转义；非 ASCII 字符以八进制写出
fn escape_pdf_text(line: &str) -> String {
    let mut escaped = String::with_capacity(line.len());
    for byte in line.bytes() {
        match byte {
            b'(' => escaped.push_str("\\("),
            b')' => escaped.push_str("\\)"),
            b'\\' => escaped.push_str("\\\\"),
            0x20..=0x7e => escaped.push(byte as char),
            _ => escaped.push_str(&format!("\\{:03o}", byte)),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_pdf_output_is_deterministic() {
        let lines = vec!["Audit trail for case CASE-20260815-0001".to_string()];
        assert_eq!(render_pdf(&lines), render_pdf(&lines));
    }

    #[test]
    fn test_pdf_structure_markers() {
        let out = render_pdf(&["hello".to_string()]);
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("%PDF-1.4"));
        assert!(text.contains("/Type /Catalog"));
        assert!(text.contains("xref"));
        assert!(text.trim_end().ends_with("%%EOF"));
    }

    #[test]
    fn test_pdf_text_escaping() {
        assert_eq!(escape_pdf_text("a(b)c\\d"), "a\\(b\\)c\\\\d");
        assert_eq!(escape_pdf_text("naïve"), "na\\303\\257ve");
    }

    #[test]
    fn test_csv_page_encoding_has_stable_columns() {
        let header = csv_export_header("2026-08-29T00:00:00.000000Z").unwrap();
        let text = String::from_utf8(header).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), "generated_at,2026-08-29T00:00:00.000000Z");
        assert!(lines.next().unwrap().starts_with("id,created_at,action"));
    }

    #[test]
    fn test_csv_page_rows_render() {
        let entry = AuditLogEntry {
            id: Uuid::nil(),
            action: "session.revoke".to_string(),
            resource_type: Some("session".to_string()),
            resource_id: None,
            user_id: None,
            tenant_id: None,
            severity: crate::models::ledger::AuditSeverity::Warning,
            tags: vec!["security".to_string(), "session".to_string()],
            ip_address: None,
            user_agent: None,
            request_id: None,
            details: None,
            created_at: Utc.with_ymd_and_hms(2026, 8, 15, 12, 0, 0).unwrap(),
        };

        let page = encode_page_csv(std::slice::from_ref(&entry)).unwrap();
        let text = String::from_utf8(page).unwrap();
        assert!(text.contains("session.revoke"));
        assert!(text.contains("warning"));
        assert!(text.contains("security;session"));
    }

    #[test]
    fn test_json_page_separators() {
        let entry = AuditLogEntry {
            id: Uuid::nil(),
            action: "case.create".to_string(),
            resource_type: None,
            resource_id: None,
            user_id: None,
            tenant_id: None,
            severity: crate::models::ledger::AuditSeverity::Info,
            tags: vec![],
            ip_address: None,
            user_agent: None,
            request_id: None,
            details: None,
            created_at: Utc::now(),
        };

        let mut first = true;
        let page1 = encode_page_json(std::slice::from_ref(&entry), &mut first).unwrap();
        let page2 = encode_page_json(std::slice::from_ref(&entry), &mut first).unwrap();
        assert!(!page1.starts_with(b","));
        assert!(page2.starts_with(b","));
    }

    #[test]
    fn test_export_format_wire_names() {
        assert_eq!(
            serde_json::from_str::<ExportFormat>(r#""pdf""#).unwrap(),
            ExportFormat::Pdf
        );
        assert_eq!(ExportFormat::Csv.extension(), "csv");
    }
}
