//! JSONL document import
//!
//! One document per line: `company_ref`, `period_ref`, `document_type`,
//! `text` and an optional upstream `id`. Blank lines are ignored. Lines whose
//! id is already stored are counted as duplicates rather than failing the
//! import, so re-running an import is harmless.

use filingforge_common::{types::Document, AppError, PipelineStore};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::WorkerError;

/// One line of an import file
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentRecord {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub company_ref: String,
    pub period_ref: String,
    pub document_type: String,
    pub text: String,
}

impl DocumentRecord {
    fn into_document(self, line: usize) -> Result<Document, WorkerError> {
        for (field, value) in [
            ("company_ref", &self.company_ref),
            ("period_ref", &self.period_ref),
            ("document_type", &self.document_type),
        ] {
            if value.trim().is_empty() {
                return Err(WorkerError::InvalidRecord {
                    line,
                    message: format!("{} is empty", field),
                });
            }
        }
        if self.text.trim().is_empty() {
            return Err(WorkerError::InvalidRecord {
                line,
                message: "text is empty".into(),
            });
        }

        let id = self.id.unwrap_or_else(Uuid::now_v7);
        Ok(Document::with_id(
            id,
            self.company_ref.trim(),
            self.period_ref.trim(),
            self.document_type.trim(),
            self.text,
        ))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
}

/// Read documents line by line and store them.
///
/// Stops at the first malformed line; documents before it stay stored.
#[instrument(skip_all)]
pub async fn import_documents<R>(store: &dyn PipelineStore, reader: R) -> Result<ImportReport, WorkerError>
where
    R: AsyncBufRead + Unpin,
{
    let mut report = ImportReport::default();
    let mut lines = reader.lines();
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: DocumentRecord =
            serde_json::from_str(&line).map_err(|e| WorkerError::InvalidRecord {
                line: line_no,
                message: e.to_string(),
            })?;
        let document = record.into_document(line_no)?;

        match store.insert_document(document).await {
            Ok(doc) => {
                debug!(
                    document_id = %doc.id,
                    company = %doc.company_ref,
                    period = %doc.period_ref,
                    "Document imported"
                );
                report.imported += 1;
            }
            Err(AppError::Duplicate { message }) => {
                debug!(line = line_no, %message, "Skipping duplicate document");
                report.duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    info!(
        imported = report.imported,
        duplicates = report.duplicates,
        "Import finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filingforge_common::types::JobScope;
    use filingforge_common::MemoryStore;

    const FILE: &str = r#"
{"company_ref":"ACME","period_ref":"2023","document_type":"risk_factors","text":"Supply chain exposure rose."}

{"id":"0190a5a4-6f1e-7c3a-9d5b-2f4e8a1c0b77","company_ref":" ACME ","period_ref":"2024","document_type":"risk_factors","text":"New tariffs apply."}
"#;

    #[tokio::test]
    async fn test_import_skips_blank_lines_and_trims_refs() {
        let store = MemoryStore::new();
        let report = import_documents(&store, FILE.as_bytes()).await.unwrap();
        assert_eq!(report, ImportReport { imported: 2, duplicates: 0 });

        let docs = store
            .documents_in_scope(&JobScope::company("ACME"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.company_ref == "ACME"));
    }

    #[tokio::test]
    async fn test_reimport_counts_duplicates() {
        let store = MemoryStore::new();
        import_documents(&store, FILE.as_bytes()).await.unwrap();

        let report = import_documents(&store, FILE.as_bytes()).await.unwrap();
        // only the line with an upstream id can collide
        assert_eq!(report, ImportReport { imported: 1, duplicates: 1 });
    }

    #[tokio::test]
    async fn test_malformed_line_reports_line_number() {
        let store = MemoryStore::new();
        let input = "{\"company_ref\":\"ACME\",\"period_ref\":\"2023\",\"document_type\":\"mdna\",\"text\":\"ok\"}\nnot json\n";

        let err = import_documents(&store, input.as_bytes()).await.unwrap_err();
        assert!(matches!(err, WorkerError::InvalidRecord { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_empty_field_is_rejected() {
        let store = MemoryStore::new();
        let input = r#"{"company_ref":"ACME","period_ref":"","document_type":"mdna","text":"ok"}"#;

        let err = import_documents(&store, input.as_bytes()).await.unwrap_err();
        match err {
            WorkerError::InvalidRecord { line, message } => {
                assert_eq!(line, 1);
                assert!(message.contains("period_ref"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
