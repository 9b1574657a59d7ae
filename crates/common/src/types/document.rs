//! Source documents produced by filing ingestion

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A named section of one filing (e.g. risk factors) for one company and period.
///
/// Documents are written once by ingestion and never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    /// Ticker or other stable company reference
    pub company_ref: String,
    /// Reporting period, e.g. `2023` or `2023-Q2`
    pub period_ref: String,
    /// Section kind, e.g. `risk_factors`
    pub document_type: String,
    pub text: String,
    /// Hex SHA-256 of the normalized text
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Build a document with a fresh id and computed content hash
    pub fn new(
        company_ref: impl Into<String>,
        period_ref: impl Into<String>,
        document_type: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self::with_id(Uuid::now_v7(), company_ref, period_ref, document_type, text)
    }

    /// Build a document keeping an id assigned upstream
    pub fn with_id(
        id: Uuid,
        company_ref: impl Into<String>,
        period_ref: impl Into<String>,
        document_type: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        Self {
            id,
            company_ref: company_ref.into(),
            period_ref: period_ref.into(),
            document_type: document_type.into(),
            content_hash: content_hash(&text),
            text,
            created_at: Utc::now(),
        }
    }

    /// Fiscal year taken from the leading four digits of the period reference
    pub fn fiscal_year(&self) -> Option<i32> {
        self.period_ref.get(..4).and_then(|y| y.parse().ok())
    }

    /// Character length of the raw text
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Collapse all whitespace runs to single spaces and trim the ends
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hash of the normalized text, stable across formatting-only changes
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_ignores_formatting() {
        let a = content_hash("Item 1A.  Risk Factors\n\nWe face  competition.");
        let b = content_hash("  Item 1A. Risk Factors We face competition.  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("Item 1A. Risk Factors We face no competition."));
    }

    #[test]
    fn test_fiscal_year() {
        let doc = Document::new("ACME", "2023-Q2", "risk_factors", "text");
        assert_eq!(doc.fiscal_year(), Some(2023));

        let odd = Document::new("ACME", "FY23", "risk_factors", "text");
        assert_eq!(odd.fiscal_year(), None);
    }
}
