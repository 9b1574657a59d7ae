//! Stage-level failures
//!
//! A `StageError` is recorded on the failing unit and never aborts sibling
//! units. `AppError::DuplicateFingerprint` is resolved inside the executor
//! and never surfaces here.

use filingforge_common::errors::AppError;
use filingforge_common::types::TokenUsage;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Completion service kept failing transiently until attempts ran out
    #[error("completion failed after {attempts} attempts: {message}")]
    Transient { message: String, attempts: u32 },

    /// Completion service rejected the request outright
    #[error("completion rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Output failed the quality check; the rejected row is stored
    #[error("malformed output: {reason}")]
    MalformedOutput {
        reason: String,
        content_id: Option<Uuid>,
        /// Tokens paid for the rejected output
        spent: TokenUsage,
    },

    /// An input could not be resolved
    #[error("missing dependency: {message}")]
    MissingDependency { message: String },

    /// Storage or configuration failure
    #[error(transparent)]
    Store(#[from] AppError),
}

impl StageError {
    /// Stable machine-readable kind, stored on the failed unit
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Transient { .. } => "transient",
            StageError::Rejected { .. } => "rejected",
            StageError::MalformedOutput { .. } => "malformed_output",
            StageError::MissingDependency { .. } => "missing_dependency",
            StageError::Store(_) => "store",
        }
    }

    /// Attempts spent before the failure, where known
    pub fn attempts(&self) -> u32 {
        match self {
            StageError::Transient { attempts, .. } => *attempts,
            StageError::Rejected { .. } => 1,
            _ => 0,
        }
    }

    /// Tokens paid before the failure
    pub fn spent(&self) -> TokenUsage {
        match self {
            StageError::MalformedOutput { spent, .. } => *spent,
            _ => TokenUsage::default(),
        }
    }

    pub fn missing(message: impl Into<String>) -> Self {
        StageError::MissingDependency {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_are_stable() {
        assert_eq!(StageError::missing("x").kind(), "missing_dependency");
        assert_eq!(
            StageError::Transient {
                message: "503".into(),
                attempts: 4
            }
            .attempts(),
            4
        );
        let store: StageError = AppError::Internal {
            message: "boom".into(),
        }
        .into();
        assert_eq!(store.kind(), "store");
    }
}
