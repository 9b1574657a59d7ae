//! Generated content and the identifiers it is addressed by

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;

/// The three ordered generation steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Stage 1: one summary per source document
    DocumentSummary,
    /// Stage 2: one document type for one company across periods
    PeriodAggregate,
    /// Stage 3: short brief for a company or company group
    Brief,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::DocumentSummary, Stage::PeriodAggregate, Stage::Brief];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DocumentSummary => "document_summary",
            Stage::PeriodAggregate => "period_aggregate",
            Stage::Brief => "brief",
        }
    }

    /// 1-based position in the pipeline
    pub fn ordinal(&self) -> u8 {
        match self {
            Stage::DocumentSummary => 1,
            Stage::PeriodAggregate => 2,
            Stage::Brief => 3,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "document_summary" => Ok(Stage::DocumentSummary),
            "period_aggregate" => Ok(Stage::PeriodAggregate),
            "brief" => Ok(Stage::Brief),
            other => Err(AppError::InvalidFormat {
                message: format!("unknown stage '{}'", other),
            }),
        }
    }
}

/// Which configuration path a unit takes through its stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    #[default]
    Full,
    /// Abbreviated configuration for short inputs
    SinglePass,
}

/// Stage plus route. Its string form is part of every fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StageId {
    pub stage: Stage,
    pub route: Route,
}

impl StageId {
    pub const fn full(stage: Stage) -> Self {
        Self {
            stage,
            route: Route::Full,
        }
    }

    pub const fn single_pass(stage: Stage) -> Self {
        Self {
            stage,
            route: Route::SinglePass,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.route {
            Route::Full => write!(f, "{}", self.stage),
            Route::SinglePass => write!(f, "{}.single_pass", self.stage),
        }
    }
}

impl FromStr for StageId {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            None => Ok(StageId::full(s.parse()?)),
            Some((stage, "single_pass")) => Ok(StageId::single_pass(stage.parse()?)),
            Some((_, route)) => Err(AppError::InvalidFormat {
                message: format!("unknown route '{}'", route),
            }),
        }
    }
}

impl From<StageId> for String {
    fn from(id: StageId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for StageId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Reference to an input of a generation step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum InputRef {
    Document(Uuid),
    Content(Uuid),
}

impl InputRef {
    pub fn id(&self) -> Uuid {
        match self {
            InputRef::Document(id) | InputRef::Content(id) => *id,
        }
    }

    pub fn is_document(&self) -> bool {
        matches!(self, InputRef::Document(_))
    }
}

impl fmt::Display for InputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputRef::Document(id) => write!(f, "doc:{}", id),
            InputRef::Content(id) => write!(f, "gen:{}", id),
        }
    }
}

impl FromStr for InputRef {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || AppError::InvalidFormat {
            message: format!("invalid input reference '{}'", s),
        };
        let (kind, raw) = s.split_once(':').ok_or_else(invalid)?;
        let id = Uuid::parse_str(raw).map_err(|_| invalid())?;
        match kind {
            "doc" => Ok(InputRef::Document(id)),
            "gen" => Ok(InputRef::Content(id)),
            _ => Err(invalid()),
        }
    }
}

impl From<InputRef> for String {
    fn from(r: InputRef) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for InputRef {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Deterministic identity of a generation request (64 lowercase hex chars)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap an already computed hex digest, validating its shape
    pub fn from_hex(hex_digest: impl Into<String>) -> Result<Self, AppError> {
        let s = hex_digest.into();
        if s.len() != 64 || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(AppError::InvalidFormat {
                message: format!("invalid fingerprint '{}'", s),
            });
        }
        Ok(Self(s))
    }

    /// Encode a raw SHA-256 digest
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input/output token counts reported by the completion service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

/// One stored generation result. Write-once, unique by fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub stage: StageId,
    pub company_ref: String,
    pub document_type: Option<String>,
    pub period_refs: Vec<String>,
    /// Ordered inputs; the provenance edges of this row
    pub inputs: Vec<InputRef>,
    pub model_config_id: String,
    pub system_prompt_id: String,
    pub user_prompt_id: String,
    pub text: String,
    pub summary: String,
    pub usage: TokenUsage,
    pub warning: Option<String>,
    /// Set when the stored output was rejected by the quality check
    pub error_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl GeneratedContent {
    pub fn is_usable(&self) -> bool {
        self.error_state.is_none()
    }
}

/// Everything needed to persist a new row; the store assigns id and timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewGeneratedContent {
    pub fingerprint: Fingerprint,
    pub stage: StageId,
    pub company_ref: String,
    pub document_type: Option<String>,
    pub period_refs: Vec<String>,
    pub inputs: Vec<InputRef>,
    pub model_config_id: String,
    pub system_prompt_id: String,
    pub user_prompt_id: String,
    pub text: String,
    pub summary: String,
    pub usage: TokenUsage,
    pub warning: Option<String>,
    pub error_state: Option<String>,
}

impl NewGeneratedContent {
    pub fn into_content(self, id: Uuid, created_at: DateTime<Utc>) -> GeneratedContent {
        GeneratedContent {
            id,
            fingerprint: self.fingerprint,
            stage: self.stage,
            company_ref: self.company_ref,
            document_type: self.document_type,
            period_refs: self.period_refs,
            inputs: self.inputs,
            model_config_id: self.model_config_id,
            system_prompt_id: self.system_prompt_id,
            user_prompt_id: self.user_prompt_id,
            text: self.text,
            summary: self.summary,
            usage: self.usage,
            warning: self.warning,
            error_state: self.error_state,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_id_round_trip_through_string() {
        let id = StageId::single_pass(Stage::DocumentSummary);
        assert_eq!(id.to_string(), "document_summary.single_pass");
        assert_eq!("document_summary.single_pass".parse::<StageId>().unwrap(), id);
        assert_eq!("brief".parse::<StageId>().unwrap(), StageId::full(Stage::Brief));
        assert!("brief.turbo".parse::<StageId>().is_err());
    }

    #[test]
    fn test_input_ref_parsing() {
        let id = Uuid::new_v4();
        let parsed: InputRef = format!("gen:{}", id).parse().unwrap();
        assert_eq!(parsed, InputRef::Content(id));
        assert!(!parsed.is_document());
        assert!("file:abc".parse::<InputRef>().is_err());
        assert!("doc:not-a-uuid".parse::<InputRef>().is_err());
    }

    #[test]
    fn test_fingerprint_validation() {
        assert!(Fingerprint::from_hex("a".repeat(64)).is_ok());
        assert!(Fingerprint::from_hex("A".repeat(64)).is_err());
        assert!(Fingerprint::from_hex("abc").is_err());
    }

    #[test]
    fn test_token_usage_sum() {
        let mut usage = TokenUsage {
            input_tokens: 10,
            output_tokens: 2,
        };
        usage += TokenUsage {
            input_tokens: 5,
            output_tokens: 1,
        };
        assert_eq!(usage.total(), 18);
    }
}
