//! Pipeline jobs, their stage units and the status view built from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::content::{InputRef, Stage, StageId, TokenUsage};
use super::document::Document;
use crate::errors::AppError;

/// Job lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Partial => "partial",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Partial | JobState::Cancelled
        )
    }

    /// Allowed edges of the job state machine
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Pending, JobState::Running) => true,
            (JobState::Pending, JobState::Cancelled) => true,
            (JobState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "partial" => Ok(JobState::Partial),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(AppError::InvalidFormat {
                message: format!("unknown job state '{}'", other),
            }),
        }
    }
}

/// What a dependent unit does when some of its inputs failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Any failed input fails the dependent with a missing-dependency error
    #[default]
    RequireAll,
    /// Run on the inputs that succeeded, as long as there is at least one
    ProceedWithAvailable,
}

impl DependencyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyPolicy::RequireAll => "require_all",
            DependencyPolicy::ProceedWithAvailable => "proceed_with_available",
        }
    }
}

impl FromStr for DependencyPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "require_all" => Ok(DependencyPolicy::RequireAll),
            "proceed_with_available" => Ok(DependencyPolicy::ProceedWithAvailable),
            other => Err(AppError::InvalidFormat {
                message: format!("unknown dependency policy '{}'", other),
            }),
        }
    }
}

/// The companies, document types and periods a job covers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobScope {
    pub companies: Vec<String>,
    /// Empty means every document type
    #[serde(default)]
    pub document_types: Vec<String>,
    #[serde(default)]
    pub period_from: Option<i32>,
    #[serde(default)]
    pub period_to: Option<i32>,
    /// When set, one brief covers every company in the scope
    #[serde(default)]
    pub group: Option<String>,
}

impl JobScope {
    pub fn company(company: impl Into<String>) -> Self {
        Self {
            companies: vec![company.into()],
            ..Default::default()
        }
    }

    pub fn years(mut self, from: i32, to: i32) -> Self {
        self.period_from = Some(from);
        self.period_to = Some(to);
        self
    }

    pub fn document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_types.push(document_type.into());
        self
    }

    pub fn grouped(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Whether a document falls inside this scope
    pub fn matches(&self, doc: &Document) -> bool {
        if !self.companies.iter().any(|c| c.eq_ignore_ascii_case(&doc.company_ref)) {
            return false;
        }
        if !self.document_types.is_empty()
            && !self.document_types.iter().any(|t| t == &doc.document_type)
        {
            return false;
        }
        if self.period_from.is_none() && self.period_to.is_none() {
            return true;
        }
        match doc.fiscal_year() {
            Some(year) => {
                self.period_from.map_or(true, |from| year >= from)
                    && self.period_to.map_or(true, |to| year <= to)
            }
            None => false,
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.companies.iter().all(|c| c.trim().is_empty()) {
            return Err(AppError::Validation {
                message: "scope must name at least one company".into(),
                field: Some("companies".into()),
            });
        }
        if let (Some(from), Some(to)) = (self.period_from, self.period_to) {
            if from > to {
                return Err(AppError::Validation {
                    message: format!("period_from {} is after period_to {}", from, to),
                    field: Some("period_from".into()),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for JobScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.companies.join(","))?;
        if let Some(group) = &self.group {
            write!(f, " as {}", group)?;
        }
        if !self.document_types.is_empty() {
            write!(f, " [{}]", self.document_types.join(","))?;
        }
        match (self.period_from, self.period_to) {
            (Some(from), Some(to)) => write!(f, " {}..={}", from, to),
            (Some(from), None) => write!(f, " {}..", from),
            (None, Some(to)) => write!(f, " ..={}", to),
            (None, None) => Ok(()),
        }
    }
}

/// A tracked unit of orchestration work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: Uuid,
    pub scope: JobScope,
    pub state: JobState,
    pub policy: DependencyPolicy,
    pub cancel_requested: bool,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineJob {
    pub fn new(scope: JobScope, policy: DependencyPolicy) -> Self {
        Self {
            id: Uuid::now_v7(),
            scope,
            state: JobState::Pending,
            policy,
            cancel_requested: false,
            error_detail: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Apply the timestamps that accompany a state change
    pub fn stamp_transition(&mut self, next: JobState, detail: Option<String>) {
        let now = Utc::now();
        self.state = next;
        if next == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        if detail.is_some() {
            self.error_detail = detail;
        }
    }
}

/// State of one stage unit inside a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Not dispatched yet; dependencies may still be unresolved
    Waiting,
    Running,
    Succeeded,
    Failed,
    /// Never dispatched because the job was cancelled
    Skipped,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Waiting => "waiting",
            UnitState::Running => "running",
            UnitState::Succeeded => "succeeded",
            UnitState::Failed => "failed",
            UnitState::Skipped => "skipped",
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, UnitState::Succeeded | UnitState::Failed | UnitState::Skipped)
    }
}

impl FromStr for UnitState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(UnitState::Waiting),
            "running" => Ok(UnitState::Running),
            "succeeded" => Ok(UnitState::Succeeded),
            "failed" => Ok(UnitState::Failed),
            "skipped" => Ok(UnitState::Skipped),
            other => Err(AppError::InvalidFormat {
                message: format!("unknown unit state '{}'", other),
            }),
        }
    }
}

/// One generation step scheduled by a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageUnit {
    pub id: Uuid,
    pub job_id: Uuid,
    pub stage: StageId,
    pub company_ref: String,
    pub document_type: Option<String>,
    pub period_refs: Vec<String>,
    /// Units whose outputs feed this one
    pub depends_on: Vec<Uuid>,
    /// Resolved inputs; filled for dependents when they are dispatched
    pub inputs: Vec<InputRef>,
    pub state: UnitState,
    pub fingerprint: Option<String>,
    pub content_id: Option<Uuid>,
    /// Served from the generation cache without a completion call
    pub cached: bool,
    pub attempts: u32,
    /// Tokens this unit paid for, including output that lost an insert
    /// race or failed the quality check
    #[serde(default)]
    pub spent: TokenUsage,
    pub warning: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StageUnit {
    pub fn new(job_id: Uuid, stage: StageId, company_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            job_id,
            stage,
            company_ref: company_ref.into(),
            document_type: None,
            period_refs: Vec::new(),
            depends_on: Vec::new(),
            inputs: Vec::new(),
            state: UnitState::Waiting,
            fingerprint: None,
            content_id: None,
            cached: false,
            attempts: 0,
            spent: TokenUsage::default(),
            warning: None,
            error_kind: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The source document of a stage-1 unit
    pub fn source_document(&self) -> Option<Uuid> {
        match (self.stage.stage, self.inputs.first()) {
            (Stage::DocumentSummary, Some(InputRef::Document(id))) => Some(*id),
            _ => None,
        }
    }
}

/// Unit counts for one stage of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    pub stage: Stage,
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cached: usize,
    pub warnings: usize,
}

impl StageProgress {
    fn empty(stage: Stage) -> Self {
        Self {
            stage,
            total: 0,
            pending: 0,
            running: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            cached: 0,
            warnings: 0,
        }
    }
}

/// A failed unit, attributable to its company, periods and source document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitFailure {
    pub unit_id: Uuid,
    pub stage: StageId,
    pub company_ref: String,
    pub document_type: Option<String>,
    pub period_refs: Vec<String>,
    pub document_id: Option<Uuid>,
    pub error_kind: String,
    pub message: String,
}

/// Job plus granular per-stage progress, the surface clients poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job: PipelineJob,
    pub stages: Vec<StageProgress>,
    pub failures: Vec<UnitFailure>,
}

impl JobStatus {
    pub fn from_units(job: PipelineJob, units: &[StageUnit]) -> Self {
        let mut stages: Vec<StageProgress> =
            Stage::ALL.iter().map(|s| StageProgress::empty(*s)).collect();
        let mut failures = Vec::new();

        for unit in units {
            let progress = &mut stages[(unit.stage.stage.ordinal() - 1) as usize];
            progress.total += 1;
            match unit.state {
                UnitState::Waiting => progress.pending += 1,
                UnitState::Running => progress.running += 1,
                UnitState::Succeeded => progress.succeeded += 1,
                UnitState::Failed => progress.failed += 1,
                UnitState::Skipped => progress.skipped += 1,
            }
            if unit.cached {
                progress.cached += 1;
            }
            if unit.warning.is_some() {
                progress.warnings += 1;
            }
            if unit.state == UnitState::Failed {
                failures.push(UnitFailure {
                    unit_id: unit.id,
                    stage: unit.stage,
                    company_ref: unit.company_ref.clone(),
                    document_type: unit.document_type.clone(),
                    period_refs: unit.period_refs.clone(),
                    document_id: unit.source_document(),
                    error_kind: unit.error_kind.clone().unwrap_or_else(|| "unknown".into()),
                    message: unit.error_message.clone().unwrap_or_default(),
                });
            }
        }

        Self {
            job,
            stages,
            failures,
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageProgress {
        &self.stages[(stage.ordinal() - 1) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        assert!(JobState::Pending.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Partial));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Pending.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Running));
        assert!(!JobState::Running.can_transition_to(JobState::Pending));
    }

    #[test]
    fn test_scope_matching() {
        let scope = JobScope::company("acme").years(2022, 2023).document_type("risk_factors");
        let inside = Document::new("ACME", "2023", "risk_factors", "x");
        let wrong_year = Document::new("ACME", "2021", "risk_factors", "x");
        let wrong_type = Document::new("ACME", "2023", "mdna", "x");
        let wrong_company = Document::new("GLOBEX", "2023", "risk_factors", "x");

        assert!(scope.matches(&inside));
        assert!(!scope.matches(&wrong_year));
        assert!(!scope.matches(&wrong_type));
        assert!(!scope.matches(&wrong_company));
    }

    #[test]
    fn test_scope_validation() {
        assert!(JobScope::default().validate().is_err());
        assert!(JobScope::company("ACME").years(2024, 2022).validate().is_err());
        assert!(JobScope::company("ACME").years(2022, 2024).validate().is_ok());
    }

    #[test]
    fn test_status_counts_and_failures() {
        let job = PipelineJob::new(JobScope::company("ACME"), DependencyPolicy::RequireAll);
        let doc_id = Uuid::new_v4();

        let mut ok = StageUnit::new(job.id, StageId::full(Stage::DocumentSummary), "ACME");
        ok.state = UnitState::Succeeded;
        ok.cached = true;

        let mut failed = StageUnit::new(job.id, StageId::full(Stage::DocumentSummary), "ACME");
        failed.inputs = vec![InputRef::Document(doc_id)];
        failed.state = UnitState::Failed;
        failed.error_kind = Some("transient".into());

        let waiting = StageUnit::new(job.id, StageId::full(Stage::PeriodAggregate), "ACME");

        let status = JobStatus::from_units(job, &[ok, failed, waiting]);
        let stage1 = status.stage(Stage::DocumentSummary);
        assert_eq!((stage1.total, stage1.succeeded, stage1.failed, stage1.cached), (2, 1, 1, 1));
        assert_eq!(status.stage(Stage::PeriodAggregate).pending, 1);
        assert_eq!(status.failures.len(), 1);
        assert_eq!(status.failures[0].document_id, Some(doc_id));
    }
}
