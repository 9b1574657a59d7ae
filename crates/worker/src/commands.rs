//! Operator commands

use clap::{Args, Parser, Subcommand};
use filingforge_common::types::{DependencyPolicy, JobScope, JobState, JobStatus};
use filingforge_common::{AppError, PipelineStore};
use filingforge_pipeline::{Orchestrator, UsageReport};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::importer::{import_documents, ImportReport};
use crate::WorkerError;

#[derive(Debug, Parser)]
#[command(name = "worker", version)]
#[command(about = "Import filings and run generation jobs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Import filing documents from a JSONL file
    Import {
        /// One document per line
        path: PathBuf,
    },

    /// Run a generation job to completion
    Run(RunArgs),

    /// Show a job's per-stage progress and failures
    Status { job_id: Uuid },

    /// Token usage for one job, or across all stored content
    Usage { job_id: Option<Uuid> },

    /// Continue jobs a stopped process left unfinished; all of them when
    /// no id is given
    Resume { job_id: Option<Uuid> },
}

#[derive(Debug, Clone, PartialEq, Args)]
pub struct RunArgs {
    /// Company references, comma separated
    #[arg(required = true, value_delimiter = ',')]
    pub companies: Vec<String>,

    /// First fiscal year, inclusive
    #[arg(long)]
    pub from: Option<i32>,

    /// Last fiscal year, inclusive
    #[arg(long)]
    pub to: Option<i32>,

    /// Restrict to a document type; repeatable
    #[arg(long = "type")]
    pub document_types: Vec<String>,

    /// Peer group label carried on the job
    #[arg(long)]
    pub group: Option<String>,

    /// require_all or proceed_with_available
    #[arg(long, value_parser = parse_policy)]
    pub policy: Option<DependencyPolicy>,
}

impl RunArgs {
    /// The validated job scope these arguments describe
    pub fn scope(&self) -> Result<JobScope, AppError> {
        let scope = JobScope {
            companies: self
                .companies
                .iter()
                .map(|c| c.trim())
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
            document_types: self.document_types.clone(),
            period_from: self.from,
            period_to: self.to,
            group: self.group.clone(),
        };
        scope.validate()?;
        Ok(scope)
    }
}

fn parse_policy(raw: &str) -> Result<DependencyPolicy, String> {
    raw.parse().map_err(|e: AppError| e.to_string())
}

/// What a command produced, rendered by `main`
#[derive(Debug)]
pub enum Outcome {
    Imported(ImportReport),
    Job(Box<JobStatus>),
    Usage(UsageReport),
    Recovered(Vec<JobStatus>),
}

impl Outcome {
    /// Non-zero when a job did not complete cleanly
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Job(status) => state_code(status.job.state),
            Outcome::Recovered(statuses) => statuses
                .iter()
                .map(|s| state_code(s.job.state))
                .max()
                .unwrap_or(0),
            _ => 0,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Outcome::Imported(report) => format!(
                "imported {} documents ({} duplicates skipped)",
                report.imported, report.duplicates
            ),
            Outcome::Job(status) => render_status(status),
            Outcome::Usage(report) => render_usage(report),
            Outcome::Recovered(statuses) if statuses.is_empty() => "no unfinished jobs".to_string(),
            Outcome::Recovered(statuses) => statuses
                .iter()
                .map(render_status)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn state_code(state: JobState) -> i32 {
    match state {
        JobState::Completed | JobState::Pending | JobState::Running => 0,
        JobState::Partial => 2,
        JobState::Failed | JobState::Cancelled => 1,
    }
}

fn render_status(status: &JobStatus) -> String {
    let job = &status.job;
    let mut out = format!("job {} [{}] {}\n", job.id, job.state, job.scope);
    if let Some(detail) = &job.error_detail {
        out.push_str(&format!("  detail: {}\n", detail));
    }
    for p in &status.stages {
        out.push_str(&format!(
            "  {:<18} total {:>3}  ok {:>3}  cached {:>3}  failed {:>3}  skipped {:>3}  pending {:>3}",
            p.stage.as_str(),
            p.total,
            p.succeeded,
            p.cached,
            p.failed,
            p.skipped,
            p.pending + p.running,
        ));
        if p.warnings > 0 {
            out.push_str(&format!("  warnings {}", p.warnings));
        }
        out.push('\n');
    }
    for f in &status.failures {
        out.push_str(&format!(
            "  FAILED {} {} {} [{}] {}: {}\n",
            f.stage,
            f.company_ref,
            f.document_type.as_deref().unwrap_or("-"),
            f.period_refs.join(","),
            f.error_kind,
            f.message,
        ));
    }
    out
}

fn render_usage(report: &UsageReport) -> String {
    let mut out = match report.job_id {
        Some(id) => format!("usage for job {}\n", id),
        None => "usage across all generated content\n".to_string(),
    };
    for s in &report.stages {
        out.push_str(&format!(
            "  {:<18} units {:>4}  generated {:>4}  cached {:>4}  failed {:>4}  tokens in {:>8} out {:>8}\n",
            s.stage.as_str(),
            s.units,
            s.generated,
            s.cached,
            s.failed,
            s.input_tokens,
            s.output_tokens,
        ));
    }
    let total = report.total();
    out.push_str(&format!(
        "  total tokens {} ({} in / {} out)",
        total.total(),
        total.input_tokens,
        total.output_tokens
    ));
    out
}

/// Executes commands against one store and orchestrator
pub struct CommandRunner {
    store: Arc<dyn PipelineStore>,
    orchestrator: Orchestrator,
}

impl CommandRunner {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            store: orchestrator.store().clone(),
            orchestrator,
        }
    }

    #[instrument(skip(self))]
    pub async fn execute(&self, command: Command) -> Result<Outcome, WorkerError> {
        match command {
            Command::Import { path } => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .map_err(|source| WorkerError::Open { path, source })?;
                let report = import_documents(self.store.as_ref(), BufReader::new(file)).await?;
                Ok(Outcome::Imported(report))
            }
            Command::Run(args) => {
                let job = self.orchestrator.create_job(args.scope()?, args.policy).await?;
                info!(job_id = %job.id, scope = %job.scope, "Running job to completion");
                let status = self.orchestrator.run_job(job.id).await?;
                Ok(Outcome::Job(Box::new(status)))
            }
            Command::Status { job_id } => {
                let status = self.orchestrator.status(job_id).await?;
                Ok(Outcome::Job(Box::new(status)))
            }
            Command::Usage { job_id: Some(id) } => {
                Ok(Outcome::Usage(UsageReport::for_job(self.store.as_ref(), id).await?))
            }
            Command::Usage { job_id: None } => {
                Ok(Outcome::Usage(UsageReport::by_stage(self.store.as_ref()).await?))
            }
            Command::Resume { job_id: Some(id) } => {
                let status = self.orchestrator.resume_job(id).await?;
                Ok(Outcome::Job(Box::new(status)))
            }
            Command::Resume { job_id: None } => {
                let statuses = self.orchestrator.recover_interrupted().await?;
                Ok(Outcome::Recovered(statuses))
            }
        }
    }
}
