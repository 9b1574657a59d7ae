//! Pipeline orchestrator
//!
//! Drives a job from PENDING to a terminal state:
//! 1. Compare-and-set the job to RUNNING
//! 2. Expand the scope into an execution plan and persist its units
//! 3. Dispatch ready units through a bounded worker pool; a unit is ready
//!    once every dependency is resolved
//! 4. Settle the job as COMPLETED, PARTIAL, FAILED or CANCELLED
//!
//! A job left RUNNING by a stopped process is resumed from its persisted
//! units: resolved units are kept, interrupted ones are dispatched again and
//! find their output in the generation cache if it was stored before the
//! stop. Recovery assumes one process owns the store's running jobs.

use crate::error::StageError;
use crate::executor::{Execution, RetryPolicy, StageExecutor, StageRequest};
use crate::plan::ExecutionPlan;
use crate::quality::QualityPolicy;
use crate::registry::{ConfigRegistry, RoutingPolicy};
use chrono::Utc;
use filingforge_common::config::PipelineConfig;
use filingforge_common::errors::{AppError, Result};
use filingforge_common::llm::CompletionClient;
use filingforge_common::metrics;
use filingforge_common::store::PipelineStore;
use filingforge_common::types::{
    DependencyPolicy, InputRef, JobScope, JobState, JobStatus, PipelineJob, StageUnit, UnitState,
};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// `error_detail` prefix of jobs whose scope matched no documents
pub const SCOPE_EMPTY: &str = "ScopeEmpty";

/// Schedules and tracks pipeline jobs
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn PipelineStore>,
    executor: Arc<StageExecutor>,
    routing: RoutingPolicy,
    worker_pool_size: usize,
    default_policy: DependencyPolicy,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        executor: Arc<StageExecutor>,
        routing: RoutingPolicy,
        worker_pool_size: usize,
        default_policy: DependencyPolicy,
    ) -> Self {
        Self {
            store,
            executor,
            routing,
            worker_pool_size: worker_pool_size.max(1),
            default_policy,
        }
    }

    /// Wire an orchestrator and its executor from pipeline settings
    pub fn from_config(
        store: Arc<dyn PipelineStore>,
        client: Arc<dyn CompletionClient>,
        registry: Arc<ConfigRegistry>,
        config: &PipelineConfig,
    ) -> Self {
        let executor = StageExecutor::new(
            store.clone(),
            client,
            registry,
            QualityPolicy::from_config(config),
            RetryPolicy::from_config(config),
        );
        Self::new(
            store,
            Arc::new(executor),
            RoutingPolicy::from_config(config),
            config.worker_pool_size,
            config.dependency_policy,
        )
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    /// Register a PENDING job for the scope
    pub async fn create_job(&self, scope: JobScope, policy: Option<DependencyPolicy>) -> Result<PipelineJob> {
        scope.validate()?;
        let job = PipelineJob::new(scope, policy.unwrap_or(self.default_policy));
        let job = self.store.create_job(job).await?;
        info!(job_id = %job.id, scope = %job.scope, policy = job.policy.as_str(), "Job created");
        Ok(job)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatus> {
        self.store.job_status(job_id).await
    }

    /// Cancel a job. PENDING jobs are cancelled immediately; RUNNING jobs stop
    /// dispatching new units and let in-flight units finish.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<PipelineJob> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound { id: job_id.to_string() })?;

        match job.state {
            JobState::Pending => {
                match self
                    .store
                    .transition_job(job_id, JobState::Pending, JobState::Cancelled, Some("cancelled before start".into()))
                    .await
                {
                    Ok(job) => {
                        info!(job_id = %job_id, "Pending job cancelled");
                        Ok(job)
                    }
                    // Started in the meantime
                    Err(AppError::InvalidTransition { .. }) => self.store.request_cancel(job_id).await,
                    Err(e) => Err(e),
                }
            }
            JobState::Running => {
                info!(job_id = %job_id, "Cancellation requested");
                self.store.request_cancel(job_id).await
            }
            _ => Ok(job),
        }
    }

    /// Run a PENDING job to its terminal state
    #[instrument(skip(self))]
    pub async fn run_job(&self, job_id: Uuid) -> Result<JobStatus> {
        let job = self
            .store
            .transition_job(job_id, JobState::Pending, JobState::Running, None)
            .await?;
        metrics::record_job_started();
        info!(scope = %job.scope, "Job started");

        let outcome = self.drive(&job).await;
        self.conclude(job_id, outcome).await
    }

    /// Continue a RUNNING job whose process stopped before it settled
    #[instrument(skip(self))]
    pub async fn resume_job(&self, job_id: Uuid) -> Result<JobStatus> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::JobNotFound { id: job_id.to_string() })?;
        if job.state != JobState::Running {
            return Err(AppError::InvalidTransition {
                job_id: job_id.to_string(),
                expected: JobState::Running.to_string(),
                requested: format!("resume (current {})", job.state),
            });
        }
        metrics::record_job_started();
        info!(scope = %job.scope, "Resuming interrupted job");

        let outcome = self.drive_persisted(&job).await;
        self.conclude(job_id, outcome).await
    }

    /// Settle jobs a previous process left behind: RUNNING jobs are resumed,
    /// PENDING jobs are started. Returns the statuses of the jobs it drove.
    pub async fn recover_interrupted(&self) -> Result<Vec<JobStatus>> {
        let running = self.store.jobs_in_state(JobState::Running).await?;
        let pending = self.store.jobs_in_state(JobState::Pending).await?;
        if running.is_empty() && pending.is_empty() {
            return Ok(Vec::new());
        }
        warn!(
            running = running.len(),
            pending = pending.len(),
            "Recovering jobs left unfinished by a previous run"
        );

        let mut recovered = Vec::with_capacity(running.len() + pending.len());
        for job in running {
            match self.resume_job(job.id).await {
                Ok(status) => recovered.push(status),
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to resume job"),
            }
        }
        for job in pending {
            match self.run_job(job.id).await {
                Ok(status) => recovered.push(status),
                // Cancelled or started elsewhere in the meantime
                Err(AppError::InvalidTransition { .. }) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "Failed to start pending job"),
            }
        }
        Ok(recovered)
    }

    /// Record the outcome of driving a RUNNING job
    async fn conclude(&self, job_id: Uuid, outcome: Result<JobState>) -> Result<JobStatus> {
        match outcome {
            Ok(state) => {
                metrics::record_job_finished(state.as_str());
                self.store.job_status(job_id).await
            }
            Err(e) => {
                error!(error = %e, "Job aborted");
                if let Err(settle) = self
                    .store
                    .transition_job(job_id, JobState::Running, JobState::Failed, Some(e.to_string()))
                    .await
                {
                    warn!(error = %settle, "Failed to record job failure");
                }
                metrics::record_job_finished(JobState::Failed.as_str());
                Err(e)
            }
        }
    }

    async fn drive(&self, job: &PipelineJob) -> Result<JobState> {
        let documents = self.store.documents_in_scope(&job.scope).await?;
        if documents.is_empty() {
            let detail = format!("{}: no documents match {}", SCOPE_EMPTY, job.scope);
            warn!(detail = %detail, "Nothing to do");
            self.store
                .transition_job(job.id, JobState::Running, JobState::Failed, Some(detail))
                .await?;
            return Ok(JobState::Failed);
        }

        let plan = ExecutionPlan::build(job, &documents, &self.routing)?;
        self.store.save_units(&plan.units).await?;
        info!(documents = documents.len(), units = plan.len(), "Plan persisted");

        let (units, cancelled) = self.dispatch(job, plan.units).await?;
        self.settle_job(job, &units, cancelled).await
    }

    /// Pick a RUNNING job up from its persisted units
    async fn drive_persisted(&self, job: &PipelineJob) -> Result<JobState> {
        let mut units = self.store.list_units(job.id).await?;
        if units.is_empty() {
            // Stopped before the plan was saved
            return self.drive(job).await;
        }

        let mut interrupted = Vec::new();
        for unit in units.iter_mut().filter(|u| u.state == UnitState::Running) {
            unit.state = UnitState::Waiting;
            unit.updated_at = Utc::now();
            interrupted.push(unit.clone());
        }
        self.store.save_units(&interrupted).await?;

        let resolved = units.iter().filter(|u| u.state.is_resolved()).count();
        info!(
            units = units.len(),
            resolved,
            interrupted = interrupted.len(),
            "Resuming persisted plan"
        );

        let (units, cancelled) = self.dispatch(job, units).await?;
        self.settle_job(job, &units, cancelled).await
    }

    /// Move the job to the terminal state its units add up to
    async fn settle_job(&self, job: &PipelineJob, units: &[StageUnit], cancelled: bool) -> Result<JobState> {
        let total = units.len();
        let count = |state: UnitState| units.iter().filter(|u| u.state == state).count();
        let (succeeded, failed, skipped) = (
            count(UnitState::Succeeded),
            count(UnitState::Failed),
            count(UnitState::Skipped),
        );

        let (state, detail) = if cancelled && skipped > 0 {
            (
                JobState::Cancelled,
                Some(format!("cancelled with {} of {} units undispatched", skipped, total)),
            )
        } else if failed == 0 {
            (JobState::Completed, None)
        } else if succeeded > 0 {
            (JobState::Partial, Some(format!("{} of {} units failed", failed, total)))
        } else {
            (JobState::Failed, Some(format!("all {} units failed", total)))
        };

        self.store
            .transition_job(job.id, JobState::Running, state, detail)
            .await?;
        info!(state = %state, total, succeeded, failed, skipped, "Job finished");
        Ok(state)
    }

    /// Dependency-count gate over a bounded pool of in-flight units.
    /// Units already resolved are kept as they are and count as finished
    /// dependencies. Returns the settled units and whether cancellation cut
    /// dispatch short.
    async fn dispatch(&self, job: &PipelineJob, plan: Vec<StageUnit>) -> Result<(Vec<StageUnit>, bool)> {
        let order: Vec<Uuid> = plan.iter().map(|u| u.id).collect();
        let resolved: HashSet<Uuid> = plan
            .iter()
            .filter(|u| u.state.is_resolved())
            .map(|u| u.id)
            .collect();
        let mut remaining: HashMap<Uuid, usize> = HashMap::new();
        let mut dependents: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut ready = VecDeque::new();

        for unit in plan.iter().filter(|u| !resolved.contains(&u.id)) {
            let open = unit.depends_on.iter().filter(|dep| !resolved.contains(dep)).count();
            remaining.insert(unit.id, open);
            for dep in &unit.depends_on {
                dependents.entry(*dep).or_default().push(unit.id);
            }
            if open == 0 {
                ready.push_back(unit.id);
            }
        }
        let mut units: HashMap<Uuid, StageUnit> = plan.into_iter().map(|u| (u.id, u)).collect();

        let mut cancelled = self.cancel_requested(job.id).await?;
        let mut in_flight = FuturesUnordered::new();

        loop {
            while !cancelled && in_flight.len() < self.worker_pool_size {
                let Some(id) = ready.pop_front() else { break };
                let Some(unit) = units.get(&id).cloned() else { continue };
                let dependencies: Vec<StageUnit> = unit
                    .depends_on
                    .iter()
                    .filter_map(|dep| units.get(dep).cloned())
                    .collect();
                in_flight.push(self.run_unit(unit, dependencies, job.policy));
            }

            let Some(done) = in_flight.next().await else { break };

            for dependent in dependents.get(&done.id).into_iter().flatten() {
                if let Some(count) = remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
            units.insert(done.id, done);

            if !cancelled && self.cancel_requested(job.id).await? {
                info!(in_flight = in_flight.len(), "Cancellation observed, draining in-flight units");
                cancelled = true;
            }
        }

        let mut skipped = Vec::new();
        for unit in units.values_mut() {
            if unit.state == UnitState::Waiting {
                unit.state = UnitState::Skipped;
                unit.updated_at = Utc::now();
                skipped.push(unit.clone());
            }
        }
        if !skipped.is_empty() {
            self.store.save_units(&skipped).await?;
        }

        let settled = order.iter().filter_map(|id| units.remove(id)).collect();
        Ok((settled, cancelled))
    }

    async fn cancel_requested(&self, job_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .get_job(job_id)
            .await?
            .is_some_and(|job| job.cancel_requested))
    }

    /// Execute one unit and record its outcome. Failures stay on the unit.
    async fn run_unit(&self, mut unit: StageUnit, dependencies: Vec<StageUnit>, policy: DependencyPolicy) -> StageUnit {
        let stage = unit.stage.to_string();

        if !unit.depends_on.is_empty() {
            match resolve_inputs(&dependencies, policy) {
                Ok(inputs) => unit.inputs = inputs,
                Err(e) => {
                    self.settle(&mut unit, &stage, Err(e)).await;
                    return unit;
                }
            }
        }

        unit.state = UnitState::Running;
        unit.updated_at = Utc::now();
        if let Err(e) = self.store.save_unit(&unit).await {
            warn!(unit_id = %unit.id, error = %e, "Failed to record unit start");
        }

        let request = StageRequest {
            stage_id: unit.stage,
            company_ref: unit.company_ref.clone(),
            document_type: unit.document_type.clone(),
            period_refs: unit.period_refs.clone(),
            inputs: unit.inputs.clone(),
        };
        if let Ok((_, fp)) = self.executor.fingerprint(&request) {
            unit.fingerprint = Some(fp.as_str().to_string());
        }

        let outcome = self.executor.execute(&request).await;
        self.settle(&mut unit, &stage, outcome).await;
        unit
    }

    async fn settle(
        &self,
        unit: &mut StageUnit,
        stage: &str,
        outcome: std::result::Result<Execution, StageError>,
    ) {
        let label = match outcome {
            Ok(execution) => {
                unit.state = UnitState::Succeeded;
                unit.content_id = Some(execution.content.id);
                unit.warning = execution.content.warning;
                unit.cached = execution.cached;
                unit.attempts = execution.attempts;
                unit.spent = execution.spent;
                if execution.cached { "cached" } else { "generated" }
            }
            Err(e) => {
                warn!(
                    unit_id = %unit.id,
                    stage = %stage,
                    company = %unit.company_ref,
                    periods = %unit.period_refs.join(","),
                    kind = e.kind(),
                    error = %e,
                    "Unit failed"
                );
                unit.state = UnitState::Failed;
                unit.attempts = e.attempts();
                unit.spent = e.spent();
                unit.error_kind = Some(e.kind().to_string());
                unit.error_message = Some(e.to_string());
                if let StageError::MalformedOutput { content_id, .. } = &e {
                    unit.content_id = *content_id;
                }
                "failed"
            }
        };
        unit.updated_at = Utc::now();
        metrics::record_unit(stage, label);

        if let Err(e) = self.store.save_unit(unit).await {
            error!(unit_id = %unit.id, error = %e, "Failed to record unit outcome");
        }
    }
}

/// Inputs of a dependent unit, in dependency order
fn resolve_inputs(dependencies: &[StageUnit], policy: DependencyPolicy) -> std::result::Result<Vec<InputRef>, StageError> {
    let mut inputs = Vec::with_capacity(dependencies.len());
    let mut missing = Vec::new();

    for dep in dependencies {
        match (dep.state, dep.content_id) {
            (UnitState::Succeeded, Some(id)) => inputs.push(InputRef::Content(id)),
            _ => missing.push(dep),
        }
    }

    if let Some(first) = missing.first() {
        if policy == DependencyPolicy::RequireAll || inputs.is_empty() {
            return Err(StageError::missing(format!(
                "{} of {} inputs unavailable; first {} {} [{}] is {}",
                missing.len(),
                dependencies.len(),
                first.stage,
                first.company_ref,
                first.period_refs.join(","),
                first.state.as_str()
            )));
        }
    }
    Ok(inputs)
}
