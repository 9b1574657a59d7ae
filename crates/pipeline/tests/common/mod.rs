//! Shared harness for pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use filingforge_common::llm::{Completion, CompletionClient, CompletionError, CompletionRequest};
use filingforge_common::types::{DependencyPolicy, Document, JobScope, JobStatus};
use filingforge_common::{MemoryStore, PipelineStore};
use filingforge_pipeline::{
    ConfigRegistry, Orchestrator, QualityPolicy, RetryPolicy, RoutingPolicy, StageExecutor,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

/// Documents containing this marker are rejected by `FakeClient`
pub const FAIL_MARKER: &str = "FAIL-MARKER";

/// Which stage a rendered user prompt belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Document,
    Aggregate,
    Brief,
}

impl CallKind {
    fn of(user: &str) -> Self {
        if user.starts_with("Subject:") {
            CallKind::Brief
        } else if user.contains("across periods") {
            CallKind::Aggregate
        } else {
            CallKind::Document
        }
    }
}

/// Deterministic completion service that records every call
pub struct FakeClient {
    calls: AtomicUsize,
    log: Mutex<Vec<CallKind>>,
    delay: Duration,
    /// When set, each call waits for a permit before answering
    gate: Option<Arc<Semaphore>>,
}

impl FakeClient {
    pub fn new() -> Arc<Self> {
        Self::build(Duration::ZERO, None)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::build(delay, None)
    }

    pub fn gated(gate: Arc<Semaphore>) -> Arc<Self> {
        Self::build(Duration::ZERO, Some(gate))
    }

    fn build(delay: Duration, gate: Option<Arc<Semaphore>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            delay,
            gate,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn log(&self) -> Vec<CallKind> {
        self.log.lock().await.clone()
    }
}

#[async_trait]
impl CompletionClient for FakeClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, CompletionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().await.push(CallKind::of(&request.user));

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| CompletionError::transient("gate closed"))?
                .forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if request.user.contains(FAIL_MARKER) {
            return Err(CompletionError::Rejected {
                status: 400,
                message: "input rejected by content filter".into(),
            });
        }

        let subject = request.user.lines().next().unwrap_or_default();
        Ok(Completion {
            text: format!(
                "Summary: Analysis for {}.\n\nCall {} covered {} characters of material \
                 and found the disclosures consistent with prior commentary.",
                subject,
                n,
                request.user.chars().count()
            ),
            input_tokens: 200,
            output_tokens: 50,
            finish_reason: Some("stop".into()),
            model: request.model.clone(),
        })
    }

    fn provider(&self) -> &str {
        "fake"
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub client: Arc<FakeClient>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(client: Arc<FakeClient>) -> Self {
        Self::with(Arc::new(MemoryStore::new()), client, ConfigRegistry::with_defaults().unwrap(), 4)
    }

    pub fn with(
        store: Arc<MemoryStore>,
        client: Arc<FakeClient>,
        registry: ConfigRegistry,
        worker_pool_size: usize,
    ) -> Self {
        let executor = StageExecutor::new(
            store.clone(),
            client.clone(),
            Arc::new(registry),
            QualityPolicy {
                min_output_chars: 20,
                repetition_ngram: 6,
                repetition_threshold: 4,
            },
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
            },
        );
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(executor),
            RoutingPolicy {
                single_pass_threshold_chars: 120,
            },
            worker_pool_size,
            DependencyPolicy::RequireAll,
        );
        Self {
            store,
            client,
            orchestrator,
        }
    }

    pub async fn add_document(&self, company: &str, period: &str, doc_type: &str, text: &str) -> Document {
        self.store
            .insert_document(Document::new(company, period, doc_type, text))
            .await
            .unwrap()
    }

    /// Create and run a job to completion
    pub async fn run(&self, scope: JobScope, policy: Option<DependencyPolicy>) -> JobStatus {
        let job = self.orchestrator.create_job(scope, policy).await.unwrap();
        self.orchestrator.run_job(job.id).await.unwrap()
    }
}

/// Body long enough to take the full stage-1 route
pub fn filing_text(company: &str, period: &str) -> String {
    format!(
        "{} risk factors for fiscal {}. The company depends on a small number of suppliers \
         for key components, faces rising interest costs on floating-rate debt, and is \
         exposed to currency movements in its European operations.",
        company, period
    )
}
