//! End-to-end job runs on the in-memory store

mod common;

use common::{filing_text, CallKind, FakeClient, Harness, FAIL_MARKER};
use filingforge_common::types::{
    DependencyPolicy, InputRef, JobScope, JobState, Stage, StageId, UnitState,
};
use filingforge_common::{AppError, MemoryStore, PipelineStore};
use filingforge_pipeline::registry::PromptRole;
use filingforge_pipeline::{ConfigRegistry, ProvenanceGraph, UsageReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_test::{assert_err, assert_ok};

fn acme_scope() -> JobScope {
    JobScope::company("ACME").years(2022, 2024).document_type("risk_factors")
}

async fn seed_acme(h: &Harness) {
    for year in ["2022", "2023", "2024"] {
        h.add_document("ACME", year, "risk_factors", &filing_text("ACME", year)).await;
    }
    // Outside the scope
    h.add_document("ACME", "2021", "risk_factors", &filing_text("ACME", "2021")).await;
    h.add_document("ACME", "2023", "md_and_a", &filing_text("ACME", "2023")).await;
    h.add_document("GLOBEX", "2023", "risk_factors", &filing_text("GLOBEX", "2023")).await;
}

#[tokio::test]
async fn test_three_year_risk_factor_run_and_free_rerun() {
    let h = Harness::new(FakeClient::new());
    seed_acme(&h).await;

    let first = h.run(acme_scope(), None).await;
    assert_eq!(first.job.state, JobState::Completed);
    assert_eq!(first.stage(Stage::DocumentSummary).succeeded, 3);
    assert_eq!(first.stage(Stage::PeriodAggregate).succeeded, 1);
    assert_eq!(first.stage(Stage::Brief).succeeded, 1);
    assert_eq!(h.store.content_count().await, 5);
    assert_eq!(h.client.calls(), 5);

    let second = h.run(acme_scope(), None).await;
    assert_eq!(second.job.state, JobState::Completed);
    assert_eq!(h.store.content_count().await, 5);
    assert_eq!(h.client.calls(), 5);
    for progress in &second.stages {
        assert_eq!(progress.cached, progress.total, "stage {} not cached", progress.stage);
    }

    let paid = UsageReport::for_job(h.store.as_ref(), first.job.id).await.unwrap();
    let free = UsageReport::for_job(h.store.as_ref(), second.job.id).await.unwrap();
    assert_eq!(paid.total().input_tokens, 5 * 200);
    assert_eq!(paid.stage(Stage::DocumentSummary).generated, 3);
    assert_eq!(free.total().total(), 0);
    assert_eq!(free.stage(Stage::DocumentSummary).cached, 3);
}

#[tokio::test]
async fn test_aggregate_covers_periods_in_order() {
    let h = Harness::new(FakeClient::new());
    seed_acme(&h).await;
    h.run(acme_scope(), None).await;

    let rows = h.store.list_content_by_company("acme", Some("risk_factors")).await.unwrap();
    let aggregate = rows
        .iter()
        .find(|c| c.stage == StageId::full(Stage::PeriodAggregate))
        .unwrap();
    assert_eq!(aggregate.period_refs, vec!["2022", "2023", "2024"]);

    let mut input_periods = Vec::new();
    for input in &aggregate.inputs {
        let upstream = h.store.get_content(input.id()).await.unwrap().unwrap();
        input_periods.push(upstream.period_refs[0].clone());
    }
    assert_eq!(input_periods, vec!["2022", "2023", "2024"]);
}

#[tokio::test]
async fn test_prompt_change_regenerates_downstream() {
    let store = Arc::new(MemoryStore::new());
    let client = FakeClient::new();
    let h = Harness::with(store.clone(), client.clone(), ConfigRegistry::with_defaults().unwrap(), 4);
    for year in ["2022", "2023"] {
        h.add_document("ACME", year, "md_and_a", &filing_text("ACME", year)).await;
    }
    let scope = JobScope::company("ACME").document_type("md_and_a");

    h.run(scope.clone(), None).await;
    assert_eq!(store.content_count().await, 4);

    let mut registry = ConfigRegistry::with_defaults().unwrap();
    let revised = registry
        .publish_prompt(
            "document_summary",
            PromptRole::User,
            "Company: {{company}}\nPeriod: {{periods}}\n\nSummarize in plain language.\n\n{{inputs}}",
        )
        .unwrap();
    assert_eq!(revised.id, "document_summary@v2");
    registry
        .bind(
            StageId::full(Stage::DocumentSummary),
            None,
            "analyst_system@v1",
            &revised.id,
            "extraction@v1",
        )
        .unwrap();

    let revised_run = Harness::with(store.clone(), client.clone(), registry, 4);
    let status = revised_run.run(scope, None).await;

    assert_eq!(status.job.state, JobState::Completed);
    // New stage-1 outputs change every downstream fingerprint
    assert_eq!(store.content_count().await, 8);
    assert_eq!(client.calls(), 8);
}

/// A registry as a freshly started process builds it, with the stage-1
/// summary prompt text replaced. Ids restart at v1 in every process.
fn registry_with_summary_text(text: &str) -> ConfigRegistry {
    let base = ConfigRegistry::with_defaults().unwrap();
    let mut registry = ConfigRegistry::new();
    for id in ["extraction@v1", "synthesis@v1"] {
        registry
            .register_model_config((*base.model_config(id).unwrap()).clone())
            .unwrap();
    }
    for id in ["analyst_system@v1", "period_aggregate@v1", "brief@v1"] {
        registry.register_prompt((*base.prompt(id).unwrap()).clone()).unwrap();
    }
    let summary = registry
        .publish_prompt("document_summary", PromptRole::User, text)
        .unwrap();
    assert_eq!(summary.id, "document_summary@v1");

    let system = "analyst_system@v1";
    registry
        .bind(StageId::full(Stage::DocumentSummary), None, system, &summary.id, "extraction@v1")
        .unwrap();
    registry
        .bind(StageId::full(Stage::PeriodAggregate), None, system, "period_aggregate@v1", "synthesis@v1")
        .unwrap();
    registry
        .bind(StageId::full(Stage::Brief), None, system, "brief@v1", "synthesis@v1")
        .unwrap();
    registry
}

#[tokio::test]
async fn test_edited_prompt_under_same_id_is_not_served_from_cache() {
    let store = Arc::new(MemoryStore::new());
    let client = FakeClient::new();
    let scope = JobScope::company("ACME").document_type("md_and_a");

    let before = Harness::with(
        store.clone(),
        client.clone(),
        registry_with_summary_text("Company: {{company}}\nPeriod: {{periods}}\n\nSummarize.\n\n{{inputs}}"),
        4,
    );
    for year in ["2022", "2023"] {
        before.add_document("ACME", year, "md_and_a", &filing_text("ACME", year)).await;
    }
    before.run(scope.clone(), None).await;
    assert_eq!(store.content_count().await, 4);

    // Same text after a restart: everything is reused
    let restarted = Harness::with(
        store.clone(),
        client.clone(),
        registry_with_summary_text("Company: {{company}}\nPeriod: {{periods}}\n\nSummarize.\n\n{{inputs}}"),
        4,
    );
    let status = restarted.run(scope.clone(), None).await;
    assert_eq!(status.stage(Stage::DocumentSummary).cached, 2);
    assert_eq!(client.calls(), 4);

    // Edited text that still registers as document_summary@v1
    let edited = Harness::with(
        store.clone(),
        client.clone(),
        registry_with_summary_text("Company: {{company}}\nPeriod: {{periods}}\n\nList every named risk.\n\n{{inputs}}"),
        4,
    );
    let status = edited.run(scope, None).await;

    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.stage(Stage::DocumentSummary).cached, 0);
    assert_eq!(client.calls(), 8);
    assert_eq!(store.content_count().await, 8);
    // Rows still carry the readable id
    let ids: Vec<String> = store
        .list_content()
        .await
        .unwrap()
        .into_iter()
        .filter(|c| c.stage.stage == Stage::DocumentSummary)
        .map(|c| c.user_prompt_id)
        .collect();
    assert!(ids.iter().all(|id| id == "document_summary@v1"));
}

#[tokio::test]
async fn test_provenance_walks_back_to_documents() {
    let h = Harness::new(FakeClient::new());
    seed_acme(&h).await;
    h.run(acme_scope(), None).await;

    let brief = h
        .store
        .list_content_by_company("ACME", None)
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.stage.stage == Stage::Brief)
        .unwrap();

    let graph = ProvenanceGraph::load(h.store.as_ref(), brief.id).await.unwrap();
    assert_eq!(graph.documents().count(), 3);
    assert_eq!(graph.contents().count(), 5);
    assert_eq!(graph.edges().len(), 3 + 3 + 1);
    assert!(graph.is_acyclic());

    let order = graph.topological_order().unwrap();
    let position = |id| order.iter().position(|n| *n == id).unwrap();
    for doc in graph.documents() {
        assert!(position(doc.id) < position(brief.id));
    }
    assert_eq!(order.last(), Some(&brief.id));
}

#[tokio::test]
async fn test_dependents_wait_for_their_inputs() {
    let h = Harness::new(FakeClient::slow(Duration::from_millis(5)));
    for company in ["ACME", "GLOBEX"] {
        for year in ["2022", "2023"] {
            h.add_document(company, year, "risk_factors", &filing_text(company, year)).await;
        }
    }
    let mut scope = JobScope::company("ACME").grouped("peers");
    scope.companies.push("GLOBEX".into());

    let status = h.run(scope, None).await;
    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.stage(Stage::Brief).total, 1);

    let log = h.client.log().await;
    assert_eq!(log.len(), 4 + 2 + 1);
    assert_eq!(log.last(), Some(&CallKind::Brief));
    let first_aggregate = log.iter().position(|k| *k == CallKind::Aggregate).unwrap();
    assert!(log[first_aggregate..].iter().all(|k| *k != CallKind::Document));

    // Every stage-2 row only consumes stage-1 rows stored before it
    for row in h.store.list_content().await.unwrap() {
        if row.stage.stage != Stage::PeriodAggregate {
            continue;
        }
        for input in &row.inputs {
            let InputRef::Content(id) = input else { panic!("aggregate consumed a document") };
            let upstream = h.store.get_content(*id).await.unwrap().unwrap();
            assert_eq!(upstream.stage.stage, Stage::DocumentSummary);
            assert!(upstream.created_at <= row.created_at);
        }
    }
}

async fn seed_five_years(h: &Harness) -> filingforge_common::types::Document {
    let mut bad = None;
    for year in ["2020", "2021", "2022", "2023", "2024"] {
        let mut text = filing_text("ACME", year);
        if year == "2022" {
            text.push_str(FAIL_MARKER);
        }
        let doc = h.add_document("ACME", year, "risk_factors", &text).await;
        if year == "2022" {
            bad = Some(doc);
        }
    }
    bad.unwrap()
}

#[tokio::test]
async fn test_one_failing_document_leaves_the_rest_intact() {
    let h = Harness::new(FakeClient::new());
    let bad = seed_five_years(&h).await;

    let status = h.run(JobScope::company("ACME"), None).await;

    assert_eq!(status.job.state, JobState::Partial);
    let stage1 = status.stage(Stage::DocumentSummary);
    assert_eq!((stage1.succeeded, stage1.failed), (4, 1));
    assert_eq!(status.stage(Stage::PeriodAggregate).failed, 1);
    assert_eq!(status.stage(Stage::Brief).failed, 1);
    // Rejections are not retried and blocked dependents never call out
    assert_eq!(h.client.calls(), 5);
    assert_eq!(h.store.content_count().await, 4);

    let rejected = status
        .failures
        .iter()
        .find(|f| f.error_kind == "rejected")
        .unwrap();
    assert_eq!(rejected.document_id, Some(bad.id));
    assert_eq!(rejected.company_ref, "ACME");
    assert_eq!(rejected.period_refs, vec!["2022"]);

    let blocked = status
        .failures
        .iter()
        .filter(|f| f.error_kind == "missing_dependency")
        .count();
    assert_eq!(blocked, 2);
}

#[tokio::test]
async fn test_proceed_with_available_aggregates_the_survivors() {
    let h = Harness::new(FakeClient::new());
    seed_five_years(&h).await;

    let status = h
        .run(JobScope::company("ACME"), Some(DependencyPolicy::ProceedWithAvailable))
        .await;

    assert_eq!(status.job.state, JobState::Partial);
    assert_eq!(status.stage(Stage::PeriodAggregate).succeeded, 1);
    assert_eq!(status.stage(Stage::Brief).succeeded, 1);

    let aggregate = h
        .store
        .list_content()
        .await
        .unwrap()
        .into_iter()
        .find(|c| c.stage.stage == Stage::PeriodAggregate)
        .unwrap();
    assert_eq!(aggregate.inputs.len(), 4);
}

#[tokio::test]
async fn test_rerun_after_partial_only_retries_failures() {
    let h = Harness::new(FakeClient::new());
    seed_five_years(&h).await;

    h.run(JobScope::company("ACME"), None).await;
    let calls = h.client.calls();
    let status = h.run(JobScope::company("ACME"), None).await;

    assert_eq!(status.job.state, JobState::Partial);
    assert_eq!(status.stage(Stage::DocumentSummary).cached, 4);
    assert_eq!(h.client.calls(), calls + 1);
}

#[tokio::test]
async fn test_concurrent_jobs_store_each_fingerprint_once() {
    let h = Harness::new(FakeClient::slow(Duration::from_millis(10)));
    seed_acme(&h).await;

    let a = h.orchestrator.create_job(acme_scope(), None).await.unwrap();
    let b = h.orchestrator.create_job(acme_scope(), None).await.unwrap();
    let (ra, rb) = tokio::join!(h.orchestrator.run_job(a.id), h.orchestrator.run_job(b.id));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.job.state, JobState::Completed);
    assert_eq!(rb.job.state, JobState::Completed);
    assert_eq!(h.store.content_count().await, 5);

    let brief_of = |units: Vec<filingforge_common::types::StageUnit>| {
        units
            .into_iter()
            .find(|u| u.stage.stage == Stage::Brief)
            .and_then(|u| u.content_id)
    };
    let brief_a = brief_of(h.store.list_units(a.id).await.unwrap());
    let brief_b = brief_of(h.store.list_units(b.id).await.unwrap());
    assert!(brief_a.is_some());
    assert_eq!(brief_a, brief_b);
}

#[tokio::test]
async fn test_concurrent_jobs_are_charged_for_every_call() {
    let h = Harness::new(FakeClient::slow(Duration::from_millis(10)));
    seed_acme(&h).await;

    let a = h.orchestrator.create_job(acme_scope(), None).await.unwrap();
    let b = h.orchestrator.create_job(acme_scope(), None).await.unwrap();
    let (ra, rb) = tokio::join!(h.orchestrator.run_job(a.id), h.orchestrator.run_job(b.id));
    assert_ok!(ra);
    assert_ok!(rb);

    let usage_a = UsageReport::for_job(h.store.as_ref(), a.id).await.unwrap().total();
    let usage_b = UsageReport::for_job(h.store.as_ref(), b.id).await.unwrap().total();
    let calls = h.client.calls() as u64;

    // Racing calls that stored nothing are still billed to their job
    assert!(calls >= 5);
    assert_eq!(usage_a.input_tokens + usage_b.input_tokens, calls * 200);
    assert_eq!(usage_a.output_tokens + usage_b.output_tokens, calls * 50);

    // The store-wide view counts each stored row once
    let stored = UsageReport::by_stage(h.store.as_ref()).await.unwrap().total();
    assert_eq!(stored.input_tokens, 5 * 200);
}

#[tokio::test]
async fn test_cancel_stops_dispatch_and_keeps_finished_work() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::with(
        Arc::new(MemoryStore::new()),
        FakeClient::gated(gate.clone()),
        ConfigRegistry::with_defaults().unwrap(),
        1,
    );
    seed_acme(&h).await;

    let job = h.orchestrator.create_job(acme_scope(), None).await.unwrap();
    let orchestrator = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.run_job(job.id).await });

    for _ in 0..200 {
        if h.client.calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.client.calls(), 1);

    let requested = h.orchestrator.cancel_job(job.id).await.unwrap();
    assert!(requested.cancel_requested);
    gate.add_permits(10);

    let status = handle.await.unwrap().unwrap();
    assert_eq!(status.job.state, JobState::Cancelled);
    let stage1 = status.stage(Stage::DocumentSummary);
    assert_eq!((stage1.succeeded, stage1.skipped), (1, 2));
    assert_eq!(status.stage(Stage::Brief).skipped, 1);
    // The in-flight unit finished and was stored
    assert_eq!(h.store.content_count().await, 1);
    assert_eq!(h.client.calls(), 1);

    let units = h.store.list_units(job.id).await.unwrap();
    assert_eq!(units.iter().filter(|u| u.state == UnitState::Skipped).count(), 4);
}

#[tokio::test]
async fn test_job_interrupted_mid_run_is_resumed_after_restart() {
    let gate = Arc::new(Semaphore::new(1));
    let h = Harness::with(
        Arc::new(MemoryStore::new()),
        FakeClient::gated(gate.clone()),
        ConfigRegistry::with_defaults().unwrap(),
        1,
    );
    seed_acme(&h).await;

    let job = h.orchestrator.create_job(acme_scope(), None).await.unwrap();
    let orchestrator = h.orchestrator.clone();
    let handle = tokio::spawn(async move { orchestrator.run_job(job.id).await });

    // First unit done, second one blocked inside its call
    for _ in 0..200 {
        if h.client.calls() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.client.calls(), 2);
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    let stuck = h.store.job_status(job.id).await.unwrap();
    assert_eq!(stuck.job.state, JobState::Running);
    let units = h.store.list_units(job.id).await.unwrap();
    let finished = units.iter().find(|u| u.state == UnitState::Succeeded).unwrap().clone();
    assert_eq!(units.iter().filter(|u| u.state == UnitState::Running).count(), 1);

    // A new process over the same store
    let restarted = Harness::with(h.store.clone(), FakeClient::new(), ConfigRegistry::with_defaults().unwrap(), 4);
    let recovered = restarted.orchestrator.recover_interrupted().await.unwrap();
    assert_eq!(recovered.len(), 1);

    let status = &recovered[0];
    assert_eq!(status.job.id, job.id);
    assert_eq!(status.job.state, JobState::Completed);
    assert_eq!(status.stage(Stage::DocumentSummary).succeeded, 3);
    assert_eq!(status.stage(Stage::Brief).succeeded, 1);
    // Only the units that had not finished were called again
    assert_eq!(restarted.client.calls(), 4);
    assert_eq!(h.store.content_count().await, 5);

    let kept = h
        .store
        .list_units(job.id)
        .await
        .unwrap()
        .into_iter()
        .find(|u| u.id == finished.id)
        .unwrap();
    assert_eq!(kept.content_id, finished.content_id);
    assert_eq!(kept.spent, finished.spent);
}

#[tokio::test]
async fn test_recovery_starts_pending_jobs_and_ignores_settled_ones() {
    let h = Harness::new(FakeClient::new());
    seed_acme(&h).await;

    let done = h.run(acme_scope(), None).await;
    let pending = h.orchestrator.create_job(acme_scope(), None).await.unwrap();

    let recovered = h.orchestrator.recover_interrupted().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].job.id, pending.id);
    assert_eq!(recovered[0].job.state, JobState::Completed);

    let err = h.orchestrator.resume_job(done.job.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    assert!(h.orchestrator.recover_interrupted().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_pending_job_never_runs() {
    let h = Harness::new(FakeClient::new());
    seed_acme(&h).await;

    let job = h.orchestrator.create_job(acme_scope(), None).await.unwrap();
    let cancelled = h.orchestrator.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.state, JobState::Cancelled);

    let err = h.orchestrator.run_job(job.id).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
    assert_eq!(h.client.calls(), 0);
}

#[tokio::test]
async fn test_empty_scope_fails_the_job() {
    let h = Harness::new(FakeClient::new());
    seed_acme(&h).await;

    let status = h.run(JobScope::company("INITECH"), None).await;
    assert_eq!(status.job.state, JobState::Failed);
    assert!(status.job.error_detail.unwrap().starts_with("ScopeEmpty"));
    assert!(status.stages.iter().all(|s| s.total == 0));
}

#[tokio::test]
async fn test_invalid_scope_is_rejected_up_front() {
    let h = Harness::new(FakeClient::new());
    assert_err!(h.orchestrator.create_job(JobScope::default(), None).await);
    assert_ok!(h.orchestrator.create_job(JobScope::company("ACME"), None).await);
}
