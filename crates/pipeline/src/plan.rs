//! Expansion of a job scope into stage units
//!
//! - stage 1: one unit per document, routed by length. A single-pass unit is
//!   terminal: its output stands alone and feeds no later stage
//! - stage 2: one unit per (company, document type), depending on its
//!   full-route stage-1 units
//! - stage 3: one unit per company, or a single unit for the whole scope when
//!   the scope names a group, depending on the stage-2 units

use crate::provenance::verify_acyclic;
use crate::registry::RoutingPolicy;
use filingforge_common::errors::Result;
use filingforge_common::types::{
    Document, InputRef, PipelineJob, Route, Stage, StageId, StageUnit,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Units of one job, in dispatch-friendly order
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub units: Vec<StageUnit>,
}

impl ExecutionPlan {
    /// Build and validate the plan for `documents`, which must already be
    /// filtered to the job's scope
    pub fn build(job: &PipelineJob, documents: &[Document], routing: &RoutingPolicy) -> Result<Self> {
        let mut units = Vec::new();

        // (company key, document type) -> stage-1 unit ids ordered by period
        let mut by_type: BTreeMap<(String, String), Vec<(String, Uuid, Uuid)>> = BTreeMap::new();
        let mut company_names: HashMap<String, String> = HashMap::new();

        for doc in documents {
            let key = doc.company_ref.to_uppercase();
            company_names.entry(key.clone()).or_insert_with(|| doc.company_ref.clone());

            let mut unit = StageUnit::new(job.id, routing.route(doc), &company_names[&key]);
            unit.document_type = Some(doc.document_type.clone());
            unit.period_refs = vec![doc.period_ref.clone()];
            unit.inputs = vec![InputRef::Document(doc.id)];

            if unit.stage.route == Route::SinglePass {
                units.push(unit);
                continue;
            }

            by_type
                .entry((key, doc.document_type.clone()))
                .or_default()
                .push((doc.period_ref.clone(), doc.id, unit.id));
            units.push(unit);
        }

        // company key -> (stage-2 unit id, periods)
        let mut by_company: BTreeMap<String, Vec<(Uuid, Vec<String>)>> = BTreeMap::new();

        for ((key, document_type), mut members) in by_type {
            members.sort();
            let periods: Vec<String> = members
                .iter()
                .map(|(p, _, _)| p.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            let mut unit = StageUnit::new(
                job.id,
                StageId::full(Stage::PeriodAggregate),
                &company_names[&key],
            );
            unit.document_type = Some(document_type);
            unit.period_refs = periods.clone();
            unit.depends_on = members.iter().map(|(_, _, unit_id)| *unit_id).collect();

            by_company.entry(key).or_default().push((unit.id, periods));
            units.push(unit);
        }

        let brief = StageId::full(Stage::Brief);
        match &job.scope.group {
            Some(group) if !by_company.is_empty() => {
                let mut unit = StageUnit::new(job.id, brief, group.clone());
                let members: Vec<&(Uuid, Vec<String>)> = by_company.values().flatten().collect();
                unit.depends_on = members.iter().map(|(id, _)| *id).collect();
                unit.period_refs = union_periods(members.iter().map(|(_, p)| p));
                units.push(unit);
            }
            _ => {
                for (key, members) in &by_company {
                    let mut unit = StageUnit::new(job.id, brief, &company_names[key]);
                    unit.depends_on = members.iter().map(|(id, _)| *id).collect();
                    unit.period_refs = union_periods(members.iter().map(|(_, p)| p));
                    units.push(unit);
                }
            }
        }

        let plan = Self { units };
        plan.validate()?;
        Ok(plan)
    }

    /// Dependencies must reference units of this plan and form a DAG
    pub fn validate(&self) -> Result<()> {
        let edges = self
            .units
            .iter()
            .flat_map(|u| u.depends_on.iter().map(move |dep| (*dep, u.id)));
        verify_acyclic(self.units.iter().map(|u| u.id), edges)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.units.iter().filter(|u| u.stage.stage == stage).count()
    }
}

fn union_periods<'a>(lists: impl Iterator<Item = &'a Vec<String>>) -> Vec<String> {
    lists.flatten().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use filingforge_common::types::{DependencyPolicy, JobScope};

    fn routing() -> RoutingPolicy {
        RoutingPolicy {
            single_pass_threshold_chars: 10,
        }
    }

    fn doc(company: &str, period: &str, doc_type: &str) -> Document {
        Document::new(company, period, doc_type, "A sufficiently long filing section body.")
    }

    #[test]
    fn test_single_company_single_type() {
        let job = PipelineJob::new(JobScope::company("ACME").years(2022, 2024), DependencyPolicy::RequireAll);
        let docs = vec![
            doc("ACME", "2022", "risk_factors"),
            doc("ACME", "2023", "risk_factors"),
            doc("ACME", "2024", "risk_factors"),
        ];

        let plan = ExecutionPlan::build(&job, &docs, &routing()).unwrap();

        assert_eq!(plan.count(Stage::DocumentSummary), 3);
        assert_eq!(plan.count(Stage::PeriodAggregate), 1);
        assert_eq!(plan.count(Stage::Brief), 1);

        let aggregate = plan.units.iter().find(|u| u.stage.stage == Stage::PeriodAggregate).unwrap();
        assert_eq!(aggregate.period_refs, vec!["2022", "2023", "2024"]);
        assert_eq!(aggregate.depends_on.len(), 3);

        let brief = plan.units.iter().find(|u| u.stage.stage == Stage::Brief).unwrap();
        assert_eq!(brief.depends_on, vec![aggregate.id]);
        assert_eq!(brief.document_type, None);
    }

    #[test]
    fn test_stage_two_inputs_follow_period_order() {
        let job = PipelineJob::new(JobScope::company("ACME"), DependencyPolicy::RequireAll);
        let docs = vec![doc("ACME", "2024", "risk_factors"), doc("ACME", "2022", "risk_factors")];

        let plan = ExecutionPlan::build(&job, &docs, &routing()).unwrap();
        let s1: HashMap<Uuid, &StageUnit> = plan.units.iter().map(|u| (u.id, u)).collect();
        let aggregate = plan.units.iter().find(|u| u.stage.stage == Stage::PeriodAggregate).unwrap();

        let periods: Vec<&str> = aggregate
            .depends_on
            .iter()
            .map(|id| s1[id].period_refs[0].as_str())
            .collect();
        assert_eq!(periods, vec!["2022", "2024"]);
    }

    #[test]
    fn test_group_produces_one_brief() {
        let mut scope = JobScope::company("ACME").grouped("industrials");
        scope.companies.push("GLOBEX".into());
        let job = PipelineJob::new(scope, DependencyPolicy::RequireAll);
        let docs = vec![
            doc("ACME", "2023", "risk_factors"),
            doc("ACME", "2023", "md_and_a"),
            doc("GLOBEX", "2023", "risk_factors"),
        ];

        let plan = ExecutionPlan::build(&job, &docs, &routing()).unwrap();

        assert_eq!(plan.count(Stage::PeriodAggregate), 3);
        assert_eq!(plan.count(Stage::Brief), 1);
        let brief = plan.units.iter().find(|u| u.stage.stage == Stage::Brief).unwrap();
        assert_eq!(brief.company_ref, "industrials");
        assert_eq!(brief.depends_on.len(), 3);
    }

    #[test]
    fn test_companies_without_group_get_separate_briefs() {
        let mut scope = JobScope::company("ACME");
        scope.companies.push("GLOBEX".into());
        let job = PipelineJob::new(scope, DependencyPolicy::RequireAll);
        let docs = vec![doc("ACME", "2023", "risk_factors"), doc("GLOBEX", "2023", "risk_factors")];

        let plan = ExecutionPlan::build(&job, &docs, &routing()).unwrap();
        assert_eq!(plan.count(Stage::Brief), 2);
    }

    #[test]
    fn test_short_documents_take_single_pass_route() {
        let job = PipelineJob::new(JobScope::company("ACME"), DependencyPolicy::RequireAll);
        let docs = vec![Document::new("ACME", "2023", "press_release", "Short.")];

        let plan = ExecutionPlan::build(&job, &docs, &routing()).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.units[0].stage, StageId::single_pass(Stage::DocumentSummary));
    }

    #[test]
    fn test_single_pass_units_are_terminal() {
        let job = PipelineJob::new(JobScope::company("ACME"), DependencyPolicy::RequireAll);
        let docs = vec![
            doc("ACME", "2022", "risk_factors"),
            Document::new("ACME", "2023", "risk_factors", "Short."),
            doc("ACME", "2024", "risk_factors"),
        ];

        let plan = ExecutionPlan::build(&job, &docs, &routing()).unwrap();

        let single: Vec<&StageUnit> = plan
            .units
            .iter()
            .filter(|u| u.stage == StageId::single_pass(Stage::DocumentSummary))
            .collect();
        assert_eq!(single.len(), 1);
        assert!(plan.units.iter().all(|u| !u.depends_on.contains(&single[0].id)));

        let aggregate = plan.units.iter().find(|u| u.stage.stage == Stage::PeriodAggregate).unwrap();
        assert_eq!(aggregate.depends_on.len(), 2);
        assert_eq!(aggregate.period_refs, vec!["2022", "2024"]);
        assert_eq!(plan.count(Stage::Brief), 1);
    }

    #[test]
    fn test_validate_rejects_dangling_dependency() {
        let job = PipelineJob::new(JobScope::company("ACME"), DependencyPolicy::RequireAll);
        let mut plan = ExecutionPlan::build(&job, &[doc("ACME", "2023", "risk_factors")], &routing()).unwrap();
        plan.units[0].depends_on.push(Uuid::now_v7());
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_empty_scope_yields_empty_plan() {
        let job = PipelineJob::new(JobScope::company("ACME").grouped("g"), DependencyPolicy::RequireAll);
        let plan = ExecutionPlan::build(&job, &[], &routing()).unwrap();
        assert!(plan.is_empty());
    }
}
