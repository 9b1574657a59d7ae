//! Token and unit accounting per stage
//!
//! A job is charged what its units paid for: every completion call it made,
//! including output that failed the quality check or lost an insert race to
//! a concurrent job. Units served from the cache cost nothing. The
//! store-wide report counts each stored row once instead.

use filingforge_common::errors::Result;
use filingforge_common::store::PipelineStore;
use filingforge_common::types::{Stage, TokenUsage, UnitState};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageUsage {
    pub stage: Stage,
    pub units: usize,
    /// Units that produced a new row
    pub generated: usize,
    pub cached: usize,
    pub failed: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl StageUsage {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            units: 0,
            generated: 0,
            cached: 0,
            failed: 0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    fn charge(&mut self, usage: TokenUsage) {
        self.input_tokens += usage.input_tokens;
        self.output_tokens += usage.output_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    /// `None` for the store-wide report
    pub job_id: Option<Uuid>,
    pub stages: Vec<StageUsage>,
}

impl UsageReport {
    fn empty(job_id: Option<Uuid>) -> Self {
        Self {
            job_id,
            stages: Stage::ALL.iter().map(|s| StageUsage::new(*s)).collect(),
        }
    }

    fn slot(&mut self, stage: Stage) -> &mut StageUsage {
        &mut self.stages[(stage.ordinal() - 1) as usize]
    }

    /// Usage of one job, from its units
    pub async fn for_job(store: &dyn PipelineStore, job_id: Uuid) -> Result<Self> {
        // Fails with JobNotFound for unknown ids
        store.job_status(job_id).await?;

        let mut report = Self::empty(Some(job_id));
        for unit in store.list_units(job_id).await? {
            let slot = report.slot(unit.stage.stage);
            slot.units += 1;

            match unit.state {
                UnitState::Succeeded if unit.cached => slot.cached += 1,
                UnitState::Succeeded => slot.generated += 1,
                UnitState::Failed => slot.failed += 1,
                _ => {}
            }

            slot.charge(unit.spent);
        }
        Ok(report)
    }

    /// Usage over every stored row, regardless of job
    pub async fn by_stage(store: &dyn PipelineStore) -> Result<Self> {
        let mut report = Self::empty(None);
        for content in store.list_content().await? {
            let slot = report.slot(content.stage.stage);
            slot.units += 1;
            if content.is_usable() {
                slot.generated += 1;
            } else {
                slot.failed += 1;
            }
            slot.charge(content.usage);
        }
        Ok(report)
    }

    pub fn stage(&self, stage: Stage) -> &StageUsage {
        &self.stages[(stage.ordinal() - 1) as usize]
    }

    pub fn total(&self) -> TokenUsage {
        self.stages.iter().fold(TokenUsage::default(), |acc, s| {
            acc + TokenUsage {
                input_tokens: s.input_tokens,
                output_tokens: s.output_tokens,
            }
        })
    }
}
