//! Pipeline job entity

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result as AppResult};
use crate::types::PipelineJob;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "pipeline_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "JsonBinary")]
    pub scope: serde_json::Value,

    #[sea_orm(column_type = "Text")]
    pub state: String,

    #[sea_orm(column_type = "Text")]
    pub policy: String,

    pub cancel_requested: bool,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_detail: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub completed_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::stage_unit::Entity")]
    StageUnits,
}

impl Related<super::stage_unit::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StageUnits.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for PipelineJob {
    type Error = AppError;

    fn try_from(m: Model) -> AppResult<Self> {
        let utc = |dt: DateTimeWithTimeZone| dt.with_timezone(&chrono::Utc);
        Ok(PipelineJob {
            id: m.id,
            scope: serde_json::from_value(m.scope)?,
            state: m.state.parse()?,
            policy: m.policy.parse()?,
            cancel_requested: m.cancel_requested,
            error_detail: m.error_detail,
            created_at: utc(m.created_at),
            started_at: m.started_at.map(utc),
            completed_at: m.completed_at.map(utc),
        })
    }
}

impl ActiveModel {
    pub fn from_job(job: &PipelineJob) -> AppResult<Self> {
        use sea_orm::Set;

        Ok(ActiveModel {
            id: Set(job.id),
            scope: Set(serde_json::to_value(&job.scope)?),
            state: Set(job.state.to_string()),
            policy: Set(job.policy.as_str().to_string()),
            cancel_requested: Set(job.cancel_requested),
            error_detail: Set(job.error_detail.clone()),
            created_at: Set(job.created_at.into()),
            started_at: Set(job.started_at.map(Into::into)),
            completed_at: Set(job.completed_at.map(Into::into)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DependencyPolicy, JobScope, JobState};
    use sea_orm::TryIntoModel;

    #[test]
    fn test_job_survives_row_conversion() {
        let mut job = PipelineJob::new(
            JobScope::company("ACME").years(2022, 2024),
            DependencyPolicy::ProceedWithAvailable,
        );
        job.state = JobState::Partial;
        job.error_detail = Some("1 of 5 units failed".into());
        job.started_at = Some(job.created_at);
        job.completed_at = Some(chrono::Utc::now());

        let model = ActiveModel::from_job(&job).unwrap().try_into_model().unwrap();
        assert_eq!(model.state, "partial");

        assert_eq!(PipelineJob::try_from(model).unwrap(), job);
    }
}
