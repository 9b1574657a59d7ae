//! Stage unit entity: one scheduled generation step of a job

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result as AppResult};
use crate::types::{StageUnit, TokenUsage};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "stage_units")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub job_id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub stage: String,

    #[sea_orm(column_type = "Text")]
    pub company_ref: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub document_type: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub period_refs: serde_json::Value,

    #[sea_orm(column_type = "JsonBinary")]
    pub depends_on: serde_json::Value,

    #[sea_orm(column_type = "JsonBinary")]
    pub inputs: serde_json::Value,

    #[sea_orm(column_type = "Text")]
    pub state: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub fingerprint: Option<String>,

    pub content_id: Option<Uuid>,

    pub cached: bool,

    pub attempts: i32,

    pub spent_input_tokens: i64,

    pub spent_output_tokens: i64,

    #[sea_orm(column_type = "Text", nullable)]
    pub warning: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_kind: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::pipeline_job::Entity",
        from = "Column::JobId",
        to = "super::pipeline_job::Column::Id",
        on_delete = "Cascade"
    )]
    Job,
}

impl Related<super::pipeline_job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for StageUnit {
    type Error = AppError;

    fn try_from(m: Model) -> AppResult<Self> {
        Ok(StageUnit {
            id: m.id,
            job_id: m.job_id,
            stage: m.stage.parse()?,
            company_ref: m.company_ref,
            document_type: m.document_type,
            period_refs: serde_json::from_value(m.period_refs)?,
            depends_on: serde_json::from_value(m.depends_on)?,
            inputs: serde_json::from_value(m.inputs)?,
            state: m.state.parse()?,
            fingerprint: m.fingerprint,
            content_id: m.content_id,
            cached: m.cached,
            attempts: m.attempts.max(0) as u32,
            spent: TokenUsage {
                input_tokens: m.spent_input_tokens.max(0) as u64,
                output_tokens: m.spent_output_tokens.max(0) as u64,
            },
            warning: m.warning,
            error_kind: m.error_kind,
            error_message: m.error_message,
            created_at: m.created_at.with_timezone(&chrono::Utc),
            updated_at: m.updated_at.with_timezone(&chrono::Utc),
        })
    }
}

impl ActiveModel {
    pub fn from_unit(unit: &StageUnit) -> AppResult<Self> {
        use sea_orm::Set;

        Ok(ActiveModel {
            id: Set(unit.id),
            job_id: Set(unit.job_id),
            stage: Set(unit.stage.to_string()),
            company_ref: Set(unit.company_ref.clone()),
            document_type: Set(unit.document_type.clone()),
            period_refs: Set(serde_json::to_value(&unit.period_refs)?),
            depends_on: Set(serde_json::to_value(&unit.depends_on)?),
            inputs: Set(serde_json::to_value(&unit.inputs)?),
            state: Set(unit.state.as_str().to_string()),
            fingerprint: Set(unit.fingerprint.clone()),
            content_id: Set(unit.content_id),
            cached: Set(unit.cached),
            attempts: Set(unit.attempts as i32),
            spent_input_tokens: Set(unit.spent.input_tokens as i64),
            spent_output_tokens: Set(unit.spent.output_tokens as i64),
            warning: Set(unit.warning.clone()),
            error_kind: Set(unit.error_kind.clone()),
            error_message: Set(unit.error_message.clone()),
            created_at: Set(unit.created_at.into()),
            updated_at: Set(unit.updated_at.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InputRef, Stage, StageId, UnitState};
    use sea_orm::TryIntoModel;

    #[test]
    fn test_unit_survives_row_conversion() {
        let mut unit = StageUnit::new(Uuid::now_v7(), StageId::single_pass(Stage::DocumentSummary), "ACME");
        unit.document_type = Some("risk_factors".into());
        unit.period_refs = vec!["2023".into()];
        unit.depends_on = vec![Uuid::now_v7()];
        unit.inputs = vec![InputRef::Document(Uuid::now_v7())];
        unit.state = UnitState::Failed;
        unit.attempts = 2;
        unit.spent = TokenUsage {
            input_tokens: 1_200,
            output_tokens: 80,
        };
        unit.error_kind = Some("malformed_output".into());

        let model = ActiveModel::from_unit(&unit).unwrap().try_into_model().unwrap();
        assert_eq!(model.stage, unit.stage.to_string());
        assert_eq!(model.spent_input_tokens, 1_200);

        let back = StageUnit::try_from(model).unwrap();
        assert_eq!(back, unit);
    }

    #[test]
    fn test_unknown_state_is_rejected() {
        let unit = StageUnit::new(Uuid::now_v7(), StageId::full(Stage::Brief), "ACME");
        let mut model = ActiveModel::from_unit(&unit).unwrap().try_into_model().unwrap();
        model.state = "paused".into();

        assert!(StageUnit::try_from(model).is_err());
    }
}
