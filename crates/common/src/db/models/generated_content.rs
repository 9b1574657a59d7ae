//! Generated content entity, unique by fingerprint

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result as AppResult};
use crate::types::{Fingerprint, GeneratedContent, InputRef, NewGeneratedContent, TokenUsage};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "generated_contents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Unique index; the at-most-once guarantee rests on it
    #[sea_orm(column_type = "Text", unique)]
    pub fingerprint: String,

    #[sea_orm(column_type = "Text")]
    pub stage: String,

    #[sea_orm(column_type = "Text")]
    pub company_ref: String,

    #[sea_orm(column_type = "Text", nullable)]
    pub document_type: Option<String>,

    #[sea_orm(column_type = "JsonBinary")]
    pub period_refs: serde_json::Value,

    /// Ordered `doc:<uuid>` / `gen:<uuid>` references
    #[sea_orm(column_type = "JsonBinary")]
    pub inputs: serde_json::Value,

    #[sea_orm(column_type = "Text")]
    pub model_config_id: String,

    #[sea_orm(column_type = "Text")]
    pub system_prompt_id: String,

    #[sea_orm(column_type = "Text")]
    pub user_prompt_id: String,

    #[sea_orm(column_type = "Text")]
    pub text: String,

    #[sea_orm(column_type = "Text")]
    pub summary: String,

    pub input_tokens: i64,

    pub output_tokens: i64,

    #[sea_orm(column_type = "Text", nullable)]
    pub warning: Option<String>,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_state: Option<String>,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for GeneratedContent {
    type Error = AppError;

    fn try_from(m: Model) -> AppResult<Self> {
        let inputs: Vec<InputRef> = serde_json::from_value(m.inputs)?;
        let period_refs: Vec<String> = serde_json::from_value(m.period_refs)?;

        Ok(GeneratedContent {
            id: m.id,
            fingerprint: Fingerprint::from_hex(m.fingerprint)?,
            stage: m.stage.parse()?,
            company_ref: m.company_ref,
            document_type: m.document_type,
            period_refs,
            inputs,
            model_config_id: m.model_config_id,
            system_prompt_id: m.system_prompt_id,
            user_prompt_id: m.user_prompt_id,
            text: m.text,
            summary: m.summary,
            usage: TokenUsage {
                input_tokens: m.input_tokens.max(0) as u64,
                output_tokens: m.output_tokens.max(0) as u64,
            },
            warning: m.warning,
            error_state: m.error_state,
            created_at: m.created_at.with_timezone(&chrono::Utc),
        })
    }
}

impl ActiveModel {
    /// Build the insert model for a new row with an assigned id and timestamp
    pub fn from_new(
        id: Uuid,
        created_at: chrono::DateTime<chrono::Utc>,
        new: &NewGeneratedContent,
    ) -> AppResult<Self> {
        use sea_orm::Set;

        Ok(ActiveModel {
            id: Set(id),
            fingerprint: Set(new.fingerprint.to_string()),
            stage: Set(new.stage.to_string()),
            company_ref: Set(new.company_ref.clone()),
            document_type: Set(new.document_type.clone()),
            period_refs: Set(serde_json::to_value(&new.period_refs)?),
            inputs: Set(serde_json::to_value(&new.inputs)?),
            model_config_id: Set(new.model_config_id.clone()),
            system_prompt_id: Set(new.system_prompt_id.clone()),
            user_prompt_id: Set(new.user_prompt_id.clone()),
            text: Set(new.text.clone()),
            summary: Set(new.summary.clone()),
            input_tokens: Set(new.usage.input_tokens as i64),
            output_tokens: Set(new.usage.output_tokens as i64),
            warning: Set(new.warning.clone()),
            error_state: Set(new.error_state.clone()),
            created_at: Set(created_at.into()),
        })
    }
}
