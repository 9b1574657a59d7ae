//! Document entity (written by ingestion)

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::types::Document;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "documents")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[sea_orm(column_type = "Text")]
    pub company_ref: String,

    #[sea_orm(column_type = "Text")]
    pub period_ref: String,

    #[sea_orm(column_type = "Text")]
    pub document_type: String,

    #[sea_orm(column_type = "Text")]
    pub text: String,

    /// SHA-256 of the normalized text
    #[sea_orm(column_type = "Text")]
    pub content_hash: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<Model> for Document {
    fn from(m: Model) -> Self {
        Document {
            id: m.id,
            company_ref: m.company_ref,
            period_ref: m.period_ref,
            document_type: m.document_type,
            text: m.text,
            content_hash: m.content_hash,
            created_at: m.created_at.with_timezone(&chrono::Utc),
        }
    }
}

impl From<Document> for ActiveModel {
    fn from(d: Document) -> Self {
        use sea_orm::Set;

        ActiveModel {
            id: Set(d.id),
            company_ref: Set(d.company_ref),
            period_ref: Set(d.period_ref),
            document_type: Set(d.document_type),
            text: Set(d.text),
            content_hash: Set(d.content_hash),
            created_at: Set(d.created_at.into()),
        }
    }
}
