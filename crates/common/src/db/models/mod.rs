//! SeaORM entity models
//!
//! Database entities for the FilingForge pipeline

mod document;
mod generated_content;
mod pipeline_job;
mod stage_unit;

pub use document::{
    Entity as DocumentEntity,
    Model as DocumentRow,
    ActiveModel as DocumentActiveModel,
    Column as DocumentColumn,
};

pub use generated_content::{
    Entity as GeneratedContentEntity,
    Model as GeneratedContentRow,
    ActiveModel as GeneratedContentActiveModel,
    Column as GeneratedContentColumn,
};

pub use pipeline_job::{
    Entity as PipelineJobEntity,
    Model as PipelineJobRow,
    ActiveModel as PipelineJobActiveModel,
    Column as PipelineJobColumn,
};

pub use stage_unit::{
    Entity as StageUnitEntity,
    Model as StageUnitRow,
    ActiveModel as StageUnitActiveModel,
    Column as StageUnitColumn,
};
