//! Domain types shared by the pipeline, the store backends and the binaries

mod content;
mod document;
mod job;

pub use content::{
    Fingerprint, GeneratedContent, InputRef, NewGeneratedContent, Route, Stage, StageId,
    TokenUsage,
};
pub use document::{content_hash, normalize_text, Document};
pub use job::{
    DependencyPolicy, JobScope, JobState, JobStatus, PipelineJob, StageProgress, StageUnit,
    UnitFailure, UnitState,
};
