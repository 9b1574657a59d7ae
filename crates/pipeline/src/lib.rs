//! FilingForge generation pipeline
//!
//! Turns source documents into three layers of generated content:
//! per-document summaries, per-type aggregates across periods, and short
//! briefs per company or company group. Every generation is addressed by a
//! content fingerprint, so re-running a processed scope costs nothing.

pub mod error;
pub mod executor;
pub mod fingerprint;
pub mod orchestrator;
pub mod plan;
pub mod provenance;
pub mod quality;
pub mod registry;
pub mod usage;

pub use error::StageError;
pub use executor::{Execution, RetryPolicy, StageExecutor, StageRequest};
pub use orchestrator::Orchestrator;
pub use plan::ExecutionPlan;
pub use provenance::{verify_acyclic, ProvenanceGraph};
pub use quality::QualityPolicy;
pub use registry::{ConfigRegistry, RoutingPolicy};
pub use usage::UsageReport;
