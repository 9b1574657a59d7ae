//! FilingForge Common Library
//!
//! Shared code for the FilingForge pipeline and its binaries including:
//! - Domain types for documents, generated content and pipeline jobs
//! - The `PipelineStore` abstraction with Postgres and in-memory backends
//! - Text-completion client abstraction with global throttling
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability

pub mod config;
pub mod db;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use llm::CompletionClient;
pub use store::{open_store, MemoryStore, PipelineStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default completion model for single-document extraction
pub const DEFAULT_EXTRACTION_MODEL: &str = "gpt-4o-mini";

/// Default completion model for cross-document synthesis
pub const DEFAULT_SYNTHESIS_MODEL: &str = "gpt-4o";
