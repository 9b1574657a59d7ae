//! API handlers module

pub mod content;
pub mod health;
pub mod jobs;
pub mod usage;
