//! accugit core library.
//!
//! This crate provides the components of the AccuRev-to-Git conversion
//! engine: configuration, the AccuRev client and XML parsers, the
//! repository client, the refs-based state store, the retrieval and
//! processing stages, history stitching, and the orchestrating engine.

pub mod accurev;
pub mod config;
pub mod engine;
pub mod errors;
pub mod format;
pub mod git;
pub mod merge;
pub mod models;
pub mod process;
pub mod retrieve;
pub mod stitch;
pub mod store;
pub mod usermap;

// Re-exports for convenience.
pub use config::AppConfig;
pub use engine::{ConversionEngine, RunSummary, StatusReport};
pub use errors::CoreError;
pub use stitch::StitchPlan;
