//! Git operations for AccuGit.

pub mod client;

pub use client::{signature_from_parts, CommitDetail, GitClient};
