//! AccuRev CLI integration: async client and XML output parsers.

pub mod client;
pub mod parser;

pub use client::AccuRevClient;
pub use parser::SessionInfo;
