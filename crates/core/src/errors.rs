//! Comprehensive error types for the AccuGit core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    AccuRev(#[from] AccuRevError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    UserMap(#[from] UserMapError),
}

// ---------------------------------------------------------------------------
// AccuRev errors
// ---------------------------------------------------------------------------

/// Errors from AccuRev CLI operations.
#[derive(Debug, Error)]
pub enum AccuRevError {
    /// The `accurev` binary was not found on `$PATH`.
    #[error("accurev binary not found: {0}")]
    BinaryNotFound(String),

    /// An `accurev` command exited with a non-zero status.
    #[error("accurev command failed (exit {exit_code}): {stderr}")]
    CommandFailed {
        exit_code: i32,
        stderr: String,
    },

    /// The retry budget for a command was exhausted.
    #[error("accurev command '{command}' failed after {attempts} attempts: {detail}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        detail: String,
    },

    /// Could not parse the XML output produced by `accurev`.
    #[error("failed to parse accurev XML output: {0}")]
    XmlParseError(String),

    /// A history listing contained a transaction kind outside the closed
    /// set. Surfaced at first encounter, never skipped.
    #[error("unrecognized transaction kind '{kind}' in transaction {transaction}")]
    UnknownTransactionKind {
        kind: String,
        transaction: u64,
    },

    /// Login failed or the session belongs to the wrong principal.
    #[error("accurev login failed for user '{username}': {detail}")]
    LoginFailed {
        username: String,
        detail: String,
    },

    /// The requested depot does not exist on the server.
    #[error("accurev depot not found: {0}")]
    DepotNotFound(String),

    /// Generic I/O wrapper.
    #[error("accurev I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A compare-and-swap ref update found an unexpected old tip.
    #[error("stale update for ref '{reference}': {detail}")]
    StaleRefUpdate {
        reference: String,
        detail: String,
    },

    /// A ref update reported success but the visible tip did not move.
    #[error("ref '{reference}' unchanged after update to {target}")]
    RefUnchanged {
        reference: String,
        target: String,
    },

    /// The working tree is dirty where a clean one is required.
    #[error("working tree not clean: {0}")]
    DirtyWorkTree(String),

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// State store errors
// ---------------------------------------------------------------------------

/// Errors from the persistent state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested key has no value.
    #[error("state key not found: {0}")]
    KeyNotFound(String),

    /// A stored record could not be decoded.
    #[error("corrupt state record under '{key}': {detail}")]
    Corrupt {
        key: String,
        detail: String,
    },

    /// A named file is missing from a stored log entry.
    #[error("file '{name}' missing from state entry {commit}")]
    FileMissing {
        name: String,
        commit: String,
    },

    /// Underlying Git error from the repository-backed store.
    #[error("state store git error: {0}")]
    GitError(#[from] GitError),

    /// Generic I/O wrapper.
    #[error("state store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Conversion errors
// ---------------------------------------------------------------------------

/// Errors from the retrieval / processing / stitching pipeline.
#[derive(Debug, Error)]
pub enum ConvertError {
    /// Metadata and content history disagree on the last transaction.
    #[error("stream '{stream}' histories misaligned: metadata at {metadata_tx}, content at {content_tx}")]
    HistoryMisaligned {
        stream: String,
        metadata_tx: u64,
        content_tx: u64,
    },

    /// A branch commit has no readable annotation where one is mandatory.
    #[error("commit {commit} on branch '{branch}' has no annotation")]
    MissingAnnotation {
        commit: String,
        branch: String,
    },

    /// The stream basis relation contains a cycle.
    #[error("basis cycle detected involving stream '{0}'")]
    BasisCycle(String),

    /// The stitching alias map contains a cycle.
    #[error("alias cycle detected at commit {0}")]
    AliasCycle(String),

    /// A stitch rewrite would drop an original parent.
    #[error("rewrite of commit {commit} drops parent {parent}")]
    ParentDropped {
        commit: String,
        parent: String,
    },

    /// A stream named in the configuration is unknown to the depot.
    #[error("stream not found in depot '{depot}': {stream}")]
    StreamNotFound {
        depot: String,
        stream: String,
    },

    /// Finalization was requested while processing lags retrieval.
    #[error("processing at transaction {processed} lags retrieval at {retrieved}; finalize refused")]
    NotCaughtUp {
        processed: u64,
        retrieved: u64,
    },

    /// Processing was asked to cover a stream retrieval has not reached.
    #[error("stream '{stream}' has no retrieval high-water mark; run retrieval first")]
    NotRetrieved {
        stream: String,
    },

    /// Underlying AccuRev error.
    #[error("conversion accurev error: {0}")]
    AccuRevError(#[from] AccuRevError),

    /// Underlying Git error.
    #[error("conversion git error: {0}")]
    GitError(#[from] GitError),

    /// Underlying state store error.
    #[error("conversion state store error: {0}")]
    StoreError(#[from] StoreError),

    /// Identity mapping error during processing.
    #[error("conversion user map error: {0}")]
    UserMapError(#[from] UserMapError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A required environment variable is not set.
    #[error("required environment variable '{var}' is not set (referenced by config field '{field}')")]
    EnvVarMissing {
        var: String,
        field: String,
    },

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue {
        field: String,
        detail: String,
    },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// User map errors
// ---------------------------------------------------------------------------

/// Errors from the username mapping subsystem.
#[derive(Debug, Error)]
pub enum UserMapError {
    /// A usermap entry carries an unparseable timezone offset.
    #[error("invalid timezone '{spec}' for user '{user}' (expected +HHMM or -HHMM)")]
    InvalidTimezone {
        user: String,
        spec: String,
    },

    /// A usermap entry is incomplete.
    #[error("incomplete mapping for user '{user}': {detail}")]
    IncompleteMapping {
        user: String,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// Convenience conversions
// ---------------------------------------------------------------------------

// CoreError implements `std::error::Error` via `thiserror`, which means
// `anyhow::Error: From<CoreError>` is already provided by the blanket impl
// in `anyhow`. No manual `From` impl is needed.
