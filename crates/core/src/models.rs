//! Domain model types used throughout AccuGit.
//!
//! These types bridge the AccuRev adapter, the state store, and the
//! conversion pipeline.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Depot
// ---------------------------------------------------------------------------

/// One depot as listed by `show depots`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Depot {
    pub number: u64,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

/// Stream type. Only workspace-vs-not is consumed by the conversion; the
/// remaining kinds are parsed so listings round-trip cleanly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    Normal,
    Workspace,
    Snapshot,
    Passthrough,
    Gated,
    Staging,
}

impl StreamKind {
    /// Parse a kind string from a streams listing.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "workspace" => Self::Workspace,
            "snapshot" => Self::Snapshot,
            "passthrough" => Self::Passthrough,
            "gated" => Self::Gated,
            "staging" => Self::Staging,
            _ => Self::Normal,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Workspace => write!(f, "workspace"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Passthrough => write!(f, "passthrough"),
            Self::Gated => write!(f, "gated"),
            Self::Staging => write!(f, "staging"),
        }
    }
}

/// One stream as listed by `show streams` at a point in time.
///
/// Every stream except the depot root has exactly one basis; the `prev_*`
/// fields carry the pre-rename / pre-reparent values when the listing is
/// taken at a `chstream` transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Stream {
    pub name: String,
    pub stream_number: u64,
    pub depot_name: String,
    pub kind: StreamKind,
    pub basis: Option<String>,
    pub basis_stream_number: Option<u64>,
    pub prev_name: Option<String>,
    pub prev_basis: Option<String>,
    pub prev_basis_stream_number: Option<u64>,
    pub time_lock: Option<DateTime<Utc>>,
    pub prev_time_lock: Option<DateTime<Utc>>,
}

impl Stream {
    pub fn is_workspace(&self) -> bool {
        self.kind == StreamKind::Workspace
    }
}

/// The parsed `show streams` listing at a point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub streams: Vec<Stream>,
}

impl StreamSnapshot {
    pub fn by_number(&self, number: u64) -> Option<&Stream> {
        self.streams.iter().find(|s| s.stream_number == number)
    }

    pub fn by_name(&self, name: &str) -> Option<&Stream> {
        self.streams.iter().find(|s| s.name == name)
    }

    /// Basis stream of `stream` within this snapshot, resolved by number
    /// first and by name as a fallback.
    pub fn basis_of(&self, stream: &Stream) -> Option<&Stream> {
        if let Some(number) = stream.basis_stream_number {
            if let Some(basis) = self.by_number(number) {
                return Some(basis);
            }
        }
        stream.basis.as_deref().and_then(|name| self.by_name(name))
    }

    /// Whether `ancestor` appears on `descendant`'s basis chain. The walk
    /// carries a visited set so a malformed listing cannot loop.
    pub fn is_ancestor_of(&self, ancestor: u64, descendant: u64) -> bool {
        let mut visited = HashSet::new();
        let mut current = match self.by_number(descendant) {
            Some(s) => s,
            None => return false,
        };
        while let Some(basis) = self.basis_of(current) {
            if !visited.insert(basis.stream_number) {
                return false;
            }
            if basis.stream_number == ancestor {
                return true;
            }
            current = basis;
        }
        false
    }

    /// All stream names in the listing, for set-difference comparisons.
    pub fn name_set(&self) -> BTreeSet<String> {
        self.streams.iter().map(|s| s.name.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

/// The closed set of depot transaction kinds the converter understands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    MkStream,
    ChStream,
    Add,
    Keep,
    Co,
    Move,
    Promote,
    Defunct,
    Purge,
    DefComp,
}

impl TransactionKind {
    /// Parse a kind string from a history listing. Unknown kinds return
    /// `None`; callers treat that as fatal at first encounter.
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "mkstream" => Some(Self::MkStream),
            "chstream" => Some(Self::ChStream),
            "add" => Some(Self::Add),
            "keep" => Some(Self::Keep),
            "co" => Some(Self::Co),
            "move" => Some(Self::Move),
            "promote" => Some(Self::Promote),
            "defunct" => Some(Self::Defunct),
            "purge" => Some(Self::Purge),
            "defcomp" => Some(Self::DefComp),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MkStream => write!(f, "mkstream"),
            Self::ChStream => write!(f, "chstream"),
            Self::Add => write!(f, "add"),
            Self::Keep => write!(f, "keep"),
            Self::Co => write!(f, "co"),
            Self::Move => write!(f, "move"),
            Self::Promote => write!(f, "promote"),
            Self::Defunct => write!(f, "defunct"),
            Self::Purge => write!(f, "purge"),
            Self::DefComp => write!(f, "defcomp"),
        }
    }
}

/// One element (file or directory) version carried by a transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElementVersion {
    pub path: String,
    pub element_id: Option<u64>,
    pub is_dir: bool,
    /// Virtual version in named `stream/number` form.
    pub virtual_named: Option<String>,
    /// Real version in named form (the workspace that created it).
    pub real_named: Option<String>,
    pub from_stream_name: Option<String>,
    pub from_stream_number: Option<u64>,
}

impl ElementVersion {
    /// Stream-name part of the virtual named version.
    pub fn virtual_stream_name(&self) -> Option<&str> {
        self.virtual_named
            .as_deref()
            .and_then(|v| v.rsplit_once('/'))
            .map(|(stream, _)| stream)
    }
}

/// One depot transaction from an expanded history listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: u64,
    pub kind: TransactionKind,
    pub user: String,
    pub time: DateTime<Utc>,
    pub comment: Option<String>,
    pub versions: Vec<ElementVersion>,
}

impl Transaction {
    /// Promotion destination stream, derived from the first version's
    /// virtual named version.
    pub fn to_stream(&self) -> Option<&str> {
        self.versions.first().and_then(|v| v.virtual_stream_name())
    }

    /// Promotion source stream, when the server recorded one. Old servers
    /// omit it, in which case the promotion is handled as a cherry-pick.
    pub fn from_stream(&self) -> Option<(&str, Option<u64>)> {
        self.versions.first().and_then(|v| {
            v.from_stream_name
                .as_deref()
                .map(|name| (name, v.from_stream_number))
        })
    }
}

// ---------------------------------------------------------------------------
// Diff report
// ---------------------------------------------------------------------------

/// The set of element paths named by a `diff -a -i` query between two
/// transactions. Paths are depot-relative with forward slashes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffReport {
    pub paths: Vec<String>,
}

impl DiffReport {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Commit annotation
// ---------------------------------------------------------------------------

/// The JSON record attached as a git note to every produced branch commit.
///
/// A branch commit without a readable annotation is corrupt state; the
/// `dst_*` / `src_*` fields are present only for promotions whose endpoint
/// streams are known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommitAnnotation {
    pub depot: String,
    pub stream: String,
    pub stream_number: u64,
    pub transaction_number: u64,
    pub transaction_kind: TransactionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_stream_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_stream: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_stream_number: Option<u64>,
}

// ---------------------------------------------------------------------------
// Progress records
// ---------------------------------------------------------------------------

/// Per-stream retrieval progress, written only after both histories for the
/// stream are complete through the recorded transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HighWaterMark {
    pub high_water_mark: u64,
}

/// Processing-stage checkpoint, written after a transaction is fully
/// replayed across all affected branches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessingCheckpoint {
    pub depot: u64,
    pub stream_map: BTreeMap<u64, String>,
    pub last_transaction: u64,
}
