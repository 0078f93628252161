//! Conversion orchestration.
//!
//! [`ConversionEngine`] wires the AccuRev client, the Git repository, the
//! state store and the user map together and drives the stages in order:
//! resolve the depot and transaction range, retrieve each configured stream,
//! replay the retrieved histories onto branches, and optionally stitch the
//! result. Every stage persists its own progress, so a killed run resumes by
//! simply running again.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::accurev::parser::parse_depots;
use crate::accurev::AccuRevClient;
use crate::config::AppConfig;
use crate::errors::{AccuRevError, ConvertError};
use crate::format::{sanitize_branch_name, MessageFormatter};
use crate::git::GitClient;
use crate::models::{Depot, ProcessingCheckpoint, Stream, StreamSnapshot};
use crate::process::{self, Processor};
use crate::retrieve::Retriever;
use crate::stitch::{StitchPlan, Stitcher};
use crate::store::{
    self, GitStateStore, LogEntry, StateStore, ANNOTATION_NOTES_REF, DEPOTS_KEY, RAW_NOTES_REF,
    REF_ROOT,
};
use crate::usermap::UserMap;

/// Everything `prepare` resolved for one run: the depot, the transaction
/// range, and the streams in retrieval order.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub depot: Depot,
    pub start: u64,
    pub end: u64,
    /// Streams ordered so a basis always precedes its children.
    pub streams: Vec<Stream>,
    pub branches: BTreeMap<u64, String>,
    pub pinned: BTreeSet<u64>,
}

/// Result of one conversion pass.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub processed_through: u64,
    pub branches: BTreeMap<u64, String>,
}

/// Offline progress report for one converted stream.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub stream_number: u64,
    pub branch: String,
    pub high_water_mark: Option<u64>,
    pub tip: Option<String>,
}

/// Offline progress report for the whole conversion.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub checkpoint: Option<ProcessingCheckpoint>,
    pub streams: Vec<StreamStatus>,
}

pub struct ConversionEngine {
    config: AppConfig,
    accurev: AccuRevClient,
    git: GitClient,
    store: GitStateStore,
    usermap: UserMap,
    formatter: MessageFormatter,
    plan: Option<RunPlan>,
}

impl ConversionEngine {
    /// Open (creating if needed) the target repository and assemble the
    /// stage components. No server contact happens here.
    pub fn new(config: AppConfig) -> Result<Self> {
        let git = GitClient::init_or_open(&config.git.repo_path)?;
        let store = GitStateStore::open(&config.git.repo_path)?;
        let usermap = UserMap::from_entries(&config.usermap)?;
        let formatter = MessageFormatter::new(config.git.message_style);
        let accurev = AccuRevClient::new(
            config.accurev.username.clone(),
            config.accurev.password.clone(),
            config.conversion.retry_attempts,
            config.conversion.retry_delay_secs,
        );
        Ok(Self {
            config,
            accurev,
            git,
            store,
            usermap,
            formatter,
            plan: None,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn depot_name(&self) -> &str {
        &self.config.accurev.depot
    }

    /// The resolved run plan. Errors until [`prepare`](Self::prepare) has run.
    pub fn plan(&self) -> Result<&RunPlan> {
        self.plan.as_ref().context("run plan missing; prepare the engine first")
    }

    // -----------------------------------------------------------------------
    // Preparation
    // -----------------------------------------------------------------------

    /// Establish the session, resolve the depot and transaction range, and
    /// map configured streams to branches.
    #[instrument(skip(self), fields(depot = %self.config.accurev.depot))]
    pub async fn prepare(&mut self) -> Result<&RunPlan> {
        self.accurev.ensure_session().await?;
        let depot = self.resolve_depot().await?;

        let end = match self.config.accurev.end_transaction_number() {
            Some(number) => number,
            None => self
                .accurev
                .latest_transaction(&depot.name)
                .await?
                .map(|tr| tr.id)
                .with_context(|| format!("depot '{}' has no transactions", depot.name))?,
        };
        let start = self.config.accurev.start_transaction;
        if start > end {
            bail!(
                "start transaction {} is past end transaction {}",
                start,
                end
            );
        }

        let snapshot = self
            .accurev
            .streams(&depot.name, None, Some(&end.to_string()))
            .await?;
        let (branches, pinned) = self.stream_mapping(&snapshot, &depot.name)?;
        let numbers: Vec<u64> = branches.keys().copied().collect();
        let order = process::topo_order(&snapshot, &numbers)?;
        let streams: Vec<Stream> = order
            .iter()
            .filter_map(|&n| snapshot.by_number(n).cloned())
            .collect();

        info!(
            depot = %depot.name,
            depot_number = depot.number,
            start,
            end,
            streams = streams.len(),
            "run plan resolved"
        );
        Ok(self.plan.insert(RunPlan {
            depot,
            start,
            end,
            streams,
            branches,
            pinned,
        }))
    }

    /// Depot lookup against the stored listing, refreshing it from the
    /// server once when the name is absent.
    async fn resolve_depot(&self) -> Result<Depot> {
        let name = self.config.accurev.depot.clone();
        if let Some(depot) = self.stored_depot(&name)? {
            return Ok(depot);
        }

        let xml = self.accurev.depots_xml().await?;
        let identity = self.usermap.resolve(self.accurev.username());
        // Depot listings are snapshots, not transactions; the log position
        // stands in for the transaction id.
        let sequence = self.store.log(DEPOTS_KEY)?.len() as u64 + 1;
        self.store.append(
            DEPOTS_KEY,
            LogEntry::from_files(
                sequence,
                vec![("depots.xml".to_string(), xml.into_bytes())],
                &identity.name,
                &identity.email,
                Utc::now().timestamp(),
                identity.offset_minutes,
            ),
        )?;

        match self.stored_depot(&name)? {
            Some(depot) => Ok(depot),
            None => Err(AccuRevError::DepotNotFound(name).into()),
        }
    }

    fn stored_depot(&self, name: &str) -> Result<Option<Depot>> {
        let record = match self.store.last(DEPOTS_KEY)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let bytes = self.store.read_file(record.commit, "depots.xml")?;
        let depots = parse_depots(&String::from_utf8_lossy(&bytes))?;
        // The configured depot may be a name or a bare number.
        let number: Option<u64> = name.parse().ok();
        Ok(depots
            .into_iter()
            .find(|d| d.name == name || Some(d.number) == number))
    }

    /// Stream-number-to-branch map plus the set of streams whose branch
    /// name is fixed by configuration. An empty stream list in the
    /// configuration selects every non-workspace stream.
    fn stream_mapping(
        &self,
        snapshot: &StreamSnapshot,
        depot: &str,
    ) -> Result<(BTreeMap<u64, String>, BTreeSet<u64>)> {
        let mut branches = BTreeMap::new();
        let mut pinned = BTreeSet::new();
        if self.config.streams.is_empty() {
            for stream in &snapshot.streams {
                if stream.is_workspace() {
                    continue;
                }
                branches.insert(stream.stream_number, sanitize_branch_name(&stream.name));
            }
        } else {
            for entry in &self.config.streams {
                let stream = snapshot.by_name(&entry.stream).ok_or_else(|| {
                    ConvertError::StreamNotFound {
                        depot: depot.to_string(),
                        stream: entry.stream.clone(),
                    }
                })?;
                match &entry.branch {
                    Some(branch) => {
                        branches.insert(stream.stream_number, sanitize_branch_name(branch));
                        pinned.insert(stream.stream_number);
                    }
                    None => {
                        branches
                            .insert(stream.stream_number, sanitize_branch_name(&stream.name));
                    }
                }
            }
        }
        if branches.is_empty() {
            bail!("no streams selected for depot '{}'", depot);
        }
        Ok((branches, pinned))
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    /// Retrieve one stream's metadata and content history up to the planned
    /// end transaction. Returns the resulting content position, `None` when
    /// the stream has no content in range.
    pub async fn retrieve_stream(&self, stream: &Stream) -> Result<Option<(u64, git2::Oid)>> {
        let plan = self.plan()?;
        let retriever = Retriever::new(
            &self.accurev,
            &self.git,
            &self.store,
            &self.usermap,
            &plan.depot.name,
            plan.depot.number,
            self.config.conversion.method,
            self.config.conversion.preserve_empty_dirs,
        );
        Ok(retriever.retrieve_stream(stream, plan.start, plan.end).await?)
    }

    /// Retrieve every planned stream, basis streams first.
    pub async fn retrieve_all(&self) -> Result<()> {
        let plan = self.plan()?;
        for stream in &plan.streams {
            self.retrieve_stream(stream).await?;
        }
        Ok(())
    }

    /// Replay retrieved histories onto branches, up to the depot-wide
    /// retrieval floor.
    pub fn process(&mut self) -> Result<RunSummary> {
        let (depot_name, depot_number, branches, pinned) = {
            let plan = self.plan()?;
            (
                plan.depot.name.clone(),
                plan.depot.number,
                plan.branches.clone(),
                plan.pinned.clone(),
            )
        };
        let mut processor = Processor::new(
            &self.git,
            &self.store,
            &self.usermap,
            &self.formatter,
            &depot_name,
            depot_number,
            branches,
            pinned,
        );
        let processed_through = processor.run()?;
        let branches = processor.branches().clone();
        drop(processor);
        if let Some(plan) = self.plan.as_mut() {
            plan.branches = branches.clone();
        }
        Ok(RunSummary {
            processed_through,
            branches,
        })
    }

    /// One full conversion pass: prepare, retrieve, process.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.prepare().await?;
        self.retrieve_all().await?;
        self.process()
    }

    // -----------------------------------------------------------------------
    // Finalization
    // -----------------------------------------------------------------------

    /// Build the stitch plan over the converted branches, optionally
    /// applying it. Works offline from the persisted checkpoint; refused
    /// while processing lags retrieval.
    #[instrument(skip(self))]
    pub fn finalize(&self, apply: bool) -> Result<StitchPlan> {
        let checkpoint = store::read_checkpoint(&self.store)?
            .context("no processing checkpoint; run the conversion first")?;
        if checkpoint.stream_map.is_empty() {
            bail!("processing checkpoint names no branches");
        }

        let mut floor = u64::MAX;
        for &number in checkpoint.stream_map.keys() {
            match store::read_hwm(&self.store, checkpoint.depot, number)? {
                Some(hwm) => floor = floor.min(hwm.high_water_mark),
                None => floor = 0,
            }
        }
        if checkpoint.last_transaction < floor {
            return Err(ConvertError::NotCaughtUp {
                processed: checkpoint.last_transaction,
                retrieved: floor,
            }
            .into());
        }

        let stitcher = Stitcher::new(
            &self.git,
            &self.store,
            checkpoint.depot,
            &checkpoint.stream_map,
        );
        let plan = stitcher.build_plan()?;
        if apply {
            stitcher.apply(&plan)?;
        }
        Ok(plan)
    }

    // -----------------------------------------------------------------------
    // Inspection and maintenance
    // -----------------------------------------------------------------------

    /// Progress report from persisted state only; no server contact.
    pub fn status(&self) -> Result<StatusReport> {
        let checkpoint = store::read_checkpoint(&self.store)?;
        let mut streams = Vec::new();
        if let Some(checkpoint) = &checkpoint {
            for (&number, branch) in &checkpoint.stream_map {
                let high_water_mark = store::read_hwm(&self.store, checkpoint.depot, number)?
                    .map(|hwm| hwm.high_water_mark);
                let tip = self.git.branch_tip(branch)?.map(|oid| oid.to_string());
                streams.push(StreamStatus {
                    stream_number: number,
                    branch: branch.clone(),
                    high_water_mark,
                    tip,
                });
            }
        }
        Ok(StatusReport {
            checkpoint,
            streams,
        })
    }

    /// Principals appearing in the configured transaction range that have
    /// no usermap entry.
    pub async fn unmapped_users(&self) -> Result<Vec<String>> {
        self.accurev.ensure_session().await?;
        let depot = self.resolve_depot().await?;
        let end = match self.config.accurev.end_transaction_number() {
            Some(number) => number.to_string(),
            None => "now".to_string(),
        };
        let range = format!("{}-{}", self.config.accurev.start_transaction, end);
        let transactions = self.accurev.hist(&depot.name, None, &range, None).await?;
        Ok(self
            .usermap
            .unmapped(transactions.iter().map(|tr| tr.user.as_str())))
    }

    /// Delete every conversion ref, both notes namespaces, and the mapped
    /// branches. Unreferenced objects are left to git's own pruning.
    /// Returns the number of refs removed.
    pub fn wipe(&self) -> Result<usize> {
        let mut deleted = 0usize;
        if let Some(checkpoint) = store::read_checkpoint(&self.store)? {
            for branch in checkpoint.stream_map.values() {
                if self.git.branch_tip(branch)?.is_some() {
                    self.git.delete_branch(branch)?;
                    deleted += 1;
                }
            }
        }
        for (name, _) in self.git.list_refs(REF_ROOT)? {
            self.git.delete_ref(&name)?;
            deleted += 1;
        }
        for notes in [ANNOTATION_NOTES_REF, RAW_NOTES_REF] {
            if self.git.ref_tip(notes)?.is_some() {
                self.git.delete_ref(notes)?;
                deleted += 1;
            }
        }
        warn!(deleted, "conversion state wiped");
        Ok(deleted)
    }
}
