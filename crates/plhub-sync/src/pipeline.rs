use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use plhub_adapters::{discover_datasets, source_for_path, Dataset, SourceFingerprint, TabularSource};
use plhub_core::{EntityId, EntityKind, EntityRecord, FieldMap, FieldValue, MasterKey, SourceRow};
use plhub_storage::{retry_store_op, EntityStore, StoreError, WriteOutcome};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::aliases::{AliasTable, NameKind};
use crate::canonical::Canonicalizer;
use crate::config::SyncConfig;
use crate::control::RunControl;
use crate::index::{Collision, MasterKeyIndex, NameIndex};
use crate::loaders::LoadContext;
use crate::resolver::{EntityResolver, ResolveOutcome};
use crate::row::{ReconciliationRow, Rejection, RejectionCategory};
use crate::upsert::{UpsertEngine, WriteBatch};

/// Rejected rows kept per stage for the run summary.
pub const MAX_REPORTED_REJECTIONS: usize = 50;

/// Failures that end a run. Row-level problems never do.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store unreachable before any row was processed: {0}")]
    StoreUnreachable(#[source] StoreError),
    #[error("could not load {dataset} lookups from the store: {source}")]
    Lookup {
        dataset: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("store outage during {dataset}: {consecutive} consecutive writes exhausted their retries")]
    StoreOutage {
        dataset: &'static str,
        consecutive: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StageReport {
    pub source: String,
    pub rows_read: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Rows superseded by a later row with the same target key in the same batch.
    pub collapsed: usize,
    /// Rows neither written nor rejected because the run stopped.
    pub skipped: usize,
    pub created_entities: usize,
    pub adopted_entities: usize,
    pub fuzzy_matches: usize,
    pub rejections: BTreeMap<RejectionCategory, usize>,
    pub rejected_rows: Vec<ReconciliationRow>,
}

impl StageReport {
    fn new(source: String) -> Self {
        Self {
            source,
            ..Self::default()
        }
    }

    pub fn rejected(&self) -> usize {
        self.rejections.values().sum()
    }

    fn reject(&mut self, mut row: ReconciliationRow, rejection: Rejection) {
        if !matches!(rejection, Rejection::UnresolvedName { .. }) {
            warn!(dataset = row.dataset.label(), line = row.line, reason = %rejection, "row rejected");
        }
        *self.rejections.entry(rejection.category()).or_default() += 1;
        if self.rejected_rows.len() < MAX_REPORTED_REJECTIONS {
            row.rejection = Some(rejection);
            self.rejected_rows.push(row);
        }
    }

    fn tally(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Inserted(_) => self.inserted += 1,
            WriteOutcome::Updated(_) => self.updated += 1,
            WriteOutcome::Unchanged(_) => self.unchanged += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stages: BTreeMap<Dataset, StageReport>,
    /// Stored matches sharing one master key. The first of each pair is used.
    pub integrity_faults: Vec<Collision<MasterKey, EntityId>>,
    pub sources: Vec<SourceFingerprint>,
    /// Records per entity kind read back from the store once loading ended.
    pub store_counts: BTreeMap<EntityKind, usize>,
}

impl SyncRunSummary {
    fn total(&self, pick: impl Fn(&StageReport) -> usize) -> usize {
        self.stages.values().map(pick).sum()
    }

    pub fn rows_read(&self) -> usize {
        self.total(|s| s.rows_read)
    }

    pub fn rejected(&self) -> usize {
        self.total(StageReport::rejected)
    }

    pub fn one_line(&self) -> String {
        format!(
            "run {} {}: {} rows read, {} inserted, {} updated, {} unchanged, {} collapsed, {} rejected, {} skipped, {} integrity faults",
            self.run_id,
            self.status,
            self.rows_read(),
            self.total(|s| s.inserted),
            self.total(|s| s.updated),
            self.total(|s| s.unchanged),
            self.total(|s| s.collapsed),
            self.rejected(),
            self.total(|s| s.skipped),
            self.integrity_faults.len(),
        )
    }
}

/// Name lookups rebuilt from the store at the start of each stage.
struct StageLookups {
    canonicalizer: Canonicalizer,
    teams: NameIndex,
    stadiums: NameIndex,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn EntityStore>,
    aliases: Arc<AliasTable>,
    control: Arc<RunControl>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn EntityStore>, aliases: Arc<AliasTable>) -> Self {
        let control = Arc::new(RunControl::new(config.outage_threshold));
        Self {
            config,
            store,
            aliases,
            control,
        }
    }

    /// Handle for requesting cancellation from outside the run.
    pub fn control(&self) -> Arc<RunControl> {
        self.control.clone()
    }

    /// Discovers exports in the configured data directory and runs them.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let dir = &self.config.data_dir;
        let found = discover_datasets(dir)
            .await
            .with_context(|| format!("scanning data directory {}", dir.display()))?;
        if found.is_empty() {
            warn!(dir = %dir.display(), "no recognised exports found");
        }
        let mut sources = Vec::with_capacity(found.len());
        for (dataset, path) in found {
            match source_for_path(&path) {
                Some(source) => sources.push((dataset, source)),
                None => warn!(path = %path.display(), "unsupported export format; skipped"),
            }
        }
        self.run_sources(sources).await
    }

    /// Runs the given sources in load order.
    pub async fn run_sources(
        &self,
        sources: Vec<(Dataset, Box<dyn TabularSource>)>,
    ) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, sources).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        mut sources: Vec<(Dataset, Box<dyn TabularSource>)>,
    ) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let policy = self.config.backoff();
        let timeout = self.config.store_timeout;

        retry_store_op(&policy, timeout, "ping", || self.store.ping())
            .await
            .map_err(SyncError::StoreUnreachable)?;
        info!(store = self.store.label(), sources = sources.len(), "sync run started");

        sources.sort_by_key(|(dataset, _)| *dataset);
        let resolver = EntityResolver::new(
            self.store.clone(),
            self.config.player_threshold,
            policy,
            timeout,
        );
        let engine = UpsertEngine::new(
            self.store.clone(),
            policy,
            timeout,
            self.config.write_concurrency,
        );

        let mut stages = BTreeMap::new();
        let mut fingerprints = Vec::new();
        let mut integrity_faults = Vec::new();
        let mut match_index: Option<Arc<MasterKeyIndex>> = None;

        for (dataset, source) in sources {
            if self.control.is_cancelled() {
                info!(dataset = dataset.label(), "run cancelled; remaining datasets not loaded");
                break;
            }
            let label = source.label();
            let table = source
                .read_rows()
                .await
                .with_context(|| format!("reading {label}"))?;
            fingerprints.extend(table.fingerprint);

            let lookups = self.lookups(dataset).await?;
            if matches!(dataset, Dataset::Players | Dataset::Lineups) {
                let players = self.scan(dataset, EntityKind::Player).await?;
                resolver.prime(&players).await;
            }
            let matches = match match_index.clone() {
                Some(index) => index,
                None if matches!(dataset, Dataset::TeamMatchStats | Dataset::Lineups) => {
                    let stored = self.scan(dataset, EntityKind::Match).await?;
                    let index = Arc::new(MasterKeyIndex::build(&stored));
                    info!(matches = index.len(), faults = index.collisions().len(), "master key index built");
                    integrity_faults.extend(index.collisions().iter().cloned());
                    match_index = Some(index.clone());
                    index
                }
                None => Arc::new(MasterKeyIndex::default()),
            };

            let context = LoadContext {
                canonicalizer: &lookups.canonicalizer,
                teams: &lookups.teams,
                stadiums: &lookups.stadiums,
                matches: &matches,
                resolver: &resolver,
                team_threshold: self.config.team_threshold,
            };
            let stage = info_span!("stage", dataset = dataset.label());
            let report = self
                .run_stage(dataset, label, table.rows, &context, &engine)
                .instrument(stage)
                .await?;
            if dataset == Dataset::Matches {
                match_index = None;
            }
            stages.insert(dataset, report);
        }

        let status = if self.control.is_cancelled() {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        let store_counts = self.store_counts().await;
        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status,
            stages,
            integrity_faults,
            sources: fingerprints,
            store_counts,
        };
        info!(
            %status,
            rows = summary.rows_read(),
            rejected = summary.rejected(),
            integrity_faults = summary.integrity_faults.len(),
            "sync run finished"
        );
        self.record_ledger(&summary).await;
        Ok(summary)
    }

    async fn scan(&self, dataset: Dataset, kind: EntityKind) -> Result<Vec<EntityRecord>, SyncError> {
        retry_store_op(&self.config.backoff(), self.config.store_timeout, "scan_all", || {
            self.store.scan_all(kind)
        })
        .await
        .map_err(|source| SyncError::Lookup {
            dataset: dataset.label(),
            source,
        })
    }

    async fn lookups(&self, dataset: Dataset) -> Result<StageLookups, SyncError> {
        let teams = NameIndex::from_records(&self.scan(dataset, EntityKind::Team).await?);
        let stadiums = NameIndex::from_records(&self.scan(dataset, EntityKind::Stadium).await?);
        for collision in teams.collisions().iter().chain(stadiums.collisions()) {
            error!(name = %collision.key, kept = %collision.kept, dropped = %collision.dropped, "integrity fault: duplicate canonical name");
        }
        let mut canonicalizer = Canonicalizer::new(self.aliases.clone());
        canonicalizer.add_known_names(NameKind::Team, teams.names());
        canonicalizer.add_known_names(NameKind::Stadium, stadiums.names());
        Ok(StageLookups {
            canonicalizer,
            teams,
            stadiums,
        })
    }

    async fn run_stage(
        &self,
        dataset: Dataset,
        label: String,
        rows: Vec<SourceRow>,
        context: &LoadContext<'_>,
        engine: &UpsertEngine,
    ) -> Result<StageReport, SyncError> {
        let batch_size = self.config.batch_size.max(1);
        let mut report = StageReport::new(label);
        report.rows_read = rows.len();
        info!(rows = rows.len(), source = %report.source, "stage started");

        // Collapsing spans the whole stage; flushing happens in chunks.
        let mut pending = WriteBatch::new();
        let mut planned_rows: HashMap<usize, ReconciliationRow> = HashMap::new();
        let mut handled = 0usize;

        for raw in rows {
            if self.control.should_stop() {
                break;
            }
            let mut row = ReconciliationRow::new(dataset, raw);
            match context.plan(dataset, &mut row).await {
                Ok(planned) => {
                    report.fuzzy_matches += row.fuzzy_matches;
                    match planned.resolution {
                        Some(ResolveOutcome::Created) => report.created_entities += 1,
                        Some(ResolveOutcome::Adopted) => report.adopted_entities += 1,
                        _ => {}
                    }
                    if let Some(superseded) = pending.push(planned.write) {
                        planned_rows.remove(&superseded);
                        handled += 1;
                    }
                    planned_rows.insert(row.line, row);
                }
                Err(rejection) => {
                    if let Rejection::Store { exhausted, .. } = &rejection {
                        self.control.record_write(*exhausted);
                    }
                    report.reject(row, rejection);
                    handled += 1;
                    self.check_outage(dataset)?;
                }
            }
        }

        report.collapsed = pending.collapsed();
        for chunk in pending.into_chunks(batch_size) {
            if self.control.should_stop() {
                break;
            }
            for result in engine.flush(chunk, &self.control).await {
                handled += 1;
                match result.result {
                    Ok(outcome) => report.tally(outcome),
                    Err(err) => {
                        let row = planned_rows.remove(&result.line).unwrap_or_else(|| {
                            ReconciliationRow::new(dataset, SourceRow::new(result.line))
                        });
                        report.reject(row, err.into());
                    }
                }
            }
            self.check_outage(dataset)?;
        }

        report.skipped = report.rows_read.saturating_sub(handled);
        info!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            collapsed = report.collapsed,
            rejected = report.rejected(),
            skipped = report.skipped,
            "stage finished"
        );
        Ok(report)
    }

    /// Reads back how many records each loaded kind holds. Kinds that cannot be
    /// counted are logged and left out.
    async fn store_counts(&self) -> BTreeMap<EntityKind, usize> {
        let policy = self.config.backoff();
        let mut counts = BTreeMap::new();
        for kind in EntityKind::ALL {
            if kind == EntityKind::IngestRun {
                continue;
            }
            match retry_store_op(&policy, self.config.store_timeout, "count_all", || {
                self.store.count_all(kind)
            })
            .await
            {
                Ok(count) => {
                    info!(%kind, count, "stored records");
                    counts.insert(kind, count);
                }
                Err(err) => warn!(%kind, error = %err, "could not count stored records"),
            }
        }
        counts
    }

    fn check_outage(&self, dataset: Dataset) -> Result<(), SyncError> {
        if !self.control.outage() {
            return Ok(());
        }
        let consecutive = self.control.consecutive_exhausted();
        error!(consecutive, "store outage; stopping run");
        Err(SyncError::StoreOutage {
            dataset: dataset.label(),
            consecutive,
        })
    }

    /// Records the run in `ingest_runs`. Failures are logged and otherwise ignored.
    async fn record_ledger(&self, summary: &SyncRunSummary) {
        let (sources_json, summary_json) = match (
            serde_json::to_string(&summary.sources),
            serde_json::to_string(summary),
        ) {
            (Ok(sources), Ok(full)) => (sources, full),
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "could not serialize run ledger entry");
                return;
            }
        };
        let fields = FieldMap::from([
            ("started_at".to_string(), FieldValue::Text(summary.started_at.to_rfc3339())),
            ("finished_at".to_string(), FieldValue::Text(summary.finished_at.to_rfc3339())),
            ("status".to_string(), FieldValue::Text(summary.status.to_string())),
            ("sources_json".to_string(), FieldValue::Text(sources_json)),
            ("summary_json".to_string(), FieldValue::Text(summary_json)),
        ]);
        let recorded = retry_store_op(
            &self.config.backoff(),
            self.config.store_timeout,
            "record_ledger",
            || self.store.insert(EntityKind::IngestRun, &fields),
        )
        .await;
        match recorded {
            Ok(id) => info!(ledger_id = %id, "run ledger recorded"),
            Err(err) => warn!(error = %err, "could not record run ledger"),
        }
    }
}
