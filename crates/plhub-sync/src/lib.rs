//! Identity resolution and reconciling ingest of Premier League tabular exports.

use std::sync::Arc;

use anyhow::{Context, Result};
use plhub_storage::PgEntityStore;

pub mod aliases;
pub mod canonical;
pub mod clean;
pub mod config;
pub mod control;
pub mod fixture;
pub mod index;
pub mod loaders;
pub mod pipeline;
pub mod resolver;
pub mod row;
pub mod upsert;

pub use aliases::{AliasError, AliasTable, NameKind};
pub use canonical::{Canonical, Canonicalizer, MatchVia};
pub use config::SyncConfig;
pub use control::RunControl;
pub use pipeline::{RunStatus, StageReport, SyncError, SyncPipeline, SyncRunSummary};
pub use resolver::{EntityResolver, ResolveOutcome, ResolvedEntity};
pub use row::{ReconciliationRow, Rejection, RejectionCategory};
pub use upsert::{merge_fields, UpsertEngine};

pub const CRATE_NAME: &str = "plhub-sync";

/// The configured alias table, or the built-in one.
pub fn load_aliases(config: &SyncConfig) -> Result<AliasTable> {
    match &config.aliases_path {
        Some(path) => AliasTable::from_path(path)
            .with_context(|| format!("loading alias table {}", path.display())),
        None => AliasTable::builtin().context("loading built-in alias table"),
    }
}

/// Connects to Postgres and wires a pipeline. Connection failure is fatal.
pub async fn connect_pipeline(config: SyncConfig) -> Result<SyncPipeline> {
    let aliases = load_aliases(&config)?;
    let store = PgEntityStore::connect(&config.store_config())
        .await
        .context("connecting to the entity store")?;
    Ok(SyncPipeline::new(config, Arc::new(store), Arc::new(aliases)))
}
