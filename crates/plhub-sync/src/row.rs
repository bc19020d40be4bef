use std::collections::BTreeMap;

use chrono::NaiveDate;
use plhub_adapters::Dataset;
use plhub_core::{EntityId, SourceRow};
use plhub_storage::StoreError;
use serde::Serialize;
use thiserror::Error;

use crate::aliases::NameKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCategory {
    UnresolvedName,
    ParseFailure,
    KeyMiss,
    SideMismatch,
    Invalid,
    TerminalStore,
}

/// Why one input row was not written. Rejections are row-local and never stop a batch.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum Rejection {
    #[error("unresolved {kind} name `{raw}`")]
    UnresolvedName {
        kind: NameKind,
        raw: String,
        best: Option<(String, u8)>,
    },
    #[error("missing required column `{0}`")]
    MissingField(&'static str),
    #[error("could not parse {field} from `{raw}`")]
    ParseFailure { field: &'static str, raw: String },
    #[error("fixture `{0}` has no recognised separator")]
    UnparseableFixture(String),
    #[error("team `{0}` not found")]
    TeamNotFound(String),
    #[error("no stored match on {date} between {home} (home) and {away} (away)")]
    NoMatchForKey {
        date: NaiveDate,
        home: String,
        away: String,
    },
    #[error("team `{team}` is not a participant in match {match_id}")]
    SideMismatch { match_id: EntityId, team: String },
    #[error("{0}")]
    Invalid(String),
    #[error("store write failed: {message}")]
    Store {
        message: String,
        /// Set when the failure was a transient error that ran out of retries.
        exhausted: bool,
    },
}

impl Rejection {
    pub fn category(&self) -> RejectionCategory {
        match self {
            Rejection::UnresolvedName { .. } => RejectionCategory::UnresolvedName,
            Rejection::MissingField(_)
            | Rejection::ParseFailure { .. }
            | Rejection::UnparseableFixture(_) => RejectionCategory::ParseFailure,
            Rejection::TeamNotFound(_) | Rejection::NoMatchForKey { .. } => {
                RejectionCategory::KeyMiss
            }
            Rejection::SideMismatch { .. } => RejectionCategory::SideMismatch,
            Rejection::Invalid(_) => RejectionCategory::Invalid,
            Rejection::Store { .. } => RejectionCategory::TerminalStore,
        }
    }
}

impl From<StoreError> for Rejection {
    fn from(err: StoreError) -> Self {
        Rejection::Store {
            exhausted: err.is_exhausted_transient(),
            message: err.to_string(),
        }
    }
}

/// Per-row working state: what was read, what it resolved to, and why it was
/// rejected if it was.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationRow {
    pub dataset: Dataset,
    pub line: usize,
    pub raw: SourceRow,
    pub canonical: BTreeMap<&'static str, String>,
    pub match_id: Option<EntityId>,
    pub team_id: Option<EntityId>,
    /// Names in this row that resolved by similarity rather than alias or exact hit.
    pub fuzzy_matches: usize,
    pub rejection: Option<Rejection>,
}

impl ReconciliationRow {
    pub fn new(dataset: Dataset, raw: SourceRow) -> Self {
        Self {
            dataset,
            line: raw.line,
            raw,
            canonical: BTreeMap::new(),
            match_id: None,
            team_id: None,
            fuzzy_matches: 0,
            rejection: None,
        }
    }

    pub fn note(&mut self, role: &'static str, canonical: &str) {
        self.canonical.insert(role, canonical.to_string());
    }
}
