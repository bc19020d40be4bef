//! Core domain model for the league reconciliation engine.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "plhub-core";

/// Store-assigned identifier. Never reassigned once a record exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub Uuid);

impl EntityId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Stadium,
    Team,
    Player,
    Match,
    TeamMatchStats,
    PlayerAppearance,
    IngestRun,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Stadium,
        EntityKind::Team,
        EntityKind::Player,
        EntityKind::Match,
        EntityKind::TeamMatchStats,
        EntityKind::PlayerAppearance,
        EntityKind::IngestRun,
    ];

    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Stadium => "stadiums",
            EntityKind::Team => "teams",
            EntityKind::Player => "players",
            EntityKind::Match => "matches",
            EntityKind::TeamMatchStats => "team_match_stats",
            EntityKind::PlayerAppearance => "player_appearances",
            EntityKind::IngestRun => "ingest_runs",
        }
    }

    /// Column catalogue for the kind, excluding the `id` primary key.
    pub fn columns(self) -> &'static [Column] {
        match self {
            EntityKind::Stadium => STADIUM_COLUMNS,
            EntityKind::Team => TEAM_COLUMNS,
            EntityKind::Player => PLAYER_COLUMNS,
            EntityKind::Match => MATCH_COLUMNS,
            EntityKind::TeamMatchStats => TEAM_MATCH_STATS_COLUMNS,
            EntityKind::PlayerAppearance => PLAYER_APPEARANCE_COLUMNS,
            EntityKind::IngestRun => INGEST_RUN_COLUMNS,
        }
    }

    pub fn column(self, name: &str) -> Option<&'static Column> {
        self.columns().iter().find(|c| c.name == name)
    }

    /// Kinds whose canonical `name` column is unique case-insensitively.
    pub fn has_unique_name(self) -> bool {
        matches!(self, EntityKind::Stadium | EntityKind::Team)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Int,
    Float,
    Bool,
    Date,
    Ref,
}

/// One persisted attribute of an entity kind.
///
/// `zero_is_empty` marks statistic columns where zero is the "no data"
/// sentinel: an incoming zero never replaces a stored non-zero value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub zero_is_empty: bool,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        zero_is_empty: false,
    }
}

const fn stat(name: &'static str, ty: ColumnType) -> Column {
    Column {
        name,
        ty,
        zero_is_empty: true,
    }
}

use ColumnType::{Bool, Date, Float, Int, Ref, Text};

const STADIUM_COLUMNS: &[Column] = &[col("name", Text), col("city", Text), col("capacity", Int)];

const TEAM_COLUMNS: &[Column] = &[
    col("name", Text),
    col("stadium_id", Ref),
    col("founded", Int),
    col("logo_url", Text),
];

const PLAYER_COLUMNS: &[Column] = &[
    col("team_id", Ref),
    col("name", Text),
    col("name_key", Text),
    col("position", Text),
    col("nationality", Text),
    col("age", Int),
    stat("appearances", Int),
    stat("goals", Int),
    stat("assists", Int),
    stat("minutes", Int),
    stat("yellow_cards", Int),
    stat("red_cards", Int),
    stat("clean_sheets", Int),
    stat("xg", Float),
    stat("xa", Float),
];

const MATCH_COLUMNS: &[Column] = &[
    col("match_date", Date),
    col("home_team_id", Ref),
    col("away_team_id", Ref),
    col("home_goals", Int),
    col("away_goals", Int),
    stat("attendance", Int),
    col("referee", Text),
    col("video_url", Text),
    col("matchweek", Int),
];

const TEAM_MATCH_STATS_COLUMNS: &[Column] = &[
    col("match_id", Ref),
    col("team_id", Ref),
    stat("possession", Float),
    stat("shots", Int),
    stat("shots_on_target", Int),
    stat("corners", Int),
    stat("fouls", Int),
    stat("offsides", Int),
    stat("yellow_cards", Int),
    stat("red_cards", Int),
    stat("passes", Int),
    stat("pass_accuracy", Float),
    stat("xg", Float),
];

const PLAYER_APPEARANCE_COLUMNS: &[Column] = &[
    col("match_id", Ref),
    col("player_id", Ref),
    col("team_id", Ref),
    col("started", Bool),
    stat("minutes", Int),
    stat("goals", Int),
    stat("assists", Int),
    stat("shots", Int),
    stat("yellow_cards", Int),
    stat("red_cards", Int),
    stat("rating", Float),
    col("position", Text),
];

const INGEST_RUN_COLUMNS: &[Column] = &[
    col("started_at", Text),
    col("finished_at", Text),
    col("status", Text),
    col("sources_json", Text),
    col("summary_json", Text),
];

/// Typed attribute value as exchanged with the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    Ref(EntityId),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn is_zero(&self) -> bool {
        match self {
            FieldValue::Int(v) => *v == 0,
            FieldValue::Float(v) => *v == 0.0,
            _ => false,
        }
    }

    /// True when the value carries no information for `column`.
    pub fn is_empty_for(&self, column: &Column) -> bool {
        self.is_null() || (column.zero_is_empty && self.is_zero())
    }

    pub fn matches_type(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (FieldValue::Null, _)
                | (FieldValue::Text(_), ColumnType::Text)
                | (FieldValue::Int(_), ColumnType::Int)
                | (FieldValue::Float(_), ColumnType::Float)
                | (FieldValue::Int(_), ColumnType::Float)
                | (FieldValue::Bool(_), ColumnType::Bool)
                | (FieldValue::Date(_), ColumnType::Date)
                | (FieldValue::Ref(_), ColumnType::Ref)
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            FieldValue::Date(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_ref_id(&self) -> Option<EntityId> {
        match self {
            FieldValue::Ref(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        FieldValue::Date(value)
    }
}

impl From<EntityId> for FieldValue {
    fn from(value: EntityId) -> Self {
        FieldValue::Ref(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// Partial attribute set keyed by column name. Ordered so generated SQL is stable.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// Composite key of a persisted match, used to resolve auxiliary per-match rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MasterKey {
    pub date: NaiveDate,
    pub home_team_id: EntityId,
    pub away_team_id: EntityId,
}

impl fmt::Display for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} v {}", self.date, self.home_team_id, self.away_team_id)
    }
}

/// Case-folds a canonical name for uniqueness comparisons.
pub fn fold_name(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Unique target of a write: identifies at most one stored record of a kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum RecordKey {
    Id { id: EntityId },
    /// Case-folded canonical name (see [`fold_name`]).
    Name { folded: String },
    PlayerInTeam { team_id: EntityId, name_key: String },
    Fixture { key: MasterKey },
    MatchSide { match_id: EntityId, team_id: EntityId },
    Appearance { match_id: EntityId, player_id: EntityId },
}

impl RecordKey {
    pub fn id(id: EntityId) -> Self {
        RecordKey::Id { id }
    }

    pub fn name(raw: &str) -> Self {
        RecordKey::Name {
            folded: fold_name(raw),
        }
    }

    pub fn supports(&self, kind: EntityKind) -> bool {
        match self {
            RecordKey::Id { .. } => true,
            RecordKey::Name { .. } => kind.has_unique_name(),
            RecordKey::PlayerInTeam { .. } => kind == EntityKind::Player,
            RecordKey::Fixture { .. } => kind == EntityKind::Match,
            RecordKey::MatchSide { .. } => kind == EntityKind::TeamMatchStats,
            RecordKey::Appearance { .. } => kind == EntityKind::PlayerAppearance,
        }
    }

    /// Column values implied by the key, written alongside the field set on insert.
    ///
    /// `Id` and `Name` keys imply nothing: ids are store-assigned and the display
    /// name travels in the field set with its original casing.
    pub fn key_fields(&self) -> FieldMap {
        let mut out = FieldMap::new();
        match self {
            RecordKey::Id { .. } | RecordKey::Name { .. } => {}
            RecordKey::PlayerInTeam { team_id, name_key } => {
                out.insert("team_id".into(), FieldValue::Ref(*team_id));
                out.insert("name_key".into(), FieldValue::Text(name_key.clone()));
            }
            RecordKey::Fixture { key } => {
                out.insert("match_date".into(), FieldValue::Date(key.date));
                out.insert("home_team_id".into(), FieldValue::Ref(key.home_team_id));
                out.insert("away_team_id".into(), FieldValue::Ref(key.away_team_id));
            }
            RecordKey::MatchSide { match_id, team_id } => {
                out.insert("match_id".into(), FieldValue::Ref(*match_id));
                out.insert("team_id".into(), FieldValue::Ref(*team_id));
            }
            RecordKey::Appearance {
                match_id,
                player_id,
            } => {
                out.insert("match_id".into(), FieldValue::Ref(*match_id));
                out.insert("player_id".into(), FieldValue::Ref(*player_id));
            }
        }
        out
    }

    pub fn matches(&self, record: &EntityRecord) -> bool {
        match self {
            RecordKey::Id { id } => record.id == *id,
            RecordKey::Name { folded } => record
                .text("name")
                .is_some_and(|name| fold_name(name) == *folded),
            _ => self
                .key_fields()
                .iter()
                .all(|(column, value)| record.get(column) == Some(value)),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Id { id } => write!(f, "id={id}"),
            RecordKey::Name { folded } => write!(f, "name={folded}"),
            RecordKey::PlayerInTeam { team_id, name_key } => {
                write!(f, "player={name_key}@{team_id}")
            }
            RecordKey::Fixture { key } => write!(f, "fixture={key}"),
            RecordKey::MatchSide { match_id, team_id } => {
                write!(f, "match={match_id} team={team_id}")
            }
            RecordKey::Appearance {
                match_id,
                player_id,
            } => write!(f, "match={match_id} player={player_id}"),
        }
    }
}

/// A persisted entity as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub fields: FieldMap,
}

impl EntityRecord {
    pub fn new(kind: EntityKind, id: EntityId, fields: FieldMap) -> Self {
        Self { id, kind, fields }
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.fields.get(column).filter(|v| !v.is_null())
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(FieldValue::as_text)
    }

    pub fn int(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(FieldValue::as_int)
    }

    pub fn float(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(FieldValue::as_float)
    }

    pub fn date(&self, column: &str) -> Option<NaiveDate> {
        self.get(column).and_then(FieldValue::as_date)
    }

    pub fn reference(&self, column: &str) -> Option<EntityId> {
        self.get(column).and_then(FieldValue::as_ref_id)
    }

    pub fn name(&self) -> Option<&str> {
        self.text("name")
    }
}

/// Raw scalar handed over by a tabular source.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
    Empty,
}

impl RawValue {
    pub fn is_blank(&self) -> bool {
        match self {
            RawValue::Empty => true,
            RawValue::Number(n) => n.is_nan(),
            RawValue::Text(t) => t.trim().is_empty(),
        }
    }

    /// Trimmed textual form; integral numbers render without a fraction.
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            RawValue::Empty => None,
            RawValue::Number(n) if n.is_nan() => None,
            RawValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                Some(Cow::Owned(format!("{}", *n as i64)))
            }
            RawValue::Number(n) => Some(Cow::Owned(n.to_string())),
            RawValue::Text(t) => {
                let trimmed = t.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(Cow::Borrowed(trimmed))
                }
            }
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

/// Lower-cases and trims a header; inner spaces and hyphens become `_`.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// One input row from a tabular source, keyed by normalized column name.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SourceRow {
    /// 1-based position in the source, header excluded.
    pub line: usize,
    pub fields: BTreeMap<String, RawValue>,
}

impl SourceRow {
    pub fn new(line: usize) -> Self {
        Self {
            line,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, column: &str, value: impl Into<RawValue>) -> Self {
        self.insert(column, value.into());
        self
    }

    pub fn insert(&mut self, column: &str, value: RawValue) {
        self.fields.insert(normalize_column_name(column), value);
    }

    /// First non-blank value among `columns`, in the order given.
    pub fn first_of(&self, columns: &[&str]) -> Option<&RawValue> {
        columns
            .iter()
            .filter_map(|c| self.fields.get(*c))
            .find(|v| !v.is_blank())
    }

    pub fn text_of(&self, columns: &[&str]) -> Option<String> {
        self.first_of(columns)
            .and_then(RawValue::as_text)
            .map(Cow::into_owned)
    }

    pub fn has_any(&self, columns: &[&str]) -> bool {
        self.first_of(columns).is_some()
    }
}
