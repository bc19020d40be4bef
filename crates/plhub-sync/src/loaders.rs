//! Per-dataset row planning: raw row to canonical names, resolved references and one keyed write.

use chrono::NaiveDate;
use plhub_adapters::Dataset;
use plhub_core::{
    Column, ColumnType, EntityId, EntityKind, FieldMap, FieldValue, MasterKey, RawValue,
    RecordKey, SourceRow,
};
use tracing::{debug, info, warn};

use crate::aliases::NameKind;
use crate::canonical::{best_match, title_case, Canonical, Canonicalizer, MatchVia};
use crate::clean::{clean_bool, clean_date, clean_float, clean_int, clean_text, parse_date};
use crate::fixture::parse_fixture;
use crate::index::{identify_side, MasterKeyIndex, NameIndex};
use crate::resolver::{EntityResolver, ResolveOutcome};
use crate::row::{ReconciliationRow, Rejection};
use crate::upsert::PendingWrite;

type ColumnSpec = (&'static str, &'static [&'static str]);

const STADIUM_NAME: &[&str] = &["name", "stadium_name", "stadium"];
const STADIUM_CITY: &[&str] = &["city", "location"];

const TEAM_NAME: &[&str] = &["name", "team_name", "club_name", "team", "club"];
const TEAM_STADIUM: &[&str] = &["stadium_name", "stadium"];
const TEAM_FIELDS: &[ColumnSpec] = &[
    ("founded", &["founded", "year_founded"]),
    ("logo_url", &["logo_url", "logo"]),
];

const PLAYER_NAME: &[&str] = &["name", "player_name", "player"];
const PLAYER_TEAM: &[&str] = &["club_name", "club", "team"];
const PLAYER_FIELDS: &[ColumnSpec] = &[
    ("nationality", &["nationality", "nation", "country"]),
    ("appearances", &["appearances", "apps"]),
    ("goals", &["goals"]),
    ("assists", &["assists"]),
    ("minutes", &["minutes", "minutes_played"]),
    ("yellow_cards", &["yellow_cards", "yellows"]),
    ("red_cards", &["red_cards", "reds"]),
    ("clean_sheets", &["clean_sheets"]),
    ("xg", &["xg"]),
    ("xa", &["xa"]),
];

const HOME_TEAM: &[&str] = &["home_team", "home"];
const AWAY_TEAM: &[&str] = &["away_team", "away"];
const FIXTURE: &[&str] = &["fixture", "match"];
const MATCH_DATE: &[&str] = &["date", "match_date"];
const MATCH_FIELDS: &[ColumnSpec] = &[
    ("home_goals", &["home_goals", "home_score"]),
    ("away_goals", &["away_goals", "away_score"]),
    ("attendance", &["attendance"]),
    ("referee", &["referee"]),
    ("video_url", &["video_url", "video"]),
    ("matchweek", &["matchweek", "round", "gameweek"]),
];

const SIDE_TEAM: &[&str] = &["team", "team_name", "club"];
const TEAM_MATCH_FIELDS: &[ColumnSpec] = &[
    ("possession", &["possession"]),
    ("shots", &["shots"]),
    ("shots_on_target", &["shots_on_target"]),
    ("corners", &["corners"]),
    ("fouls", &["fouls"]),
    ("offsides", &["offsides"]),
    ("yellow_cards", &["yellow_cards"]),
    ("red_cards", &["red_cards"]),
    ("passes", &["passes"]),
    ("pass_accuracy", &["pass_accuracy"]),
    ("xg", &["xg"]),
];

const APPEARANCE_PLAYER: &[&str] = &["player", "player_name", "name"];
const APPEARANCE_FIELDS: &[ColumnSpec] = &[
    ("started", &["started", "starter", "lineup"]),
    ("minutes", &["minutes", "minutes_played"]),
    ("goals", &["goals"]),
    ("assists", &["assists"]),
    ("shots", &["shots"]),
    ("yellow_cards", &["yellow_cards"]),
    ("red_cards", &["red_cards"]),
    ("rating", &["rating"]),
];

const POSITION: &[&str] = &["position", "pos"];

const AGE_RANGE: std::ops::RangeInclusive<i64> = 16..=50;

/// A row that passed planning: the write it produces and, for rows that
/// resolve a player, how that player was found.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedRow {
    pub write: PendingWrite,
    pub resolution: Option<ResolveOutcome>,
}

impl From<PendingWrite> for PlannedRow {
    fn from(write: PendingWrite) -> Self {
        Self {
            write,
            resolution: None,
        }
    }
}

/// Read-only lookups for one stage, plus the resolver for subordinate entities.
pub struct LoadContext<'a> {
    pub canonicalizer: &'a Canonicalizer,
    pub teams: &'a NameIndex,
    pub stadiums: &'a NameIndex,
    pub matches: &'a MasterKeyIndex,
    pub resolver: &'a EntityResolver,
    pub team_threshold: u8,
}

impl LoadContext<'_> {
    pub async fn plan(
        &self,
        dataset: Dataset,
        row: &mut ReconciliationRow,
    ) -> Result<PlannedRow, Rejection> {
        match dataset {
            Dataset::Stadiums => plan_stadium(row).map(PlannedRow::from),
            Dataset::Teams => self.plan_team(row).map(PlannedRow::from),
            Dataset::Players => self.plan_player(row).await,
            Dataset::Matches => self.plan_match(row).map(PlannedRow::from),
            Dataset::TeamMatchStats => self.plan_team_stats(row).map(PlannedRow::from),
            Dataset::Lineups => self.plan_appearance(row).await,
        }
    }

    fn plan_team(&self, row: &mut ReconciliationRow) -> Result<PendingWrite, Rejection> {
        let raw_name = required(&row.raw, "name", TEAM_NAME)?;
        // The teams export defines teams, so a name nothing matches becomes a new canonical name.
        let canonical = self
            .canonicalizer
            .canonicalize(NameKind::Team, &raw_name, self.team_threshold);
        let name = match canonical {
            Canonical::Resolved { name, score, via } => {
                if via == MatchVia::Fuzzy {
                    info!(line = row.line, raw = %raw_name, canonical = %name, score, "fuzzy-matched team name");
                    row.fuzzy_matches += 1;
                }
                name
            }
            Canonical::Unresolved { raw, .. } => {
                info!(line = row.line, %raw, "new canonical team name");
                raw
            }
        };
        row.note("team", &name);

        let mut fields = FieldMap::from([(String::from("name"), FieldValue::from(name.as_str()))]);
        if let Some(raw_stadium) = clean_text(row.raw.first_of(TEAM_STADIUM)) {
            let stadium_id = self.stadium_id(row, &raw_stadium)?;
            fields.insert("stadium_id".into(), FieldValue::Ref(stadium_id));
        }
        copy_columns(EntityKind::Team, &row.raw, TEAM_FIELDS, &mut fields);

        Ok(PendingWrite {
            kind: EntityKind::Team,
            key: RecordKey::name(&name),
            fields,
            line: row.line,
        })
    }

    fn stadium_id(&self, row: &mut ReconciliationRow, raw: &str) -> Result<EntityId, Rejection> {
        if let Some(id) = self.stadiums.id_of(raw) {
            return Ok(id);
        }
        let best = best_match(raw, self.stadiums.names()).map(|(name, score)| (name.to_string(), score));
        match best {
            Some((name, score)) if score >= self.team_threshold => {
                info!(line = row.line, %raw, canonical = %name, score, "fuzzy-matched stadium name");
                row.fuzzy_matches += 1;
                row.note("stadium", &name);
                self.stadiums
                    .id_of(&name)
                    .ok_or_else(|| unresolved(row, NameKind::Stadium, raw, Some((name, score))))
            }
            best => Err(unresolved(row, NameKind::Stadium, raw, best)),
        }
    }

    async fn plan_player(&self, row: &mut ReconciliationRow) -> Result<PlannedRow, Rejection> {
        let name = required(&row.raw, "name", PLAYER_NAME)?;
        let raw_team = required(&row.raw, "club", PLAYER_TEAM)?;
        let team = self.canonical_team(row, "team", &raw_team)?;
        let team_id = self
            .teams
            .id_of(&team)
            .ok_or_else(|| Rejection::TeamNotFound(team.clone()))?;
        row.team_id = Some(team_id);

        let mut fields = FieldMap::new();
        if let Some(age) = clean_int(row.raw.first_of(&["age"])) {
            if !AGE_RANGE.contains(&age) {
                return Err(Rejection::Invalid(format!(
                    "age {age} outside {}..={}",
                    AGE_RANGE.start(),
                    AGE_RANGE.end()
                )));
            }
            fields.insert("age".into(), FieldValue::Int(age));
        }
        if let Some(position) = self.position(&row.raw) {
            fields.insert("position".into(), FieldValue::Text(position));
        }
        copy_columns(EntityKind::Player, &row.raw, PLAYER_FIELDS, &mut fields);

        let player = self.resolver.resolve(EntityKind::Player, &name, team_id).await?;
        row.note("player", &player.name);
        if matches!(player.outcome, ResolveOutcome::Fuzzy { .. }) {
            row.fuzzy_matches += 1;
        }

        Ok(PlannedRow {
            write: PendingWrite {
                kind: EntityKind::Player,
                key: RecordKey::PlayerInTeam {
                    team_id,
                    name_key: player.name_key,
                },
                fields,
                line: row.line,
            },
            resolution: Some(player.outcome),
        })
    }

    fn plan_match(&self, row: &mut ReconciliationRow) -> Result<PendingWrite, Rejection> {
        let (raw_home, raw_away) = fixture_names(&row.raw)?;
        let home = self.canonical_team(row, "home_team", &raw_home)?;
        let away = self.canonical_team(row, "away_team", &raw_away)?;
        let date = match_date(&row.raw)?;
        let home_team_id = self
            .teams
            .id_of(&home)
            .ok_or_else(|| Rejection::TeamNotFound(home.clone()))?;
        let away_team_id = self
            .teams
            .id_of(&away)
            .ok_or_else(|| Rejection::TeamNotFound(away.clone()))?;
        if home_team_id == away_team_id {
            return Err(Rejection::Invalid(format!("{home} listed as both home and away")));
        }

        let mut fields = FieldMap::new();
        copy_columns(EntityKind::Match, &row.raw, MATCH_FIELDS, &mut fields);
        for goals in ["home_goals", "away_goals"] {
            if fields.get(goals).and_then(FieldValue::as_int).is_some_and(|g| g < 0) {
                return Err(Rejection::Invalid(format!("negative {goals}")));
            }
        }

        Ok(PendingWrite {
            kind: EntityKind::Match,
            key: RecordKey::Fixture {
                key: MasterKey {
                    date,
                    home_team_id,
                    away_team_id,
                },
            },
            fields,
            line: row.line,
        })
    }

    fn plan_team_stats(&self, row: &mut ReconciliationRow) -> Result<PendingWrite, Rejection> {
        let match_id = self.locate_match(row)?;
        let team_id = self.side(row, match_id)?;

        let mut fields = FieldMap::new();
        copy_columns(EntityKind::TeamMatchStats, &row.raw, TEAM_MATCH_FIELDS, &mut fields);
        if let Some(possession) = fields.get("possession").and_then(FieldValue::as_float) {
            if !(0.0..=100.0).contains(&possession) {
                return Err(Rejection::Invalid(format!("possession {possession} outside 0..=100")));
            }
        }

        Ok(PendingWrite {
            kind: EntityKind::TeamMatchStats,
            key: RecordKey::MatchSide { match_id, team_id },
            fields,
            line: row.line,
        })
    }

    async fn plan_appearance(&self, row: &mut ReconciliationRow) -> Result<PlannedRow, Rejection> {
        let match_id = self.locate_match(row)?;
        let team_id = self.side(row, match_id)?;
        let name = required(&row.raw, "player", APPEARANCE_PLAYER)?;

        let mut fields = FieldMap::from([(String::from("team_id"), FieldValue::Ref(team_id))]);
        if let Some(position) = self.position(&row.raw) {
            fields.insert("position".into(), FieldValue::Text(position));
        }
        copy_columns(EntityKind::PlayerAppearance, &row.raw, APPEARANCE_FIELDS, &mut fields);

        let player = self.resolver.resolve(EntityKind::Player, &name, team_id).await?;
        row.note("player", &player.name);
        if matches!(player.outcome, ResolveOutcome::Fuzzy { .. }) {
            row.fuzzy_matches += 1;
        }

        Ok(PlannedRow {
            write: PendingWrite {
                kind: EntityKind::PlayerAppearance,
                key: RecordKey::Appearance {
                    match_id,
                    player_id: player.id,
                },
                fields,
                line: row.line,
            },
            resolution: Some(player.outcome),
        })
    }

    fn canonical_team(
        &self,
        row: &mut ReconciliationRow,
        role: &'static str,
        raw: &str,
    ) -> Result<String, Rejection> {
        match self.canonicalizer.canonicalize(NameKind::Team, raw, self.team_threshold) {
            Canonical::Resolved { name, score, via } => {
                if via == MatchVia::Fuzzy {
                    info!(line = row.line, %raw, canonical = %name, score, "fuzzy-matched team name");
                    row.fuzzy_matches += 1;
                }
                row.note(role, &name);
                Ok(name)
            }
            Canonical::Unresolved { raw, best } => Err(unresolved(row, NameKind::Team, &raw, best)),
        }
    }

    fn locate_match(&self, row: &mut ReconciliationRow) -> Result<EntityId, Rejection> {
        let (raw_home, raw_away) = fixture_names(&row.raw)?;
        let home = self.canonical_team(row, "home_team", &raw_home)?;
        let away = self.canonical_team(row, "away_team", &raw_away)?;
        let date = match_date(&row.raw)?;
        let match_id = self.matches.resolve(self.teams, &home, &away, date)?;
        row.match_id = Some(match_id);
        Ok(match_id)
    }

    fn side(&self, row: &mut ReconciliationRow, match_id: EntityId) -> Result<EntityId, Rejection> {
        let raw_team = required(&row.raw, "team", SIDE_TEAM)?;
        let team = self.canonical_team(row, "team", &raw_team)?;
        let team_id = identify_side(self.matches, self.teams, match_id, &team)?;
        row.team_id = Some(team_id);
        Ok(team_id)
    }

    /// Canonical position if the alias table knows it, else the title-cased raw value.
    fn position(&self, raw: &SourceRow) -> Option<String> {
        let position = clean_text(raw.first_of(POSITION))?;
        Some(
            match self
                .canonicalizer
                .canonicalize(NameKind::Position, &position, self.team_threshold)
            {
                Canonical::Resolved { name, .. } => name,
                Canonical::Unresolved { .. } => title_case(&position),
            },
        )
    }
}

fn plan_stadium(row: &mut ReconciliationRow) -> Result<PendingWrite, Rejection> {
    let name = required(&row.raw, "name", STADIUM_NAME)?;
    let city = required(&row.raw, "city", STADIUM_CITY)?;
    let raw_capacity = required(&row.raw, "capacity", &["capacity"])?;
    let capacity = clean_int(row.raw.first_of(&["capacity"])).ok_or(Rejection::ParseFailure {
        field: "capacity",
        raw: raw_capacity,
    })?;
    if capacity <= 0 {
        return Err(Rejection::Invalid(format!("capacity {capacity} must be positive")));
    }
    row.note("stadium", &name);

    let fields = FieldMap::from([
        (String::from("name"), FieldValue::from(name.as_str())),
        (String::from("city"), FieldValue::from(city)),
        (String::from("capacity"), FieldValue::Int(capacity)),
    ]);

    Ok(PendingWrite {
        kind: EntityKind::Stadium,
        key: RecordKey::name(&name),
        fields,
        line: row.line,
    })
}

fn unresolved(
    row: &ReconciliationRow,
    kind: NameKind,
    raw: &str,
    best: Option<(String, u8)>,
) -> Rejection {
    warn!(dataset = %row.dataset.label(), line = row.line, %kind, %raw, best = ?best, "unresolved name");
    Rejection::UnresolvedName {
        kind,
        raw: raw.to_string(),
        best,
    }
}

fn required(raw: &SourceRow, field: &'static str, columns: &[&str]) -> Result<String, Rejection> {
    clean_text(raw.first_of(columns)).ok_or(Rejection::MissingField(field))
}

/// Home and away names from explicit columns, else from a free-text fixture.
fn fixture_names(raw: &SourceRow) -> Result<(String, String), Rejection> {
    let home = clean_text(raw.first_of(HOME_TEAM));
    let away = clean_text(raw.first_of(AWAY_TEAM));
    if let (Some(home), Some(away)) = (home, away) {
        return Ok((home, away));
    }
    let fixture = clean_text(raw.first_of(FIXTURE)).ok_or(Rejection::MissingField("home_team"))?;
    parse_fixture(&fixture)
        .map(|sides| (sides.home, sides.away))
        .ok_or(Rejection::UnparseableFixture(fixture))
}

fn match_date(raw: &SourceRow) -> Result<NaiveDate, Rejection> {
    let text = required(raw, "date", MATCH_DATE)?;
    parse_date(&text).ok_or(Rejection::ParseFailure {
        field: "date",
        raw: text,
    })
}

fn typed_value(column: &Column, raw: Option<&RawValue>) -> Option<FieldValue> {
    match column.ty {
        ColumnType::Text => clean_text(raw).map(FieldValue::Text),
        ColumnType::Int => clean_int(raw).map(FieldValue::Int),
        ColumnType::Float => clean_float(raw).map(FieldValue::Float),
        ColumnType::Bool => clean_bool(raw).map(FieldValue::Bool),
        ColumnType::Date => clean_date(raw).map(FieldValue::Date),
        ColumnType::Ref => None,
    }
}

/// Copies optional columns, typed per the catalogue. Values that do not
/// coerce are dropped, not rejected.
fn copy_columns(kind: EntityKind, raw: &SourceRow, specs: &[ColumnSpec], fields: &mut FieldMap) {
    for (name, sources) in specs {
        let Some(column) = kind.column(name) else {
            continue;
        };
        let cell = raw.first_of(sources);
        match typed_value(column, cell) {
            Some(value) => {
                fields.insert(name.to_string(), value);
            }
            None if clean_text(cell).is_some() => {
                debug!(line = raw.line, %kind, column = name, "value does not coerce; ignored");
            }
            None => {}
        }
    }
}
