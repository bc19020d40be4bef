use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::NaiveDate;
use plhub_core::{fold_name, EntityId, EntityRecord, MasterKey};
use serde::Serialize;
use tracing::{error, warn};

use crate::row::Rejection;

/// A key seen twice while building an index. The first value is kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Collision<K, V> {
    pub key: K,
    pub kept: V,
    pub dropped: V,
}

/// Build-once lookup table with first-wins semantics. Conflicting inserts are
/// recorded rather than silently overwritten.
#[derive(Debug, Clone)]
pub struct Index<K, V> {
    entries: HashMap<K, V>,
    collisions: Vec<Collision<K, V>>,
}

impl<K, V> Default for Index<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            collisions: Vec::new(),
        }
    }
}

impl<K, V> Index<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    pub fn build<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut index = Self::default();
        for (key, value) in entries {
            index.insert(key, value);
        }
        index
    }

    /// Returns `false` when the key already maps to a different value.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        match self.entries.get(&key) {
            Some(kept) if *kept == value => true,
            Some(kept) => {
                self.collisions.push(Collision {
                    key,
                    kept: kept.clone(),
                    dropped: value,
                });
                false
            }
            None => {
                self.entries.insert(key, value);
                true
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn collisions(&self) -> &[Collision<K, V>] {
        &self.collisions
    }
}

/// Case-insensitive name -> id table for one entity kind. Exact only; fuzzy
/// resolution happens before a name reaches this table.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
    ids: Index<String, EntityId>,
    names: BTreeMap<EntityId, String>,
}

impl NameIndex {
    pub fn from_records(records: &[EntityRecord]) -> Self {
        let mut index = Self::default();
        for record in records {
            if let Some(name) = record.name() {
                index.insert(name, record.id);
            }
        }
        index
    }

    pub fn insert(&mut self, name: &str, id: EntityId) {
        if self.ids.insert(fold_name(name), id) {
            self.names.insert(id, name.trim().to_string());
        }
    }

    pub fn id_of(&self, name: &str) -> Option<EntityId> {
        self.ids.get(&fold_name(name)).copied()
    }

    pub fn name_of(&self, id: EntityId) -> Option<&str> {
        self.names.get(&id).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.values().map(String::as_str)
    }

    pub fn collisions(&self) -> &[Collision<String, EntityId>] {
        self.ids.collisions()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchSides {
    pub home_team_id: EntityId,
    pub away_team_id: EntityId,
}

/// Composite (date, home, away) -> match id index over persisted matches.
/// Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct MasterKeyIndex {
    by_key: Index<MasterKey, EntityId>,
    sides: HashMap<EntityId, MatchSides>,
}

impl MasterKeyIndex {
    /// Builds from a full scan of stored matches. Duplicate keys are store
    /// integrity faults: each is logged and the first record is kept.
    pub fn build(matches: &[EntityRecord]) -> Self {
        let mut index = Self::default();
        for record in matches {
            let (Some(date), Some(home), Some(away)) = (
                record.date("match_date"),
                record.reference("home_team_id"),
                record.reference("away_team_id"),
            ) else {
                warn!(match_id = %record.id, "stored match lacks date or sides; not indexed");
                continue;
            };
            let key = MasterKey {
                date,
                home_team_id: home,
                away_team_id: away,
            };
            if index.by_key.insert(key, record.id) {
                index.sides.insert(
                    record.id,
                    MatchSides {
                        home_team_id: home,
                        away_team_id: away,
                    },
                );
            } else {
                let kept = index.by_key.get(&key).copied();
                error!(
                    %key,
                    kept = ?kept,
                    dropped = %record.id,
                    "integrity fault: two stored matches share one master key"
                );
            }
        }
        index
    }

    pub fn lookup(&self, key: &MasterKey) -> Option<EntityId> {
        self.by_key.get(key).copied()
    }

    pub fn sides(&self, match_id: EntityId) -> Option<MatchSides> {
        self.sides.get(&match_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn collisions(&self) -> &[Collision<MasterKey, EntityId>] {
        self.by_key.collisions()
    }

    /// Resolves canonical team names and a calendar date to a stored match.
    pub fn resolve(
        &self,
        teams: &NameIndex,
        home: &str,
        away: &str,
        date: NaiveDate,
    ) -> Result<EntityId, Rejection> {
        let home_team_id = teams
            .id_of(home)
            .ok_or_else(|| Rejection::TeamNotFound(home.to_string()))?;
        let away_team_id = teams
            .id_of(away)
            .ok_or_else(|| Rejection::TeamNotFound(away.to_string()))?;
        let key = MasterKey {
            date,
            home_team_id,
            away_team_id,
        };
        self.lookup(&key).ok_or_else(|| Rejection::NoMatchForKey {
            date,
            home: home.to_string(),
            away: away.to_string(),
        })
    }
}

/// Which side of `match_id` the canonical `team` played on. Never defaults to a side.
pub fn identify_side(
    index: &MasterKeyIndex,
    teams: &NameIndex,
    match_id: EntityId,
    team: &str,
) -> Result<EntityId, Rejection> {
    let team_id = teams
        .id_of(team)
        .ok_or_else(|| Rejection::TeamNotFound(team.to_string()))?;
    let sides = index.sides(match_id).ok_or(Rejection::SideMismatch {
        match_id,
        team: team.to_string(),
    })?;
    if team_id == sides.home_team_id || team_id == sides.away_team_id {
        Ok(team_id)
    } else {
        Err(Rejection::SideMismatch {
            match_id,
            team: team.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plhub_core::{EntityKind, FieldMap, FieldValue};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 8, 19).expect("date")
    }

    fn team(name: &str) -> EntityRecord {
        EntityRecord::new(
            EntityKind::Team,
            EntityId::new_v4(),
            FieldMap::from([("name".to_string(), FieldValue::from(name))]),
        )
    }

    fn fixture(home: EntityId, away: EntityId) -> EntityRecord {
        EntityRecord::new(
            EntityKind::Match,
            EntityId::new_v4(),
            FieldMap::from([
                ("match_date".to_string(), FieldValue::Date(date())),
                ("home_team_id".to_string(), FieldValue::Ref(home)),
                ("away_team_id".to_string(), FieldValue::Ref(away)),
            ]),
        )
    }

    #[test]
    fn generic_index_keeps_first_and_reports_collisions() {
        let index = Index::build([("a", 1), ("a", 1), ("a", 2), ("b", 3)]);
        assert_eq!(index.get(&"a"), Some(&1));
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.collisions(),
            &[Collision {
                key: "a",
                kept: 1,
                dropped: 2
            }]
        );
    }

    #[test]
    fn master_key_lookup_is_exact() {
        let (city, spurs) = (team("Manchester City"), team("Tottenham Hotspur"));
        let teams = NameIndex::from_records(&[city.clone(), spurs.clone()]);
        let stored = fixture(city.id, spurs.id);
        let index = MasterKeyIndex::build(std::slice::from_ref(&stored));

        let found = index
            .resolve(&teams, "Manchester City", "Tottenham Hotspur", date())
            .expect("found");
        assert_eq!(found, stored.id);

        let reversed = index.resolve(&teams, "Tottenham Hotspur", "Manchester City", date());
        assert!(matches!(reversed, Err(Rejection::NoMatchForKey { .. })));

        let wrong_day = index.resolve(
            &teams,
            "Manchester City",
            "Tottenham Hotspur",
            date().succ_opt().expect("next day"),
        );
        assert!(matches!(wrong_day, Err(Rejection::NoMatchForKey { .. })));

        let unknown = index.resolve(&teams, "Manchester City", "Leeds United", date());
        assert_eq!(unknown, Err(Rejection::TeamNotFound("Leeds United".into())));
    }

    #[test]
    fn duplicate_master_keys_keep_the_first_match() {
        let (home, away) = (EntityId::new_v4(), EntityId::new_v4());
        let first = fixture(home, away);
        let second = fixture(home, away);
        let index = MasterKeyIndex::build(&[first.clone(), second.clone()]);

        assert_eq!(index.len(), 1);
        assert_eq!(index.collisions().len(), 1);
        assert_eq!(index.collisions()[0].kept, first.id);
        assert_eq!(index.collisions()[0].dropped, second.id);
        assert!(index.sides(second.id).is_none());
    }

    #[test]
    fn side_identifier_never_defaults() {
        let (city, spurs, villa) = (
            team("Manchester City"),
            team("Tottenham Hotspur"),
            team("Aston Villa"),
        );
        let teams = NameIndex::from_records(&[city.clone(), spurs.clone(), villa.clone()]);
        let stored = fixture(city.id, spurs.id);
        let index = MasterKeyIndex::build(std::slice::from_ref(&stored));

        assert_eq!(
            identify_side(&index, &teams, stored.id, "Tottenham Hotspur"),
            Ok(spurs.id)
        );
        assert_eq!(
            identify_side(&index, &teams, stored.id, "manchester city"),
            Ok(city.id)
        );
        assert!(matches!(
            identify_side(&index, &teams, stored.id, "Aston Villa"),
            Err(Rejection::SideMismatch { .. })
        ));
    }
}
