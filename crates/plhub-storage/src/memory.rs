use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use plhub_core::{fold_name, EntityId, EntityKind, EntityRecord, FieldMap, MasterKey, RecordKey};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{validated_columns, EntityStore, StoreError, StoreTx};

#[derive(Debug, Default, Clone)]
struct Tables {
    rows: BTreeMap<EntityKind, Vec<EntityRecord>>,
}

impl Tables {
    fn of(&self, kind: EntityKind) -> &[EntityRecord] {
        self.rows.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    fn find(&self, kind: EntityKind, key: &RecordKey) -> Option<&EntityRecord> {
        self.of(kind).iter().find(|r| key.matches(r))
    }
}

#[derive(Debug, Default)]
struct Faults {
    pending: AtomicUsize,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl Faults {
    fn check(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        let consumed = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if consumed.is_ok() {
            return Err(StoreError::Unavailable("injected connection reset".into()));
        }
        Ok(())
    }
}

/// Transactional in-process store enforcing the same uniqueness rules as the
/// Postgres schema. Transactions are serialized; a transaction works on a
/// staging copy that replaces the tables on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` store calls fail with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.faults.pending.store(n, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        self.faults.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of store calls observed so far, failed ones included.
    pub fn call_count(&self) -> usize {
        self.faults.calls.load(Ordering::SeqCst)
    }

    /// Writes a record without constraint checks, for reproducing corrupt stores.
    pub async fn seed_unchecked(&self, kind: EntityKind, fields: FieldMap) -> EntityId {
        let id = EntityId::new_v4();
        let mut tables = self.tables.lock().await;
        tables
            .rows
            .entry(kind)
            .or_default()
            .push(EntityRecord::new(kind, id, strip_nulls(fields)));
        id
    }

    pub async fn count(&self, kind: EntityKind) -> usize {
        self.tables.lock().await.of(kind).len()
    }

    pub async fn get(&self, kind: EntityKind, id: EntityId) -> Option<EntityRecord> {
        self.tables
            .lock()
            .await
            .find(kind, &RecordKey::id(id))
            .cloned()
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn label(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.faults.check()
    }

    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.faults.check()?;
        let folded = fold_name(name);
        let tables = self.tables.lock().await;
        Ok(tables
            .of(kind)
            .iter()
            .find(|r| r.name().is_some_and(|n| fold_name(n) == folded))
            .cloned())
    }

    async fn scan_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        self.faults.check()?;
        Ok(self.tables.lock().await.of(kind).to_vec())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        self.faults.check()?;
        let guard = self.tables.clone().lock_owned().await;
        let staging = guard.clone();
        Ok(Box::new(MemoryTx {
            guard,
            staging,
            faults: self.faults.clone(),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<Tables>,
    staging: Tables,
    faults: Arc<Faults>,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn find_by_key(
        &mut self,
        kind: EntityKind,
        key: &RecordKey,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.faults.check()?;
        if !key.supports(kind) {
            return Err(StoreError::UnsupportedKey {
                kind,
                key: key.to_string(),
            });
        }
        Ok(self.staging.find(kind, key).cloned())
    }

    async fn insert(&mut self, kind: EntityKind, fields: &FieldMap) -> Result<EntityId, StoreError> {
        self.faults.check()?;
        validate(kind, fields)?;
        let fields = strip_nulls(fields.clone());
        let id = EntityId::new_v4();
        let candidate = EntityRecord::new(kind, id, fields);
        check_constraints(&self.staging, &candidate)?;
        self.staging.rows.entry(kind).or_default().push(candidate);
        Ok(id)
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        self.faults.check()?;
        validate(kind, fields)?;
        let rows = self.staging.rows.entry(kind).or_default();
        let position = rows
            .iter()
            .position(|r| r.id == id)
            .ok_or(StoreError::NotFound { kind, id })?;

        let mut candidate = rows[position].clone();
        for (column, value) in fields {
            if value.is_null() {
                candidate.fields.remove(column);
            } else {
                candidate.fields.insert(column.clone(), value.clone());
            }
        }
        check_constraints(&self.staging, &candidate)?;
        self.staging.rows.entry(kind).or_default()[position] = candidate;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.faults.check()?;
        let MemoryTx {
            mut guard, staging, ..
        } = *self;
        *guard = staging;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

fn strip_nulls(mut fields: FieldMap) -> FieldMap {
    fields.retain(|_, v| !v.is_null());
    fields
}

fn validate(kind: EntityKind, fields: &FieldMap) -> Result<(), StoreError> {
    validated_columns(kind, fields).map(|_| ())
}

/// Natural unique key of a record, mirroring the unique indexes in `schema.sql`.
fn natural_key(record: &EntityRecord) -> Option<RecordKey> {
    let reference = |column: &str| record.reference(column);
    match record.kind {
        EntityKind::Stadium | EntityKind::Team => record.name().map(RecordKey::name),
        EntityKind::Player => Some(RecordKey::PlayerInTeam {
            team_id: reference("team_id")?,
            name_key: record.text("name_key")?.to_string(),
        }),
        EntityKind::Match => Some(RecordKey::Fixture {
            key: MasterKey {
                date: record.date("match_date")?,
                home_team_id: reference("home_team_id")?,
                away_team_id: reference("away_team_id")?,
            },
        }),
        EntityKind::TeamMatchStats => Some(RecordKey::MatchSide {
            match_id: reference("match_id")?,
            team_id: reference("team_id")?,
        }),
        EntityKind::PlayerAppearance => Some(RecordKey::Appearance {
            match_id: reference("match_id")?,
            player_id: reference("player_id")?,
        }),
        EntityKind::IngestRun => None,
    }
}

fn check_constraints(tables: &Tables, candidate: &EntityRecord) -> Result<(), StoreError> {
    let kind = candidate.kind;
    if kind == EntityKind::Match {
        let home = candidate.get("home_team_id");
        if home.is_some() && home == candidate.get("away_team_id") {
            return Err(StoreError::Rejected(
                "matches_distinct_sides: home and away team are the same".into(),
            ));
        }
    }

    let Some(key) = natural_key(candidate) else {
        return Ok(());
    };
    let clash = tables
        .of(kind)
        .iter()
        .any(|other| other.id != candidate.id && key.matches(other));
    if clash {
        return Err(StoreError::UniqueViolation {
            table: kind.table().to_string(),
            detail: format!("duplicate key {key}"),
        });
    }
    Ok(())
}
