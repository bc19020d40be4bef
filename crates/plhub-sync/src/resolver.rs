use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use plhub_core::{EntityId, EntityKind, EntityRecord, FieldMap, FieldValue, RecordKey};
use plhub_storage::{retry_store_op, BackoffPolicy, EntityStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::canonical::{best_match, normalize_person_name};
use crate::row::Rejection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResolveOutcome {
    Exact,
    Fuzzy { score: u8 },
    Created,
    /// Another writer created the entity first; its record was taken over.
    Adopted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub id: EntityId,
    pub name: String,
    pub name_key: String,
    pub outcome: ResolveOutcome,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("empty {0} name")]
    EmptyName(EntityKind),
    #[error("{0} records are not resolved within a parent scope")]
    UnsupportedKind(EntityKind),
    #[error("{kind} `{name}` collided on create but could not be read back")]
    Vanished { kind: EntityKind, name: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ResolveError> for Rejection {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Store(err) => err.into(),
            ResolveError::EmptyName(_) => Rejection::MissingField("player"),
            other => Rejection::Store {
                message: other.to_string(),
                exhausted: false,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ScopedEntry {
    id: EntityId,
    name: String,
    name_key: String,
}

impl ScopedEntry {
    fn resolved(&self, outcome: ResolveOutcome) -> ResolvedEntity {
        ResolvedEntity {
            id: self.id,
            name: self.name.clone(),
            name_key: self.name_key.clone(),
            outcome,
        }
    }
}

/// Parent column that scopes subordinate entities.
fn parent_column(kind: EntityKind) -> Option<&'static str> {
    match kind {
        EntityKind::Player => Some("team_id"),
        _ => None,
    }
}

/// Finds or mints subordinate entities (players within a team).
///
/// Lookups run against a run-scoped directory primed from the store, locked per
/// parent so different teams resolve independently. Creation re-checks inside
/// its transaction and adopts the winner of a lost race, so concurrent
/// resolvers never mint the same entity twice.
pub struct EntityResolver {
    store: Arc<dyn EntityStore>,
    threshold: u8,
    policy: BackoffPolicy,
    timeout: Duration,
    scopes: Mutex<HashMap<EntityId, Arc<Mutex<Vec<ScopedEntry>>>>>,
}

impl EntityResolver {
    pub fn new(
        store: Arc<dyn EntityStore>,
        threshold: u8,
        policy: BackoffPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            threshold,
            policy,
            timeout,
            scopes: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the directory with `records`. Returns how many were usable.
    pub async fn prime(&self, records: &[EntityRecord]) -> usize {
        let mut directory: HashMap<EntityId, Vec<ScopedEntry>> = HashMap::new();
        let mut loaded = 0;
        for record in records {
            let Some(column) = parent_column(record.kind) else {
                continue;
            };
            let (Some(parent), Some(name)) = (record.reference(column), record.name()) else {
                continue;
            };
            let name_key = record
                .text("name_key")
                .map(str::to_string)
                .unwrap_or_else(|| normalize_person_name(name));
            directory.entry(parent).or_default().push(ScopedEntry {
                id: record.id,
                name: name.to_string(),
                name_key,
            });
            loaded += 1;
        }
        *self.scopes.lock().await = directory
            .into_iter()
            .map(|(parent, entries)| (parent, Arc::new(Mutex::new(entries))))
            .collect();
        loaded
    }

    async fn scope(&self, parent: EntityId) -> Arc<Mutex<Vec<ScopedEntry>>> {
        self.scopes.lock().await.entry(parent).or_default().clone()
    }

    pub async fn resolve(
        &self,
        kind: EntityKind,
        name: &str,
        parent: EntityId,
    ) -> Result<ResolvedEntity, ResolveError> {
        let Some(column) = parent_column(kind) else {
            return Err(ResolveError::UnsupportedKind(kind));
        };
        let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
        let name_key = normalize_person_name(&name);
        if name_key.is_empty() {
            return Err(ResolveError::EmptyName(kind));
        }

        // Held across creation so two rows of this run cannot both mint.
        let scope = self.scope(parent).await;
        let mut entries = scope.lock().await;

        if let Some(entry) = entries.iter().find(|e| e.name_key == name_key) {
            return Ok(entry.resolved(ResolveOutcome::Exact));
        }

        let fuzzy = best_match(&name_key, entries.iter().map(|e| e.name_key.as_str()))
            .filter(|(_, score)| *score >= self.threshold)
            .map(|(key, score)| (key.to_string(), score));
        if let Some((key, score)) = fuzzy {
            if let Some(entry) = entries.iter().find(|e| e.name_key == key) {
                info!(%kind, raw = %name, matched = %entry.name, score, "fuzzy-matched within parent scope");
                return Ok(entry.resolved(ResolveOutcome::Fuzzy { score }));
            }
        }

        let key = RecordKey::PlayerInTeam {
            team_id: parent,
            name_key: name_key.clone(),
        };
        let mut fields = FieldMap::from([(String::from("name"), FieldValue::from(name.as_str()))]);
        fields.insert(column.to_string(), FieldValue::Ref(parent));
        fields.extend(key.key_fields());

        let created = retry_store_op(&self.policy, self.timeout, "create_entity", || {
            self.create_once(kind, &key, &fields)
        })
        .await;

        let entry = match created {
            Ok((entry, outcome)) => {
                match outcome {
                    ResolveOutcome::Created => info!(%kind, name = %entry.name, %parent, "created minimal entity"),
                    _ => debug!(%kind, name = %entry.name, "entity appeared before creation; adopted"),
                }
                entries.push(entry.clone());
                entry.resolved(outcome)
            }
            Err(err) if err.is_unique_violation() => {
                warn!(%kind, %name, "lost creation race; adopting the existing entity");
                let existing = retry_store_op(&self.policy, self.timeout, "reread_entity", || {
                    self.find_once(kind, &key)
                })
                .await?;
                let record = existing.ok_or_else(|| ResolveError::Vanished {
                    kind,
                    name: name.clone(),
                })?;
                let entry = ScopedEntry {
                    id: record.id,
                    name: record.name().unwrap_or(&name).to_string(),
                    name_key: name_key.clone(),
                };
                entries.push(entry.clone());
                entry.resolved(ResolveOutcome::Adopted)
            }
            Err(err) => {
                warn!(%kind, %name, %parent, error = %err, "entity creation failed");
                return Err(err.into());
            }
        };
        Ok(entry)
    }

    async fn create_once(
        &self,
        kind: EntityKind,
        key: &RecordKey,
        fields: &FieldMap,
    ) -> Result<(ScopedEntry, ResolveOutcome), StoreError> {
        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx.find_by_key(kind, key).await? {
            tx.rollback().await?;
            return Ok((entry_from(&existing, key), ResolveOutcome::Adopted));
        }
        let id = tx.insert(kind, fields).await?;
        tx.commit().await?;
        let name = fields
            .get("name")
            .and_then(FieldValue::as_text)
            .unwrap_or_default()
            .to_string();
        Ok((
            ScopedEntry {
                id,
                name,
                name_key: key_name(key),
            },
            ResolveOutcome::Created,
        ))
    }

    async fn find_once(
        &self,
        kind: EntityKind,
        key: &RecordKey,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let mut tx = self.store.begin().await?;
        let found = tx.find_by_key(kind, key).await?;
        tx.rollback().await?;
        Ok(found)
    }
}

fn key_name(key: &RecordKey) -> String {
    match key {
        RecordKey::PlayerInTeam { name_key, .. } => name_key.clone(),
        _ => String::new(),
    }
}

fn entry_from(record: &EntityRecord, key: &RecordKey) -> ScopedEntry {
    ScopedEntry {
        id: record.id,
        name: record.name().unwrap_or_default().to_string(),
        name_key: key_name(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plhub_storage::MemoryStore;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn resolver(store: &MemoryStore) -> EntityResolver {
        EntityResolver::new(Arc::new(store.clone()), 85, policy(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn creates_then_matches_exactly() {
        let store = MemoryStore::new();
        let resolver = resolver(&store);
        let team = EntityId::new_v4();

        let first = resolver
            .resolve(EntityKind::Player, "Darwin Núñez", team)
            .await
            .expect("created");
        assert_eq!(first.outcome, ResolveOutcome::Created);
        assert_eq!(first.name_key, "darwin nunez");

        let second = resolver
            .resolve(EntityKind::Player, "darwin nunez", team)
            .await
            .expect("matched");
        assert_eq!(second.outcome, ResolveOutcome::Exact);
        assert_eq!(second.id, first.id);
        assert_eq!(store.count(EntityKind::Player).await, 1);
    }

    #[tokio::test]
    async fn fuzzy_matches_stay_within_the_parent() {
        let store = MemoryStore::new();
        let resolver = resolver(&store);
        let (arsenal, chelsea) = (EntityId::new_v4(), EntityId::new_v4());

        let saka = resolver
            .resolve(EntityKind::Player, "Bukayo Saka", arsenal)
            .await
            .expect("created");
        let typo = resolver
            .resolve(EntityKind::Player, "Bukayo Sakaa", arsenal)
            .await
            .expect("fuzzy");
        assert_eq!(typo.id, saka.id);
        assert!(matches!(typo.outcome, ResolveOutcome::Fuzzy { score } if score >= 85));

        let elsewhere = resolver
            .resolve(EntityKind::Player, "Bukayo Saka", chelsea)
            .await
            .expect("created in other scope");
        assert_ne!(elsewhere.id, saka.id);
        assert_eq!(elsewhere.outcome, ResolveOutcome::Created);
    }

    #[tokio::test]
    async fn stale_directories_adopt_instead_of_duplicating() {
        let store = MemoryStore::new();
        let team = EntityId::new_v4();
        let first = resolver(&store);
        let second = resolver(&store);

        let created = first
            .resolve(EntityKind::Player, "Cole Palmer", team)
            .await
            .expect("created");
        let adopted = second
            .resolve(EntityKind::Player, "Cole Palmer", team)
            .await
            .expect("adopted");
        assert_eq!(adopted.outcome, ResolveOutcome::Adopted);
        assert_eq!(adopted.id, created.id);
        assert_eq!(store.count(EntityKind::Player).await, 1);
    }

    #[tokio::test]
    async fn a_busy_team_does_not_block_other_teams() {
        let store = MemoryStore::new();
        let resolver = resolver(&store);
        let (arsenal, chelsea) = (EntityId::new_v4(), EntityId::new_v4());

        let busy = resolver.scope(arsenal).await;
        let _held = busy.lock().await;
        let other = tokio::time::timeout(
            Duration::from_secs(5),
            resolver.resolve(EntityKind::Player, "Cole Palmer", chelsea),
        )
        .await
        .expect("not blocked by the arsenal scope")
        .expect("created");
        assert_eq!(other.outcome, ResolveOutcome::Created);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            resolver.resolve(EntityKind::Player, "Bukayo Saka", arsenal),
        )
        .await;
        assert!(blocked.is_err(), "same-team resolution waits for the scope");
    }

    #[tokio::test]
    async fn only_subordinate_kinds_are_resolved() {
        let store = MemoryStore::new();
        let err = resolver(&store)
            .resolve(EntityKind::Team, "Arsenal", EntityId::new_v4())
            .await
            .expect_err("teams are canonicalized, not minted");
        assert!(matches!(err, ResolveError::UnsupportedKind(EntityKind::Team)));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_during_creation() {
        let store = MemoryStore::new();
        let resolver = resolver(&store);
        store.fail_next(2);
        let resolved = resolver
            .resolve(EntityKind::Player, "Rodri", EntityId::new_v4())
            .await
            .expect("third attempt succeeds");
        assert_eq!(resolved.outcome, ResolveOutcome::Created);
    }
}
