use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plhub_core::{EntityId, EntityKind, EntityRecord, FieldMap, FieldValue, RecordKey};
use plhub_storage::{BackoffPolicy, EntityStore, MemoryStore, StoreError, StoreTx};
use plhub_sync::{EntityResolver, ResolveOutcome};
use tokio::task::JoinSet;

fn policy() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
    }
}

fn resolver(store: Arc<dyn EntityStore>) -> EntityResolver {
    EntityResolver::new(store, 85, policy(), Duration::from_secs(5))
}

async fn seed_team(store: &MemoryStore, name: &str) -> EntityId {
    store
        .insert(
            EntityKind::Team,
            &FieldMap::from([("name".to_string(), FieldValue::Text(name.to_string()))]),
        )
        .await
        .expect("seed team")
}

/// Store whose transactions miss the first `blind` key lookups, as a
/// concurrent writer's uncommitted insert would.
struct BlindStore {
    inner: MemoryStore,
    blind: Arc<AtomicUsize>,
}

struct BlindTx {
    inner: Box<dyn StoreTx>,
    blind: Arc<AtomicUsize>,
}

#[async_trait]
impl StoreTx for BlindTx {
    async fn find_by_key(
        &mut self,
        kind: EntityKind,
        key: &RecordKey,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let found = self.inner.find_by_key(kind, key).await?;
        let hidden = self
            .blind
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(if hidden { None } else { found })
    }

    async fn insert(&mut self, kind: EntityKind, fields: &FieldMap) -> Result<EntityId, StoreError> {
        self.inner.insert(kind, fields).await
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        self.inner.update(kind, id, fields).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl EntityStore for BlindStore {
    fn label(&self) -> &'static str {
        "blind"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        self.inner.find_by_name(kind, name).await
    }

    async fn scan_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        self.inner.scan_all(kind).await
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        Ok(Box::new(BlindTx {
            inner: self.inner.begin().await?,
            blind: self.blind.clone(),
        }))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_resolvers_agree_on_one_new_player() {
    let store = MemoryStore::new();
    let chelsea = seed_team(&store, "Chelsea").await;
    let shared: Arc<dyn EntityStore> = Arc::new(store.clone());

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let resolver = resolver(shared.clone());
        tasks.spawn(async move {
            resolver
                .resolve(EntityKind::Player, "Cole Palmer", chelsea)
                .await
        });
    }

    let mut ids = Vec::new();
    let mut created = 0;
    while let Some(joined) = tasks.join_next().await {
        let resolved = joined.expect("task").expect("resolve");
        if resolved.outcome == ResolveOutcome::Created {
            created += 1;
        }
        ids.push(resolved.id);
    }

    assert_eq!(created, 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.count(EntityKind::Player).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_lookups_through_one_resolver_are_serialized() {
    let store = MemoryStore::new();
    let arsenal = seed_team(&store, "Arsenal").await;
    let resolver = resolver(Arc::new(store.clone()));

    let (a, b) = tokio::join!(
        resolver.resolve(EntityKind::Player, "Bukayo Saka", arsenal),
        resolver.resolve(EntityKind::Player, "bukayo  SAKA", arsenal),
    );
    let (a, b) = (a.expect("first"), b.expect("second"));

    assert_eq!(a.id, b.id);
    assert_eq!(store.count(EntityKind::Player).await, 1);
}

#[tokio::test]
async fn unique_violation_on_create_adopts_the_committed_record() {
    let memory = MemoryStore::new();
    let liverpool = seed_team(&memory, "Liverpool").await;
    let existing = resolver(Arc::new(memory.clone()))
        .resolve(EntityKind::Player, "Mohamed Salah", liverpool)
        .await
        .expect("seed player");
    assert_eq!(existing.outcome, ResolveOutcome::Created);

    let blind = Arc::new(AtomicUsize::new(1));
    let store = BlindStore {
        inner: memory.clone(),
        blind: blind.clone(),
    };
    let adopted = resolver(Arc::new(store))
        .resolve(EntityKind::Player, "Mohamed Salah", liverpool)
        .await
        .expect("adopt");

    assert_eq!(blind.load(Ordering::SeqCst), 0, "first lookup was hidden");
    assert_eq!(adopted.outcome, ResolveOutcome::Adopted);
    assert_eq!(adopted.id, existing.id);
    assert_eq!(memory.count(EntityKind::Player).await, 1);
}
