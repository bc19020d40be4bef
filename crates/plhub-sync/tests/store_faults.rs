use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plhub_adapters::{Dataset, InMemorySource, TabularSource};
use plhub_core::{EntityKind, EntityRecord, SourceRow};
use plhub_storage::{EntityStore, MemoryStore, StoreError, StoreTx};
use plhub_sync::{AliasTable, RunStatus, SyncConfig, SyncError, SyncPipeline};

fn config() -> SyncConfig {
    SyncConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(2),
        ..SyncConfig::default()
    }
}

fn stadiums() -> Vec<(Dataset, Box<dyn TabularSource>)> {
    let rows = ["Anfield", "Emirates Stadium", "Villa Park"]
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let mut row = SourceRow::default()
                .with("name", name)
                .with("city", "Somewhere")
                .with("capacity", "40000");
            row.line = i + 1;
            row
        })
        .collect();
    vec![(
        Dataset::Stadiums,
        Box::new(InMemorySource::new("stadiums", rows)) as Box<dyn TabularSource>,
    )]
}

fn pipeline(config: SyncConfig, store: Arc<dyn EntityStore>) -> SyncPipeline {
    let aliases = Arc::new(AliasTable::builtin().expect("builtin aliases"));
    SyncPipeline::new(config, store, aliases)
}

/// Fails every `period`-th transaction begin; `period == 1` means always.
struct FlakyStore {
    inner: MemoryStore,
    period: usize,
    begins: AtomicUsize,
}

impl FlakyStore {
    fn new(inner: MemoryStore, period: usize) -> Self {
        Self {
            inner,
            period,
            begins: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EntityStore for FlakyStore {
    fn label(&self) -> &'static str {
        "flaky"
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
        let n = self.begins.fetch_add(1, Ordering::SeqCst) + 1;
        if n % self.period == 0 {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner.begin().await
    }
}

#[tokio::test]
async fn transient_write_failures_are_retried_to_completion() {
    let memory = MemoryStore::new();
    let store = Arc::new(FlakyStore::new(memory.clone(), 3));
    let summary = pipeline(config(), store)
        .run_sources(stadiums())
        .await
        .expect("run");

    assert_eq!(summary.status, RunStatus::Completed);
    assert_eq!(summary.rejected(), 0);
    assert_eq!(summary.stages[&Dataset::Stadiums].inserted, 3);
    assert_eq!(memory.count(EntityKind::Stadium).await, 3);
}

#[tokio::test]
async fn a_briefly_unreachable_store_is_pinged_again() {
    let store = MemoryStore::new();
    store.fail_next(2);
    let summary = pipeline(config(), Arc::new(store.clone()))
        .run_sources(stadiums())
        .await
        .expect("run");

    assert_eq!(summary.stages[&Dataset::Stadiums].inserted, 3);
    assert_eq!(store.count(EntityKind::Stadium).await, 3);
}

#[tokio::test]
async fn consecutive_exhausted_writes_abort_the_run() {
    let memory = MemoryStore::new();
    let store = Arc::new(FlakyStore::new(memory.clone(), 1));
    let config = SyncConfig {
        max_attempts: 2,
        outage_threshold: 2,
        write_concurrency: 1,
        ..config()
    };

    let err = pipeline(config, store)
        .run_sources(stadiums())
        .await
        .expect_err("outage");

    match err.downcast_ref::<SyncError>() {
        Some(SyncError::StoreOutage {
            dataset,
            consecutive,
        }) => {
            assert_eq!(*dataset, "stadiums");
            assert!(*consecutive >= 2);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(memory.count(EntityKind::Stadium).await, 0);
}
