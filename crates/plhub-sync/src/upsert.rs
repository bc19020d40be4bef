use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use plhub_core::{EntityKind, EntityRecord, FieldMap, RecordKey};
use plhub_storage::{retry_store_op, BackoffPolicy, EntityStore, StoreError, WriteOutcome};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::control::RunControl;

/// Columns of `incoming` that should be written over `existing`.
///
/// Null values and zeros in zero-is-empty columns never replace anything, and
/// unchanged values are skipped. Columns outside the catalogue are passed
/// through so the store rejects them.
pub fn merge_fields(kind: EntityKind, existing: &EntityRecord, incoming: &FieldMap) -> FieldMap {
    incoming
        .iter()
        .filter(|(name, value)| match kind.column(name) {
            Some(column) => !value.is_empty_for(column) && existing.get(name) != Some(*value),
            None => true,
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// One keyed write waiting to be flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub kind: EntityKind,
    pub key: RecordKey,
    pub fields: FieldMap,
    /// Source line the values came from.
    pub line: usize,
}

/// Ordered set of pending writes with at most one write per target key.
///
/// A stage fills one batch from all of its rows, so the last row for a key wins
/// regardless of how the writes are later chunked.
#[derive(Debug, Default)]
pub struct WriteBatch {
    writes: Vec<PendingWrite>,
    positions: HashMap<(EntityKind, RecordKey), usize>,
    collapsed: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `write`. If the batch already targets the same key, the later row's
    /// values replace the earlier ones and the superseded line is returned.
    pub fn push(&mut self, write: PendingWrite) -> Option<usize> {
        let target = (write.kind, write.key.clone());
        match self.positions.get(&target) {
            Some(&position) => {
                let superseded = std::mem::replace(&mut self.writes[position], write);
                self.collapsed += 1;
                debug!(key = %target.1, line = superseded.line, "collapsed duplicate key");
                Some(superseded.line)
            }
            None => {
                self.positions.insert(target, self.writes.len());
                self.writes.push(write);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn collapsed(&self) -> usize {
        self.collapsed
    }

    pub fn into_writes(self) -> Vec<PendingWrite> {
        self.writes
    }

    /// Splits the writes, in order, into chunks of at most `size`.
    pub fn into_chunks(self, size: usize) -> Vec<Vec<PendingWrite>> {
        let size = size.max(1);
        let mut chunks = Vec::with_capacity(self.writes.len().div_ceil(size));
        let mut writes = self.writes.into_iter().peekable();
        while writes.peek().is_some() {
            chunks.push(writes.by_ref().take(size).collect());
        }
        chunks
    }
}

#[derive(Debug)]
pub struct WriteResult {
    pub line: usize,
    pub kind: EntityKind,
    pub key: RecordKey,
    pub result: Result<WriteOutcome, StoreError>,
}

/// Applies keyed writes with field-level merging, one transaction per key.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn EntityStore>,
    policy: BackoffPolicy,
    timeout: Duration,
    concurrency: usize,
}

impl UpsertEngine {
    pub fn new(
        store: Arc<dyn EntityStore>,
        policy: BackoffPolicy,
        timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            policy,
            timeout,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn upsert(
        &self,
        kind: EntityKind,
        key: &RecordKey,
        fields: &FieldMap,
    ) -> Result<WriteOutcome, StoreError> {
        let plan = move |existing: &EntityRecord, incoming: &FieldMap| {
            merge_fields(kind, existing, incoming)
        };
        retry_store_op(&self.policy, self.timeout, "upsert", || {
            self.store.upsert(kind, key, fields, &plan)
        })
        .await
    }

    /// Writes `writes` in order. Stops issuing writes once `control` asks to
    /// stop; writes never issued are absent from the result. A write whose task
    /// dies is reported as a terminal store error for its line.
    pub async fn flush(
        &self,
        writes: Vec<PendingWrite>,
        control: &Arc<RunControl>,
    ) -> Vec<WriteResult> {
        if self.concurrency == 1 {
            let mut results = Vec::with_capacity(writes.len());
            for write in writes {
                if control.should_stop() {
                    break;
                }
                let result = self.upsert(write.kind, &write.key, &write.fields).await;
                control.record(&result);
                results.push(WriteResult {
                    line: write.line,
                    kind: write.kind,
                    key: write.key,
                    result,
                });
            }
            return results;
        }

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let mut issued: Vec<(usize, EntityKind, RecordKey)> = Vec::with_capacity(writes.len());
        for (position, write) in writes.into_iter().enumerate() {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            if control.should_stop() {
                break;
            }
            issued.push((write.line, write.kind, write.key.clone()));
            let engine = self.clone();
            let control = control.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = engine.upsert(write.kind, &write.key, &write.fields).await;
                control.record(&result);
                (
                    position,
                    WriteResult {
                        line: write.line,
                        kind: write.kind,
                        key: write.key,
                        result,
                    },
                )
            });
        }

        let mut slots: Vec<Option<WriteResult>> = issued.iter().map(|_| None).collect();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => slots[position] = Some(result),
                Err(err) => {
                    error!(error = %err, "write task failed to complete");
                    failure = Some(err.to_string());
                }
            }
        }
        slots
            .into_iter()
            .zip(issued)
            .map(|(slot, (line, kind, key))| {
                slot.unwrap_or_else(|| WriteResult {
                    line,
                    kind,
                    key,
                    result: Err(StoreError::Rejected(format!(
                        "write task did not complete: {}",
                        failure.as_deref().unwrap_or("unknown failure")
                    ))),
                })
            })
            .collect()
    }
}
