//! Persistent entity store seam: transactional traits, error classification and retry.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use plhub_core::{Column, EntityId, EntityKind, EntityRecord, FieldMap, FieldValue, RecordKey};
use thiserror::Error;
use tracing::warn;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{classify_sqlx_error, PgEntityStore, PgStoreConfig, SCHEMA_SQL};

pub const CRATE_NAME: &str = "plhub-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Transient,
    Terminal,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store call `{op}` timed out after {after:?}")]
    Timeout { op: String, after: Duration },
    #[error("transient store conflict: {0}")]
    Conflict(String),
    #[error("unique constraint violated on {table}: {detail}")]
    UniqueViolation { table: String, detail: String },
    #[error("unknown column `{column}` for {kind}")]
    UnknownColumn { kind: EntityKind, column: String },
    #[error("value for {kind}.{column} has the wrong type")]
    TypeMismatch { kind: EntityKind, column: String },
    #[error("key {key} cannot address {kind} records")]
    UnsupportedKey { kind: EntityKind, key: String },
    #[error("{kind} record {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },
    #[error("store rejected the operation: {0}")]
    Rejected(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<StoreError>,
    },
}

impl StoreError {
    /// Transient errors may be retried; everything else is final for the call.
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout { .. } | StoreError::Conflict(_) => {
                RetryDisposition::Transient
            }
            _ => RetryDisposition::Terminal,
        }
    }

    /// True for a transient failure that outlived its retry budget.
    pub fn is_exhausted_transient(&self) -> bool {
        matches!(self, StoreError::Exhausted { last, .. } if last.disposition() == RetryDisposition::Transient)
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Total tries per call, first try included.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `call` under a per-call timeout, retrying transient failures with capped
/// exponential backoff. Terminal errors return immediately; a transient error on
/// the last attempt comes back wrapped in [`StoreError::Exhausted`].
pub async fn retry_store_op<T, F, Fut>(
    policy: &BackoffPolicy,
    timeout: Duration,
    op: &str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0usize;
    loop {
        let result = match tokio::time::timeout(timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                op: op.to_string(),
                after: timeout,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.disposition() == RetryDisposition::Transient => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(StoreError::Exhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(op, attempt, max_attempts, ?delay, error = %err, "transient store failure; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Resolves every field against the column catalogue, rejecting unknown names and mistyped values.
pub(crate) fn validated_columns<'a>(
    kind: EntityKind,
    fields: &'a FieldMap,
) -> Result<Vec<(&'static Column, &'a FieldValue)>, StoreError> {
    fields
        .iter()
        .map(|(name, value)| {
            let column = kind.column(name).ok_or_else(|| StoreError::UnknownColumn {
                kind,
                column: name.clone(),
            })?;
            if !value.matches_type(column.ty) {
                return Err(StoreError::TypeMismatch {
                    kind,
                    column: name.clone(),
                });
            }
            Ok((column, value))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Inserted(EntityId),
    Updated(EntityId),
    Unchanged(EntityId),
}

impl WriteOutcome {
    pub fn id(&self) -> EntityId {
        match self {
            WriteOutcome::Inserted(id) | WriteOutcome::Updated(id) | WriteOutcome::Unchanged(id) => {
                *id
            }
        }
    }
}

/// Computes the columns to change on an existing record; an empty map means no write.
pub type MergePlan = dyn Fn(&EntityRecord, &FieldMap) -> FieldMap + Send + Sync;

/// One open transaction. Dropping it without `commit` rolls back.
#[async_trait]
pub trait StoreTx: Send {
    async fn find_by_key(
        &mut self,
        kind: EntityKind,
        key: &RecordKey,
    ) -> Result<Option<EntityRecord>, StoreError>;

    /// Inserts a new record and returns its store-assigned id. Null values are not written.
    async fn insert(&mut self, kind: EntityKind, fields: &FieldMap) -> Result<EntityId, StoreError>;

    async fn update(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        fields: &FieldMap,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    fn label(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    /// First record of `kind` whose `name` equals `name` case-insensitively.
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<EntityRecord>, StoreError>;

    /// Every record of `kind`, oldest first.
    async fn scan_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError>;

    /// Number of stored records of `kind`.
    async fn count_all(&self, kind: EntityKind) -> Result<usize, StoreError> {
        Ok(self.scan_all(kind).await?.len())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError>;

    async fn insert(&self, kind: EntityKind, fields: &FieldMap) -> Result<EntityId, StoreError> {
        let mut tx = self.begin().await?;
        let id = tx.insert(kind, fields).await?;
        tx.commit().await?;
        Ok(id)
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: EntityId,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        tx.update(kind, id, fields).await?;
        tx.commit().await
    }

    /// Select-then-insert-or-update of one keyed record inside a single transaction.
    ///
    /// On insert the key's implied columns are written together with `fields`;
    /// on update only the columns returned by `plan` are touched.
    async fn upsert(
        &self,
        kind: EntityKind,
        key: &RecordKey,
        fields: &FieldMap,
        plan: &MergePlan,
    ) -> Result<WriteOutcome, StoreError> {
        if !key.supports(kind) {
            return Err(StoreError::UnsupportedKey {
                kind,
                key: key.to_string(),
            });
        }
        let mut tx = self.begin().await?;
        let outcome = match tx.find_by_key(kind, key).await? {
            Some(existing) => {
                let changes = plan(&existing, fields);
                if changes.is_empty() {
                    WriteOutcome::Unchanged(existing.id)
                } else {
                    tx.update(kind, existing.id, &changes).await?;
                    WriteOutcome::Updated(existing.id)
                }
            }
            None => {
                let mut row = fields.clone();
                row.extend(key.key_fields());
                WriteOutcome::Inserted(tx.insert(kind, &row).await?)
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: usize) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn classification_is_by_variant() {
        assert_eq!(
            StoreError::Unavailable("reset".into()).disposition(),
            RetryDisposition::Transient
        );
        assert_eq!(
            StoreError::UniqueViolation {
                table: "teams".into(),
                detail: "dup".into()
            }
            .disposition(),
            RetryDisposition::Terminal
        );
        // A connection-sounding message on a terminal variant stays terminal.
        assert_eq!(
            StoreError::Rejected("connection refused".into()).disposition(),
            RetryDisposition::Terminal
        );
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry_store_op(&fast_policy(3), Duration::from_secs(1), "probe", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("down".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt succeeds"), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_transient_errors_are_wrapped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = retry_store_op(&fast_policy(3), Duration::from_secs(1), "probe", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Unavailable("down".into()))
            }
        })
        .await
        .expect_err("never succeeds");

        assert!(err.is_exhausted_transient());
        assert_eq!(err.disposition(), RetryDisposition::Terminal);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_are_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = retry_store_op(&fast_policy(3), Duration::from_secs(1), "probe", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::Rejected("check constraint".into()))
            }
        })
        .await
        .expect_err("terminal");

        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_count_as_transient() {
        let err = retry_store_op(&fast_policy(2), Duration::from_millis(50), "slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, StoreError>(())
        })
        .await
        .expect_err("times out");

        match err {
            StoreError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, StoreError::Timeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
