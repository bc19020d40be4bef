use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use plhub_core::{Column, ColumnType, EntityId, EntityKind, EntityRecord, FieldMap, FieldValue, RecordKey};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::{validated_columns, EntityStore, StoreError, StoreTx};

pub const SCHEMA_SQL: &str = include_str!("../schema.sql");

/// SQLSTATEs for lost or refused connections.
const UNAVAILABLE_SQLSTATES: &[&str] = &["08000", "08003", "08006", "57P01", "57P02", "57P03", "53300"];
/// SQLSTATEs for conflicts that succeed when the transaction is replayed.
const CONFLICT_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

/// Maps a driver error onto the store taxonomy from its variant and SQLSTATE.
pub fn classify_sqlx_error(table: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return StoreError::UniqueViolation {
                    table: table.to_string(),
                    detail: db.message().to_string(),
                };
            }
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if UNAVAILABLE_SQLSTATES.contains(&code.as_str()) {
                StoreError::Unavailable(format!("{code}: {}", db.message()))
            } else if CONFLICT_SQLSTATES.contains(&code.as_str()) {
                StoreError::Conflict(format!("{code}: {}", db.message()))
            } else {
                StoreError::Rejected(format!("{table}: {code}: {}", db.message()))
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Rejected(format!("{table}: {err}")),
    }
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub async fn connect(config: &PgStoreConfig) -> anyhow::Result<Self> {
        info!(
            max_connections = config.max_connections,
            acquire_timeout = ?config.acquire_timeout,
            "connecting to postgres"
        );
        let options =
            PgConnectOptions::from_str(&config.database_url).context("parsing DATABASE_URL")?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs the bootstrap DDL. Safe to repeat.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    fn label(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error("ping", e))?;
        Ok(())
    }

    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<EntityRecord>, StoreError> {
        if kind.column("name").is_none() {
            return Err(StoreError::UnsupportedKey {
                kind,
                key: format!("name={name}"),
            });
        }
        let mut builder = select_from(kind);
        builder.push(" WHERE lower(name) = lower(");
        builder.push_bind(name.trim().to_string());
        builder.push(") ORDER BY created_at, id LIMIT 1");
        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(kind.table(), e))?;
        row.map(|r| decode_row(kind, &r)).transpose()
    }

    async fn scan_all(&self, kind: EntityKind) -> Result<Vec<EntityRecord>, StoreError> {
        let mut builder = select_from(kind);
        builder.push(" ORDER BY created_at, id");
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(kind.table(), e))?;
        rows.iter().map(|r| decode_row(kind, r)).collect()
    }

    async fn count_all(&self, kind: EntityKind) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", kind.table()))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(kind.table(), e))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| classify_sqlx_error("begin", e))?;
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn find_by_key(
        &mut self,
        kind: EntityKind,
        key: &RecordKey,
    ) -> Result<Option<EntityRecord>, StoreError> {
        let mut builder = select_by_key(kind, key)?;
        let row = builder
            .build()
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| classify_sqlx_error(kind.table(), e))?;
        row.map(|r| decode_row(kind, &r)).transpose()
    }

    async fn insert(&mut self, kind: EntityKind, fields: &FieldMap) -> Result<EntityId, StoreError> {
        let id = EntityId::new_v4();
        let mut builder = insert_query(kind, id, fields)?;
        builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify_sqlx_error(kind.table(), e))?;
        Ok(id)
    }

    async fn update(
        &mut self,
        kind: EntityKind,
        id: EntityId,
        fields: &FieldMap,
    ) -> Result<(), StoreError> {
        let Some(mut builder) = update_query(kind, id, fields)? else {
            return Ok(());
        };
        let done = builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify_sqlx_error(kind.table(), e))?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound { kind, id });
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| classify_sqlx_error("commit", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| classify_sqlx_error("rollback", e))
    }
}

fn select_from(kind: EntityKind) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new("SELECT id");
    for column in kind.columns() {
        builder.push(", ");
        builder.push(column.name);
    }
    builder.push(" FROM ");
    builder.push(kind.table());
    builder
}

fn select_by_key(
    kind: EntityKind,
    key: &RecordKey,
) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    if !key.supports(kind) {
        return Err(StoreError::UnsupportedKey {
            kind,
            key: key.to_string(),
        });
    }
    let mut builder = select_from(kind);
    builder.push(" WHERE ");
    match key {
        RecordKey::Id { id } => {
            builder.push("id = ");
            builder.push_bind(id.0);
        }
        RecordKey::Name { folded } => {
            builder.push("lower(name) = ");
            builder.push_bind(folded.clone());
        }
        _ => {
            let key_fields = key.key_fields();
            for (i, (column, value)) in validated_columns(kind, &key_fields)?.into_iter().enumerate() {
                if i > 0 {
                    builder.push(" AND ");
                }
                builder.push(column.name);
                builder.push(" = ");
                push_value(&mut builder, column, value);
            }
        }
    }
    builder.push(" ORDER BY created_at, id LIMIT 1");
    Ok(builder)
}

fn insert_query(
    kind: EntityKind,
    id: EntityId,
    fields: &FieldMap,
) -> Result<QueryBuilder<'static, Postgres>, StoreError> {
    let columns: Vec<_> = validated_columns(kind, fields)?
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .collect();

    let mut builder = QueryBuilder::new("INSERT INTO ");
    builder.push(kind.table());
    builder.push(" (id");
    for (column, _) in &columns {
        builder.push(", ");
        builder.push(column.name);
    }
    builder.push(") VALUES (");
    builder.push_bind(id.0);
    for (column, value) in &columns {
        builder.push(", ");
        push_value(&mut builder, column, value);
    }
    builder.push(")");
    Ok(builder)
}

fn update_query(
    kind: EntityKind,
    id: EntityId,
    fields: &FieldMap,
) -> Result<Option<QueryBuilder<'static, Postgres>>, StoreError> {
    let columns = validated_columns(kind, fields)?;
    if columns.is_empty() {
        return Ok(None);
    }
    let mut builder = QueryBuilder::new("UPDATE ");
    builder.push(kind.table());
    builder.push(" SET ");
    for (i, (column, value)) in columns.into_iter().enumerate() {
        if i > 0 {
            builder.push(", ");
        }
        builder.push(column.name);
        builder.push(" = ");
        push_value(&mut builder, column, value);
    }
    builder.push(" WHERE id = ");
    builder.push_bind(id.0);
    Ok(Some(builder))
}

fn push_value(builder: &mut QueryBuilder<'static, Postgres>, column: &Column, value: &FieldValue) {
    match (column.ty, value) {
        (_, FieldValue::Text(v)) => builder.push_bind(v.clone()),
        (ColumnType::Float, FieldValue::Int(v)) => builder.push_bind(*v as f64),
        (_, FieldValue::Int(v)) => builder.push_bind(*v),
        (_, FieldValue::Float(v)) => builder.push_bind(*v),
        (_, FieldValue::Bool(v)) => builder.push_bind(*v),
        (_, FieldValue::Date(v)) => builder.push_bind(*v),
        (_, FieldValue::Ref(v)) => builder.push_bind(v.0),
        (ColumnType::Text, FieldValue::Null) => builder.push_bind(None::<String>),
        (ColumnType::Int, FieldValue::Null) => builder.push_bind(None::<i64>),
        (ColumnType::Float, FieldValue::Null) => builder.push_bind(None::<f64>),
        (ColumnType::Bool, FieldValue::Null) => builder.push_bind(None::<bool>),
        (ColumnType::Date, FieldValue::Null) => builder.push_bind(None::<NaiveDate>),
        (ColumnType::Ref, FieldValue::Null) => builder.push_bind(None::<Uuid>),
    };
}

fn decode_row(kind: EntityKind, row: &PgRow) -> Result<EntityRecord, StoreError> {
    let decode = |e| classify_sqlx_error(kind.table(), e);
    let id: Uuid = row.try_get("id").map_err(decode)?;
    let mut fields = FieldMap::new();
    for column in kind.columns() {
        let name = column.name;
        let value: FieldValue = match column.ty {
            ColumnType::Text => row.try_get::<Option<String>, _>(name).map_err(decode)?.into(),
            ColumnType::Int => row.try_get::<Option<i64>, _>(name).map_err(decode)?.into(),
            ColumnType::Float => row.try_get::<Option<f64>, _>(name).map_err(decode)?.into(),
            ColumnType::Bool => row.try_get::<Option<bool>, _>(name).map_err(decode)?.into(),
            ColumnType::Date => row.try_get::<Option<NaiveDate>, _>(name).map_err(decode)?.into(),
            ColumnType::Ref => row
                .try_get::<Option<Uuid>, _>(name)
                .map_err(decode)?
                .map(EntityId)
                .into(),
        };
        if !value.is_null() {
            fields.insert(name.to_string(), value);
        }
    }
    Ok(EntityRecord::new(kind, EntityId(id), fields))
}
