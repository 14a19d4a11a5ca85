//! Adapter for append-only versioned tables.
//!
//! Every logical entity (keyed by `id`) is a chain of version rows. Exactly
//! one row per entity has `_is_latest` set; reads see only those heads unless
//! the predicate asks about `_is_latest` or `_deleted` itself.
//!
//! ```text
//! NonExistent --create--> Active(1) --update--> Active(2) --delete--> Deleted(2)
//!                                                            |
//!                                  Active(3, restore_of=1) <-restore(1)
//! ```
//!
//! Each transition holds the entity's lock and runs in one remote
//! transaction. The previous head is retired with a conditional update
//! before the new head is written; if that update finds no latest row the
//! transaction is rolled back and the call fails with a conflict.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::AnyConnection;
use tracing::{debug, warn};

use crate::ast::{AggregationSpec, JoinedQuery, Row, SelectOptions, Value, Where};
use crate::config::TableConfig;
use crate::engine;
use crate::error::{AdapterError, AdapterResult};
use crate::plain::reads;
use crate::registry::{ConnectionRegistry, RemotePool};
use crate::schema::{FieldDescriptor, FieldType, TableSchema};
use crate::table::{AggregationResult, Remote, Table};
use crate::transpiler::{Dialect, dml};

pub const ENTITY_KEY: &str = "id";
pub const VERSION_ID: &str = "_version_id";
pub const VERSION: &str = "_version";
pub const IS_LATEST: &str = "_is_latest";
pub const DELETED: &str = "_deleted";
pub const TIME: &str = "_time";
pub const USER_ID: &str = "_userid";
pub const RESTORE_OF: &str = "_restore_of_version";

/// Columns the adapter manages. None of them can be written through records.
pub const METADATA_FIELDS: [&str; 8] = [
    ENTITY_KEY, VERSION_ID, VERSION, IS_LATEST, DELETED, TIME, USER_ID, RESTORE_OF,
];

const CREATE_LOCK: &str = "*create*";

fn metadata_descriptors() -> Vec<FieldDescriptor> {
    vec![
        FieldDescriptor::new(VERSION_ID, FieldType::Integer).pk(),
        FieldDescriptor::new(VERSION, FieldType::Integer),
        FieldDescriptor::new(IS_LATEST, FieldType::Bool),
        FieldDescriptor::new(DELETED, FieldType::Bool),
        FieldDescriptor::new(TIME, FieldType::Date),
        FieldDescriptor::new(USER_ID, FieldType::Integer),
        FieldDescriptor::new(RESTORE_OF, FieldType::Integer),
    ]
}

/// A versioned remote table.
#[derive(Debug, Clone)]
pub struct VersionedTable {
    remote: Remote,
    /// Entity key, payload and metadata columns.
    schema: TableSchema,
    payload: Vec<String>,
}

impl VersionedTable {
    /// Build the adapter. Configured fields named like metadata columns are
    /// taken to describe those columns and dropped from the payload.
    pub fn new(registry: Arc<ConnectionRegistry>, config: TableConfig) -> AdapterResult<Self> {
        let payload_fields: Vec<FieldDescriptor> = config
            .schema
            .fields()
            .iter()
            .filter(|f| !METADATA_FIELDS.contains(&f.name.as_str()))
            .cloned()
            .map(|mut f| {
                f.primary_key = false;
                f
            })
            .collect();
        let payload = payload_fields.iter().map(|f| f.name.clone()).collect();

        let mut fields = vec![FieldDescriptor::new(ENTITY_KEY, FieldType::Integer)];
        fields.extend(payload_fields);
        fields.extend(metadata_descriptors());
        let schema = TableSchema::new(&config.schema.schema, &config.schema.table, fields)?;

        Ok(Self {
            remote: Remote::new(registry, config.connection),
            schema,
            payload,
        })
    }

    /// Names of the user-visible payload fields.
    pub fn payload_fields(&self) -> &[String] {
        &self.payload
    }

    fn lock_scope(&self) -> String {
        format!("{}.{}", self.schema.schema, self.schema.table)
    }

    /// Restrict `filter` to current, non-deleted heads unless it already
    /// talks about version state.
    pub fn visible(&self, filter: &Where) -> Where {
        if filter.mentions(IS_LATEST) || filter.mentions(DELETED) {
            filter.clone()
        } else {
            filter.clone().eq(IS_LATEST, true).eq(DELETED, false)
        }
    }

    fn check_record(&self, record: &Row, allow_key: bool) -> AdapterResult<()> {
        for name in record.keys() {
            if name == ENTITY_KEY && allow_key {
                continue;
            }
            if METADATA_FIELDS.contains(&name.as_str()) {
                return Err(AdapterError::validation(format!(
                    "field '{}' is managed by the versioned table and cannot be written",
                    name
                )));
            }
            self.schema.field(name)?;
        }
        Ok(())
    }

    fn entity_key(id: &Value) -> AdapterResult<i64> {
        id.coerce(ENTITY_KEY, &FieldType::Integer)?
            .as_i64()
            .ok_or_else(|| AdapterError::validation(format!("'{}' is not an entity key", id)))
    }

    fn version_row(
        &self,
        payload: impl Fn(&str) -> Option<Value>,
        key: i64,
        version: i64,
        user_id: Option<i64>,
        restore_of: Option<i64>,
    ) -> Row {
        let mut row: Row = self
            .payload
            .iter()
            .filter_map(|name| payload(name).map(|v| (name.clone(), v)))
            .collect();
        row.insert(ENTITY_KEY.to_string(), Value::Int(key));
        row.insert(VERSION.to_string(), Value::Int(version));
        row.insert(IS_LATEST.to_string(), Value::Bool(true));
        row.insert(DELETED.to_string(), Value::Bool(false));
        row.insert(TIME.to_string(), now());
        row.insert(USER_ID.to_string(), user_id.into());
        row.insert(RESTORE_OF.to_string(), restore_of.into());
        row
    }

    async fn head(
        &self,
        conn: &mut AnyConnection,
        dialect: Dialect,
        key: i64,
    ) -> AdapterResult<Option<Row>> {
        let stmt = dml::select(
            &self.schema,
            &Where::new().eq(ENTITY_KEY, key).eq(IS_LATEST, true),
            &SelectOptions::new().limit(1),
            dialect,
        )?;
        engine::fetch_optional(conn, &stmt, &self.schema).await
    }

    /// Retire `head`. Fails with a conflict when it is no longer latest.
    async fn retire(
        &self,
        conn: &mut AnyConnection,
        dialect: Dialect,
        key: i64,
        head: &Row,
    ) -> AdapterResult<()> {
        let version_id = head.get(VERSION_ID).cloned().unwrap_or(Value::Null);
        let stmt = dml::update(
            &self.schema,
            &Row::from([(IS_LATEST.to_string(), Value::Bool(false))]),
            &Where::new().eq(VERSION_ID, version_id.clone()).eq(IS_LATEST, true),
            dialect,
        )?;
        if engine::execute(conn, &stmt).await? == 0 {
            warn!(table = %self.schema.table, key, %version_id, "head changed during transition, rolling back");
            return Err(AdapterError::Conflict(format!(
                "entity {} of '{}' was modified concurrently",
                key, self.schema.table
            )));
        }
        Ok(())
    }

    async fn write_version(&self, conn: &mut AnyConnection, dialect: Dialect, row: &Row) -> AdapterResult<()> {
        let stmt = dml::insert(&self.schema, row, dialect)?;
        engine::fetch_optional(conn, &stmt, &self.schema).await?;
        Ok(())
    }

    fn not_found(&self, key: i64, what: &str) -> AdapterError {
        AdapterError::NotFound(format!("{} entity {} in '{}'", what, key, self.schema.table))
    }

    /// Create an entity and return its key.
    ///
    /// The key is the record's `id` when given, otherwise one more than the
    /// largest key in the table.
    pub async fn create(&self, record: &Row, user_id: Option<i64>) -> AdapterResult<i64> {
        self.check_record(record, true)?;
        let pool = self.remote.pool().await?;
        let dialect = pool.dialect();
        let scope = self.lock_scope();
        let _create = pool.locks().lock(&scope, CREATE_LOCK).await;

        // Locks before connections, as in every transition: the key lookup
        // hands its connection back before the entity lock is awaited.
        let key = match record.get(ENTITY_KEY).filter(|v| !v.is_null()) {
            Some(id) => Self::entity_key(id)?,
            None => {
                let mut conn = pool.pool().acquire().await?;
                self.next_key(&mut conn, dialect).await?
            }
        };
        let _entity = pool.locks().lock(&scope, &key.to_string()).await;

        let mut tx = pool.pool().begin().await?;
        let existing = dml::count(&self.schema, &Where::new().eq(ENTITY_KEY, key), dialect)?;
        let taken = engine::fetch_optional(&mut tx, &existing, &self.schema)
            .await?
            .and_then(|r| r.get("count").and_then(Value::as_i64))
            .unwrap_or(0);
        if taken > 0 {
            return Err(AdapterError::ConstraintViolation(format!(
                "entity {} already exists in '{}'",
                key, self.schema.table
            )));
        }

        let row = self.version_row(|name| record.get(name).cloned(), key, 1, user_id, None);
        self.write_version(&mut tx, dialect, &row).await?;
        tx.commit().await?;
        debug!(table = %self.schema.table, key, "created entity");
        Ok(key)
    }

    async fn next_key(&self, conn: &mut AnyConnection, dialect: Dialect) -> AdapterResult<i64> {
        let stmt = dml::select_max(&self.schema, ENTITY_KEY, dialect)?;
        let max = engine::fetch_optional(conn, &stmt, &self.schema)
            .await?
            .and_then(|r| r.get("max").and_then(Value::as_i64))
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Write a new head with `record` overlaid on the current payload.
    pub async fn update(&self, record: &Row, id: &Value, user_id: Option<i64>) -> AdapterResult<()> {
        self.check_record(record, false)?;
        if record.is_empty() {
            return Err(AdapterError::validation("update record has no fields"));
        }
        let key = Self::entity_key(id)?;
        let pool = self.remote.pool().await?;
        let dialect = pool.dialect();
        let _entity = pool.locks().lock(&self.lock_scope(), &key.to_string()).await;

        let mut tx = pool.pool().begin().await?;
        let head = self
            .head(&mut tx, dialect, key)
            .await?
            .filter(|h| !is_deleted(h))
            .ok_or_else(|| self.not_found(key, "no current"))?;
        let row = self.version_row(
            |name| record.get(name).or_else(|| head.get(name)).cloned(),
            key,
            version_of(&head) + 1,
            user_id,
            None,
        );
        self.retire(&mut tx, dialect, key, &head).await?;
        self.write_version(&mut tx, dialect, &row).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Mark the current head deleted. No new version is written.
    pub async fn delete(&self, id: &Value, user_id: Option<i64>) -> AdapterResult<()> {
        let key = Self::entity_key(id)?;
        self.delete_entity(key, user_id, &Where::new()).await
    }

    /// Soft-delete the head of `key` if it still matches `filter`.
    async fn delete_entity(&self, key: i64, user_id: Option<i64>, filter: &Where) -> AdapterResult<()> {
        let pool = self.remote.pool().await?;
        let dialect = pool.dialect();
        let _entity = pool.locks().lock(&self.lock_scope(), &key.to_string()).await;

        let mut tx = pool.pool().begin().await?;
        let head = self
            .head(&mut tx, dialect, key)
            .await?
            .filter(|h| !is_deleted(h))
            .ok_or_else(|| self.not_found(key, "no current"))?;
        let version_id = head.get(VERSION_ID).cloned().unwrap_or(Value::Null);
        let changes = Row::from([
            (DELETED.to_string(), Value::Bool(true)),
            (TIME.to_string(), now()),
            (USER_ID.to_string(), user_id.into()),
        ]);
        let stmt = dml::update(
            &self.schema,
            &changes,
            &Where::new()
                .eq(VERSION_ID, version_id)
                .eq(IS_LATEST, true)
                .eq(DELETED, false)
                .and(filter.clone()),
            dialect,
        )?;
        if engine::execute(&mut tx, &stmt).await? == 0 {
            if !filter.is_empty() {
                return Err(self.not_found(key, "no matching"));
            }
            warn!(table = %self.schema.table, key, "head changed during delete, rolling back");
            return Err(AdapterError::Conflict(format!(
                "entity {} of '{}' was modified concurrently",
                key, self.schema.table
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Write a new head carrying the payload of `version`.
    ///
    /// Works from a deleted head (undelete) and from an active one (roll
    /// back). Returns the new version number.
    pub async fn restore(&self, id: &Value, version: i64, user_id: Option<i64>) -> AdapterResult<i64> {
        let key = Self::entity_key(id)?;
        let pool = self.remote.pool().await?;
        let dialect = pool.dialect();
        let _entity = pool.locks().lock(&self.lock_scope(), &key.to_string()).await;

        let mut tx = pool.pool().begin().await?;
        let head = self
            .head(&mut tx, dialect, key)
            .await?
            .ok_or_else(|| self.not_found(key, "no"))?;
        let stmt = dml::select(
            &self.schema,
            &Where::new().eq(ENTITY_KEY, key).eq(VERSION, version),
            &SelectOptions::new().limit(1),
            dialect,
        )?;
        let source = engine::fetch_optional(&mut tx, &stmt, &self.schema)
            .await?
            .ok_or_else(|| {
                AdapterError::NotFound(format!(
                    "version {} of entity {} in '{}'",
                    version, key, self.schema.table
                ))
            })?;

        let next = version_of(&head) + 1;
        let row = self.version_row(|name| source.get(name).cloned(), key, next, user_id, Some(version));
        self.retire(&mut tx, dialect, key, &head).await?;
        self.write_version(&mut tx, dialect, &row).await?;
        tx.commit().await?;
        Ok(next)
    }

    /// Every version of an entity, oldest first.
    pub async fn get_history(&self, id: &Value) -> AdapterResult<Vec<Row>> {
        let key = Self::entity_key(id)?;
        reads::rows(
            &self.remote,
            &self.schema,
            &Where::new().eq(ENTITY_KEY, key),
            &SelectOptions::new().order_by(VERSION),
        )
        .await
    }

    async fn matching_heads(&self, pool: &RemotePool, filter: &Where) -> AdapterResult<Vec<i64>> {
        let stmt = dml::select_distinct(&self.schema, ENTITY_KEY, &self.visible(filter), pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        let rows = engine::fetch_rows(&mut conn, &stmt, &self.schema).await?;
        Ok(rows
            .iter()
            .filter_map(|r| r.get(ENTITY_KEY).and_then(Value::as_i64))
            .collect())
    }
}

fn now() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn is_deleted(row: &Row) -> bool {
    row.get(DELETED).and_then(Value::as_bool).unwrap_or(false)
}

fn version_of(row: &Row) -> i64 {
    row.get(VERSION).and_then(Value::as_i64).unwrap_or(0)
}

#[async_trait]
impl Table for VersionedTable {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn insert_row(&self, record: &Row, user_id: Option<i64>) -> AdapterResult<Value> {
        self.create(record, user_id).await.map(Value::Int)
    }

    async fn update_row(&self, record: &Row, id: &Value, user_id: Option<i64>) -> AdapterResult<()> {
        self.update(record, id, user_id).await
    }

    /// Soft-delete every visible head matching `filter`.
    async fn delete_rows(&self, filter: &Where, user_id: Option<i64>) -> AdapterResult<u64> {
        let pool = self.remote.pool().await?;
        let keys = self.matching_heads(&pool, filter).await?;
        let mut deleted = 0;
        for key in keys {
            match self.delete_entity(key, user_id, filter).await {
                Ok(()) => deleted += 1,
                // Deleted or changed by someone else since the scan.
                Err(AdapterError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    async fn count_rows(&self, filter: &Where) -> AdapterResult<i64> {
        reads::count(&self.remote, &self.schema, &self.visible(filter)).await
    }

    async fn distinct_values(&self, field: &str, filter: &Where) -> AdapterResult<Vec<Value>> {
        reads::distinct(&self.remote, &self.schema, field, &self.visible(filter)).await
    }

    async fn get_rows(&self, filter: &Where, options: &SelectOptions) -> AdapterResult<Vec<Row>> {
        reads::rows(&self.remote, &self.schema, &self.visible(filter), options).await
    }

    async fn get_joined_rows(&self, query: &JoinedQuery) -> AdapterResult<Vec<Row>> {
        let mut query = query.clone();
        query.filter = self.visible(&query.filter);
        reads::joined(&self.remote, &self.schema, &query).await
    }

    async fn aggregation_query(
        &self,
        specs: &[AggregationSpec],
        filter: &Where,
        options: &SelectOptions,
    ) -> AdapterResult<AggregationResult> {
        reads::aggregate(&self.remote, &self.schema, specs, &self.visible(filter), options).await
    }
}
