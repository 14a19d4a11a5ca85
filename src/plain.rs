//! Adapter for ordinary remote tables.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ast::{AggregationSpec, JoinedQuery, Row, SelectOptions, Value, Where};
use crate::config::TableConfig;
use crate::engine;
use crate::error::{AdapterError, AdapterResult};
use crate::registry::ConnectionRegistry;
use crate::schema::TableSchema;
use crate::table::{AggregationResult, Remote, Table};
use crate::transpiler::{compile_aggregation, compile_joined_query, dml};

/// A remote table with no history: rows are updated and deleted in place.
#[derive(Debug, Clone)]
pub struct PlainTable {
    remote: Remote,
    schema: TableSchema,
}

impl PlainTable {
    pub fn new(registry: Arc<ConnectionRegistry>, config: TableConfig) -> Self {
        Self {
            remote: Remote::new(registry, config.connection),
            schema: config.schema,
        }
    }
}

/// Run the read half of the table contract against `schema`.
///
/// Shared with the versioned adapter, which passes its own visibility filter.
pub(crate) mod reads {
    use super::*;

    pub async fn count(remote: &Remote, schema: &TableSchema, filter: &Where) -> AdapterResult<i64> {
        let pool = remote.pool().await?;
        let stmt = dml::count(schema, filter, pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        let row = engine::fetch_optional(&mut conn, &stmt, schema).await?;
        Ok(row
            .and_then(|r| r.get("count").and_then(Value::as_i64))
            .unwrap_or(0))
    }

    pub async fn distinct(
        remote: &Remote,
        schema: &TableSchema,
        field: &str,
        filter: &Where,
    ) -> AdapterResult<Vec<Value>> {
        let pool = remote.pool().await?;
        let stmt = dml::select_distinct(schema, field, filter, pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        let rows = engine::fetch_rows(&mut conn, &stmt, schema).await?;
        Ok(rows
            .into_iter()
            .map(|mut r| r.remove(field).unwrap_or(Value::Null))
            .collect())
    }

    pub async fn rows(
        remote: &Remote,
        schema: &TableSchema,
        filter: &Where,
        options: &SelectOptions,
    ) -> AdapterResult<Vec<Row>> {
        let pool = remote.pool().await?;
        let stmt = dml::select(schema, filter, options, pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        engine::fetch_rows(&mut conn, &stmt, schema).await
    }

    pub async fn joined(
        remote: &Remote,
        schema: &TableSchema,
        query: &JoinedQuery,
    ) -> AdapterResult<Vec<Row>> {
        let pool = remote.pool().await?;
        let (stmt, meta) = compile_joined_query(schema, query, pool.dialect())?;
        let mut rows = {
            let mut conn = pool.pool().acquire().await?;
            engine::fetch_rows(&mut conn, &stmt, schema).await?
        };
        engine::apply_lookups(&mut rows, &meta).await?;
        Ok(rows)
    }

    pub async fn aggregate(
        remote: &Remote,
        schema: &TableSchema,
        specs: &[AggregationSpec],
        filter: &Where,
        options: &SelectOptions,
    ) -> AdapterResult<AggregationResult> {
        let pool = remote.pool().await?;
        let query = compile_aggregation(schema, specs, filter, options, pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        let rows = engine::fetch_rows(&mut conn, &query.statement, schema).await?;
        if query.grouped {
            Ok(AggregationResult::Grouped(rows))
        } else {
            Ok(AggregationResult::Summary(rows.into_iter().next().unwrap_or_default()))
        }
    }
}

#[async_trait]
impl Table for PlainTable {
    fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn insert_row(&self, record: &Row, _user_id: Option<i64>) -> AdapterResult<Value> {
        let pool = self.remote.pool().await?;
        let stmt = dml::insert(&self.schema, record, pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        let Some(key) = self.schema.key_field() else {
            engine::execute(&mut conn, &stmt).await?;
            return Ok(Value::Null);
        };
        let row = engine::fetch_optional(&mut conn, &stmt, &self.schema).await?;
        let value = row
            .and_then(|mut r| r.remove("pk"))
            .ok_or_else(|| AdapterError::RemoteQuery("insert returned no key".to_string()))?;
        Ok(value.coerce(&key.name, &key.ty).unwrap_or(value))
    }

    async fn update_row(&self, record: &Row, id: &Value, _user_id: Option<i64>) -> AdapterResult<()> {
        let pk = self
            .schema
            .key_field()
            .map(|f| f.name.as_str())
            .ok_or_else(|| {
                AdapterError::validation(format!(
                    "table '{}' has no primary key or 'id' field; rows cannot be updated by key",
                    self.schema.table
                ))
            })?;
        let pool = self.remote.pool().await?;
        let stmt = dml::update(&self.schema, record, &Where::new().eq(pk, id.clone()), pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        match engine::execute(&mut conn, &stmt).await? {
            0 => Err(AdapterError::NotFound(format!(
                "no row in '{}' with {} = {}",
                self.schema.table, pk, id
            ))),
            _ => Ok(()),
        }
    }

    async fn delete_rows(&self, filter: &Where, _user_id: Option<i64>) -> AdapterResult<u64> {
        let pool = self.remote.pool().await?;
        let stmt = dml::delete(&self.schema, filter, pool.dialect())?;
        let mut conn = pool.pool().acquire().await?;
        engine::execute(&mut conn, &stmt).await
    }

    async fn count_rows(&self, filter: &Where) -> AdapterResult<i64> {
        reads::count(&self.remote, &self.schema, filter).await
    }

    async fn distinct_values(&self, field: &str, filter: &Where) -> AdapterResult<Vec<Value>> {
        reads::distinct(&self.remote, &self.schema, field, filter).await
    }

    async fn get_rows(&self, filter: &Where, options: &SelectOptions) -> AdapterResult<Vec<Row>> {
        reads::rows(&self.remote, &self.schema, filter, options).await
    }

    async fn get_joined_rows(&self, query: &JoinedQuery) -> AdapterResult<Vec<Row>> {
        reads::joined(&self.remote, &self.schema, query).await
    }

    async fn aggregation_query(
        &self,
        specs: &[AggregationSpec],
        filter: &Where,
        options: &SelectOptions,
    ) -> AdapterResult<AggregationResult> {
        reads::aggregate(&self.remote, &self.schema, specs, filter, options).await
    }
}
