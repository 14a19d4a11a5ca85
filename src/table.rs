//! The generic table contract both adapters implement.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ast::{AggregationSpec, JoinedQuery, Row, SelectOptions, Value, Where};
use crate::config::ConnectionIdentity;
use crate::error::AdapterResult;
use crate::registry::{ConnectionRegistry, RemotePool};
use crate::schema::TableSchema;

/// Result of [`Table::aggregation_query`].
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationResult {
    /// One row per group, group fields first.
    Grouped(Vec<Row>),
    Summary(Row),
}

impl AggregationResult {
    pub fn rows(&self) -> Vec<Row> {
        match self {
            AggregationResult::Grouped(rows) => rows.clone(),
            AggregationResult::Summary(row) => vec![row.clone()],
        }
    }
}

/// Row operations on one remote table.
///
/// `user_id` identifies the acting user where the backend records it; the
/// plain adapter ignores it.
#[async_trait]
pub trait Table: Send + Sync {
    /// Fields callers can read and write, in declaration order.
    fn schema(&self) -> &TableSchema;

    /// Insert a record and return the new row's identifier.
    async fn insert_row(&self, record: &Row, user_id: Option<i64>) -> AdapterResult<Value>;

    /// Apply a partial record to the row identified by `id`.
    async fn update_row(&self, record: &Row, id: &Value, user_id: Option<i64>) -> AdapterResult<()>;

    /// Delete every matching row and return how many there were.
    async fn delete_rows(&self, filter: &Where, user_id: Option<i64>) -> AdapterResult<u64>;

    async fn count_rows(&self, filter: &Where) -> AdapterResult<i64>;

    /// Distinct values of `field` across matching rows, ordered by value.
    async fn distinct_values(&self, field: &str, filter: &Where) -> AdapterResult<Vec<Value>>;

    async fn get_rows(&self, filter: &Where, options: &SelectOptions) -> AdapterResult<Vec<Row>>;

    /// Rows with join fields and child aggregations filled in.
    async fn get_joined_rows(&self, query: &JoinedQuery) -> AdapterResult<Vec<Row>>;

    async fn aggregation_query(
        &self,
        specs: &[AggregationSpec],
        filter: &Where,
        options: &SelectOptions,
    ) -> AdapterResult<AggregationResult>;
}

/// Where an adapter's table lives. The pool is looked up on every operation.
#[derive(Debug, Clone)]
pub(crate) struct Remote {
    registry: Arc<ConnectionRegistry>,
    identity: ConnectionIdentity,
}

impl Remote {
    pub(crate) fn new(registry: Arc<ConnectionRegistry>, identity: ConnectionIdentity) -> Self {
        Self { registry, identity }
    }

    pub(crate) async fn pool(&self) -> AdapterResult<Arc<RemotePool>> {
        self.registry.acquire(&self.identity).await
    }
}
