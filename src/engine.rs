//! Statement execution against a remote pool.
//!
//! Statements come out of the transpiler fully parameterized. This module
//! binds their values, runs them on a connection (pooled or inside a
//! transaction) and maps result rows back to [`Row`]s.

use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyConnection, Column, Row as _, TypeInfo, ValueRef};
use tracing::debug;

use crate::ast::{Row, Value};
use crate::error::AdapterResult;
use crate::schema::TableSchema;
use crate::transpiler::{JoinFieldMeta, Statement};

fn bind_params<'q>(
    mut query: Query<'q, Any, AnyArguments<'q>>,
    params: &[Value],
) -> Query<'q, Any, AnyArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(v) => query.bind(*v),
            Value::Int(v) => query.bind(*v),
            Value::Float(v) => query.bind(*v),
            Value::String(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Run a query and map every result row.
///
/// Columns named after a field of `schema` are coerced to that field's type,
/// so that e.g. SQLite's integer booleans come back as booleans.
pub async fn fetch_rows(
    conn: &mut AnyConnection,
    stmt: &Statement,
    schema: &TableSchema,
) -> AdapterResult<Vec<Row>> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "fetching rows");
    let rows: Vec<AnyRow> = bind_params(sqlx::query(&stmt.sql), &stmt.params)
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(|row| row_to_map(row, schema)).collect()
}

/// Run a query expected to yield at most one row.
pub async fn fetch_optional(
    conn: &mut AnyConnection,
    stmt: &Statement,
    schema: &TableSchema,
) -> AdapterResult<Option<Row>> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "fetching row");
    let row: Option<AnyRow> = bind_params(sqlx::query(&stmt.sql), &stmt.params)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| row_to_map(&r, schema)).transpose()
}

/// Run a mutation and return the number of affected rows.
pub async fn execute(conn: &mut AnyConnection, stmt: &Statement) -> AdapterResult<u64> {
    debug!(sql = %stmt.sql, params = stmt.params.len(), "executing statement");
    let result = bind_params(sqlx::query(&stmt.sql), &stmt.params)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Convert an AnyRow to a [`Row`].
fn row_to_map(row: &AnyRow, schema: &TableSchema) -> AdapterResult<Row> {
    let mut map = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let value = decode_value(row, i)?;
        let value = match schema.fields().iter().find(|f| f.name == name) {
            Some(field) => value.coerce(&field.name, &field.ty).unwrap_or(value),
            None => value,
        };
        map.insert(name, value);
    }
    Ok(map)
}

fn decode_value(row: &AnyRow, index: usize) -> AdapterResult<Value> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" | "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(index)?),
        "SMALLINT" => Value::Int(row.try_get::<i16, _>(index)? as i64),
        "INTEGER" => Value::Int(row.try_get::<i32, _>(index)? as i64),
        "BIGINT" => Value::Int(row.try_get::<i64, _>(index)?),
        "REAL" => Value::Float(row.try_get::<f32, _>(index)? as f64),
        "DOUBLE" => Value::Float(row.try_get::<f64, _>(index)?),
        "BLOB" => Value::String(String::from_utf8_lossy(&row.try_get::<Vec<u8>, _>(index)?).into_owned()),
        _ => Value::String(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}

/// Fill in lookup-backed join fields.
///
/// Lookups run once per row, in declaration order, and each one sees the
/// values filled in by the lookups before it.
pub async fn apply_lookups(rows: &mut [Row], meta: &[JoinFieldMeta]) -> AdapterResult<()> {
    let lookups: Vec<_> = meta
        .iter()
        .filter_map(|m| m.lookup.as_ref().map(|l| (m.alias.as_str(), l)))
        .collect();
    if lookups.is_empty() {
        return Ok(());
    }
    for row in rows.iter_mut() {
        for (alias, lookup) in &lookups {
            let value = lookup.lookup(row).await?;
            row.insert(alias.to_string(), value);
        }
    }
    Ok(())
}
