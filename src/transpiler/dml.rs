//! Row-level statements: select, count, distinct, insert, update, delete.

use crate::ast::{OrderBy, Row, SelectOptions, Where};
use crate::error::{AdapterError, AdapterResult};
use crate::schema::TableSchema;

use super::conditions::{compile_order, compile_pagination, compile_where};
use super::dialect::AggregateCarrier;
use super::{Dialect, ParamContext, Statement, column_ref, quote_identifier};

/// Output column list for every field of `schema`, each aliased to its name.
pub fn projections(
    schema: &TableSchema,
    alias: Option<&str>,
    dialect: Dialect,
) -> AdapterResult<Vec<String>> {
    schema
        .fields()
        .iter()
        .map(|f| {
            let col = column_ref(alias, &f.name)?;
            Ok(format!(
                "{} AS {}",
                dialect.project(&col, &f.ty),
                quote_identifier(&f.name)?
            ))
        })
        .collect()
}

fn table_ref(schema: &TableSchema, dialect: Dialect) -> String {
    dialect.table(&schema.schema, &schema.table)
}

fn push_where(
    sql: &mut String,
    filter: &Where,
    schema: &TableSchema,
    ctx: &mut ParamContext,
) -> AdapterResult<()> {
    if let Some(cond) = compile_where(filter, schema, None, ctx)? {
        sql.push_str(" WHERE ");
        sql.push_str(&cond);
    }
    Ok(())
}

/// `SELECT` of every field.
pub fn select(
    schema: &TableSchema,
    filter: &Where,
    options: &SelectOptions,
    dialect: Dialect,
) -> AdapterResult<Statement> {
    if let Some(OrderBy::Aggregate { .. }) = options.order_by {
        return Err(AdapterError::validation(
            "ordering by an aggregate needs an aggregation query",
        ));
    }
    let mut ctx = ParamContext::new(dialect);
    let mut sql = format!(
        "SELECT {}{} FROM {}",
        if options.distinct { "DISTINCT " } else { "" },
        projections(schema, None, dialect)?.join(", "),
        table_ref(schema, dialect)
    );
    push_where(&mut sql, filter, schema, &mut ctx)?;
    sql.push_str(&compile_order(options, schema, None, &[])?);
    sql.push_str(&compile_pagination(options, dialect)?);
    Ok(ctx.finish(sql))
}

/// Distinct values of one field, ordered by the value.
pub fn select_distinct(
    schema: &TableSchema,
    field: &str,
    filter: &Where,
    dialect: Dialect,
) -> AdapterResult<Statement> {
    let desc = schema.field(field)?;
    let col = quote_identifier(&desc.name)?;
    let mut ctx = ParamContext::new(dialect);
    let mut sql = format!(
        "SELECT DISTINCT {} AS {} FROM {}",
        dialect.project(&col, &desc.ty),
        col,
        table_ref(schema, dialect)
    );
    push_where(&mut sql, filter, schema, &mut ctx)?;
    sql.push_str(&format!(" ORDER BY {} ASC", col));
    Ok(ctx.finish(sql))
}

/// `SELECT COUNT(*) AS "count"`.
pub fn count(schema: &TableSchema, filter: &Where, dialect: Dialect) -> AdapterResult<Statement> {
    let mut ctx = ParamContext::new(dialect);
    let mut sql = format!(
        "SELECT {} AS \"count\" FROM {}",
        dialect.project_aggregate("COUNT(*)", AggregateCarrier::Integer),
        table_ref(schema, dialect)
    );
    push_where(&mut sql, filter, schema, &mut ctx)?;
    Ok(ctx.finish(sql))
}

/// `MAX` of an integer column, as `"max"`. NULL on an empty table.
pub fn select_max(
    schema: &TableSchema,
    field: &str,
    dialect: Dialect,
) -> AdapterResult<Statement> {
    let col = quote_identifier(&schema.field(field)?.name)?;
    Ok(Statement::new(format!(
        "SELECT {} AS \"max\" FROM {}",
        dialect.project_aggregate(&format!("MAX({})", col), AggregateCarrier::Integer),
        table_ref(schema, dialect)
    )))
}

/// Column list and placeholders for a record, in key order.
fn record_values(
    schema: &TableSchema,
    record: &Row,
    ctx: &mut ParamContext,
) -> AdapterResult<Vec<(String, String)>> {
    record
        .iter()
        .map(|(name, value)| {
            let field = schema.field(name)?;
            let value = value.coerce(&field.name, &field.ty)?;
            Ok((quote_identifier(&field.name)?, ctx.add(value, Some(&field.ty))))
        })
        .collect()
}

/// `INSERT ... RETURNING` the key field as `"pk"`, when the table has one.
///
/// ```
/// use extpg::ast::{Row, Value};
/// use extpg::schema::{FieldDescriptor, FieldType, TableSchema};
/// use extpg::transpiler::{Dialect, dml};
///
/// let schema = TableSchema::new("public", "notes", vec![
///     FieldDescriptor::new("id", FieldType::Integer).pk(),
///     FieldDescriptor::new("body", FieldType::String),
/// ]).unwrap();
/// let mut record = Row::new();
/// record.insert("body".into(), Value::from("hi"));
/// let stmt = dml::insert(&schema, &record, Dialect::Postgres).unwrap();
/// assert_eq!(
///     stmt.sql,
///     r#"INSERT INTO "public"."notes" ("body") VALUES (CAST($1 AS TEXT)) RETURNING CAST("id" AS BIGINT) AS "pk""#
/// );
/// ```
pub fn insert(schema: &TableSchema, record: &Row, dialect: Dialect) -> AdapterResult<Statement> {
    let mut ctx = ParamContext::new(dialect);
    let values = record_values(schema, record, &mut ctx)?;
    let mut sql = if values.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table_ref(schema, dialect))
    } else {
        let (cols, placeholders): (Vec<_>, Vec<_>) = values.into_iter().unzip();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table_ref(schema, dialect),
            cols.join(", "),
            placeholders.join(", ")
        )
    };
    // Keyless tables return nothing.
    if let Some(key) = schema.key_field() {
        let pk = quote_identifier(&key.name)?;
        sql.push_str(&format!(" RETURNING {} AS \"pk\"", dialect.project(&pk, &key.ty)));
    }
    Ok(ctx.finish(sql))
}

/// `UPDATE ... SET` the record's fields on rows matching `filter`.
pub fn update(
    schema: &TableSchema,
    record: &Row,
    filter: &Where,
    dialect: Dialect,
) -> AdapterResult<Statement> {
    if record.is_empty() {
        return Err(AdapterError::validation("update record has no fields"));
    }
    let mut ctx = ParamContext::new(dialect);
    let sets = record_values(schema, record, &mut ctx)?
        .into_iter()
        .map(|(col, ph)| format!("{} = {}", col, ph))
        .collect::<Vec<_>>();
    let mut sql = format!("UPDATE {} SET {}", table_ref(schema, dialect), sets.join(", "));
    push_where(&mut sql, filter, schema, &mut ctx)?;
    Ok(ctx.finish(sql))
}

pub fn delete(schema: &TableSchema, filter: &Where, dialect: Dialect) -> AdapterResult<Statement> {
    let mut ctx = ParamContext::new(dialect);
    let mut sql = format!("DELETE FROM {}", table_ref(schema, dialect));
    push_where(&mut sql, filter, schema, &mut ctx)?;
    Ok(ctx.finish(sql))
}
