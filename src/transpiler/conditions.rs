//! Predicate and option compilation.

use crate::ast::{Clause, Cond, OrderBy, SelectOptions, Value, Where};
use crate::error::{AdapterError, AdapterResult};
use crate::schema::TableSchema;

use super::aggregate::aggregate_call;
use super::{ParamContext, Statement, column_ref, quote_identifier};

const ALWAYS_FALSE: &str = "1 = 0";
const ALWAYS_TRUE: &str = "1 = 1";

/// Compile a predicate and select options into a SQL fragment.
///
/// The fragment starts with a space and holds the optional `WHERE`,
/// `ORDER BY`, `LIMIT` and `OFFSET` clauses, in that order.
///
/// ```
/// use extpg::ast::{SelectOptions, Where};
/// use extpg::schema::{FieldDescriptor, FieldType, TableSchema};
/// use extpg::transpiler::{Dialect, compile};
///
/// let schema = TableSchema::new("public", "users", vec![
///     FieldDescriptor::new("name", FieldType::String),
/// ]).unwrap();
/// let stmt = compile(
///     &schema,
///     &Where::new().eq("name", "O'Brien"),
///     &SelectOptions::new().order_by("name").limit(10),
///     Dialect::Sqlite,
/// ).unwrap();
/// assert_eq!(stmt.sql, r#" WHERE "name" = ?1 ORDER BY "name" ASC LIMIT 10"#);
/// assert_eq!(stmt.params.len(), 1);
/// ```
pub fn compile(
    schema: &TableSchema,
    filter: &Where,
    options: &SelectOptions,
    dialect: super::Dialect,
) -> AdapterResult<Statement> {
    let mut ctx = ParamContext::new(dialect);
    let mut sql = String::new();
    if let Some(cond) = compile_where(filter, schema, None, &mut ctx)? {
        sql.push_str(" WHERE ");
        sql.push_str(&cond);
    }
    sql.push_str(&compile_order(options, schema, None, &[])?);
    sql.push_str(&compile_pagination(options, ctx.dialect())?);
    Ok(ctx.finish(sql))
}

/// Compile a predicate into one boolean expression, or `None` when it has
/// no clauses. Columns are qualified with `alias` when given.
pub fn compile_where(
    filter: &Where,
    schema: &TableSchema,
    alias: Option<&str>,
    ctx: &mut ParamContext,
) -> AdapterResult<Option<String>> {
    if filter.is_empty() {
        return Ok(None);
    }
    let parts = filter
        .clauses
        .iter()
        .map(|clause| compile_clause(clause, schema, alias, ctx))
        .collect::<AdapterResult<Vec<_>>>()?;
    Ok(Some(parts.join(" AND ")))
}

fn compile_clause(
    clause: &Clause,
    schema: &TableSchema,
    alias: Option<&str>,
    ctx: &mut ParamContext,
) -> AdapterResult<String> {
    match clause {
        Clause::Field { field, cond } => compile_cond(field, cond, schema, alias, ctx),
        Clause::And(parts) => {
            let mut compiled = Vec::new();
            for part in parts {
                if let Some(sql) = compile_where(part, schema, alias, ctx)? {
                    compiled.push(sql);
                }
            }
            if compiled.is_empty() {
                Ok(ALWAYS_TRUE.to_string())
            } else {
                Ok(format!("({})", compiled.join(" AND ")))
            }
        }
        Clause::Or(parts) => {
            if parts.is_empty() {
                return Ok(ALWAYS_FALSE.to_string());
            }
            let mut compiled = Vec::new();
            for part in parts {
                let sql = compile_where(part, schema, alias, ctx)?;
                compiled.push(sql.unwrap_or_else(|| ALWAYS_TRUE.to_string()));
            }
            Ok(format!("({})", compiled.join(" OR ")))
        }
        Clause::Not(inner) => {
            let sql = compile_where(inner, schema, alias, ctx)?;
            Ok(format!("NOT ({})", sql.unwrap_or_else(|| ALWAYS_TRUE.to_string())))
        }
    }
}

fn compile_cond(
    name: &str,
    cond: &Cond,
    schema: &TableSchema,
    alias: Option<&str>,
    ctx: &mut ParamContext,
) -> AdapterResult<String> {
    let field = schema.field(name)?;
    let col = column_ref(alias, &field.name)?;
    let ty = Some(&field.ty);
    let bind = |ctx: &mut ParamContext, value: &Value| -> AdapterResult<String> {
        let value = value.coerce(&field.name, &field.ty)?;
        Ok(ctx.add(value, ty))
    };

    let sql = match cond {
        Cond::IsNull | Cond::Eq(Value::Null) => format!("{} IS NULL", col),
        Cond::NotNull | Cond::Ne(Value::Null) => format!("{} IS NOT NULL", col),
        Cond::Eq(v) => format!("{} = {}", col, bind(ctx, v)?),
        Cond::Ne(v) => format!("{} <> {}", col, bind(ctx, v)?),
        Cond::Gt { value, inclusive } => {
            let op = if *inclusive { ">=" } else { ">" };
            format!("{} {} {}", col, op, bind(ctx, value)?)
        }
        Cond::Lt { value, inclusive } => {
            let op = if *inclusive { "<=" } else { "<" };
            format!("{} {} {}", col, op, bind(ctx, value)?)
        }
        Cond::In(values) | Cond::NotIn(values) => {
            let negate = matches!(cond, Cond::NotIn(_));
            if values.is_empty() {
                return Ok(if negate { ALWAYS_TRUE } else { ALWAYS_FALSE }.to_string());
            }
            let placeholders = values
                .iter()
                .map(|v| bind(ctx, v))
                .collect::<AdapterResult<Vec<_>>>()?;
            let op = if negate { "NOT IN" } else { "IN" };
            format!("{} {} ({})", col, op, placeholders.join(", "))
        }
        Cond::ILike(pattern) => {
            let dialect = ctx.dialect();
            let ph = ctx.add(Value::String(pattern.clone()), None);
            format!("{} {} {}", dialect.project_text(&col), dialect.like(), ph)
        }
    };
    Ok(sql)
}

/// `ORDER BY` clause. `extra` lists output aliases that may be sorted on
/// besides the table's fields.
pub fn compile_order(
    options: &SelectOptions,
    schema: &TableSchema,
    alias: Option<&str>,
    extra: &[&str],
) -> AdapterResult<String> {
    let dir = if options.order_desc { "DESC" } else { "ASC" };
    match &options.order_by {
        None => Ok(String::new()),
        Some(OrderBy::Field(name)) => {
            if !extra.contains(&name.as_str()) {
                schema.field(name)?;
            }
            Ok(format!(" ORDER BY {} {}", quote_identifier(name)?, dir))
        }
        Some(OrderBy::Aggregate { function, field }) => {
            let arg = if field == "*" {
                "*".to_string()
            } else {
                column_ref(alias, &schema.field(field)?.name)?
            };
            Ok(format!(" ORDER BY {} {}", aggregate_call(*function, &arg), dir))
        }
    }
}

/// `LIMIT` / `OFFSET` clauses. Both must be non-negative.
pub fn compile_pagination(options: &SelectOptions, dialect: super::Dialect) -> AdapterResult<String> {
    for (name, value) in [("limit", options.limit), ("offset", options.offset)] {
        if let Some(n) = value {
            if n < 0 {
                return Err(AdapterError::validation(format!(
                    "{} must be a non-negative integer, got {}",
                    name, n
                )));
            }
        }
    }
    Ok(match (options.limit, options.offset) {
        (None, None) => String::new(),
        (Some(l), None) => format!(" LIMIT {}", l),
        (Some(l), Some(o)) => format!(" LIMIT {} OFFSET {}", l, o),
        (None, Some(o)) => dialect.offset_only(o),
    })
}
