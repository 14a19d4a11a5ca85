//! Joined reads: foreign-key summary values and child aggregations.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::ast::{AggregateFunc, ChildAggregation, JoinedQuery, OrderBy, RowLookup};
use crate::error::{AdapterError, AdapterResult};
use crate::schema::{TableSchema, validate_identifier};

use super::aggregate::aggregate_call;
use super::conditions::{compile_order, compile_pagination, compile_where};
use super::dialect::AggregateCarrier;
use super::dml::projections;
use super::{Dialect, ParamContext, Statement, column_ref, quote_identifier};

const MAIN: &str = "a";

/// How one declared join field is filled in.
#[derive(Clone)]
pub struct JoinFieldMeta {
    pub alias: String,
    /// Set when the value comes from a post-fetch lookup instead of SQL.
    pub lookup: Option<Arc<dyn RowLookup>>,
}

impl JoinFieldMeta {
    pub fn needs_lookup(&self) -> bool {
        self.lookup.is_some()
    }
}

impl fmt::Debug for JoinFieldMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinFieldMeta")
            .field("alias", &self.alias)
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

/// Compile a joined read of `schema`.
///
/// Every key field used by a join is left-joined once to its referenced
/// table on that table's `id`. Lookup fields add nothing to the SQL and are
/// reported in the returned metadata, in declaration order.
pub fn compile_joined_query(
    schema: &TableSchema,
    query: &JoinedQuery,
    dialect: Dialect,
) -> AdapterResult<(Statement, Vec<JoinFieldMeta>)> {
    if let Some(OrderBy::Aggregate { .. }) = query.options.order_by {
        return Err(AdapterError::validation(
            "ordering by an aggregate needs an aggregation query",
        ));
    }
    let mut aliases = HashSet::new();
    let mut claim = |alias: &str| -> AdapterResult<()> {
        validate_identifier(alias)?;
        if schema.has_field(alias) || !aliases.insert(alias.to_string()) {
            return Err(AdapterError::validation(format!(
                "output alias '{}' clashes with another column",
                alias
            )));
        }
        Ok(())
    };

    let mut columns = projections(schema, Some(MAIN), dialect)?;
    let mut joined: BTreeMap<&str, String> = BTreeMap::new();
    let mut joins_sql = String::new();
    let mut meta = Vec::with_capacity(query.joins.len());

    for join in &query.joins {
        claim(&join.alias)?;
        let key = schema.field(&join.ref_field)?;
        if let Some(lookup) = &join.lookup {
            meta.push(JoinFieldMeta {
                alias: join.alias.clone(),
                lookup: Some(Arc::clone(lookup)),
            });
            continue;
        }
        let reftable = key.reftable_name().ok_or_else(|| {
            AdapterError::validation(format!(
                "join '{}' uses '{}', which is not a key field",
                join.alias, key.name
            ))
        })?;
        let target = join
            .target
            .as_deref()
            .or_else(|| key.summary_field())
            .ok_or_else(|| {
                AdapterError::validation(format!(
                    "join '{}' has no target and '{}' has no summary field",
                    join.alias, key.name
                ))
            })?;

        let next = format!("j{}", joined.len());
        let join_alias = match joined.get(key.name.as_str()) {
            Some(existing) => existing.clone(),
            None => {
                validate_identifier(reftable)?;
                joins_sql.push_str(&format!(
                    " LEFT JOIN {} {} ON {} = {}",
                    dialect.table(&schema.schema, reftable),
                    quote_identifier(&next)?,
                    column_ref(Some(&next), "id")?,
                    column_ref(Some(MAIN), &key.name)?
                ));
                joined.insert(key.name.as_str(), next.clone());
                next
            }
        };
        columns.push(format!(
            "{} AS {}",
            dialect.project_text(&column_ref(Some(&join_alias), target)?),
            quote_identifier(&join.alias)?
        ));
        meta.push(JoinFieldMeta {
            alias: join.alias.clone(),
            lookup: None,
        });
    }

    for (i, agg) in query.aggregations.iter().enumerate() {
        claim(&agg.alias)?;
        columns.push(child_aggregate(schema, agg, &format!("c{}", i), dialect)?);
    }

    let mut ctx = ParamContext::new(dialect);
    let mut sql = format!(
        "SELECT {}{} FROM {} {}{}",
        if query.options.distinct { "DISTINCT " } else { "" },
        columns.join(", "),
        dialect.table(&schema.schema, &schema.table),
        quote_identifier(MAIN)?,
        joins_sql
    );
    if let Some(cond) = compile_where(&query.filter, schema, Some(MAIN), &mut ctx)? {
        sql.push_str(" WHERE ");
        sql.push_str(&cond);
    }
    let extra: Vec<&str> = query
        .joins
        .iter()
        .filter(|j| j.lookup.is_none())
        .map(|j| j.alias.as_str())
        .chain(query.aggregations.iter().map(|a| a.alias.as_str()))
        .collect();
    sql.push_str(&compile_order(&query.options, schema, Some(MAIN), &extra)?);
    sql.push_str(&compile_pagination(&query.options, dialect)?);
    Ok((ctx.finish(sql), meta))
}

/// Correlated sub-select over a child table whose `ref_field` points at
/// this row's primary key.
fn child_aggregate(
    schema: &TableSchema,
    agg: &ChildAggregation,
    alias: &str,
    dialect: Dialect,
) -> AdapterResult<String> {
    validate_identifier(&agg.table)?;
    let arg = if agg.field == "*" {
        if agg.function != AggregateFunc::Count {
            return Err(AdapterError::validation(format!(
                "'*' is only valid with Count, not {}",
                agg.function
            )));
        }
        "*".to_string()
    } else {
        column_ref(Some(alias), &agg.field)?
    };
    let key = schema.key_field().ok_or_else(|| {
        AdapterError::validation(format!(
            "child aggregate '{}' needs a key field on '{}'",
            agg.alias, schema.table
        ))
    })?;
    let carrier = match agg.function {
        AggregateFunc::Count | AggregateFunc::CountUnique => AggregateCarrier::Integer,
        AggregateFunc::Sum | AggregateFunc::Avg => AggregateCarrier::Float,
        AggregateFunc::Min | AggregateFunc::Max => AggregateCarrier::Text,
    };
    Ok(format!(
        "(SELECT {} FROM {} {} WHERE {} = {}) AS {}",
        dialect.project_aggregate(&aggregate_call(agg.function, &arg), carrier),
        dialect.table(&schema.schema, &agg.table),
        quote_identifier(alias)?,
        column_ref(Some(alias), &agg.ref_field)?,
        column_ref(Some(MAIN), &key.name)?,
        quote_identifier(&agg.alias)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{JoinField, Row, SelectOptions, Value, Where};
    use crate::schema::{FieldDescriptor, FieldType};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Upper;

    #[async_trait]
    impl RowLookup for Upper {
        async fn lookup(&self, row: &Row) -> AdapterResult<Value> {
            Ok(row.get("title").cloned().unwrap_or(Value::Null))
        }
    }

    fn posts() -> TableSchema {
        TableSchema::new(
            "public",
            "posts",
            vec![
                FieldDescriptor::new("id", FieldType::Integer).pk(),
                FieldDescriptor::new("title", FieldType::String),
                FieldDescriptor::new(
                    "author",
                    FieldType::Key {
                        reftable: "users".to_string(),
                        summary_field: Some("name".to_string()),
                    },
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_join_and_lookup_sqlite() {
        let query = JoinedQuery::new()
            .join(JoinField::new("author_name", "author"))
            .join(JoinField::new("author_email", "author").target("email"))
            .join(JoinField::new("shout", "author").lookup(Arc::new(Upper)))
            .filter(Where::new().eq("title", "hello"))
            .options(SelectOptions::new().order_by("author_name"));
        let (stmt, meta) = compile_joined_query(&posts(), &query, Dialect::Sqlite).unwrap();
        assert_eq!(
            stmt.sql,
            concat!(
                r#"SELECT "a"."id" AS "id", "a"."title" AS "title", "a"."author" AS "author", "#,
                r#""j0"."name" AS "author_name", "j0"."email" AS "author_email" "#,
                r#"FROM "posts" "a" LEFT JOIN "users" "j0" ON "j0"."id" = "a"."author" "#,
                r#"WHERE "a"."title" = ?1 ORDER BY "author_name" ASC"#
            )
        );
        let flags: Vec<(&str, bool)> = meta.iter().map(|m| (m.alias.as_str(), m.needs_lookup())).collect();
        assert_eq!(
            flags,
            vec![("author_name", false), ("author_email", false), ("shout", true)]
        );
    }

    #[test]
    fn test_child_aggregation_postgres() {
        let query = JoinedQuery::new().aggregate(ChildAggregation {
            alias: "comments".to_string(),
            table: "comments".to_string(),
            ref_field: "post".to_string(),
            field: "*".to_string(),
            function: AggregateFunc::Count,
        });
        let (stmt, meta) = compile_joined_query(&posts(), &query, Dialect::Postgres).unwrap();
        assert!(meta.is_empty());
        assert!(stmt.sql.contains(
            r#"(SELECT CAST(COUNT(*) AS BIGINT) FROM "public"."comments" "c0" WHERE "c0"."post" = "a"."id") AS "comments""#
        ));
        assert!(stmt.sql.ends_with(r#"FROM "public"."posts" "a""#));
    }

    #[test]
    fn test_alias_clash_rejected() {
        let query = JoinedQuery::new().join(JoinField::new("title", "author"));
        assert!(compile_joined_query(&posts(), &query, Dialect::Sqlite).is_err());

        let query = JoinedQuery::new()
            .join(JoinField::new("x", "author"))
            .join(JoinField::new("x", "author").target("email"));
        assert!(compile_joined_query(&posts(), &query, Dialect::Sqlite).is_err());
    }

    #[test]
    fn test_join_on_non_key_rejected() {
        let query = JoinedQuery::new().join(JoinField::new("t", "title"));
        let err = compile_joined_query(&posts(), &query, Dialect::Sqlite).unwrap_err();
        assert!(err.to_string().contains("not a key field"));
    }

    #[test]
    fn test_star_only_for_count() {
        let query = JoinedQuery::new().aggregate(ChildAggregation {
            alias: "total".to_string(),
            table: "comments".to_string(),
            ref_field: "post".to_string(),
            field: "*".to_string(),
            function: AggregateFunc::Sum,
        });
        assert!(compile_joined_query(&posts(), &query, Dialect::Sqlite).is_err());
    }
}
