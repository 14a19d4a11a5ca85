//! Aggregation queries.

use std::collections::HashSet;

use crate::ast::{AggregateFunc, AggregationSpec, SelectOptions, Where};
use crate::error::{AdapterError, AdapterResult};
use crate::schema::{FieldType, TableSchema, validate_identifier};

use super::conditions::{compile_order, compile_pagination, compile_where};
use super::dialect::AggregateCarrier;
use super::{Dialect, ParamContext, Statement, quote_identifier};

/// A compiled aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationQuery {
    pub statement: Statement,
    /// One row per group when true, one summary row otherwise.
    pub grouped: bool,
    pub group_fields: Vec<String>,
}

/// SQL call of an aggregate function on `arg`.
pub fn aggregate_call(function: AggregateFunc, arg: &str) -> String {
    match function {
        AggregateFunc::CountUnique => format!("COUNT(DISTINCT {})", arg),
        other => format!("{}({})", other.sql_name(), arg),
    }
}

/// Compile aggregate specs over the rows of `schema` matching `filter`.
///
/// Group fields are collected from the specs, deduplicated, and selected and
/// grouped in declaration order.
pub fn compile_aggregation(
    schema: &TableSchema,
    specs: &[AggregationSpec],
    filter: &Where,
    options: &SelectOptions,
    dialect: Dialect,
) -> AdapterResult<AggregationQuery> {
    if specs.is_empty() {
        return Err(AdapterError::validation("aggregation query needs at least one aggregate"));
    }

    let mut group_fields: Vec<String> = Vec::new();
    for spec in specs {
        if let Some(name) = &spec.group_by {
            let field = schema.field(name)?;
            if !group_fields.contains(&field.name) {
                group_fields.push(field.name.clone());
            }
        }
    }

    let mut ctx = ParamContext::new(dialect);
    let mut columns = Vec::new();
    let mut group_cols = Vec::new();
    for name in &group_fields {
        let field = schema.field(name)?;
        let col = quote_identifier(&field.name)?;
        columns.push(format!("{} AS {}", dialect.project(&col, &field.ty), col));
        group_cols.push(col);
    }

    let mut aliases = HashSet::new();
    for spec in specs {
        validate_identifier(&spec.alias)?;
        if group_fields.contains(&spec.alias) || !aliases.insert(spec.alias.as_str()) {
            return Err(AdapterError::validation(format!(
                "aggregate alias '{}' is used twice",
                spec.alias
            )));
        }
        let mut expr = aggregate_expr(schema, spec)?;
        if let Some(only) = &spec.filter {
            if let Some(cond) = compile_where(only, schema, None, &mut ctx)? {
                // FILTER belongs to the aggregate call, inside any cast.
                expr.call = format!("{} FILTER (WHERE {})", expr.call, cond);
            }
        }
        columns.push(format!("{} AS {}", expr.render(dialect), quote_identifier(&spec.alias)?));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        columns.join(", "),
        dialect.table(&schema.schema, &schema.table)
    );
    if let Some(cond) = compile_where(filter, schema, None, &mut ctx)? {
        sql.push_str(" WHERE ");
        sql.push_str(&cond);
    }
    let grouped = !group_fields.is_empty();
    if grouped {
        sql.push_str(" GROUP BY ");
        sql.push_str(&group_cols.join(", "));
    }
    let extra: Vec<&str> = specs.iter().map(|s| s.alias.as_str()).collect();
    sql.push_str(&compile_order(options, schema, None, &extra)?);
    sql.push_str(&compile_pagination(options, dialect)?);

    Ok(AggregationQuery {
        statement: ctx.finish(sql),
        grouped,
        group_fields,
    })
}

enum Carrier {
    Fixed(AggregateCarrier),
    Field(FieldType),
}

struct AggregateExpr {
    call: String,
    carrier: Carrier,
}

impl AggregateExpr {
    fn render(&self, dialect: Dialect) -> String {
        match &self.carrier {
            Carrier::Fixed(c) => dialect.project_aggregate(&self.call, *c),
            Carrier::Field(ty) => dialect.project(&self.call, ty),
        }
    }
}

fn aggregate_expr(schema: &TableSchema, spec: &AggregationSpec) -> AdapterResult<AggregateExpr> {
    if spec.field == "*" {
        if spec.function != AggregateFunc::Count {
            return Err(AdapterError::validation(format!(
                "'*' is only valid with Count, not {}",
                spec.function
            )));
        }
        return Ok(AggregateExpr {
            call: "COUNT(*)".to_string(),
            carrier: Carrier::Fixed(AggregateCarrier::Integer),
        });
    }
    let field = schema.field(&spec.field)?;
    let col = quote_identifier(&field.name)?;
    let carrier = match spec.function {
        AggregateFunc::Count | AggregateFunc::CountUnique => {
            Carrier::Fixed(AggregateCarrier::Integer)
        }
        AggregateFunc::Avg => Carrier::Fixed(numeric(spec, &field.ty).map(|_| AggregateCarrier::Float)?),
        AggregateFunc::Sum => Carrier::Fixed(numeric(spec, &field.ty)?),
        AggregateFunc::Min | AggregateFunc::Max => Carrier::Field(field.ty.clone()),
    };
    Ok(AggregateExpr {
        call: aggregate_call(spec.function, &col),
        carrier,
    })
}

fn numeric(spec: &AggregationSpec, ty: &FieldType) -> AdapterResult<AggregateCarrier> {
    match ty {
        FieldType::Integer => Ok(AggregateCarrier::Integer),
        FieldType::Float => Ok(AggregateCarrier::Float),
        other => Err(AdapterError::validation(format!(
            "{} needs a numeric field, '{}' is {}",
            spec.function, spec.field, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Value;
    use crate::schema::FieldDescriptor;
    use pretty_assertions::assert_eq;

    fn orders() -> TableSchema {
        TableSchema::new(
            "public",
            "orders",
            vec![
                FieldDescriptor::new("id", FieldType::Integer).pk(),
                FieldDescriptor::new("status", FieldType::String),
                FieldDescriptor::new("region", FieldType::String),
                FieldDescriptor::new("amount", FieldType::Float),
                FieldDescriptor::new("qty", FieldType::Integer),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_summary_row() {
        let specs = vec![
            AggregationSpec::new("n", AggregateFunc::Count, "*"),
            AggregationSpec::new("total", AggregateFunc::Sum, "amount"),
        ];
        let q = compile_aggregation(&orders(), &specs, &Where::new(), &SelectOptions::new(), Dialect::Sqlite)
            .unwrap();
        assert!(!q.grouped);
        assert_eq!(
            q.statement.sql,
            r#"SELECT COUNT(*) AS "n", SUM("amount") AS "total" FROM "orders""#
        );
    }

    #[test]
    fn test_grouped_with_filter_postgres() {
        let specs = vec![
            AggregationSpec::new("n", AggregateFunc::Count, "id").group_by("status"),
            AggregationSpec::new("units", AggregateFunc::Sum, "qty")
                .group_by("region")
                .filter(Where::new().gt("amount", 10)),
            AggregationSpec::new("regions", AggregateFunc::CountUnique, "region").group_by("status"),
        ];
        let q = compile_aggregation(
            &orders(),
            &specs,
            &Where::new().ne("status", "void"),
            &SelectOptions::new().order_by("n").desc(),
            Dialect::Postgres,
        )
        .unwrap();
        assert!(q.grouped);
        assert_eq!(q.group_fields, vec!["status".to_string(), "region".to_string()]);
        assert_eq!(
            q.statement.sql,
            concat!(
                r#"SELECT CAST("status" AS TEXT) AS "status", CAST("region" AS TEXT) AS "region", "#,
                r#"CAST(COUNT("id") AS BIGINT) AS "n", "#,
                r#"CAST(SUM("qty") FILTER (WHERE "amount" > CAST($1 AS DOUBLE PRECISION)) AS BIGINT) AS "units", "#,
                r#"CAST(COUNT(DISTINCT "region") AS BIGINT) AS "regions" "#,
                r#"FROM "public"."orders" WHERE "status" <> CAST($2 AS TEXT) "#,
                r#"GROUP BY "status", "region" ORDER BY "n" DESC"#
            )
        );
        assert_eq!(q.statement.params, vec![Value::Float(10.0), Value::from("void")]);
    }

    #[test]
    fn test_sum_of_text_rejected() {
        let specs = vec![AggregationSpec::new("s", AggregateFunc::Sum, "status")];
        let err = compile_aggregation(&orders(), &specs, &Where::new(), &SelectOptions::new(), Dialect::Sqlite)
            .unwrap_err();
        assert!(err.to_string().contains("needs a numeric field"));
    }

    #[test]
    fn test_star_and_duplicate_aliases_rejected() {
        let specs = vec![AggregationSpec::new("m", AggregateFunc::Max, "*")];
        assert!(
            compile_aggregation(&orders(), &specs, &Where::new(), &SelectOptions::new(), Dialect::Sqlite)
                .is_err()
        );
        let specs = vec![
            AggregationSpec::new("m", AggregateFunc::Max, "qty"),
            AggregationSpec::new("m", AggregateFunc::Min, "qty"),
        ];
        assert!(
            compile_aggregation(&orders(), &specs, &Where::new(), &SelectOptions::new(), Dialect::Sqlite)
                .is_err()
        );
    }

    #[test]
    fn test_order_by_aggregate_expression() {
        let specs = vec![AggregationSpec::new("n", AggregateFunc::Count, "*").group_by("region")];
        let opts = SelectOptions {
            order_by: Some(crate::ast::OrderBy::Aggregate {
                function: AggregateFunc::CountUnique,
                field: "status".to_string(),
            }),
            ..SelectOptions::default()
        };
        let q = compile_aggregation(&orders(), &specs, &Where::new(), &opts, Dialect::Sqlite).unwrap();
        assert!(q.statement.sql.ends_with(r#"GROUP BY "region" ORDER BY COUNT(DISTINCT "status") ASC"#));
    }

    #[test]
    fn test_needs_specs() {
        assert!(compile_aggregation(&orders(), &[], &Where::new(), &SelectOptions::new(), Dialect::Sqlite).is_err());
    }
}
