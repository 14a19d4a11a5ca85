//! Remote schema discovery, used to bootstrap table configuration.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::ast::{Row, Value};
use crate::engine;
use crate::error::{AdapterError, AdapterResult};
use crate::registry::RemotePool;
use crate::schema::{FieldDescriptor, FieldType, TableSchema};
use crate::transpiler::{Dialect, Statement};

/// A table the remote side offers.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTable {
    pub table_name: String,
    /// Column names, when requested.
    pub columns: Vec<String>,
}

/// Field list of one remote table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

#[async_trait]
pub trait Discovery: Send + Sync {
    async fn list_discoverable_tables(
        &self,
        schema: &str,
        include_columns: bool,
    ) -> AdapterResult<Vec<DiscoveredTable>>;

    async fn discover_table_definitions(
        &self,
        tables: &[String],
        schema: &str,
    ) -> AdapterResult<Vec<TableDefinition>>;
}

/// Discovery through PostgreSQL's `information_schema`.
#[derive(Debug, Clone)]
pub struct InformationSchemaDiscovery {
    pool: Arc<RemotePool>,
}

const TABLES_SQL: &str = "SELECT CAST(table_name AS TEXT) AS \"table_name\" \
     FROM information_schema.tables \
     WHERE table_schema = CAST($1 AS TEXT) AND table_type = 'BASE TABLE' \
     ORDER BY table_name";

const COLUMNS_SQL: &str = "SELECT CAST(table_name AS TEXT) AS \"table_name\", \
     CAST(column_name AS TEXT) AS \"column_name\", \
     CAST(data_type AS TEXT) AS \"data_type\" \
     FROM information_schema.columns \
     WHERE table_schema = CAST($1 AS TEXT) \
     ORDER BY table_name, ordinal_position";

const CONSTRAINTS_SQL: &str = "SELECT CAST(kcu.table_name AS TEXT) AS \"table_name\", \
     CAST(kcu.column_name AS TEXT) AS \"column_name\", \
     CAST(tc.constraint_type AS TEXT) AS \"constraint_type\", \
     CAST(ccu.table_name AS TEXT) AS \"reftable\" \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
     LEFT JOIN information_schema.constraint_column_usage ccu \
       ON tc.constraint_type = 'FOREIGN KEY' \
      AND tc.constraint_name = ccu.constraint_name AND tc.table_schema = ccu.table_schema \
     WHERE tc.table_schema = CAST($1 AS TEXT) \
       AND tc.constraint_type IN ('PRIMARY KEY', 'FOREIGN KEY')";

impl InformationSchemaDiscovery {
    pub fn new(pool: Arc<RemotePool>) -> AdapterResult<Self> {
        if pool.dialect() != Dialect::Postgres {
            return Err(AdapterError::config(
                "schema discovery needs a PostgreSQL connection",
            ));
        }
        Ok(Self { pool })
    }

    async fn query(&self, sql: &str, schema: &str) -> AdapterResult<Vec<Row>> {
        let mut stmt = Statement::new(sql);
        stmt.params.push(Value::from(schema));
        let mut conn = self.pool.pool().acquire().await?;
        engine::fetch_rows(&mut conn, &stmt, &result_columns()?).await
    }
}

/// Shape of the information_schema rows above, for decoding.
fn result_columns() -> AdapterResult<TableSchema> {
    let text = |name: &str| FieldDescriptor::new(name, FieldType::String);
    TableSchema::new(
        "information_schema",
        "columns",
        vec![
            text("table_name"),
            text("column_name"),
            text("data_type"),
            text("constraint_type"),
            text("reftable"),
        ],
    )
}

fn text_of<'a>(row: &'a Row, key: &str) -> &'a str {
    row.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Map a PostgreSQL `data_type` to a field type.
pub fn field_type_for(data_type: &str) -> FieldType {
    match data_type.to_ascii_lowercase().as_str() {
        "smallint" | "integer" | "bigint" => FieldType::Integer,
        "real" | "double precision" | "numeric" | "decimal" | "money" => FieldType::Float,
        "boolean" => FieldType::Bool,
        "json" | "jsonb" => FieldType::Json,
        t if t == "date" || t.starts_with("timestamp") || t.starts_with("time ") => FieldType::Date,
        _ => FieldType::String,
    }
}

#[async_trait]
impl Discovery for InformationSchemaDiscovery {
    async fn list_discoverable_tables(
        &self,
        schema: &str,
        include_columns: bool,
    ) -> AdapterResult<Vec<DiscoveredTable>> {
        let mut tables: Vec<DiscoveredTable> = self
            .query(TABLES_SQL, schema)
            .await?
            .iter()
            .map(|r| DiscoveredTable {
                table_name: text_of(r, "table_name").to_string(),
                columns: Vec::new(),
            })
            .collect();
        if include_columns {
            let mut columns: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for row in self.query(COLUMNS_SQL, schema).await? {
                columns
                    .entry(text_of(&row, "table_name").to_string())
                    .or_default()
                    .push(text_of(&row, "column_name").to_string());
            }
            for table in &mut tables {
                table.columns = columns.remove(&table.table_name).unwrap_or_default();
            }
        }
        Ok(tables)
    }

    async fn discover_table_definitions(
        &self,
        tables: &[String],
        schema: &str,
    ) -> AdapterResult<Vec<TableDefinition>> {
        let wanted = |name: &str| tables.is_empty() || tables.iter().any(|t| t == name);

        let mut keys: BTreeMap<(String, String), (bool, Option<String>)> = BTreeMap::new();
        for row in self.query(CONSTRAINTS_SQL, schema).await? {
            let entry = keys
                .entry((
                    text_of(&row, "table_name").to_string(),
                    text_of(&row, "column_name").to_string(),
                ))
                .or_default();
            match text_of(&row, "constraint_type") {
                "PRIMARY KEY" => entry.0 = true,
                _ => entry.1 = row.get("reftable").and_then(Value::as_str).map(str::to_string),
            }
        }

        let mut defs: Vec<TableDefinition> = Vec::new();
        for row in self.query(COLUMNS_SQL, schema).await? {
            let table = text_of(&row, "table_name");
            if !wanted(table) {
                continue;
            }
            let column = text_of(&row, "column_name");
            let (pk, reftable) = keys
                .get(&(table.to_string(), column.to_string()))
                .cloned()
                .unwrap_or_default();
            let ty = match reftable {
                Some(reftable) => FieldType::Key { reftable, summary_field: None },
                None => field_type_for(text_of(&row, "data_type")),
            };
            let mut field = FieldDescriptor::new(column, ty);
            field.primary_key = pk;
            match defs.last_mut() {
                Some(def) if def.name == table => def.fields.push(field),
                _ => defs.push(TableDefinition {
                    name: table.to_string(),
                    fields: vec![field],
                }),
            }
        }

        if let Some(missing) = tables
            .iter()
            .find(|t| !defs.iter().any(|d| &d.name == *t))
        {
            return Err(AdapterError::NotFound(format!(
                "table '{}' in schema '{}'",
                missing, schema
            )));
        }
        Ok(defs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_field_type_mapping() {
        assert_eq!(field_type_for("integer"), FieldType::Integer);
        assert_eq!(field_type_for("double precision"), FieldType::Float);
        assert_eq!(field_type_for("timestamp with time zone"), FieldType::Date);
        assert_eq!(field_type_for("jsonb"), FieldType::Json);
        assert_eq!(field_type_for("boolean"), FieldType::Bool);
        assert_eq!(field_type_for("character varying"), FieldType::String);
        assert_eq!(field_type_for("uuid"), FieldType::String);
    }

    #[tokio::test]
    async fn test_discovery_requires_postgres() {
        let registry = crate::registry::ConnectionRegistry::new();
        let pool = registry
            .acquire(&crate::config::ConnectionIdentity::url("sqlite::memory:"))
            .await
            .unwrap();
        assert!(InformationSchemaDiscovery::new(pool).is_err());
    }

    #[test]
    fn test_result_columns_cover_queries() {
        let schema = result_columns().unwrap();
        for name in ["table_name", "column_name", "data_type", "constraint_type", "reftable"] {
            assert!(schema.has_field(name));
        }
    }
}
