//! SQL transpiler for the table query model.
//!
//! Every compiler here produces a [`Statement`]: SQL text with numbered
//! placeholders plus the values to bind, in placeholder order. Values are
//! never written into the SQL text.

pub mod aggregate;
pub mod conditions;
pub mod dialect;
pub mod dml;
pub mod join;

pub use aggregate::{AggregationQuery, compile_aggregation};
pub use conditions::compile;
pub use dialect::Dialect;
pub use join::{JoinFieldMeta, compile_joined_query};

use crate::ast::Value;
use crate::error::AdapterResult;
use crate::schema::{FieldType, validate_identifier};

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Collects bound values while a statement is being built.
#[derive(Debug)]
pub struct ParamContext {
    dialect: Dialect,
    params: Vec<Value>,
}

impl ParamContext {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Add a value and return the placeholder for it.
    pub fn add(&mut self, value: Value, ty: Option<&FieldType>) -> String {
        self.params.push(value);
        self.dialect.bind(self.params.len(), ty)
    }

    pub fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            params: self.params,
        }
    }
}

/// Validate and double-quote an identifier.
pub fn quote_identifier(name: &str) -> AdapterResult<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name))
}

/// A column reference, optionally qualified by a table alias.
pub fn column_ref(alias: Option<&str>, column: &str) -> AdapterResult<String> {
    let col = quote_identifier(column)?;
    Ok(match alias {
        Some(a) => format!("{}.{}", quote_identifier(a)?, col),
        None => col,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("order").unwrap(), "\"order\"");
        assert!(quote_identifier("x\"; DROP TABLE t; --").is_err());
    }

    #[test]
    fn test_column_ref() {
        assert_eq!(column_ref(Some("a"), "id").unwrap(), "\"a\".\"id\"");
        assert_eq!(column_ref(None, "id").unwrap(), "\"id\"");
    }

    #[test]
    fn test_param_context_numbers_placeholders() {
        let mut ctx = ParamContext::new(Dialect::Sqlite);
        assert_eq!(ctx.add(Value::Int(1), None), "?1");
        assert_eq!(ctx.add(Value::Int(2), None), "?2");
        let stmt = ctx.finish("SELECT ?1, ?2".to_string());
        assert_eq!(stmt.params, vec![Value::Int(1), Value::Int(2)]);
    }
}
