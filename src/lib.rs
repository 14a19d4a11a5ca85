//! # extpg: external PostgreSQL tables, optionally versioned
//!
//! Backs a generic table abstraction (rows, fields, predicates, joins,
//! aggregations) with a remote relational database.
//!
//! - [`registry::ConnectionRegistry`] keeps one pool per connection identity.
//! - [`transpiler`] compiles the query model in [`ast`] into parameterized SQL.
//! - [`plain::PlainTable`] is ordinary CRUD.
//! - [`versioned::VersionedTable`] keeps every change as a new version row.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use extpg::prelude::*;
//!
//! let registry = Arc::new(ConnectionRegistry::new());
//! let config = ConfigFile::load("tables.toml".as_ref())?.table("orders")?;
//! let orders = PlainTable::new(registry, config);
//!
//! let open = extpg::parse_filter("status=open & total>=100")?;
//! let rows = orders.get_rows(&open, &SelectOptions::new().order_by("total").desc()).await?;
//! ```

pub mod ast;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod parser;
pub mod plain;
pub mod registry;
pub mod schema;
pub mod table;
pub mod transpiler;
pub mod versioned;

pub mod prelude {
    pub use crate::ast::*;
    pub use crate::config::{ConfigFile, ConnectionIdentity, TableConfig};
    pub use crate::error::*;
    pub use crate::parser::parse_filter;
    pub use crate::plain::PlainTable;
    pub use crate::registry::ConnectionRegistry;
    pub use crate::schema::{FieldDescriptor, FieldType, TableSchema};
    pub use crate::table::{AggregationResult, Table};
    pub use crate::versioned::VersionedTable;
}

/// Parse a filter expression into a predicate.
///
/// # Example
///
/// ```
/// use extpg::parse_filter;
///
/// let filter = parse_filter("active=true & role=admin|role=owner").unwrap();
/// assert_eq!(filter.clauses.len(), 2);
/// ```
pub fn parse_filter(input: &str) -> error::AdapterResult<ast::Where> {
    parser::parse_filter(input)
}
