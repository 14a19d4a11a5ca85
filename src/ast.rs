//! Query model for table operations.
//!
//! These types describe *what* a caller wants from a table: filters,
//! ordering, pagination, joins and aggregations. The transpiler turns them
//! into SQL for a given dialect.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, AdapterResult};
use crate::schema::FieldType;

/// A scalar value flowing in or out of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// One row (or record) keyed by field name.
pub type Row = BTreeMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(n) => Some(*n != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a scalar JSON value. Arrays and objects are rejected.
    pub fn from_json(json: &serde_json::Value) -> AdapterResult<Self> {
        match json {
            serde_json::Value::Null => Ok(Value::Null),
            serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::Int(i)),
                None => n
                    .as_f64()
                    .map(Value::Float)
                    .ok_or_else(|| AdapterError::validation(format!("unsupported number {}", n))),
            },
            serde_json::Value::String(s) => Ok(Value::String(s.clone())),
            other => Err(AdapterError::validation(format!(
                "expected a scalar value, got {}",
                other
            ))),
        }
    }

    /// Convert a record value. Arrays and objects become their JSON text,
    /// which is what `Json` fields store.
    pub fn from_json_record(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Value::String(json.to_string())
            }
            scalar => Value::from_json(scalar).unwrap_or(Value::Null),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Coerce the value to the declared type of a field.
    ///
    /// Form-style strings are accepted for numbers and booleans. Dates must
    /// be RFC 3339, `YYYY-MM-DD HH:MM:SS` (optionally with fractional seconds
    /// and an offset, as PostgreSQL prints them) or `YYYY-MM-DD`.
    pub fn coerce(&self, field: &str, ty: &FieldType) -> AdapterResult<Value> {
        let mismatch = || {
            AdapterError::validation(format!(
                "value {} is not valid for field '{}' of type {}",
                self, field, ty
            ))
        };
        if self.is_null() {
            return Ok(Value::Null);
        }
        match ty {
            FieldType::Integer | FieldType::Key { .. } => {
                self.as_i64().map(Value::Int).ok_or_else(mismatch)
            }
            FieldType::Float => match self {
                Value::Int(n) => Ok(Value::Float(*n as f64)),
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::String(s) => s.trim().parse().map(Value::Float).map_err(|_| mismatch()),
                _ => Err(mismatch()),
            },
            FieldType::Bool => match self {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Int(0) => Ok(Value::Bool(false)),
                Value::Int(1) => Ok(Value::Bool(true)),
                Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "on" | "yes" | "1" => Ok(Value::Bool(true)),
                    "false" | "off" | "no" | "0" => Ok(Value::Bool(false)),
                    _ => Err(mismatch()),
                },
                _ => Err(mismatch()),
            },
            FieldType::Date => match self {
                Value::String(s) if is_date_literal(s) => Ok(self.clone()),
                _ => Err(mismatch()),
            },
            FieldType::String | FieldType::File | FieldType::Json => match self {
                Value::String(_) => Ok(self.clone()),
                other => Ok(Value::String(other.to_string())),
            },
        }
    }
}

fn is_date_literal(s: &str) -> bool {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};

    DateTime::parse_from_rfc3339(s).is_ok()
        || DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%#z").is_ok()
        || DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Build a [`Row`] from a JSON object.
pub fn row_from_json(json: &serde_json::Value) -> AdapterResult<Row> {
    let obj = json
        .as_object()
        .ok_or_else(|| AdapterError::validation("record must be a JSON object"))?;
    Ok(obj
        .iter()
        .map(|(k, v)| (k.clone(), Value::from_json_record(v)))
        .collect())
}

/// A row filter. Top-level clauses are ANDed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Where {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { field: String, cond: Cond },
    And(Vec<Where>),
    Or(Vec<Where>),
    Not(Box<Where>),
}

/// A condition on a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    /// Equality; `Eq(Value::Null)` means `IS NULL`.
    Eq(Value),
    /// Inequality; `Ne(Value::Null)` means `IS NOT NULL`.
    Ne(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Gt { value: Value, inclusive: bool },
    Lt { value: Value, inclusive: bool },
    IsNull,
    NotNull,
    /// Case-insensitive pattern match. `%` wildcards are the caller's.
    ILike(String),
}

impl Where {
    /// An empty filter matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Add a condition on a field.
    pub fn cond(mut self, field: &str, cond: Cond) -> Self {
        self.clauses.push(Clause::Field {
            field: field.to_string(),
            cond,
        });
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.cond(field, Cond::Eq(value.into()))
    }

    pub fn ne(self, field: &str, value: impl Into<Value>) -> Self {
        self.cond(field, Cond::Ne(value.into()))
    }

    pub fn gt(self, field: &str, value: impl Into<Value>) -> Self {
        self.cond(
            field,
            Cond::Gt {
                value: value.into(),
                inclusive: false,
            },
        )
    }

    pub fn gte(self, field: &str, value: impl Into<Value>) -> Self {
        self.cond(
            field,
            Cond::Gt {
                value: value.into(),
                inclusive: true,
            },
        )
    }

    pub fn lt(self, field: &str, value: impl Into<Value>) -> Self {
        self.cond(
            field,
            Cond::Lt {
                value: value.into(),
                inclusive: false,
            },
        )
    }

    pub fn lte(self, field: &str, value: impl Into<Value>) -> Self {
        self.cond(
            field,
            Cond::Lt {
                value: value.into(),
                inclusive: true,
            },
        )
    }

    pub fn is_in<V: Into<Value>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.cond(field, Cond::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn ilike(self, field: &str, pattern: &str) -> Self {
        self.cond(field, Cond::ILike(pattern.to_string()))
    }

    pub fn or(mut self, alternatives: Vec<Where>) -> Self {
        self.clauses.push(Clause::Or(alternatives));
        self
    }

    pub fn not(mut self, negated: Where) -> Self {
        self.clauses.push(Clause::Not(Box::new(negated)));
        self
    }

    /// AND another filter onto this one.
    pub fn and(mut self, other: Where) -> Self {
        self.clauses.extend(other.clauses);
        self
    }

    /// Whether any clause, at any depth, references `field`.
    pub fn mentions(&self, field: &str) -> bool {
        self.clauses.iter().any(|clause| match clause {
            Clause::Field { field: f, .. } => f == field,
            Clause::And(ws) | Clause::Or(ws) => ws.iter().any(|w| w.mentions(field)),
            Clause::Not(w) => w.mentions(field),
        })
    }

    /// Parse the host's JSON mapping form.
    ///
    /// ```
    /// use extpg::ast::Where;
    ///
    /// let w = Where::from_json(&serde_json::json!({
    ///     "age": {"gt": 18, "lt": 65, "equal": true},
    ///     "or": [{"role": "admin"}, {"role": "mod"}],
    /// }))
    /// .unwrap();
    /// assert_eq!(w.clauses.len(), 3);
    /// ```
    pub fn from_json(json: &serde_json::Value) -> AdapterResult<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| AdapterError::validation("predicate must be a JSON object"))?;
        let mut clauses = Vec::new();
        for (key, val) in obj {
            match key.as_str() {
                "or" | "and" => {
                    let items = val.as_array().ok_or_else(|| {
                        AdapterError::validation(format!("'{}' expects an array of predicates", key))
                    })?;
                    let parts = items
                        .iter()
                        .map(Where::from_json)
                        .collect::<AdapterResult<Vec<_>>>()?;
                    clauses.push(if key == "or" {
                        Clause::Or(parts)
                    } else {
                        Clause::And(parts)
                    });
                }
                "not" => clauses.push(Clause::Not(Box::new(Where::from_json(val)?))),
                field => field_conditions(field, val, &mut clauses)?,
            }
        }
        Ok(Self { clauses })
    }
}

fn field_conditions(
    field: &str,
    val: &serde_json::Value,
    out: &mut Vec<Clause>,
) -> AdapterResult<()> {
    let field_cond = |cond| Clause::Field {
        field: field.to_string(),
        cond,
    };
    match val {
        serde_json::Value::Null => out.push(field_cond(Cond::IsNull)),
        serde_json::Value::Array(items) => {
            for item in items {
                field_conditions(field, item, out)?;
            }
        }
        serde_json::Value::Object(ops) => {
            let inclusive = ops
                .get("equal")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false);
            for (op, operand) in ops {
                let cond = match op.as_str() {
                    "equal" => continue,
                    "eq" => Cond::Eq(Value::from_json(operand)?),
                    "ne" => Cond::Ne(Value::from_json(operand)?),
                    "not" if operand.is_null() => Cond::NotNull,
                    "not" => Cond::Ne(Value::from_json(operand)?),
                    "gt" => Cond::Gt {
                        value: Value::from_json(operand)?,
                        inclusive,
                    },
                    "gte" => Cond::Gt {
                        value: Value::from_json(operand)?,
                        inclusive: true,
                    },
                    "lt" => Cond::Lt {
                        value: Value::from_json(operand)?,
                        inclusive,
                    },
                    "lte" => Cond::Lt {
                        value: Value::from_json(operand)?,
                        inclusive: true,
                    },
                    "in" | "nin" => {
                        let items = operand.as_array().ok_or_else(|| {
                            AdapterError::validation(format!("'{}' on '{}' expects an array", op, field))
                        })?;
                        let values = items
                            .iter()
                            .map(Value::from_json)
                            .collect::<AdapterResult<Vec<_>>>()?;
                        if op == "in" {
                            Cond::In(values)
                        } else {
                            Cond::NotIn(values)
                        }
                    }
                    "ilike" => match operand {
                        serde_json::Value::String(s) => Cond::ILike(s.clone()),
                        _ => {
                            return Err(AdapterError::validation(format!(
                                "'ilike' on '{}' expects a string",
                                field
                            )));
                        }
                    },
                    other => {
                        return Err(AdapterError::validation(format!(
                            "unknown operator '{}' on field '{}'",
                            other, field
                        )));
                    }
                };
                out.push(field_cond(cond));
            }
        }
        scalar => out.push(field_cond(Cond::Eq(Value::from_json(scalar)?))),
    }
    Ok(())
}

/// Aggregate functions supported by aggregation and child-aggregation queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    CountUnique,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunc::Count | AggregateFunc::CountUnique => "COUNT",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }
}

impl FromStr for AggregateFunc {
    type Err = AdapterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "count" => Ok(AggregateFunc::Count),
            "countunique" | "countdistinct" => Ok(AggregateFunc::CountUnique),
            "sum" => Ok(AggregateFunc::Sum),
            "avg" | "average" => Ok(AggregateFunc::Avg),
            "min" => Ok(AggregateFunc::Min),
            "max" => Ok(AggregateFunc::Max),
            _ => Err(AdapterError::validation(format!(
                "unknown aggregate function '{}'",
                s
            ))),
        }
    }
}

impl fmt::Display for AggregateFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregateFunc::CountUnique => write!(f, "COUNT DISTINCT"),
            other => write!(f, "{}", other.sql_name()),
        }
    }
}

/// What to sort by.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderBy {
    Field(String),
    /// An aggregate expression, e.g. `COUNT("id")` in grouped queries.
    Aggregate { function: AggregateFunc, field: String },
}

/// Ordering, pagination and distinctness of a select.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectOptions {
    pub order_by: Option<OrderBy>,
    pub order_desc: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub distinct: bool,
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, field: &str) -> Self {
        self.order_by = Some(OrderBy::Field(field.to_string()));
        self
    }

    pub fn desc(mut self) -> Self {
        self.order_desc = true;
        self
    }

    pub fn limit(mut self, n: i64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: i64) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Parse the host's option object: `orderBy`, `orderDesc`, `limit`,
    /// `offset`, `distinct`.
    pub fn from_json(json: &serde_json::Value) -> AdapterResult<Self> {
        let obj = json
            .as_object()
            .ok_or_else(|| AdapterError::validation("options must be a JSON object"))?;
        let mut opts = SelectOptions::default();
        if let Some(order) = obj.get("orderBy") {
            opts.order_by = match order {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(OrderBy::Field(s.clone())),
                serde_json::Value::Object(desc) => {
                    let function = desc
                        .get("function")
                        .or_else(|| desc.get("aggregate"))
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| AdapterError::validation("orderBy object needs 'function'"))?
                        .parse()?;
                    let field = desc
                        .get("field")
                        .and_then(serde_json::Value::as_str)
                        .ok_or_else(|| AdapterError::validation("orderBy object needs 'field'"))?;
                    Some(OrderBy::Aggregate {
                        function,
                        field: field.to_string(),
                    })
                }
                other => {
                    return Err(AdapterError::validation(format!(
                        "orderBy must be a field name or descriptor, got {}",
                        other
                    )));
                }
            };
        }
        opts.order_desc = obj
            .get("orderDesc")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        opts.limit = json_count(obj.get("limit"), "limit")?;
        opts.offset = json_count(obj.get("offset"), "offset")?;
        opts.distinct = obj
            .get("distinct")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        Ok(opts)
    }
}

fn json_count(value: Option<&serde_json::Value>, name: &str) -> AdapterResult<Option<i64>> {
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(i) if i >= 0 => Ok(Some(i)),
            _ => Err(AdapterError::validation(format!(
                "{} must be a non-negative integer, got {}",
                name, n
            ))),
        },
        Some(other) => Err(AdapterError::validation(format!(
            "{} must be a non-negative integer, got {}",
            name, other
        ))),
    }
}

/// One aggregate column of an aggregation query.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSpec {
    pub alias: String,
    /// Target field, or `*` for counts.
    pub field: String,
    pub function: AggregateFunc,
    pub group_by: Option<String>,
    /// Restricts the rows this aggregate sees (`FILTER (WHERE ...)`).
    pub filter: Option<Where>,
}

impl AggregationSpec {
    pub fn new(alias: &str, function: AggregateFunc, field: &str) -> Self {
        Self {
            alias: alias.to_string(),
            field: field.to_string(),
            function,
            group_by: None,
            filter: None,
        }
    }

    pub fn group_by(mut self, field: &str) -> Self {
        self.group_by = Some(field.to_string());
        self
    }

    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Computes a join field's value for one fetched row, for targets that a
/// SQL join cannot reach.
#[async_trait]
pub trait RowLookup: Send + Sync {
    async fn lookup(&self, row: &Row) -> AdapterResult<Value>;
}

/// A value pulled in through a foreign key.
#[derive(Clone)]
pub struct JoinField {
    /// Output column name.
    pub alias: String,
    /// Key field on this table.
    pub ref_field: String,
    /// Column on the referenced table. Defaults to the key's summary field.
    pub target: Option<String>,
    /// When set, the value is computed after the fetch instead of joined.
    pub lookup: Option<Arc<dyn RowLookup>>,
}

impl JoinField {
    pub fn new(alias: &str, ref_field: &str) -> Self {
        Self {
            alias: alias.to_string(),
            ref_field: ref_field.to_string(),
            target: None,
            lookup: None,
        }
    }

    pub fn target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn lookup(mut self, lookup: Arc<dyn RowLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }
}

impl fmt::Debug for JoinField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinField")
            .field("alias", &self.alias)
            .field("ref_field", &self.ref_field)
            .field("target", &self.target)
            .field("lookup", &self.lookup.is_some())
            .finish()
    }
}

/// Aggregate over rows of another remote table that reference this one.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildAggregation {
    pub alias: String,
    pub table: String,
    /// Key field on the child table pointing at this table's primary key.
    pub ref_field: String,
    pub field: String,
    pub function: AggregateFunc,
}

/// Everything `get_joined_rows` needs.
#[derive(Debug, Clone, Default)]
pub struct JoinedQuery {
    pub joins: Vec<JoinField>,
    pub aggregations: Vec<ChildAggregation>,
    pub filter: Where,
    pub options: SelectOptions,
}

impl JoinedQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(mut self, join: JoinField) -> Self {
        self.joins.push(join);
        self
    }

    pub fn aggregate(mut self, aggregation: ChildAggregation) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    pub fn filter(mut self, filter: Where) -> Self {
        self.filter = filter;
        self
    }

    pub fn options(mut self, options: SelectOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_value_from() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from("hi"), Value::String("hi".to_string()));
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn test_coerce_form_strings() {
        let v = Value::from("5").coerce("n", &FieldType::Integer).unwrap();
        assert_eq!(v, Value::Int(5));
        let v = Value::from("on").coerce("b", &FieldType::Bool).unwrap();
        assert_eq!(v, Value::Bool(true));
        let v = Value::Int(2).coerce("x", &FieldType::Float).unwrap();
        assert_eq!(v, Value::Float(2.0));
        assert!(Value::from("abc").coerce("n", &FieldType::Integer).is_err());
        assert!(Value::from("yesterday").coerce("d", &FieldType::Date).is_err());
        assert!(Value::from("2024-03-01").coerce("d", &FieldType::Date).is_ok());
        assert!(Value::from("2024-03-01 10:15:00.123+00").coerce("d", &FieldType::Date).is_ok());
    }

    #[test]
    fn test_where_from_json_shapes() {
        let w = Where::from_json(&json!({
            "name": "bob",
            "deleted_at": null,
            "age": {"gt": 18, "lt": 65, "equal": true},
        }))
        .unwrap();
        assert_eq!(
            w.clauses,
            vec![
                Clause::Field {
                    field: "age".to_string(),
                    cond: Cond::Gt { value: Value::Int(18), inclusive: true },
                },
                Clause::Field {
                    field: "age".to_string(),
                    cond: Cond::Lt { value: Value::Int(65), inclusive: true },
                },
                Clause::Field { field: "deleted_at".to_string(), cond: Cond::IsNull },
                Clause::Field {
                    field: "name".to_string(),
                    cond: Cond::Eq(Value::String("bob".to_string())),
                },
            ]
        );
    }

    #[test]
    fn test_where_from_json_rejects_unknown_operator() {
        let err = Where::from_json(&json!({"age": {"between": [1, 2]}})).unwrap_err();
        assert!(err.to_string().contains("unknown operator 'between'"));
    }

    #[test]
    fn test_where_mentions_nested() {
        let w = Where::new().or(vec![Where::new().eq("_deleted", true), Where::new().eq("a", 1)]);
        assert!(w.mentions("_deleted"));
        assert!(!w.mentions("_is_latest"));
    }

    #[test]
    fn test_options_from_json() {
        let opts = SelectOptions::from_json(&json!({
            "orderBy": "name", "orderDesc": true, "limit": 10, "offset": 20
        }))
        .unwrap();
        assert_eq!(opts.order_by, Some(OrderBy::Field("name".to_string())));
        assert!(opts.order_desc);
        assert_eq!(opts.limit, Some(10));
        assert_eq!(opts.offset, Some(20));
    }

    #[test]
    fn test_options_reject_bad_limits() {
        assert!(SelectOptions::from_json(&json!({"limit": -1})).is_err());
        assert!(SelectOptions::from_json(&json!({"limit": 2.5})).is_err());
        assert!(SelectOptions::from_json(&json!({"offset": "10"})).is_err());
    }

    #[test]
    fn test_aggregate_func_parse() {
        assert_eq!("Count".parse::<AggregateFunc>().unwrap(), AggregateFunc::Count);
        assert_eq!("count_unique".parse::<AggregateFunc>().unwrap(), AggregateFunc::CountUnique);
        assert_eq!("Avg".parse::<AggregateFunc>().unwrap(), AggregateFunc::Avg);
        assert!("median".parse::<AggregateFunc>().is_err());
    }
}
