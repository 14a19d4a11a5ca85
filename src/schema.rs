//! Field and table definitions.
//!
//! Field types are resolved once, when a configuration is loaded, into the
//! closed [`FieldType`] variant. Everything downstream matches on it.
//!
//! # Example
//! ```
//! use extpg::schema::{FieldDescriptor, FieldType};
//!
//! let json = r#"[
//!     { "name": "id", "label": "ID", "type": "Integer", "primary_key": true },
//!     { "name": "owner", "label": "Owner", "type": "Key to users", "summary_field": "email" }
//! ]"#;
//!
//! let fields: Vec<FieldDescriptor> = serde_json::from_str(json).unwrap();
//! assert!(fields[1].is_fkey());
//! ```

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use strsim::levenshtein;

use crate::error::{AdapterError, AdapterResult};

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// The type of a field, as far as query compilation cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Float,
    Bool,
    Date,
    Json,
    /// Stored as a path or file reference string.
    File,
    /// Foreign key to `reftable`'s `id`.
    Key {
        reftable: String,
        summary_field: Option<String>,
    },
}

impl FieldType {
    /// Parse a configured type name such as `Integer` or `Key to users`.
    pub fn parse(name: &str, reftable: Option<&str>) -> AdapterResult<Self> {
        let ty = match name.trim() {
            "String" => FieldType::String,
            "Integer" => FieldType::Integer,
            "Float" => FieldType::Float,
            "Bool" => FieldType::Bool,
            "Date" => FieldType::Date,
            "JSON" | "Json" => FieldType::Json,
            "File" => FieldType::File,
            "Key" => match reftable {
                Some(t) => FieldType::Key {
                    reftable: t.to_string(),
                    summary_field: None,
                },
                None => {
                    return Err(AdapterError::config(
                        "field type 'Key' requires reftable_name",
                    ));
                }
            },
            other => match other.strip_prefix("Key to ") {
                Some(t) if !t.trim().is_empty() => FieldType::Key {
                    reftable: t.trim().to_string(),
                    summary_field: None,
                },
                _ => {
                    return Err(AdapterError::config(format!(
                        "unknown field type '{}'. Expected one of: String, Integer, Float, Bool, Date, JSON, File, Key, Key to <table>",
                        other
                    )));
                }
            },
        };
        Ok(ty)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Integer => write!(f, "Integer"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Date => write!(f, "Date"),
            FieldType::Json => write!(f, "JSON"),
            FieldType::File => write!(f, "File"),
            FieldType::Key { reftable, .. } => write!(f, "Key to {}", reftable),
        }
    }
}

/// A column of a remote table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawField", into = "RawField")]
pub struct FieldDescriptor {
    pub name: String,
    pub label: String,
    pub ty: FieldType,
    pub primary_key: bool,
}

impl FieldDescriptor {
    pub fn new(name: &str, ty: FieldType) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            ty,
            primary_key: false,
        }
    }

    /// Builder: mark as the primary key.
    pub fn pk(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn is_fkey(&self) -> bool {
        matches!(self.ty, FieldType::Key { .. })
    }

    pub fn reftable_name(&self) -> Option<&str> {
        match &self.ty {
            FieldType::Key { reftable, .. } => Some(reftable),
            _ => None,
        }
    }

    pub fn summary_field(&self) -> Option<&str> {
        match &self.ty {
            FieldType::Key { summary_field, .. } => summary_field.as_deref(),
            _ => None,
        }
    }
}

/// Serialized shape of a field, as written by users and the discovery step.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawField {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
    #[serde(rename = "type")]
    ty: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    primary_key: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_fkey: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reftable_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary_field: Option<String>,
    #[serde(default, skip_serializing)]
    attributes: Option<RawAttributes>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RawAttributes {
    summary_field: Option<String>,
}

impl TryFrom<RawField> for FieldDescriptor {
    type Error = AdapterError;

    fn try_from(raw: RawField) -> Result<Self, Self::Error> {
        validate_identifier(&raw.name).map_err(|e| AdapterError::config(e.to_string()))?;
        let mut ty = FieldType::parse(&raw.ty, raw.reftable_name.as_deref())?;
        if raw.is_fkey && !matches!(ty, FieldType::Key { .. }) {
            return Err(AdapterError::config(format!(
                "field '{}' is marked is_fkey but has type '{}'",
                raw.name, raw.ty
            )));
        }
        if let FieldType::Key { summary_field, .. } = &mut ty {
            *summary_field = raw
                .summary_field
                .or_else(|| raw.attributes.and_then(|a| a.summary_field));
        }
        Ok(Self {
            label: raw.label.unwrap_or_else(|| raw.name.clone()),
            name: raw.name,
            ty,
            primary_key: raw.primary_key,
        })
    }
}

impl From<FieldDescriptor> for RawField {
    fn from(field: FieldDescriptor) -> Self {
        let (reftable_name, summary_field) = match &field.ty {
            FieldType::Key {
                reftable,
                summary_field,
            } => (Some(reftable.clone()), summary_field.clone()),
            _ => (None, None),
        };
        RawField {
            ty: field.ty.to_string(),
            is_fkey: reftable_name.is_some(),
            name: field.name,
            label: Some(field.label),
            primary_key: field.primary_key,
            reftable_name,
            summary_field,
            attributes: None,
        }
    }
}

/// Check that `name` can be embedded in SQL as a quoted identifier.
pub fn validate_identifier(name: &str) -> AdapterResult<()> {
    let mut chars = name.chars();
    let starts_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !starts_ok
        || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.len() > MAX_IDENTIFIER_LEN
    {
        return Err(AdapterError::validation(format!(
            "'{}' is not a valid identifier",
            name
        )));
    }
    Ok(())
}

/// A remote table: where it lives and which fields it has.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    fields: Vec<FieldDescriptor>,
}

impl TableSchema {
    pub fn new(schema: &str, table: &str, fields: Vec<FieldDescriptor>) -> AdapterResult<Self> {
        validate_identifier(schema).map_err(|e| AdapterError::config(e.to_string()))?;
        validate_identifier(table).map_err(|e| AdapterError::config(e.to_string()))?;
        if fields.is_empty() {
            return Err(AdapterError::config(format!(
                "table '{}' has no fields configured",
                table
            )));
        }
        let mut seen = HashSet::new();
        for field in &fields {
            validate_identifier(&field.name).map_err(|e| AdapterError::config(e.to_string()))?;
            if !seen.insert(field.name.as_str()) {
                return Err(AdapterError::config(format!(
                    "field '{}' is declared twice on table '{}'",
                    field.name, table
                )));
            }
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
            fields,
        })
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Look up a field, suggesting a close match when it does not exist.
    pub fn field(&self, name: &str) -> AdapterResult<&FieldDescriptor> {
        if let Some(field) = self.fields.iter().find(|f| f.name == name) {
            return Ok(field);
        }
        validate_identifier(name)?;
        match did_you_mean(name, self.fields.iter().map(|f| f.name.as_str())) {
            Some(sugg) => Err(AdapterError::validation(format!(
                "Field '{}' not found in table '{}'. Did you mean '{}'?",
                name, self.table, sugg
            ))),
            None => Err(AdapterError::validation(format!(
                "Field '{}' not found in table '{}'.",
                name, self.table
            ))),
        }
    }

    /// Name of the primary key column; `id` when no field is marked.
    pub fn primary_key(&self) -> &str {
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .map(|f| f.name.as_str())
            .unwrap_or("id")
    }

    /// The field rows are addressed by: the marked primary key, else a field
    /// named `id`. `None` for keyless tables.
    pub fn key_field(&self) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .or_else(|| self.fields.iter().find(|f| f.name == "id"))
    }

    /// Type of the primary key column.
    pub fn primary_key_type(&self) -> FieldType {
        self.key_field()
            .map(|f| f.ty.clone())
            .unwrap_or(FieldType::Integer)
    }
}

/// Find the best match with Levenshtein distance <= 3.
fn did_you_mean<'a>(input: &str, candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    let threshold = match input.len() {
        0..=2 => 0,
        3..=5 => 2,
        _ => 3,
    };
    candidates
        .map(|cand| (levenshtein(input, cand), cand))
        .filter(|(dist, _)| *dist <= threshold)
        .min_by_key(|(dist, _)| *dist)
        .map(|(_, cand)| cand.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn people() -> TableSchema {
        TableSchema::new(
            "public",
            "people",
            vec![
                FieldDescriptor::new("id", FieldType::Integer).pk(),
                FieldDescriptor::new("email", FieldType::String),
                FieldDescriptor::new("age", FieldType::Integer),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_parse_key_types() {
        assert_eq!(
            FieldType::parse("Key to users", None).unwrap(),
            FieldType::Key { reftable: "users".to_string(), summary_field: None }
        );
        assert_eq!(
            FieldType::parse("Key", Some("teams")).unwrap(),
            FieldType::Key { reftable: "teams".to_string(), summary_field: None }
        );
        assert!(FieldType::parse("Key", None).is_err());
        assert!(FieldType::parse("Color", None).is_err());
    }

    #[test]
    fn test_field_from_json_with_attributes() {
        let json = r#"{
            "name": "owner",
            "label": "Owner",
            "type": "Key",
            "reftable_name": "users",
            "attributes": { "summary_field": "email" }
        }"#;
        let field: FieldDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(field.reftable_name(), Some("users"));
        assert_eq!(field.summary_field(), Some("email"));
    }

    #[test]
    fn test_field_rejects_unsafe_name() {
        let json = r#"{ "name": "a\"; drop", "type": "String" }"#;
        assert!(serde_json::from_str::<FieldDescriptor>(json).is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("created_at").is_ok());
        assert!(validate_identifier("_version").is_ok());
        assert!(validate_identifier("1col").is_err());
        assert!(validate_identifier("na me").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_field_did_you_mean() {
        let schema = people();
        let err = schema.field("emial").unwrap_err();
        assert!(err.to_string().contains("Did you mean 'email'?"));
        assert!(schema.field("age").is_ok());
    }

    #[test]
    fn test_duplicate_fields_rejected() {
        let err = TableSchema::new(
            "public",
            "t",
            vec![
                FieldDescriptor::new("a", FieldType::String),
                FieldDescriptor::new("a", FieldType::Integer),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_key_field_falls_back_to_id() {
        let keyless = TableSchema::new(
            "public",
            "t",
            vec![FieldDescriptor::new("name", FieldType::String)],
        )
        .unwrap();
        assert!(keyless.key_field().is_none());

        let implicit = TableSchema::new(
            "public",
            "t",
            vec![
                FieldDescriptor::new("id", FieldType::String),
                FieldDescriptor::new("name", FieldType::String),
            ],
        )
        .unwrap();
        assert_eq!(implicit.key_field().map(|f| f.name.as_str()), Some("id"));
        assert_eq!(implicit.primary_key_type(), FieldType::String);
        assert_eq!(people().primary_key(), "id");
    }
}
