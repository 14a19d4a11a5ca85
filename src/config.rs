//! Adapter configuration.
//!
//! A table adapter is configured with where the remote table lives (a
//! [`ConnectionIdentity`]) and what it looks like (a [`TableSchema`]). The
//! flat, host-supplied shape is [`RawTableConfig`]; it is validated once into
//! a [`TableConfig`].
//!
//! ```
//! use extpg::config::ConfigFile;
//!
//! let file = ConfigFile::from_toml(r#"
//!     [tables.users]
//!     host = "db.internal"
//!     user = "app"
//!     database = "crm"
//!     table_name = "users"
//!
//!     [[tables.users.fields]]
//!     name = "id"
//!     type = "Integer"
//!     primary_key = true
//! "#).unwrap();
//! let config = file.table("users").unwrap();
//! assert_eq!(config.schema.schema, "public");
//! assert!(!config.versioned);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AdapterError, AdapterResult};
use crate::schema::{FieldDescriptor, TableSchema};

/// Prefix of the environment variable holding a database's password.
pub const PASSWORD_ENV_PREFIX: &str = "SC_EXTPG_PASS_";

pub const DEFAULT_PORT: u16 = 5432;

/// Where to connect.
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionIdentity {
    /// A pre-built connection string, used verbatim.
    Url(String),
    Params {
        host: String,
        port: u16,
        user: String,
        /// Empty or absent means "look it up in the environment".
        password: Option<String>,
        database: String,
    },
}

impl ConnectionIdentity {
    pub fn url(url: impl Into<String>) -> Self {
        ConnectionIdentity::Url(url.into())
    }

    pub fn params(host: &str, user: &str, database: &str) -> Self {
        ConnectionIdentity::Params {
            host: host.to_string(),
            port: DEFAULT_PORT,
            user: user.to_string(),
            password: None,
            database: database.to_string(),
        }
    }

    /// Builder: set the port of a structured identity.
    pub fn port(mut self, value: u16) -> Self {
        if let ConnectionIdentity::Params { port, .. } = &mut self {
            *port = value;
        }
        self
    }

    /// Builder: set the password of a structured identity.
    pub fn password(mut self, value: &str) -> Self {
        if let ConnectionIdentity::Params { password, .. } = &mut self {
            *password = Some(value.to_string());
        }
        self
    }

    /// Normalize to a connection string.
    ///
    /// `env` is consulted for `SC_EXTPG_PASS_<database>` when a structured
    /// identity has no password.
    pub fn resolve(&self, env: &dyn Fn(&str) -> Option<String>) -> AdapterResult<String> {
        match self {
            ConnectionIdentity::Url(url) => Ok(url.clone()),
            ConnectionIdentity::Params {
                host,
                port,
                user,
                password,
                database,
            } => {
                let password = match password.as_deref() {
                    Some(p) if !p.is_empty() => Some(p.to_string()),
                    _ => env(&format!("{}{}", PASSWORD_ENV_PREFIX, database)),
                };
                let bad = |what: &str| {
                    AdapterError::config(format!("invalid {} in connection parameters", what))
                };
                let mut url = Url::parse("postgresql://localhost").map_err(|_| bad("url"))?;
                url.set_host(Some(host)).map_err(|_| bad("host"))?;
                url.set_port(Some(*port)).map_err(|_| bad("port"))?;
                url.set_username(user).map_err(|_| bad("user"))?;
                url.set_password(password.as_deref()).map_err(|_| bad("password"))?;
                url.set_path(&format!("/{}", database));
                Ok(url.to_string())
            }
        }
    }
}

impl fmt::Debug for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionIdentity::Url(url) => f.debug_tuple("Url").field(&redact(url)).finish(),
            ConnectionIdentity::Params {
                host,
                port,
                user,
                password,
                database,
            } => f
                .debug_struct("Params")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("password", &password.as_ref().map(|_| "****"))
                .field("database", database)
                .finish(),
        }
    }
}

/// Connection string with any password masked, for logs and errors.
pub fn redact(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("****")).is_ok() {
                parsed.to_string()
            } else {
                "<redacted>".to_string()
            }
        }
        Ok(_) => url.to_string(),
        Err(_) => "<unparseable connection string>".to_string(),
    }
}

/// `url` with any password removed, for writing back into config files.
pub fn strip_password(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => match parsed.set_password(None) {
            Ok(()) => parsed.to_string(),
            Err(()) => redact(url),
        },
        _ => url.to_string(),
    }
}

fn default_schema() -> String {
    "public".to_string()
}

/// Flat configuration as supplied by the host or a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawTableConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Remote table name. The versioned adapter's hosts call it `table`.
    #[serde(default, alias = "table", skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default)]
    pub versioned: bool,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl RawTableConfig {
    /// Connection keys only. Fields and table name are not looked at, so a
    /// section that is still being bootstrapped can be connected with.
    pub fn connection(&self) -> AdapterResult<ConnectionIdentity> {
        if let Some(url) = self.connection_string.as_ref().filter(|u| !u.trim().is_empty()) {
            return Ok(ConnectionIdentity::Url(url.clone()));
        }
        let required = |value: &Option<String>, key: &str| {
            value
                .clone()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| AdapterError::config(format!("missing '{}'", key)))
        };
        Ok(ConnectionIdentity::Params {
            host: required(&self.host, "host")?,
            port: self.port.unwrap_or(DEFAULT_PORT),
            user: required(&self.user, "user")?,
            password: self.password.clone(),
            database: required(&self.database, "database")?,
        })
    }
}

/// Validated adapter configuration.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub connection: ConnectionIdentity,
    pub schema: TableSchema,
    pub versioned: bool,
}

impl TryFrom<RawTableConfig> for TableConfig {
    type Error = AdapterError;

    fn try_from(raw: RawTableConfig) -> Result<Self, Self::Error> {
        let connection = raw.connection()?;
        let table = raw
            .table_name
            .ok_or_else(|| AdapterError::config("missing 'table_name'"))?;
        let schema = TableSchema::new(&raw.schema, &table, raw.fields)?;
        Ok(TableConfig {
            connection,
            schema,
            versioned: raw.versioned,
        })
    }
}

impl TableConfig {
    /// Validate the host's JSON configuration object.
    pub fn from_json(json: &serde_json::Value) -> AdapterResult<Self> {
        let raw: RawTableConfig = serde_json::from_value(json.clone())
            .map_err(|e| AdapterError::config(e.to_string()))?;
        raw.try_into()
    }
}

/// A config file: one `[tables.<name>]` table per adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub tables: BTreeMap<String, RawTableConfig>,
}

impl ConfigFile {
    pub fn from_toml(source: &str) -> AdapterResult<Self> {
        toml::from_str(source).map_err(|e| AdapterError::config(e.to_string()))
    }

    pub fn load(path: &Path) -> AdapterResult<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            AdapterError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&source)
    }

    /// `<config dir>/extpg/tables.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("extpg").join("tables.toml"))
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// The unvalidated section for `name`.
    pub fn raw(&self, name: &str) -> AdapterResult<&RawTableConfig> {
        self.tables.get(name).ok_or_else(|| {
            AdapterError::config(format!("no table '{}' in configuration", name))
        })
    }

    pub fn table(&self, name: &str) -> AdapterResult<TableConfig> {
        self.raw(name)?.clone().try_into()
    }

    pub fn to_toml(&self) -> AdapterResult<String> {
        toml::to_string_pretty(self).map_err(|e| AdapterError::config(e.to_string()))
    }
}
