use crate::schema::FieldType;

/// Supported SQL dialects.
///
/// Postgres is what remote tables run on. SQLite speaks the same subset the
/// compilers emit and backs local files and in-memory databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Dialect for a connection URL, by scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Some(Dialect::Postgres),
            "sqlite" => Some(Dialect::Sqlite),
            _ => None,
        }
    }

    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index),
            Dialect::Sqlite => format!("?{}", index),
        }
    }

    /// Placeholder for a value bound to a field of type `ty`.
    ///
    /// Postgres gets an explicit cast so that the parameter type the driver
    /// declares (including for NULLs) never decides the column type.
    pub fn bind(&self, index: usize, ty: Option<&FieldType>) -> String {
        let ph = self.placeholder(index);
        match (self, ty) {
            (Dialect::Sqlite, _) | (Dialect::Postgres, None) => ph,
            (Dialect::Postgres, Some(ty)) => match ty {
                FieldType::Date => format!("CAST(CAST({} AS TEXT) AS TIMESTAMPTZ)", ph),
                FieldType::Json => format!("CAST(CAST({} AS TEXT) AS JSONB)", ph),
                other => format!("CAST({} AS {})", ph, pg_carrier_type(other)),
            },
        }
    }

    /// Projection of a column so that the driver can decode it.
    pub fn project(&self, expr: &str, ty: &FieldType) -> String {
        match self {
            Dialect::Sqlite => expr.to_string(),
            Dialect::Postgres => format!("CAST({} AS {})", expr, pg_carrier_type(ty)),
        }
    }

    /// Projection for a column whose type is not described (join targets).
    pub fn project_text(&self, expr: &str) -> String {
        self.project(expr, &FieldType::String)
    }

    /// Projection of a computed aggregate.
    pub fn project_aggregate(&self, expr: &str, carrier: AggregateCarrier) -> String {
        match self {
            Dialect::Sqlite => expr.to_string(),
            Dialect::Postgres => {
                let ty = match carrier {
                    AggregateCarrier::Integer => "BIGINT",
                    AggregateCarrier::Float => "DOUBLE PRECISION",
                    AggregateCarrier::Text => "TEXT",
                };
                format!("CAST({} AS {})", expr, ty)
            }
        }
    }

    /// Case-insensitive pattern match operator.
    pub fn like(&self) -> &'static str {
        match self {
            Dialect::Postgres => "ILIKE",
            Dialect::Sqlite => "LIKE",
        }
    }

    /// Fully qualified table reference. Callers validate both identifiers.
    pub fn table(&self, schema: &str, table: &str) -> String {
        match self {
            Dialect::Postgres => format!("\"{}\".\"{}\"", schema, table),
            Dialect::Sqlite => format!("\"{}\"", table),
        }
    }

    /// Clause for an offset without a limit.
    pub fn offset_only(&self, offset: i64) -> String {
        match self {
            Dialect::Postgres => format!(" OFFSET {}", offset),
            // SQLite only accepts OFFSET after a LIMIT.
            Dialect::Sqlite => format!(" LIMIT -1 OFFSET {}", offset),
        }
    }
}

/// Type an aggregate result is carried as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateCarrier {
    Integer,
    Float,
    Text,
}

fn pg_carrier_type(ty: &FieldType) -> &'static str {
    match ty {
        FieldType::String | FieldType::File | FieldType::Date | FieldType::Json => "TEXT",
        FieldType::Integer | FieldType::Key { .. } => "BIGINT",
        FieldType::Float => "DOUBLE PRECISION",
        FieldType::Bool => "BOOLEAN",
    }
}
