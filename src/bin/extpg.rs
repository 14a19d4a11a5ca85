//! extpg: drive external table adapters from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Read rows
//! extpg --table orders rows --where "status=open & total>=100" --order total --desc
//!
//! # Show the SQL without connecting
//! extpg --table orders sql --where "status=open|status=held"
//!
//! # Versioned tables
//! extpg --table docs update 7 '{"title": "Draft 2"}'
//! extpg --table docs history 7
//! extpg --table docs restore 7 1
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use extpg::config::{ConfigFile, RawTableConfig, strip_password};
use extpg::discovery::{Discovery, InformationSchemaDiscovery};
use extpg::prelude::*;
use extpg::transpiler::{Dialect, dml};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "extpg")]
#[command(version)]
#[command(about = "External PostgreSQL tables with append-only versioning", long_about = None)]
#[command(after_help = "EXAMPLES:
    extpg --table users rows --where 'active=true & name~ada' --limit 10
    extpg --table users count --where 'age>=18'
    extpg --table docs restore 7 1 --user 3")]
struct Cli {
    /// Config file with one [tables.<name>] section per table
    #[arg(short, long, env = "EXTPG_CONFIG")]
    config: Option<PathBuf>,

    /// Configured table to operate on (optional when only one is configured)
    #[arg(short, long)]
    table: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Acting user id, recorded on versioned tables
    #[arg(short, long, global = true)]
    user: Option<i64>,

    /// Verbose output (logs every statement)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Args)]
struct Query {
    /// Filter expression, e.g. "age>=18 & role=admin|role=owner"
    #[arg(short, long = "where")]
    filter: Option<String>,

    #[arg(long)]
    order: Option<String>,

    #[arg(long)]
    desc: bool,

    #[arg(long)]
    limit: Option<i64>,

    #[arg(long)]
    offset: Option<i64>,
}

impl Query {
    fn filter(&self) -> Result<Where> {
        Ok(parse_filter(self.filter.as_deref().unwrap_or(""))?)
    }

    fn options(&self) -> SelectOptions {
        SelectOptions {
            order_by: self.order.as_deref().map(|o| OrderBy::Field(o.to_string())),
            order_desc: self.desc,
            limit: self.limit,
            offset: self.offset,
            distinct: false,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print matching rows
    Rows(Query),
    /// Count matching rows
    Count {
        #[arg(short, long = "where")]
        filter: Option<String>,
    },
    /// Distinct values of one field
    Distinct {
        field: String,
        #[arg(short, long = "where")]
        filter: Option<String>,
    },
    /// Insert a JSON record
    Insert { record: String },
    /// Apply a partial JSON record to one row
    Update { id: String, record: String },
    /// Delete matching rows (soft delete on versioned tables)
    Delete {
        #[arg(short, long = "where")]
        filter: String,
    },
    /// Every version of an entity (versioned tables)
    History { id: String },
    /// Write a new head from an earlier version (versioned tables)
    Restore { id: String, version: i64 },
    /// Show the SELECT a query compiles to, without connecting
    Sql(Query),
    /// Print [tables.*] sections for remote tables
    Discover {
        #[arg(long, default_value = "public")]
        schema: String,
        /// Connect here instead of through a configured table's connection keys
        #[arg(long)]
        url: Option<String>,
        /// Tables to describe; all when omitted
        tables: Vec<String>,
    },
    /// List configured tables
    Tables,
}

enum Adapter {
    Plain(PlainTable),
    Versioned(VersionedTable),
}

impl Adapter {
    fn table(&self) -> &dyn Table {
        match self {
            Adapter::Plain(t) => t as &dyn Table,
            Adapter::Versioned(t) => t as &dyn Table,
        }
    }

    fn versioned(&self) -> Result<&VersionedTable> {
        match self {
            Adapter::Versioned(t) => Ok(t),
            Adapter::Plain(t) => bail!("table '{}' is not versioned", t.schema().table),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "extpg=debug" } else { "extpg=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<ConfigFile> {
    let path = cli
        .config
        .clone()
        .or_else(ConfigFile::default_path)
        .ok_or_else(|| anyhow!("no config file; pass --config or set EXTPG_CONFIG"))?;
    ConfigFile::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn pick_name(file: &ConfigFile, wanted: Option<&str>) -> Result<String> {
    Ok(match wanted {
        Some(name) => name.to_string(),
        None => {
            let names: Vec<&str> = file.table_names().collect();
            match names.as_slice() {
                [only] => only.to_string(),
                [] => bail!("the config file has no tables"),
                _ => bail!("pick a table with --table (one of: {})", names.join(", ")),
            }
        }
    })
}

fn open(registry: &Arc<ConnectionRegistry>, config: TableConfig) -> Result<Adapter> {
    if config.versioned {
        Ok(Adapter::Versioned(VersionedTable::new(Arc::clone(registry), config)?))
    } else {
        Ok(Adapter::Plain(PlainTable::new(Arc::clone(registry), config)))
    }
}

fn parse_record(json: &str) -> Result<Row> {
    let value: serde_json::Value = serde_json::from_str(json).context("record must be JSON")?;
    Ok(row_from_json(&value)?)
}

fn parse_id(id: &str) -> Value {
    id.parse::<i64>()
        .map(Value::Int)
        .unwrap_or_else(|_| Value::String(id.to_string()))
}

async fn run(cli: &Cli) -> Result<()> {
    let registry = Arc::new(ConnectionRegistry::new());
    if let Commands::Discover { schema, url: Some(url), tables } = &cli.command {
        return discover(&registry, &ConnectionIdentity::url(url.as_str()), None, schema, tables).await;
    }

    let file = load_config(cli)?;
    if let Commands::Tables = cli.command {
        for name in file.table_names() {
            println!("{}", name.cyan());
        }
        return Ok(());
    }

    let name = pick_name(&file, cli.table.as_deref())?;
    if cli.verbose {
        eprintln!("{} {}", "Table:".dimmed(), name.yellow());
    }

    // Discovery bootstraps sections, so only the connection keys must be valid.
    if let Commands::Discover { schema, tables, .. } = &cli.command {
        let raw = file.raw(&name)?;
        return discover(&registry, &raw.connection()?, Some(raw), schema, tables).await;
    }
    let config = file.table(&name)?;
    if let Commands::Sql(query) = &cli.command {
        let dialect = Dialect::from_url(&registry.resolve(&config.connection)?).unwrap_or_default();
        let adapter = open(&registry, config)?;
        let filter = match &adapter {
            Adapter::Versioned(t) => t.visible(&query.filter()?),
            Adapter::Plain(_) => query.filter()?,
        };
        let stmt = dml::select(adapter.table().schema(), &filter, &query.options(), dialect)?;
        println!("{}", "Generated SQL:".green().bold());
        println!("{}", stmt.sql.white());
        if !stmt.params.is_empty() {
            println!();
            println!("{}", "Bindings:".cyan());
            for (i, p) in stmt.params.iter().enumerate() {
                println!("  {} = {}", dialect.placeholder(i + 1), p.to_string().yellow());
            }
        }
        return Ok(());
    }

    let adapter = open(&registry, config)?;
    let table = adapter.table();
    match &cli.command {
        Commands::Rows(query) => {
            let rows = table.get_rows(&query.filter()?, &query.options()).await?;
            format_output(&rows, &cli.format);
        }
        Commands::Count { filter } => {
            let n = table.count_rows(&parse_filter(filter.as_deref().unwrap_or(""))?).await?;
            println!("{}", n.to_string().cyan());
        }
        Commands::Distinct { field, filter } => {
            let values = table
                .distinct_values(field, &parse_filter(filter.as_deref().unwrap_or(""))?)
                .await?;
            let rows: Vec<Row> = values
                .into_iter()
                .map(|v| Row::from([(field.clone(), v)]))
                .collect();
            format_output(&rows, &cli.format);
        }
        Commands::Insert { record } => {
            let id = table.insert_row(&parse_record(record)?, cli.user).await?;
            println!("{} inserted {}", "✓".green(), id.to_string().cyan());
        }
        Commands::Update { id, record } => {
            table.update_row(&parse_record(record)?, &parse_id(id), cli.user).await?;
            println!("{} updated {}", "✓".green(), id.cyan());
        }
        Commands::Delete { filter } => {
            let filter = parse_filter(filter)?;
            if filter.is_empty() {
                bail!("refusing to delete without a filter");
            }
            let n = table.delete_rows(&filter, cli.user).await?;
            println!("{} {} rows deleted", "✓".green(), n);
        }
        Commands::History { id } => {
            let rows = adapter.versioned()?.get_history(&parse_id(id)).await?;
            format_output(&rows, &cli.format);
        }
        Commands::Restore { id, version } => {
            let next = adapter
                .versioned()?
                .restore(&parse_id(id), *version, cli.user)
                .await?;
            println!(
                "{} restored version {} of {} as version {}",
                "✓".green(),
                version,
                id.cyan(),
                next.to_string().cyan()
            );
        }
        Commands::Sql(_) | Commands::Discover { .. } | Commands::Tables => {}
    }
    Ok(())
}

/// Print one `[tables.*]` section per remote table. Connection keys are
/// copied from `base` when given; passwords are never written.
async fn discover(
    registry: &ConnectionRegistry,
    identity: &ConnectionIdentity,
    base: Option<&RawTableConfig>,
    schema: &str,
    tables: &[String],
) -> Result<()> {
    let pool = registry.acquire(identity).await?;
    let discovery = InformationSchemaDiscovery::new(pool)?;
    let defs = discovery.discover_table_definitions(tables, schema).await?;

    let template = match (base, identity) {
        (Some(raw), _) => raw.clone(),
        (None, ConnectionIdentity::Url(url)) => RawTableConfig {
            connection_string: Some(strip_password(url)),
            ..RawTableConfig::default()
        },
        (None, ConnectionIdentity::Params { .. }) => RawTableConfig::default(),
    };
    let mut out = ConfigFile::default();
    for def in defs {
        out.tables.insert(
            def.name.clone(),
            RawTableConfig {
                schema: schema.to_string(),
                table_name: Some(def.name),
                fields: def.fields,
                versioned: false,
                ..template.clone()
            },
        );
    }
    println!("{}", out.to_toml()?);
    Ok(())
}

fn format_output(results: &[Row], format: &OutputFormat) {
    if results.is_empty() {
        println!("{}", "(no results)".dimmed());
        return;
    }

    match format {
        OutputFormat::Json => {
            let json: Vec<serde_json::Value> = results
                .iter()
                .map(|row| {
                    serde_json::Value::Object(
                        row.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                    )
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
        }
        OutputFormat::Table => {
            let columns: Vec<&String> = results[0].keys().collect();

            let mut widths: HashMap<&String, usize> = columns.iter().map(|c| (*c, c.len())).collect();
            for row in results {
                for (col, val) in row {
                    let len = val.to_string().chars().count();
                    if let Some(w) = widths.get_mut(col) {
                        *w = (*w).max(len);
                    }
                }
            }

            let header: Vec<String> = columns
                .iter()
                .map(|c| format!("{:width$}", c, width = widths[*c]))
                .collect();
            println!("{}", header.join(" │ ").white().bold());

            let sep: Vec<String> = columns.iter().map(|c| "─".repeat(widths[*c])).collect();
            println!("{}", sep.join("─┼─").dimmed());

            for row in results {
                let cells: Vec<String> = columns
                    .iter()
                    .map(|c| {
                        let val = row.get(*c).map(|v| v.to_string()).unwrap_or_default();
                        format!("{:width$}", val, width = widths[*c])
                    })
                    .collect();
                println!("{}", cells.join(" │ "));
            }

            println!();
            println!("{} row(s) returned", results.len().to_string().cyan());
        }
    }
}
