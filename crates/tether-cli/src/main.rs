//! tether command-line tool.
//!
//! Reads `tether.toml` (or the path given with `--config`, overridable with
//! `TETHER_*` environment variables), loads the JSON schema it points at, and
//! prints DDL, compiled queries, or query results from a SQLite database.
//!
//! ```text
//! tether ddl --dialect postgres
//! tether sql Person --relation mother --where fullName=Ada
//! tether find House --relation tenants
//! tether referencers Person 3
//! ```

use std::{
  fs,
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tether_core::{
  Dialect, EntityId, Find, Orm, OrmConfig, Schema, SchemaDef, Value, compile_find, create_statements,
};
use tether_store_sqlite::SqliteConnection;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Tether ORM tool")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "tether.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Print the CREATE TABLE statements for the schema.
  Ddl {
    #[arg(long, default_value = "sqlite")]
    dialect: Dialect,
  },
  /// Print the SQL a find request compiles to.
  Sql {
    class:   String,
    #[command(flatten)]
    query:   QueryArgs,
    #[arg(long, default_value = "sqlite")]
    dialect: Dialect,
  },
  /// Run a find request against the database and print the results as JSON.
  Find {
    class: String,
    #[command(flatten)]
    query: QueryArgs,
  },
  /// List every stored instance referencing one entity.
  Referencers { class: String, id: String },
}

#[derive(clap::Args)]
struct QueryArgs {
  /// Relation to load eagerly; dotted paths load nested relations.
  #[arg(short, long = "relation")]
  relations: Vec<String>,

  /// `prop=value` equality filter on the root class. Values are read as
  /// JSON when they parse, as text otherwise.
  #[arg(short, long = "where")]
  filters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Settings {
  /// SQLite database file.
  database: PathBuf,
  /// JSON file holding the schema definition.
  schema:   PathBuf,
  #[serde(default)]
  orm:      OrmConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let settings: Settings = config::Config::builder()
    .add_source(config::File::from(cli.config).required(false))
    .add_source(config::Environment::with_prefix("TETHER").prefix_separator("_").separator("__"))
    .build()
    .context("failed to read config file")?
    .try_deserialize()
    .context("failed to deserialise settings")?;

  let def = load_schema(&settings.schema)?;

  match cli.command {
    Command::Ddl { dialect } => {
      let schema = Schema::build(def, settings.orm.id_type_default)?;
      for statement in create_statements(&schema, dialect) {
        println!("{};", statement.sql);
      }
    }
    Command::Sql { class, query, dialect } => {
      let schema = Schema::build(def, settings.orm.id_type_default)?;
      let compiled = compile_find(&schema, dialect, &class, &query.find()?)?;
      println!("{}", compiled.sql);
      for (i, param) in compiled.params.iter().enumerate() {
        println!("-- {}: {param}", i + 1);
      }
    }
    Command::Find { class, query } => {
      let orm = open(&settings, def).await?;
      let found = orm.find(&class, query.find()?).await?;
      let json = found.iter().map(|e| e.to_json()).collect::<Result<Vec<_>, _>>()?;
      println!("{}", serde_json::to_string_pretty(&json)?);
    }
    Command::Referencers { class, id } => {
      let orm = open(&settings, def).await?;
      let kind = orm.schema().root(&class)?.id_type;
      let id: EntityId = kind.id_from_json(&read_json(&id))?;
      let Some(entity) = orm.find(&class, Find::new().where_eq("id", id)).await?.into_iter().next() else {
        bail!("no {class} with id {id}");
      };
      for group in orm.list_referencers(&entity).await? {
        let ids: Vec<String> = group.entities.iter().map(|e| e.id().to_string()).collect();
        println!("{} via {}: [{}]", group.class, group.properties.join(", "), ids.join(", "));
      }
    }
  }

  Ok(())
}

impl QueryArgs {
  fn find(&self) -> anyhow::Result<Find> {
    let mut find = Find::new();
    for path in &self.relations {
      find = find.relation_path(path);
    }
    for filter in &self.filters {
      let Some((prop, raw)) = filter.split_once('=') else {
        bail!("filter {filter:?} is not of the form prop=value");
      };
      find = find.where_eq(prop.trim(), json_value(read_json(raw.trim())));
    }
    Ok(find)
  }
}

fn read_json(raw: &str) -> serde_json::Value {
  serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_owned()))
}

fn json_value(json: serde_json::Value) -> Value {
  use serde_json::Value as J;
  match json {
    J::Null => Value::Null,
    J::Bool(b) => Value::Bool(b),
    J::Number(n) => match n.as_i64() {
      Some(i) => i32::try_from(i).map_or(Value::BigInt(i), Value::Int),
      None => n.as_f64().map_or(Value::Null, Value::Float),
    },
    J::String(s) => Value::Text(s),
    J::Array(items) => Value::Array(items.into_iter().map(json_value).collect()),
    other @ J::Object(_) => Value::Json(other),
  }
}

fn load_schema(path: &Path) -> anyhow::Result<SchemaDef> {
  let text = fs::read_to_string(path).with_context(|| format!("failed to read schema at {path:?}"))?;
  serde_json::from_str(&text).with_context(|| format!("failed to parse schema at {path:?}"))
}

async fn open(settings: &Settings, def: SchemaDef) -> anyhow::Result<Orm> {
  let conn = SqliteConnection::open(&settings.database)
    .await
    .with_context(|| format!("failed to open database at {:?}", settings.database))?;
  Orm::boot(settings.orm.clone(), def, Arc::new(conn)).await.context("failed to boot")
}
