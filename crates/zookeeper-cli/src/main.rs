use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use zookeeper_api::AnimalCatalog;
use zookeeper_core::{
    integrity_check, FilterCriteria, FIELD_DIET, FIELD_NAME, FIELD_PERSONALITY_TRAITS,
    FIELD_SPECIES,
};
use zookeeper_store_json::JsonFileStore;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "zk")]
#[command(about = "Zookeeper animal catalog CLI")]
struct Cli {
    #[arg(long, env = "ZOOKEEPER_DATA", default_value = "./data/animals.json")]
    data: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List animals, optionally narrowed by attribute.
    List(ListArgs),
    /// Show one animal by id.
    Show(ShowArgs),
    /// Create an animal and rewrite the data file.
    Add(AddArgs),
    /// Report duplicate ids and malformed records in the data file.
    Check,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    species: Option<String>,
    #[arg(long)]
    diet: Option<String>,
    #[arg(long = "trait")]
    traits: Vec<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    id: String,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    species: String,
    #[arg(long)]
    diet: String,
    #[arg(long = "trait")]
    traits: Vec<String>,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::List(args) => run_list(&AnimalCatalog::open(&cli.data)?, args),
        Command::Show(args) => run_show(&AnimalCatalog::open(&cli.data)?, &args),
        Command::Add(args) => run_add(&AnimalCatalog::open(&cli.data)?, args),
        Command::Check => run_check(&JsonFileStore::new(cli.data)),
    }
}

fn run_list(catalog: &AnimalCatalog, args: ListArgs) -> Result<()> {
    let criteria = FilterCriteria {
        personality_traits: args.traits,
        diet: args.diet,
        species: args.species,
        name: args.name,
        ..FilterCriteria::default()
    };
    let animals = catalog.list(&criteria);
    emit_json(serde_json::json!({ "animals": animals }))
}

fn run_show(catalog: &AnimalCatalog, args: &ShowArgs) -> Result<()> {
    let animal = catalog.get(&args.id)?;
    emit_json(serde_json::to_value(&animal).context("failed to serialize animal")?)
}

fn run_add(catalog: &AnimalCatalog, args: AddArgs) -> Result<()> {
    let mut body = serde_json::Map::new();
    body.insert(FIELD_NAME.to_string(), Value::String(args.name));
    body.insert(FIELD_SPECIES.to_string(), Value::String(args.species));
    body.insert(FIELD_DIET.to_string(), Value::String(args.diet));
    body.insert(
        FIELD_PERSONALITY_TRAITS.to_string(),
        Value::Array(args.traits.into_iter().map(Value::String).collect()),
    );

    let animal = catalog.create_from_value(Value::Object(body))?;
    emit_json(serde_json::to_value(&animal).context("failed to serialize animal")?)
}

fn run_check(store: &JsonFileStore) -> Result<()> {
    let animals = store.load()?;
    let report = integrity_check(&animals);
    let clean = report.is_clean();
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)?;
    if clean {
        Ok(())
    } else {
        Err(anyhow!("animals file {} failed integrity check", store.path().display()))
    }
}
