use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;
use miette::{Context, IntoDiagnostic, Result};

use recordb::{
    config::{default_root, StoreConfig},
    engine::StorageEngine,
    value::Value,
};

#[derive(Parser, Debug)]
#[command(name = "recordb", version, about, long_about = None)]
struct Cli {
    /// Path to the storage directory (defaults to $HOME/.recordb)
    #[arg(global = true, short, long)]
    dir: Option<PathBuf>,

    /// Sync files to disk after every write session
    #[arg(global = true, long)]
    sync: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stored entities
    #[command(alias = "ls")]
    Entities,

    /// Show the schema of an entity
    Schema { entity: String },

    /// Show dead space in an entity's files
    #[command(alias = "st")]
    Stats { entity: String },

    /// Compact an entity's files
    Defrag { entity: String },

    /// Look up records through a persisted index
    #[command(alias = "l")]
    Lookup {
        entity: String,
        index: String,
        value: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let root = cli.dir.unwrap_or_else(default_root);
    let config = StoreConfig::new(root.clone()).with_sync_writes(cli.sync);
    let engine = StorageEngine::open(config)
        .into_diagnostic()
        .wrap_err_with(|| format!("could not open storage at {:?}", root))?;

    match cli.command {
        Command::Entities => {
            let entities = engine
                .entities()
                .into_diagnostic()
                .wrap_err("failed to list entities")?;
            if entities.is_empty() {
                warn(&format!("no entities in {:?}", root));
            }
            for entity in entities {
                info(&entity);
            }
        }
        Command::Schema { entity } => {
            let schema = engine
                .schema(&entity)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to read schema of {entity}"))?;
            let key = schema.primary_key();
            info(&format!(
                "{} (key #{} {}: {:?})",
                schema.name(),
                key.number,
                key.name,
                key.field_type
            ));
            for field in schema.fields() {
                let compressed = if field.compressed { ", compressed" } else { "" };
                println!(
                    "  #{} {}: {:?}{}",
                    field.number, field.name, field.field_type, compressed
                );
            }
        }
        Command::Stats { entity } => {
            let stats = engine
                .statistics(&entity)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to compute statistics of {entity}"))?;
            info(&format!(
                "{entity}: {} live, {} deleted",
                stats.live_records, stats.deleted_records
            ));
            for file in [&stats.primary_key, &stats.data] {
                if file.dead_bytes > 0 {
                    warn(&file.to_string());
                } else {
                    info(&file.to_string());
                }
            }
        }
        Command::Defrag { entity } => {
            let report = engine
                .defragment(&entity)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to defragment {entity}"))?;
            success(&format!(
                "defragmented {entity}: {} records, pk {} -> {} bytes, data {} -> {} bytes",
                report.records,
                report.primary_key_bytes_before,
                report.primary_key_bytes_after,
                report.data_bytes_before,
                report.data_bytes_after
            ));
        }
        Command::Lookup {
            entity,
            index,
            value,
        } => {
            let loaded = engine
                .load_index(&entity, &index)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to load index {entity}.{index}"))?;
            let value = Value::parse(loaded.metadata().field_type, &value)
                .into_diagnostic()
                .wrap_err_with(|| format!("invalid value for index {index}"))?;

            match loaded.get_equals(&value) {
                Some(lookup) => {
                    info(&format!(
                        "{} = {}: {} item(s)",
                        index,
                        lookup.indexed_value,
                        lookup.items.len()
                    ));
                    let included = &loaded.metadata().included_fields;
                    for item in lookup.items {
                        let fields: Vec<String> = included
                            .iter()
                            .zip(&item.included_fields)
                            .map(|(number, value)| format!("#{number}={value}"))
                            .collect();
                        println!("  {} {}", item.primary_key, fields.join(" "));
                    }
                }
                None => warn(&format!("no {entity} with {index} = {value}")),
            }
        }
    }

    Ok(())
}

fn success(msg: &str) {
    println!("{} {}", "✔".bright_green().bold(), msg.normal());
}

fn warn(msg: &str) {
    eprintln!("{} {}", "⚠".bright_yellow().bold(), msg.yellow());
}

fn info(msg: &str) {
    println!("{} {}", "➤".bright_cyan().bold(), msg.cyan());
}
