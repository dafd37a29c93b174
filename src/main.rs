use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use softcascade::time::format_ms;
use softcascade::{
    cleanup, db, logging, AppError, Collector, DeletionMethod, Mode, PolicyOverrides, RecordKey,
    Schema, Settings,
};

#[derive(Debug, Parser)]
#[command(name = "softcascade", about = "Cascading soft deletion for SQLite", version)]
struct Cli {
    /// Database file (defaults to $SOFTCASCADE_DB)
    #[arg(long, value_name = "PATH", global = true)]
    db: Option<PathBuf>,

    /// Schema JSON describing models and relations (defaults to $SOFTCASCADE_SCHEMA)
    #[arg(long, value_name = "PATH", global = true)]
    schema: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Remove already soft-deleted rows (and everything cascading from them).
    Cleanup {
        /// Models to clean up.
        models: Vec<String>,
        /// Model to leave alone (repeatable).
        #[arg(short, long, value_name = "MODEL")]
        exclude: Vec<String>,
        /// Clean up every soft-deletable model.
        #[arg(short, long)]
        all: bool,
        /// Do not ask for confirmation.
        #[arg(long)]
        noinput: bool,
    },
    /// Soft-delete records and cascade to their dependents.
    Delete {
        model: String,
        #[arg(required = true)]
        pks: Vec<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Clear the deletion timestamp of records. Does not cascade.
    Undelete {
        model: String,
        #[arg(required = true)]
        pks: Vec<i64>,
        #[arg(long)]
        json: bool,
    },
    /// Show what a deletion would do without changing anything.
    Plan {
        model: String,
        #[arg(required = true)]
        pks: Vec<i64>,
        /// Plan a physical purge instead of a soft deletion.
        #[arg(long)]
        purge: bool,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    logging::init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            let app_error = AppError::from(err);
            eprintln!("Error: {app_error}");
            let mut cause = app_error.cause();
            while let Some(inner) = cause {
                eprintln!("  caused by: {inner}");
                cause = inner.cause();
            }
            process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let settings = Settings::from_env().with_overrides(cli.db, cli.schema);
    let schema_path = settings
        .schema_path
        .clone()
        .ok_or_else(|| anyhow!("no schema given: pass --schema or set SOFTCASCADE_SCHEMA"))?;
    let db_path = settings
        .db_path
        .clone()
        .ok_or_else(|| anyhow!("no database given: pass --db or set SOFTCASCADE_DB"))?;

    let schema = Schema::load(&schema_path).map_err(AppError::from)?;
    let pool = db::open_sqlite_pool(&db_path)
        .await
        .with_context(|| format!("open database {}", db_path.display()))?;
    let collector = Collector::new(pool.clone(), Arc::new(schema)).with_config(settings.collector);

    let result = dispatch(&collector, cli.command).await;
    pool.close().await;
    result
}

async fn dispatch(collector: &Collector, command: Command) -> Result<i32> {
    match command {
        Command::Cleanup {
            models,
            exclude,
            all,
            noinput,
        } => handle_cleanup(collector, &models, &exclude, all, noinput).await,
        Command::Delete { model, pks, json } => {
            let report = collector
                .delete_keys(&model, &pks)
                .await
                .map_err(AppError::from)?;
            if json {
                print_json(&report)?;
            } else {
                for outcome in &report.outcomes {
                    println!("{}\t{}", outcome.key, outcome.method.as_str());
                }
                println!(
                    "{} soft-deleted at {}, {} removed, {} untouched",
                    report.count(DeletionMethod::SoftDelete),
                    format_ms(report.deleted_at),
                    report.count(DeletionMethod::HardDelete),
                    report.count(DeletionMethod::Skip)
                );
            }
            Ok(0)
        }
        Command::Undelete { model, pks, json } => {
            let keys: Vec<RecordKey> = pks.iter().map(|pk| RecordKey::new(&model, *pk)).collect();
            let restored = collector
                .undelete_keys(&keys)
                .await
                .map_err(AppError::from)?;
            if json {
                print_json(&json!({ "model": model, "restored": restored }))?;
            } else {
                println!("{restored} record(s) restored");
            }
            Ok(0)
        }
        Command::Plan {
            model,
            pks,
            purge,
            json,
        } => {
            let roots: Vec<RecordKey> = pks.iter().map(|pk| RecordKey::new(&model, *pk)).collect();
            let mode = if purge { Mode::Purge } else { Mode::Logical };
            let plan = collector
                .plan(&roots, mode, &PolicyOverrides::default())
                .await
                .map_err(AppError::from)?;
            if json {
                print_json(&plan)?;
            } else {
                for outcome in &plan.outcomes {
                    println!("{}\t{}", outcome.key, outcome.method.as_str());
                }
                for key in &plan.protected {
                    println!("{key}\tprotected");
                }
            }
            Ok(if plan.protected.is_empty() { 0 } else { 2 })
        }
    }
}

async fn handle_cleanup(
    collector: &Collector,
    models: &[String],
    exclude: &[String],
    all: bool,
    noinput: bool,
) -> Result<i32> {
    let selected = cleanup::select_models(collector.schema(), models, exclude, all)
        .map_err(AppError::from)?;

    if !noinput && !confirm_cleanup()? {
        println!("Cleanup cancelled.");
        return Ok(0);
    }

    let done = cleanup::purge_deleted(collector, &selected)
        .await
        .map_err(AppError::from)
        .context("unable to clean up database")?;
    for entry in &done {
        println!(
            "Handled model {}: {} row(s) removed",
            entry.model, entry.stats.hard_deleted
        );
    }
    Ok(0)
}

fn confirm_cleanup() -> Result<bool> {
    print!(
        "You have requested removal of soft-deleted rows.\n\
         This will IRREVERSIBLY DELETE them and every related row in the selected models.\n\
         Type 'yes' to continue, or 'no' to cancel: "
    );
    io::stdout().flush().context("flush prompt")?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(answer.trim() == "yes")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{serialized}");
    Ok(())
}
