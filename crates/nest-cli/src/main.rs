//! Nest CLI - Nurse Nest profile metadata sync
//!
//! Commands:
//! - nest sync                    - Reconcile nurse + client metadata
//! - nest sync --kind nurse       - Reconcile one profile table
//! - nest sync-user <kind> <id>   - Repair a single user
//! - nest import <table> <file>   - Load JSON rows into the local store
//! - nest config show|init|path   - Manage ~/.nurse-nest/config.json

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use nest_core::config::{get_config_path, load_config, save_config};
use nest_core::{
    open_store, Backend, NestConfig, ProfileKind, RecordStore, Reconciler, Row, SledStore,
    StoreError, SyncSummary,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Nest - profile metadata sync for Nurse Nest
#[derive(Parser)]
#[command(name = "nest", version, about = "Nurse Nest profile metadata sync")]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy missing names/phones from profiles into user metadata
    Sync {
        /// Only this profile kind (nurse or client); default both
        #[arg(short, long)]
        kind: Option<ProfileKind>,
        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,
        /// Create metadata rows for profiles that have none
        #[arg(long)]
        create_missing: bool,
        /// Override the configured backend (rest or local)
        #[arg(short, long)]
        backend: Option<Backend>,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Repair the metadata of one user
    SyncUser {
        /// Profile kind (nurse or client)
        kind: ProfileKind,
        /// User reference
        user_id: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        backend: Option<Backend>,
    },
    /// Import a JSON array of rows into a table of the local store
    Import {
        /// Target table (e.g. nurse_profiles, user_metadata)
        table: String,
        /// JSON file holding an array of row objects
        file: PathBuf,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current config (service key masked)
    Show,
    /// Create or update the config interactively
    Init,
    /// Print the config file location
    Path,
}

/// Default log filter for a `-v` count (RUST_LOG wins when set)
fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn init_tracing(verbose: u8) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Sync {
            kind,
            dry_run,
            create_missing,
            backend,
            json,
        } => {
            let store = connect(backend)?;
            let ok = run_sync(store, kind, dry_run, create_missing, json).await?;
            if !ok {
                std::process::exit(1);
            }
        }

        Commands::SyncUser {
            kind,
            user_id,
            dry_run,
            backend,
        } => {
            let store = connect(backend)?;
            let reconciler = Reconciler::new(store).dry_run(dry_run);

            match reconciler.reconcile_user(kind, &user_id).await {
                Ok(true) if dry_run => println!("📝 {} {} would be patched", kind, user_id),
                Ok(true) => println!("✅ {} {} patched", kind, user_id),
                Ok(false) => println!("✓ {} {} already up to date", kind, user_id),
                Err(e) => {
                    println!("❌ {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Import { table, file } => {
            let config = load_config()?;
            let store = SledStore::open(&config.store.local_path)?;
            run_import(&store, &table, &file).await?;
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let config = load_config()?;
                let shown = NestConfig {
                    store: config.store.redacted(),
                };
                println!("{}", serde_json::to_string_pretty(&shown)?);

                if config.store.backend == Backend::Local && config.store.local_path.exists() {
                    let store = SledStore::open(&config.store.local_path)?;
                    let (rows, bytes) = store.stats()?;
                    println!();
                    println!("📦 Local store: {}", store_summary(&store.tables(), rows, bytes));
                }
            }
            ConfigAction::Init => {
                init_config()?;
            }
            ConfigAction::Path => {
                println!("{}", get_config_path().display());
            }
        },
    }

    Ok(())
}

/// Open the configured store, optionally forcing a backend
fn connect(backend: Option<Backend>) -> Result<Arc<dyn RecordStore>> {
    let mut config = load_config()?;
    if let Some(backend) = backend {
        config.store.backend = backend;
    }
    open_store(&config.store)
}

/// Run reconciliation and print the summary; returns the success flag
async fn run_sync(
    store: Arc<dyn RecordStore>,
    kind: Option<ProfileKind>,
    dry_run: bool,
    create_missing: bool,
    json: bool,
) -> Result<bool> {
    let start = Instant::now();
    let backend = store.name();
    let reconciler = Reconciler::new(store)
        .dry_run(dry_run)
        .create_missing(create_missing);

    if !json {
        let scope = sync_scope(kind);
        println!("🩺 nest sync ({}){}", scope, if dry_run { " [dry run]" } else { "" });
        println!("   Store: {}", backend);
        println!();
    }

    let summary = match kind {
        Some(kind) => SyncSummary::collect([(kind, reconciler.reconcile(kind).await)]),
        None => reconciler.reconcile_all().await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, start);
    }

    Ok(summary.success)
}

/// Human label for the profile kinds a sync covers
fn sync_scope(kind: Option<ProfileKind>) -> String {
    let kinds: Vec<ProfileKind> = match kind {
        Some(kind) => vec![kind],
        None => ProfileKind::ALL.to_vec(),
    };
    kinds
        .iter()
        .map(|k| format!("{}s", k))
        .collect::<Vec<_>>()
        .join(" + ")
}

/// One-line description of the local sled snapshot
fn store_summary(tables: &[String], rows: usize, bytes: u64) -> String {
    let tables = if tables.is_empty() {
        "no tables".to_string()
    } else {
        tables.join(", ")
    };
    format!("{} rows, {:.1} KB on disk ({})", rows, bytes as f64 / 1024.0, tables)
}

fn print_summary(summary: &SyncSummary, start: Instant) {
    for report in [&summary.nurses, &summary.clients].into_iter().flatten() {
        println!(
            "✓ {}: {} scanned, {} {}, {} skipped, {} errors",
            report.kind.table(),
            report.scanned,
            report.patched,
            if report.dry_run { "to patch" } else { "patched" },
            report.skipped,
            report.errors.len()
        );
    }

    if !summary.errors.is_empty() {
        println!();
        println!("⚠️  Errors ({}):", summary.errors.len());
        for err in &summary.errors {
            println!("   • {}", err);
        }
    }

    println!();
    let elapsed = start.elapsed();
    if summary.success {
        println!(
            "✅ Done in {:?}: {} patched, {} skipped, {} errors",
            elapsed,
            summary.patched,
            summary.skipped,
            summary.errors.len()
        );
    } else {
        println!("❌ Sync incomplete in {:?}: a profile listing failed", elapsed);
    }
}

/// Parse an import file: a JSON array of objects
fn read_rows(file: &Path) -> Result<Vec<Row>> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| anyhow!("Cannot read {}: {}", file.display(), e))?;
    let rows: Vec<Row> = serde_json::from_str(&content)
        .map_err(|e| anyhow!("{} is not a JSON array of objects: {}", file.display(), e))?;
    Ok(rows)
}

async fn run_import(store: &SledStore, table: &str, file: &Path) -> Result<()> {
    let rows = read_rows(file)?;
    println!("📥 Importing {} rows into {}", rows.len(), table);

    let mut inserted = 0;
    let mut duplicates = 0;

    for row in rows {
        match store.insert(table, row).await {
            Ok(_) => inserted += 1,
            Err(StoreError::Duplicate { id, .. }) => {
                tracing::debug!("Skipping existing row {}", id);
                duplicates += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!("✅ {} inserted, {} already present", inserted, duplicates);
    Ok(())
}

/// Interactive config setup
fn init_config() -> Result<()> {
    use dialoguer::{Input, Password, Select};

    let mut config = load_config()?;

    let backends = ["rest (hosted database)", "local (sled snapshot)"];
    let current = match config.store.backend {
        Backend::Rest => 0,
        Backend::Local => 1,
    };
    let choice = Select::new()
        .with_prompt("Store backend")
        .items(&backends)
        .default(current)
        .interact()?;

    if choice == 0 {
        config.store.backend = Backend::Rest;
        config.store.url = Input::<String>::new()
            .with_prompt("Project URL")
            .with_initial_text(config.store.url.clone())
            .interact_text()?;

        let key = Password::new()
            .with_prompt("Service key (empty = keep current)")
            .allow_empty_password(true)
            .interact()?;
        if !key.is_empty() {
            config.store.service_key = key;
        }
    } else {
        config.store.backend = Backend::Local;
        let path = Input::<String>::new()
            .with_prompt("Local store path")
            .with_initial_text(config.store.local_path.display().to_string())
            .interact_text()?;
        config.store.local_path = PathBuf::from(path);
    }

    save_config(&config)?;
    println!("✅ Config saved to {}", get_config_path().display());
    Ok(())
}
