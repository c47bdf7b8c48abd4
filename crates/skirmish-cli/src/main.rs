//! `skirmish`: battle detection jobs over a SQLite killmail store.
//!
//! # Usage
//!
//! ```
//! skirmish import-systems universe.json
//! skirmish import-killmails killmails.jsonl
//! skirmish backfill --from 2024-03-01T00:00:00Z --to 2024-03-08T00:00:00Z
//! skirmish trailing
//! skirmish show 3f1c0a9e2b7d4c5e6f708192
//! ```
//!
//! Settings come from `skirmish.toml` (or `--config`) and `SKIRMISH_*`
//! environment variables.

mod config;

use std::{
  fs::File,
  io::{BufRead, BufReader},
  path::{Path, PathBuf},
};

use anyhow::{Context as _, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use skirmish_core::{
  battle::SystemInfo,
  detector::{Detector, JobSummary},
  killmail::{EntityId, Killmail},
  store::BattleStore,
};
use skirmish_store_sqlite::SqliteStore;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

/// Killmails written per transaction during import.
const IMPORT_BATCH: usize = 1000;

#[derive(Parser)]
#[command(author, version, about = "Detect battles in a killmail store")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "skirmish.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Detect battles starting in `[from, to)`.
  Backfill {
    #[arg(long)]
    from: DateTime<Utc>,
    #[arg(long)]
    to:   DateTime<Utc>,
  },
  /// Detect battles in the trailing window ending one lag before now.
  Trailing,
  /// Load killmails from a file with one JSON killmail per line.
  ImportKillmails { path: PathBuf },
  /// Load solar systems and item type names from a JSON file.
  ImportSystems { path: PathBuf },
  /// Print a stored battle as JSON.
  Show { battle_id: String },
}

/// Shape of the `import-systems` file.
#[derive(Deserialize)]
struct ReferenceFile {
  #[serde(default)]
  systems:    Vec<SystemInfo>,
  #[serde(default)]
  item_types: Vec<ItemType>,
}

#[derive(Deserialize)]
struct ItemType {
  type_id: EntityId,
  name:    String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  let cfg = CliConfig::load(&cli.config)?;

  let store = SqliteStore::open(&cfg.store_path)
    .await
    .with_context(|| format!("failed to open store at {:?}", cfg.store_path))?;

  match cli.command {
    Command::Backfill { from, to } => {
      if from >= to {
        bail!("--from ({from}) must be before --to ({to})");
      }
      let detector = Detector::new(store.clone(), store.clone(), store, cfg.detection);
      let summary = detector.run_range(from, to).await.context("backfill failed")?;
      print_summary(&summary)?;
    }
    Command::Trailing => {
      let detector = Detector::new(store.clone(), store.clone(), store, cfg.detection);
      let summary = detector.run_trailing().await.context("trailing job failed")?;
      print_summary(&summary)?;
    }
    Command::ImportKillmails { path } => import_killmails(&store, &path).await?,
    Command::ImportSystems { path } => import_systems(&store, &path).await?,
    Command::Show { battle_id } => {
      let battle = store
        .get(&battle_id)
        .await
        .context("failed to read battle")?
        .with_context(|| format!("no battle with id {battle_id}"))?;
      println!("{}", serde_json::to_string_pretty(&battle)?);
    }
  }

  Ok(())
}

fn print_summary(summary: &JobSummary) -> anyhow::Result<()> {
  println!("{}", serde_json::to_string_pretty(summary)?);
  Ok(())
}

async fn import_killmails(store: &SqliteStore, path: &Path) -> anyhow::Result<()> {
  let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;

  let mut batch: Vec<Killmail> = Vec::with_capacity(IMPORT_BATCH);
  let mut inserted = 0;
  let mut rejected = 0;
  for (n, line) in BufReader::new(file).lines().enumerate() {
    let line = line.with_context(|| format!("failed to read {}", path.display()))?;
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str::<Killmail>(&line) {
      Ok(killmail) => batch.push(killmail),
      Err(e) => {
        warn!(line = n + 1, error = %e, "skipping unparseable killmail");
        rejected += 1;
      }
    }
    if batch.len() >= IMPORT_BATCH {
      inserted += store.insert_killmails(&batch).await.context("failed to store killmails")?;
      batch.clear();
    }
  }
  if !batch.is_empty() {
    inserted += store.insert_killmails(&batch).await.context("failed to store killmails")?;
  }

  info!(inserted, rejected, "imported killmails");
  Ok(())
}

async fn import_systems(store: &SqliteStore, path: &Path) -> anyhow::Result<()> {
  let raw = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read {}", path.display()))?;
  let file: ReferenceFile = serde_json::from_str(&raw).context("failed to parse reference file")?;

  store
    .upsert_systems(&file.systems)
    .await
    .context("failed to store systems")?;
  let types: Vec<(EntityId, String)> = file
    .item_types
    .into_iter()
    .map(|t| (t.type_id, t.name))
    .collect();
  store
    .upsert_item_types(&types)
    .await
    .context("failed to store item types")?;

  info!(systems = file.systems.len(), item_types = types.len(), "imported reference data");
  Ok(())
}
