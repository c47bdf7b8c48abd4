//! Layered configuration for the `skirmish` binary.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use skirmish_core::config::DetectionConfig;

/// Everything the binary reads from `skirmish.toml` and `SKIRMISH_*`.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  #[serde(default)]
  pub detection:  DetectionConfig,
}

fn default_store_path() -> PathBuf { PathBuf::from("skirmish.db") }

impl CliConfig {
  /// File first, then environment. Nested keys use a double underscore, e.g.
  /// `SKIRMISH_DETECTION__MIN_DENSITY=20`.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("SKIRMISH")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read config file")?;

    let mut cfg: CliConfig = settings
      .try_deserialize()
      .context("failed to deserialise CliConfig")?;
    cfg.store_path = expand_tilde(&cfg.store_path);
    Ok(cfg)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
