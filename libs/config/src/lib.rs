//! Node Settings Loading
//!
//! Provides configuration loading for taskgrid nodes. A node starts from a
//! named profile (a TOML file under `config/`) and layers overrides on top:
//! environment variables with the `TASKGRID_` prefix, then a programmatic
//! override map supplied by the bootstrap path. Later sources win on key
//! collision.
//!
//! A missing profile file is a hard error: a node without its base profile
//! must not come up at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Well-known default listener port, shared by every node in the cluster.
pub const DEFAULT_PORT: u16 = 10086;

/// Prefix recognized for environment overrides (`TASKGRID_PORT`, `TASKGRID_HOST`).
pub const ENV_PREFIX: &str = "TASKGRID";

/// Effective per-node settings after profile and override merging.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSettings {
    /// Address to advertise and bind. Discovered from the routing table at
    /// bootstrap when unset.
    pub host: Option<String>,

    /// Listener port.
    pub port: u16,
}

/// Load settings for a named profile from `config/<profile>.toml`.
pub fn load_profile(profile: &str, overrides: &HashMap<String, String>) -> Result<NodeSettings> {
    let path = PathBuf::from("config").join(format!("{profile}.toml"));
    load_from(&path, overrides)
}

/// Load settings from an explicit profile path.
///
/// Merge order, lowest to highest precedence: built-in defaults, the profile
/// file, `TASKGRID_*` environment variables, the override map.
pub fn load_from(path: &Path, overrides: &HashMap<String, String>) -> Result<NodeSettings> {
    debug!(path = %path.display(), "loading node settings");

    let mut builder = Config::builder()
        .set_default("port", i64::from(DEFAULT_PORT))
        .context("failed to seed default settings")?
        .add_source(File::from(path).required(true))
        .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

    for (key, value) in overrides {
        builder = builder
            .set_override(key.as_str(), value.as_str())
            .with_context(|| format!("invalid override for settings key '{key}'"))?;
    }

    let merged = builder
        .build()
        .with_context(|| format!("failed to load settings profile {}", path.display()))?;

    let settings: NodeSettings = merged
        .try_deserialize()
        .context("failed to deserialize node settings")?;

    info!(port = settings.port, host = ?settings.host, "node settings loaded");
    Ok(settings)
}
