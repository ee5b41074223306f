use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::quality::QualityLadder;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Archive channel every delivered file is mirrored to.
    #[serde(alias = "LOG_CHANNEL", alias = "log_channel")]
    pub log_channel: i64,
    /// SQLite file for auto-rename sessions; sessions stay in memory when unset.
    #[serde(alias = "SESSION_DB", alias = "session_db")]
    pub session_db: Option<String>,
    #[serde(alias = "WORK_DIR", alias = "work_dir", default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(alias = "QUALITY_LADDER", alias = "quality_ladder", default)]
    pub quality_ladder: QualityLadder,
    #[serde(
        alias = "MAX_CONCURRENT_JOBS",
        alias = "max_concurrent_jobs",
        default = "default_max_jobs"
    )]
    pub max_concurrent_jobs: usize,
    #[serde(alias = "RENAME_METADATA", alias = "rename_metadata")]
    pub rename_metadata: Option<String>,
    #[serde(alias = "ADMINS", alias = "admins", default)]
    pub admins: Vec<i64>,
    #[serde(alias = "LOG_LEVEL", alias = "log_level")]
    pub log_level: Option<String>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_jobs() -> usize {
    6
}

impl Config {
    /// Reads the file named by `CONFIG_PATH` (default `config.json`).
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
        load_config(&path)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("invalid config JSON")
    }
}

pub fn load_config(path: &str) -> Result<Config> {
    let raw = fs::read_to_string(path).with_context(|| format!("cannot read config: {}", path))?;
    let cfg: Config =
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path))?;
    Ok(cfg)
}
