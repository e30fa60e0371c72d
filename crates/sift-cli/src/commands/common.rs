//! Shared utilities for commands
//!
//! This module contains:
//! - `default_data_path` - Where the expense store lives by default
//! - `open_store` - Open the JSON expense store
//! - `load_config` - Resolve the pipeline config
//! - `read_transcript` - Load a transcript file

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sift_core::{parse_transcript, PipelineConfig, Transcript};

use crate::store::JsonFileStore;

/// `<data dir>/sift/expenses.json`, or `./sift-expenses.json` when the
/// platform has no data directory
pub fn default_data_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("sift").join("expenses.json"))
        .unwrap_or_else(|| PathBuf::from("sift-expenses.json"))
}

pub fn open_store(data: &Path) -> Result<Arc<JsonFileStore>> {
    let store = JsonFileStore::open(data)
        .with_context(|| format!("Failed to open expense store {}", data.display()))?;
    Ok(Arc::new(store))
}

pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    PipelineConfig::load(path).context("Failed to load pipeline config")
}

pub fn read_transcript(path: &Path) -> Result<Transcript> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read transcript {}", path.display()))?;
    parse_transcript(&content)
        .with_context(|| format!("Failed to parse transcript {}", path.display()))
}

pub fn read_artifact(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Last modification time, used as a fallback invoice date
pub fn file_modified(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}

pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
