//! Pipeline configuration
//!
//! Resolution order:
//! 1. An explicit path, or `~/.local/share/sift/config/pipeline.toml`
//! 2. The embedded default (`config/pipeline.toml`)
//! 3. `SIFT_*` environment variables on top of whichever file was loaded
//!
//! Keys missing from a file keep their built-in defaults, so an override
//! file only needs the values it changes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::categorize::{CategorizerConfig, KeywordTable};
use crate::duplicate::DuplicateConfig;
use crate::error::{Error, Result};
use crate::extract::ExtractorConfig;
use crate::pipeline::TaskConfig;
use crate::validation::ValidationConfig;

/// Default configuration embedded at compile time
const DEFAULT_CONFIG: &str = include_str!("../config/pipeline.toml");

/// Everything the pipeline and its engines can be tuned with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub extractor: ExtractorConfig,
    pub categorizer: CategorizerConfig,
    pub duplicate: DuplicateConfig,
    pub tasks: TaskConfig,
    pub validation: ValidationConfig,
}

impl PipelineConfig {
    /// Load from `path` or the default override location, then apply env
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = load_config(path)?;
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// The embedded default, without env overrides
    pub fn embedded() -> Result<Self> {
        parse_config(DEFAULT_CONFIG)
    }

    /// Built-in defaults plus env overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `SIFT_*` overrides read through `lookup`
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(workers) = env_value::<usize, _>(&lookup, "SIFT_WORKERS")? {
            if workers == 0 {
                return Err(Error::Config("SIFT_WORKERS must be at least 1".into()));
            }
            self.tasks.workers = workers;
        }
        if let Some(secs) = env_value(&lookup, "SIFT_TASK_TIMEOUT_SECS")? {
            self.tasks.hard_timeout_secs = secs;
        }
        if let Some(secs) = env_value(&lookup, "SIFT_TASK_SOFT_TIMEOUT_SECS")? {
            self.tasks.soft_timeout_secs = secs;
        }
        if let Some(secs) = env_value(&lookup, "SIFT_RESULT_RETENTION_SECS")? {
            self.tasks.retention_secs = secs;
        }
        if let Some(threshold) = env_value::<u8, _>(&lookup, "SIFT_DUPLICATE_THRESHOLD")? {
            if threshold > 100 {
                return Err(Error::Config(
                    "SIFT_DUPLICATE_THRESHOLD must be between 0 and 100".into(),
                ));
            }
            self.duplicate.blocking_threshold = threshold;
        }
        if let Some(days) = env_value::<i64, _>(&lookup, "SIFT_FUTURE_TOLERANCE_DAYS")? {
            if days < 0 {
                return Err(Error::Config(
                    "SIFT_FUTURE_TOLERANCE_DAYS must not be negative".into(),
                ));
            }
            self.validation.future_tolerance_days = days;
        }
        if self.tasks.soft_timeout_secs > self.tasks.hard_timeout_secs {
            warn!(
                soft = self.tasks.soft_timeout_secs,
                hard = self.tasks.hard_timeout_secs,
                "Soft task timeout is longer than the hard timeout and will never fire"
            );
        }
        Ok(())
    }
}

fn env_value<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("Invalid {}='{}': {}", key, raw, e))),
        _ => Ok(None),
    }
}

/// Location of the user override file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("sift").join("config").join("pipeline.toml"))
}

/// Load configuration (override first, then default)
fn load_config(override_path: Option<&Path>) -> Result<PipelineConfig> {
    let path = match override_path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };

    let content = match path {
        Some(ref path) if path.exists() => {
            debug!(path = %path.display(), "Loading pipeline config");
            fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?
        }
        Some(ref path) if override_path.is_some() => {
            warn!(path = %path.display(), "Config file not found, using built-in defaults");
            DEFAULT_CONFIG.to_string()
        }
        _ => DEFAULT_CONFIG.to_string(),
    };

    parse_config(&content)
}

/// Raw config structure for TOML parsing
#[derive(Debug, Deserialize)]
struct RawConfig {
    extractor: Option<RawExtractor>,
    categorizer: Option<RawCategorizer>,
    duplicate: Option<RawDuplicate>,
    tasks: Option<RawTasks>,
    validation: Option<RawValidation>,
}

#[derive(Debug, Deserialize)]
struct RawExtractor {
    letterhead_fraction: Option<f64>,
    letterhead_min_lines: Option<usize>,
    known_vendor_threshold: Option<f64>,
    max_amount: Option<f64>,
    description_max_items: Option<usize>,
    description_max_chars: Option<usize>,
    fallback_date_cap: Option<u8>,
    plausible_years: Option<i32>,
    amount_weight: Option<u32>,
    date_weight: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RawCategorizer {
    keywords: Option<BTreeMap<String, Vec<String>>>,
    history_base: Option<f64>,
    history_step: Option<f64>,
    history_cap: Option<f64>,
    fuzzy_threshold: Option<f64>,
    fuzzy_factor: Option<f64>,
    keyword_hit: Option<f64>,
    keyword_cap: Option<f64>,
    max_suggestions: Option<usize>,
    default_category: Option<String>,
    default_confidence: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct RawDuplicate {
    blocking_threshold: Option<u8>,
    notice_threshold: Option<u8>,
    perceptual_max_distance: Option<u32>,
    perceptual_points: Option<f64>,
    invoice_points: Option<f64>,
    vendor_points: Option<f64>,
    vendor_threshold: Option<f64>,
    amount_exact_points: Option<f64>,
    amount_near_points: Option<f64>,
    amount_near_fraction: Option<f64>,
    date_exact_points: Option<f64>,
    date_near_points: Option<f64>,
    date_near_days: Option<i64>,
    similar_min_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTasks {
    workers: Option<usize>,
    hard_timeout_secs: Option<u64>,
    soft_timeout_secs: Option<u64>,
    retention_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawValidation {
    max_amount: Option<f64>,
    future_tolerance_days: Option<i64>,
}

/// Overwrite `$target` with `$value` when the raw field is present
macro_rules! set {
    ($target:expr, $value:expr) => {
        if let Some(value) = $value {
            $target = value;
        }
    };
}

/// Parse config from TOML content
fn parse_config(content: &str) -> Result<PipelineConfig> {
    let raw: RawConfig = toml::from_str(content)
        .map_err(|e| Error::InvalidData(format!("Invalid config TOML: {}", e)))?;

    let mut config = PipelineConfig::default();

    if let Some(e) = raw.extractor {
        let c = &mut config.extractor;
        set!(c.letterhead_fraction, e.letterhead_fraction);
        set!(c.letterhead_min_lines, e.letterhead_min_lines);
        set!(c.known_vendor_threshold, e.known_vendor_threshold);
        set!(c.max_amount, e.max_amount);
        set!(c.description_max_items, e.description_max_items);
        set!(c.description_max_chars, e.description_max_chars);
        set!(c.fallback_date_cap, e.fallback_date_cap);
        set!(c.plausible_years, e.plausible_years);
        set!(c.amount_weight, e.amount_weight);
        set!(c.date_weight, e.date_weight);
    }

    if let Some(r) = raw.categorizer {
        let c = &mut config.categorizer;
        if let Some(keywords) = r.keywords {
            c.keywords = KeywordTable::new(keywords);
        }
        set!(c.history_base, r.history_base);
        set!(c.history_step, r.history_step);
        set!(c.history_cap, r.history_cap);
        set!(c.fuzzy_threshold, r.fuzzy_threshold);
        set!(c.fuzzy_factor, r.fuzzy_factor);
        set!(c.keyword_hit, r.keyword_hit);
        set!(c.keyword_cap, r.keyword_cap);
        set!(c.max_suggestions, r.max_suggestions);
        set!(c.default_category, r.default_category);
        set!(c.default_confidence, r.default_confidence);
    }

    if let Some(d) = raw.duplicate {
        let c = &mut config.duplicate;
        set!(c.blocking_threshold, d.blocking_threshold);
        set!(c.notice_threshold, d.notice_threshold);
        set!(c.perceptual_max_distance, d.perceptual_max_distance);
        set!(c.perceptual_points, d.perceptual_points);
        set!(c.invoice_points, d.invoice_points);
        set!(c.vendor_points, d.vendor_points);
        set!(c.vendor_threshold, d.vendor_threshold);
        set!(c.amount_exact_points, d.amount_exact_points);
        set!(c.amount_near_points, d.amount_near_points);
        set!(c.amount_near_fraction, d.amount_near_fraction);
        set!(c.date_exact_points, d.date_exact_points);
        set!(c.date_near_points, d.date_near_points);
        set!(c.date_near_days, d.date_near_days);
        set!(c.similar_min_score, d.similar_min_score);
    }

    if let Some(t) = raw.tasks {
        let c = &mut config.tasks;
        set!(c.workers, t.workers);
        set!(c.hard_timeout_secs, t.hard_timeout_secs);
        set!(c.soft_timeout_secs, t.soft_timeout_secs);
        set!(c.retention_secs, t.retention_secs);
    }

    if let Some(v) = raw.validation {
        let c = &mut config.validation;
        set!(c.max_amount, v.max_amount);
        set!(c.future_tolerance_days, v.future_tolerance_days);
    }

    if config.tasks.workers == 0 {
        return Err(Error::Config("tasks.workers must be at least 1".into()));
    }
    if config.validation.future_tolerance_days < 0 {
        return Err(Error::Config(
            "validation.future_tolerance_days must not be negative".into(),
        ));
    }
    if config.duplicate.notice_threshold > config.duplicate.blocking_threshold {
        return Err(Error::Config(
            "duplicate.notice_threshold must not exceed duplicate.blocking_threshold".into(),
        ));
    }

    Ok(config)
}
