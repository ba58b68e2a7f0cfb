//! Pipeline policy values and the transaction store location

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::PathBuf;

/// Significance level used by the reference deployment
pub const DEFAULT_SIGNIFICANCE: f64 = 0.05;

/// Default artifact names inside the artifact store
pub const DEFAULT_SCALER_NAME: &str = "scaler";
pub const DEFAULT_MODEL_NAME: &str = "model";

/// Policy values shared by the aggregator, assigner and drift detector
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// p-values strictly below this flag drift
    pub significance: f64,
    /// Historical cutoff the baseline snapshot and the model were built at
    pub baseline_cutoff: DateTime<Utc>,
    /// Offset added to the wall clock when computing the live reference
    pub live_lookahead: Duration,
    pub scaler_name: String,
    pub model_name: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            significance: DEFAULT_SIGNIFICANCE,
            baseline_cutoff: Utc
                .with_ymd_and_hms(2025, 12, 9, 12, 50, 0)
                .single()
                .unwrap_or_default(),
            live_lookahead: Duration::zero(),
            scaler_name: DEFAULT_SCALER_NAME.to_string(),
            model_name: DEFAULT_MODEL_NAME.to_string(),
        }
    }
}

impl PipelineConfig {
    /// Reject values that would make the pipeline meaningless
    pub fn validate(&self) -> Result<()> {
        if !(self.significance > 0.0 && self.significance < 1.0) {
            return Err(PipelineError::Config(format!(
                "significance must lie in (0, 1), got {}",
                self.significance
            )));
        }
        if self.live_lookahead < Duration::zero() {
            return Err(PipelineError::Config(
                "live lookahead must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the transaction store lives, parsed from a connection string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    /// Parse `sqlite://path`, `sqlite:path`, `sqlite::memory:` or a bare path
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(PipelineError::Config("database url is empty".to_string()));
        }

        let rest = if let Some(rest) = url.strip_prefix("sqlite://") {
            rest
        } else if let Some(rest) = url.strip_prefix("sqlite:") {
            rest
        } else if url.contains("://") {
            let scheme = url.split("://").next().unwrap_or_default();
            return Err(PipelineError::Config(format!(
                "unsupported database scheme '{}'",
                scheme
            )));
        } else {
            url
        };

        match rest {
            ":memory:" => Ok(StoreLocation::Memory),
            "" => Err(PipelineError::Config(format!("no database path in '{}'", url))),
            path => Ok(StoreLocation::File(PathBuf::from(path))),
        }
    }
}
