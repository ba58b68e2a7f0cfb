//! Command-line interface definitions and argument parsing

use crate::config::{PipelineConfig, DEFAULT_MODEL_NAME, DEFAULT_SCALER_NAME};
use crate::data::RfmVector;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Customer segmentation dashboard: RFM, K-Means clusters and drift checks
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Transaction store connection string (sqlite://path or a file path)
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Directory holding the scaler and model artifacts
    #[arg(short, long, default_value = "artifacts")]
    pub artifacts: PathBuf,

    /// Artifact name of the fitted scaler
    #[arg(long, default_value = DEFAULT_SCALER_NAME)]
    pub scaler_name: String,

    /// Artifact name of the fitted cluster model
    #[arg(long, default_value = DEFAULT_MODEL_NAME)]
    pub model_name: String,

    /// Baseline CSV with Customer ID, Recency, Frequency, Monetary and Cluster
    #[arg(short, long, default_value = "clustered.csv")]
    pub baseline: PathBuf,

    /// Significance level for the drift test
    #[arg(long, default_value = "0.05")]
    pub significance: f64,

    /// Cutoff the baseline snapshot was computed at (RFC 3339)
    #[arg(long, default_value = "2025-12-09T12:50:00Z")]
    pub baseline_cutoff: DateTime<Utc>,

    /// Hours added to the wall clock for the live reference instant
    #[arg(long, default_value = "0")]
    pub lookahead_hours: i64,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Show customer and new transaction counts
    Summary,

    /// Look up a customer's RFM metrics, segment and recommendation
    Profile { customer_id: String },

    /// Record a purchase and show whether the customer changed segment
    Record { customer_id: String, amount: f64 },

    /// Assign a raw RFM vector to a cluster
    /// Example: classify "30,10,500.0" for Recency=30, Frequency=10, Monetary=500.0
    Classify { rfm: String },

    /// Segment every customer with transactions before the reference instant
    Segments {
        /// Use the baseline cutoff instead of the live reference
        #[arg(long)]
        at_cutoff: bool,
    },

    /// Check recency, frequency and monetary distributions for drift
    Drift {
        /// Compare against a fresh aggregation instead of the merged baseline
        #[arg(long)]
        recompute: bool,
    },

    /// Recompute the baseline from the store and report disagreements
    Verify,
}

impl Args {
    /// Pipeline policy values from the command line
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let config = PipelineConfig {
            significance: self.significance,
            baseline_cutoff: self.baseline_cutoff,
            live_lookahead: Duration::hours(self.lookahead_hours),
            scaler_name: self.scaler_name.clone(),
            model_name: self.model_name.clone(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Parse RFM values from a string
/// Expected format: "recency,frequency,monetary"
pub fn parse_rfm_values(input: &str) -> Result<RfmVector> {
    let parts: Vec<&str> = input.split(',').collect();
    if parts.len() != 3 {
        return Err(PipelineError::InvalidInput(
            "RFM values must be in format 'recency,frequency,monetary'".to_string(),
        ));
    }

    let parse = |name: &str, raw: &str| -> Result<f64> {
        raw.trim()
            .parse()
            .map_err(|_| PipelineError::InvalidInput(format!("Invalid {} value: {}", name, raw)))
    };

    Ok(RfmVector::new(
        parse("recency", parts[0])?,
        parse("frequency", parts[1])?,
        parse("monetary", parts[2])?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rfm_values() {
        let parsed = parse_rfm_values("30,10,500.0").unwrap();
        assert_eq!(parsed, RfmVector::new(30.0, 10.0, 500.0));

        assert!(parse_rfm_values("invalid").is_err());
        assert!(parse_rfm_values("1,2,x").is_err());
    }

    #[test]
    fn test_args_defaults_match_reference_deployment() {
        let args = Args::try_parse_from([
            "segmentforge",
            "--database-url",
            "sqlite::memory:",
            "drift",
        ])
        .unwrap();

        assert_eq!(args.command, Command::Drift { recompute: false });
        assert_eq!(args.pipeline_config().unwrap(), PipelineConfig::default());
    }

    #[test]
    fn test_args_subcommand_values() {
        let args = Args::try_parse_from([
            "segmentforge",
            "--database-url",
            "tx.db",
            "--lookahead-hours",
            "24",
            "record",
            "13085",
            "42.5",
        ])
        .unwrap();

        assert_eq!(
            args.command,
            Command::Record {
                customer_id: "13085".to_string(),
                amount: 42.5
            }
        );
        assert_eq!(args.pipeline_config().unwrap().live_lookahead, Duration::hours(24));
    }

    #[test]
    fn test_invalid_significance_rejected() {
        let args = Args::try_parse_from([
            "segmentforge",
            "--database-url",
            "tx.db",
            "--significance",
            "2",
            "summary",
        ])
        .unwrap();
        assert!(args.pipeline_config().is_err());
    }
}
