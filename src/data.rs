//! Core records and baseline dataset loading using Polars

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Baseline CSV column holding the customer identifier
pub const COL_CUSTOMER_ID: &str = "Customer ID";
pub const COL_RECENCY: &str = "Recency";
pub const COL_FREQUENCY: &str = "Frequency";
pub const COL_MONETARY: &str = "Monetary";
pub const COL_CLUSTER: &str = "Cluster";

/// A single purchase. Immutable once recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub customer_id: String,
    pub occurred_at: DateTime<Utc>,
    pub amount: f64,
}

impl Transaction {
    /// Build a transaction, rejecting empty ids and negative or non-finite amounts
    pub fn new(
        customer_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        amount: f64,
    ) -> Result<Self> {
        let transaction = Self {
            customer_id: customer_id.into().trim().to_string(),
            occurred_at,
            amount,
        };
        transaction.validate()?;
        Ok(transaction)
    }

    /// Checked again by every store before a write
    pub fn validate(&self) -> Result<()> {
        if self.customer_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "customer id must not be empty".to_string(),
            ));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(PipelineError::InvalidInput(format!(
                "amount must be a non-negative number, got {}",
                self.amount
            )));
        }
        Ok(())
    }
}

/// Grouped aggregate row as returned by a transaction source
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerTotals {
    pub customer_id: String,
    /// Most recent qualifying transaction
    pub last_at: DateTime<Utc>,
    pub count: u64,
    pub amount_sum: f64,
}

/// One of the three RFM features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Metric {
    Recency,
    Frequency,
    Monetary,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::Recency, Metric::Frequency, Metric::Monetary];

    pub fn name(self) -> &'static str {
        match self {
            Metric::Recency => "recency",
            Metric::Frequency => "frequency",
            Metric::Monetary => "monetary",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-customer RFM metrics relative to a reference instant
#[derive(Debug, Clone, PartialEq)]
pub struct RfmSnapshot {
    pub customer_id: String,
    /// Whole days since the most recent transaction
    pub recency: i64,
    /// Number of transactions, always at least one
    pub frequency: u64,
    /// Sum of transaction amounts
    pub monetary: f64,
}

impl RfmSnapshot {
    /// Model input for this customer
    pub fn vector(&self) -> RfmVector {
        RfmVector {
            recency: self.recency as f64,
            frequency: self.frequency as f64,
            monetary: self.monetary,
        }
    }

    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Recency => self.recency as f64,
            Metric::Frequency => self.frequency as f64,
            Metric::Monetary => self.monetary,
        }
    }
}

/// Raw (unscaled) feature vector fed to the cluster assigner
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RfmVector {
    pub recency: f64,
    pub frequency: f64,
    pub monetary: f64,
}

impl RfmVector {
    pub fn new(recency: f64, frequency: f64, monetary: f64) -> Self {
        Self {
            recency,
            frequency,
            monetary,
        }
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.recency, self.frequency, self.monetary]
    }
}

/// Cluster index produced by the cluster model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterLabel(pub u32);

impl ClusterLabel {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A historical customer row together with the label training assigned it
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineRecord {
    pub snapshot: RfmSnapshot,
    pub cluster: ClusterLabel,
}

/// Historical RFM snapshot used as drift baseline and pre-live customer roster
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    records: Vec<BaselineRecord>,
    index: HashMap<String, usize>,
}

impl Baseline {
    /// Build from records; rows are ordered by customer id and ids must be unique
    pub fn from_records(mut records: Vec<BaselineRecord>) -> Result<Self> {
        records.sort_by(|a, b| a.snapshot.customer_id.cmp(&b.snapshot.customer_id));

        let mut index = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            if index
                .insert(record.snapshot.customer_id.clone(), position)
                .is_some()
            {
                return Err(PipelineError::Baseline(format!(
                    "duplicate customer id '{}'",
                    record.snapshot.customer_id
                )));
            }
        }

        Ok(Self { records, index })
    }

    /// Load the baseline CSV (`Customer ID, Recency, Frequency, Monetary, Cluster`)
    pub fn load_csv(path: &Path) -> Result<Self> {
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?;

        if df.height() == 0 {
            return Err(PipelineError::Baseline(format!(
                "no rows in baseline file {}",
                path.display()
            )));
        }

        let records = records_from_frame(&df)?;
        tracing::info!(
            "Loaded baseline with {} customers from {}",
            records.len(),
            path.display()
        );
        Self::from_records(records)
    }

    pub fn get(&self, customer_id: &str) -> Option<&BaselineRecord> {
        self.index.get(customer_id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[BaselineRecord] {
        &self.records
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &RfmSnapshot> + '_ {
        self.records.iter().map(|r| &r.snapshot)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Convert a baseline data frame into validated records
fn records_from_frame(df: &DataFrame) -> Result<Vec<BaselineRecord>> {
    let customer_ids = customer_id_column(df)?;
    let recency = float_column(df, COL_RECENCY)?;
    let frequency = float_column(df, COL_FREQUENCY)?;
    let monetary = float_column(df, COL_MONETARY)?;
    let cluster = float_column(df, COL_CLUSTER)?;

    let mut records = Vec::with_capacity(customer_ids.len());
    for i in 0..customer_ids.len() {
        let row = i + 1;
        let recency = whole_number(recency[i], COL_RECENCY, row)?;
        let frequency = whole_number(frequency[i], COL_FREQUENCY, row)?;
        let cluster = whole_number(cluster[i], COL_CLUSTER, row)?;

        if frequency < 1 {
            return Err(PipelineError::Baseline(format!(
                "row {}: frequency must be at least 1",
                row
            )));
        }
        if !monetary[i].is_finite() || monetary[i] < 0.0 {
            return Err(PipelineError::Baseline(format!(
                "row {}: monetary must be a non-negative number",
                row
            )));
        }
        let cluster = u32::try_from(cluster).map_err(|_| {
            PipelineError::Baseline(format!("row {}: cluster {} out of range", row, cluster))
        })?;

        records.push(BaselineRecord {
            snapshot: RfmSnapshot {
                customer_id: customer_ids[i].clone(),
                recency: recency as i64,
                frequency,
                monetary: monetary[i],
            },
            cluster: ClusterLabel(cluster),
        });
    }

    Ok(records)
}

/// Customer ids may be read as text, integers or floats depending on the export
fn customer_id_column(df: &DataFrame) -> Result<Vec<String>> {
    let series = df.column(COL_CUSTOMER_ID)?;
    let ids = match series.dtype() {
        DataType::String => series
            .str()?
            .into_iter()
            .map(|value| value.map(normalize_customer_id))
            .collect::<Vec<_>>(),
        _ => {
            let cast = series.cast(&DataType::Float64)?;
            cast.f64()?
                .into_iter()
                .map(|value| value.map(|v| normalize_customer_id(&v.to_string())))
                .collect()
        }
    };

    ids.into_iter()
        .enumerate()
        .map(|(i, id)| match id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(PipelineError::Baseline(format!(
                "row {}: missing {}",
                i + 1,
                COL_CUSTOMER_ID
            ))),
        })
        .collect()
}

fn float_column(df: &DataFrame, name: &str) -> Result<Vec<f64>> {
    let cast = df.column(name)?.cast(&DataType::Float64)?;
    cast.f64()?
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            value.ok_or_else(|| {
                PipelineError::Baseline(format!("row {}: missing {}", i + 1, name))
            })
        })
        .collect()
}

fn whole_number(value: f64, column: &str, row: usize) -> Result<u64> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 {
        return Err(PipelineError::Baseline(format!(
            "row {}: {} must be a non-negative whole number, got {}",
            row, column, value
        )));
    }
    Ok(value as u64)
}

/// `"13085.0"` and `"13085"` name the same customer
pub fn normalize_customer_id(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 => {
            format!("{}", value as i64)
        }
        _ => trimmed.to_string(),
    }
}
