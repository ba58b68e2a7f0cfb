//! SegmentForge: RFM customer segmentation with drift monitoring
//!
//! Derives Recency/Frequency/Monetary metrics from a transaction log, assigns
//! customers to clusters with a pre-trained scaler and K-Means model, and
//! checks whether the live population has drifted from the training baseline
//! with a two-sample Kolmogorov-Smirnov test.

pub mod cli;
pub mod config;
pub mod data;
pub mod drift;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod recommend;
pub mod rfm;
pub mod store;

// Re-export public items for easier access
pub use cli::Args;
pub use config::{PipelineConfig, StoreLocation};
pub use data::{Baseline, ClusterLabel, Metric, RfmSnapshot, RfmVector, Transaction};
pub use drift::{ks_2samp, DriftCheck, DriftDetector, DriftVerdict};
pub use error::{ArtifactError, PipelineError, Result};
pub use model::{assign, assign_one, ArtifactStore, DirArtifactStore, KMeansModel, ModelHandle, Scaler};
pub use pipeline::{Population, PurchaseOutcome, Segmenter};
pub use recommend::{recommend, Segment};
pub use rfm::{aggregate, aggregate_one, baseline_reference, live_reference, merge_activity};
pub use store::{MemoryStore, SqliteStore, TotalsQuery, TransactionSource};
