//! Dashboard operations combining the store, the cached model and the baseline

use crate::config::PipelineConfig;
use crate::data::{Baseline, ClusterLabel, Metric, RfmSnapshot, Transaction};
use crate::drift::{DriftCheck, DriftDetector};
use crate::error::{PipelineError, Result};
use crate::model::{assign, assign_one, cluster_sizes, ModelHandle};
use crate::recommend::recommend;
use crate::rfm::{aggregate, aggregate_one, baseline_reference, live_reference, merge_activity, snapshot_vectors};
use crate::store::{TotalsQuery, TransactionSource};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Monetary values closer than this count as equal when verifying the baseline
pub const MONETARY_TOLERANCE: f64 = 1e-7;

/// Headline numbers for the dashboard
#[derive(Debug, Clone, PartialEq)]
pub struct DashboardSummary {
    /// Distinct customers with any transaction
    pub customer_count: u64,
    /// Transactions recorded at or after the baseline cutoff
    pub new_transactions: u64,
    pub baseline_customers: usize,
    pub model_available: bool,
}

/// A customer's current metrics, segment and suggested action
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerProfile {
    pub snapshot: RfmSnapshot,
    pub cluster: ClusterLabel,
    pub recommendation: &'static str,
}

/// Result of recording a purchase
#[derive(Debug, Clone, PartialEq)]
pub enum PurchaseOutcome {
    /// The customer is known to the baseline and was reclassified
    Reclassified {
        snapshot: RfmSnapshot,
        previous: ClusterLabel,
        current: ClusterLabel,
        recommendation: &'static str,
    },
    /// The customer is not part of the baseline roster
    NewCustomer { customer_id: String },
}

impl PurchaseOutcome {
    /// Whether the purchase moved the customer to another segment
    pub fn segment_changed(&self) -> bool {
        match self {
            PurchaseOutcome::Reclassified {
                previous, current, ..
            } => previous != current,
            PurchaseOutcome::NewCustomer { .. } => false,
        }
    }
}

/// One customer row of the segment table
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRow {
    pub snapshot: RfmSnapshot,
    pub cluster: ClusterLabel,
}

/// Every aggregated customer with its cluster
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTable {
    pub reference: DateTime<Utc>,
    pub rows: Vec<SegmentRow>,
    /// Customers per cluster index
    pub sizes: Vec<usize>,
}

/// Which population the baseline is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    /// Baseline rows with post-cutoff activity merged in
    Merged,
    /// Fresh aggregation at the live reference instant
    Recomputed,
}

/// Drift checks for the three metrics
#[derive(Debug, Clone, PartialEq)]
pub struct DriftReport {
    pub population: Population,
    pub baseline_size: usize,
    pub current_size: usize,
    pub significance: f64,
    pub checks: Vec<DriftCheck>,
}

impl DriftReport {
    pub fn drift_detected(&self) -> bool {
        self.checks
            .iter()
            .filter_map(DriftCheck::verdict)
            .any(|v| v.drift_detected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricMismatch {
    pub customer_id: String,
    pub metric: Metric,
    pub expected: f64,
    pub actual: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelMismatch {
    pub customer_id: String,
    pub expected: ClusterLabel,
    pub actual: ClusterLabel,
}

/// Agreement between the stored baseline and a recomputation from the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerificationReport {
    pub checked: usize,
    /// Baseline customers with no transactions before the cutoff
    pub missing: Vec<String>,
    /// Customers aggregated from the store but absent from the baseline
    pub unexpected: Vec<String>,
    pub metric_mismatches: Vec<MetricMismatch>,
    pub label_mismatches: Vec<LabelMismatch>,
}

impl VerificationReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
            && self.unexpected.is_empty()
            && self.metric_mismatches.is_empty()
            && self.label_mismatches.is_empty()
    }
}

/// Synchronous per-call service behind the dashboard
///
/// Holds only read-only shared state: the model handle and the cached
/// baseline. Every call reads the store afresh.
pub struct Segmenter<S> {
    source: S,
    model: Arc<ModelHandle>,
    baseline: Arc<Baseline>,
    config: PipelineConfig,
    detector: DriftDetector,
}

impl<S: TransactionSource> Segmenter<S> {
    pub fn new(
        source: S,
        model: Arc<ModelHandle>,
        baseline: Arc<Baseline>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let detector = DriftDetector::new(config.significance)?;
        Ok(Self {
            source,
            model,
            baseline,
            config,
            detector,
        })
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn model(&self) -> &ModelHandle {
        &self.model
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn summary(&self) -> Result<DashboardSummary> {
        Ok(DashboardSummary {
            customer_count: self.source.distinct_customers()?,
            new_transactions: self
                .source
                .count(Some(baseline_reference(&self.config)))?,
            baseline_customers: self.baseline.len(),
            model_available: self.model.is_available(),
        })
    }

    /// Current RFM, cluster and recommendation for one customer
    ///
    /// `None` when the customer has no transactions before `now`.
    pub fn profile(&self, customer_id: &str, now: DateTime<Utc>) -> Result<Option<CustomerProfile>> {
        let pair = self.model.current()?;
        let Some(snapshot) = aggregate_one(&self.source, customer_id.trim(), now)? else {
            debug!("No transactions for customer {}", customer_id);
            return Ok(None);
        };

        let cluster = assign_one(Some(&pair.scaler), Some(&pair.model), snapshot.vector())?;
        Ok(Some(CustomerProfile {
            snapshot,
            cluster,
            recommendation: recommend(cluster),
        }))
    }

    /// Record a purchase at `now` and reclassify the customer against the baseline
    ///
    /// Nothing is computed if the store rejects the write.
    pub fn record_purchase(
        &self,
        customer_id: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<PurchaseOutcome> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(PipelineError::InvalidInput(format!(
                "purchase amount must be positive, got {}",
                amount
            )));
        }
        let transaction = Transaction::new(customer_id, now, amount)?;
        let pair = self.model.current()?;

        self.source.insert(&transaction)?;
        info!(
            "Recorded purchase of {:.2} for customer {}",
            amount, transaction.customer_id
        );

        let Some(record) = self.baseline.get(&transaction.customer_id) else {
            return Ok(PurchaseOutcome::NewCustomer {
                customer_id: transaction.customer_id,
            });
        };

        let query = TotalsQuery::since(baseline_reference(&self.config))
            .for_customer(transaction.customer_id.as_str());
        let snapshot = match self.source.totals(&query)?.first() {
            Some(activity) => merge_activity(&record.snapshot, activity),
            None => record.snapshot.clone(),
        };

        let current = assign_one(Some(&pair.scaler), Some(&pair.model), snapshot.vector())?;
        Ok(PurchaseOutcome::Reclassified {
            snapshot,
            previous: record.cluster,
            current,
            recommendation: recommend(current),
        })
    }

    /// Full segment table at `reference`
    pub fn segments(&self, reference: DateTime<Utc>) -> Result<SegmentTable> {
        let pair = self.model.current()?;
        let snapshots: Vec<RfmSnapshot> = aggregate(&self.source, reference)?.into_values().collect();
        let labels = assign(
            Some(&pair.scaler),
            Some(&pair.model),
            &snapshot_vectors(&snapshots),
        )?;
        let sizes = cluster_sizes(&labels, pair.model.n_clusters());

        let rows = snapshots
            .into_iter()
            .zip(labels)
            .map(|(snapshot, cluster)| SegmentRow { snapshot, cluster })
            .collect();

        Ok(SegmentTable {
            reference,
            rows,
            sizes,
        })
    }

    /// Baseline rows with all activity since the cutoff merged in
    ///
    /// Customers unknown to the baseline are not part of the monitored population.
    pub fn monitoring_population(&self) -> Result<Vec<RfmSnapshot>> {
        let activity: HashMap<String, _> = self
            .source
            .totals(&TotalsQuery::since(baseline_reference(&self.config)))?
            .into_iter()
            .map(|t| (t.customer_id.clone(), t))
            .collect();

        let unknown = activity
            .keys()
            .filter(|id| self.baseline.get(id).is_none())
            .count();
        if unknown > 0 {
            debug!("{} active customers are not in the baseline", unknown);
        }

        Ok(self
            .baseline
            .snapshots()
            .map(|snapshot| match activity.get(&snapshot.customer_id) {
                Some(totals) => merge_activity(snapshot, totals),
                None => snapshot.clone(),
            })
            .collect())
    }

    /// Compare the baseline against the chosen current population, metric by metric
    pub fn drift_report(&self, population: Population, now: DateTime<Utc>) -> Result<DriftReport> {
        let current = match population {
            Population::Merged => self.monitoring_population()?,
            Population::Recomputed => {
                aggregate(&self.source, live_reference(&self.config, now))?
                    .into_values()
                    .collect()
            }
        };

        let checks = self
            .detector
            .detect_metrics(self.baseline.snapshots(), &current);

        Ok(DriftReport {
            population,
            baseline_size: self.baseline.len(),
            current_size: current.len(),
            significance: self.detector.significance(),
            checks,
        })
    }

    /// Recompute RFM at the baseline cutoff and reclassify every baseline customer
    pub fn verify_baseline(&self) -> Result<VerificationReport> {
        let pair = self.model.current()?;
        let recomputed = aggregate(&self.source, baseline_reference(&self.config))?;
        let mut report = VerificationReport::default();

        let mut matched = Vec::new();
        for record in self.baseline.records() {
            let expected = &record.snapshot;
            let Some(actual) = recomputed.get(&expected.customer_id) else {
                report.missing.push(expected.customer_id.clone());
                continue;
            };

            for metric in Metric::ALL {
                let (want, got) = (expected.metric(metric), actual.metric(metric));
                let tolerance = match metric {
                    Metric::Monetary => MONETARY_TOLERANCE,
                    _ => 0.0,
                };
                if (want - got).abs() > tolerance {
                    report.metric_mismatches.push(MetricMismatch {
                        customer_id: expected.customer_id.clone(),
                        metric,
                        expected: want,
                        actual: got,
                    });
                }
            }
            matched.push((record, actual));
        }

        report.unexpected = recomputed
            .keys()
            .filter(|id| self.baseline.get(id).is_none())
            .cloned()
            .collect();

        let vectors: Vec<_> = matched.iter().map(|(_, actual)| actual.vector()).collect();
        let labels = assign(Some(&pair.scaler), Some(&pair.model), &vectors)?;
        for ((record, _), label) in matched.iter().zip(labels) {
            if record.cluster != label {
                report.label_mismatches.push(LabelMismatch {
                    customer_id: record.snapshot.customer_id.clone(),
                    expected: record.cluster,
                    actual: label,
                });
            }
        }
        report.checked = matched.len();

        info!(
            "Baseline verification: {} checked, {} metric and {} label mismatches",
            report.checked,
            report.metric_mismatches.len(),
            report.label_mismatches.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BaselineRecord;
    use crate::error::ArtifactError;
    use crate::model::{ArtifactNames, ArtifactPair, KMeansModel, Scaler};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};

    fn cutoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 12, 9, 12, 50, 0).unwrap()
    }

    fn names() -> ArtifactNames {
        ArtifactNames::from_config(&PipelineConfig::default())
    }

    /// Cluster 0 for frequency up to 4, cluster 3 from 5 upwards
    fn frequency_model() -> Arc<ModelHandle> {
        let pair = ArtifactPair {
            scaler: Scaler::Standard {
                mean: [0.0; 3],
                scale: [1_000.0, 1.0, 1_000_000.0],
            },
            model: KMeansModel::from_centroids(&[
                [0.0, 1.0, 0.0],
                [0.0, 1_000.0, 0.0],
                [0.0, 2_000.0, 0.0],
                [0.0, 8.0, 0.0],
            ])
            .unwrap(),
        };
        Arc::new(ModelHandle::from_pair(names(), pair))
    }

    fn baseline() -> Arc<Baseline> {
        let record = |id: &str, recency, frequency, monetary, cluster| BaselineRecord {
            snapshot: RfmSnapshot {
                customer_id: id.to_string(),
                recency,
                frequency,
                monetary,
            },
            cluster: ClusterLabel(cluster),
        };
        Arc::new(
            Baseline::from_records(vec![
                record("A", 10, 4, 40.0, 0),
                record("B", 2, 9, 900.0, 3),
            ])
            .unwrap(),
        )
    }

    fn segmenter(transactions: Vec<Transaction>) -> Segmenter<MemoryStore> {
        Segmenter::new(
            MemoryStore::with_transactions(transactions).unwrap(),
            frequency_model(),
            baseline(),
            PipelineConfig::default(),
        )
        .unwrap()
    }

    fn tx(id: &str, at: DateTime<Utc>, amount: f64) -> Transaction {
        Transaction::new(id, at, amount).unwrap()
    }

    #[test]
    fn test_purchase_moves_customer_to_new_segment() {
        let segmenter = segmenter(Vec::new());
        let now = cutoff() + Duration::days(3);

        let outcome = segmenter.record_purchase("A", 25.0, now).unwrap();
        match &outcome {
            PurchaseOutcome::Reclassified {
                snapshot,
                previous,
                current,
                ..
            } => {
                assert_eq!(snapshot.recency, 0);
                assert_eq!(snapshot.frequency, 5);
                assert_eq!(snapshot.monetary, 65.0);
                assert_eq!(*previous, ClusterLabel(0));
                assert_eq!(*current, ClusterLabel(3));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(outcome.segment_changed());
        assert_eq!(segmenter.source().count(None).unwrap(), 1);
    }

    #[test]
    fn test_purchase_for_unknown_customer() {
        let segmenter = segmenter(Vec::new());
        let outcome = segmenter
            .record_purchase("Z", 5.0, cutoff() + Duration::days(1))
            .unwrap();
        assert_eq!(
            outcome,
            PurchaseOutcome::NewCustomer {
                customer_id: "Z".to_string()
            }
        );
    }

    #[test]
    fn test_purchase_rejects_non_positive_amount() {
        let segmenter = segmenter(Vec::new());
        assert!(matches!(
            segmenter.record_purchase("A", 0.0, cutoff()),
            Err(PipelineError::InvalidInput(_))
        ));
        assert_eq!(segmenter.source().count(None).unwrap(), 0);
    }

    #[test]
    fn test_unavailable_model_blocks_cluster_features() {
        let model = Arc::new(ModelHandle::load(
            &HashMap::<String, Vec<u8>>::new(),
            names(),
        ));
        let segmenter = Segmenter::new(
            MemoryStore::with_transactions(vec![tx("A", cutoff(), 1.0)]).unwrap(),
            model,
            baseline(),
            PipelineConfig::default(),
        )
        .unwrap();
        let later = cutoff() + Duration::days(1);

        assert!(matches!(
            segmenter.profile("A", later),
            Err(PipelineError::ModelUnavailable(ArtifactError::NotFound(_)))
        ));
        assert!(matches!(
            segmenter.record_purchase("A", 3.0, later),
            Err(PipelineError::ModelUnavailable(_))
        ));
        // Blocked purchases are not recorded
        assert_eq!(segmenter.source().count(None).unwrap(), 1);
        assert!(!segmenter.summary().unwrap().model_available);
    }

    #[test]
    fn test_monitoring_population_merges_post_cutoff_activity() {
        let segmenter = segmenter(vec![
            tx("A", cutoff() - Duration::days(1), 99.0),
            tx("A", cutoff() + Duration::hours(1), 5.0),
            tx("A", cutoff() + Duration::hours(2), 6.0),
            tx("Q", cutoff() + Duration::hours(3), 7.0),
        ]);

        let population = segmenter.monitoring_population().unwrap();
        assert_eq!(population.len(), 2);

        let a = population.iter().find(|s| s.customer_id == "A").unwrap();
        assert_eq!((a.recency, a.frequency, a.monetary), (0, 6, 51.0));

        let b = population.iter().find(|s| s.customer_id == "B").unwrap();
        assert_eq!((b.recency, b.frequency, b.monetary), (2, 9, 900.0));
    }

    #[test]
    fn test_drift_report_without_new_activity_is_stable() {
        let segmenter = segmenter(Vec::new());
        let report = segmenter
            .drift_report(Population::Merged, cutoff())
            .unwrap();

        assert_eq!(report.checks.len(), 3);
        assert!(!report.drift_detected());
        for check in &report.checks {
            assert_eq!(check.verdict().unwrap().p_value, 1.0);
        }
    }

    #[test]
    fn test_recomputed_drift_with_empty_store_is_skipped() {
        let segmenter = segmenter(Vec::new());
        let report = segmenter
            .drift_report(Population::Recomputed, cutoff())
            .unwrap();

        assert_eq!(report.current_size, 0);
        assert!(report
            .checks
            .iter()
            .all(|c| matches!(c, DriftCheck::Skipped { .. })));
        assert!(!report.drift_detected());
    }

    #[test]
    fn test_summary_counts() {
        let segmenter = segmenter(vec![
            tx("A", cutoff() - Duration::days(3), 1.0),
            tx("B", cutoff(), 1.0),
            tx("B", cutoff() + Duration::days(1), 1.0),
        ]);
        let summary = segmenter.summary().unwrap();

        assert_eq!(summary.customer_count, 2);
        assert_eq!(summary.new_transactions, 2);
        assert_eq!(summary.baseline_customers, 2);
        assert!(summary.model_available);
    }
}
