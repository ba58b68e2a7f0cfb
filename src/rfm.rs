//! RFM aggregation relative to a reference instant

use crate::config::PipelineConfig;
use crate::data::{CustomerTotals, RfmSnapshot, RfmVector};
use crate::error::Result;
use crate::store::{TotalsQuery, TransactionSource};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::debug;

/// Reference instant the baseline snapshot and the model were built at
pub fn baseline_reference(config: &PipelineConfig) -> DateTime<Utc> {
    config.baseline_cutoff
}

/// Reference instant for live aggregation: the wall clock plus the configured lookahead
pub fn live_reference(config: &PipelineConfig, now: DateTime<Utc>) -> DateTime<Utc> {
    now + config.live_lookahead
}

/// Whole elapsed days between `last_at` and `reference`
///
/// Partial days are truncated; a transaction 23 hours before the reference
/// has recency 0.
pub fn recency_days(reference: DateTime<Utc>, last_at: DateTime<Utc>) -> i64 {
    (reference - last_at).num_days().max(0)
}

fn snapshot_from_totals(reference: DateTime<Utc>, totals: CustomerTotals) -> RfmSnapshot {
    RfmSnapshot {
        recency: recency_days(reference, totals.last_at),
        frequency: totals.count,
        monetary: totals.amount_sum,
        customer_id: totals.customer_id,
    }
}

/// Compute RFM for every customer with a transaction strictly before `reference`
///
/// Customers without qualifying transactions are absent from the result.
pub fn aggregate<S>(source: &S, reference: DateTime<Utc>) -> Result<BTreeMap<String, RfmSnapshot>>
where
    S: TransactionSource + ?Sized,
{
    let totals = source.totals(&TotalsQuery::before(reference))?;
    let snapshots: BTreeMap<String, RfmSnapshot> = totals
        .into_iter()
        .filter(|t| t.count > 0)
        .map(|t| (t.customer_id.clone(), snapshot_from_totals(reference, t)))
        .collect();

    debug!(
        "Aggregated RFM for {} customers at {}",
        snapshots.len(),
        reference.to_rfc3339()
    );
    Ok(snapshots)
}

/// Point lookup for one customer using `now` as the reference instant
///
/// `None` means the customer has no transactions before `now`.
pub fn aggregate_one<S>(source: &S, customer_id: &str, now: DateTime<Utc>) -> Result<Option<RfmSnapshot>>
where
    S: TransactionSource + ?Sized,
{
    let query = TotalsQuery::before(now).for_customer(customer_id);
    let snapshot = source
        .totals(&query)?
        .into_iter()
        .find(|t| t.customer_id == customer_id && t.count > 0)
        .map(|t| snapshot_from_totals(now, t));
    Ok(snapshot)
}

/// Fold activity recorded after the baseline cutoff into a baseline row
///
/// Any such activity resets recency to 0; frequency grows by the number of
/// transactions and monetary by their sum. Empty activity leaves the row as is.
pub fn merge_activity(baseline: &RfmSnapshot, activity: &CustomerTotals) -> RfmSnapshot {
    if activity.count == 0 {
        return baseline.clone();
    }
    RfmSnapshot {
        customer_id: baseline.customer_id.clone(),
        recency: 0,
        frequency: baseline.frequency + activity.count,
        monetary: baseline.monetary + activity.amount_sum,
    }
}

/// Model inputs for a sequence of snapshots, in order
pub fn snapshot_vectors<'a, I>(snapshots: I) -> Vec<RfmVector>
where
    I: IntoIterator<Item = &'a RfmSnapshot>,
{
    snapshots.into_iter().map(RfmSnapshot::vector).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Transaction;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    fn store(rows: &[(&str, i64, f64)]) -> MemoryStore {
        let transactions = rows
            .iter()
            .map(|(id, d, amount)| Transaction::new(*id, day(*d), *amount).unwrap())
            .collect();
        MemoryStore::with_transactions(transactions).unwrap()
    }

    #[test]
    fn test_two_purchase_scenario() {
        let source = store(&[("C1", 0, 100.0), ("C1", 5, 50.0)]);
        let snapshots = aggregate(&source, day(10)).unwrap();

        let c1 = &snapshots["C1"];
        assert_eq!(c1.recency, 5);
        assert_eq!(c1.frequency, 2);
        assert_eq!(c1.monetary, 150.0);
    }

    #[test]
    fn test_customer_without_prior_transactions_is_omitted() {
        let source = store(&[("C1", 0, 100.0), ("C2", 10, 50.0), ("C3", 11, 1.0)]);
        let snapshots = aggregate(&source, day(10)).unwrap();

        assert_eq!(snapshots.len(), 1);
        assert!(snapshots.contains_key("C1"));
        assert!(!snapshots.contains_key("C2"));
    }

    #[test]
    fn test_recency_truncates_partial_days() {
        let reference = day(3);
        assert_eq!(recency_days(reference, reference - Duration::hours(23)), 0);
        assert_eq!(recency_days(reference, reference - Duration::hours(47)), 1);
        assert_eq!(recency_days(reference, reference - Duration::days(2)), 2);
    }

    #[test]
    fn test_aggregate_one() {
        let source = store(&[("C1", 0, 100.0), ("C1", 5, 50.0), ("C2", 1, 9.0)]);

        let c1 = aggregate_one(&source, "C1", day(7)).unwrap().unwrap();
        assert_eq!((c1.recency, c1.frequency, c1.monetary), (2, 2, 150.0));

        assert!(aggregate_one(&source, "missing", day(7)).unwrap().is_none());
        assert!(aggregate_one(&source, "C1", day(0)).unwrap().is_none());
    }

    #[test]
    fn test_named_references() {
        let mut config = PipelineConfig::default();
        assert_eq!(baseline_reference(&config), config.baseline_cutoff);

        let now = day(40);
        assert_eq!(live_reference(&config, now), now);

        config.live_lookahead = Duration::days(1);
        assert_eq!(live_reference(&config, now), day(41));
    }

    #[test]
    fn test_merge_activity_resets_recency() {
        let base = RfmSnapshot {
            customer_id: "C1".to_string(),
            recency: 40,
            frequency: 3,
            monetary: 90.0,
        };
        let activity = CustomerTotals {
            customer_id: "C1".to_string(),
            last_at: day(0),
            count: 2,
            amount_sum: 15.0,
        };

        let merged = merge_activity(&base, &activity);
        assert_eq!(merged.recency, 0);
        assert_eq!(merged.frequency, 5);
        assert_eq!(merged.monetary, 105.0);

        let idle = CustomerTotals {
            count: 0,
            amount_sum: 0.0,
            ..activity
        };
        assert_eq!(merge_activity(&base, &idle), base);
    }

    proptest! {
        #[test]
        fn aggregation_is_idempotent(
            rows in prop::collection::vec((0_u8..6, 0_i64..60, 0_u32..100_000), 0..60),
            reference in 0_i64..70,
        ) {
            let transactions: Vec<Transaction> = rows
                .iter()
                .map(|(c, d, cents)| {
                    Transaction::new(format!("C{}", c), day(*d), *cents as f64 / 100.0).unwrap()
                })
                .collect();
            let source = MemoryStore::with_transactions(transactions.clone()).unwrap();

            let first = aggregate(&source, day(reference)).unwrap();
            let second = aggregate(&source, day(reference)).unwrap();
            prop_assert_eq!(&first, &second);

            for (c, d, _) in &rows {
                let id = format!("C{}", c);
                let has_prior = transactions
                    .iter()
                    .any(|t| t.customer_id == id && t.occurred_at < day(reference));
                prop_assert_eq!(first.contains_key(&id), has_prior);
                if *d < reference {
                    prop_assert!(first[&id].frequency >= 1);
                }
            }

            for snapshot in first.values() {
                prop_assert!(snapshot.recency >= 0);
                prop_assert!(snapshot.monetary >= 0.0);
            }
        }
    }
}
