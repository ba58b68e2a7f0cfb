//! Distribution drift detection with the two-sample Kolmogorov-Smirnov test

use crate::config::DEFAULT_SIGNIFICANCE;
use crate::data::{Metric, RfmSnapshot};
use crate::error::{PipelineError, Result};
use tracing::debug;

/// Largest `n * m` for which the exact p-value is computed
pub const EXACT_LIMIT: u64 = 1_000_000;

/// KS statistic and two-sided p-value for one pair of samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KsOutcome {
    pub statistic: f64,
    pub p_value: f64,
}

/// Two-sample Kolmogorov-Smirnov test
///
/// Either sample being empty leaves the test undefined and is reported as
/// insufficient data.
pub fn ks_2samp(baseline: &[f64], current: &[f64]) -> Result<KsOutcome> {
    if baseline.is_empty() || current.is_empty() {
        return Err(PipelineError::InsufficientDataForDrift(format!(
            "baseline has {} values, current has {}",
            baseline.len(),
            current.len()
        )));
    }
    if baseline.iter().chain(current).any(|v| !v.is_finite()) {
        return Err(PipelineError::InvalidInput(
            "drift samples must be finite".to_string(),
        ));
    }

    let n = baseline.len() as u64;
    let m = current.len() as u64;
    let k = max_ecdf_gap(baseline, current);
    let statistic = k as f64 / (n as f64 * m as f64);

    let p_value = if k == 0 {
        1.0
    } else if n.saturating_mul(m) <= EXACT_LIMIT {
        exact_p_value(n, m, k)
    } else {
        asymptotic_p_value(n, m, statistic)
    };

    Ok(KsOutcome {
        statistic,
        p_value: p_value.clamp(0.0, 1.0),
    })
}

/// `max |i*m - j*n|` over the merged sorted samples, i.e. `D * n * m`
fn max_ecdf_gap(baseline: &[f64], current: &[f64]) -> u64 {
    let mut a = baseline.to_vec();
    let mut b = current.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let n = a.len() as i128;
    let m = b.len() as i128;
    let (mut i, mut j) = (0_usize, 0_usize);
    let mut gap: i128 = 0;

    while i < a.len() && j < b.len() {
        let value = a[i].min(b[j]);
        while i < a.len() && a[i] <= value {
            i += 1;
        }
        while j < b.len() && b[j] <= value {
            j += 1;
        }
        gap = gap.max((i as i128 * m - j as i128 * n).abs());
    }

    gap as u64
}

/// Probability that a uniformly random lattice path from (0,0) to (n,m)
/// reaches `|i*m - j*n| >= k`
fn exact_p_value(n: u64, m: u64, k: u64) -> f64 {
    let (n, m) = (n as usize, m as usize);
    let inside = |i: usize, j: usize| ((i * m) as i128 - (j * n) as i128).unsigned_abs() < k as u128;

    let mut row = vec![0.0_f64; m + 1];
    row[0] = 1.0;

    for i in 0..=n {
        let mut next = vec![0.0_f64; m + 1];
        for j in 0..=m {
            let p = row[j];
            if p == 0.0 {
                continue;
            }
            let remaining = ((n - i) + (m - j)) as f64;
            if remaining == 0.0 {
                continue;
            }
            if i < n && inside(i + 1, j) {
                next[j] += p * (n - i) as f64 / remaining;
            }
            if j < m && inside(i, j + 1) {
                row[j + 1] += p * (m - j) as f64 / remaining;
            }
        }
        if i == n {
            return 1.0 - row[m];
        }
        row = next;
    }

    1.0
}

/// Kolmogorov distribution tail with Stephens' small-sample correction
fn asymptotic_p_value(n: u64, m: u64, statistic: f64) -> f64 {
    let en = (n as f64 * m as f64) / (n as f64 + m as f64);
    let root = en.sqrt();
    kolmogorov_survival((root + 0.12 + 0.11 / root) * statistic)
}

fn kolmogorov_survival(lambda: f64) -> f64 {
    const EPS1: f64 = 1e-3;
    const EPS2: f64 = 1e-8;

    let a2 = -2.0 * lambda * lambda;
    let mut sign = 2.0;
    let mut sum = 0.0;
    let mut previous = 0.0_f64;

    for j in 1..=100 {
        let j = j as f64;
        let term = sign * (a2 * j * j).exp();
        sum += term;
        if term.abs() <= EPS1 * previous || term.abs() <= EPS2 * sum {
            return sum;
        }
        sign = -sign;
        previous = term.abs();
    }

    // No convergence means lambda is tiny and the tail is 1
    1.0
}

/// Per-metric drift result
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftVerdict {
    pub metric: Metric,
    pub statistic: f64,
    pub p_value: f64,
    pub drift_detected: bool,
}

/// Outcome of checking one metric
#[derive(Debug, Clone, PartialEq)]
pub enum DriftCheck {
    Verdict(DriftVerdict),
    /// The test could not be run, e.g. one population is empty
    Skipped { metric: Metric, reason: String },
}

impl DriftCheck {
    pub fn metric(&self) -> Metric {
        match self {
            DriftCheck::Verdict(v) => v.metric,
            DriftCheck::Skipped { metric, .. } => *metric,
        }
    }

    pub fn verdict(&self) -> Option<&DriftVerdict> {
        match self {
            DriftCheck::Verdict(v) => Some(v),
            DriftCheck::Skipped { .. } => None,
        }
    }
}

/// KS drift detector with a fixed significance level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriftDetector {
    significance: f64,
}

impl Default for DriftDetector {
    fn default() -> Self {
        Self {
            significance: DEFAULT_SIGNIFICANCE,
        }
    }
}

impl DriftDetector {
    pub fn new(significance: f64) -> Result<Self> {
        if !(significance > 0.0 && significance < 1.0) {
            return Err(PipelineError::Config(format!(
                "significance must lie in (0, 1), got {}",
                significance
            )));
        }
        Ok(Self { significance })
    }

    pub fn significance(&self) -> f64 {
        self.significance
    }

    /// Run the test on one metric's samples; drift is `p_value < significance`
    pub fn detect(&self, baseline: &[f64], current: &[f64]) -> Result<(f64, bool)> {
        let outcome = ks_2samp(baseline, current)?;
        Ok((outcome.p_value, outcome.p_value < self.significance))
    }

    pub fn check(&self, metric: Metric, baseline: &[f64], current: &[f64]) -> DriftCheck {
        match ks_2samp(baseline, current) {
            Ok(outcome) => {
                let verdict = DriftVerdict {
                    metric,
                    statistic: outcome.statistic,
                    p_value: outcome.p_value,
                    drift_detected: outcome.p_value < self.significance,
                };
                debug!(
                    "Drift check {}: D={:.4} p={:.4} drift={}",
                    metric, verdict.statistic, verdict.p_value, verdict.drift_detected
                );
                DriftCheck::Verdict(verdict)
            }
            Err(e) => DriftCheck::Skipped {
                metric,
                reason: e.to_string(),
            },
        }
    }

    /// Test recency, frequency and monetary independently
    pub fn detect_metrics<'a, 'b, B, C>(&self, baseline: B, current: C) -> Vec<DriftCheck>
    where
        B: IntoIterator<Item = &'a RfmSnapshot>,
        C: IntoIterator<Item = &'b RfmSnapshot>,
    {
        let baseline: Vec<&RfmSnapshot> = baseline.into_iter().collect();
        let current: Vec<&RfmSnapshot> = current.into_iter().collect();

        Metric::ALL
            .iter()
            .map(|&metric| {
                let before: Vec<f64> = baseline.iter().map(|s| s.metric(metric)).collect();
                let after: Vec<f64> = current.iter().map(|s| s.metric(metric)).collect();
                self.check(metric, &before, &after)
            })
            .collect()
    }
}
