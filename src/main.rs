//! SegmentForge: customer segmentation dashboard on RFM metrics
//!
//! This is the main entrypoint that wires the transaction store, the cached
//! model artifacts and the baseline dataset, then renders one dashboard view.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use segmentforge::cli::{parse_rfm_values, Command};
use segmentforge::model::ArtifactNames;
use segmentforge::pipeline::{DriftReport, PurchaseOutcome, SegmentTable, VerificationReport};
use segmentforge::{
    live_reference, recommend, Args, Baseline, DirArtifactStore, DriftCheck, ModelHandle,
    Population, Segment, Segmenter, SqliteStore, StoreLocation,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Parse command-line arguments; a missing DATABASE_URL stops here
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = args.pipeline_config()?;
    let location =
        StoreLocation::parse(&args.database_url).context("Invalid DATABASE_URL")?;
    let store = SqliteStore::open(&location).context("Failed to open transaction store")?;

    let artifacts = DirArtifactStore::new(&args.artifacts);
    let model = Arc::new(ModelHandle::load(
        &artifacts,
        ArtifactNames::from_config(&config),
    ));

    // Raw vector classification needs neither the store nor the baseline
    if let Command::Classify { rfm } = &args.command {
        return run_classify(&model, rfm);
    }

    let baseline = Baseline::load_csv(&args.baseline)
        .with_context(|| format!("Failed to load baseline from {}", args.baseline.display()))?;
    let segmenter = Segmenter::new(store, model, Arc::new(baseline), config)?;

    let start_time = Instant::now();
    let now = Utc::now();

    match &args.command {
        Command::Summary => run_summary(&segmenter)?,
        Command::Profile { customer_id } => run_profile(&segmenter, customer_id, now)?,
        Command::Record {
            customer_id,
            amount,
        } => run_record(&segmenter, customer_id, *amount, now)?,
        Command::Segments { at_cutoff } => {
            let reference = if *at_cutoff {
                segmenter.config().baseline_cutoff
            } else {
                live_reference(segmenter.config(), now)
            };
            print_segments(&segmenter.segments(reference)?);
        }
        Command::Drift { recompute } => {
            let population = if *recompute {
                Population::Recomputed
            } else {
                Population::Merged
            };
            print_drift(&segmenter.drift_report(population, now)?);
        }
        Command::Verify => print_verification(&segmenter.verify_baseline()?),
        Command::Classify { rfm } => run_classify(segmenter.model(), rfm)?,
    }

    if args.verbose {
        println!(
            "\nProcessing time: {:.2}s",
            start_time.elapsed().as_secs_f64()
        );
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    debug!("SegmentForge v{} starting", env!("CARGO_PKG_VERSION"));
}

fn segment_name(label: segmentforge::ClusterLabel) -> &'static str {
    Segment::from_label(label).map_or("Unknown segment", Segment::name)
}

fn run_classify(model: &ModelHandle, rfm: &str) -> Result<()> {
    let vector = parse_rfm_values(rfm)?;
    println!("=== Classification ===");
    println!(
        "Input RFM values: R={}, F={}, M={}",
        vector.recency, vector.frequency, vector.monetary
    );

    let cluster = model.assign_one(vector)?;
    println!("\n✓ Cluster: {} ({})", cluster, segment_name(cluster));
    println!("  {}", recommend(cluster));
    Ok(())
}

fn run_summary<S: segmentforge::TransactionSource>(segmenter: &Segmenter<S>) -> Result<()> {
    let summary = segmenter.summary()?;

    println!("=== Dashboard ===");
    println!("Total customer base:       {}", summary.customer_count);
    println!("New transactions:          {}", summary.new_transactions);
    println!("Baseline customers:        {}", summary.baseline_customers);
    if summary.model_available {
        println!("Cluster model:             loaded");
    } else {
        println!("Cluster model:             UNAVAILABLE");
    }
    Ok(())
}

fn run_profile<S: segmentforge::TransactionSource>(
    segmenter: &Segmenter<S>,
    customer_id: &str,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let Some(profile) = segmenter.profile(customer_id, now)? else {
        println!("Customer {} not found", customer_id);
        return Ok(());
    };

    println!("=== Customer {} ===", customer_id);
    println!(
        "Cluster: {} ({})",
        profile.cluster,
        segment_name(profile.cluster)
    );
    println!("  Recency:   {} days", profile.snapshot.recency);
    println!("  Frequency: {}", profile.snapshot.frequency);
    println!("  Monetary:  {:.2}", profile.snapshot.monetary);
    println!("\nRecommendation:\n  {}", profile.recommendation);
    Ok(())
}

fn run_record<S: segmentforge::TransactionSource>(
    segmenter: &Segmenter<S>,
    customer_id: &str,
    amount: f64,
    now: chrono::DateTime<Utc>,
) -> Result<()> {
    let outcome = segmenter
        .record_purchase(customer_id, amount, now)
        .context("Transaction was not recorded")?;
    println!("✓ Transaction saved");

    match &outcome {
        PurchaseOutcome::Reclassified {
            snapshot,
            previous,
            current,
            recommendation,
        } => {
            println!("\nSegment change");
            println!("  Previous cluster: {} ({})", previous, segment_name(*previous));
            println!("  New cluster:      {} ({})", current, segment_name(*current));
            println!(
                "  RFM now: R={}, F={}, M={:.2}",
                snapshot.recency, snapshot.frequency, snapshot.monetary
            );
            if outcome.segment_changed() {
                println!("  Customer moved to another segment");
            } else {
                println!("  Segment unchanged");
            }
            println!("\nNew recommendation:\n  {}", recommendation);
        }
        PurchaseOutcome::NewCustomer { customer_id } => {
            println!("Customer {} is new and has no baseline segment yet", customer_id);
        }
    }
    Ok(())
}

fn print_segments(table: &SegmentTable) {
    println!("=== Segments at {} ===", table.reference.to_rfc3339());
    println!(
        "{:<16} {:>8} {:>10} {:>14} {:>8}",
        "Customer", "Recency", "Frequency", "Monetary", "Cluster"
    );
    for row in &table.rows {
        println!(
            "{:<16} {:>8} {:>10} {:>14.2} {:>8}",
            row.snapshot.customer_id,
            row.snapshot.recency,
            row.snapshot.frequency,
            row.snapshot.monetary,
            row.cluster.value()
        );
    }

    println!("\n=== Cluster Statistics ===");
    let total = table.rows.len().max(1) as f64;
    for (i, &size) in table.sizes.iter().enumerate() {
        let percentage = size as f64 / total * 100.0;
        println!("Cluster {}: {} customers ({:.1}%)", i, size, percentage);
    }
}

fn print_drift(report: &DriftReport) {
    println!("=== Data Drift Detection ===");
    println!(
        "Baseline: {} customers, current: {} customers ({:?}), significance {}",
        report.baseline_size, report.current_size, report.population, report.significance
    );

    for check in &report.checks {
        println!("\nVariable: {}", check.metric());
        match check {
            DriftCheck::Verdict(verdict) => {
                println!("  KS statistic: {:.4}", verdict.statistic);
                println!("  p-value:      {:.4}", verdict.p_value);
                if verdict.drift_detected {
                    println!("  Status:       DRIFT DETECTED, retrain the model");
                } else {
                    println!("  Status:       stable");
                }
            }
            DriftCheck::Skipped { reason, .. } => {
                println!("  Status:       skipped ({})", reason);
            }
        }
    }
}

fn print_verification(report: &VerificationReport) {
    println!("=== Baseline Verification ===");
    println!("Checked customers: {}", report.checked);

    for id in &report.missing {
        println!("Missing from store: {}", id);
    }
    for id in &report.unexpected {
        println!("Not in baseline:    {}", id);
    }
    for m in &report.metric_mismatches {
        println!(
            "Customer {} {}: baseline {} vs store {}",
            m.customer_id, m.metric, m.expected, m.actual
        );
    }
    for m in &report.label_mismatches {
        println!(
            "Customer {} cluster: baseline {} vs model {}",
            m.customer_id, m.expected, m.actual
        );
    }

    if report.is_consistent() {
        println!("\n✓ Baseline matches the store");
    } else {
        println!(
            "\n{} metric and {} label mismatches",
            report.metric_mismatches.len(),
            report.label_mismatches.len()
        );
    }
}
