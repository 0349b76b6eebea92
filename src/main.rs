// src/main.rs

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info};

use tor_dns_scan::config::{self, Cli};
use tor_dns_scan::engine::ScanEngine;
use tor_dns_scan::report::{self, RunReport};
use tor_dns_scan::selector::select;
use tor_dns_scan::{consensus, error, postprocess};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // ------------------------------------------------------------
    // 1. Logging
    // ------------------------------------------------------------
    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let run_id = Utc::now().format("%Y%m%d%H%M%S").to_string();
    info!(run_id = %run_id, "starting DNS health scan");

    // ------------------------------------------------------------
    // 2. Resolve configuration
    // ------------------------------------------------------------
    let scan_config = args.into_scan_config().context("resolving scan configuration")?;

    // ------------------------------------------------------------
    // 3. Load consensus and select relays
    // ------------------------------------------------------------
    let status = config::load_consensus(&scan_config.consensus_path)?;
    if status.relays.is_empty() {
        error!("consensus document contained no relays");
        return Err(error::ScanError::NoConsensus.into());
    }

    let selected: Vec<consensus::Relay> = select(&status, &scan_config.selection, None, scan_config.shard)
        .into_iter()
        .cloned()
        .collect();
    info!(count = selected.len(), "relays selected for this run");

    // ------------------------------------------------------------
    // 4. Run the scan engine
    // ------------------------------------------------------------
    let engine = ScanEngine::new(scan_config.engine, run_id.clone());
    let dispatched = engine
        .run(&scan_config.control_port, &scan_config.control_auth, &status, selected)
        .await
        .context("running scan engine")?
        .len();
    info!(dispatched, "all probe workers reached a terminal outcome");

    // ------------------------------------------------------------
    // 5. Reporter: merge per-relay artifacts and write the run report
    // ------------------------------------------------------------
    let report = report::merge_artifacts(&scan_config.analysis_dir, &run_id).context("merging probe artifacts")?;
    let report_path = RunReport::path(&scan_config.analysis_dir, &run_id);
    report.write_atomically(&report_path).context("writing run report")?;

    // ------------------------------------------------------------
    // 6. Post-processor (optional)
    // ------------------------------------------------------------
    let report = match scan_config.previous_report.as_deref() {
        Some(previous_path) => {
            postprocess::postprocess_file(&report_path, Some(previous_path)).context("post-processing run report")?
        }
        None => report,
    };

    println!(
        "{}/{}/{} (total/passed/failed) -> {}",
        report.metadata.total,
        report.metadata.passed,
        report.metadata.failed,
        report_path.display()
    );

    info!(
        total = report.metadata.total,
        passed = report.metadata.passed,
        failed = report.metadata.failed,
        "scan complete"
    );

    Ok(())
}
