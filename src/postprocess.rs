// src/postprocess.rs
//
// Cross-run enrichment: loads the previous run's report (if any), computes
// each relay's consecutive-failure streak, and adds the failures/grouping
// views the operator-facing report carries. Runs after the reporter, as a
// second atomic overwrite of the same report file.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use tracing::info;

use crate::report::{ProbeResult, RunReport};

/// Enriches `report` in place using `previous`, per the consecutive-failure
/// algorithm: a success always resets the streak to 0; a failure extends the
/// previous streak by one if the relay also failed last run, or starts a new
/// streak at 1 otherwise (including when the relay is new or not found).
pub fn postprocess(mut report: RunReport, previous: Option<&RunReport>) -> RunReport {
    let previous_index: BTreeMap<&str, &ProbeResult> = previous
        .map(|p| p.results.iter().map(|r| (r.fingerprint.as_str(), r)).collect())
        .unwrap_or_default();

    for result in &mut report.results {
        result.consecutive_failures = Some(if result.ok {
            0
        } else {
            match previous_index.get(result.fingerprint.as_str()) {
                Some(prev) if !prev.ok => prev.consecutive_failures.unwrap_or(0) + 1,
                _ => 1,
            }
        });
    }

    let failures: Vec<ProbeResult> = report.results.iter().filter(|r| !r.ok).cloned().collect();

    let mut failures_by_address: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for result in &failures {
        failures_by_address
            .entry(result.address.clone())
            .or_default()
            .push(result.fingerprint.clone());
    }

    info!(failures = failures.len(), "post-processed run report");

    report.failures = Some(failures);
    report.failures_by_address = Some(failures_by_address);
    report
}

/// Loads the current report, the optional previous report, runs
/// `postprocess`, and overwrites the current report file atomically.
pub fn postprocess_file(current_path: &Path, previous_path: Option<&Path>) -> Result<RunReport> {
    let current = RunReport::load(current_path)?;
    let previous = previous_path.map(RunReport::load).transpose()?;

    let enriched = postprocess(current, previous.as_ref());
    enriched.write_atomically(current_path)?;
    Ok(enriched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::FailType;

    fn result(fp: &str, address: &str, ok: bool, consecutive_failures: Option<u32>) -> ProbeResult {
        if ok {
            ProbeResult::success(fp, "R", address, "r", None, Some(1))
        } else {
            let mut r = ProbeResult::failure(fp, "R", address, "r", FailType::Dns, "nxdomain", "x", None, None);
            r.consecutive_failures = consecutive_failures;
            r
        }
    }

    #[test]
    fn success_resets_streak_to_zero() {
        let previous = RunReport::build("p", vec![result("AAAA", "1.1.1.1", false, Some(3))]);
        let current = RunReport::build("r", vec![result("AAAA", "1.1.1.1", true, None)]);
        let enriched = postprocess(current, Some(&previous));
        assert_eq!(enriched.results[0].consecutive_failures, Some(0));
    }

    #[test]
    fn repeated_failure_increments_streak() {
        let previous = RunReport::build("p", vec![result("BBBB", "1.1.1.2", false, Some(3))]);
        let current = RunReport::build("r", vec![result("BBBB", "1.1.1.2", false, None)]);
        let enriched = postprocess(current, Some(&previous));
        assert_eq!(enriched.results[0].consecutive_failures, Some(4));
    }

    #[test]
    fn new_failure_with_no_previous_record_starts_at_one() {
        let previous = RunReport::build("p", vec![]);
        let current = RunReport::build("r", vec![result("CCCC", "1.1.1.3", true, None)]);
        let enriched = postprocess(current, Some(&previous));
        assert_eq!(enriched.results[0].consecutive_failures, Some(0));
    }

    #[test]
    fn scenario_s6_full_continuity() {
        let previous = RunReport::build(
            "p",
            vec![result("BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB", "203.0.113.2", false, Some(3))],
        );
        let current = RunReport::build(
            "r",
            vec![
                result("BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB", "203.0.113.2", false, None),
                result("CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC", "203.0.113.3", true, None),
            ],
        );
        let enriched = postprocess(current, Some(&previous));
        let by_fp: BTreeMap<&str, &ProbeResult> = enriched
            .results
            .iter()
            .map(|r| (r.fingerprint.as_str(), r))
            .collect();
        assert_eq!(
            by_fp["BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB"].consecutive_failures,
            Some(4)
        );
        assert_eq!(
            by_fp["CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC"].consecutive_failures,
            Some(0)
        );
        assert_eq!(enriched.failures.as_ref().unwrap().len(), 1);
        assert!(enriched.failures_by_address.as_ref().unwrap().contains_key("203.0.113.2"));
    }

    #[test]
    fn no_previous_report_treats_every_failure_as_new() {
        let current = RunReport::build("r", vec![result("DDDD", "1.1.1.4", false, None)]);
        let enriched = postprocess(current, None);
        assert_eq!(enriched.results[0].consecutive_failures, Some(1));
    }
}
