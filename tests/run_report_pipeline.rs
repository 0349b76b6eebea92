// tests/run_report_pipeline.rs
//
// Exercises the on-disk teardown pipeline end to end: per-relay artifacts
// written to a temp analysis directory, merged into a run report, then
// enriched against a previous run's report -- the same filesystem path the
// binary drives, just without a real Tor process behind it.

use std::collections::BTreeMap;

use tor_dns_scan::postprocess::postprocess_file;
use tor_dns_scan::report::{merge_artifacts, FailType, ProbeResult, RunReport};

fn temp_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("tor-dns-scan-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn teardown_leaves_no_artifacts_and_exactly_one_report() {
    let dir = temp_dir("teardown");

    ProbeResult::success("AAAA", "RelayA", "203.0.113.1", "r1", Some("64.65.4.1".into()), Some(100))
        .write_artifact(&dir)
        .unwrap();
    ProbeResult::failure("BBBB", "RelayB", "203.0.113.2", "r1", FailType::Dns, "nxdomain", "x", None, None)
        .write_artifact(&dir)
        .unwrap();
    ProbeResult::failure("CCCC", "RelayC", "203.0.113.3", "r1", FailType::Circuit, "socks_error", "x", None, None)
        .write_artifact(&dir)
        .unwrap();

    let report = merge_artifacts(&dir, "r1").unwrap();
    assert_eq!(report.metadata.total, 3);
    assert_eq!(report.metadata.passed, 1);
    assert_eq!(report.metadata.failed, 2);

    let report_path = RunReport::path(&dir, "r1");
    report.write_atomically(&report_path).unwrap();

    let remaining: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert!(remaining.iter().all(|n| !n.starts_with("result_")));
    assert_eq!(remaining.iter().filter(|n| n.starts_with("dnshealth_")).count(), 1);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn unparseable_artifact_is_skipped_not_fatal() {
    let dir = temp_dir("skip-bad");

    ProbeResult::success("AAAA", "RelayA", "203.0.113.1", "r1", Some("64.65.4.1".into()), Some(10))
        .write_artifact(&dir)
        .unwrap();
    std::fs::write(dir.join("result_BAD.json"), b"{not valid json").unwrap();

    let report = merge_artifacts(&dir, "r1").unwrap();
    assert_eq!(report.metadata.total, 1);
    assert_eq!(report.metadata.passed, 1);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn s6_postprocess_continuity_across_two_runs() {
    let dir = temp_dir("continuity");

    // Previous run: B failed three times in a row, C passed.
    let previous = RunReport::build(
        "prev",
        vec![
            {
                let mut r = ProbeResult::failure(
                    "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB", "RelayB", "203.0.113.2", "prev",
                    FailType::Dns, "nxdomain", "x", None, None,
                );
                r.consecutive_failures = Some(3);
                r
            },
            ProbeResult::success("CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC", "RelayC", "203.0.113.3", "prev", None, Some(5)),
        ],
    );
    let previous_path = dir.join("dnshealth_prev.json");
    previous.write_atomically(&previous_path).unwrap();

    // Current run: B fails again, C now also fails.
    ProbeResult::failure(
        "BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB", "RelayB", "203.0.113.2", "curr",
        FailType::Dns, "nxdomain", "x", None, None,
    )
    .write_artifact(&dir)
    .unwrap();
    ProbeResult::failure(
        "CCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCCC", "RelayC", "203.0.113.3", "curr",
        FailType::Circuit, "socks_error", "y", None, None,
    )
    .write_artifact(&dir)
    .unwrap();

    let current = merge_artifacts(&dir, "curr").unwrap();
    let current_path = RunReport::path(&dir, "curr");
    current.write_atomically(&current_path).unwrap();

    let enriched = postprocess_file(&current_path, Some(&previous_path)).unwrap();

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
        Some(1)
    );
    assert_eq!(enriched.failures.as_ref().unwrap().len(), 2);
    assert_eq!(enriched.failures_by_address.as_ref().unwrap().len(), 2);

    std::fs::remove_dir_all(&dir).ok();
}
