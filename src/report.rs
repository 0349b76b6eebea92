// src/report.rs
//
// The Probe Result / Run Report data model and the teardown-time merge
// ("Run Reporter" in the spec) that folds every per-relay artifact into
// one report document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailType {
    Dns,
    Circuit,
    Timeout,
    Bug,
}

impl FailType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailType::Dns => "dns",
            FailType::Circuit => "circuit",
            FailType::Timeout => "timeout",
            FailType::Bug => "bug",
        }
    }
}

/// One relay's outcome for this run. `ok == true` iff no `fail_*` field is
/// present -- enforced by only ever constructing this through
/// `ProbeResult::success`/`ProbeResult::failure`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub fingerprint: String,
    pub nickname: String,
    pub address: String,
    pub timestamp: String,
    pub run_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_type: Option<FailType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_failures: Option<u32>,
}

impl ProbeResult {
    #[allow(clippy::too_many_arguments)]
    pub fn success(
        fingerprint: &str,
        nickname: &str,
        address: &str,
        run_id: &str,
        resolved_ip: Option<String>,
        latency_ms: Option<i64>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            nickname: nickname.to_string(),
            address: address.to_string(),
            timestamp: now_iso8601(),
            run_id: run_id.to_string(),
            ok: true,
            resolved_ip,
            latency_ms,
            fail_type: None,
            fail_reason: None,
            error: None,
            consecutive_failures: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn failure(
        fingerprint: &str,
        nickname: &str,
        address: &str,
        run_id: &str,
        fail_type: FailType,
        fail_reason: impl Into<String>,
        error: impl Into<String>,
        resolved_ip: Option<String>,
        latency_ms: Option<i64>,
    ) -> Self {
        let mut error = error.into();
        error.truncate(200);
        Self {
            fingerprint: fingerprint.to_string(),
            nickname: nickname.to_string(),
            address: address.to_string(),
            timestamp: now_iso8601(),
            run_id: run_id.to_string(),
            ok: false,
            resolved_ip,
            latency_ms,
            fail_type: Some(fail_type),
            fail_reason: Some(fail_reason.into()),
            error: Some(error),
            consecutive_failures: None,
        }
    }

    pub fn artifact_path(analysis_dir: &Path, fingerprint: &str) -> PathBuf {
        analysis_dir.join(format!("result_{fingerprint}.json"))
    }

    /// Writes the single per-relay artifact. Per spec, a write failure is
    /// logged and simply leaves no artifact -- never a partially written one.
    pub fn write_artifact(&self, analysis_dir: &Path) -> Result<()> {
        let path = Self::artifact_path(analysis_dir, &self.fingerprint);
        let json = serde_json::to_string_pretty(self).context("serializing probe result")?;
        std::fs::write(&path, json).with_context(|| format!("writing artifact {path:?}"))
    }
}

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    pub timestamp: String,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub by_fail_type: BTreeMap<String, usize>,
    pub pass_rate_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub metadata: RunMetadata,
    pub results: Vec<ProbeResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<Vec<ProbeResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures_by_address: Option<BTreeMap<String, Vec<String>>>,
}

impl RunReport {
    pub fn build(run_id: &str, results: Vec<ProbeResult>) -> Self {
        let total = results.len();
        let passed = results.iter().filter(|r| r.ok).count();
        let failed = total - passed;

        let mut by_fail_type: BTreeMap<String, usize> = BTreeMap::new();
        for r in &results {
            if let Some(ft) = r.fail_type {
                *by_fail_type.entry(ft.as_str().to_string()).or_insert(0) += 1;
            }
        }

        let pass_rate_percent = if total == 0 {
            0.0
        } else {
            round2(100.0 * passed as f64 / total as f64)
        };

        RunReport {
            metadata: RunMetadata {
                run_id: run_id.to_string(),
                timestamp: now_iso8601(),
                total,
                passed,
                failed,
                by_fail_type,
                pass_rate_percent,
            },
            results,
            failures: None,
            failures_by_address: None,
        }
    }

    pub fn path(analysis_dir: &Path, run_id: &str) -> PathBuf {
        analysis_dir.join(format!("dnshealth_{run_id}.json"))
    }

    /// Write-then-rename so a reader never observes a partially written file.
    pub fn write_atomically(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("serializing run report")?;
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("writing temp report {tmp_path:?}"))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {tmp_path:?} to {path:?}"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading run report {path:?}"))?;
        serde_json::from_str(&content).context("parsing run report JSON")
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Merges every `result_*.json` artifact in `analysis_dir` into one
/// `RunReport`, deleting each artifact as it is folded in. Parse errors are
/// logged and the artifact is skipped -- `total` reflects only artifacts
/// that parsed.
pub fn merge_artifacts(analysis_dir: &Path, run_id: &str) -> Result<RunReport> {
    let mut results = Vec::new();

    let entries = std::fs::read_dir(analysis_dir)
        .with_context(|| format!("reading analysis dir {analysis_dir:?}"))?;

    for entry in entries {
        let entry = entry.context("reading analysis dir entry")?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !(name.starts_with("result_") && name.ends_with(".json")) {
            continue;
        }

        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<ProbeResult>(&content) {
                Ok(result) => {
                    results.push(result);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unparseable probe artifact");
                }
            },
            Err(e) => {
                warn!(file = %path.display(), error = %e, "could not read probe artifact");
            }
        }

        if let Err(e) = std::fs::remove_file(&path) {
            debug!(file = %path.display(), error = %e, "could not remove consumed artifact");
        }
    }

    info!(run_id, total = results.len(), "merged per-relay artifacts into run report");
    Ok(RunReport::build(run_id, results))
}
