// src/config.rs
//
// CLI surface (clap::Parser) plus the conversion into the engine's
// immutable configuration types. One parse site, in `main`, mirrors the
// teacher's `Args`/`Config::load` split.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::consensus::NetworkStatus;
use crate::engine::{resolve_probe_mode, EngineConfig};
use crate::error::ScanError;
use crate::probe::RetryConfig;
use crate::selector::{Selection, Shard};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory for per-relay artifacts and the final run report.
    #[arg(long)]
    pub analysis_dir: PathBuf,

    /// Path to a cached consensus document (directory-fetch is out of scope
    /// for this crate; see the Relay Selector design notes).
    #[arg(long)]
    pub consensus: PathBuf,

    /// Enables NXDOMAIN mode with this base domain instead of wildcard mode.
    #[arg(short = 'H', long = "nxdomain-base")]
    pub nxdomain_base: Option<String>,

    /// Base domain for wildcard-mode probe queries.
    #[arg(long)]
    pub base_domain: Option<String>,

    /// Wildcard-mode target IPv4 literal; mutually exclusive with -H.
    #[arg(long)]
    pub expected_ip: Option<Ipv4Addr>,

    /// Probe exactly one relay fingerprint.
    #[arg(short = 'e', long = "exit")]
    pub fingerprint: Option<String>,

    /// Restrict to fingerprints listed in this file, one per line.
    #[arg(short = 'E', long = "exit-file")]
    pub fingerprint_file: Option<PathBuf>,

    /// Restrict to a country code (requires an external geo-IP lookup).
    #[arg(short = 'C', long)]
    pub country: Option<String>,

    /// Include BadExit-flagged relays alongside ordinary exits.
    #[arg(long, conflicts_with = "bad_exits")]
    pub all_exits: bool,

    /// Probe only BadExit-flagged relays.
    #[arg(long)]
    pub bad_exits: bool,

    /// Distribute the exit set across hosts: this host's `N/M` shard.
    #[arg(long)]
    pub shard: Option<String>,

    /// Force this fingerprint as the first hop instead of a random guard.
    #[arg(long)]
    pub first_hop: Option<String>,

    /// Tor control port address.
    #[arg(long, default_value = "127.0.0.1:9051")]
    pub control_port: String,

    /// Cookie-file path for control port authentication.
    #[arg(long)]
    pub control_auth_cookie: Option<PathBuf>,

    /// Password for control port authentication.
    #[arg(long)]
    pub control_password: Option<String>,

    /// Tor SOCKS port address.
    #[arg(long, default_value = "127.0.0.1:9050")]
    pub socks_port: String,

    /// Seconds between successive circuit builds.
    #[arg(long, default_value_t = 2.0)]
    pub build_delay: f64,

    /// Uniform random jitter added to `build_delay`, in seconds.
    #[arg(long, default_value_t = 1.0)]
    pub delay_noise: f64,

    /// Maximum number of in-flight probes.
    #[arg(long, default_value_t = 10)]
    pub max_inflight: usize,

    /// Per-exchange SOCKS RESOLVE timeout, in seconds.
    #[arg(long, default_value_t = 10)]
    pub query_timeout: u64,

    /// Whole-probe timeout (all attempts for one relay), in seconds.
    #[arg(long, default_value_t = 180)]
    pub hard_probe_timeout: u64,

    /// Additional attempts after a `circuit`-class failure.
    #[arg(long, default_value_t = 2)]
    pub circuit_retries: u32,

    /// Additional attempts after a `timeout`-class failure.
    #[arg(long, default_value_t = 1)]
    pub timeout_retries: u32,

    /// Previous run's report, for consecutive-failure accounting.
    #[arg(long)]
    pub previous_report: Option<PathBuf>,

    /// Raise the tracing filter to debug.
    #[arg(short, long)]
    pub verbose: bool,
}

/// The fully resolved, run-ready configuration. Built once in `main` and
/// passed by reference into the engine, selector, and reporter.
pub struct ScanConfig {
    pub analysis_dir: PathBuf,
    pub consensus_path: PathBuf,
    pub engine: EngineConfig,
    pub selection: Selection,
    pub shard: Option<Shard>,
    pub control_port: String,
    pub control_auth: crate::control::ControlAuth,
    pub previous_report: Option<PathBuf>,
}

impl Cli {
    pub fn into_scan_config(self) -> Result<ScanConfig> {
        let (base_domain, mode) =
            resolve_probe_mode(self.nxdomain_base, self.expected_ip).context("resolving probe mode")?;
        let base_domain = if base_domain.is_empty() {
            self.base_domain.context("--base-domain is required in wildcard mode")?
        } else {
            base_domain
        };

        let selection = if self.bad_exits {
            Selection::BadExitsOnly
        } else if self.all_exits {
            Selection::AllExits
        } else if let Some(fp) = self.fingerprint {
            Selection::Fingerprint(fp)
        } else if let Some(path) = self.fingerprint_file {
            Selection::from_fingerprint_file(&path)
                .map_err(|_| ScanError::FingerprintFileUnreadable(path))?
        } else if let Some(cc) = self.country {
            Selection::Country(cc)
        } else {
            Selection::Default
        };

        let shard = match self.shard {
            Some(spec) => {
                Some(Shard::parse(&spec).ok_or_else(|| ScanError::InvalidShard(spec.clone()))?)
            }
            None => None,
        };

        let control_auth = match (self.control_auth_cookie, self.control_password) {
            (Some(path), _) => crate::control::ControlAuth::CookieFile(path),
            (None, Some(pw)) => crate::control::ControlAuth::Password(pw),
            (None, None) => crate::control::ControlAuth::Null,
        };

        std::fs::create_dir_all(&self.analysis_dir)
            .map_err(|_| ScanError::AnalysisDirUnwritable(self.analysis_dir.clone()))?;

        let engine = EngineConfig {
            analysis_dir: self.analysis_dir.clone(),
            socks_addr: self.socks_port,
            base_domain,
            mode,
            first_hop: self.first_hop,
            build_delay: std::time::Duration::from_secs_f64(self.build_delay),
            delay_noise: std::time::Duration::from_secs_f64(self.delay_noise),
            max_inflight: self.max_inflight,
            retry: RetryConfig {
                circuit_retries: self.circuit_retries,
                timeout_retries: self.timeout_retries,
                circuit_retry_delay: std::time::Duration::from_millis(500),
                query_timeout: std::time::Duration::from_secs(self.query_timeout),
            },
            hard_probe_timeout: std::time::Duration::from_secs(self.hard_probe_timeout),
        };

        Ok(ScanConfig {
            analysis_dir: self.analysis_dir,
            consensus_path: self.consensus,
            engine,
            selection,
            shard,
            control_port: self.control_port,
            control_auth,
            previous_report: self.previous_report,
        })
    }
}

/// Loads and parses the cached consensus document this crate expects an
/// external fetcher to have placed on disk (see spec sec. 1 for why
/// directory-fetch itself is out of scope).
pub fn load_consensus(path: &std::path::Path) -> Result<NetworkStatus> {
    let document = std::fs::read_to_string(path)
        .map_err(|_| ScanError::NoConsensus)
        .with_context(|| format!("reading consensus document {path:?}"))?;
    NetworkStatus::parse(&document).context("parsing consensus document")
}
