// src/probe.rs
//
// The retry-aware DNS probe: one relay, one or more circuit/resolve
// attempts, one terminal `ProbeResult`. Per REDESIGN FLAGS this is built
// around a closed outcome enum rather than distinct exception types or
// string-matched error text, and the final result is assembled once at the
// end of the loop rather than mutated across attempts.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::consensus::Relay;
use crate::query::QueryNameGenerator;
use crate::report::{FailType, ProbeResult};
use crate::socks::{classify_socks_error, ResolveOutcome, SocksFailClass, SocksResolver};

/// Wildcard mode compares against a known-good IPv4 literal; NXDOMAIN mode
/// treats any answer (including NXDOMAIN itself) as success.
#[derive(Debug, Clone)]
pub enum ProbeMode {
    Wildcard { expected_ip: Ipv4Addr },
    Nxdomain,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub circuit_retries: u32,
    pub timeout_retries: u32,
    pub circuit_retry_delay: Duration,
    pub query_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            circuit_retries: 2,
            timeout_retries: 1,
            circuit_retry_delay: Duration::from_millis(500),
            query_timeout: Duration::from_secs(10),
        }
    }
}

/// What the engine handed the worker: either a built circuit to probe over,
/// or a FAILED event that arrived before the worker had a circuit to use.
pub enum CircuitOutcome {
    Built { circuit_id: u32 },
    Failed { reason: String },
}

/// Supplies circuits to a probe worker. The coordinator is the only thing
/// that actually talks to the Tor control port (see spec sec. 5); this is
/// the worker-facing seam for that rule.
pub trait CircuitProvider: Send + Sync {
    fn request<'a>(
        &'a self,
        exit_fingerprint: &'a str,
    ) -> Pin<Box<dyn Future<Output = CircuitOutcome> + Send + 'a>>;

    fn close(&self, circuit_id: u32);
}

/// One classified attempt outcome. This is the sum type REDESIGN FLAGS
/// calls for in place of per-error-kind exceptions.
enum AttemptOutcome {
    Success { resolved_ip: String },
    Dns { reason: &'static str, detail: String },
    Circuit { detail: String },
    Timeout,
}

fn classify_resolve(outcome: ResolveOutcome, mode: &ProbeMode) -> AttemptOutcome {
    match outcome {
        ResolveOutcome::Answer(ip) => match mode {
            ProbeMode::Wildcard { expected_ip } if ip == *expected_ip => AttemptOutcome::Success {
                resolved_ip: ip.to_string(),
            },
            ProbeMode::Wildcard { expected_ip } => AttemptOutcome::Dns {
                reason: "wrong_ip",
                detail: format!("expected {expected_ip}, got {ip}"),
            },
            ProbeMode::Nxdomain => AttemptOutcome::Success {
                resolved_ip: ip.to_string(),
            },
        },
        // An unparseable/IPv6 answer is `wrong_ip` in wildcard mode (the
        // expectation is IPv4) and a success in NXDOMAIN mode, per the
        // probe worker's edge-case rule.
        ResolveOutcome::NonIpv4Answer(raw) => match mode {
            ProbeMode::Wildcard { expected_ip } => AttemptOutcome::Dns {
                reason: "wrong_ip",
                detail: format!("expected {expected_ip}, got non-IPv4 answer {raw}"),
            },
            ProbeMode::Nxdomain => AttemptOutcome::Success { resolved_ip: raw },
        },
        ResolveOutcome::SocksError(code) => match classify_socks_error(code) {
            SocksFailClass::Dns(reason) => {
                if reason == "nxdomain" {
                    match mode {
                        ProbeMode::Nxdomain => AttemptOutcome::Success {
                            resolved_ip: "NXDOMAIN".to_string(),
                        },
                        ProbeMode::Wildcard { .. } => AttemptOutcome::Dns {
                            reason,
                            detail: "resolver returned NXDOMAIN".to_string(),
                        },
                    }
                } else {
                    AttemptOutcome::Dns {
                        reason,
                        detail: format!("SOCKS reply 0x{code:02X}"),
                    }
                }
            }
            SocksFailClass::Circuit => AttemptOutcome::Circuit {
                detail: format!("SOCKS reply 0x{code:02X}"),
            },
        },
        ResolveOutcome::Timeout => AttemptOutcome::Timeout,
        ResolveOutcome::Eof => AttemptOutcome::Circuit {
            detail: "EOF on SOCKS stream".to_string(),
        },
    }
}

/// Runs the full retry-aware probe for one relay and returns the terminal
/// `ProbeResult`. Any panic-worthy internal error is caught by the caller
/// (see `engine.rs`) and turned into a `bug` outcome, per spec; this
/// function itself only ever returns through its normal control flow.
#[allow(clippy::too_many_arguments)]
pub async fn run_probe(
    relay: &Relay,
    mode: &ProbeMode,
    base_domain: &str,
    run_id: &str,
    query_gen: &QueryNameGenerator,
    resolver: &dyn SocksResolver,
    circuits: &dyn CircuitProvider,
    retry: RetryConfig,
) -> ProbeResult {
    let mut attempt: u32 = 0;
    let mut circuit_retries_used = 0;
    let mut timeout_retries_used = 0;
    let mut last_latency_ms: Option<i64> = None;

    loop {
        attempt += 1;

        let circuit_id = match circuits.request(&relay.fingerprint).await {
            CircuitOutcome::Built { circuit_id } => circuit_id,
            CircuitOutcome::Failed { reason } => {
                if circuit_retries_used < retry.circuit_retries {
                    circuit_retries_used += 1;
                    warn!(
                        fingerprint = %relay.fingerprint,
                        attempt,
                        reason = %reason,
                        "circuit failed to build before probe started, retrying"
                    );
                    tokio::time::sleep(retry.circuit_retry_delay).await;
                    continue;
                }
                return ProbeResult::failure(
                    &relay.fingerprint,
                    &relay.nickname,
                    &relay.address,
                    run_id,
                    FailType::Circuit,
                    "circuit_build_failed",
                    reason,
                    None,
                    None,
                );
            }
        };

        let domain = query_gen.generate(&relay.fingerprint, base_domain, attempt);
        let start = Instant::now();
        let raw_outcome = resolver.resolve(&domain, retry.query_timeout).await;
        let elapsed_ms = start.elapsed().as_millis() as i64;
        circuits.close(circuit_id);

        let outcome = classify_resolve(raw_outcome, mode);

        match outcome {
            AttemptOutcome::Success { resolved_ip } => {
                info!(fingerprint = %relay.fingerprint, attempt, resolved_ip = %resolved_ip, "probe succeeded");
                return ProbeResult::success(
                    &relay.fingerprint,
                    &relay.nickname,
                    &relay.address,
                    run_id,
                    Some(resolved_ip),
                    Some(elapsed_ms),
                );
            }
            AttemptOutcome::Dns { reason, detail } => {
                info!(fingerprint = %relay.fingerprint, attempt, reason, "probe failed: dns");
                return ProbeResult::failure(
                    &relay.fingerprint,
                    &relay.nickname,
                    &relay.address,
                    run_id,
                    FailType::Dns,
                    reason,
                    detail,
                    None,
                    Some(elapsed_ms),
                );
            }
            AttemptOutcome::Circuit { detail } => {
                last_latency_ms = Some(elapsed_ms);
                if circuit_retries_used < retry.circuit_retries {
                    circuit_retries_used += 1;
                    warn!(fingerprint = %relay.fingerprint, attempt, detail = %detail, "probe failed: circuit, retrying");
                    tokio::time::sleep(retry.circuit_retry_delay).await;
                    continue;
                }
                return ProbeResult::failure(
                    &relay.fingerprint,
                    &relay.nickname,
                    &relay.address,
                    run_id,
                    FailType::Circuit,
                    "socks_error",
                    detail,
                    None,
                    last_latency_ms,
                );
            }
            AttemptOutcome::Timeout => {
                last_latency_ms = Some(elapsed_ms);
                if timeout_retries_used < retry.timeout_retries {
                    timeout_retries_used += 1;
                    warn!(fingerprint = %relay.fingerprint, attempt, "probe timed out, retrying");
                    continue;
                }
                return ProbeResult::failure(
                    &relay.fingerprint,
                    &relay.nickname,
                    &relay.address,
                    run_id,
                    FailType::Timeout,
                    "query_timeout",
                    format!("no reply within {:?}", retry.query_timeout),
                    None,
                    last_latency_ms,
                );
            }
        }
    }
}

/// Builds a `bug` outcome from an unexpected internal error. Never retried.
pub fn bug_result(relay: &Relay, run_id: &str, detail: impl Into<String>) -> ProbeResult {
    ProbeResult::failure(
        &relay.fingerprint,
        &relay.nickname,
        &relay.address,
        run_id,
        FailType::Bug,
        "internal_error",
        detail,
        None,
        None,
    )
}
