// src/engine.rs
//
// The top-level coordinator: paces circuit construction, demultiplexes
// circuit/stream events from the control port, bounds concurrency with a
// semaphore, and drives one probe worker task per selected relay. This is
// the single place that talks to the Tor control port at all, per the
// ownership rule in the data model -- workers only ever see the circuit id
// handed to them.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::FutureExt;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::consensus::NetworkStatus;
use crate::control::{ControlClient, ControlEvent};
use crate::probe::{bug_result, run_probe, CircuitOutcome, CircuitProvider, ProbeMode, RetryConfig};
use crate::query::QueryNameGenerator;
use crate::report::{FailType, ProbeResult};
use crate::socks::{ResolveOutcome, SocksDnsClient, SocksResolver};

/// Everything the engine needs that isn't the consensus or the relay list
/// itself. Built once from the CLI, then shared read-only for the run.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub analysis_dir: PathBuf,
    pub socks_addr: String,
    pub base_domain: String,
    pub mode: ProbeModeConfig,
    pub first_hop: Option<String>,
    pub build_delay: Duration,
    pub delay_noise: Duration,
    pub max_inflight: usize,
    pub retry: RetryConfig,
    pub hard_probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum ProbeModeConfig {
    Wildcard(Ipv4Addr),
    Nxdomain,
}

impl ProbeModeConfig {
    fn to_probe_mode(&self) -> ProbeMode {
        match self {
            ProbeModeConfig::Wildcard(ip) => ProbeMode::Wildcard { expected_ip: *ip },
            ProbeModeConfig::Nxdomain => ProbeMode::Nxdomain,
        }
    }
}

enum CircuitOutcomeInternal {
    Built(u32),
    Failed(String),
}

struct CircuitRequest {
    exit_fingerprint: String,
    reply: oneshot::Sender<CircuitOutcomeInternal>,
}

/// The slot a relay worker's circuit id lives in between `request()` and the
/// matching `resolve()` call -- the two always happen back to back inside
/// one retry-loop iteration, so a plain mutex cell is enough; there is never
/// more than one attempt in flight per relay.
#[derive(Clone)]
struct CircuitCell(Arc<Mutex<Option<u32>>>);

impl CircuitCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    fn set(&self, id: u32) {
        *self.0.lock().unwrap() = Some(id);
    }

    fn get(&self) -> Option<u32> {
        *self.0.lock().unwrap()
    }
}

/// Worker-facing handle for requesting and releasing circuits. Talks to the
/// coordinator task over channels; never touches the control port directly.
struct EngineCircuitProvider {
    requests_tx: mpsc::UnboundedSender<CircuitRequest>,
    close_tx: mpsc::UnboundedSender<u32>,
    cell: CircuitCell,
}

impl CircuitProvider for EngineCircuitProvider {
    fn request<'a>(
        &'a self,
        exit_fingerprint: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = CircuitOutcome> + Send + 'a>> {
        Box::pin(async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            if self
                .requests_tx
                .send(CircuitRequest {
                    exit_fingerprint: exit_fingerprint.to_string(),
                    reply: reply_tx,
                })
                .is_err()
            {
                return CircuitOutcome::Failed {
                    reason: "coordinator channel closed".to_string(),
                };
            }
            match reply_rx.await {
                Ok(CircuitOutcomeInternal::Built(id)) => {
                    self.cell.set(id);
                    CircuitOutcome::Built { circuit_id: id }
                }
                Ok(CircuitOutcomeInternal::Failed(reason)) => CircuitOutcome::Failed { reason },
                Err(_) => CircuitOutcome::Failed {
                    reason: "coordinator dropped circuit request".to_string(),
                },
            }
        })
    }

    fn close(&self, circuit_id: u32) {
        let _ = self.close_tx.send(circuit_id);
    }
}

/// Wraps the real SOCKS client so that, immediately before issuing the
/// RESOLVE request, the query domain is registered against the worker's
/// current circuit id -- the coordinator uses that registration to answer
/// the matching `STREAM NEW` event with `ATTACHSTREAM`.
struct AttachingResolver {
    inner: SocksDnsClient,
    cell: CircuitCell,
    attach_tx: mpsc::UnboundedSender<(String, u32)>,
}

impl SocksResolver for AttachingResolver {
    fn resolve<'a>(
        &'a self,
        domain: &'a str,
        exchange_timeout: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ResolveOutcome> + Send + 'a>> {
        Box::pin(async move {
            if let Some(circuit_id) = self.cell.get() {
                let _ = self.attach_tx.send((domain.to_string(), circuit_id));
            }
            self.inner.resolve(domain, exchange_timeout).await
        })
    }
}

/// Drives circuit construction and event demultiplexing. The only task in
/// the process that issues control-port commands.
async fn run_coordinator(
    control: Arc<ControlClient>,
    mut events: crate::control::CircuitEvents,
    mut requests_rx: mpsc::UnboundedReceiver<CircuitRequest>,
    mut close_rx: mpsc::UnboundedReceiver<u32>,
    mut attach_rx: mpsc::UnboundedReceiver<(String, u32)>,
    guards: Vec<String>,
    first_hop: Option<String>,
    build_delay: Duration,
    delay_noise: Duration,
) {
    let mut pending_builds: HashMap<u32, oneshot::Sender<CircuitOutcomeInternal>> = HashMap::new();
    let mut waiting_domains: HashMap<String, u32> = HashMap::new();
    let mut waiting_streams: HashMap<String, u32> = HashMap::new();
    let mut last_build = tokio::time::Instant::now() - build_delay;

    loop {
        tokio::select! {
            biased;

            Some(event) = events.recv() => match event {
                ControlEvent::Circuit(circ) => {
                    use crate::control::CircuitStatus;
                    match circ.status {
                        CircuitStatus::Built => {
                            if let Some(reply) = pending_builds.remove(&circ.id) {
                                let _ = reply.send(CircuitOutcomeInternal::Built(circ.id));
                            }
                        }
                        CircuitStatus::Failed => {
                            if let Some(reply) = pending_builds.remove(&circ.id) {
                                let reason = circ.reason.unwrap_or_else(|| "circuit failed".to_string());
                                let _ = reply.send(CircuitOutcomeInternal::Failed(reason));
                            }
                        }
                        _ => {}
                    }
                }
                ControlEvent::Stream(stream) => {
                    if let Some(circuit_id) = waiting_domains.remove(&stream.target) {
                        if let Err(e) = control.attach_stream(stream.id, circuit_id).await {
                            warn!(stream_id = stream.id, circuit_id, error = %e, "failed to attach stream");
                        }
                    } else {
                        waiting_streams.insert(stream.target, stream.id);
                    }
                }
            },

            Some((domain, circuit_id)) = attach_rx.recv() => {
                if let Some(stream_id) = waiting_streams.remove(&domain) {
                    if let Err(e) = control.attach_stream(stream_id, circuit_id).await {
                        warn!(stream_id, circuit_id, error = %e, "failed to attach stream");
                    }
                } else {
                    waiting_domains.insert(domain, circuit_id);
                }
            }

            Some(circuit_id) = close_rx.recv() => {
                control.close_circuit(circuit_id).await;
            }

            Some(req) = requests_rx.recv() => {
                let elapsed = last_build.elapsed();
                if elapsed < build_delay {
                    tokio::time::sleep(build_delay - elapsed).await;
                }
                let noise_ms = if delay_noise.is_zero() {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay_noise.as_millis() as u64)
                };
                tokio::time::sleep(Duration::from_millis(noise_ms)).await;
                last_build = tokio::time::Instant::now();

                let hop = first_hop.clone().or_else(|| guards.choose(&mut rand::thread_rng()).cloned());
                let Some(hop) = hop else {
                    let _ = req.reply.send(CircuitOutcomeInternal::Failed(
                        "no guard relay available for first hop".to_string(),
                    ));
                    continue;
                };

                match control.new_circuit(&[hop, req.exit_fingerprint.clone()]).await {
                    Ok(circuit_id) => {
                        pending_builds.insert(circuit_id, req.reply);
                    }
                    Err(e) => {
                        let _ = req.reply.send(CircuitOutcomeInternal::Failed(e.to_string()));
                    }
                }
            }

            else => {
                debug!("coordinator channels all closed, exiting");
                return;
            }
        }
    }
}

pub struct ScanEngine {
    pub config: EngineConfig,
    pub run_id: String,
}

impl ScanEngine {
    pub fn new(config: EngineConfig, run_id: impl Into<String>) -> Self {
        Self {
            config,
            run_id: run_id.into(),
        }
    }

    /// Runs the full scan: builds circuits, dispatches one worker per
    /// selected relay, waits for the join barrier (or cancellation), and
    /// returns every terminal `ProbeResult` -- the caller (main) hands these
    /// to the reporter.
    pub async fn run(
        &self,
        control_addr: &str,
        control_auth: &crate::control::ControlAuth,
        status: &NetworkStatus,
        relays: Vec<crate::consensus::Relay>,
    ) -> Result<Vec<ProbeResult>> {
        std::fs::create_dir_all(&self.config.analysis_dir)
            .with_context(|| format!("creating analysis dir {:?}", self.config.analysis_dir))?;

        let (control, events) = ControlClient::connect(control_addr, control_auth).await?;
        control
            .leave_streams_unattached()
            .await
            .context("configuring __LeaveStreamsUnattached")?;
        let control = Arc::new(control);

        let guards: Vec<String> = status
            .guards()
            .map(|r| r.fingerprint.clone())
            .collect();

        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();

        let coordinator = tokio::spawn(run_coordinator(
            control.clone(),
            events,
            requests_rx,
            close_rx,
            attach_rx,
            guards,
            self.config.first_hop.clone(),
            self.config.build_delay,
            self.config.delay_noise,
        ));

        let semaphore = Arc::new(Semaphore::new(self.config.max_inflight));
        let query_gen = Arc::new(QueryNameGenerator::new(
            self.run_id.clone(),
            std::time::Instant::now(),
        ));

        let mut join_set: JoinSet<ProbeResult> = JoinSet::new();
        let mut interrupted = false;

        for relay in relays {
            tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    let permit = permit.expect("semaphore never closed");
                    let requests_tx = requests_tx.clone();
                    let close_tx = close_tx.clone();
                    let attach_tx = attach_tx.clone();
                    let socks_addr = self.config.socks_addr.clone();
                    let base_domain = self.config.base_domain.clone();
                    let mode = self.config.mode.to_probe_mode();
                    let run_id = self.run_id.clone();
                    let query_gen = query_gen.clone();
                    let retry = self.config.retry;
                    let hard_timeout = self.config.hard_probe_timeout;
                    let analysis_dir = self.config.analysis_dir.clone();

                    join_set.spawn(async move {
                        let _permit = permit;
                        let cell = CircuitCell::new();
                        let circuits = EngineCircuitProvider { requests_tx, close_tx, cell: cell.clone() };
                        let resolver = AttachingResolver {
                            inner: SocksDnsClient::new(socks_addr),
                            cell,
                            attach_tx,
                        };

                        let span = info_span!("probe", fingerprint = %relay.fingerprint);
                        let probe_future = run_probe(
                            &relay, &mode, &base_domain, &run_id, query_gen.as_ref(), &resolver, &circuits, retry,
                        ).instrument(span);

                        let result = match tokio::time::timeout(hard_timeout, AssertUnwindSafe(probe_future).catch_unwind()).await {
                            Ok(Ok(result)) => result,
                            Ok(Err(panic)) => {
                                let detail = panic_message(&panic);
                                warn!(fingerprint = %relay.fingerprint, detail = %detail, "probe worker panicked");
                                bug_result(&relay, &run_id, detail)
                            }
                            Err(_elapsed) => {
                                warn!(fingerprint = %relay.fingerprint, "probe exceeded hard timeout, aborting");
                                ProbeResult::failure(
                                    &relay.fingerprint, &relay.nickname, &relay.address, &run_id,
                                    FailType::Timeout, "hard_probe_timeout", "probe exceeded hard timeout", None, None,
                                )
                            }
                        };

                        if let Err(e) = result.write_artifact(&analysis_dir) {
                            warn!(fingerprint = %relay.fingerprint, error = %e, "failed to write probe artifact");
                        }

                        result
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received, stopping new circuit dispatch");
                    interrupted = true;
                }
            }

            if interrupted {
                break;
            }
        }

        if interrupted {
            let grace = Duration::from_secs(15);
            let _ = tokio::time::timeout(grace, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;
            join_set.abort_all();
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) if e.is_cancelled() => {
                    debug!("worker task aborted during drain");
                }
                Err(e) => {
                    warn!(error = %e, "worker task panicked");
                }
            }
        }

        drop(requests_tx);
        drop(close_tx);
        drop(attach_tx);
        coordinator.abort();

        Ok(results)
    }
}

/// Picks between wildcard and NXDOMAIN mode the way the CLI surface
/// specifies: `-H` enables NXDOMAIN mode; otherwise an expected IPv4 is
/// required for wildcard mode.
pub fn resolve_probe_mode(nxdomain_base: Option<String>, expected_ip: Option<Ipv4Addr>) -> Result<(String, ProbeModeConfig)> {
    match (nxdomain_base, expected_ip) {
        (Some(base), _) => Ok((base, ProbeModeConfig::Nxdomain)),
        (None, Some(ip)) => Ok((String::new(), ProbeModeConfig::Wildcard(ip))),
        (None, None) => anyhow::bail!("either -H (NXDOMAIN base domain) or --expected-ip (wildcard mode) must be set"),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
