//! Startup reachability preflight for selector groups.
//! 启动前出站可达性预检
//!
//! Fast path probes the group's current default only. When that fails, every
//! sibling is probed concurrently under one shared total budget and the lowest
//! round-trip wins.

use async_trait::async_trait;
use mf_config::{EgressCandidate, SelectorGroup};
use mf_types::PreflightError;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Probe timing limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightConfig {
    /// Upper bound for a single connect attempt.
    pub per_probe_timeout: Duration,
    /// Hard ceiling for the whole preflight, shared by concurrent probes.
    pub total_budget: Duration,
}

impl Default for PreflightConfig {
    fn default() -> Self {
        Self {
            per_probe_timeout: Duration::from_millis(1500),
            total_budget: Duration::from_millis(4000),
        }
    }
}

/// Per-candidate probe result. `rtt_ms: None` means unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReachabilityResult {
    pub tag: String,
    pub rtt_ms: Option<u64>,
}

/// What the preflight decided for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreflightOutcome {
    pub group: String,
    pub previous: Option<String>,
    pub selected: String,
    pub rtt_ms: u64,
    pub results: Vec<ReachabilityResult>,
}

impl PreflightOutcome {
    pub fn repaired(&self) -> bool {
        self.previous.as_deref() != Some(self.selected.as_str())
    }
}

/// Reachability check for one candidate. Implementations must return within `timeout`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, candidate: &EgressCandidate, timeout: Duration) -> io::Result<Duration>;
}

/// Bare TCP connect-and-close to `server:server_port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, candidate: &EgressCandidate, timeout: Duration) -> io::Result<Duration> {
        let Some((host, port)) = candidate.endpoint() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("outbound `{}` has no server endpoint", candidate.tag),
            ));
        };
        let start = Instant::now();
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(start.elapsed())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
    }
}

pub struct Preflight {
    prober: Arc<dyn Prober>,
    config: PreflightConfig,
}

impl Preflight {
    pub fn new(prober: Arc<dyn Prober>, config: PreflightConfig) -> Self {
        Self { prober, config }
    }

    pub fn tcp(config: PreflightConfig) -> Self {
        Self::new(Arc::new(TcpProber), config)
    }

    pub fn config(&self) -> PreflightConfig {
        self.config
    }

    /// Keep the group's default when reachable, otherwise pick the fastest
    /// reachable sibling.
    ///
    /// # Errors
    /// [`PreflightError::NoReachableEgress`] when nothing answers within the budget.
    pub async fn verify_or_repair(
        &self,
        group: &SelectorGroup,
        candidates: &[EgressCandidate],
    ) -> Result<PreflightOutcome, PreflightError> {
        let start = Instant::now();
        let deadline = start + self.config.total_budget;
        let previous = group.current_default().map(str::to_string);
        let mut results = Vec::with_capacity(candidates.len());

        let default_candidate = previous
            .as_deref()
            .and_then(|tag| candidates.iter().find(|c| c.tag == tag));
        if let Some(cand) = default_candidate {
            let budget = self.config.per_probe_timeout.min(remaining(deadline));
            match self.prober.probe(cand, budget).await {
                Ok(rtt) => {
                    tracing::debug!(group = %group.tag, outbound = %cand.tag, rtt_ms = millis(rtt), "default reachable");
                    return Ok(PreflightOutcome {
                        group: group.tag.clone(),
                        previous: previous.clone(),
                        selected: cand.tag.clone(),
                        rtt_ms: millis(rtt),
                        results: vec![ReachabilityResult {
                            tag: cand.tag.clone(),
                            rtt_ms: Some(millis(rtt)),
                        }],
                    });
                }
                Err(e) => {
                    tracing::warn!(group = %group.tag, outbound = %cand.tag, error = %e, "default unreachable, probing siblings");
                    results.push(ReachabilityResult {
                        tag: cand.tag.clone(),
                        rtt_ms: None,
                    });
                }
            }
        }

        let siblings: Vec<(usize, EgressCandidate)> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| Some(c.tag.as_str()) != default_candidate.map(|d| d.tag.as_str()))
            .map(|(i, c)| (i, c.clone()))
            .collect();
        let probed = self.probe_all(&siblings, deadline).await;

        let best = probed
            .iter()
            .filter_map(|(idx, rtt)| rtt.map(|r| (*idx, r)))
            .min_by_key(|(idx, rtt)| (*rtt, *idx));
        for (idx, c) in &siblings {
            let rtt = probed
                .iter()
                .find(|(i, _)| i == idx)
                .and_then(|(_, r)| *r);
            results.push(ReachabilityResult {
                tag: c.tag.clone(),
                rtt_ms: rtt.map(millis),
            });
        }

        match best {
            Some((idx, rtt)) => {
                let selected = candidates[idx].tag.clone();
                tracing::warn!(
                    group = %group.tag,
                    from = previous.as_deref().unwrap_or("-"),
                    to = %selected,
                    rtt_ms = millis(rtt),
                    "default repaired by preflight"
                );
                Ok(PreflightOutcome {
                    group: group.tag.clone(),
                    previous,
                    selected,
                    rtt_ms: millis(rtt),
                    results,
                })
            }
            None => Err(PreflightError::NoReachableEgress {
                group: group.tag.clone(),
                tried: results.len(),
                elapsed: start.elapsed(),
            }),
        }
    }

    /// Probe concurrently; results that arrive after `deadline` are ignored.
    async fn probe_all(
        &self,
        candidates: &[(usize, EgressCandidate)],
        deadline: Instant,
    ) -> Vec<(usize, Option<Duration>)> {
        let collected: Arc<Mutex<Vec<(usize, Option<Duration>)>>> =
            Arc::new(Mutex::new(Vec::with_capacity(candidates.len())));
        let mut set = JoinSet::new();
        for (idx, cand) in candidates.iter().cloned() {
            let prober = Arc::clone(&self.prober);
            let collected = Arc::clone(&collected);
            let budget = self.config.per_probe_timeout.min(remaining(deadline));
            set.spawn(async move {
                let rtt = match prober.probe(&cand, budget).await {
                    Ok(rtt) => Some(rtt),
                    Err(e) => {
                        tracing::debug!(outbound = %cand.tag, error = %e, "probe failed");
                        None
                    }
                };
                collected.lock().push((idx, rtt));
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!(pending = set.len(), "preflight budget exhausted");
                    set.detach_all();
                    break;
                }
            }
        }
        let snapshot = collected.lock().clone();
        snapshot
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
