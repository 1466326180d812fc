// Replica registry and health checking
// The serving layer owns replica health state. Only the health-check loop
// mutates it; request handlers observe it through routing. Hysteresis
// (M consecutive failed probes to go unhealthy, K successful to come back)
// keeps a flapping replica from oscillating in and out of rotation.

#[cfg(test)]
mod tests;

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ServingConfig;
use crate::generation::GenerationBackend;
use crate::metrics::Metrics;
use crate::{RagError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl ReplicaState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ReplicaState::Healthy,
            1 => ReplicaState::Degraded,
            _ => ReplicaState::Unhealthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ReplicaState::Healthy => 0,
            ReplicaState::Degraded => 1,
            ReplicaState::Unhealthy => 2,
        }
    }
}

/// One generation-backend serving unit.
pub struct Replica {
    pub id: usize,
    pub endpoint: Url,
    state: AtomicU8,
    load: AtomicUsize,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

impl Replica {
    #[inline]
    pub fn state(&self) -> ReplicaState {
        ReplicaState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }
}

/// RAII guard for a replica's in-flight load counter.
pub struct LoadGuard {
    replica: Arc<Replica>,
}

impl LoadGuard {
    fn new(replica: Arc<Replica>) -> Self {
        replica.load.fetch_add(1, Ordering::SeqCst);
        Self { replica }
    }

    #[inline]
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }
}

impl Drop for LoadGuard {
    #[inline]
    fn drop(&mut self) {
        self.replica.load.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReplicaStatus {
    pub id: usize,
    pub endpoint: String,
    pub state: ReplicaState,
    pub load: usize,
}

pub struct ReplicaRegistry {
    replicas: Vec<Arc<Replica>>,
    unhealthy_after: u32,
    healthy_after: u32,
    degraded_load_penalty: usize,
    metrics: Arc<Metrics>,
}

impl ReplicaRegistry {
    /// Register one replica per configured endpoint. Replicas start
    /// healthy; the first probe round corrects that if needed.
    #[inline]
    pub fn new(
        endpoints: &[String],
        config: &ServingConfig,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let mut replicas = Vec::with_capacity(endpoints.len());
        for (id, endpoint) in endpoints.iter().enumerate() {
            let url = Url::parse(endpoint)
                .map_err(|e| RagError::Config(format!("Invalid replica endpoint: {e}")))?;
            replicas.push(Arc::new(Replica {
                id,
                endpoint: url,
                state: AtomicU8::new(ReplicaState::Healthy.as_u8()),
                load: AtomicUsize::new(0),
                consecutive_failures: AtomicU32::new(0),
                consecutive_successes: AtomicU32::new(0),
            }));
        }

        Ok(Self {
            replicas,
            unhealthy_after: config.unhealthy_after,
            healthy_after: config.healthy_after,
            degraded_load_penalty: config.degraded_load_penalty.max(1) as usize,
            metrics,
        })
    }

    /// Pick a serving replica by least effective load, excluding
    /// `exclude` (the replica a failed attempt already used). Degraded
    /// replicas carry a load penalty so they receive a reduced share;
    /// unhealthy replicas are never eligible.
    #[inline]
    pub fn select(&self, exclude: Option<usize>) -> Option<LoadGuard> {
        let candidate = self
            .replicas
            .iter()
            .filter(|r| Some(r.id) != exclude)
            .filter_map(|r| {
                let effective = match r.state() {
                    ReplicaState::Healthy => r.load(),
                    ReplicaState::Degraded => {
                        r.load() * self.degraded_load_penalty + self.degraded_load_penalty
                    }
                    ReplicaState::Unhealthy => return None,
                };
                Some((effective, Arc::clone(r)))
            })
            .min_by_key(|(effective, r)| (*effective, r.id))?;

        Some(LoadGuard::new(candidate.1))
    }

    /// Apply one probe outcome to a replica's hysteresis counters.
    /// Transitions: a failed probe degrades a healthy replica at once and
    /// marks it unhealthy after `unhealthy_after` consecutive failures; it
    /// takes `healthy_after` consecutive successes to become healthy again.
    #[inline]
    pub fn record_probe(&self, id: usize, success: bool) {
        let Some(replica) = self.replicas.get(id) else {
            return;
        };

        let before = replica.state();
        let after = if success {
            replica.consecutive_failures.store(0, Ordering::SeqCst);
            let streak = replica.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= self.healthy_after {
                ReplicaState::Healthy
            } else {
                before
            }
        } else {
            replica.consecutive_successes.store(0, Ordering::SeqCst);
            let streak = replica.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            if streak >= self.unhealthy_after {
                ReplicaState::Unhealthy
            } else if before == ReplicaState::Healthy {
                ReplicaState::Degraded
            } else {
                before
            }
        };

        if after != before {
            replica.state.store(after.as_u8(), Ordering::SeqCst);
            Metrics::incr(&self.metrics.replica_transitions);
            match after {
                ReplicaState::Unhealthy => warn!(
                    replica = id,
                    endpoint = %replica.endpoint,
                    "replica marked unhealthy"
                ),
                ReplicaState::Degraded => warn!(
                    replica = id,
                    endpoint = %replica.endpoint,
                    "replica degraded"
                ),
                ReplicaState::Healthy => info!(
                    replica = id,
                    endpoint = %replica.endpoint,
                    "replica recovered"
                ),
            }
        }
    }

    #[inline]
    pub fn snapshot(&self) -> Vec<ReplicaStatus> {
        self.replicas
            .iter()
            .map(|r| ReplicaStatus {
                id: r.id,
                endpoint: r.endpoint.to_string(),
                state: r.state(),
                load: r.load(),
            })
            .collect()
    }

    #[inline]
    pub fn healthy_count(&self) -> usize {
        self.replicas
            .iter()
            .filter(|r| r.state() == ReplicaState::Healthy)
            .count()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    /// Probe every replica once and apply the outcomes.
    #[inline]
    pub async fn probe_all(&self, backend: &Arc<dyn GenerationBackend>) {
        for replica in &self.replicas {
            let endpoint = replica.endpoint.clone();
            let backend = Arc::clone(backend);
            let success = tokio::task::spawn_blocking(move || backend.probe(&endpoint))
                .await
                .unwrap_or(false);
            debug!(replica = replica.id, success, "probe result");
            self.record_probe(replica.id, success);
        }
    }

    /// Probe replicas on an interval until the registry is dropped.
    #[inline]
    pub async fn health_check_loop(
        self: Arc<Self>,
        backend: Arc<dyn GenerationBackend>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.probe_all(&backend).await;
        }
    }
}
