//! Asynchronous repair of stale replicas. The four variants
//! compose: production deployments use
//! `Nonblocking(RateLimited(AllRepairs))`, built by `chronoset_config`'s
//! `RepairerConfig::production`.
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::model::KeyScoreMember;

use super::rate_limiter::RateLimiter;

/// A member whose replicas disagree: `clusters` should converge on
/// `(ksm, inserted)`: `inserted = true` means apply as Insert (the member
/// belongs in `K+`), `false` means apply as Delete (it belongs in `K-`).
#[derive(Debug, Clone)]
pub struct RepairCandidate {
    pub ksm: KeyScoreMember,
    pub inserted: bool,
    pub targets: Vec<Arc<Cluster>>,
}

#[async_trait]
pub trait Repairer: Send + Sync {
    async fn repair(&self, candidates: Vec<RepairCandidate>);

    /// Stop accepting new candidates. Default no-op; `Nonblocking` overrides
    /// this to close its queue and let its background worker drain and exit.
    async fn shutdown(&self) {}
}

/// Drops every candidate. Used when repair is disabled entirely.
pub struct NopRepairer;

#[async_trait]
impl Repairer for NopRepairer {
    async fn repair(&self, candidates: Vec<RepairCandidate>) {
        if !candidates.is_empty() {
            debug!(count = candidates.len(), "dropping repair candidates (NopRepairer)");
        }
    }
}

/// Applies every candidate to its target clusters, concurrently, and waits
/// for all of them to finish.
pub struct AllRepairs;

#[async_trait]
impl Repairer for AllRepairs {
    async fn repair(&self, candidates: Vec<RepairCandidate>) {
        let mut tasks = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            for cluster in candidate.targets.clone() {
                let ksm = candidate.ksm.clone();
                let inserted = candidate.inserted;
                tasks.push(tokio::spawn(async move {
                    let result = if inserted {
                        cluster.insert(&ksm).await
                    } else {
                        cluster.delete(&ksm).await
                    };
                    match result {
                        Ok(_) => info!(member = %String::from_utf8_lossy(&ksm.member), "repair applied to divergent replica"),
                        Err(e) => warn!(error = %e, "repair write failed"),
                    }
                }));
            }
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Throttles the wrapped repairer to at most `max_kms_per_second` candidate
/// applications per second, blocking (not dropping) when over budget.
pub struct RateLimited {
    limiter: RateLimiter,
    inner: Arc<dyn Repairer>,
}

impl RateLimited {
    pub fn new(max_kms_per_second: u32, inner: Arc<dyn Repairer>) -> Self {
        Self {
            limiter: RateLimiter::new(max_kms_per_second),
            inner,
        }
    }
}

#[async_trait]
impl Repairer for RateLimited {
    async fn repair(&self, candidates: Vec<RepairCandidate>) {
        for candidate in candidates {
            self.limiter.acquire().await;
            self.inner.repair(vec![candidate]).await;
        }
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

/// Wraps an inner repairer with a bounded queue so `repair()` never blocks
/// the caller; a background worker drains the queue. Candidates submitted
/// while the queue is full are dropped (logged), not backpressured.
pub struct Nonblocking {
    tx: parking_lot::Mutex<Option<mpsc::Sender<RepairCandidate>>>,
}

impl Nonblocking {
    pub fn new(buffer_size: usize, inner: Arc<dyn Repairer>) -> Self {
        let (tx, mut rx) = mpsc::channel::<RepairCandidate>(buffer_size);
        tokio::spawn(async move {
            while let Some(candidate) = rx.recv().await {
                inner.repair(vec![candidate]).await;
            }
        });
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
        }
    }
}

#[async_trait]
impl Repairer for Nonblocking {
    async fn repair(&self, candidates: Vec<RepairCandidate>) {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            crate::stats::counters().record_repair_dropped();
            warn!("repairer already shut down, dropping candidate");
            return;
        };
        for candidate in candidates {
            if tx.try_send(candidate).is_err() {
                crate::stats::counters().record_repair_dropped();
                warn!("repair queue full, dropping candidate");
            }
        }
    }

    /// Drop the sender so the background worker's `rx.recv()` returns `None`
    /// once the queue drains, letting the worker task exit on its own.
    async fn shutdown(&self) {
        self.tx.lock().take();
    }
}
