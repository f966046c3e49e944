//! The replication layer: M clusters, a write quorum, a pluggable read
//! path, and background repair.
pub mod error;
pub mod rate_limiter;
pub mod read_strategy;
pub mod repairer;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use chronoset_config::{Config, ReadStrategyConfig, RepairerConfig};

use crate::cluster::{Cluster, KeysCursor};
use crate::model::{Cursor, KeyMember, KeyScoreMember, Presence};

pub use error::Error;
pub use rate_limiter::RateLimiter;
pub use read_strategy::ReadStrategy;
pub use repairer::{AllRepairs, NopRepairer, Nonblocking, RateLimited, RepairCandidate, Repairer};

/// A farm: M clusters replicating the same logical keyspace.
pub struct Farm {
    clusters: Vec<Arc<Cluster>>,
    write_quorum: usize,
    read_strategy: ReadStrategy,
    repairer: Arc<dyn Repairer>,
}

impl Farm {
    pub fn new(
        clusters: Vec<Arc<Cluster>>,
        write_quorum: usize,
        read_strategy: ReadStrategy,
        repairer: Arc<dyn Repairer>,
    ) -> Self {
        Self {
            clusters,
            write_quorum: write_quorum.max(1),
            read_strategy,
            repairer,
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Stop the repairer's background worker and close every cluster's
    /// connection pools. Idempotent; safe to call once during shutdown.
    pub async fn shutdown(&self) {
        self.repairer.shutdown().await;
        for cluster in &self.clusters {
            cluster.shutdown();
        }
    }

    /// Insert `ksm`, acknowledging once `write_quorum` clusters have
    /// responded. The remaining clusters keep writing in the background, so
    /// a slow or partitioned replica never blocks the caller past quorum.
    pub async fn insert(&self, ksm: &KeyScoreMember) -> Result<bool, Error> {
        crate::stats::counters().record_insert();
        self.write(ksm.clone(), true).await
    }

    pub async fn delete(&self, ksm: &KeyScoreMember) -> Result<bool, Error> {
        crate::stats::counters().record_delete();
        self.write(ksm.clone(), false).await
    }

    async fn write(&self, ksm: KeyScoreMember, is_insert: bool) -> Result<bool, Error> {
        if self.clusters.is_empty() {
            return Err(Error::NoClusters);
        }
        let quorum = self.write_quorum.min(self.clusters.len());

        let mut pending: futures::stream::FuturesUnordered<_> = self
            .clusters
            .iter()
            .cloned()
            .map(|cluster| {
                let ksm = ksm.clone();
                async move {
                    if is_insert {
                        cluster.insert(&ksm).await
                    } else {
                        cluster.delete(&ksm).await
                    }
                }
            })
            .collect();

        let mut acks = 0usize;
        let mut applied_any = false;
        let result = loop {
            if acks >= quorum {
                break Ok(applied_any);
            }
            match futures::StreamExt::next(&mut pending).await {
                Some(Ok(applied)) => {
                    acks += 1;
                    applied_any |= applied;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "cluster write failed, not counted toward quorum");
                    continue;
                }
                None => {
                    crate::stats::counters().record_write_quorum_failure();
                    warn!(want = quorum, got = acks, "write quorum unreachable");
                    break Err(Error::QuorumUnreachable { want: quorum, got: acks });
                }
            }
        };

        // Detach the remaining in-flight writes so they finish without
        // holding up the caller past quorum.
        tokio::spawn(async move { while futures::StreamExt::next(&mut pending).await.is_some() {} });

        result
    }

    /// Reconciled presence of `(key, member)` across every cluster the read
    /// strategy touches; any replica that disagrees with the winner is
    /// queued for repair. For lingering read strategies the repair pass
    /// runs against the full, eventually-complete response set on a
    /// detached task, after this call has already returned to its caller.
    pub async fn score(&self, km: &KeyMember) -> Result<Presence, Error> {
        crate::stats::counters().record_score();
        let km2 = km.clone();
        let km3 = km.clone();
        let clusters = self.clusters.clone();
        let repairer = self.repairer.clone();
        let responses = self
            .read_strategy
            .dispatch_with_repair(
                &self.clusters,
                move |cluster| {
                    let km = km2.clone();
                    async move { cluster.score(&km).await }
                },
                move |final_responses| {
                    let winner = final_responses
                        .iter()
                        .flatten()
                        .copied()
                        .filter(|p| p.is_present())
                        .max_by(presence_order);
                    if let Some(winner) = winner {
                        tokio::spawn(repair_divergent_presence(
                            clusters,
                            repairer,
                            km3,
                            winner,
                            final_responses,
                        ));
                    }
                },
            )
            .await;

        if responses.iter().all(|r| r.is_none()) {
            warn!(key = %String::from_utf8_lossy(&km.key), "complete read failure: every cluster errored");
        }

        let winner = responses
            .iter()
            .flatten()
            .copied()
            .filter(|p| p.is_present())
            .max_by(presence_order);

        Ok(winner.unwrap_or(Presence::Absent))
    }

    /// Rank-based pagination merged across replicas.
    pub async fn select_offset(
        &self,
        key: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<KeyScoreMember>, Error> {
        crate::stats::counters().record_select();
        let key2 = key.to_vec();
        let key3 = key.to_vec();
        let clusters = self.clusters.clone();
        let repairer = self.repairer.clone();
        let responses = self
            .read_strategy
            .dispatch_with_repair(
                &self.clusters,
                move |cluster| {
                    let key = key2.clone();
                    async move { cluster.select_offset(&key, offset, limit).await }
                },
                move |final_responses| {
                    let (_, winners) = merge_pages(&key3, &final_responses);
                    tokio::spawn(repair_divergent_pages(clusters, repairer, key3, final_responses, winners));
                },
            )
            .await;

        let (merged, _) = merge_pages(key, &responses);
        Ok(merged.into_iter().take(limit).collect())
    }

    /// Cursor-based pagination merged across replicas.
    pub async fn select_range(
        &self,
        key: &[u8],
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<(Vec<KeyScoreMember>, Option<Cursor>), Error> {
        crate::stats::counters().record_select();
        let key2 = key.to_vec();
        let key3 = key.to_vec();
        let cursor2 = cursor.clone();
        let clusters = self.clusters.clone();
        let repairer = self.repairer.clone();
        let responses = self
            .read_strategy
            .dispatch_with_repair(
                &self.clusters,
                move |cluster| {
                    let key = key2.clone();
                    let cursor = cursor2.clone();
                    async move { cluster.select_range(&key, cursor.as_ref(), None, limit).await }
                },
                move |final_responses| {
                    let pages: Vec<Option<Vec<KeyScoreMember>>> = final_responses
                        .iter()
                        .map(|r| r.as_ref().map(|(page, _)| page.clone()))
                        .collect();
                    let (_, winners) = merge_pages(&key3, &pages);
                    tokio::spawn(repair_divergent_pages(clusters, repairer, key3, pages, winners));
                },
            )
            .await;

        // Each response pairs a page with that cluster's own next cursor;
        // unzip so merge_pages only has to reconcile the KSM pages.
        let pages: Vec<Option<Vec<KeyScoreMember>>> = responses
            .iter()
            .map(|r| r.as_ref().map(|(page, _)| page.clone()))
            .collect();
        let any_more = responses
            .iter()
            .any(|r| matches!(r, Some((_, Some(_)))));

        let (merged, _) = merge_pages(key, &pages);
        let page: Vec<KeyScoreMember> = merged.into_iter().take(limit).collect();
        let next = if page.len() == limit && any_more {
            page.last().map(|last| Cursor::new(last.score, last.member.clone()))
        } else {
            None
        };
        Ok((page, next))
    }

    /// Lists the farm's logical keyspace by delegating to the first
    /// healthy cluster; a listing doesn't need LWW reconciliation the way
    /// reads of a single key's membership do.
    pub async fn keys(
        &self,
        cursor: KeysCursor,
        batch_size: usize,
    ) -> Result<(Vec<Vec<u8>>, Option<KeysCursor>), Error> {
        let cluster = self.clusters.first().ok_or(Error::NoClusters)?;
        Ok(cluster.keys(cursor, batch_size).await?)
    }
}

fn presence_order(a: &Presence, b: &Presence) -> std::cmp::Ordering {
    let (Presence::Present { inserted: ia, score: sa }, Presence::Present { inserted: ib, score: sb }) =
        (a, b)
    else {
        return std::cmp::Ordering::Equal;
    };
    // Equal scores are broken in favor of `inserted = true`, per the tie
    // resolution chosen for repair convergence (see DESIGN.md).
    sa.partial_cmp(sb).unwrap().then(ia.cmp(ib))
}

/// Queues repair for every cluster whose presence answer disagrees with
/// `winner`. Takes owned clones of `clusters`/`repairer` so it can run on a
/// detached task outliving the `Farm` borrow that started the read.
async fn repair_divergent_presence(
    clusters: Vec<Arc<Cluster>>,
    repairer: Arc<dyn Repairer>,
    km: KeyMember,
    winner: Presence,
    responses: read_strategy::Responses<Presence>,
) {
    let Presence::Present { inserted, score } = winner else {
        return;
    };
    let mut targets = Vec::new();
    for (idx, response) in responses.iter().enumerate() {
        let matches = matches!(
            response,
            Some(Presence::Present { inserted: i, score: s }) if *i == inserted && *s == score
        );
        if !matches {
            if let Some(cluster) = clusters.get(idx) {
                targets.push(cluster.clone());
            }
        }
    }
    if !targets.is_empty() {
        crate::stats::counters().record_repairs_queued(1);
        repairer
            .repair(vec![RepairCandidate {
                ksm: KeyScoreMember::new(km.key.clone(), score, km.member.clone()),
                inserted,
                targets,
            }])
            .await;
    }
}

/// Merge per-cluster KSM pages by taking, for each member, the highest
/// score seen (the LWW survivor), sorted descending. Pure: computing the
/// merged view never itself triggers repair.
fn merge_pages(
    key: &[u8],
    responses: &[Option<Vec<KeyScoreMember>>],
) -> (Vec<KeyScoreMember>, HashMap<Vec<u8>, f64>) {
    let mut winners: HashMap<Vec<u8>, f64> = HashMap::new();
    for page in responses.iter().flatten() {
        for ksm in page {
            winners
                .entry(ksm.member.clone())
                .and_modify(|s| {
                    if ksm.score > *s {
                        *s = ksm.score;
                    }
                })
                .or_insert(ksm.score);
        }
    }

    let mut merged: Vec<KeyScoreMember> = winners
        .iter()
        .map(|(member, &score)| KeyScoreMember::new(key.to_vec(), score, member.clone()))
        .collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap().then(b.member.cmp(&a.member)));

    (merged, winners)
}

/// Queues repair for any cluster that reported a stale or missing entry for
/// a member `winners` disagrees with. Takes owned clones of
/// `clusters`/`repairer` so it can run on a detached task outliving the
/// `Farm` borrow that started the read.
async fn repair_divergent_pages(
    clusters: Vec<Arc<Cluster>>,
    repairer: Arc<dyn Repairer>,
    key: Vec<u8>,
    responses: Vec<Option<Vec<KeyScoreMember>>>,
    winners: HashMap<Vec<u8>, f64>,
) {
    let mut targets_by_member: HashMap<Vec<u8>, Vec<Arc<Cluster>>> = HashMap::new();
    for (idx, page) in responses.iter().enumerate() {
        let Some(page) = page else { continue };
        let seen: HashMap<&Vec<u8>, f64> = page.iter().map(|k| (&k.member, k.score)).collect();
        for (member, &winner_score) in winners.iter() {
            let up_to_date = seen.get(member).map(|&s| s == winner_score).unwrap_or(false);
            if !up_to_date {
                if let Some(cluster) = clusters.get(idx) {
                    targets_by_member.entry(member.clone()).or_default().push(cluster.clone());
                }
            }
        }
    }

    if !targets_by_member.is_empty() {
        let candidates: Vec<RepairCandidate> = targets_by_member
            .into_iter()
            .map(|(member, targets)| RepairCandidate {
                ksm: KeyScoreMember::new(key.clone(), winners[&member], member),
                inserted: true,
                targets,
            })
            .collect();
        crate::stats::counters().record_repairs_queued(candidates.len() as u64);
        repairer.repair(candidates).await;
    }
}

/// Build the configured `ReadStrategy` from `chronoset-config`.
pub fn build_read_strategy(cfg: &ReadStrategyConfig) -> ReadStrategy {
    match cfg {
        ReadStrategyConfig::SendOneReadOne => ReadStrategy::SendOneReadOne,
        ReadStrategyConfig::SendAllReadAll => ReadStrategy::SendAllReadAll,
        ReadStrategyConfig::SendAllReadFirstLinger { linger_ms } => ReadStrategy::SendAllReadFirstLinger {
            linger: std::time::Duration::from_millis(*linger_ms),
        },
        ReadStrategyConfig::SendVarReadFirstLinger {
            rate_limit,
            promotion_timeout_ms,
            linger_ms,
        } => ReadStrategy::SendVarReadFirstLinger {
            limiter: Arc::new(RateLimiter::new(*rate_limit)),
            linger: std::time::Duration::from_millis(*linger_ms),
            promotion_timeout: std::time::Duration::from_millis(*promotion_timeout_ms),
        },
    }
}

/// Build the configured `Repairer` stack from `chronoset-config`.
pub fn build_repairer(cfg: &RepairerConfig) -> Arc<dyn Repairer> {
    match cfg {
        RepairerConfig::Nop => Arc::new(NopRepairer),
        RepairerConfig::All => Arc::new(AllRepairs),
        RepairerConfig::RateLimited {
            max_kms_per_second,
            inner,
        } => Arc::new(RateLimited::new(*max_kms_per_second, build_repairer(inner))),
        RepairerConfig::Nonblocking { buffer_size, inner } => {
            Arc::new(Nonblocking::new(*buffer_size, build_repairer(inner)))
        }
    }
}

/// Build a `Farm` wired against real Redis storage nodes, per `Config`.
pub fn build_redis_farm(config: &Config) -> Result<Farm, crate::storage::Error> {
    let clusters = config
        .clusters
        .iter()
        .map(|cluster_cfg| {
            let nodes = cluster_cfg
                .nodes
                .iter()
                .map(|node| {
                    let backend = crate::storage::redis_backend::RedisBackend::new(
                        node,
                        config.pooling.max_conns_per_instance,
                        config.pooling.connect_timeout(),
                        config.pooling.checkout_timeout(),
                        config.pooling.read_timeout(),
                        config.pooling.write_timeout(),
                    )?;
                    Ok(Arc::new(backend) as Arc<dyn crate::storage::OrderedSetStore>)
                })
                .collect::<Result<Vec<_>, crate::storage::Error>>()?;
            Ok(Arc::new(
                Cluster::new(nodes, config.max_size).with_select_gap(config.select_gap()),
            ))
        })
        .collect::<Result<Vec<_>, crate::storage::Error>>()?;

    Ok(Farm::new(
        clusters,
        config.write_quorum,
        build_read_strategy(&config.read_strategy),
        build_repairer(&config.repairer),
    ))
}

static FARM: Lazy<ArcSwap<Option<Farm>>> = Lazy::new(|| ArcSwap::from_pointee(None));

/// The process-wide farm handle, installed at startup by `main` via
/// `set_farm`. `None` until then.
pub fn farm() -> Arc<Option<Farm>> {
    FARM.load_full()
}

/// Install the process-wide farm, replacing whatever was there before.
pub fn set_farm(new: Farm) {
    FARM.store(Arc::new(Some(new)));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::OrderedSetStore;

    fn memory_farm(n_clusters: usize, write_quorum: usize) -> Farm {
        let clusters = (0..n_clusters)
            .map(|i| {
                let nodes: Vec<Arc<dyn OrderedSetStore>> =
                    vec![Arc::new(MemoryBackend::new(format!("mem-{i}")))];
                Arc::new(Cluster::new(nodes, 1_000))
            })
            .collect();
        Farm::new(
            clusters,
            write_quorum,
            ReadStrategy::SendAllReadAll,
            Arc::new(AllRepairs),
        )
    }

    #[tokio::test]
    async fn test_insert_then_score_across_replicas() {
        let farm = memory_farm(3, 2);
        let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
        assert!(farm.insert(&ksm).await.unwrap());
        // Give the detached drain task a moment to finish the 3rd replica.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let presence = farm.score(&ksm.key_member()).await.unwrap();
        assert_eq!(presence, Presence::Present { inserted: true, score: 1.0 });
    }

    #[tokio::test]
    async fn test_score_repairs_lagging_replica() {
        let farm = memory_farm(2, 1);
        let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
        // Insert only into the first cluster directly, simulating a
        // replica that missed the write.
        farm.clusters[0].insert(&ksm).await.unwrap();

        let presence = farm.score(&ksm.key_member()).await.unwrap();
        assert_eq!(presence, Presence::Present { inserted: true, score: 1.0 });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let repaired = farm.clusters[1].score(&ksm.key_member()).await.unwrap();
        assert_eq!(repaired, Presence::Present { inserted: true, score: 1.0 });
    }

    #[tokio::test]
    async fn test_quorum_unreachable_errors() {
        // Both clusters have no storage nodes, so every write fails and
        // quorum can never be reached.
        let clusters: Vec<Arc<Cluster>> = (0..2).map(|_| Arc::new(Cluster::new(Vec::new(), 1_000))).collect();
        let farm = Farm::new(clusters, 1, ReadStrategy::SendAllReadAll, Arc::new(AllRepairs));
        let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
        assert!(matches!(
            farm.insert(&ksm).await,
            Err(Error::QuorumUnreachable { want: 1, got: 0 })
        ));
    }

    #[tokio::test]
    async fn test_select_offset_merges_across_replicas() {
        let farm = memory_farm(2, 1);
        farm.clusters[0]
            .insert(&KeyScoreMember::new(b"k".to_vec(), 1.0, b"a".to_vec()))
            .await
            .unwrap();
        farm.clusters[1]
            .insert(&KeyScoreMember::new(b"k".to_vec(), 2.0, b"b".to_vec()))
            .await
            .unwrap();

        let merged = farm.select_offset(b"k", 0, 10).await.unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].member, b"b");
        assert_eq!(merged[1].member, b"a");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_inserts() {
        let farm = memory_farm(1, 1);
        farm.shutdown().await;
        let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
        // MemoryBackend::shutdown is a no-op, but shutdown() must still be
        // callable without panicking and must not leave the farm unusable
        // for reads of data already present before shutdown.
        let _ = farm.insert(&ksm).await;
    }
}
