//! Read dispatch across a farm's clusters.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use rand::Rng as _;

use crate::cluster::Cluster;

use super::rate_limiter::RateLimiter;

/// How many clusters a read touches, and how results are raced together.
pub enum ReadStrategy {
    /// Contact exactly one cluster.
    SendOneReadOne,
    /// Contact every cluster and wait for all of them.
    SendAllReadAll,
    /// Contact every cluster; return as soon as the first answers, while the
    /// rest keep going in the background (bounded by `linger`) so stragglers
    /// still feed a repair pass without holding up the caller.
    SendAllReadFirstLinger { linger: Duration },
    /// Admission-controlled hybrid: if the rate limiter has a token, behave
    /// like `SendAllReadFirstLinger`; otherwise behave like `SendOneReadOne`,
    /// promoting to the remaining clusters if that one read doesn't finish
    /// within `promotion_timeout`.
    SendVarReadFirstLinger {
        limiter: Arc<RateLimiter>,
        linger: Duration,
        promotion_timeout: Duration,
    },
}

/// One cluster's answer, `None` if it failed or never responded in time.
pub type Responses<T> = Vec<Option<T>>;

impl ReadStrategy {
    /// Run the strategy, ignoring stragglers. Kept for call sites that don't
    /// need a repair pass over the full response set.
    pub async fn dispatch<T, F, Fut>(&self, clusters: &[Arc<Cluster>], read: F) -> Responses<T>
    where
        T: Clone + Send + 'static,
        F: Fn(Arc<Cluster>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, crate::cluster::Error>> + Send + 'static,
    {
        self.dispatch_with_repair(clusters, read, |_| {}).await
    }

    /// Run the strategy and hand the *complete* response set (including any
    /// stragglers that arrive after the caller-visible result) to
    /// `on_complete`. For `SendOneReadOne`/`SendAllReadAll`, that happens
    /// synchronously before this returns. For the lingering strategies, the
    /// caller-visible result is only the first response; the rest continue
    /// on a detached task and `on_complete` fires once they're done (or
    /// `linger` expires), so a caller doing repair never blocks on it.
    pub async fn dispatch_with_repair<T, F, Fut, R>(
        &self,
        clusters: &[Arc<Cluster>],
        read: F,
        on_complete: R,
    ) -> Responses<T>
    where
        T: Clone + Send + 'static,
        F: Fn(Arc<Cluster>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, crate::cluster::Error>> + Send + 'static,
        R: FnOnce(Responses<T>) + Send + 'static,
    {
        match self {
            ReadStrategy::SendOneReadOne => {
                let responses = Self::send_one(clusters, &read).await;
                on_complete(responses.clone());
                responses
            }
            ReadStrategy::SendAllReadAll => {
                let responses = Self::send_all(clusters, &read).await;
                on_complete(responses.clone());
                responses
            }
            ReadStrategy::SendAllReadFirstLinger { linger } => {
                Self::send_all_first_then_linger(clusters, &read, *linger, on_complete).await
            }
            ReadStrategy::SendVarReadFirstLinger {
                limiter,
                linger,
                promotion_timeout,
            } => {
                if limiter.try_acquire() {
                    Self::send_all_first_then_linger(clusters, &read, *linger, on_complete).await
                } else {
                    Self::send_one_with_promotion_and_repair(
                        clusters,
                        &read,
                        *promotion_timeout,
                        *linger,
                        on_complete,
                    )
                    .await
                }
            }
        }
    }

    async fn send_one<T, F, Fut>(clusters: &[Arc<Cluster>], read: &F) -> Responses<T>
    where
        T: Send + 'static,
        F: Fn(Arc<Cluster>) -> Fut,
        Fut: Future<Output = Result<T, crate::cluster::Error>> + Send + 'static,
    {
        let mut responses: Responses<T> = (0..clusters.len()).map(|_| None).collect();
        if clusters.is_empty() {
            return responses;
        }
        let idx = rand::rng().random_range(0..clusters.len());
        if let Ok(value) = read(clusters[idx].clone()).await {
            responses[idx] = Some(value);
        }
        responses
    }

    async fn send_all<T, F, Fut>(clusters: &[Arc<Cluster>], read: &F) -> Responses<T>
    where
        T: Send + 'static,
        F: Fn(Arc<Cluster>) -> Fut,
        Fut: Future<Output = Result<T, crate::cluster::Error>> + Send + 'static,
    {
        let mut responses: Responses<T> = (0..clusters.len()).map(|_| None).collect();
        let mut pending: FuturesUnordered<_> = clusters
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let fut = read(c.clone());
                async move { (idx, fut.await) }
            })
            .collect();

        while let Some((idx, result)) = pending.next().await {
            if let Ok(value) = result {
                responses[idx] = Some(value);
            }
        }

        responses
    }

    /// Returns as soon as the first cluster answers; the remaining in-flight
    /// reads move onto a detached task bounded by `linger`, which calls
    /// `on_complete` with the final response set once they're done (or the
    /// linger window closes). Nothing is dropped silently: a response that
    /// doesn't land before `linger` simply stays `None` in that final set.
    async fn send_all_first_then_linger<T, F, Fut, R>(
        clusters: &[Arc<Cluster>],
        read: &F,
        linger: Duration,
        on_complete: R,
    ) -> Responses<T>
    where
        T: Clone + Send + 'static,
        F: Fn(Arc<Cluster>) -> Fut,
        Fut: Future<Output = Result<T, crate::cluster::Error>> + Send + 'static,
        R: FnOnce(Responses<T>) + Send + 'static,
    {
        let responses: Responses<T> = vec![None; clusters.len()];
        if clusters.is_empty() {
            on_complete(responses.clone());
            return responses;
        }

        let mut pending: FuturesUnordered<_> = clusters
            .iter()
            .enumerate()
            .map(|(idx, c)| {
                let fut = read(c.clone());
                async move { (idx, fut.await) }
            })
            .collect();

        let mut responses = responses;
        let Some((idx, result)) = pending.next().await else {
            on_complete(responses.clone());
            return responses;
        };
        if let Ok(value) = result {
            responses[idx] = Some(value);
        }

        let immediate = responses.clone();

        tokio::spawn(async move {
            let _ = tokio::time::timeout(linger, async {
                while let Some((idx, result)) = pending.next().await {
                    if let Ok(value) = result {
                        responses[idx] = Some(value);
                    }
                }
            })
            .await;
            on_complete(responses);
        });

        immediate
    }

    async fn send_one_with_promotion_and_repair<T, F, Fut, R>(
        clusters: &[Arc<Cluster>],
        read: &F,
        promotion_timeout: Duration,
        linger: Duration,
        on_complete: R,
    ) -> Responses<T>
    where
        T: Clone + Send + 'static,
        F: Fn(Arc<Cluster>) -> Fut,
        Fut: Future<Output = Result<T, crate::cluster::Error>> + Send + 'static,
        R: FnOnce(Responses<T>) + Send + 'static,
    {
        let n = clusters.len();
        let mut responses = vec![None; n];
        if clusters.is_empty() {
            on_complete(responses.clone());
            return responses;
        }
        let idx = rand::rng().random_range(0..n);
        let primary = read(clusters[idx].clone());

        match tokio::time::timeout(promotion_timeout, primary).await {
            Ok(Ok(value)) => {
                responses[idx] = Some(value);
                on_complete(responses.clone());
                responses
            }
            Ok(Err(_)) | Err(_) => {
                // Timed out or failed: promote to every other cluster, keeping
                // the lingering-repair behavior for that wider fan-out.
                let other_idxs: Vec<usize> = (0..n).filter(|&i| i != idx).collect();
                let others: Vec<Arc<Cluster>> =
                    other_idxs.iter().map(|&i| clusters[i].clone()).collect();
                let remap_idxs = other_idxs.clone();
                let remap = move |other_responses: Responses<T>| {
                    let mut full = vec![None; n];
                    for (j, resp) in other_responses.into_iter().enumerate() {
                        full[remap_idxs[j]] = resp;
                    }
                    on_complete(full);
                };
                let other_responses =
                    Self::send_all_first_then_linger(&others, read, linger, remap).await;
                let mut full = vec![None; n];
                for (j, resp) in other_responses.into_iter().enumerate() {
                    full[other_idxs[j]] = resp;
                }
                full
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::OrderedSetStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn clusters(n: usize) -> Vec<Arc<Cluster>> {
        (0..n)
            .map(|i| {
                let nodes: Vec<Arc<dyn OrderedSetStore>> =
                    vec![Arc::new(MemoryBackend::new(format!("mem-{i}")))];
                Arc::new(Cluster::new(nodes, 100))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_send_all_read_all_hits_every_cluster() {
        let cs = clusters(3);
        let strategy = ReadStrategy::SendAllReadAll;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let responses = strategy
            .dispatch(&cs, move |_c| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, crate::cluster::Error>(1u32)
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(responses.iter().filter(|r| r.is_some()).count(), 3);
    }

    #[tokio::test]
    async fn test_send_one_read_one_hits_exactly_one() {
        let cs = clusters(4);
        let strategy = ReadStrategy::SendOneReadOne;
        let responses = strategy
            .dispatch(&cs, |_c| async { Ok::<_, crate::cluster::Error>(7u32) })
            .await;
        assert_eq!(responses.iter().filter(|r| r.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_send_var_falls_back_to_send_one_when_rate_limited() {
        let cs = clusters(4);
        let limiter = Arc::new(RateLimiter::new(1));
        assert!(limiter.try_acquire()); // drain the single token up front
        let strategy = ReadStrategy::SendVarReadFirstLinger {
            limiter,
            linger: Duration::from_millis(50),
            promotion_timeout: Duration::from_millis(10),
        };
        let responses = strategy
            .dispatch(&cs, |_c| async { Ok::<_, crate::cluster::Error>(1u32) })
            .await;
        // Either the fast primary answered alone, or it was slow and got
        // promoted to the rest, either way at least one response lands.
        assert!(responses.iter().any(|r| r.is_some()));
    }

    #[tokio::test]
    async fn test_send_all_first_linger_returns_first_and_repairs_from_stragglers() {
        let cs = clusters(3);
        let strategy = ReadStrategy::SendAllReadFirstLinger {
            linger: Duration::from_millis(200),
        };
        let (done_tx, mut done_rx) = tokio::sync::mpsc::channel(1);
        let immediate = strategy
            .dispatch_with_repair(
                &cs,
                |_c| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok::<_, crate::cluster::Error>(1u32)
                },
                move |final_responses| {
                    let _ = done_tx.try_send(final_responses);
                },
            )
            .await;
        assert_eq!(immediate.iter().filter(|r| r.is_some()).count(), 1);

        let final_responses = done_rx.recv().await.expect("on_complete should fire");
        assert_eq!(final_responses.iter().filter(|r| r.is_some()).count(), 3);
    }
}
