//! A single-copy sharded layer over N storage nodes.
pub mod error;
pub mod select_stream;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::{Cursor, KeyMember, KeyScoreMember, Presence};
use crate::shard_script::Op;
use crate::storage::{self, presence, FnvKeyHasher, KeyHasher, OrderedSetStore, SetSelector};

pub use error::Error;

/// Position for the node-by-node keyspace scan `Keys()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeysCursor {
    pub node_idx: usize,
    pub node_cursor: u64,
}

/// Internal fetch sizes `select_range` retries at when ties at the start
/// boundary eat into a single fetch's validated yield: 25, doubled twice to
/// 100, then stepped by 50 twice more.
const RANGE_FETCH_ATTEMPTS: [usize; 5] = [25, 50, 100, 150, 200];

/// A collection of shards a key is deterministically routed across.
pub struct Cluster {
    nodes: Vec<Arc<dyn OrderedSetStore>>,
    hasher: Arc<dyn KeyHasher>,
    max_size: usize,
    select_gap: Duration,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("nodes", &self.nodes.len())
            .field("max_size", &self.max_size)
            .field("select_gap", &self.select_gap)
            .finish()
    }
}

impl Cluster {
    pub fn new(nodes: Vec<Arc<dyn OrderedSetStore>>, max_size: usize) -> Self {
        Self {
            nodes,
            hasher: Arc::new(FnvKeyHasher),
            max_size,
            select_gap: Duration::ZERO,
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn KeyHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Pause observed between successive per-node dispatches of a
    /// multi-key Select, to spread load across nodes.
    pub fn with_select_gap(mut self, select_gap: Duration) -> Self {
        self.select_gap = select_gap;
        self
    }

    pub fn select_gap(&self) -> Duration {
        self.select_gap
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Close every shard's connection pool. Idempotent.
    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }

    fn node_for(&self, key: &[u8]) -> Result<&Arc<dyn OrderedSetStore>, Error> {
        if self.nodes.is_empty() {
            return Err(Error::NoNodes);
        }
        Ok(&self.nodes[self.node_index(key)])
    }

    /// Which node `node_for` would route `key` to, without borrowing the
    /// node itself. Used to bucket keys by node ahead of a multi-key
    /// scatter-gather Select.
    fn node_index(&self, key: &[u8]) -> usize {
        storage::shard_index(self.hasher.as_ref(), key, self.nodes.len())
    }

    /// Route `ksm` to its shard and apply the insert. Returns `true` if the
    /// write was applied, `false` if it was a logical no-op.
    pub async fn insert(&self, ksm: &KeyScoreMember) -> Result<bool, Error> {
        let node = self.node_for(&ksm.key)?;
        let applied = node
            .apply(&ksm.key, Op::Insert, ksm.score, &ksm.member, self.max_size)
            .await?;
        if !applied {
            debug!(addr = node.addr(), "insert rejected as logical no-op");
        }
        Ok(applied)
    }

    /// Route `ksm` to its shard and apply the delete.
    pub async fn delete(&self, ksm: &KeyScoreMember) -> Result<bool, Error> {
        let node = self.node_for(&ksm.key)?;
        let applied = node
            .apply(&ksm.key, Op::Delete, ksm.score, &ksm.member, self.max_size)
            .await?;
        if !applied {
            debug!(addr = node.addr(), "delete rejected as logical no-op");
        }
        Ok(applied)
    }

    /// Presence of `(key, member)` on this cluster's shard for that key.
    pub async fn score(&self, km: &KeyMember) -> Result<Presence, Error> {
        let node = self.node_for(&km.key)?;
        Ok(presence(node.as_ref(), &km.key, &km.member).await?)
    }

    /// Rank-based pagination: the `limit` highest-scored members of `key`
    /// starting at `offset`.
    pub async fn select_offset(
        &self,
        key: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<KeyScoreMember>, Error> {
        let node = self.node_for(key)?;
        let rows = node
            .range_desc(key, SetSelector::Add, None, offset, limit)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(member, score)| KeyScoreMember::new(key.to_vec(), score, member))
            .collect())
    }

    /// Cursor-based pagination: up to `limit` members of `key`, starting
    /// just after `start` (exclusive of the tie at `start.score`) and
    /// stopping at `stop` (exclusive of the tie at `stop.score`), in
    /// (score, member) descending order. Returns the page and the cursor to
    /// resume from, which is `None` once the set (or `stop`) is reached.
    ///
    /// Members tied with `start.score` are easy to under-fetch: a single
    /// `limit`-sized request can come back entirely consumed by entries the
    /// start-side exclusion then throws away. When that happens the request
    /// is retried with a larger internal fetch size (`RANGE_FETCH_ATTEMPTS`)
    /// until `limit` validated results are collected, the stop boundary is
    /// truly passed, or the attempts run out.
    pub async fn select_range(
        &self,
        key: &[u8],
        start: Option<&Cursor>,
        stop: Option<&Cursor>,
        limit: usize,
    ) -> Result<(Vec<KeyScoreMember>, Option<Cursor>), Error> {
        let node = self.node_for(key)?;
        fetch_validated_range(node, key, start, stop, limit).await
    }

    /// Incremental scan over this cluster's logical keyspace, one storage
    /// node at a time.
    pub async fn keys(
        &self,
        cursor: KeysCursor,
        batch_size: usize,
    ) -> Result<(Vec<Vec<u8>>, Option<KeysCursor>), Error> {
        if self.nodes.is_empty() {
            return Err(Error::NoNodes);
        }
        if cursor.node_idx >= self.nodes.len() {
            return Ok((Vec::new(), None));
        }

        let node = &self.nodes[cursor.node_idx];
        let (next_node_cursor, batch) = match node.scan_keys(cursor.node_cursor, batch_size).await {
            Ok(result) => result,
            Err(e) => {
                warn!(addr = node.addr(), error = %e, "keyspace scan failed on node, skipping to next");
                let next = if cursor.node_idx + 1 < self.nodes.len() {
                    Some(KeysCursor {
                        node_idx: cursor.node_idx + 1,
                        node_cursor: 0,
                    })
                } else {
                    None
                };
                return Ok((Vec::new(), next));
            }
        };

        let next = if next_node_cursor != 0 {
            Some(KeysCursor {
                node_idx: cursor.node_idx,
                node_cursor: next_node_cursor,
            })
        } else if cursor.node_idx + 1 < self.nodes.len() {
            Some(KeysCursor {
                node_idx: cursor.node_idx + 1,
                node_cursor: 0,
            })
        } else {
            None
        };

        Ok((batch, next))
    }
}

/// Shared core of `Cluster::select_range` and the multi-key scatter-gather
/// Select in `select_stream`: fetch, validate against `start`/`stop`, and
/// retry with a larger internal limit when the first fetch's validated
/// yield falls short of `limit`.
pub(crate) async fn fetch_validated_range(
    node: &Arc<dyn OrderedSetStore>,
    key: &[u8],
    start: Option<&Cursor>,
    stop: Option<&Cursor>,
    limit: usize,
) -> Result<(Vec<KeyScoreMember>, Option<Cursor>), Error> {
    let max_score = start.map(|c| c.score);

    // Entries tied with `start.score` were already returned on the page
    // that produced `start`; only members strictly less are new.
    let past_start = |member: &[u8], score: f64| match start {
        None => true,
        Some(s) => score < s.score || (score == s.score && member < s.member.as_slice()),
    };

    // `stop.score` terminates inclusion once a member `<=` `stop.member` is
    // reached at that exact score; nothing past `stop.score` is ever kept.
    let within_stop = |member: &[u8], score: f64| match stop {
        None => true,
        Some(s) => score > s.score || (score == s.score && member > s.member.as_slice()),
    };

    let mut page = Vec::with_capacity(limit);
    let mut more = false;

    for (attempt, &internal_limit) in RANGE_FETCH_ATTEMPTS.iter().enumerate() {
        let fetch_limit = internal_limit.max(limit);
        let rows = node.range_desc(key, SetSelector::Add, max_score, 0, fetch_limit).await?;
        let exhausted_source = rows.len() < fetch_limit;

        page.clear();
        more = false;
        let mut crossed_stop = false;
        for (member, score) in rows {
            if !past_start(&member, score) {
                continue;
            }
            if !within_stop(&member, score) {
                crossed_stop = true;
                break;
            }
            if page.len() == limit {
                more = true;
                break;
            }
            page.push(KeyScoreMember::new(key.to_vec(), score, member));
        }

        let done = page.len() >= limit || crossed_stop || exhausted_source;
        if done || attempt == RANGE_FETCH_ATTEMPTS.len() - 1 {
            break;
        }
    }

    let next = if more {
        page.last().map(|last| Cursor::new(last.score, last.member.clone()))
    } else {
        None
    };

    Ok((page, next))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::memory::MemoryBackend;

    fn cluster(n: usize, max_size: usize) -> Cluster {
        let nodes: Vec<Arc<dyn OrderedSetStore>> = (0..n)
            .map(|i| Arc::new(MemoryBackend::new(format!("mem-{i}"))) as Arc<dyn OrderedSetStore>)
            .collect();
        Cluster::new(nodes, max_size)
    }

    #[tokio::test]
    async fn test_insert_then_score() {
        let c = cluster(4, 100);
        let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
        assert!(c.insert(&ksm).await.unwrap());
        let presence = c.score(&ksm.key_member()).await.unwrap();
        assert_eq!(presence, Presence::Present { inserted: true, score: 1.0 });
    }

    #[tokio::test]
    async fn test_delete_after_insert() {
        let c = cluster(4, 100);
        let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
        c.insert(&ksm).await.unwrap();
        let del = KeyScoreMember::new(b"k".to_vec(), 2.0, b"m".to_vec());
        assert!(c.delete(&del).await.unwrap());
        let presence = c.score(&ksm.key_member()).await.unwrap();
        assert_eq!(presence, Presence::Present { inserted: false, score: 2.0 });
    }

    #[tokio::test]
    async fn test_select_offset_orders_descending() {
        let c = cluster(1, 100);
        for (score, member) in [(1.0, "a"), (2.0, "b"), (3.0, "c")] {
            c.insert(&KeyScoreMember::new(b"k".to_vec(), score, member.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        let page = c.select_offset(b"k", 0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].member, b"c");
        assert_eq!(page[1].member, b"b");
    }

    #[tokio::test]
    async fn test_select_range_pages_to_completion() {
        let c = cluster(1, 100);
        for i in 0..10u32 {
            c.insert(&KeyScoreMember::new(
                b"k".to_vec(),
                i as f64,
                format!("m{i}").into_bytes(),
            ))
            .await
            .unwrap();
        }

        let mut collected = Vec::new();
        let mut cursor = None;
        loop {
            let (page, next) = c.select_range(b"k", cursor.as_ref(), None, 3).await.unwrap();
            collected.extend(page);
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(collected.len(), 10);
        assert_eq!(collected[0].member, b"m9");
        assert_eq!(collected[9].member, b"m0");
    }

    #[tokio::test]
    async fn test_select_range_stops_at_stop_cursor() {
        let c = cluster(1, 100);
        for i in 0..10u32 {
            c.insert(&KeyScoreMember::new(
                b"k".to_vec(),
                i as f64,
                format!("m{i}").into_bytes(),
            ))
            .await
            .unwrap();
        }

        // Stop just past m5 (score 5.0): only m9..m6 should come back.
        let stop = Cursor::new(5.0, b"m5".to_vec());
        let (page, next) = c.select_range(b"k", None, Some(&stop), 100).await.unwrap();
        assert_eq!(page.len(), 4);
        assert_eq!(page[0].member, b"m9");
        assert_eq!(page[3].member, b"m6");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn test_select_range_ties_at_start_score_retry_until_satisfied() {
        let c = cluster(1, 1_000);
        // 60 members tied at the same score: the first (25-row) internal
        // fetch attempt comes back under `limit` once the start-side
        // exclusion eats into it, forcing a retry at a larger internal
        // limit.
        for i in 0..60u32 {
            c.insert(&KeyScoreMember::new(
                b"k".to_vec(),
                1.0,
                format!("m{i:02}").into_bytes(),
            ))
            .await
            .unwrap();
        }
        let start = Cursor::new(1.0, b"m59".to_vec());
        let (page, _next) = c.select_range(b"k", Some(&start), None, 30).await.unwrap();
        assert_eq!(page.len(), 30);
        assert_eq!(page[0].member, b"m58");
        for ksm in &page {
            assert!(ksm.member.as_slice() < b"m59".as_slice());
        }
    }

    #[tokio::test]
    async fn test_keys_scans_across_nodes() {
        let c = cluster(2, 100);
        for i in 0..6u32 {
            c.insert(&KeyScoreMember::new(
                format!("k{i}").into_bytes(),
                1.0,
                b"m".to_vec(),
            ))
            .await
            .unwrap();
        }

        let mut all = Vec::new();
        let mut cursor = KeysCursor::default();
        loop {
            let (batch, next) = c.keys(cursor, 2).await.unwrap();
            all.extend(batch);
            match next {
                Some(c) => cursor = c,
                None => break,
            }
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 6);
    }

    #[tokio::test]
    async fn test_no_nodes_errors() {
        let c = Cluster::new(Vec::new(), 100);
        let ksm = KeyScoreMember::new(b"k".to_vec(), 1.0, b"m".to_vec());
        assert!(matches!(c.insert(&ksm).await, Err(Error::NoNodes)));
    }
}
