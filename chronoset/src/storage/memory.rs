//! In-memory storage backend: reproduces the shard script's decision
//! procedure directly in Rust under a mutex, rather than through a storage
//! client, so tests exercise `cluster`/`farm` logic without any network
//! dependency.
use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::shard_script::{self, CurrentState, Op};

use super::error::Error;
use super::ordered_set::{OrderedSetStore, SetSelector};

#[derive(Debug, Default)]
struct KeySets {
    add: HashMap<Vec<u8>, f64>,
    remove: HashMap<Vec<u8>, f64>,
}

impl KeySets {
    fn set(&self, which: SetSelector) -> &HashMap<Vec<u8>, f64> {
        match which {
            SetSelector::Add => &self.add,
            SetSelector::Remove => &self.remove,
        }
    }

    fn set_mut(&mut self, which: SetSelector) -> &mut HashMap<Vec<u8>, f64> {
        match which {
            SetSelector::Add => &mut self.add,
            SetSelector::Remove => &mut self.remove,
        }
    }

    fn min_score(&self, which: SetSelector) -> Option<f64> {
        self.set(which)
            .values()
            .copied()
            .fold(None, |acc, s| match acc {
                None => Some(s),
                Some(min) if s < min => Some(s),
                Some(min) => Some(min),
            })
    }

    fn evict_min(&mut self, which: SetSelector) {
        let victim = self
            .set(which)
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap().then(a.0.cmp(b.0)))
            .map(|(m, _)| m.clone());
        if let Some(m) = victim {
            self.set_mut(which).remove(&m);
        }
    }
}

/// A single node's worth of storage, held entirely in memory.
pub struct MemoryBackend {
    addr: String,
    keys: Mutex<HashMap<Vec<u8>, KeySets>>,
}

impl MemoryBackend {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            keys: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl OrderedSetStore for MemoryBackend {
    async fn apply(
        &self,
        key: &[u8],
        op: Op,
        score: f64,
        member: &[u8],
        max_size: usize,
    ) -> Result<bool, Error> {
        let mut keys = self.keys.lock();
        let sets = keys.entry(key.to_vec()).or_default();

        let (target, other) = match op {
            Op::Insert => (SetSelector::Add, SetSelector::Remove),
            Op::Delete => (SetSelector::Remove, SetSelector::Add),
        };

        let current = CurrentState {
            add_score: sets.add.get(member).copied(),
            remove_score: sets.remove.get(member).copied(),
            target_len: sets.set(target).len(),
            target_min_score: sets.min_score(target),
        };

        match shard_script::decide(op, current, score, max_size) {
            shard_script::Decision::Reject => Ok(false),
            shard_script::Decision::Apply(mutation) => {
                if mutation.remove_from_other {
                    sets.set_mut(other).remove(member);
                }
                if mutation.evict_min_from_target {
                    sets.evict_min(target);
                }
                sets.set_mut(target).insert(member.to_vec(), score);
                Ok(true)
            }
        }
    }

    async fn score(&self, key: &[u8], set: SetSelector, member: &[u8]) -> Result<Option<f64>, Error> {
        let keys = self.keys.lock();
        Ok(keys.get(key).and_then(|s| s.set(set).get(member).copied()))
    }

    async fn count(&self, key: &[u8], set: SetSelector) -> Result<u64, Error> {
        let keys = self.keys.lock();
        Ok(keys.get(key).map(|s| s.set(set).len() as u64).unwrap_or(0))
    }

    async fn range_desc(
        &self,
        key: &[u8],
        set: SetSelector,
        max_score: Option<f64>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, f64)>, Error> {
        let keys = self.keys.lock();
        let Some(sets) = keys.get(key) else {
            return Ok(Vec::new());
        };
        let mut members: Vec<(Vec<u8>, f64)> = sets
            .set(set)
            .iter()
            .filter(|(_, &score)| max_score.map(|max| score <= max).unwrap_or(true))
            .map(|(m, s)| (m.clone(), *s))
            .collect();
        members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(b.0.cmp(&a.0)));
        let end = (offset + limit).min(members.len());
        let start = offset.min(members.len());
        Ok(members[start..end].to_vec())
    }

    async fn scan_keys(&self, cursor: u64, batch_size: usize) -> Result<(u64, Vec<Vec<u8>>), Error> {
        let keys = self.keys.lock();
        let mut all: Vec<&Vec<u8>> = keys
            .iter()
            .filter(|(_, sets)| !sets.add.is_empty() || !sets.remove.is_empty())
            .map(|(k, _)| k)
            .collect();
        all.sort();

        let start = cursor as usize;
        let end = (start + batch_size).min(all.len());
        let batch = all[start.min(all.len())..end].iter().map(|k| (*k).clone()).collect();
        let next_cursor = if end >= all.len() { 0 } else { end as u64 };
        Ok((next_cursor, batch))
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_insert_then_score() {
        let backend = MemoryBackend::new("mem-0");
        assert!(backend.apply(b"k", Op::Insert, 1.0, b"m", 100).await.unwrap());
        assert_eq!(
            backend.score(b"k", SetSelector::Add, b"m").await.unwrap(),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_stale_insert_rejected() {
        let backend = MemoryBackend::new("mem-0");
        assert!(backend.apply(b"k", Op::Insert, 5.0, b"m", 100).await.unwrap());
        assert!(!backend.apply(b"k", Op::Insert, 3.0, b"m", 100).await.unwrap());
        assert_eq!(
            backend.score(b"k", SetSelector::Add, b"m").await.unwrap(),
            Some(5.0)
        );
    }

    #[tokio::test]
    async fn test_delete_moves_member_out_of_add_set() {
        let backend = MemoryBackend::new("mem-0");
        backend.apply(b"k", Op::Insert, 1.0, b"m", 100).await.unwrap();
        assert!(backend.apply(b"k", Op::Delete, 2.0, b"m", 100).await.unwrap());
        assert_eq!(backend.score(b"k", SetSelector::Add, b"m").await.unwrap(), None);
        assert_eq!(
            backend.score(b"k", SetSelector::Remove, b"m").await.unwrap(),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn test_range_desc_orders_by_score_then_member_descending() {
        let backend = MemoryBackend::new("mem-0");
        backend.apply(b"k", Op::Insert, 1.0, b"a", 100).await.unwrap();
        backend.apply(b"k", Op::Insert, 1.0, b"b", 100).await.unwrap();
        backend.apply(b"k", Op::Insert, 2.0, b"c", 100).await.unwrap();
        let range = backend
            .range_desc(b"k", SetSelector::Add, None, 0, 10)
            .await
            .unwrap();
        assert_eq!(
            range,
            vec![
                (b"c".to_vec(), 2.0),
                (b"b".to_vec(), 1.0),
                (b"a".to_vec(), 1.0),
            ]
        );
    }

    #[tokio::test]
    async fn test_scan_keys_paginates() {
        let backend = MemoryBackend::new("mem-0");
        for i in 0..5 {
            backend
                .apply(format!("k{i}").as_bytes(), Op::Insert, 1.0, b"m", 100)
                .await
                .unwrap();
        }
        let (cursor, batch) = backend.scan_keys(0, 2).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_ne!(cursor, 0);
        let (cursor2, batch2) = backend.scan_keys(cursor, 2).await.unwrap();
        assert_eq!(batch2.len(), 2);
        let (cursor3, batch3) = backend.scan_keys(cursor2, 2).await.unwrap();
        assert_eq!(batch3.len(), 1);
        assert_eq!(cursor3, 0);
    }
}
