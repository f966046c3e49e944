//! Wire operations a storage node must provide.
use async_trait::async_trait;

use crate::model::Presence;
use crate::shard_script::Op;

use super::error::Error;

/// Selects which of the two physical sets an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetSelector {
    Add,
    Remove,
}

/// One physically-addressable ordered set operation surface, implemented by
/// both the Redis backend and the in-memory test double. Every method
/// operates on the *logical* key; each backend is responsible for deriving
/// its own physical key names (e.g. `<key>\0+` / `<key>\0-`) internally.
#[async_trait]
pub trait OrderedSetStore: Send + Sync {
    /// Run the shard script atomically against `key`.
    /// Returns `true` if the write was applied, `false` if rejected as a
    /// logical no-op.
    async fn apply(
        &self,
        key: &[u8],
        op: Op,
        score: f64,
        member: &[u8],
        max_size: usize,
    ) -> Result<bool, Error>;

    /// Score of `member` in the named set, if present there.
    async fn score(&self, key: &[u8], set: SetSelector, member: &[u8]) -> Result<Option<f64>, Error>;

    /// Cardinality of the named set.
    async fn count(&self, key: &[u8], set: SetSelector) -> Result<u64, Error>;

    /// Up to `limit` members of the named set in descending (score, member)
    /// order, with `score <= max_score` (or unbounded if `None`). If
    /// `exclusive`, members whose score equals `max_score` AND whose member
    /// bytes are `>=` the paired cursor member are skipped by the caller;
    /// this method returns everything `<= max_score` and leaves exact
    /// cursor-boundary exclusion to `cluster::select` so backends don't need
    /// to reason about cursor internals.
    async fn range_desc(
        &self,
        key: &[u8],
        set: SetSelector,
        max_score: Option<f64>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, f64)>, Error>;

    /// Incremental scan over the keyspace this node holds. Returns the next
    /// cursor (`0` means the scan is complete) and a batch of *logical*
    /// keys observed (deduplicated by the backend across the `+`/`-`
    /// physical suffixes).
    async fn scan_keys(&self, cursor: u64, batch_size: usize) -> Result<(u64, Vec<Vec<u8>>), Error>;

    /// Node address, for error messages and repair bookkeeping.
    fn addr(&self) -> &str;

    /// Stop accepting new work and release pooled resources. Default no-op
    /// for backends (like the in-memory test double) with nothing to close.
    fn shutdown(&self) {}
}

/// Build a `Presence` for `(key, member)` by checking both sets. Normally a
/// member lives in at most one of them; finding it in both means this
/// node's state is corrupted, which surfaces as an error for this node's
/// reply rather than a silent pick of one set over the other.
pub async fn presence(
    store: &dyn OrderedSetStore,
    key: &[u8],
    member: &[u8],
) -> Result<Presence, Error> {
    let added = store.score(key, SetSelector::Add, member).await?;
    let removed = store.score(key, SetSelector::Remove, member).await?;

    match (added, removed) {
        (Some(_), Some(_)) => {
            crate::stats::counters().record_corrupted_state();
            tracing::warn!(
                addr = store.addr(),
                "member present in both add-set and remove-set"
            );
            Err(Error::CorruptedState {
                addr: store.addr().to_string(),
            })
        }
        (Some(score), None) => Ok(Presence::Present { inserted: true, score }),
        (None, Some(score)) => Ok(Presence::Present { inserted: false, score }),
        (None, None) => Ok(Presence::Absent),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A store that always reports a member present in both sets, to drive
    /// `presence()`'s corruption path without hand-editing a real backend's
    /// internal state.
    struct BothSetsStore;

    #[async_trait]
    impl OrderedSetStore for BothSetsStore {
        async fn apply(&self, _: &[u8], _: Op, _: f64, _: &[u8], _: usize) -> Result<bool, Error> {
            unimplemented!()
        }

        async fn score(&self, _: &[u8], _: SetSelector, _: &[u8]) -> Result<Option<f64>, Error> {
            Ok(Some(1.0))
        }

        async fn count(&self, _: &[u8], _: SetSelector) -> Result<u64, Error> {
            unimplemented!()
        }

        async fn range_desc(
            &self,
            _: &[u8],
            _: SetSelector,
            _: Option<f64>,
            _: usize,
            _: usize,
        ) -> Result<Vec<(Vec<u8>, f64)>, Error> {
            unimplemented!()
        }

        async fn scan_keys(&self, _: u64, _: usize) -> Result<(u64, Vec<Vec<u8>>), Error> {
            unimplemented!()
        }

        fn addr(&self) -> &str {
            "both-sets"
        }
    }

    #[tokio::test]
    async fn test_presence_detects_corrupted_state() {
        let store = BothSetsStore;
        let result = presence(&store, b"k", b"m").await;
        assert!(matches!(result, Err(Error::CorruptedState { .. })));
    }
}
