//! Multi-key scatter-gather Select: keys are bucketed by node, one range
//! query is pipelined per key against each node in turn (optionally spaced
//! by `Cluster::select_gap`), and the stream closes once every input key
//! has produced exactly one `(key, result)` element.
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;

use crate::model::{Cursor, KeyScoreMember};

use super::{Cluster, Error};

/// One input key's answer: the merged page, or the error that aborted it.
pub type Element = (Vec<u8>, Result<Vec<KeyScoreMember>, Error>);

fn bucket_by_node(cluster: &Cluster, keys: Vec<Vec<u8>>) -> Vec<Vec<Vec<u8>>> {
    let mut buckets: Vec<Vec<Vec<u8>>> = vec![Vec::new(); cluster.node_count()];
    for key in keys {
        let idx = cluster.node_index(&key);
        buckets[idx].push(key);
    }
    buckets
}

fn no_nodes_stream(keys: Vec<Vec<u8>>) -> ReceiverStream<Element> {
    let (tx, rx) = tokio::sync::mpsc::channel(keys.len().max(1));
    tokio::spawn(async move {
        for key in keys {
            if tx.send((key, Err(Error::NoNodes))).await.is_err() {
                return;
            }
        }
    });
    ReceiverStream::new(rx)
}

/// Rank-based pagination for every key in `keys`, scattered across nodes
/// and gathered back as a lazy stream with exactly one element per key.
pub fn select_offset_many(
    cluster: Arc<Cluster>,
    keys: Vec<Vec<u8>>,
    offset: usize,
    limit: usize,
) -> ReceiverStream<Element> {
    if cluster.node_count() == 0 {
        return no_nodes_stream(keys);
    }

    let (tx, rx) = tokio::sync::mpsc::channel(keys.len().max(1));
    let select_gap = cluster.select_gap();

    for bucket in bucket_by_node(&cluster, keys) {
        if bucket.is_empty() {
            continue;
        }
        let cluster = cluster.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            for (i, key) in bucket.into_iter().enumerate() {
                if i > 0 && !select_gap.is_zero() {
                    tokio::time::sleep(select_gap).await;
                }
                let result = cluster.select_offset(&key, offset, limit).await;
                if tx.send((key, result)).await.is_err() {
                    return;
                }
            }
        });
    }

    ReceiverStream::new(rx)
}

/// Cursor-based pagination for every key in `keys`, scattered across nodes
/// and gathered back as a lazy stream with exactly one element per key.
/// Unlike the single-key `Cluster::select_range`, each element carries only
/// the ordered page: the scatter-gather contract produces one slice per
/// key, not a resumable cursor per key.
pub fn select_range_many(
    cluster: Arc<Cluster>,
    keys: Vec<Vec<u8>>,
    start: Option<Cursor>,
    stop: Option<Cursor>,
    limit: usize,
) -> ReceiverStream<Element> {
    if cluster.node_count() == 0 {
        return no_nodes_stream(keys);
    }

    let (tx, rx) = tokio::sync::mpsc::channel(keys.len().max(1));
    let select_gap = cluster.select_gap();

    for bucket in bucket_by_node(&cluster, keys) {
        if bucket.is_empty() {
            continue;
        }
        let cluster = cluster.clone();
        let tx = tx.clone();
        let start = start.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            for (i, key) in bucket.into_iter().enumerate() {
                if i > 0 && !select_gap.is_zero() {
                    tokio::time::sleep(select_gap).await;
                }
                let result = cluster
                    .select_range(&key, start.as_ref(), stop.as_ref(), limit)
                    .await
                    .map(|(page, _next)| page);
                if tx.send((key, result)).await.is_err() {
                    return;
                }
            }
        });
    }

    ReceiverStream::new(rx)
}
