//! Redis-backed `OrderedSetStore`: the shard script runs as a Lua `EVAL`
//! against a sorted-set pair per logical key.
use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;

use chronoset_config::NodeConfig;

use crate::shard_script::{Op, LUA_SCRIPT};

use super::error::Error;
use super::ordered_set::{OrderedSetStore, SetSelector};
use super::pool::Pool;

const ADD_SUFFIX: &[u8] = b"\x00+";
const REMOVE_SUFFIX: &[u8] = b"\x00-";

fn physical_key(key: &[u8], set: SetSelector) -> Vec<u8> {
    let suffix = match set {
        SetSelector::Add => ADD_SUFFIX,
        SetSelector::Remove => REMOVE_SUFFIX,
    };
    let mut out = Vec::with_capacity(key.len() + suffix.len());
    out.extend_from_slice(key);
    out.extend_from_slice(suffix);
    out
}

/// Only the add-set suffix is recognized, so a logical key is derived from
/// its add-set physical key alone: a delete-only key (remove-set physical
/// key with no add-set counterpart) is correctly excluded, and a key whose
/// two physical sets land in different SCAN batches is still emitted once.
fn logical_key(physical: &[u8]) -> Option<Vec<u8>> {
    let len = physical.len();
    if len >= 2 && &physical[len - 2..] == ADD_SUFFIX {
        Some(physical[..len - 2].to_vec())
    } else {
        None
    }
}

pub struct RedisBackend {
    pool: Pool,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl RedisBackend {
    pub fn new(
        node: &NodeConfig,
        max_conns: usize,
        connect_timeout: Duration,
        checkout_timeout: Duration,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Result<Self, Error> {
        Ok(Self {
            pool: Pool::new(node, max_conns, connect_timeout, checkout_timeout)?,
            read_timeout,
            write_timeout,
        })
    }

    fn map_cmd_err(&self, source: redis::RedisError) -> Error {
        Error::Command {
            addr: self.pool.addr().to_string(),
            source,
        }
    }

    /// Runs `fut`, bounded by `timeout`, mapping an expiry into
    /// `Error::CommandTimeout` rather than letting a wedged node's call
    /// hang the caller forever.
    async fn with_timeout<T>(
        &self,
        timeout: Duration,
        kind: &'static str,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        tokio::time::timeout(timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(Error::CommandTimeout {
                    addr: self.pool.addr().to_string(),
                    kind,
                })
            })
    }
}

#[async_trait]
impl OrderedSetStore for RedisBackend {
    async fn apply(
        &self,
        key: &[u8],
        op: Op,
        score: f64,
        member: &[u8],
        max_size: usize,
    ) -> Result<bool, Error> {
        self.with_timeout(self.write_timeout, "write", async {
            let mut conn = self.pool.get().await?;
            let applied: i64 = redis::Script::new(LUA_SCRIPT)
                .key(physical_key(key, SetSelector::Add))
                .key(physical_key(key, SetSelector::Remove))
                .arg(op.lua_flag())
                .arg(score)
                .arg(member)
                .arg(max_size)
                .invoke_async(&mut *conn)
                .await
                .map_err(|e| self.map_cmd_err(e))?;
            Ok(applied == 1)
        })
        .await
    }

    async fn score(&self, key: &[u8], set: SetSelector, member: &[u8]) -> Result<Option<f64>, Error> {
        self.with_timeout(self.read_timeout, "read", async {
            let mut conn = self.pool.get().await?;
            conn.zscore(physical_key(key, set), member)
                .await
                .map_err(|e| self.map_cmd_err(e))
        })
        .await
    }

    async fn count(&self, key: &[u8], set: SetSelector) -> Result<u64, Error> {
        self.with_timeout(self.read_timeout, "read", async {
            let mut conn = self.pool.get().await?;
            conn.zcard(physical_key(key, set))
                .await
                .map_err(|e| self.map_cmd_err(e))
        })
        .await
    }

    async fn range_desc(
        &self,
        key: &[u8],
        set: SetSelector,
        max_score: Option<f64>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, f64)>, Error> {
        self.with_timeout(self.read_timeout, "read", async {
            let mut conn = self.pool.get().await?;
            let max = max_score.unwrap_or(f64::INFINITY);
            // Over-fetch past `offset + limit` because ZREVRANGEBYSCORE breaks
            // ties ascending on member but the storage contract requires
            // descending; the extra members let the post-sort below put any
            // member-tied entries in the right order before truncating.
            let fetch = offset + limit * 2 + 16;
            let raw: Vec<(Vec<u8>, f64)> = conn
                .zrevrangebyscore_limit_withscores(physical_key(key, set), max, f64::NEG_INFINITY, 0, fetch as isize)
                .await
                .map_err(|e| self.map_cmd_err(e))?;
            let mut members = raw;
            members.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then(b.0.cmp(&a.0)));
            let end = (offset + limit).min(members.len());
            let start = offset.min(members.len());
            Ok(members[start..end].to_vec())
        })
        .await
    }

    async fn scan_keys(&self, cursor: u64, batch_size: usize) -> Result<(u64, Vec<Vec<u8>>), Error> {
        self.with_timeout(self.read_timeout, "read", async {
            let mut conn = self.pool.get().await?;
            let (next, physical_keys): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(batch_size)
                .query_async(&mut *conn)
                .await
                .map_err(|e| self.map_cmd_err(e))?;

            let mut logical: Vec<Vec<u8>> = physical_keys.iter().filter_map(|k| logical_key(k)).collect();
            logical.sort();
            logical.dedup();
            Ok((next, logical))
        })
        .await
    }

    fn addr(&self) -> &str {
        self.pool.addr()
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}
