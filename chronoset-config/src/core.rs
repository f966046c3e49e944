//! Typed configuration for a chronoset farm.
use std::fs::read_to_string;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::error::Error;

/// A single storage node (one physical `K+`/`K-` pair per key lives here).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct NodeConfig {
    /// Storage node host.
    pub host: String,
    /// Storage node port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Logical database index on the storage node, if it supports one.
    #[serde(default)]
    pub db: i64,
}

fn default_port() -> u16 {
    6379
}

impl NodeConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

/// One replica: a set of storage nodes a key is sharded across.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ClusterConfig {
    pub nodes: Vec<NodeConfig>,
}

/// Pooling and timeout knobs applied uniformly to every storage node
/// connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct PoolingConfig {
    /// Bounded size of the per-node connection pool.
    #[serde(default = "default_max_conns")]
    pub max_conns_per_instance: usize,
    /// Connect timeout, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Read timeout, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write timeout, in milliseconds.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// How long a caller waits for a pooled connection before giving up.
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,
}

fn default_max_conns() -> usize {
    10
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_read_timeout_ms() -> u64 {
    2_000
}
fn default_write_timeout_ms() -> u64 {
    2_000
}
fn default_checkout_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            max_conns_per_instance: default_max_conns(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
        }
    }
}

impl PoolingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }
}

/// Which `ReadStrategy` the farm should dispatch reads to, and its
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", deny_unknown_fields)]
pub enum ReadStrategyConfig {
    SendOneReadOne,
    SendAllReadAll,
    SendAllReadFirstLinger {
        /// How long stragglers get to answer, in the background, after the
        /// first response has already been returned to the caller.
        #[serde(default = "default_linger_ms")]
        linger_ms: u64,
    },
    SendVarReadFirstLinger {
        /// Max SendAll reads admitted per second; the remainder go SendOne.
        rate_limit: u32,
        /// How long a SendOne read may go without a result before promotion.
        promotion_timeout_ms: u64,
        /// How long stragglers get to answer in the background, same as
        /// `SendAllReadFirstLinger::linger_ms`.
        #[serde(default = "default_linger_ms")]
        linger_ms: u64,
    },
}

fn default_linger_ms() -> u64 {
    50
}

impl Default for ReadStrategyConfig {
    fn default() -> Self {
        ReadStrategyConfig::SendAllReadAll
    }
}

/// Which `Repairer` the farm should dispatch to, and its parameters.
/// `production()` builds the documented composition:
/// `Nonblocking(buffer_size, RateLimited(max_kms_per_second, All))`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", deny_unknown_fields)]
pub enum RepairerConfig {
    Nop,
    All,
    RateLimited {
        max_kms_per_second: u32,
        inner: Box<RepairerConfig>,
    },
    Nonblocking {
        buffer_size: usize,
        inner: Box<RepairerConfig>,
    },
}

impl RepairerConfig {
    pub fn production(buffer_size: usize, max_kms_per_second: u32) -> Self {
        RepairerConfig::Nonblocking {
            buffer_size,
            inner: Box::new(RepairerConfig::RateLimited {
                max_kms_per_second,
                inner: Box::new(RepairerConfig::All),
            }),
        }
    }
}

impl Default for RepairerConfig {
    fn default() -> Self {
        RepairerConfig::production(default_repair_buffer(), default_repair_rate())
    }
}

fn default_repair_buffer() -> usize {
    1_000
}
fn default_repair_rate() -> u32 {
    500
}

/// Top-level configuration: the whole farm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// One entry per replica cluster.
    pub clusters: Vec<ClusterConfig>,
    /// Minimum number of clusters that must acknowledge a write.
    #[serde(default = "default_write_quorum")]
    pub write_quorum: usize,
    /// Per-key bound on the add-set (`maxSize` in this module).
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Pause between per-node dispatches during Select, to spread load.
    #[serde(default)]
    pub select_gap_ms: u64,
    #[serde(default)]
    pub pooling: PoolingConfig,
    #[serde(default)]
    pub read_strategy: ReadStrategyConfig,
    #[serde(default)]
    pub repairer: RepairerConfig,
}

fn default_write_quorum() -> usize {
    1
}
fn default_max_size() -> usize {
    1_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clusters: vec![ClusterConfig {
                nodes: vec![NodeConfig {
                    host: "127.0.0.1".into(),
                    port: default_port(),
                    db: 0,
                }],
            }],
            write_quorum: default_write_quorum(),
            max_size: default_max_size(),
            select_gap_ms: 0,
            pooling: PoolingConfig::default(),
            read_strategy: ReadStrategyConfig::default(),
            repairer: RepairerConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from disk, falling back to defaults if the file
    /// doesn't exist. A malformed file is a hard error.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config: Config = match read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).map_err(|source| Error::Toml {
                path: path.display().to_string(),
                source,
            })?,
            Err(_) => {
                warn!(
                    "\"{}\" doesn't exist, loading defaults instead",
                    path.display()
                );
                Config::default()
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation a farm depends on to operate correctly.
    pub fn validate(&self) -> Result<(), Error> {
        if self.clusters.is_empty() {
            return Err(Error::EmptyFarm);
        }
        for (i, cluster) in self.clusters.iter().enumerate() {
            if cluster.nodes.is_empty() {
                return Err(Error::EmptyCluster(i));
            }
        }
        if self.write_quorum == 0 {
            return Err(Error::QuorumZero);
        }
        if self.write_quorum > self.clusters.len() {
            return Err(Error::QuorumTooHigh {
                quorum: self.write_quorum,
                clusters: self.clusters.len(),
            });
        }
        Ok(())
    }

    pub fn select_gap(&self) -> Duration {
        Duration::from_millis(self.select_gap_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_serializable() {
        let config = Config::default();
        toml::to_string(&config).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/chronoset.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chronoset.toml");
        std::fs::write(&path, "this is not [ toml").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Toml { .. })));
    }

    #[test]
    fn test_quorum_too_high_rejected() {
        let mut config = Config::default();
        config.write_quorum = 2;
        assert!(matches!(
            config.validate(),
            Err(Error::QuorumTooHigh { .. })
        ));
    }

    #[test]
    fn test_quorum_zero_rejected() {
        let mut config = Config::default();
        config.write_quorum = 0;
        assert!(matches!(config.validate(), Err(Error::QuorumZero)));
    }

    #[test]
    fn test_empty_cluster_rejected() {
        let mut config = Config::default();
        config.clusters.push(ClusterConfig { nodes: vec![] });
        assert!(matches!(config.validate(), Err(Error::EmptyCluster(_))));
    }

    #[test]
    fn test_repairer_production_composition() {
        let repairer = RepairerConfig::production(10, 5);
        match repairer {
            RepairerConfig::Nonblocking { buffer_size, inner } => {
                assert_eq!(buffer_size, 10);
                match *inner {
                    RepairerConfig::RateLimited {
                        max_kms_per_second,
                        inner,
                    } => {
                        assert_eq!(max_kms_per_second, 5);
                        assert!(matches!(*inner, RepairerConfig::All));
                    }
                    _ => panic!("expected RateLimited"),
                }
            }
            _ => panic!("expected Nonblocking"),
        }
    }

    #[test]
    fn test_round_trip_toml() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(config, parsed);
    }
}
