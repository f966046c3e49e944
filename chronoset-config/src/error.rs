use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config file \"{path}\" is not valid TOML: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("cluster {0} has no storage nodes")]
    EmptyCluster(usize),

    #[error("farm has no clusters")]
    EmptyFarm,

    #[error("write_quorum ({quorum}) exceeds cluster count ({clusters})")]
    QuorumTooHigh { quorum: usize, clusters: usize },

    #[error("write_quorum must be at least 1")]
    QuorumZero,
}
