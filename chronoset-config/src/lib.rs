//! Typed configuration for a chronoset farm, loaded from TOML.
pub mod core;
pub mod error;

pub use core::{
    ClusterConfig, Config, NodeConfig, PoolingConfig, ReadStrategyConfig, RepairerConfig,
};
pub use error::Error;
