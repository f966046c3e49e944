use std::process::ExitCode;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chronoset::cli::{Cli, Commands};
use chronoset::cluster::KeysCursor;
use chronoset::farm::{self, build_redis_farm};
use chronoset_config::Config;

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Configcheck => {
            let snapshot = chronoset::stats::counters().snapshot();
            info!(?snapshot, clusters = config.clusters.len(), "configuration is valid");
            ExitCode::SUCCESS
        }
        Commands::Run => run(config).await,
        Commands::Keys { batch_size } => list_keys(config, batch_size).await,
    }
}

async fn run(config: Config) -> ExitCode {
    let farm = match build_redis_farm(&config) {
        Ok(farm) => farm,
        Err(e) => {
            error!(error = %e, "failed to build farm");
            return ExitCode::FAILURE;
        }
    };
    info!(clusters = farm.cluster_count(), "farm ready");
    farm::set_farm(farm);

    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to install ctrl-c handler");
        return ExitCode::FAILURE;
    }
    info!("shutting down");
    if let Some(farm) = farm::farm().as_ref() {
        farm.shutdown().await;
    }
    ExitCode::SUCCESS
}

async fn list_keys(config: Config, batch_size: usize) -> ExitCode {
    let farm = match build_redis_farm(&config) {
        Ok(farm) => farm,
        Err(e) => {
            error!(error = %e, "failed to build farm");
            return ExitCode::FAILURE;
        }
    };

    let mut cursor = KeysCursor::default();
    loop {
        let (batch, next) = match farm.keys(cursor, batch_size).await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "key scan failed");
                return ExitCode::FAILURE;
            }
        };
        for key in batch {
            println!("{}", URL_SAFE_NO_PAD.encode(key));
        }
        match next {
            Some(c) => cursor = c,
            None => break,
        }
    }
    ExitCode::SUCCESS
}
