//! Stress-run CLI: loads a run configuration and drives it to completion.

use std::path::PathBuf;

use clap::Parser;
use eyre::{Result, WrapErr};
use tracing_subscriber::EnvFilter;

use rrp_stress::chain::EvmChain;
use rrp_stress::cloud::{AwsLogSource, CloudLogSource, GcpLogSource, LogDialect};
use rrp_stress::config::StressConfig;
use rrp_stress::deploy::{OracleDeployer, ServiceManager, ShellRunner};
use rrp_stress::metrics::MetricsPoller;
use rrp_stress::persist::MetricsSinks;
use rrp_stress::protocol::ContractArtifacts;
use rrp_stress::rpc::RetryingRpcClient;
use rrp_stress::run::RunCoordinator;
use rrp_stress::wallet::{self, OracleKeys};

#[derive(Parser)]
#[command(name = "stress", about = "Drive stress runs against an RRP oracle deployment")]
struct Args {
    /// Path of the run configuration file.
    #[arg(long, default_value = "stress-config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = StressConfig::load(&args.config)?;

    let master = wallet::signer_from_mnemonic(&config.master_mnemonic)
        .wrap_err("invalid master mnemonic")?;
    let rpc = RetryingRpcClient::new(config.rpc_url.as_str())?;
    let chain = EvmChain::connect(rpc, master, config.test_mode.manual_mining()).await?;

    let oracle = OracleKeys::from_mnemonic(&config.oracle_mnemonic)?;
    let artifacts = ContractArtifacts::load(&config.artifacts_dir)?;

    let runner = ShellRunner;
    let source = match config.cloud.provider {
        LogDialect::Aws => CloudLogSource::Aws(AwsLogSource::new(runner.clone())),
        LogDialect::Gcp => {
            CloudLogSource::Gcp(GcpLogSource::new(runner.clone(), config.cloud.region.clone()))
        }
    };
    let poller = MetricsPoller::new(source, config.cloud.provider, config.cloud.stage_prefix.as_str())
        .with_expected_components(config.cloud.expected_components);

    let deployer = OracleDeployer::new(
        runner.clone(),
        config.deployer_image.clone(),
        config.config_dir.clone(),
        config.env_file.clone(),
        config.skip_version_check,
    );
    let services = config
        .test_mode
        .restart_services()
        .then(|| ServiceManager::new(runner.clone(), config.ssh.clone()));
    let sinks = MetricsSinks::from_config(config.postgres.as_ref(), &config.json_output).await?;

    let coordinator =
        RunCoordinator::new(config, chain, poller, deployer, services, sinks, oracle, artifacts);
    tracing::info!(test_key = coordinator.test_key(), "starting stress session");
    coordinator.execute().await
}
