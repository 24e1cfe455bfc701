use clap::Parser;
use mythic_container::{
    config::{ConfigManager, ContainerConfig, EnvConfigManager},
    logger::{LogOptions, init_tracing},
};
use tracing::error;

mod cli;

use cli::{Cli, CliContext};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = init_tracing(&LogOptions {
        log_level: cli.global.log_level.clone(),
        log_file: cli.global.log_file.clone(),
        json: cli.global.json_logs,
        otel_metrics_endpoint: cli.global.otel_metrics_endpoint.clone(),
        ..Default::default()
    })?;

    let config_mgr = ConfigManager(EnvConfigManager::new(cli.global.env_file.clone()));
    let config = ContainerConfig::load(&config_mgr).await?;
    let context = CliContext::new(config);

    let result = cli::execute(&context, cli.command).await;
    if let Err(err) = &result {
        error!("❌ {err:#}");
    }
    telemetry.shutdown();
    result
}
