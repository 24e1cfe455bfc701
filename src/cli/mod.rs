use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use container_bus::ContainerBus;
use serde_json::Value;

pub mod call;
pub mod publish;
pub mod serve;

use call::CallArgs;
use publish::PublishArgs;
use serve::ServeEchoArgs;

use mythic_container::config::ContainerConfig;

#[derive(Parser, Debug)]
#[command(
    name = "mythic_container",
    about = "Talk to the orchestrator's message bus from the command line",
    version = "0.2.0"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// `.env` file merged into the process environment
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Also write logs to this file (rotated daily)
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// OpenTelemetry OTLP/HTTP metrics endpoint (e.g. http://localhost:4318/v1/metrics)
    #[arg(long, global = true)]
    pub otel_metrics_endpoint: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a request and print the reply
    Call(CallArgs),

    /// One-way send through the direct exchange
    Send(PublishArgs),

    /// Publish on the topic exchange
    Broadcast(PublishArgs),

    /// Serve an echo RPC handler until Ctrl-C
    ServeEcho(ServeEchoArgs),
}

pub struct CliContext {
    pub config: ContainerConfig,
}

impl CliContext {
    pub fn new(config: ContainerConfig) -> Self {
        Self { config }
    }

    pub fn bus(&self) -> ContainerBus {
        ContainerBus::amqp(self.config.rabbitmq.clone(), self.config.timings.clone())
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Call(args) => call::execute(args, context).await,
        Commands::Send(args) => publish::send(args, context).await,
        Commands::Broadcast(args) => publish::broadcast(args, context).await,
        Commands::ServeEcho(args) => serve::execute(args, context).await,
    }
}

/// Payloads are JSON by convention; reject anything else before it hits
/// the wire.
pub(crate) fn json_payload(raw: &str) -> anyhow::Result<Vec<u8>> {
    let value: Value = serde_json::from_str(raw).with_context(|| format!("payload is not valid JSON: `{raw}`"))?;
    Ok(serde_json::to_vec(&value)?)
}
