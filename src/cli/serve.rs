use anyhow::anyhow;
use clap::Args;
use container_bus::DispatchRegistry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::CliContext;

#[derive(Args, Debug)]
pub struct ServeEchoArgs {
    /// Container name; defaults to `MYTHIC_CONTAINER_NAME`
    #[arg(long)]
    pub name: Option<String>,

    /// Message kind to serve, giving the queue `<name>_<kind>`
    #[arg(long, default_value = "echo")]
    pub kind: String,
}

pub async fn execute(args: ServeEchoArgs, context: &CliContext) -> anyhow::Result<()> {
    let name = args
        .name
        .or_else(|| context.config.container_name.clone())
        .ok_or_else(|| anyhow!("no container name: pass --name or set MYTHIC_CONTAINER_NAME"))?;

    let bus = context.bus();
    let shutdown = CancellationToken::new();
    let consumers = DispatchRegistry::new(name.as_str())
        .rpc(&args.kind, |body: Vec<u8>| async move {
            info!("echoing {} bytes", body.len());
            Ok::<_, anyhow::Error>(body)
        })
        .start(&bus, &shutdown);

    info!("container `{name}` serving `{}`; press Ctrl-C to exit", args.kind);
    println!("Serving `{name}_{}`; press Ctrl-C to exit", args.kind);

    signal::ctrl_c().await?;
    println!("\nShutting down…");
    consumers.shutdown().await;
    bus.shutdown();
    println!("Goodbye!");
    Ok(())
}
