use std::time::Duration;

use clap::Args;
use container_bus::CallOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use super::{CliContext, json_payload};

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Routing key of the RPC queue, e.g. `apollo_payload_build`
    pub routing_key: String,

    /// JSON request body
    #[arg(default_value = "{}")]
    pub payload: String,

    /// Per-attempt reply timeout
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Give up after this long (retries forever when unset)
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

pub async fn execute(args: CallArgs, context: &CliContext) -> anyhow::Result<()> {
    let payload = json_payload(&args.payload)?;
    let bus = context.bus();

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            on_ctrl_c.cancel();
        }
    });

    let mut options = CallOptions::default().with_cancel(cancel);
    if let Some(secs) = args.timeout_secs {
        options = options.with_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.deadline_secs {
        options = options.with_deadline(Duration::from_secs(secs));
    }

    let reply = bus.call_with(&args.routing_key, &payload, options).await;
    bus.shutdown();
    let reply = reply?;

    match serde_json::from_slice::<serde_json::Value>(&reply) {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", String::from_utf8_lossy(&reply)),
    }
    Ok(())
}
