use clap::Args;

use super::{CliContext, json_payload};

#[derive(Args, Debug)]
pub struct PublishArgs {
    pub routing_key: String,

    /// JSON message body
    #[arg(default_value = "{}")]
    pub payload: String,
}

pub async fn send(args: PublishArgs, context: &CliContext) -> anyhow::Result<()> {
    let payload = json_payload(&args.payload)?;
    let bus = context.bus();
    let result = bus.try_send(&args.routing_key, &payload).await;
    bus.shutdown();
    result?;
    println!("✅ Sent to `{}`.", args.routing_key);
    Ok(())
}

pub async fn broadcast(args: PublishArgs, context: &CliContext) -> anyhow::Result<()> {
    let payload = json_payload(&args.payload)?;
    let bus = context.bus();
    let result = bus.broadcast(&args.routing_key, &payload).await;
    bus.shutdown();
    result?;
    println!("✅ Broadcast on `{}`.", args.routing_key);
    Ok(())
}
