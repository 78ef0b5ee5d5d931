//! Replies to every `echo` with an `echo_ok` carrying the same body.

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use switchboard_core::Envelope;
use switchboard_nodes::{NodeContext, Service, init_tracing, serve};

const ECHO: &str = "echo";
const ECHO_OK: &str = "echo_ok";

struct EchoServer;

#[async_trait]
impl Service for EchoServer {
    async fn on_message(&mut self, ctx: &NodeContext, envelope: Envelope) -> Result<()> {
        if envelope.kind != ECHO {
            info!(kind = %envelope.kind, from = %envelope.source, "ignoring message");
            return Ok(());
        }
        info!(from = %envelope.source, id = %envelope.id, "echoing");
        let reply = Envelope::reply_to(&envelope, ctx.name(), ECHO_OK, envelope.body.clone());
        ctx.send(reply).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    serve(EchoServer).await
}
