//! Accepts init, waits `EXIT_AFTER_MS` (default 1000), then exits 0.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use switchboard_core::Envelope;
use switchboard_nodes::{NodeContext, Service, duration_from_env, init_tracing, serve};

const DEFAULT_EXIT_AFTER_MS: u64 = 1000;

struct ExitServer {
    exit_after: Duration,
}

#[async_trait]
impl Service for ExitServer {
    async fn on_start(&mut self, ctx: &NodeContext) -> Result<()> {
        let name = ctx.name().to_string();
        let exit_after = self.exit_after;
        tokio::spawn(async move {
            tokio::time::sleep(exit_after).await;
            info!(node = %name, "shutting down");
            std::process::exit(0);
        });
        Ok(())
    }

    async fn on_message(&mut self, _ctx: &NodeContext, envelope: Envelope) -> Result<()> {
        info!(kind = %envelope.kind, from = %envelope.source, "ignoring message");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    serve(ExitServer {
        exit_after: duration_from_env("EXIT_AFTER_MS", DEFAULT_EXIT_AFTER_MS),
    })
    .await
}
