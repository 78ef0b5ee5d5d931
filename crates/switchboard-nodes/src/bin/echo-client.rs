//! Periodically sends `echo` to a target node and logs the replies.
//!
//! `ECHO_TARGET` names the target (default `n1`); `ECHO_INTERVAL_MS` sets
//! the period (default 500).

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use switchboard_core::Envelope;
use switchboard_nodes::{NodeContext, Service, duration_from_env, init_tracing, serve};

const DEFAULT_TARGET: &str = "n1";
const DEFAULT_INTERVAL_MS: u64 = 500;

struct EchoClient {
    target: String,
    interval: Duration,
}

#[async_trait]
impl Service for EchoClient {
    async fn on_start(&mut self, ctx: &NodeContext) -> Result<()> {
        let ctx = ctx.clone();
        let target = self.target.clone();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tokio::spawn(async move {
            // The first tick fires immediately; wait one full period instead.
            ticker.tick().await;
            for id in 1u64.. {
                ticker.tick().await;
                let envelope = Envelope::new(ctx.name(), &target, "echo")
                    .with_id(id.to_string())
                    .with_body(json!({ "Message": "hello world" }));
                info!(to = %target, id, "sending echo");
                if let Err(e) = ctx.send(envelope).await {
                    warn!(error = %e, "stopping echo loop");
                    break;
                }
            }
        });
        Ok(())
    }

    async fn on_message(&mut self, _ctx: &NodeContext, envelope: Envelope) -> Result<()> {
        match envelope.kind.as_str() {
            "echo_ok" => {
                let message = envelope
                    .body
                    .as_ref()
                    .and_then(|b| b.get("Message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                info!(
                    from = %envelope.source,
                    in_response_to = %envelope.in_response_to,
                    message,
                    "got echo_ok"
                );
            }
            other => info!(kind = %other, from = %envelope.source, "unexpected message"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let client = EchoClient {
        target: std::env::var("ECHO_TARGET").unwrap_or_else(|_| DEFAULT_TARGET.to_string()),
        interval: duration_from_env("ECHO_INTERVAL_MS", DEFAULT_INTERVAL_MS),
    };
    serve(client).await
}
