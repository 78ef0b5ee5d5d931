//! Runtime for writing nodes in Rust.
//!
//! A node implements [`Service`] and hands it to [`serve`], which performs
//! the startup handshake (the first stdin line must be the `init` envelope),
//! then calls [`Service::on_message`] for every following envelope. Outgoing
//! envelopes go through [`NodeContext::send`] and are written to stdout by a
//! single writer task, one line each.

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use switchboard_core::envelope::{self, Envelope};

/// Capacity of the outgoing envelope queue.
const OUTBOX_CAPACITY: usize = 100;

/// Startup failures.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("stdin closed before the init envelope arrived")]
    NoInit,

    #[error("expected an init envelope first, got type {0:?}")]
    MissingInit(String),

    #[error("init envelope has no Name")]
    InitWithoutName,

    #[error("stdout is closed")]
    OutputClosed,
}

/// Handle given to a service for learning its name and sending envelopes.
#[derive(Debug, Clone)]
pub struct NodeContext {
    name: String,
    outbox: mpsc::Sender<Envelope>,
}

impl NodeContext {
    /// The name the router assigned to this node.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `envelope` for stdout. Fills in `Source` when left empty.
    pub async fn send(&self, mut envelope: Envelope) -> Result<(), NodeError> {
        if envelope.source.is_empty() {
            envelope.source = self.name.clone();
        }
        self.outbox
            .send(envelope)
            .await
            .map_err(|_| NodeError::OutputClosed)
    }
}

/// Behavior of a node.
#[async_trait]
pub trait Service: Send {
    /// Called once, after init, before any other envelope.
    async fn on_start(&mut self, _ctx: &NodeContext) -> Result<()> {
        Ok(())
    }

    /// Called for every envelope after init, in arrival order.
    async fn on_message(&mut self, ctx: &NodeContext, envelope: Envelope) -> Result<()>;
}

/// Run `service` on this process's stdin and stdout.
pub async fn serve<S: Service>(service: S) -> Result<()> {
    run_node(
        service,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    )
    .await
}

/// Run `service` over arbitrary streams until `input` closes.
pub async fn run_node<S, R, W>(mut service: S, input: R, output: W) -> Result<()>
where
    S: Service,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = input.lines();

    let name = read_init(&mut lines).await?;
    info!(node = %name, "received init");

    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let (input_closed, input_closed_rx) = oneshot::channel();
    let writer = tokio::spawn(write_envelopes(output, outbox_rx, input_closed_rx));
    let ctx = NodeContext { name, outbox };

    service
        .on_start(&ctx)
        .await
        .context("service failed to start")?;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope = match envelope::decode(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, line = %line, "skipping undecodable line");
                continue;
            }
        };
        if let Err(e) = service.on_message(&ctx, envelope).await {
            warn!(error = %e, "failed to handle message");
        }
    }

    debug!("stdin closed");
    // Background tasks may still hold context clones; the writer flushes
    // what is queued and then stops accepting more.
    let _ = input_closed.send(());
    drop(ctx);
    writer
        .await
        .context("writer task panicked")?
        .context("failed to write stdout")
}

async fn read_init<R: AsyncBufRead + Unpin>(lines: &mut tokio::io::Lines<R>) -> Result<String> {
    let line = lines
        .next_line()
        .await
        .context("failed to read init envelope")?
        .ok_or(NodeError::NoInit)?;
    let init = envelope::decode(&line).context("failed to decode init envelope")?;
    if !init.is_init() {
        return Err(NodeError::MissingInit(init.kind).into());
    }
    let body = init.init_body().ok_or(NodeError::InitWithoutName)?;
    Ok(body.name)
}

async fn write_envelopes<W>(
    output: W,
    mut outbox: mpsc::Receiver<Envelope>,
    mut input_closed: oneshot::Receiver<()>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(output);
    let mut closing = false;
    loop {
        let envelope = tokio::select! {
            envelope = outbox.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            _ = &mut input_closed, if !closing => {
                outbox.close();
                closing = true;
                continue;
            }
        };
        let line = envelope::encode(&envelope).context("failed to encode envelope")?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}
