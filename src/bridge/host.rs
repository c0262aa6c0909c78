//! Line-delimited JSON transport between the script host and the backend.
//!
//! The reader loop only parses and routes. Every message is handled on its
//! own task, and all replies funnel through one writer task so lines never
//! interleave.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::protocol::{parse_inbound, Inbound, Outbound, ToolbarMessage};
use super::CapabilityBridge;
use crate::toolbar::ToolbarService;

const OUTBOUND_BUFFER: usize = 64;

/// Serves requests from `reader` until it reaches end of input, then waits
/// for in-flight requests and flushes their replies.
pub async fn serve<R, W>(
    bridge: Arc<CapabilityBridge>,
    toolbar: Arc<ToolbarService>,
    reader: R,
    writer: W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let writer_task = tokio::spawn(write_loop(writer, rx));

    // Split on raw bytes; a line that is not UTF-8 is decoded lossily and rejected by the parser
    let mut segments = reader.split(b'\n');
    let mut tasks = JoinSet::new();
    let mut read_error = None;

    loop {
        tokio::select! {
            segment = segments.next_segment() => {
                let bytes = match segment {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        error!("Cannot read from host: {e}");
                        read_error = Some(e);
                        break;
                    }
                };
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                route(line, &bridge, &toolbar, &tx, &mut tasks);
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    error!("Request task failed: {e}");
                }
            }
        }
    }

    debug!("Host input closed, draining {} request(s)", tasks.len());
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("Request task failed: {e}");
        }
    }

    drop(tx);
    writer_task.await??;
    match read_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Parses one line and spawns the task that answers it.
fn route(
    line: &str,
    bridge: &Arc<CapabilityBridge>,
    toolbar: &Arc<ToolbarService>,
    tx: &mpsc::Sender<Outbound>,
    tasks: &mut JoinSet<()>,
) {
    match parse_inbound(line) {
        Ok(Inbound::Invoke { id, operation }) => {
            let bridge = bridge.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                let result = match operation {
                    Ok(operation) => AssertUnwindSafe(bridge.dispatch(operation))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| {
                            error!(request = %id, "Capability call panicked");
                            "Internal error while handling the request.".to_string()
                        }),
                    Err(reason) => {
                        warn!(request = %id, "Invalid capability call: {reason}");
                        format!("Invalid request: {reason}")
                    }
                };
                let _ = tx.send(Outbound::Result { id, result }).await;
            });
        }
        Ok(Inbound::Toolbar(message)) => {
            let toolbar = toolbar.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                if let Some(reply) = handle_toolbar(&toolbar, message).await {
                    let _ = tx.send(reply).await;
                }
            });
        }
        Ok(Inbound::Unknown(kind)) => {
            warn!("Unknown message type received: {kind}");
        }
        Err(e) => {
            warn!("Received invalid message from host: {e}");
        }
    }
}

/// Applies a layout edit and returns the acknowledgement to post, if any.
pub async fn handle_toolbar(toolbar: &ToolbarService, message: ToolbarMessage) -> Option<Outbound> {
    let reply = match message {
        ToolbarMessage::SaveButtonOrder { order } => toolbar
            .save_button_order(&order)
            .await
            .map(|saved| saved.then_some(Outbound::ButtonOrderSaved)),
        ToolbarMessage::OpenConfigDialog { button } => toolbar
            .upsert_button(button)
            .await
            .map(|button| Some(Outbound::ButtonConfigUpdated { button })),
        ToolbarMessage::AddButton { button } => toolbar
            .add_button(button)
            .await
            .map(|button| Some(Outbound::ButtonSaved { button })),
        ToolbarMessage::RemoveButton { button_id } => match toolbar.remove_button(&button_id).await {
            Ok(Some(_)) => Ok(Some(Outbound::ToolbarUpdated {
                config: toolbar.snapshot().await,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(e),
        },
    };

    reply.unwrap_or_else(|e| {
        error!("Error processing message from host: {e:#}");
        None
    })
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}
