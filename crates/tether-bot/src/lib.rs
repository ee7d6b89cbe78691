use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tether_core::app_server::{AppServerClient, TurnClient};
use tether_core::config::Config;
use tether_core::types::ConversationKey;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::bot::{BatchMeta, BotContext, Dispatcher, reply_handler};
use crate::handlers::message::handle_batch;

mod bot;
mod commands;
mod handlers;
mod ingest;
mod types;

pub use types::{InboundEvent, OutboundReply};

/// Reads events from stdin until EOF or Ctrl-C, writing one reply line per
/// coalesced batch to stdout.
///
/// # Errors
/// Returns an error if the prompts cannot be loaded or stdout fails.
pub async fn run(config: Config) -> Result<()> {
    let client = Arc::new(AppServerClient::from_config(&config));
    let turn_client: Arc<dyn TurnClient> = Arc::clone(&client) as Arc<dyn TurnClient>;
    let context = Arc::new(BotContext::from_config(turn_client, &config)?);

    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_replies(reply_rx));
    let dispatcher = Dispatcher::new(&config.dispatch, reply_handler(context, reply_tx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!(
        command = %config.app_server.command,
        window_ms = config.dispatch.coalesce_window_ms,
        queue_depth = config.dispatch.queue_depth,
        "tether bot started. Reading events from stdin..."
    );

    let interrupted = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down on interrupt.");
                break true;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(event) = ingest::parse_event(&line) else {
                        continue;
                    };
                    if dispatcher.enqueue(event) {
                        tracing::warn!("Event queue overflowed; an older event was dropped");
                    }
                }
                Ok(None) => {
                    tracing::info!("stdin closed; finishing queued batches.");
                    break false;
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to read stdin; shutting down.");
                    break true;
                }
            }
        }
    };

    if interrupted {
        dispatcher.shutdown().await;
    } else {
        tokio::select! {
            () = dispatcher.drain() => {}
            _ = &mut shutdown => {
                tracing::info!("Interrupted while draining.");
                dispatcher.shutdown().await;
            }
        }
    }
    drop(dispatcher);
    client.shutdown().await;

    writer.await.context("Reply writer panicked")?
}

/// Runs a single turn for `key` outside the dispatcher.
///
/// # Errors
/// Returns an error if the prompts cannot be loaded.
pub async fn exec(config: &Config, key: &ConversationKey, prompt: &str) -> Result<OutboundReply> {
    let client = Arc::new(AppServerClient::from_config(config));
    let turn_client: Arc<dyn TurnClient> = Arc::clone(&client) as Arc<dyn TurnClient>;
    let context = BotContext::from_config(turn_client, config)?;

    let event = InboundEvent {
        scope: key.scope().to_string(),
        channel: key.channel().to_string(),
        text: prompt.to_string(),
        ..InboundEvent::default()
    };
    let meta = BatchMeta {
        merge_count: 1,
        queue_wait: std::time::Duration::ZERO,
        enqueued_at: Utc::now(),
    };
    let reply = handle_batch(&context, event, meta).await;
    client.shutdown().await;
    Ok(reply)
}

async fn write_replies(mut replies: mpsc::UnboundedReceiver<OutboundReply>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(reply) = replies.recv().await {
        let mut line = serde_json::to_string(&reply).context("Failed to encode reply")?;
        line.push('\n');
        stdout
            .write_all(line.as_bytes())
            .await
            .context("Failed to write reply to stdout")?;
        stdout.flush().await.context("Failed to flush stdout")?;
    }
    Ok(())
}
