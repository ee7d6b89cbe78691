pub(crate) mod context;
pub(crate) mod queue;

use std::sync::Arc;

use tokio::sync::mpsc;

pub(crate) use context::BotContext;
pub(crate) use queue::{BatchFuture, BatchHandler, BatchMeta, Dispatcher};

use crate::handlers::message::handle_batch;
use crate::types::{InboundEvent, OutboundReply};

/// Batch handler that runs each batch through the coordinator and forwards
/// the reply to the writer.
pub(crate) fn reply_handler(
    context: Arc<BotContext>,
    replies: mpsc::UnboundedSender<OutboundReply>,
) -> BatchHandler<InboundEvent> {
    Arc::new(move |event: InboundEvent, meta: BatchMeta| -> BatchFuture {
        let context = Arc::clone(&context);
        let replies = replies.clone();
        Box::pin(async move {
            let reply = handle_batch(&context, event, meta).await;
            if replies.send(reply).is_err() {
                tracing::warn!("Reply writer closed; dropping reply");
            }
        })
    })
}
