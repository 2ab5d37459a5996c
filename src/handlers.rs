//! Handlers shipped with the binary.

use std::sync::Arc;

use async_trait::async_trait;

use crate::core::{EnqueueOptions, HandlerContext, HandlerRegistry, Handler, InboundItem};
use crate::error::Result;

pub const LOG_REPLY: &str = "builtin.log_reply";
pub const ACKNOWLEDGE: &str = "builtin.acknowledge";

/// Queue used for acknowledgements when the conversation's own queue is unknown.
pub const DEFAULT_QUEUE: &str = "email";

const PREVIEW_CHARS: usize = 80;

/// Writes each reply to the log.
pub struct LogReply;

#[async_trait]
impl Handler for LogReply {
    async fn handle(&self, ctx: &HandlerContext, item: &InboundItem) -> anyhow::Result<()> {
        tracing::info!(
            handler = %ctx.handler,
            id = %item.id,
            conversation_id = %item.conversation_id,
            sender = %item.sender,
            "Reply: {}",
            item.content.chars().take(PREVIEW_CHARS).collect::<String>()
        );
        Ok(())
    }
}

/// Answers each reply with a short acknowledgement in the same conversation.
pub struct Acknowledge {
    pub text: String,
}

impl Default for Acknowledge {
    fn default() -> Self {
        Self {
            text: "Thanks, got your reply.".to_string(),
        }
    }
}

#[async_trait]
impl Handler for Acknowledge {
    async fn handle(&self, ctx: &HandlerContext, item: &InboundItem) -> anyhow::Result<()> {
        let queue = match ctx.mailroom.queue_for_conversation(&item.conversation_id)? {
            Some(queue) => queue,
            None => ctx.mailroom.queue(&item.sender, DEFAULT_QUEUE, ctx.now)?,
        };

        let message = queue.enqueue(
            &self.text,
            &item.sender,
            EnqueueOptions::new()
                .in_conversation(&item.conversation_id)
                .handler(&ctx.handler),
            ctx.now,
        )?;
        tracing::debug!(
            id = %item.id,
            message_id = %message.id,
            queue = queue.name(),
            "Queued acknowledgement"
        );
        Ok(())
    }
}

/// Registry holding every built-in handler.
pub fn builtin_registry() -> Result<HandlerRegistry> {
    HandlerRegistry::new()
        .with(LOG_REPLY, Arc::new(LogReply))?
        .with(ACKNOWLEDGE, Arc::new(Acknowledge::default()))
}
