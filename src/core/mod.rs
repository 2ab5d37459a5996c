//! Core module - queues, reply dispatch, and the shared mailroom.
//!
//! - Attention-gated outbound queues
//! - Conversation → handler bindings
//! - Inbound reply dispatch

pub mod dispatch;
pub mod events;
pub mod mailroom;
pub mod message;
pub mod queue;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{DispatchOutcome, DispatchReport, Dispatcher};
pub use events::{EventRegistry, Handler, HandlerContext, HandlerRegistry};
pub use mailroom::{Mailroom, TickReport};
pub use message::{EnqueuedMessage, InboundItem, ListenerBinding, QueueRecord};
pub use queue::{EnqueueOptions, MessageQueue};
