//! mailpacer library root.
//!
//! Outbound messages wait in per-user queues and leave only when they fit the
//! recipient's decaying attention budget. Replies are routed back to the
//! handler bound to their conversation.

pub mod attention;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod handlers;
pub mod heartbeat;
pub mod logging;
pub mod store;
pub mod transport;

pub use attention::{remaining_budget, Budget, DecayPolicy, SendRecord};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{
    Dispatcher, EnqueueOptions, EventRegistry, Handler, HandlerContext, HandlerRegistry,
    InboundItem, Mailroom, MessageQueue, TickReport,
};
pub use error::{Error, Result};
pub use heartbeat::run_daemon;
pub use store::Store;
pub use transport::{OutboundEmail, SendReceipt, Sender};
