//! CLI commands for mailpacer using clap.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::config::{get_settings_path, load_settings_or_default, Settings};
use crate::core::{EnqueueOptions, Mailroom};
use crate::handlers::builtin_registry;
use crate::heartbeat::run_daemon;
use crate::store::Store;
use crate::transport::{IncomingDir, OutgoingDirSender};

/// mailpacer - paces outbound messages by each recipient's attention budget.
#[derive(Parser)]
#[command(name = "mailpacer")]
#[command(version)]
#[command(about = "Attention-paced outbound mail with reply dispatch", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the tick daemon until Ctrl+C
    Run,

    /// Run a single tick now
    Tick,

    /// Enqueue a message
    Enqueue {
        /// Queue owner
        #[arg(long)]
        user: String,

        /// Queue name
        #[arg(long, default_value = "email")]
        queue: String,

        /// Recipient address
        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: Option<String>,

        /// Reply into an existing conversation
        #[arg(long)]
        conversation: Option<String>,

        /// Handler to bind replies to, e.g. builtin.log_reply
        #[arg(long)]
        handler: Option<String>,

        /// Reading time in minutes (estimated from the content if omitted)
        #[arg(long)]
        minutes: Option<f64>,

        /// Message body
        content: String,
    },

    /// Show or set a queue's attention budget
    Budget {
        #[arg(long)]
        user: String,

        #[arg(long, default_value = "email")]
        queue: String,

        /// New budget in minutes
        #[arg(long)]
        set: Option<u32>,
    },

    /// List queues
    Queues {
        /// Only this user's queues
        #[arg(long)]
        user: Option<String>,
    },

    /// List pending messages of a queue
    Pending {
        #[arg(long)]
        user: String,

        #[arg(long, default_value = "email")]
        queue: String,
    },

    /// Bind a conversation to a handler
    Listen {
        conversation: String,
        handler: String,
    },

    /// List conversation bindings
    Listeners,

    /// Record inbound replies from the incoming directory or a single file
    Ingest {
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// List registered handlers
    Handlers,

    /// Show current status
    Status,
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = load_settings_or_default()?;

        match &self.command {
            Command::Run => cmd_run(settings).await,
            Command::Tick => cmd_tick(settings).await,
            Command::Enqueue {
                user,
                queue,
                to,
                subject,
                conversation,
                handler,
                minutes,
                content,
            } => {
                let mut options = EnqueueOptions::new();
                options.subject = subject.clone();
                options.conversation_id = conversation.clone();
                options.response_handler = handler.clone();
                if let Some(minutes) = minutes {
                    options = options.estimated_minutes(*minutes);
                }
                cmd_enqueue(settings, user, queue, to, content, options)
            }
            Command::Budget { user, queue, set } => cmd_budget(settings, user, queue, *set),
            Command::Queues { user } => cmd_queues(settings, user.as_deref()),
            Command::Pending { user, queue } => cmd_pending(settings, user, queue),
            Command::Listen {
                conversation,
                handler,
            } => cmd_listen(settings, conversation, handler),
            Command::Listeners => cmd_listeners(settings),
            Command::Ingest { file } => cmd_ingest(settings, file.as_deref()),
            Command::Handlers => cmd_handlers(),
            Command::Status => cmd_status(settings),
        }
    }
}

/// Build the mailroom from settings: on-disk store, file sender, built-in handlers.
pub fn open_mailroom(settings: Settings) -> Result<Mailroom> {
    let db_path = settings.storage.resolve_database_path()?;
    let store = Store::open(&db_path)
        .with_context(|| format!("Failed to open store at {}", db_path.display()))?;
    let sender = OutgoingDirSender::new(settings.transport.resolve_outgoing_dir()?);
    let mailroom = Mailroom::new(Arc::new(store), Arc::new(sender), builtin_registry()?, settings)?;
    Ok(mailroom)
}

fn incoming_dir(settings: &Settings) -> Result<IncomingDir> {
    Ok(IncomingDir::new(settings.transport.resolve_incoming_dir()?))
}

// Command implementations

async fn cmd_run(settings: Settings) -> Result<()> {
    let incoming = incoming_dir(&settings)?;
    let mailroom = open_mailroom(settings)?;
    println!("mailpacer running (cron: {}). Ctrl+C to stop.", mailroom.settings().scheduler.cron);
    run_daemon(mailroom, Some(incoming)).await?;
    Ok(())
}

async fn cmd_tick(settings: Settings) -> Result<()> {
    let incoming = incoming_dir(&settings)?;
    let mailroom = open_mailroom(settings)?;
    let ingested = incoming.ingest(mailroom.store())?;
    let report = mailroom.tick(Utc::now()).await;
    println!("Ingested: {}", ingested);
    println!("Tick: {}", report);
    for id in &report.sent {
        println!("  sent {}", id);
    }
    Ok(())
}

fn cmd_enqueue(
    settings: Settings,
    user: &str,
    queue: &str,
    to: &str,
    content: &str,
    options: EnqueueOptions,
) -> Result<()> {
    let mailroom = open_mailroom(settings)?;
    let now = Utc::now();
    let queue = mailroom.queue(user, queue, now)?;
    let message = queue.enqueue(content, to, options, now)?;
    println!(
        "Enqueued {} on {}/{} ({:.1} min, subject: {})",
        message.id,
        queue.user_id(),
        queue.name(),
        message.estimated_minutes(),
        message.subject
    );
    Ok(())
}

fn cmd_budget(settings: Settings, user: &str, queue: &str, set: Option<u32>) -> Result<()> {
    let mailroom = open_mailroom(settings)?;
    let now = Utc::now();
    let mut queue = mailroom.queue(user, queue, now)?;
    if let Some(minutes) = set {
        queue.set_budget(minutes)?;
        println!("Budget for {}/{} set to {} min", queue.user_id(), queue.name(), minutes);
    }
    println!("{}/{}: {}", queue.user_id(), queue.name(), queue.remaining_budget(now)?);
    Ok(())
}

fn cmd_queues(settings: Settings, user: Option<&str>) -> Result<()> {
    let mailroom = open_mailroom(settings)?;
    let now = Utc::now();
    let queues = mailroom.queues(user)?;
    println!("Queues ({}):", queues.len());
    for queue in queues {
        println!(
            "  {}/{}: {} pending, {}",
            queue.user_id(),
            queue.name(),
            queue.pending()?.len(),
            queue.remaining_budget(now)?
        );
    }
    Ok(())
}

fn cmd_pending(settings: Settings, user: &str, queue: &str) -> Result<()> {
    let mailroom = open_mailroom(settings)?;
    let queue = mailroom.queue(user, queue, Utc::now())?;
    let pending = queue.pending()?;
    println!("Pending on {}/{} ({}):", queue.user_id(), queue.name(), pending.len());
    for message in pending {
        println!(
            "  {} [{:.1} min] -> {}: {}",
            message.id,
            message.estimated_minutes(),
            message.recipient,
            message.subject.chars().take(50).collect::<String>()
        );
    }
    Ok(())
}

fn cmd_listen(settings: Settings, conversation: &str, handler: &str) -> Result<()> {
    let mailroom = open_mailroom(settings)?;
    mailroom.events().register_listener(conversation, handler, Utc::now())?;
    println!("Conversation {} -> {}", conversation, handler);
    Ok(())
}

fn cmd_listeners(settings: Settings) -> Result<()> {
    let mailroom = open_mailroom(settings)?;
    let bindings = mailroom.events().listeners()?;
    println!("Listeners ({}):", bindings.len());
    for binding in bindings {
        let known = if mailroom.handlers().contains(&binding.handler) {
            ""
        } else {
            " (not registered)"
        };
        println!("  {} -> {}{}", binding.conversation_id, binding.handler, known);
    }
    Ok(())
}

fn cmd_ingest(settings: Settings, file: Option<&std::path::Path>) -> Result<()> {
    let incoming = incoming_dir(&settings)?;
    let mailroom = open_mailroom(settings)?;
    match file {
        Some(path) => {
            let recorded = IncomingDir::ingest_file(path, mailroom.store())
                .with_context(|| format!("Failed to ingest {}", path.display()))?;
            println!(
                "{}: {}",
                path.display(),
                if recorded { "recorded" } else { "already recorded" }
            );
        }
        None => {
            let report = incoming.ingest(mailroom.store())?;
            println!("{}: {}", incoming.dir().display(), report);
        }
    }
    Ok(())
}

fn cmd_handlers() -> Result<()> {
    let registry = builtin_registry()?;
    println!("Handlers:");
    for name in registry.names() {
        println!("  {}", name);
    }
    Ok(())
}

fn cmd_status(settings: Settings) -> Result<()> {
    let settings_path = get_settings_path()?;
    let db_path = settings.storage.resolve_database_path()?;
    let mailroom = open_mailroom(settings)?;
    let attention = &mailroom.settings().attention;

    println!("Settings: {}", settings_path.display());
    println!("Database: {}", db_path.display());
    println!(
        "Attention: {} min default, halflife {}h, window {}h, policy {:?}",
        attention.default_budget_minutes,
        attention.halflife_hours,
        attention.window_hours,
        attention.policy
    );
    println!("Schedule: {}", mailroom.settings().scheduler.cron);
    println!("Store: {}", mailroom.store().stats()?);
    Ok(())
}
