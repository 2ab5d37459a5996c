//! Routes inbound replies to the handler bound to their conversation.
//!
//! Outcomes per item:
//! - bound handler ran                -> processed
//! - no binding for the conversation  -> processed, nothing invoked
//! - bound name no longer registered  -> processed, logged
//! - handler returned an error        -> left unprocessed, logged
//!
//! A failing handler is attempted once per pass and picked up again by the
//! next pass. Nothing here retries within a pass. A handler that runs past
//! `handler_timeout_seconds` counts as failed. The claim lease outlasts that
//! timeout.

use chrono::{DateTime, Utc};

use super::events::HandlerContext;
use super::mailroom::Mailroom;
use super::message::InboundItem;
use crate::error::{Error, Result};

/// What happened to one inbound item.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Handled { handler: String },
    Unroutable,
    Unresolved { handler: String },
    Failed { handler: String },
    /// Already processed, or claimed by an overlapping pass.
    Skipped,
}

/// Totals for one `process_unhandled` pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub handled: usize,
    pub unroutable: usize,
    pub unresolved: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Handled { .. } => self.handled += 1,
            DispatchOutcome::Unroutable => self.unroutable += 1,
            DispatchOutcome::Unresolved { .. } => self.unresolved += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.handled + self.unroutable + self.unresolved + self.failed + self.skipped + self.errors
    }
}

impl std::fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} handled, {} unroutable, {} unresolved, {} failed, {} skipped, {} errors",
            self.handled, self.unroutable, self.unresolved, self.failed, self.skipped, self.errors
        )
    }
}

pub struct Dispatcher {
    mailroom: Mailroom,
}

impl Dispatcher {
    pub fn new(mailroom: Mailroom) -> Self {
        Self { mailroom }
    }

    /// Dispatch a single inbound item.
    pub async fn dispatch(&self, item: &InboundItem, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let store = self.mailroom.store();
        let Some(token) = store.claim_inbound(&item.id, Utc::now(), self.mailroom.claim_lease())?
        else {
            tracing::debug!(id = %item.id, "Inbound item already processed or claimed");
            return Ok(DispatchOutcome::Skipped);
        };

        let outcome = match self.route(item, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(release_err) = store.release_inbound(&item.id, &token) {
                    tracing::warn!(id = %item.id, "Failed to release inbound claim: {}", release_err);
                }
                return Err(e);
            }
        };

        match &outcome {
            DispatchOutcome::Failed { .. } => store.release_inbound(&item.id, &token)?,
            _ => {
                if !store.mark_processed(&item.id, &token)? {
                    tracing::warn!(id = %item.id, "Lost claim before marking item processed");
                }
            }
        }
        Ok(outcome)
    }

    async fn route(&self, item: &InboundItem, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let Some(binding) = self.mailroom.events().listener_for(&item.conversation_id)? else {
            tracing::info!(
                id = %item.id,
                conversation_id = %item.conversation_id,
                "No listener for conversation, dropping"
            );
            return Ok(DispatchOutcome::Unroutable);
        };

        let handler = match self.mailroom.handlers().resolve(&binding.handler) {
            Ok(handler) => handler,
            Err(e) => {
                tracing::error!(
                    id = %item.id,
                    conversation_id = %item.conversation_id,
                    "{}; dropping item",
                    e
                );
                return Ok(DispatchOutcome::Unresolved {
                    handler: binding.handler,
                });
            }
        };

        let ctx = HandlerContext {
            mailroom: self.mailroom.clone(),
            handler: binding.handler.clone(),
            now,
        };
        let timeout = self.mailroom.handler_timeout();
        let result = match tokio::time::timeout(timeout, handler.handle(&ctx, item)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("timed out after {:?}", timeout)),
        };
        match result {
            Ok(()) => {
                tracing::info!(
                    id = %item.id,
                    conversation_id = %item.conversation_id,
                    handler = %binding.handler,
                    "Dispatched inbound item"
                );
                Ok(DispatchOutcome::Handled {
                    handler: binding.handler,
                })
            }
            Err(source) => {
                let err = Error::HandlerExecutionFailed {
                    handler: binding.handler.clone(),
                    source,
                };
                tracing::error!(
                    id = %item.id,
                    conversation_id = %item.conversation_id,
                    error = ?err,
                    "{}",
                    err
                );
                Ok(DispatchOutcome::Failed {
                    handler: binding.handler,
                })
            }
        }
    }

    /// Dispatch every unprocessed item in arrival order.
    ///
    /// Each item is isolated: a store error on one is counted and the pass
    /// moves on.
    pub async fn process_unhandled(&self, now: DateTime<Utc>) -> Result<DispatchReport> {
        let items = self.mailroom.store().unprocessed_inbound()?;
        let mut report = DispatchReport::default();

        for item in &items {
            match self.dispatch(item, now).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    tracing::error!(id = %item.id, "Dispatch failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        if !items.is_empty() {
            tracing::info!("Processed inbound items: {}", report);
        }
        Ok(report)
    }
}
