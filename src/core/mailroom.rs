//! Shared services behind every queue and the dispatcher, plus the periodic tick.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::dispatch::{DispatchReport, Dispatcher};
use super::events::{EventRegistry, HandlerRegistry};
use super::message::QueueRecord;
use super::queue::MessageQueue;
use crate::attention::DecayPolicy;
use crate::config::{validate_settings, Settings};
use crate::error::{Error, Result};
use crate::store::Store;
use crate::transport::Sender;

/// Store, sender, handler table and settings, cheap to clone.
#[derive(Clone)]
pub struct Mailroom {
    store: Arc<Store>,
    sender: Arc<dyn Sender>,
    handlers: Arc<HandlerRegistry>,
    events: EventRegistry,
    settings: Arc<Settings>,
    policy: DecayPolicy,
}

impl Mailroom {
    pub fn new(
        store: Arc<Store>,
        sender: Arc<dyn Sender>,
        handlers: HandlerRegistry,
        settings: Settings,
    ) -> Result<Self> {
        validate_settings(&settings)?;
        let policy = DecayPolicy::from_settings(&settings.attention)?;
        let handlers = Arc::new(handlers);
        let events = EventRegistry::new(store.clone(), handlers.clone());

        Ok(Self {
            store,
            sender,
            handlers,
            events,
            settings: Arc::new(settings),
            policy,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn sender(&self) -> &Arc<dyn Sender> {
        &self.sender
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn policy(&self) -> DecayPolicy {
        self.policy
    }

    pub fn claim_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.settings.scheduler.claim_lease_seconds as i64)
    }

    pub fn delivery_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settings.scheduler.delivery_timeout_seconds)
    }

    pub fn handler_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settings.scheduler.handler_timeout_seconds)
    }

    /// Get or create the queue for (user, name). New queues start with
    /// the configured default budget.
    pub fn queue(&self, user_id: &str, name: &str, now: DateTime<Utc>) -> Result<MessageQueue> {
        let record = self.store.get_or_create_queue(
            user_id,
            name,
            self.settings.attention.default_budget_minutes,
            now,
        )?;
        Ok(self.bind(record))
    }

    /// Queues of one user, or of everyone.
    pub fn queues(&self, user_id: Option<&str>) -> Result<Vec<MessageQueue>> {
        Ok(self
            .store
            .list_queues(user_id)?
            .into_iter()
            .map(|record| self.bind(record))
            .collect())
    }

    /// The queue that sent the latest message in `conversation_id`.
    pub fn queue_for_conversation(&self, conversation_id: &str) -> Result<Option<MessageQueue>> {
        Ok(self
            .store
            .queue_for_conversation(conversation_id)?
            .map(|record| self.bind(record)))
    }

    pub fn bind(&self, record: QueueRecord) -> MessageQueue {
        MessageQueue::new(record, self.clone())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.clone())
    }

    /// One scheduler tick: offer every queue one send, then dispatch replies.
    ///
    /// Never fails. Each queue and each inbound item is isolated and every
    /// problem is logged and counted in the report.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();

        match self.queues(None) {
            Ok(queues) => {
                for queue in queues {
                    match queue.try_send_next(now).await {
                        Ok(Some(message)) => report.sent.push(message.id),
                        Ok(None) => report.held += 1,
                        Err(Error::ClaimLost { message_id }) => {
                            tracing::warn!(
                                queue = queue.name(),
                                user = queue.user_id(),
                                message_id = %message_id,
                                "Delivered after losing the claim, another tick owns it now"
                            );
                            report.claims_lost += 1;
                        }
                        Err(e) => {
                            tracing::error!(
                                queue = queue.name(),
                                user = queue.user_id(),
                                "Send failed, will retry next tick: {}",
                                e
                            );
                            report.send_failures += 1;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("Could not list queues: {}", e);
                report.send_failures += 1;
            }
        }

        match self.dispatcher().process_unhandled(now).await {
            Ok(dispatch) => report.dispatch = dispatch,
            Err(e) => {
                tracing::error!("Could not process inbound items: {}", e);
                report.dispatch.errors += 1;
            }
        }

        tracing::debug!("Tick finished: {}", report);
        report
    }
}

/// Summary of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// IDs of messages delivered this tick.
    pub sent: Vec<String>,
    /// Queues with nothing sendable.
    pub held: usize,
    pub send_failures: usize,
    /// Deliveries that finished after their claim had lapsed.
    pub claims_lost: usize,
    pub dispatch: DispatchReport,
}

impl std::fmt::Display for TickReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} sent, {} held, {} send failures, {} claims lost; inbound: {}",
            self.sent.len(),
            self.held,
            self.send_failures,
            self.claims_lost,
            self.dispatch
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::InboundItem;
    use crate::core::queue::EnqueueOptions;
    use crate::core::testing::{at, fixture, RECORDING};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_invalid_settings_rejected() {
        let fx = fixture();
        let mut settings = Settings::default();
        settings.attention.halflife_hours = 0.0;

        let result = Mailroom::new(
            fx.mailroom.store().clone(),
            fx.mailroom.sender().clone(),
            HandlerRegistry::new(),
            settings,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_queue_is_shared_per_user_and_name() {
        let fx = fixture();
        let a = fx.mailroom.queue("alice", "email", at(9)).unwrap();
        let b = fx.mailroom.queue("alice", "email", at(10)).unwrap();
        let c = fx.mailroom.queue("bob", "email", at(10)).unwrap();

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.record().attention_budget_minutes, 120);
        assert_eq!(fx.mailroom.queues(Some("alice")).unwrap().len(), 1);
        assert_eq!(fx.mailroom.queues(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tick_isolates_failures_and_dispatches_replies() {
        let fx = fixture();
        let alice = fx.mailroom.queue("alice", "email", at(9)).unwrap();
        let bob = fx.mailroom.queue("bob", "email", at(9)).unwrap();
        let options = EnqueueOptions::new().subject("Hi").handler(RECORDING);
        let sent = alice.enqueue("Hello Alice", "alice@example.com", options.clone(), at(9)).unwrap();
        bob.enqueue("Hello Bob", "bob@example.com", options, at(9)).unwrap();

        let report = fx.mailroom.tick(at(10)).await;
        assert_eq!(report.sent.len(), 2);
        assert_eq!(report.send_failures, 0);

        // Alice answers in the thread the first tick opened.
        let conversation = fx
            .mailroom
            .store()
            .message(&sent.id)
            .unwrap()
            .unwrap()
            .conversation_id
            .unwrap();
        fx.mailroom
            .store()
            .record_inbound(&InboundItem::new("g1", &conversation, "alice@example.com", "Sure", at(11)))
            .unwrap();
        alice.enqueue("Another", "alice@example.com", EnqueueOptions::new().in_conversation(&conversation), at(11)).unwrap();
        fx.sender.fail.store(true, Ordering::SeqCst);

        let report = fx.mailroom.tick(at(12)).await;
        assert_eq!(report.send_failures, 1);
        assert_eq!(report.held, 1);
        assert_eq!(report.dispatch.handled, 1);
        assert_eq!(fx.recording.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_for_conversation() {
        let fx = fixture();
        let queue = fx.mailroom.queue("alice", "open_questions", at(9)).unwrap();
        queue
            .enqueue(
                "What are you curious about?",
                "alice@example.com",
                EnqueueOptions::new().subject("Open questions").handler(RECORDING),
                at(9),
            )
            .unwrap();
        let sent = queue.try_send_next(at(10)).await.unwrap().unwrap();

        let found = fx
            .mailroom
            .queue_for_conversation(sent.conversation_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), queue.id());
        assert!(fx.mailroom.queue_for_conversation("unknown").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlapping_slow_ticks_deliver_and_dispatch_once() {
        let fx = fixture();
        fx.sender.delay_ms.store(200, Ordering::SeqCst);
        fx.recording.delay_ms.store(200, Ordering::SeqCst);
        fx.mailroom
            .queue("alice", "email", at(9))
            .unwrap()
            .enqueue(
                "Hello",
                "alice@example.com",
                EnqueueOptions::new().subject("Hi").handler(RECORDING),
                at(9),
            )
            .unwrap();
        fx.mailroom.events().register_listener("t1", RECORDING, at(9)).unwrap();
        fx.mailroom
            .store()
            .record_inbound(&InboundItem::new("g1", "t1", "alice@example.com", "Sure", at(9)))
            .unwrap();

        // The second tick starts while the first is still delivering, and its
        // tick time is already past the first tick's lease.
        let (first, second) = tokio::join!(fx.mailroom.tick(at(10)), async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            fx.mailroom.tick(at(10) + chrono::Duration::minutes(3)).await
        });

        assert_eq!(fx.sender.sent_ids().len(), 1);
        assert_eq!(first.sent.len() + second.sent.len(), 1);
        assert_eq!(fx.recording.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.dispatch.handled + second.dispatch.handled, 1);
        assert_eq!(first.claims_lost + second.claims_lost, 0);
    }
}
