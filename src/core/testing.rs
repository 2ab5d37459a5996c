//! Fakes shared by the core tests.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use super::events::{Handler, HandlerContext, HandlerRegistry};
use super::mailroom::Mailroom;
use super::message::InboundItem;
use crate::config::Settings;
use crate::store::Store;
use crate::transport::{OutboundEmail, SendReceipt, Sender, TransportError};

pub const RECORDING: &str = "test.recording";
pub const FAILING: &str = "test.failing";

pub fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 14, hour, 0, 0).unwrap()
}

/// Sender that records what it was given.
#[derive(Default)]
pub struct FakeSender {
    pub sent: Mutex<Vec<OutboundEmail>>,
    pub fail: AtomicBool,
    pub hang: AtomicBool,
    /// Extra latency per send, in milliseconds.
    pub delay_ms: AtomicU64,
}

impl FakeSender {
    pub fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.message_id.clone())
            .collect()
    }
}

#[async_trait]
impl Sender for FakeSender {
    fn name(&self) -> &str {
        "fake"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendReceipt, TransportError> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::NotAvailable("smtp down".to_string()));
        }
        self.sent.lock().unwrap().push(email.clone());
        Ok(SendReceipt {
            conversation_id: email
                .parent_conversation_id
                .clone()
                .unwrap_or_else(|| format!("thread-{}", email.message_id)),
        })
    }
}

/// Handler that counts invocations and can be told to fail.
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<String>>,
    pub fail: bool,
    pub delay_ms: AtomicU64,
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn handle(&self, _ctx: &HandlerContext, item: &InboundItem) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(item.id.clone());
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail {
            anyhow::bail!("handler blew up on {}", item.id);
        }
        Ok(())
    }
}

pub struct Fixture {
    pub mailroom: Mailroom,
    pub sender: Arc<FakeSender>,
    pub recording: Arc<RecordingHandler>,
    pub failing: Arc<RecordingHandler>,
}

pub fn fixture() -> Fixture {
    fixture_with(Settings::default())
}

pub fn fixture_with(settings: Settings) -> Fixture {
    crate::logging::init_test();
    let store = Arc::new(Store::open_in_memory().unwrap());
    let sender = Arc::new(FakeSender::default());
    let recording = Arc::new(RecordingHandler::default());
    let failing = Arc::new(RecordingHandler {
        fail: true,
        ..RecordingHandler::default()
    });
    let handlers = HandlerRegistry::new()
        .with(RECORDING, recording.clone())
        .unwrap()
        .with(FAILING, failing.clone())
        .unwrap();
    let mailroom = Mailroom::new(store, sender.clone(), handlers, settings).unwrap();

    Fixture {
        mailroom,
        sender,
        recording,
        failing,
    }
}
