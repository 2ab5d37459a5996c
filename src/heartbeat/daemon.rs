//! Tick daemon: ingests replies and ticks the mailroom on a cron schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::core::{Mailroom, TickReport};
use crate::error::{Error, Result};
use crate::transport::IncomingDir;

use super::scheduler::TickSchedule;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct TickDaemon {
    mailroom: Mailroom,
    incoming: Option<IncomingDir>,
    schedule: Arc<RwLock<TickSchedule>>,
    running: Arc<RwLock<bool>>,
}

impl TickDaemon {
    pub fn new(mailroom: Mailroom, schedule: TickSchedule) -> Self {
        Self {
            mailroom,
            incoming: None,
            schedule: Arc::new(RwLock::new(schedule)),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Also pick up reply files from `incoming` before each tick.
    pub fn with_incoming(mut self, incoming: IncomingDir) -> Self {
        self.incoming = Some(incoming);
        self
    }

    /// Handle used to stop the loop from another task.
    pub fn running(&self) -> Arc<RwLock<bool>> {
        self.running.clone()
    }

    /// Run until stopped. Ticks are never run concurrently by one daemon.
    pub async fn start(&self) -> Result<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(Error::Other("Daemon already running".to_string()));
            }
            *running = true;
        }

        {
            let mut schedule = self.schedule.write().await;
            let next = schedule.calculate_next_run(Utc::now())?;
            tracing::info!(cron = %schedule.cron, next = %next, "Tick daemon started");
        }

        loop {
            if !*self.running.read().await {
                tracing::info!("Tick daemon stopping");
                break;
            }

            let now = Utc::now();
            let due = self.schedule.read().await.is_due(now);
            if due {
                let report = self.run_once(now).await;
                if !report.sent.is_empty() || report.dispatch.total() > 0 {
                    tracing::info!("Tick: {}", report);
                }
                let next = self.schedule.write().await.mark_run(now)?;
                tracing::debug!(next = %next, "Next tick scheduled");
            }

            sleep(POLL_INTERVAL).await;
        }

        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        tracing::info!("Tick daemon stopped");
    }

    /// Ingest waiting reply files, then tick. Never fails.
    pub async fn run_once(&self, now: DateTime<Utc>) -> TickReport {
        if let Some(incoming) = &self.incoming {
            match incoming.ingest(self.mailroom.store()) {
                Ok(report) if report.recorded + report.rejected > 0 => {
                    tracing::info!(dir = %incoming.dir().display(), "Ingested replies: {}", report);
                }
                Ok(_) => {}
                Err(e) => tracing::error!(dir = %incoming.dir().display(), "Ingest failed: {}", e),
            }
        }
        self.mailroom.tick(now).await
    }
}

/// Run the tick daemon until Ctrl+C.
pub async fn run_daemon(mailroom: Mailroom, incoming: Option<IncomingDir>) -> Result<()> {
    let schedule = TickSchedule::new(&mailroom.settings().scheduler.cron)?;
    let mut daemon = TickDaemon::new(mailroom, schedule);
    if let Some(incoming) = incoming {
        daemon = daemon.with_incoming(incoming);
    }

    let running = daemon.running();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        *running.write().await = false;
    });

    daemon.start().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::{at, fixture, RECORDING};
    use crate::core::EnqueueOptions;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_run_once_ingests_then_dispatches() {
        let fx = fixture();
        let dir = tempfile::tempdir().unwrap();
        fx.mailroom.events().register_listener("t1", RECORDING, at(9)).unwrap();
        std::fs::write(
            dir.path().join("g1.json"),
            r#"{"id":"g1","conversation_id":"t1","sender":"alice@example.com","content":"Yes!","received_at":"2024-05-14T10:00:00Z"}"#,
        )
        .unwrap();
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
        let daemon = TickDaemon::new(fx.mailroom.clone(), TickSchedule::interval(5).unwrap())
            .with_incoming(IncomingDir::new(dir.path()));

        let report = daemon.run_once(at(11)).await;

        assert_eq!(report.sent.len(), 1);
        assert_eq!(report.dispatch.handled, 1);
        assert_eq!(fx.recording.calls.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("g1.json").exists());
    }

    #[tokio::test]
    async fn test_stopped_daemon_exits() {
        let fx = fixture();
        let daemon = TickDaemon::new(fx.mailroom.clone(), TickSchedule::interval(5).unwrap());
        let running = daemon.running();

        let handle = tokio::spawn(async move { daemon.start().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        *running.write().await = false;

        let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
