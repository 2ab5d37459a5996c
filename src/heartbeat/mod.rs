//! Scheduled driver for the mailroom tick.

pub mod daemon;
pub mod scheduler;

pub use daemon::{run_daemon, TickDaemon};
pub use scheduler::TickSchedule;
