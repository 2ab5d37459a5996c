//! Configuration loading for mailpacer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the mailpacer home directory (~/.mailpacer).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".mailpacer"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.mailpacer/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings, falling back to defaults when no settings file exists yet.
///
/// A file that exists but does not parse or validate is still an error.
pub fn load_settings_or_default() -> Result<Settings> {
    let path = get_settings_path()?;
    if !path.exists() {
        tracing::debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }
    load_settings()
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    let attention = &settings.attention;
    if !(attention.halflife_hours > 0.0) {
        return Err(Error::Config(format!(
            "attention.halflife_hours must be positive, got {}",
            attention.halflife_hours
        )));
    }
    if attention.window_hours == 0 {
        return Err(Error::Config("attention.window_hours must be positive".to_string()));
    }
    if attention.words_per_minute == 0 {
        return Err(Error::Config(
            "attention.words_per_minute must be positive".to_string(),
        ));
    }
    if attention.hour_awake > 23 || attention.hour_bedtime > 24 {
        return Err(Error::Config(format!(
            "attention hours out of range: awake={} bedtime={}",
            attention.hour_awake, attention.hour_bedtime
        )));
    }
    if attention.hour_awake >= attention.hour_bedtime {
        return Err(Error::Config(format!(
            "attention.hour_awake ({}) must be before attention.hour_bedtime ({})",
            attention.hour_awake, attention.hour_bedtime
        )));
    }
    if attention.utc_offset_minutes.unsigned_abs() >= MAX_UTC_OFFSET_MINUTES {
        return Err(Error::Config(format!(
            "attention.utc_offset_minutes must be within +/-{}, got {}",
            MAX_UTC_OFFSET_MINUTES - 1,
            attention.utc_offset_minutes
        )));
    }

    let scheduler = &settings.scheduler;
    if scheduler.delivery_timeout_seconds == 0 || scheduler.handler_timeout_seconds == 0 {
        return Err(Error::Config(format!(
            "scheduler timeouts must be positive: delivery={} handler={}",
            scheduler.delivery_timeout_seconds, scheduler.handler_timeout_seconds
        )));
    }
    // A claim must outlive the work it covers or an overlapping tick takes it over.
    let longest_work = scheduler
        .delivery_timeout_seconds
        .max(scheduler.handler_timeout_seconds);
    if scheduler.claim_lease_seconds <= longest_work {
        return Err(Error::Config(format!(
            "scheduler.claim_lease_seconds ({}) must exceed the delivery and handler timeouts ({})",
            scheduler.claim_lease_seconds, longest_work
        )));
    }
    cron::Schedule::from_str(&settings.scheduler.cron).map_err(|e| {
        Error::Config(format!(
            "scheduler.cron '{}' is invalid: {}",
            settings.scheduler.cron, e
        ))
    })?;
    Ok(())
}

/// Offsets of a day or more are not time zones.
const MAX_UTC_OFFSET_MINUTES: u32 = 24 * 60;

/// Which hours count against the attention budget.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPolicy {
    #[default]
    Elapsed,
    WakingHours,
}

/// Attention accounting configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Attention {
    #[serde(default = "default_budget_minutes")]
    pub default_budget_minutes: u32,
    #[serde(default = "default_halflife_hours")]
    pub halflife_hours: f64,
    #[serde(default = "default_window_hours")]
    pub window_hours: u32,
    #[serde(default = "default_words_per_minute")]
    pub words_per_minute: u32,
    #[serde(default)]
    pub policy: BudgetPolicy,
    #[serde(default = "default_hour_awake")]
    pub hour_awake: u32,
    #[serde(default = "default_hour_bedtime")]
    pub hour_bedtime: u32,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_budget_minutes() -> u32 {
    120
}

fn default_halflife_hours() -> f64 {
    6.0
}

fn default_window_hours() -> u32 {
    36
}

fn default_words_per_minute() -> u32 {
    250
}

fn default_hour_awake() -> u32 {
    9
}

fn default_hour_bedtime() -> u32 {
    17
}

impl Default for Attention {
    fn default() -> Self {
        Self {
            default_budget_minutes: default_budget_minutes(),
            halflife_hours: default_halflife_hours(),
            window_hours: default_window_hours(),
            words_per_minute: default_words_per_minute(),
            policy: BudgetPolicy::default(),
            hour_awake: default_hour_awake(),
            hour_bedtime: default_hour_bedtime(),
            utc_offset_minutes: 0,
        }
    }
}

/// Periodic driver configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Scheduler {
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_delivery_timeout_seconds")]
    pub delivery_timeout_seconds: u64,
    #[serde(default = "default_handler_timeout_seconds")]
    pub handler_timeout_seconds: u64,
    /// How long a claim on a message or inbound item stays live. Must exceed
    /// both timeouts.
    #[serde(default = "default_claim_lease_seconds")]
    pub claim_lease_seconds: u64,
}

fn default_cron() -> String {
    "0 */5 * * * *".to_string()
}

fn default_delivery_timeout_seconds() -> u64 {
    30
}

fn default_handler_timeout_seconds() -> u64 {
    60
}

fn default_claim_lease_seconds() -> u64 {
    120
}

impl Default for Scheduler {
    fn default() -> Self {
        Self {
            cron: default_cron(),
            delivery_timeout_seconds: default_delivery_timeout_seconds(),
            handler_timeout_seconds: default_handler_timeout_seconds(),
            claim_lease_seconds: default_claim_lease_seconds(),
        }
    }
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Storage {
    pub database_path: Option<PathBuf>,
}

impl Storage {
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("mailpacer.db")),
        }
    }
}

/// File transport configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Transport {
    pub outgoing_dir: Option<PathBuf>,
    pub incoming_dir: Option<PathBuf>,
}

impl Transport {
    pub fn resolve_outgoing_dir(&self) -> Result<PathBuf> {
        match &self.outgoing_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("outgoing")),
        }
    }

    pub fn resolve_incoming_dir(&self) -> Result<PathBuf> {
        match &self.incoming_dir {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("incoming")),
        }
    }
}

/// mailpacer settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub attention: Attention,

    #[serde(default)]
    pub scheduler: Scheduler,

    #[serde(default)]
    pub storage: Storage,

    #[serde(default)]
    pub transport: Transport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: Settings = serde_json::from_str("{}").unwrap();

        assert_eq!(settings.attention.default_budget_minutes, 120);
        assert_eq!(settings.attention.halflife_hours, 6.0);
        assert_eq!(settings.attention.window_hours, 36);
        assert_eq!(settings.attention.policy, BudgetPolicy::Elapsed);
        assert_eq!(settings.scheduler.cron, "0 */5 * * * *");
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn test_partial_override() {
        let settings: Settings = serde_json::from_str(
            r#"{"attention": {"policy": "waking_hours", "halflife_hours": 12.0}}"#,
        )
        .unwrap();

        assert_eq!(settings.attention.policy, BudgetPolicy::WakingHours);
        assert_eq!(settings.attention.halflife_hours, 12.0);
        assert_eq!(settings.attention.hour_awake, 9);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.attention.halflife_hours = 0.0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.attention.hour_awake = 18;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.scheduler.cron = "every five minutes".to_string();
        assert!(validate_settings(&settings).is_err());
    }

    #[test]
    fn test_validation_rejects_short_leases() {
        let mut settings = Settings::default();
        settings.scheduler.delivery_timeout_seconds = 600;
        settings.scheduler.claim_lease_seconds = 0;
        assert!(matches!(validate_settings(&settings), Err(Error::Config(_))));

        let mut settings = Settings::default();
        settings.scheduler.claim_lease_seconds = settings.scheduler.handler_timeout_seconds;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.scheduler.delivery_timeout_seconds = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.scheduler.delivery_timeout_seconds = 1;
        settings.scheduler.handler_timeout_seconds = 1;
        settings.scheduler.claim_lease_seconds = 2;
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn test_validation_rejects_huge_utc_offset() {
        let mut settings = Settings::default();
        settings.attention.utc_offset_minutes = i32::MAX;
        assert!(validate_settings(&settings).is_err());

        settings.attention.utc_offset_minutes = -(23 * 60 + 59);
        assert!(validate_settings(&settings).is_ok());
    }
}
