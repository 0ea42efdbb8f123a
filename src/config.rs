use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::FixedOffset;

use crate::catalog::OpeningSchedule;

/// Hard limits the engine enforces regardless of configuration.
pub mod limits {
    use std::time::Duration;

    /// Candidates per race: two start times by two courts.
    pub const MAX_CANDIDATES: usize = 4;
    /// Latest stagger delay any candidate may receive.
    pub const MAX_STAGGER_SPREAD: Duration = Duration::from_secs(2);
    /// Beyond this after the opening instant, slots are gone.
    pub const OPPORTUNITY_WINDOW: Duration = Duration::from_secs(15);
    pub const MAX_REQUESTS_PER_ACCOUNT: usize = 64;
    pub const MAX_ACCOUNT_NAME_LEN: usize = 64;
    /// How many times the trigger re-reads a failing store before giving up for the day.
    pub const MAX_STORE_RETRIES: u32 = 5;
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, reason: String },
    Catalog(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Invalid { var, reason } => write!(f, "invalid {var}: {reason}"),
            ConfigError::Catalog(e) => write!(f, "court catalog: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub schedule: OpeningSchedule,
    /// Attempts of one request in flight at once. Every candidate is still tried.
    pub max_attempts_per_request: usize,
    pub max_concurrent_accounts: usize,
    pub session_ttl: Duration,
    pub compact_threshold: u64,
    pub catalog_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            schedule: OpeningSchedule::default(),
            max_attempts_per_request: 4,
            max_concurrent_accounts: 6,
            session_ttl: Duration::from_secs(4 * 24 * 3600),
            compact_threshold: 1000,
            catalog_path: None,
            metrics_port: None,
        }
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

fn slot_from_minutes(minutes: i64) -> Result<chrono::Duration, ConfigError> {
    chrono::Duration::try_minutes(minutes).ok_or(ConfigError::Invalid {
        var: "COURTBOT_SLOT_MINUTES",
        reason: format!("{minutes} is out of range"),
    })
}

fn ttl_from_hours(hours: u64) -> Result<Duration, ConfigError> {
    hours
        .checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or(ConfigError::Invalid {
            var: "COURTBOT_SESSION_TTL_HOURS",
            reason: format!("{hours} is out of range"),
        })
}

impl Config {
    /// Read `COURTBOT_*` variables; unset or unparsable values fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let mut schedule = defaults.schedule.clone();

        if let Some(hour) = env_parse::<u32>("COURTBOT_OPENING_HOUR") {
            schedule.opening_hour = hour;
        }
        if let Some(minutes) = env_parse::<i32>("COURTBOT_UTC_OFFSET_MINUTES") {
            schedule.zone = FixedOffset::east_opt(minutes * 60).ok_or(ConfigError::Invalid {
                var: "COURTBOT_UTC_OFFSET_MINUTES",
                reason: format!("{minutes} is out of range"),
            })?;
        }
        if let Some(secs) = env_parse::<u64>("COURTBOT_SAFETY_MARGIN_SECS") {
            schedule.safety_margin = Duration::from_secs(secs);
        }
        if let Some(days) = env_parse::<i64>("COURTBOT_HORIZON_DAYS") {
            schedule.horizon_days = days;
        }
        if let Some(minutes) = env_parse::<i64>("COURTBOT_SLOT_MINUTES") {
            schedule.slot = slot_from_minutes(minutes)?;
        }
        let session_ttl = match env_parse::<u64>("COURTBOT_SESSION_TTL_HOURS") {
            Some(hours) => ttl_from_hours(hours)?,
            None => defaults.session_ttl,
        };

        let config = Self {
            data_dir: std::env::var("COURTBOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            schedule,
            max_attempts_per_request: env_parse("COURTBOT_MAX_ATTEMPTS_PER_REQUEST")
                .unwrap_or(defaults.max_attempts_per_request),
            max_concurrent_accounts: env_parse("COURTBOT_MAX_CONCURRENT_ACCOUNTS")
                .unwrap_or(defaults.max_concurrent_accounts),
            session_ttl,
            compact_threshold: env_parse("COURTBOT_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            catalog_path: std::env::var("COURTBOT_CATALOG").ok().map(PathBuf::from),
            metrics_port: env_parse("COURTBOT_METRICS_PORT"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.schedule.validate()?;
        if self.max_attempts_per_request == 0 {
            return Err(ConfigError::Invalid {
                var: "COURTBOT_MAX_ATTEMPTS_PER_REQUEST",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_concurrent_accounts == 0 {
            return Err(ConfigError::Invalid {
                var: "COURTBOT_MAX_CONCURRENT_ACCOUNTS",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("requests.wal")
    }
}
