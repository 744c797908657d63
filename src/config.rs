use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::{
    DEFAULT_BACKGROUND_WAKE_INTERVAL, DEFAULT_FOREGROUND_INTERVAL, DEFAULT_STATE_DEBOUNCE,
};
use crate::models::ThreadDescriptor;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Which unread state keeps the watch notification alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    /// Any unread post in a watched thread.
    #[default]
    All,
    /// Only unread replies quoting the user's own posts.
    Quotes,
}

/// User-facing watch settings. These can change at runtime, so the
/// scheduler keeps its own copy and is told about every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub watch_enabled: bool,
    pub background_enabled: bool,
    pub last_page_notify: bool,
    pub notify_mode: NotifyMode,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            watch_enabled: true,
            background_enabled: false,
            last_page_notify: false,
            notify_mode: NotifyMode::All,
        }
    }
}

/// A single setting change pushed into the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingChange {
    WatchEnabled(bool),
    BackgroundEnabled(bool),
    LastPageNotify(bool),
    NotifyMode(NotifyMode),
}

impl WatchSettings {
    /// Apply a change, returning whether anything actually changed.
    pub fn apply(&mut self, change: SettingChange) -> bool {
        let before = *self;
        match change {
            SettingChange::WatchEnabled(v) => self.watch_enabled = v,
            SettingChange::BackgroundEnabled(v) => self.background_enabled = v,
            SettingChange::LastPageNotify(v) => self.last_page_notify = v,
            SettingChange::NotifyMode(v) => self.notify_mode = v,
        }
        before != *self
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Storage
    pub database_path: PathBuf,

    // Thread source
    pub thread_api_base_url: String,
    pub min_thread_poll_interval: Duration,
    pub page_cache_ttl: Duration,

    // Scheduling
    pub foreground_interval: Duration,
    pub state_debounce: Duration,
    pub background_wake_interval: Duration,
    pub start_in_foreground: bool,

    // Initial settings
    pub settings: WatchSettings,

    // Threads pinned on startup
    pub seed_pins: Vec<ThreadDescriptor>,
    // Posts the user made, as (thread, post number)
    pub saved_replies: Vec<(ThreadDescriptor, u64)>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/pins.sqlite")),

            thread_api_base_url: required_env("THREAD_API_BASE_URL")?,
            min_thread_poll_interval: Duration::from_secs(parse_env_u64(
                "MIN_THREAD_POLL_SECS",
                10,
            )?),
            page_cache_ttl: Duration::from_secs(parse_env_u64("PAGE_CACHE_TTL_SECS", 60)?),

            foreground_interval: Duration::from_secs(parse_env_u64(
                "FOREGROUND_INTERVAL_SECS",
                DEFAULT_FOREGROUND_INTERVAL.as_secs(),
            )?),
            state_debounce: Duration::from_millis(parse_env_u64(
                "STATE_DEBOUNCE_MS",
                DEFAULT_STATE_DEBOUNCE.as_millis() as u64,
            )?),
            background_wake_interval: Duration::from_secs(parse_env_u64(
                "BACKGROUND_WAKE_INTERVAL_SECS",
                DEFAULT_BACKGROUND_WAKE_INTERVAL.as_secs(),
            )?),
            start_in_foreground: parse_env_bool("START_IN_FOREGROUND", true)?,

            settings: WatchSettings {
                watch_enabled: parse_env_bool("WATCH_ENABLED", true)?,
                background_enabled: parse_env_bool("WATCH_BACKGROUND", false)?,
                last_page_notify: parse_env_bool("WATCH_LAST_PAGE_NOTIFY", false)?,
                notify_mode: parse_notify_mode(&env_or_default("WATCH_NOTIFY_MODE", "all"))?,
            },

            seed_pins: parse_seed_pins(&env_or_default("SEED_PINS", ""))?,
            saved_replies: parse_saved_replies(&env_or_default("SAVED_REPLIES", ""))?,
        })
    }

    /// Fixed configuration for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            database_path: PathBuf::from(":memory:"),
            thread_api_base_url: "http://127.0.0.1:1".to_string(),
            min_thread_poll_interval: Duration::from_secs(10),
            page_cache_ttl: Duration::from_secs(60),
            foreground_interval: DEFAULT_FOREGROUND_INTERVAL,
            state_debounce: DEFAULT_STATE_DEBOUNCE,
            background_wake_interval: DEFAULT_BACKGROUND_WAKE_INTERVAL,
            start_in_foreground: true,
            settings: WatchSettings::default(),
            seed_pins: Vec::new(),
            saved_replies: Vec::new(),
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_api_base_url.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "THREAD_API_BASE_URL".to_string(),
                message: "cannot be empty".to_string(),
            });
        }
        if url::Url::parse(&self.thread_api_base_url).is_err() {
            return Err(ConfigError::InvalidValue {
                name: "THREAD_API_BASE_URL".to_string(),
                message: format!("not a valid URL: '{}'", self.thread_api_base_url),
            });
        }
        for (name, value) in [
            ("FOREGROUND_INTERVAL_SECS", self.foreground_interval),
            ("STATE_DEBOUNCE_MS", self.state_debounce),
            ("BACKGROUND_WAKE_INTERVAL_SECS", self.background_wake_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn required_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_notify_mode(value: &str) -> Result<NotifyMode, ConfigError> {
    match value.to_lowercase().as_str() {
        "all" => Ok(NotifyMode::All),
        "quotes" => Ok(NotifyMode::Quotes),
        _ => Err(ConfigError::InvalidValue {
            name: "WATCH_NOTIFY_MODE".to_string(),
            message: format!("must be 'all' or 'quotes', got '{value}'"),
        }),
    }
}

/// Parse `site/board/thread` entries separated by commas.
fn parse_seed_pins(value: &str) -> Result<Vec<ThreadDescriptor>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            entry
                .parse::<ThreadDescriptor>()
                .map_err(|message| ConfigError::InvalidValue {
                    name: "SEED_PINS".to_string(),
                    message,
                })
        })
        .collect()
}

/// Parse `site/board/thread/post` entries separated by commas.
fn parse_saved_replies(value: &str) -> Result<Vec<(ThreadDescriptor, u64)>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        name: "SAVED_REPLIES".to_string(),
        message,
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (thread, post) = entry
                .rsplit_once('/')
                .ok_or_else(|| invalid(format!("expected site/board/thread/post, got '{entry}'")))?;
            let post_no = post
                .parse::<u64>()
                .map_err(|e| invalid(format!("bad post number in '{entry}': {e}")))?;
            let thread = thread.parse::<ThreadDescriptor>().map_err(invalid)?;
            Ok((thread, post_no))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_notify_mode() {
        assert_eq!(parse_notify_mode("all").unwrap(), NotifyMode::All);
        assert_eq!(parse_notify_mode("QUOTES").unwrap(), NotifyMode::Quotes);
        assert!(parse_notify_mode("loud").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_env_bool("NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    fn test_parse_seed_pins() {
        let pins = parse_seed_pins("4chan/g/123, 4chan/a/456,").unwrap();
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[0].board, "g");
        assert_eq!(pins[1].thread_no, 456);

        assert!(parse_seed_pins("").unwrap().is_empty());
        assert!(parse_seed_pins("4chan/g").is_err());
        assert!(parse_seed_pins("4chan/g/abc").is_err());
    }

    #[test]
    fn test_parse_saved_replies() {
        let saved = parse_saved_replies("4chan/g/123/125, 4chan/g/123/130").unwrap();
        assert_eq!(
            saved,
            vec![
                (ThreadDescriptor::new("4chan", "g", 123), 125),
                (ThreadDescriptor::new("4chan", "g", 123), 130),
            ]
        );

        assert!(parse_saved_replies("").unwrap().is_empty());
        assert!(parse_saved_replies("4chan/g/123").is_err());
        assert!(parse_saved_replies("4chan/g/123/x").is_err());
    }

    #[test]
    fn test_settings_apply_reports_change() {
        let mut settings = WatchSettings::default();
        assert!(!settings.apply(SettingChange::WatchEnabled(true)));
        assert!(settings.apply(SettingChange::BackgroundEnabled(true)));
        assert!(settings.background_enabled);
        assert!(settings.apply(SettingChange::NotifyMode(NotifyMode::Quotes)));
        assert_eq!(settings.notify_mode, NotifyMode::Quotes);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::for_testing();
        assert!(config.validate().is_ok());
        config.foreground_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
