//! Shared constants used across the application.

use std::time::Duration;

/// Delay before a burst of state update requests is acted on.
pub const DEFAULT_STATE_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Period of the foreground polling timer.
pub const DEFAULT_FOREGROUND_INTERVAL: Duration = Duration::from_secs(30);

/// Cadence of the host wake scheduler used when no platform scheduler exists.
pub const DEFAULT_BACKGROUND_WAKE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Sentinel for pin counters that have never been loaded.
pub const NEVER_LOADED: i32 = -1;

/// User agent string for thread API requests.
pub const WATCHER_USER_AGENT: &str = "thread-pin-watcher/0.1";
