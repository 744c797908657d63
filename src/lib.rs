//! Thread pin watcher library.
//!
//! Keeps a list of pinned discussion threads, polls the watched ones on a
//! cadence that follows the app's foreground state and settings, detects new
//! posts and replies to the user's own posts, and holds a sleep-prevention
//! resource for the duration of each background sweep.

pub mod collaborators;
pub mod config;
pub mod constants;
pub mod debounce;
pub mod events;
pub mod interval;
pub mod manager;
pub mod models;
pub mod platform;
pub mod registry;
pub mod service;
pub mod source;
pub mod store;
pub mod sweep;
pub mod watcher;

pub use manager::{SchedulerOptions, WatchManager};
pub use models::{Pin, PinId, ThreadDescriptor};
pub use service::{ServiceError, WatchHandle, WatchService};
