//! Interfaces of everything the scheduler talks to but does not own.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{FetchError, Loadable, Pin, PinId, ThreadDescriptor, ThreadPage, ThreadSnapshot};

/// Fetches threads and throttles how often each one may be fetched.
#[async_trait]
pub trait ThreadDataSource: Send + Sync {
    /// Whether enough time has passed to poll this thread again.
    fn should_poll_now(&self, loadable: &Loadable) -> bool;

    /// Fetch the thread. `force` skips any throttling the source applies.
    async fn fetch(&self, loadable: &Loadable, force: bool) -> Result<ThreadSnapshot, FetchError>;
}

/// Receives out-of-band page arrivals.
pub trait PagesListener: Send + Sync {
    fn on_pages_received(&self);
}

/// Handle returned by [`PageInfoSource::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Knows which index page a thread currently sits on.
pub trait PageInfoSource: Send + Sync {
    fn get_page(&self, thread: &ThreadDescriptor) -> Option<ThreadPage>;
    fn add_listener(&self, listener: Arc<dyn PagesListener>) -> ListenerId;
    fn remove_listener(&self, id: ListenerId);
}

/// Pin persistence.
#[async_trait]
pub trait PinStore: Send + Sync {
    /// Load every stored pin.
    async fn load_all_pins(&self) -> Result<Vec<Pin>>;

    /// Persist the full pin list. Fire-and-forget: must not block the caller.
    fn save_pins(&self, pins: Vec<Pin>);
}

/// Keeps the device from suspending while held.
pub trait SleepPrevention: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self) -> Result<()>;
}

/// Something the wake scheduler can wake up.
pub trait Wakeable: Send + Sync {
    fn on_wake(&self);
}

/// Coarse, externally timed wake-ups for background polling.
pub trait WakeScheduler: Send + Sync {
    fn register_wakeable(&self, wakeable: Arc<dyn Wakeable>);
    fn unregister_wakeable(&self, wakeable: &Arc<dyn Wakeable>);
}

/// The persistent "watching threads" notification.
pub trait NotificationPresence: Send + Sync {
    fn start(&self);
    fn stop(&self);
}

/// The per-pin "thread reached the last page" notification.
pub trait LastPageNotifier: Send + Sync {
    fn notify(&self, pin: PinId);
    fn cancel(&self, pin: PinId);
}

/// Everything the scheduler needs from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub threads: Arc<dyn ThreadDataSource>,
    pub pages: Arc<dyn PageInfoSource>,
    pub store: Arc<dyn PinStore>,
    pub sleep: Arc<dyn SleepPrevention>,
    pub wake: Arc<dyn WakeScheduler>,
    pub presence: Arc<dyn NotificationPresence>,
    pub last_page: Arc<dyn LastPageNotifier>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
