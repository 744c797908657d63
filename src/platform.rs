//! Host stand-ins for the platform services the scheduler expects.
//!
//! A server process has no OS wake scheduler, wake lock or notification
//! shade. These implementations drive background polling from a plain tokio
//! interval and report everything else through `tracing`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collaborators::{
    LastPageNotifier, NotificationPresence, SleepPrevention, WakeScheduler, Wakeable,
};
use crate::models::PinId;

/// Wakes every registered wakeable on a fixed cadence.
#[derive(Clone)]
pub struct IntervalWakeScheduler {
    wakeables: Arc<Mutex<Vec<Arc<dyn Wakeable>>>>,
}

impl std::fmt::Debug for IntervalWakeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalWakeScheduler")
            .field("registered", &self.registered())
            .finish()
    }
}

impl Default for IntervalWakeScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl IntervalWakeScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            wakeables: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn registered(&self) -> usize {
        self.lock().len()
    }

    /// Wake everything registered right now.
    pub fn wake_all(&self) {
        let wakeables: Vec<Arc<dyn Wakeable>> = self.lock().clone();
        if wakeables.is_empty() {
            return;
        }
        debug!(count = wakeables.len(), "Background wake-up");
        for wakeable in wakeables {
            wakeable.on_wake();
        }
    }

    /// Run the wake loop until `shutdown` is cancelled.
    pub async fn run(self, period: Duration, shutdown: CancellationToken) {
        info!(interval_secs = period.as_secs(), "Starting wake scheduler");

        let mut interval = tokio::time::interval(period);
        interval.tick().await; // The first tick completes immediately

        loop {
            tokio::select! {
                _ = interval.tick() => self.wake_all(),
                () = shutdown.cancelled() => {
                    info!("Wake scheduler shutting down");
                    break;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<dyn Wakeable>>> {
        self.wakeables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WakeScheduler for IntervalWakeScheduler {
    fn register_wakeable(&self, wakeable: Arc<dyn Wakeable>) {
        let mut wakeables = self.lock();
        if !wakeables.iter().any(|w| Arc::ptr_eq(w, &wakeable)) {
            wakeables.push(wakeable);
        }
    }

    fn unregister_wakeable(&self, wakeable: &Arc<dyn Wakeable>) {
        self.lock().retain(|w| !Arc::ptr_eq(w, wakeable));
    }
}

/// Counts acquisitions instead of holding a real wake lock.
#[derive(Debug, Default)]
pub struct LoggingSleepGuard {
    held: AtomicUsize,
}

impl LoggingSleepGuard {
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }
}

impl SleepPrevention for LoggingSleepGuard {
    fn acquire(&self) -> Result<()> {
        let held = self.held.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(held, "Sleep prevention acquired");
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let released = self
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if released.is_err() {
            anyhow::bail!("sleep prevention released without being held");
        }
        debug!(held = self.held(), "Sleep prevention released");
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LoggingNotifier {
    showing: AtomicBool,
}

impl LoggingNotifier {
    #[must_use]
    pub fn is_showing(&self) -> bool {
        self.showing.load(Ordering::SeqCst)
    }
}

impl NotificationPresence for LoggingNotifier {
    fn start(&self) {
        self.showing.store(true, Ordering::SeqCst);
        info!("Unread posts in watched threads");
    }

    fn stop(&self) {
        self.showing.store(false, Ordering::SeqCst);
        debug!("Watch notification cleared");
    }
}

impl LastPageNotifier for LoggingNotifier {
    fn notify(&self, pin: PinId) {
        info!(pin_id = %pin, "Thread reached the last page");
    }

    fn cancel(&self, pin: PinId) {
        debug!(pin_id = %pin, "Thread left the last page");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingWakeable(AtomicUsize);

    impl Wakeable for CountingWakeable {
        fn on_wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_wakes_registered_until_cancelled() {
        let scheduler = IntervalWakeScheduler::new();
        let counter = Arc::new(CountingWakeable::default());
        let wakeable: Arc<dyn Wakeable> = counter.clone();
        scheduler.register_wakeable(Arc::clone(&wakeable));
        scheduler.register_wakeable(Arc::clone(&wakeable));
        assert_eq!(scheduler.registered(), 1);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(scheduler.clone().run(Duration::from_secs(60), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        scheduler.unregister_wakeable(&wakeable);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_sleep_guard_rejects_unbalanced_release() {
        let guard = LoggingSleepGuard::default();
        assert!(guard.release().is_err());
        guard.acquire().unwrap();
        assert_eq!(guard.held(), 1);
        guard.release().unwrap();
        assert_eq!(guard.held(), 0);
    }
}
