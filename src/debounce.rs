//! Trailing-edge debouncing of scheduler state updates.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Delivers a value into a channel after a fixed delay, cancelling whatever
/// was still waiting. Only the last value of a burst is delivered.
///
/// A value already sent cannot be recalled. Receivers that must not act on
/// it once a newer value is posted tag their values, as `StateUpdate` does.
#[derive(Debug)]
pub struct Debouncer<T> {
    delay: Duration,
    tx: mpsc::UnboundedSender<T>,
    pending: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Debouncer<T> {
    #[must_use]
    pub fn new(delay: Duration, tx: mpsc::UnboundedSender<T>) -> Self {
        Self {
            delay,
            tx,
            pending: None,
        }
    }

    /// Schedule `value`, replacing any job that has not fired yet.
    ///
    /// Must be called from within a tokio runtime.
    pub fn post(&mut self, value: T) {
        if self.cancel() {
            trace!("Replaced pending debounced job");
        }
        let tx = self.tx.clone();
        let delay = self.delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the scheduler is shutting down
            let _ = tx.send(value);
        }));
    }

    /// Cancel the pending job. Returns whether one was still waiting.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl<T> Drop for Debouncer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_delivers_last_value_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(Duration::from_millis(1000), tx);

        for i in 0..10 {
            debouncer.post(i);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(rx.try_recv().unwrap(), 9);
        assert!(rx.try_recv().is_err());
        assert!(!debouncer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_deliver_separately() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(Duration::from_millis(1000), tx);

        debouncer.post("first");
        tokio::time::sleep(Duration::from_millis(1500)).await;
        debouncer.post("second");
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(rx.try_recv().unwrap(), "first");
        assert_eq!(rx.try_recv().unwrap(), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_drops_pending_value() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut debouncer = Debouncer::new(Duration::from_millis(1000), tx);

        debouncer.post(1);
        assert!(debouncer.is_pending());
        assert!(debouncer.cancel());
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(rx.try_recv().is_err());
    }
}
