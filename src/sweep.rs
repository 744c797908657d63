//! Sleep-prevention bookkeeping for background sweeps.
//!
//! A sweep is one batch of fetches started by a background wake-up. The
//! device must stay awake until every fetch of the batch has completed, so
//! each dispatched fetch gets a ticket that is parked in the sweep's wait set
//! until its completion is reported. Completions arrive on arbitrary worker
//! tasks; all wait-set access goes through one mutex.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::collaborators::SleepPrevention;

/// Identifies one dispatched fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket(u64);

/// Fetches of the current sweep that have not completed yet.
#[derive(Debug)]
pub struct SweepWaitSet {
    pending: HashSet<FetchTicket>,
    started_at: DateTime<Utc>,
}

impl SweepWaitSet {
    fn new() -> Self {
        Self {
            pending: HashSet::new(),
            started_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
struct SweepState {
    current: Option<SweepWaitSet>,
    /// Dispatch of the current sweep is still running.
    dispatching: bool,
    /// The sleep-prevention resource is held.
    held: bool,
}

pub struct SweepTracker {
    state: Mutex<SweepState>,
    next_ticket: AtomicU64,
    sleep: Arc<dyn SleepPrevention>,
}

impl std::fmt::Debug for SweepTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepTracker")
            .field("state", &*self.lock())
            .finish_non_exhaustive()
    }
}

impl SweepTracker {
    #[must_use]
    pub fn new(sleep: Arc<dyn SleepPrevention>) -> Self {
        Self {
            state: Mutex::new(SweepState::default()),
            next_ticket: AtomicU64::new(1),
            sleep,
        }
    }

    /// Ticket for a fetch, tracked or not.
    pub fn issue_ticket(&self) -> FetchTicket {
        FetchTicket(self.next_ticket.fetch_add(1, Ordering::Relaxed))
    }

    /// Start dispatching a background sweep.
    ///
    /// If fetches of a previous sweep are still outstanding their wait set is
    /// kept and the new fetches join it, so the resource is held only once.
    pub fn begin_sweep(&self) {
        let mut state = self.lock();
        match &state.current {
            Some(set) if !set.is_empty() => {
                debug!(outstanding = set.len(), "Previous sweep still running, merging");
            }
            _ => state.current = Some(SweepWaitSet::new()),
        }
        state.dispatching = true;
    }

    /// Park a ticket in the current sweep before its fetch starts.
    ///
    /// The resource is acquired with the first ticket of a sweep, so it is
    /// never held by a sweep that starts no fetches.
    pub fn track(&self, ticket: FetchTicket) {
        let mut state = self.lock();
        let Some(set) = state.current.as_mut() else {
            return;
        };
        set.pending.insert(ticket);
        if !state.held {
            if let Err(e) = self.sleep.acquire() {
                warn!("Failed to acquire sleep prevention: {e:#}");
            }
            state.held = true;
        }
    }

    /// All fetches of the sweep have been dispatched. Returns how many are
    /// still outstanding.
    pub fn finish_dispatch(&self) -> usize {
        let mut state = self.lock();
        state.dispatching = false;
        let Some(set) = state.current.as_ref() else {
            return 0;
        };
        let outstanding = set.len();
        if outstanding == 0 {
            self.close(&mut state);
        } else {
            info!(
                watchers = outstanding,
                started_at = %set.started_at.to_rfc3339(),
                "Background sweep started"
            );
        }
        outstanding
    }

    /// Report a finished fetch, successful or not.
    pub fn complete(&self, ticket: FetchTicket) {
        let mut state = self.lock();
        let Some(set) = state.current.as_mut() else {
            return;
        };
        if !set.pending.remove(&ticket) {
            return;
        }
        if set.is_empty() && !state.dispatching {
            self.close(&mut state);
        }
    }

    /// Number of tracked fetches still outstanding, if a sweep is running.
    #[must_use]
    pub fn outstanding(&self) -> Option<usize> {
        self.lock().current.as_ref().map(SweepWaitSet::len)
    }

    #[must_use]
    pub fn is_holding(&self) -> bool {
        self.lock().held
    }

    fn close(&self, state: &mut SweepState) {
        if let Some(set) = state.current.take() {
            if state.held {
                info!(
                    started_at = %set.started_at.to_rfc3339(),
                    finished_at = %Utc::now().to_rfc3339(),
                    "All watchers updated"
                );
            }
        }
        if state.held {
            if let Err(e) = self.sleep.release() {
                warn!("Failed to release sleep prevention: {e:#}");
            }
            state.held = false;
        }
    }

    fn lock(&self) -> MutexGuard<'_, SweepState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
