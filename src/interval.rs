//! Polling cadence state machine.
//!
//! The decision of which cadence to use and which triggers to touch is a pair
//! of pure functions ([`desired_state`], [`plan_transition`]); the
//! [`IntervalScheduler`] only carries out the resulting plan.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::collaborators::{WakeScheduler, Wakeable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntervalState {
    /// Nothing armed.
    #[default]
    None,
    /// Fixed-period timer while the app is visible.
    Foreground,
    /// Coarse wake-ups from the platform wake scheduler.
    Background,
}

impl fmt::Display for IntervalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Foreground => "foreground",
            Self::Background => "background",
        };
        f.write_str(name)
    }
}

/// Snapshot of everything the cadence depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingInputs {
    pub watch_enabled: bool,
    pub background_enabled: bool,
    pub app_in_foreground: bool,
    pub has_active_pins: bool,
}

#[must_use]
pub fn desired_state(inputs: &SchedulingInputs) -> IntervalState {
    if !inputs.watch_enabled {
        IntervalState::None
    } else if inputs.app_in_foreground {
        IntervalState::Foreground
    } else if inputs.background_enabled {
        IntervalState::Background
    } else {
        IntervalState::None
    }
}

/// Side effects needed to move from one state to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionPlan {
    pub cancel_foreground: bool,
    pub unregister_background: bool,
    pub arm_foreground: bool,
    pub register_background: bool,
    pub next: IntervalState,
}

impl TransitionPlan {
    const fn stay(state: IntervalState) -> Self {
        Self {
            cancel_foreground: false,
            unregister_background: false,
            arm_foreground: false,
            register_background: false,
            next: state,
        }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        !(self.cancel_foreground
            || self.unregister_background
            || self.arm_foreground
            || self.register_background)
    }
}

/// Work out the transition from `current` for the given inputs.
///
/// With no active pins every trigger belonging to `current` is torn down and
/// the state drops to `None`, so that adding a pin later re-arms a trigger.
#[must_use]
pub fn plan_transition(current: IntervalState, inputs: &SchedulingInputs) -> TransitionPlan {
    let mut plan = TransitionPlan::stay(current);

    if !inputs.has_active_pins {
        match current {
            IntervalState::Foreground => plan.cancel_foreground = true,
            IntervalState::Background => plan.unregister_background = true,
            IntervalState::None => {
                plan.cancel_foreground = true;
                plan.unregister_background = true;
            }
        }
        plan.next = IntervalState::None;
        return plan;
    }

    let desired = desired_state(inputs);
    if desired == current {
        return plan;
    }

    match current {
        IntervalState::Foreground => plan.cancel_foreground = true,
        IntervalState::Background => plan.unregister_background = true,
        IntervalState::None => {}
    }
    match desired {
        IntervalState::Foreground => plan.arm_foreground = true,
        IntervalState::Background => plan.register_background = true,
        IntervalState::None => {
            plan.cancel_foreground = true;
            plan.unregister_background = true;
        }
    }
    plan.next = desired;
    plan
}

/// One-shot timer that sends a tick after `period`. The receiver re-arms it
/// after handling each tick.
#[derive(Debug)]
pub struct ForegroundTimer<T> {
    period: Duration,
    tx: mpsc::UnboundedSender<T>,
    make_tick: fn() -> T,
    pending: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> ForegroundTimer<T> {
    #[must_use]
    pub fn new(period: Duration, tx: mpsc::UnboundedSender<T>, make_tick: fn() -> T) -> Self {
        Self {
            period,
            tx,
            make_tick,
            pending: None,
        }
    }

    pub fn arm(&mut self) {
        self.cancel();
        let tx = self.tx.clone();
        let period = self.period;
        let tick = self.make_tick;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(period).await;
            let _ = tx.send(tick());
        }));
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.pending.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl<T> Drop for ForegroundTimer<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }
}

/// Holds the current cadence and installs or removes its triggers.
pub struct IntervalScheduler<T> {
    current: IntervalState,
    foreground: ForegroundTimer<T>,
    wake: Arc<dyn WakeScheduler>,
    wakeable: Arc<dyn Wakeable>,
}

impl<T> fmt::Debug for IntervalScheduler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalScheduler")
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> IntervalScheduler<T> {
    #[must_use]
    pub fn new(
        foreground: ForegroundTimer<T>,
        wake: Arc<dyn WakeScheduler>,
        wakeable: Arc<dyn Wakeable>,
    ) -> Self {
        Self {
            current: IntervalState::None,
            foreground,
            wake,
            wakeable,
        }
    }

    #[must_use]
    pub fn current(&self) -> IntervalState {
        self.current
    }

    #[must_use]
    pub fn foreground_armed(&self) -> bool {
        self.foreground.is_armed()
    }

    /// Recompute the cadence and apply the resulting plan.
    pub fn apply(&mut self, inputs: &SchedulingInputs) -> TransitionPlan {
        let plan = plan_transition(self.current, inputs);

        if !inputs.has_active_pins {
            debug!(state = %self.current, "No active pins, removing all triggers");
        } else if plan.next != self.current {
            info!(from = %self.current, to = %plan.next, "Changing polling interval");
        }

        if plan.cancel_foreground {
            self.foreground.cancel();
        }
        if plan.unregister_background {
            self.wake.unregister_wakeable(&self.wakeable);
        }
        if plan.arm_foreground {
            self.foreground.arm();
        }
        if plan.register_background {
            self.wake.register_wakeable(Arc::clone(&self.wakeable));
        }
        self.current = plan.next;
        plan
    }

    /// Called after the foreground timer fired. Keeps the cadence constant
    /// for as long as the state stays `Foreground`.
    ///
    /// Returns `false` for a tick that was already queued when the timer was
    /// torn down; such a tick must not poll.
    pub fn on_foreground_tick(&mut self) -> bool {
        if self.current != IntervalState::Foreground {
            return false;
        }
        self.foreground.arm();
        true
    }

    /// Remove every trigger, e.g. on shutdown.
    pub fn stop(&mut self) {
        self.foreground.cancel();
        self.wake.unregister_wakeable(&self.wakeable);
        self.current = IntervalState::None;
    }
}
