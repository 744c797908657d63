//! The scheduler core.
//!
//! `WatchManager` owns the pins, their watchers and the polling cadence. It
//! runs on the single scheduling task (see [`crate::service`]); every method
//! takes `&mut self` and nothing in here blocks. Fetches run on spawned tasks
//! and report back through the command channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::collaborators::{Collaborators, ListenerId, PagesListener, ThreadDataSource, Wakeable};
use crate::config::{Config, SettingChange, WatchSettings};
use crate::constants::{DEFAULT_FOREGROUND_INTERVAL, DEFAULT_STATE_DEBOUNCE};
use crate::debounce::Debouncer;
use crate::events::EventBus;
use crate::interval::{ForegroundTimer, IntervalScheduler, IntervalState, SchedulingInputs};
use crate::models::{FetchError, Loadable, Pin, PinId, ThreadDescriptor, ThreadSnapshot};
use crate::registry::PinRegistry;
use crate::service::Command;
use crate::sweep::SweepTracker;
use crate::watcher::{FetchDispatch, PollContext, ThreadWatcher};

/// Tunables for the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub foreground_interval: Duration,
    pub state_debounce: Duration,
    pub settings: WatchSettings,
    pub start_in_foreground: bool,
}

impl SchedulerOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            foreground_interval: config.foreground_interval,
            state_debounce: config.state_debounce,
            settings: config.settings,
            start_in_foreground: config.start_in_foreground,
        }
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            foreground_interval: DEFAULT_FOREGROUND_INTERVAL,
            state_debounce: DEFAULT_STATE_DEBOUNCE,
            settings: WatchSettings::default(),
            start_in_foreground: true,
        }
    }
}

/// Settings snapshot carried by a debounced state update. The last request
/// of a burst wins.
///
/// `generation` identifies the request. An update that was already delivered
/// when a newer request was made is stale and gets dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    pub watch_enabled: bool,
    pub background_enabled: bool,
    pub generation: u64,
}

/// Consume-once "something new arrived" flags of a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewFlags {
    pub posts: bool,
    pub quotes: bool,
}

struct ChannelWakeable {
    commands: mpsc::UnboundedSender<Command>,
}

impl Wakeable for ChannelWakeable {
    fn on_wake(&self) {
        if self.commands.send(Command::Wake).is_err() {
            debug!("Wake-up after scheduler shut down");
        }
    }
}

struct ChannelPagesListener {
    commands: mpsc::UnboundedSender<Command>,
}

impl PagesListener for ChannelPagesListener {
    fn on_pages_received(&self) {
        let _ = self.commands.send(Command::PagesReceived);
    }
}

/// Spawns fetches and routes their results back to the scheduler.
struct TaskDispatcher<'a> {
    threads: &'a Arc<dyn ThreadDataSource>,
    sweeps: &'a Arc<SweepTracker>,
    commands: &'a mpsc::UnboundedSender<Command>,
    track: bool,
}

impl FetchDispatch for TaskDispatcher<'_> {
    fn dispatch(&self, pin: PinId, loadable: &Loadable, force: bool) {
        let ticket = self.sweeps.issue_ticket();
        if self.track {
            self.sweeps.track(ticket);
        }
        let threads = Arc::clone(self.threads);
        let sweeps = Arc::clone(self.sweeps);
        let commands = self.commands.clone();
        let loadable = loadable.clone();
        tokio::spawn(async move {
            let result = threads.fetch(&loadable, force).await;
            sweeps.complete(ticket);
            if commands
                .send(Command::FetchCompleted { pin, result })
                .is_err()
            {
                debug!(pin_id = %pin, "Scheduler gone, dropping fetch result");
            }
        });
    }
}

pub struct WatchManager {
    registry: PinRegistry,
    watchers: HashMap<PinId, ThreadWatcher>,
    scheduler: IntervalScheduler<Command>,
    sweeps: Arc<SweepTracker>,
    state_updates: Debouncer<Command>,
    state_generation: u64,
    collab: Collaborators,
    settings: WatchSettings,
    in_foreground: bool,
    presence: Option<bool>,
    commands: mpsc::UnboundedSender<Command>,
    page_listener: Option<ListenerId>,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager")
            .field("pins", &self.registry.len())
            .field("watchers", &self.watchers.len())
            .field("state", &self.scheduler.current())
            .field("settings", &self.settings)
            .field("in_foreground", &self.in_foreground)
            .finish_non_exhaustive()
    }
}

impl WatchManager {
    /// Build the manager around already loaded pins.
    ///
    /// Must be called from within a tokio runtime. Commands produced by
    /// timers, wake-ups and fetches are sent to `commands`.
    #[must_use]
    pub fn new(
        options: SchedulerOptions,
        collab: Collaborators,
        pins: Vec<Pin>,
        events: EventBus,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        let registry = PinRegistry::from_loaded(pins, Arc::clone(&collab.store), events);
        let wakeable: Arc<dyn Wakeable> = Arc::new(ChannelWakeable {
            commands: commands.clone(),
        });
        let timer = ForegroundTimer::new(options.foreground_interval, commands.clone(), || {
            Command::ForegroundTick
        });
        let scheduler = IntervalScheduler::new(timer, Arc::clone(&collab.wake), wakeable);
        let page_listener = collab.pages.add_listener(Arc::new(ChannelPagesListener {
            commands: commands.clone(),
        }));

        info!(pins = registry.len(), "Watch manager ready");

        let mut manager = Self {
            registry,
            watchers: HashMap::new(),
            scheduler,
            sweeps: Arc::new(SweepTracker::new(Arc::clone(&collab.sleep))),
            state_updates: Debouncer::new(options.state_debounce, commands.clone()),
            state_generation: 0,
            collab,
            settings: options.settings,
            in_foreground: options.start_in_foreground,
            presence: None,
            commands,
            page_listener: Some(page_listener),
        };
        manager.request_state_update();
        manager
    }

    // Pins

    /// Pin a thread. Returns `false` if it is already pinned.
    pub fn create_pin(&mut self, pin: Pin) -> bool {
        let created = self.registry.create(pin);
        if created {
            self.request_state_update();
        }
        created
    }

    pub fn pin_thread(&mut self, thread: ThreadDescriptor) -> bool {
        self.create_pin(Pin::new(Loadable::new(0, thread)))
    }

    pub fn delete_pin(&mut self, id: PinId) -> Option<Pin> {
        let removed = self.registry.delete(id)?;
        self.destroy_watcher(id);
        self.request_state_update();
        Some(removed)
    }

    pub fn delete_pins(&mut self, ids: &[PinId]) -> Vec<Pin> {
        let removed = self.registry.delete_many(ids);
        for pin in &removed {
            self.destroy_watcher(pin.id);
        }
        self.request_state_update();
        removed
    }

    pub fn update_pin(&mut self, pin: Pin) -> PinId {
        let id = self.registry.update(pin);
        self.request_state_update();
        id
    }

    pub fn update_pins(&mut self, pins: Vec<Pin>) -> Vec<PinId> {
        let ids = self.registry.update_many(pins);
        self.request_state_update();
        ids
    }

    pub fn move_pin(&mut self, id: PinId, to: usize) -> bool {
        self.registry.move_pin(id, to)
    }

    /// Flip `watching` on a pin that is still alive.
    pub fn toggle_watch(&mut self, id: PinId) -> bool {
        let Some(pin) = self.registry.get_mut(id) else {
            return false;
        };
        if !pin.is_active() {
            return false;
        }
        pin.watching = !pin.watching;
        self.registry.persist();
        self.request_state_update();
        self.registry.publish_changed(id);
        true
    }

    /// The user has scrolled to the bottom of the thread.
    pub fn mark_viewed(&mut self, id: PinId) -> bool {
        let Some(pin) = self.registry.get_mut(id) else {
            return false;
        };
        if pin.watch_new_count >= 0 {
            pin.watch_last_count = pin.watch_new_count;
        }
        if pin.quote_new_count >= 0 {
            pin.quote_last_count = pin.quote_new_count;
        }
        if let Some(watcher) = self.watchers.get_mut(&id) {
            watcher.clear_new_flags();
        }
        self.registry.persist();
        self.request_state_update();
        self.registry.publish_changed(id);
        true
    }

    /// Stop watching everything that is currently watched.
    pub fn pause_all(&mut self) {
        let ids: Vec<PinId> = self
            .registry
            .watching_pins(self.settings.watch_enabled)
            .iter()
            .map(|p| p.id)
            .collect();
        for id in &ids {
            if let Some(pin) = self.registry.get_mut(*id) {
                pin.watching = false;
            }
        }
        info!(paused = ids.len(), "Paused all watched threads");
        self.request_state_update();
        self.registry.persist();
        self.registry.publish_all_changed();
    }

    /// Remove all pins, or only the ones not worth keeping: dead threads and,
    /// while watching is on, threads that are not watched.
    ///
    /// Returns the removed pins so they can be restored with [`Self::add_all`].
    pub fn clear_pins(&mut self, all: bool) -> Vec<Pin> {
        let watch_enabled = self.settings.watch_enabled;
        let ids: Vec<PinId> = self
            .registry
            .iter()
            .filter(|p| all || !p.is_active() || (watch_enabled && !p.watching))
            .map(|p| p.id)
            .collect();
        self.delete_pins(&ids)
    }

    pub fn add_all(&mut self, pins: Vec<Pin>) -> usize {
        let added = self.registry.add_all(pins);
        self.request_state_update();
        added
    }

    // Environment

    pub fn set_foreground(&mut self, in_foreground: bool) {
        if self.in_foreground == in_foreground {
            return;
        }
        debug!(in_foreground, "App foreground state changed");
        self.in_foreground = in_foreground;
        self.request_state_update();
        if !in_foreground {
            self.registry.persist();
        }
    }

    pub fn change_setting(&mut self, change: SettingChange) {
        if !self.settings.apply(change) {
            return;
        }
        info!(?change, "Watch setting changed");
        self.request_state_update();
        self.registry.publish_all_changed();
    }

    // Scheduling

    /// Queue a state recomputation with the current settings.
    pub fn request_state_update(&mut self) {
        self.state_generation += 1;
        self.state_updates.post(Command::UpdateState(StateUpdate {
            watch_enabled: self.settings.watch_enabled,
            background_enabled: self.settings.background_enabled,
            generation: self.state_generation,
        }));
    }

    /// Recompute the cadence, the watcher set and the notification presence.
    ///
    /// Returns `false` if `update` was superseded by a later request.
    pub fn update_state(&mut self, update: StateUpdate) -> bool {
        if update.generation != self.state_generation {
            trace!(
                generation = update.generation,
                latest = self.state_generation,
                "Dropping superseded state update"
            );
            return false;
        }
        debug!(
            watch_enabled = update.watch_enabled,
            background_enabled = update.background_enabled,
            foreground = self.in_foreground,
            "Updating watch state"
        );

        let inputs = SchedulingInputs {
            watch_enabled: update.watch_enabled,
            background_enabled: update.background_enabled,
            app_in_foreground: self.in_foreground,
            has_active_pins: self.registry.has_active_pins(),
        };
        self.scheduler.apply(&inputs);

        self.sync_watchers(update.watch_enabled);

        let show = update.watch_enabled
            && update.background_enabled
            && self.has_unread_among_watching();
        self.set_presence(show);
        true
    }

    pub fn on_foreground_tick(&mut self) {
        if !self.scheduler.on_foreground_tick() {
            debug!(state = %self.scheduler.current(), "Ignoring stale foreground tick");
            return;
        }
        self.poll(false);
    }

    pub fn on_wake(&mut self) {
        if self.scheduler.current() != IntervalState::Background {
            debug!(state = %self.scheduler.current(), "Ignoring stale background wake-up");
            return;
        }
        self.poll(true);
    }

    /// Poll every watched pin. Background polls form a sweep that holds the
    /// sleep-prevention resource until all of its fetches have completed.
    pub fn poll(&mut self, from_background: bool) {
        debug!(from_background, "Polling watched threads");
        if from_background {
            self.sweeps.begin_sweep();
        }

        let ids: Vec<PinId> = self
            .registry
            .watching_pins(self.settings.watch_enabled)
            .iter()
            .map(|p| p.id)
            .collect();
        let ctx = PollContext {
            settings: &self.settings,
            pages: self.collab.pages.as_ref(),
            threads: self.collab.threads.as_ref(),
            last_page: self.collab.last_page.as_ref(),
        };
        let dispatcher = TaskDispatcher {
            threads: &self.collab.threads,
            sweeps: &self.sweeps,
            commands: &self.commands,
            track: from_background,
        };

        for id in ids {
            let (Some(watcher), Some(pin)) = (self.watchers.get_mut(&id), self.registry.find_by_id(id))
            else {
                continue;
            };
            if watcher.poll(pin, from_background, &ctx, &dispatcher) && from_background {
                self.registry.publish_changed(id);
            }
        }

        if from_background {
            self.sweeps.finish_dispatch();
        }
    }

    /// A fetch finished; fold the result into the pin and its watcher.
    pub fn on_fetch_completed(&mut self, id: PinId, result: Result<ThreadSnapshot, FetchError>) {
        let Some(pin) = self.registry.get_mut(id) else {
            debug!(pin_id = %id, "Fetch finished for a removed pin");
            self.request_state_update();
            return;
        };
        match result {
            Ok(snapshot) => match self.watchers.get_mut(&id) {
                Some(watcher) => watcher.apply_snapshot(pin, snapshot),
                None => debug!(pin_id = %id, "Fetch finished after watcher was destroyed"),
            },
            Err(error) => ThreadWatcher::apply_error(pin, &error),
        }
        self.registry.persist();
        self.request_state_update();
        self.registry.publish_changed(id);
    }

    pub fn on_pages_received(&mut self) {
        let ctx = PollContext {
            settings: &self.settings,
            pages: self.collab.pages.as_ref(),
            threads: self.collab.threads.as_ref(),
            last_page: self.collab.last_page.as_ref(),
        };
        for (id, watcher) in &mut self.watchers {
            if let Some(pin) = self.registry.find_by_id(*id) {
                watcher.on_pages_received(pin, &ctx);
            }
        }
    }

    /// Tear down every trigger and save the pins.
    pub fn shutdown(&mut self) {
        self.state_updates.cancel();
        self.scheduler.stop();
        if let Some(listener) = self.page_listener.take() {
            self.collab.pages.remove_listener(listener);
        }
        self.registry.persist();
        info!("Watch manager stopped");
    }

    // Queries

    #[must_use]
    pub fn all_pins(&self) -> Vec<Pin> {
        self.registry.all()
    }

    #[must_use]
    pub fn watching_pins(&self) -> Vec<Pin> {
        self.registry
            .watching_pins(self.settings.watch_enabled)
            .into_iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn find_by_id(&self, id: PinId) -> Option<&Pin> {
        self.registry.find_by_id(id)
    }

    #[must_use]
    pub fn find_by_loadable_id(&self, loadable_id: i64) -> Option<&Pin> {
        self.registry.find_by_loadable_id(loadable_id)
    }

    #[must_use]
    pub fn find_by_thread(&self, thread: &ThreadDescriptor) -> Option<&Pin> {
        self.registry.find_by_thread(thread)
    }

    #[must_use]
    pub fn watcher(&self, id: PinId) -> Option<&ThreadWatcher> {
        self.watchers.get(&id)
    }

    pub fn take_new_flags(&mut self, id: PinId) -> Option<NewFlags> {
        let watcher = self.watchers.get_mut(&id)?;
        Some(NewFlags {
            posts: watcher.take_were_new_posts(),
            quotes: watcher.take_were_new_quotes(),
        })
    }

    #[must_use]
    pub fn interval_state(&self) -> IntervalState {
        self.scheduler.current()
    }

    #[must_use]
    pub fn settings(&self) -> WatchSettings {
        self.settings
    }

    /// Create watchers for watched pins, drop the rest, and settle pins that
    /// died since the last update.
    fn sync_watchers(&mut self, watch_enabled: bool) {
        let mut changed = Vec::new();
        let mut created = Vec::new();

        for id in self.registry.ids() {
            let Some(pin) = self.registry.get_mut(id) else {
                continue;
            };
            let mut dirty = false;
            if !pin.is_active() && pin.watching {
                pin.watching = false;
                dirty = true;
            }
            // Nothing left to read in a thread that is gone
            if pin.is_error && pin.watch_last_count != pin.watch_new_count {
                pin.watch_last_count = pin.watch_new_count;
                dirty = true;
            }
            if dirty {
                changed.push(id);
            }

            if watch_enabled && pin.watching {
                if !self.watchers.contains_key(&id) {
                    debug!(pin_id = %id, thread = %pin.thread(), "Watcher created");
                    self.watchers.insert(id, ThreadWatcher::new(id));
                    created.push(id);
                }
            } else if self.watchers.remove(&id).is_some() {
                debug!(pin_id = %id, "Watcher destroyed");
            }
        }

        let registry = &self.registry;
        self.watchers
            .retain(|id, _| registry.find_by_id(*id).is_some());

        if !changed.is_empty() {
            self.registry.persist();
        }
        for id in changed.iter().chain(created.iter()) {
            self.registry.publish_changed(*id);
        }
    }

    fn destroy_watcher(&mut self, id: PinId) {
        if self.watchers.remove(&id).is_some() {
            debug!(pin_id = %id, "Watcher destroyed");
        }
    }

    fn has_unread_among_watching(&self) -> bool {
        let mode = self.settings.notify_mode;
        self.registry
            .iter()
            .any(|p| p.is_active() && p.watching && p.has_unread(mode))
    }

    fn set_presence(&mut self, show: bool) {
        if self.presence == Some(show) {
            return;
        }
        if show {
            self.collab.presence.start();
        } else {
            self.collab.presence.stop();
        }
        self.presence = Some(show);
    }
}
