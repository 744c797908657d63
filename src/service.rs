//! The scheduling context.
//!
//! One task owns the [`WatchManager`] and processes [`Command`]s in arrival
//! order, so pin mutations and trigger installs never race. Timers, wake-ups
//! and fetch completions feed the same channel as user requests.
//! [`WatchHandle`] is the cloneable async front door.

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::collaborators::Collaborators;
use crate::config::SettingChange;
use crate::events::{EventBus, PinEvent};
use crate::interval::IntervalState;
use crate::manager::{NewFlags, SchedulerOptions, StateUpdate, WatchManager};
use crate::models::{FetchError, Loadable, Pin, PinId, ThreadDescriptor, ThreadSnapshot};
use crate::watcher::ThreadWatcher;

type Reply<T> = oneshot::Sender<T>;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Watch scheduler is not running")]
    Closed,
}

/// Everything the scheduling context reacts to.
#[derive(Debug)]
pub enum Command {
    // Internal triggers
    UpdateState(StateUpdate),
    ForegroundTick,
    Wake,
    PagesReceived,
    FetchCompleted {
        pin: PinId,
        result: Result<ThreadSnapshot, FetchError>,
    },

    // Environment
    SetForeground(bool),
    ChangeSetting(SettingChange),

    // Pin mutations
    CreatePin(Pin, Reply<bool>),
    DeletePin(PinId, Reply<Option<Pin>>),
    DeletePins(Vec<PinId>, Reply<Vec<Pin>>),
    UpdatePin(Pin, Reply<PinId>),
    UpdatePins(Vec<Pin>, Reply<Vec<PinId>>),
    MovePin {
        pin: PinId,
        to: usize,
        reply: Reply<bool>,
    },
    ToggleWatch(PinId, Reply<bool>),
    MarkViewed(PinId, Reply<bool>),
    PauseAll,
    ClearPins {
        all: bool,
        reply: Reply<Vec<Pin>>,
    },
    AddAll(Vec<Pin>, Reply<usize>),

    // Queries
    AllPins(Reply<Vec<Pin>>),
    WatchingPins(Reply<Vec<Pin>>),
    FindById(PinId, Reply<Option<Pin>>),
    FindByLoadableId(i64, Reply<Option<Pin>>),
    FindByThread(ThreadDescriptor, Reply<Option<Pin>>),
    Watcher(PinId, Reply<Option<ThreadWatcher>>),
    TakeNewFlags(PinId, Reply<Option<NewFlags>>),
    IntervalState(Reply<IntervalState>),
}

// A dropped receiver only means the caller stopped waiting.
fn reply<T>(tx: Reply<T>, value: T) {
    let _ = tx.send(value);
}

fn handle(manager: &mut WatchManager, command: Command) {
    match command {
        Command::UpdateState(update) => {
            manager.update_state(update);
        }
        Command::ForegroundTick => manager.on_foreground_tick(),
        Command::Wake => manager.on_wake(),
        Command::PagesReceived => manager.on_pages_received(),
        Command::FetchCompleted { pin, result } => manager.on_fetch_completed(pin, result),

        Command::SetForeground(in_foreground) => manager.set_foreground(in_foreground),
        Command::ChangeSetting(change) => manager.change_setting(change),

        Command::CreatePin(pin, tx) => reply(tx, manager.create_pin(pin)),
        Command::DeletePin(id, tx) => reply(tx, manager.delete_pin(id)),
        Command::DeletePins(ids, tx) => reply(tx, manager.delete_pins(&ids)),
        Command::UpdatePin(pin, tx) => reply(tx, manager.update_pin(pin)),
        Command::UpdatePins(pins, tx) => reply(tx, manager.update_pins(pins)),
        Command::MovePin { pin, to, reply: tx } => reply(tx, manager.move_pin(pin, to)),
        Command::ToggleWatch(id, tx) => reply(tx, manager.toggle_watch(id)),
        Command::MarkViewed(id, tx) => reply(tx, manager.mark_viewed(id)),
        Command::PauseAll => manager.pause_all(),
        Command::ClearPins { all, reply: tx } => reply(tx, manager.clear_pins(all)),
        Command::AddAll(pins, tx) => reply(tx, manager.add_all(pins)),

        Command::AllPins(tx) => reply(tx, manager.all_pins()),
        Command::WatchingPins(tx) => reply(tx, manager.watching_pins()),
        Command::FindById(id, tx) => reply(tx, manager.find_by_id(id).cloned()),
        Command::FindByLoadableId(id, tx) => reply(tx, manager.find_by_loadable_id(id).cloned()),
        Command::FindByThread(thread, tx) => reply(tx, manager.find_by_thread(&thread).cloned()),
        Command::Watcher(id, tx) => reply(tx, manager.watcher(id).cloned()),
        Command::TakeNewFlags(id, tx) => reply(tx, manager.take_new_flags(id)),
        Command::IntervalState(tx) => reply(tx, manager.interval_state()),
    }
}

async fn run(
    mut manager: WatchManager,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    info!("Watch scheduler started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break;
                };
                handle(&mut manager, command);
            }
            () = shutdown.cancelled() => {
                debug!("Shutdown requested");
                break;
            }
        }
    }

    manager.shutdown();
    info!("Watch scheduler stopped");
}

/// A running scheduler.
#[derive(Debug)]
pub struct WatchService {
    handle: WatchHandle,
    task: JoinHandle<()>,
}

impl WatchService {
    /// Load the stored pins and start the scheduling task.
    ///
    /// The task runs until `shutdown` is cancelled.
    pub async fn start(
        options: SchedulerOptions,
        collab: Collaborators,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let pins = collab
            .store
            .load_all_pins()
            .await
            .context("Failed to load pins")?;
        info!(pins = pins.len(), "Loaded pins");

        let events = EventBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = WatchManager::new(options, collab, pins, events.clone(), tx.clone());
        let task = tokio::spawn(run(manager, rx, shutdown));

        Ok(Self {
            handle: WatchHandle {
                commands: tx,
                events,
            },
            task,
        })
    }

    #[must_use]
    pub fn handle(&self) -> WatchHandle {
        self.handle.clone()
    }

    /// Wait for the scheduling task to finish after shutdown.
    pub async fn stopped(self) -> Result<()> {
        drop(self.handle);
        self.task.await.context("Watch scheduler task panicked")
    }
}

/// Cloneable handle to the scheduling task.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
}

impl WatchHandle {
    /// Pin and scheduler events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PinEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<(), ServiceError> {
        self.commands.send(command).map_err(|_| ServiceError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| ServiceError::Closed)
    }

    pub async fn create_pin(&self, pin: Pin) -> Result<bool, ServiceError> {
        self.request(|tx| Command::CreatePin(pin, tx)).await
    }

    /// Pin a thread with default watch state.
    pub async fn pin_thread(&self, thread: ThreadDescriptor) -> Result<bool, ServiceError> {
        self.create_pin(Pin::new(Loadable::new(0, thread))).await
    }

    pub async fn delete_pin(&self, id: PinId) -> Result<Option<Pin>, ServiceError> {
        self.request(|tx| Command::DeletePin(id, tx)).await
    }

    pub async fn delete_pins(&self, ids: Vec<PinId>) -> Result<Vec<Pin>, ServiceError> {
        self.request(|tx| Command::DeletePins(ids, tx)).await
    }

    pub async fn update_pin(&self, pin: Pin) -> Result<PinId, ServiceError> {
        self.request(|tx| Command::UpdatePin(pin, tx)).await
    }

    pub async fn update_pins(&self, pins: Vec<Pin>) -> Result<Vec<PinId>, ServiceError> {
        self.request(|tx| Command::UpdatePins(pins, tx)).await
    }

    pub async fn move_pin(&self, pin: PinId, to: usize) -> Result<bool, ServiceError> {
        self.request(|reply| Command::MovePin { pin, to, reply })
            .await
    }

    pub async fn toggle_watch(&self, id: PinId) -> Result<bool, ServiceError> {
        self.request(|tx| Command::ToggleWatch(id, tx)).await
    }

    pub async fn mark_viewed(&self, id: PinId) -> Result<bool, ServiceError> {
        self.request(|tx| Command::MarkViewed(id, tx)).await
    }

    pub fn pause_all(&self) -> Result<(), ServiceError> {
        self.send(Command::PauseAll)
    }

    /// Remove pins and return them for a later [`Self::add_all`].
    pub async fn clear_pins(&self, all: bool) -> Result<Vec<Pin>, ServiceError> {
        self.request(|reply| Command::ClearPins { all, reply })
            .await
    }

    pub async fn add_all(&self, pins: Vec<Pin>) -> Result<usize, ServiceError> {
        self.request(|tx| Command::AddAll(pins, tx)).await
    }

    pub fn set_foreground(&self, in_foreground: bool) -> Result<(), ServiceError> {
        self.send(Command::SetForeground(in_foreground))
    }

    pub fn change_setting(&self, change: SettingChange) -> Result<(), ServiceError> {
        self.send(Command::ChangeSetting(change))
    }

    pub async fn all_pins(&self) -> Result<Vec<Pin>, ServiceError> {
        self.request(Command::AllPins).await
    }

    pub async fn watching_pins(&self) -> Result<Vec<Pin>, ServiceError> {
        self.request(Command::WatchingPins).await
    }

    pub async fn find_by_id(&self, id: PinId) -> Result<Option<Pin>, ServiceError> {
        self.request(|tx| Command::FindById(id, tx)).await
    }

    pub async fn find_by_loadable_id(&self, loadable_id: i64) -> Result<Option<Pin>, ServiceError> {
        self.request(|tx| Command::FindByLoadableId(loadable_id, tx))
            .await
    }

    pub async fn find_by_thread(
        &self,
        thread: ThreadDescriptor,
    ) -> Result<Option<Pin>, ServiceError> {
        self.request(|tx| Command::FindByThread(thread, tx)).await
    }

    /// Snapshot of a pin's watcher.
    pub async fn watcher(&self, id: PinId) -> Result<Option<ThreadWatcher>, ServiceError> {
        self.request(|tx| Command::Watcher(id, tx)).await
    }

    /// Read and reset the watcher's new-post and new-quote flags.
    pub async fn take_new_flags(&self, id: PinId) -> Result<Option<NewFlags>, ServiceError> {
        self.request(|tx| Command::TakeNewFlags(id, tx)).await
    }

    pub async fn interval_state(&self) -> Result<IntervalState, ServiceError> {
        self.request(Command::IntervalState).await
    }
}
