//! Recording fakes for the scheduler's collaborators.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use thread_pin_watcher::collaborators::{
    Collaborators, LastPageNotifier, ListenerId, NotificationPresence, PageInfoSource,
    PagesListener, PinStore, SleepPrevention, ThreadDataSource, WakeScheduler, Wakeable,
};
use thread_pin_watcher::config::WatchSettings;
use thread_pin_watcher::manager::SchedulerOptions;
use thread_pin_watcher::models::{
    FetchError, Loadable, Pin, PinId, Post, ThreadDescriptor, ThreadPage, ThreadSnapshot,
};
use thread_pin_watcher::service::{WatchHandle, WatchService};

pub fn thread(no: u64) -> ThreadDescriptor {
    ThreadDescriptor::new("test", "g", no)
}

pub fn pin(no: u64) -> Pin {
    Pin::new(Loadable::new(0, thread(no)))
}

/// A thread with `count` posts, the first being the OP.
pub fn snapshot(count: u64) -> ThreadSnapshot {
    ThreadSnapshot {
        posts: (1..=count)
            .map(|no| Post {
                no,
                is_op: no == 1,
                subject: (no == 1).then(|| "Test thread".to_string()),
                comment: format!("post {no}"),
                replies_to: Vec::new(),
                is_saved_reply: false,
                thumbnail_url: None,
            })
            .collect(),
        ..ThreadSnapshot::default()
    }
}

/// Wait past the state debounce so queued work has been applied.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1100)).await;
}

/// Let spawned tasks run without crossing any timer.
pub async fn flush_tasks() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub struct FakeThreadSource {
    responses: Mutex<HashMap<u64, Result<ThreadSnapshot, FetchError>>>,
    calls: Mutex<Vec<(u64, bool)>>,
    throttled: AtomicBool,
    gated: AtomicBool,
    gate: Semaphore,
}

impl Default for FakeThreadSource {
    fn default() -> Self {
        Self {
            responses: Mutex::default(),
            calls: Mutex::default(),
            throttled: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }
}

impl FakeThreadSource {
    pub fn set(&self, no: u64, response: Result<ThreadSnapshot, FetchError>) {
        self.responses.lock().unwrap().insert(no, response);
    }

    /// `(thread_no, force)` for every fetch started.
    pub fn calls(&self) -> Vec<(u64, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::SeqCst);
    }

    /// Hold every fetch until [`Self::release`] lets it through.
    pub fn hold_fetches(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, count: usize) {
        self.gate.add_permits(count);
    }
}

#[async_trait]
impl ThreadDataSource for FakeThreadSource {
    fn should_poll_now(&self, _loadable: &Loadable) -> bool {
        !self.throttled.load(Ordering::SeqCst)
    }

    async fn fetch(&self, loadable: &Loadable, force: bool) -> Result<ThreadSnapshot, FetchError> {
        let no = loadable.thread.thread_no;
        self.calls.lock().unwrap().push((no, force));
        if self.gated.load(Ordering::SeqCst) {
            self.gate.acquire().await.unwrap().forget();
        }
        self.responses
            .lock()
            .unwrap()
            .get(&no)
            .cloned()
            .unwrap_or_else(|| Err(FetchError::Transient("no scripted response".to_string())))
    }
}

#[derive(Default)]
pub struct FakePages {
    pages: Mutex<HashMap<u64, ThreadPage>>,
    listeners: Mutex<HashMap<ListenerId, Arc<dyn PagesListener>>>,
    next_id: AtomicU64,
}

impl FakePages {
    pub fn set_page(&self, no: u64, page: u32, total_pages: u32) {
        self.pages
            .lock()
            .unwrap()
            .insert(no, ThreadPage { page, total_pages });
    }

    /// Announce a page arrival to every listener.
    pub fn fire(&self) {
        let listeners: Vec<_> = self.listeners.lock().unwrap().values().cloned().collect();
        for listener in listeners {
            listener.on_pages_received();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

impl PageInfoSource for FakePages {
    fn get_page(&self, thread: &ThreadDescriptor) -> Option<ThreadPage> {
        self.pages.lock().unwrap().get(&thread.thread_no).copied()
    }

    fn add_listener(&self, listener: Arc<dyn PagesListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().unwrap().insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.listeners.lock().unwrap().remove(&id);
    }
}

#[derive(Default)]
pub struct RecordingStore {
    initial: Mutex<Vec<Pin>>,
    saves: Mutex<Vec<Vec<Pin>>>,
}

impl RecordingStore {
    pub fn with_pins(pins: Vec<Pin>) -> Self {
        Self {
            initial: Mutex::new(pins),
            saves: Mutex::default(),
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap().len()
    }

    pub fn last_saved(&self) -> Option<Vec<Pin>> {
        self.saves.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl PinStore for RecordingStore {
    async fn load_all_pins(&self) -> anyhow::Result<Vec<Pin>> {
        Ok(self.initial.lock().unwrap().clone())
    }

    fn save_pins(&self, pins: Vec<Pin>) {
        self.saves.lock().unwrap().push(pins);
    }
}

#[derive(Default)]
pub struct CountingSleep {
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl CountingSleep {
    /// `(acquired, released)`
    pub fn counts(&self) -> (usize, usize) {
        (
            self.acquired.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst),
        )
    }
}

impl SleepPrevention for CountingSleep {
    fn acquire(&self) -> anyhow::Result<()> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) -> anyhow::Result<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingWake {
    registered: Mutex<Vec<Arc<dyn Wakeable>>>,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
}

impl RecordingWake {
    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistrations(&self) -> usize {
        self.unregistrations.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self) -> bool {
        !self.registered.lock().unwrap().is_empty()
    }

    /// Fire a coarse background wake-up.
    pub fn wake(&self) {
        let registered: Vec<_> = self.registered.lock().unwrap().clone();
        for wakeable in registered {
            wakeable.on_wake();
        }
    }
}

impl WakeScheduler for RecordingWake {
    fn register_wakeable(&self, wakeable: Arc<dyn Wakeable>) {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        self.registered.lock().unwrap().push(wakeable);
    }

    fn unregister_wakeable(&self, wakeable: &Arc<dyn Wakeable>) {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
        self.registered
            .lock()
            .unwrap()
            .retain(|w| !Arc::ptr_eq(w, wakeable));
    }
}

#[derive(Default)]
pub struct RecordingPresence {
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl RecordingPresence {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl NotificationPresence for RecordingPresence {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct RecordingLastPage {
    notified: Mutex<Vec<PinId>>,
    cancelled: Mutex<Vec<PinId>>,
}

impl RecordingLastPage {
    pub fn notified(&self) -> Vec<PinId> {
        self.notified.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<PinId> {
        self.cancelled.lock().unwrap().clone()
    }
}

impl LastPageNotifier for RecordingLastPage {
    fn notify(&self, pin: PinId) {
        self.notified.lock().unwrap().push(pin);
    }

    fn cancel(&self, pin: PinId) {
        self.cancelled.lock().unwrap().push(pin);
    }
}

/// One recording fake per collaborator.
pub struct Fakes {
    pub threads: Arc<FakeThreadSource>,
    pub pages: Arc<FakePages>,
    pub store: Arc<RecordingStore>,
    pub sleep: Arc<CountingSleep>,
    pub wake: Arc<RecordingWake>,
    pub presence: Arc<RecordingPresence>,
    pub last_page: Arc<RecordingLastPage>,
}

impl Fakes {
    pub fn new(stored: Vec<Pin>) -> Self {
        Self {
            threads: Arc::new(FakeThreadSource::default()),
            pages: Arc::new(FakePages::default()),
            store: Arc::new(RecordingStore::with_pins(stored)),
            sleep: Arc::new(CountingSleep::default()),
            wake: Arc::new(RecordingWake::default()),
            presence: Arc::new(RecordingPresence::default()),
            last_page: Arc::new(RecordingLastPage::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            threads: self.threads.clone(),
            pages: self.pages.clone(),
            store: self.store.clone(),
            sleep: self.sleep.clone(),
            wake: self.wake.clone(),
            presence: self.presence.clone(),
            last_page: self.last_page.clone(),
        }
    }
}

/// A running service wired to recording fakes.
pub struct Harness {
    pub threads: Arc<FakeThreadSource>,
    pub pages: Arc<FakePages>,
    pub store: Arc<RecordingStore>,
    pub sleep: Arc<CountingSleep>,
    pub wake: Arc<RecordingWake>,
    pub presence: Arc<RecordingPresence>,
    pub last_page: Arc<RecordingLastPage>,
    pub handle: WatchHandle,
    pub shutdown: CancellationToken,
    service: WatchService,
}

impl Harness {
    pub async fn start(settings: WatchSettings, in_foreground: bool) -> Self {
        Self::start_with_pins(settings, in_foreground, Vec::new()).await
    }

    pub async fn start_with_pins(
        settings: WatchSettings,
        in_foreground: bool,
        stored: Vec<Pin>,
    ) -> Self {
        let fakes = Fakes::new(stored);
        let options = SchedulerOptions {
            settings,
            start_in_foreground: in_foreground,
            ..SchedulerOptions::default()
        };
        let shutdown = CancellationToken::new();
        let service = WatchService::start(options, fakes.collaborators(), shutdown.clone())
            .await
            .unwrap();
        let handle = service.handle();

        Self {
            threads: fakes.threads,
            pages: fakes.pages,
            store: fakes.store,
            sleep: fakes.sleep,
            wake: fakes.wake,
            presence: fakes.presence,
            last_page: fakes.last_page,
            handle,
            shutdown,
            service,
        }
    }

    /// Pin a thread and return its id.
    pub async fn pin(&self, no: u64) -> PinId {
        assert!(self.handle.pin_thread(thread(no)).await.unwrap());
        self.handle
            .find_by_thread(thread(no))
            .await
            .unwrap()
            .unwrap()
            .id
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.service.stopped().await.unwrap();
    }
}

pub fn settings(watch: bool, background: bool) -> WatchSettings {
    WatchSettings {
        watch_enabled: watch,
        background_enabled: background,
        ..WatchSettings::default()
    }
}
