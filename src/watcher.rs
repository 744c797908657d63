//! Per-thread polling and change detection.

use tracing::{debug, info};

use crate::collaborators::{LastPageNotifier, PageInfoSource, ThreadDataSource};
use crate::config::WatchSettings;
use crate::models::{FetchError, Loadable, Pin, PinId, Post, ThreadPage, ThreadSnapshot};

const TITLE_EXCERPT_CHARS: usize = 50;

/// Starts a fetch on behalf of a watcher.
pub trait FetchDispatch {
    fn dispatch(&self, pin: PinId, loadable: &Loadable, force: bool);
}

/// Collaborators a watcher consults while polling.
#[derive(Clone, Copy)]
pub struct PollContext<'a> {
    pub settings: &'a WatchSettings,
    pub pages: &'a dyn PageInfoSource,
    pub threads: &'a dyn ThreadDataSource,
    pub last_page: &'a dyn LastPageNotifier,
}

/// Watches one pinned thread while it is being watched.
///
/// Everything here is derived from fetches and thrown away when the watcher
/// is destroyed; the pin holds the persistent counters.
#[derive(Debug, Clone)]
pub struct ThreadWatcher {
    pin_id: PinId,
    posts: Vec<Post>,
    quotes: Vec<Post>,
    were_new_posts: bool,
    were_new_quotes: bool,
    notified: bool,
    latest_known_page: Option<u32>,
    last_reply_count: Option<u32>,
}

impl ThreadWatcher {
    #[must_use]
    pub fn new(pin_id: PinId) -> Self {
        Self {
            pin_id,
            posts: Vec::new(),
            quotes: Vec::new(),
            were_new_posts: false,
            were_new_quotes: false,
            notified: false,
            latest_known_page: None,
            last_reply_count: None,
        }
    }

    #[must_use]
    pub fn pin_id(&self) -> PinId {
        self.pin_id
    }

    /// Check the thread's page and start a fetch if one is due.
    ///
    /// Returns `true` only if a fetch was actually dispatched.
    pub fn poll(
        &mut self,
        pin: &Pin,
        from_background: bool,
        ctx: &PollContext<'_>,
        dispatcher: &dyn FetchDispatch,
    ) -> bool {
        if !pin.is_active() || !pin.watching {
            return false;
        }

        if let Some(page) = ctx.pages.get_page(pin.thread()) {
            self.latest_known_page = Some(page.page);
            self.check_last_page(page, ctx.settings, ctx.last_page);
        }

        if from_background {
            // Wake-ups are far apart, so the source's own throttle is stale
            dispatcher.dispatch(pin.id, &pin.loadable, true);
            true
        } else if ctx.threads.should_poll_now(&pin.loadable) {
            dispatcher.dispatch(pin.id, &pin.loadable, false);
            true
        } else {
            false
        }
    }

    /// New page information arrived out of band.
    pub fn on_pages_received(&mut self, pin: &Pin, ctx: &PollContext<'_>) {
        if let Some(page) = ctx.pages.get_page(pin.thread()) {
            self.latest_known_page = Some(page.page);
            self.check_last_page(page, ctx.settings, ctx.last_page);
        }
    }

    /// Notify once when the thread reaches the last page, and clear the
    /// notification once when it moves back up.
    pub fn check_last_page(
        &mut self,
        page: ThreadPage,
        settings: &WatchSettings,
        notifier: &dyn LastPageNotifier,
    ) {
        if !(settings.watch_enabled && settings.background_enabled && settings.last_page_notify) {
            return;
        }
        if page.is_last_page() && !self.notified {
            debug!(pin_id = %self.pin_id, page = page.page, "Thread reached last page");
            notifier.notify(self.pin_id);
            self.notified = true;
        } else if !page.is_last_page() && self.notified {
            notifier.cancel(self.pin_id);
            self.notified = false;
        }
    }

    /// Fold a freshly fetched thread into the watcher and its pin.
    pub fn apply_snapshot(&mut self, pin: &mut Pin, snapshot: ThreadSnapshot) {
        self.last_reply_count = snapshot.reply_count;
        pin.is_error = false;

        if let Some(op) = snapshot.op() {
            if let Some(title) = thread_title(op) {
                pin.title = title;
            }
            if pin.thumbnail_url.is_empty() {
                if let Some(thumb) = &op.thumbnail_url {
                    pin.thumbnail_url.clone_from(thumb);
                }
            }
        }

        let ThreadSnapshot {
            posts,
            archived,
            closed,
            ..
        } = snapshot;

        let saved: Vec<u64> = posts
            .iter()
            .filter(|p| p.is_saved_reply)
            .map(|p| p.no)
            .collect();
        self.quotes = posts
            .iter()
            .filter(|p| !p.is_saved_reply && saved.iter().any(|no| p.quotes(*no)))
            .cloned()
            .collect();
        self.posts = posts;

        let first_load = pin.watch_new_count < 0 || pin.quote_new_count < 0;
        let previous_watch_new = pin.watch_new_count;
        let previous_quote_new = pin.quote_new_count;

        if first_load {
            pin.watch_last_count = self.posts.len() as i32;
            pin.quote_last_count = self.quotes.len() as i32;
        }

        pin.watch_new_count = (self.posts.len() - saved.len()) as i32;
        pin.quote_new_count = self.quotes.len() as i32;

        if !first_load {
            if pin.watch_new_count > previous_watch_new {
                self.were_new_posts = true;
            }
            if pin.quote_new_count > previous_quote_new {
                self.were_new_quotes = true;
            }
        }

        debug!(
            pin_id = %pin.id,
            watch_last = pin.watch_last_count,
            watch_new = pin.watch_new_count,
            were_new_posts = self.were_new_posts,
            quote_last = pin.quote_last_count,
            quote_new = pin.quote_new_count,
            were_new_quotes = self.were_new_quotes,
            "Thread reconciled"
        );

        if archived || closed {
            info!(pin_id = %pin.id, thread = %pin.thread(), "Thread archived, no longer watching");
            pin.archived = true;
            pin.watching = false;
        }
    }

    /// Apply a failed fetch. Only a confirmed 404 changes anything.
    pub fn apply_error(pin: &mut Pin, error: &FetchError) {
        if error.is_not_found() {
            info!(pin_id = %pin.id, thread = %pin.thread(), "Thread is gone, no longer watching");
            pin.is_error = true;
            pin.watching = false;
        } else {
            debug!(pin_id = %pin.id, "Fetch failed, retrying next tick: {error}");
        }
    }

    /// Whether new posts arrived since the last call. Reading clears it.
    pub fn take_were_new_posts(&mut self) -> bool {
        std::mem::take(&mut self.were_new_posts)
    }

    /// Whether new quotes arrived since the last call. Reading clears it.
    pub fn take_were_new_quotes(&mut self) -> bool {
        std::mem::take(&mut self.were_new_quotes)
    }

    pub fn clear_new_flags(&mut self) {
        self.were_new_posts = false;
        self.were_new_quotes = false;
    }

    #[must_use]
    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    #[must_use]
    pub fn quotes(&self) -> &[Post] {
        &self.quotes
    }

    /// The trailing posts the user has not seen yet.
    #[must_use]
    pub fn unviewed_posts(&self, pin: &Pin) -> &[Post] {
        tail(&self.posts, pin.new_post_count())
    }

    #[must_use]
    pub fn unviewed_quotes(&self, pin: &Pin) -> &[Post] {
        tail(&self.quotes, pin.new_quote_count())
    }

    #[must_use]
    pub fn latest_known_page(&self) -> Option<u32> {
        self.latest_known_page
    }

    #[must_use]
    pub fn last_reply_count(&self) -> Option<u32> {
        self.last_reply_count
    }

    #[must_use]
    pub fn is_notified(&self) -> bool {
        self.notified
    }
}

fn tail(posts: &[Post], count: i32) -> &[Post] {
    let count = usize::try_from(count).unwrap_or(0).min(posts.len());
    &posts[posts.len() - count..]
}

/// Subject if present, otherwise the start of the comment.
fn thread_title(op: &Post) -> Option<String> {
    if let Some(subject) = op.subject.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return Some(subject.to_string());
    }
    let comment = op.comment.trim();
    if comment.is_empty() {
        return None;
    }
    Some(comment.chars().take(TITLE_EXCERPT_CHARS).collect())
}
