//! Data model shared by the scheduler and its collaborators.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::NotifyMode;
use crate::constants::NEVER_LOADED;

/// Stable identity of a pin. Watchers are keyed by this, never by pin contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PinId(pub i64);

impl fmt::Display for PinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Site, board and thread number of a remote thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadDescriptor {
    pub site: String,
    pub board: String,
    pub thread_no: u64,
}

impl ThreadDescriptor {
    #[must_use]
    pub fn new(site: impl Into<String>, board: impl Into<String>, thread_no: u64) -> Self {
        Self {
            site: site.into(),
            board: board.into(),
            thread_no,
        }
    }
}

impl fmt::Display for ThreadDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.site, self.board, self.thread_no)
    }
}

impl FromStr for ThreadDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [site, board, no] = parts.as_slice() else {
            return Err(format!("expected site/board/thread, got '{s}'"));
        };
        if site.is_empty() || board.is_empty() {
            return Err(format!("empty site or board in '{s}'"));
        }
        let thread_no = no
            .parse()
            .map_err(|_| format!("invalid thread number in '{s}'"))?;
        Ok(Self::new(*site, *board, thread_no))
    }
}

/// A loadable reference to a thread.
///
/// Two loadables are equal when they point at the same thread; the numeric
/// `id` is a storage handle and does not take part in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loadable {
    pub id: i64,
    pub thread: ThreadDescriptor,
}

impl Loadable {
    #[must_use]
    pub fn new(id: i64, thread: ThreadDescriptor) -> Self {
        Self { id, thread }
    }
}

impl PartialEq for Loadable {
    fn eq(&self, other: &Self) -> bool {
        self.thread == other.thread
    }
}

impl Eq for Loadable {}

impl Hash for Loadable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.thread.hash(state);
    }
}

/// A pinned thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub id: PinId,
    pub loadable: Loadable,
    pub watching: bool,
    pub is_error: bool,
    pub archived: bool,
    pub order: i32,
    pub watch_last_count: i32,
    pub watch_new_count: i32,
    pub quote_last_count: i32,
    pub quote_new_count: i32,
    pub title: String,
    pub thumbnail_url: String,
}

impl Pin {
    /// A fresh, watched pin that has never been loaded.
    ///
    /// An id of 0 asks the registry to assign one.
    #[must_use]
    pub fn new(loadable: Loadable) -> Self {
        let title = format!("/{}/{}", loadable.thread.board, loadable.thread.thread_no);
        Self {
            id: PinId(0),
            loadable,
            watching: true,
            is_error: false,
            archived: false,
            order: 0,
            watch_last_count: NEVER_LOADED,
            watch_new_count: NEVER_LOADED,
            quote_last_count: NEVER_LOADED,
            quote_new_count: NEVER_LOADED,
            title,
            thumbnail_url: String::new(),
        }
    }

    #[must_use]
    pub fn thread(&self) -> &ThreadDescriptor {
        &self.loadable.thread
    }

    /// Not 404'd and not archived.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_error && !self.archived
    }

    #[must_use]
    pub fn new_post_count(&self) -> i32 {
        if self.watch_last_count < 0 || self.watch_new_count < 0 {
            0
        } else {
            (self.watch_new_count - self.watch_last_count).max(0)
        }
    }

    #[must_use]
    pub fn new_quote_count(&self) -> i32 {
        if self.quote_last_count < 0 || self.quote_new_count < 0 {
            0
        } else {
            (self.quote_new_count - self.quote_last_count).max(0)
        }
    }

    /// Whether this pin still has something unread under the given mode.
    #[must_use]
    pub fn has_unread(&self, mode: NotifyMode) -> bool {
        match mode {
            NotifyMode::All => {
                self.watch_last_count != self.watch_new_count
                    || self.quote_last_count != self.quote_new_count
            }
            NotifyMode::Quotes => self.quote_last_count != self.quote_new_count,
        }
    }
}

/// A single post of a fetched thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub no: u64,
    pub is_op: bool,
    pub subject: Option<String>,
    pub comment: String,
    /// Post numbers this post quotes.
    pub replies_to: Vec<u64>,
    /// Authored by the local user.
    pub is_saved_reply: bool,
    pub thumbnail_url: Option<String>,
}

impl Post {
    #[must_use]
    pub fn quotes(&self, no: u64) -> bool {
        self.replies_to.contains(&no)
    }
}

/// Everything a successful fetch reports about a thread.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSnapshot {
    pub posts: Vec<Post>,
    pub archived: bool,
    pub closed: bool,
    /// Reply count as reported by the OP, when the source provides it.
    pub reply_count: Option<u32>,
}

impl ThreadSnapshot {
    #[must_use]
    pub fn op(&self) -> Option<&Post> {
        self.posts.iter().find(|p| p.is_op)
    }
}

/// Where a thread currently sits in its board's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPage {
    pub page: u32,
    /// Number of index pages the board has.
    pub total_pages: u32,
}

impl ThreadPage {
    #[must_use]
    pub fn is_last_page(&self) -> bool {
        self.page >= self.total_pages
    }
}

/// Outcome of a failed thread fetch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The source confirmed the thread no longer exists.
    #[error("thread not found")]
    NotFound,
    /// Anything else; retried on the next tick.
    #[error("transient fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loadable(id: i64, no: u64) -> Loadable {
        Loadable::new(id, ThreadDescriptor::new("site", "g", no))
    }

    #[test]
    fn test_loadable_equality_ignores_id() {
        assert_eq!(loadable(1, 100), loadable(2, 100));
        assert_ne!(loadable(1, 100), loadable(1, 101));
    }

    #[test]
    fn test_new_pin_is_unloaded() {
        let pin = Pin::new(loadable(1, 100));
        assert!(pin.watching);
        assert!(pin.is_active());
        assert_eq!(pin.watch_new_count, NEVER_LOADED);
        assert_eq!(pin.new_post_count(), 0);
        assert_eq!(pin.title, "/g/100");
    }

    #[test]
    fn test_unread_counts() {
        let mut pin = Pin::new(loadable(1, 100));
        pin.watch_last_count = 5;
        pin.watch_new_count = 8;
        pin.quote_last_count = 1;
        pin.quote_new_count = 1;
        assert_eq!(pin.new_post_count(), 3);
        assert_eq!(pin.new_quote_count(), 0);
        assert!(pin.has_unread(NotifyMode::All));
        assert!(!pin.has_unread(NotifyMode::Quotes));
    }

    #[test]
    fn test_thread_page_last() {
        assert!(ThreadPage { page: 10, total_pages: 10 }.is_last_page());
        assert!(!ThreadPage { page: 9, total_pages: 10 }.is_last_page());
    }

    #[test]
    fn test_descriptor_display_round_trip() {
        let d = ThreadDescriptor::new("4chan", "g", 42);
        assert_eq!(d.to_string(), "4chan/g/42");
        assert_eq!("4chan/g/42".parse::<ThreadDescriptor>().unwrap(), d);
    }
}
