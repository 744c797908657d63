//! Board index page cache.
//!
//! `GET {base}/{board}/threads.json` lists every index page of a board with
//! the threads on it. Lookups are served from the cache; a missing or stale
//! board is refreshed in the background and listeners are told when the new
//! pages land. Boards are cached per site, so equal board names on different
//! sites never share pages.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::collaborators::{ListenerId, PageInfoSource, PagesListener};
use crate::constants::WATCHER_USER_AGENT;
use crate::models::{ThreadDescriptor, ThreadPage};

#[derive(Debug, Deserialize)]
struct ApiPage {
    page: u32,
    threads: Vec<ApiThread>,
}

#[derive(Debug, Deserialize)]
struct ApiThread {
    no: u64,
}

#[derive(Debug)]
struct BoardPages {
    fetched_at: Instant,
    total_pages: u32,
    thread_pages: HashMap<u64, u32>,
}

/// `(site, board)`
type BoardKey = (String, String);

fn board_key(site: &str, board: &str) -> BoardKey {
    (site.to_string(), board.to_string())
}

#[derive(Debug, Default)]
struct CacheState {
    boards: HashMap<BoardKey, BoardPages>,
    in_flight: HashSet<BoardKey>,
}

struct Inner {
    client: Client,
    base_url: String,
    ttl: Duration,
    state: Mutex<CacheState>,
    listeners: Mutex<HashMap<ListenerId, Arc<dyn PagesListener>>>,
    next_listener: AtomicU64,
}

/// Cloneable handle to the shared page cache.
#[derive(Clone)]
pub struct BoardPageCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BoardPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardPageCache")
            .field("base_url", &self.inner.base_url)
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}

impl BoardPageCache {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, ttl: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(WATCHER_USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url: base_url.trim_end_matches('/').to_string(),
                ttl,
                state: Mutex::new(CacheState::default()),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
            }),
        })
    }

    /// Fetch the index pages of `board` on `site` and notify listeners.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response is malformed.
    pub async fn refresh_board(&self, site: &str, board: &str) -> Result<()> {
        let result = self.fetch_board(board).await;
        let key = board_key(site, board);
        let mut state = self.state();
        state.in_flight.remove(&key);
        let pages = result?;
        debug!(site, board, total_pages = pages.total_pages, "Board pages refreshed");
        state.boards.insert(key, pages);
        drop(state);

        self.notify_listeners();
        Ok(())
    }

    async fn fetch_board(&self, board: &str) -> Result<BoardPages> {
        let url = format!("{}/{board}/threads.json", self.inner.base_url);
        let response = self
            .inner
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        if !response.status().is_success() {
            anyhow::bail!("Board pages fetch failed with status {}", response.status());
        }
        let pages: Vec<ApiPage> = response
            .json()
            .await
            .context("Failed to parse board pages")?;

        let total_pages = pages.iter().map(|p| p.page).max().unwrap_or(0);
        let thread_pages = pages
            .iter()
            .flat_map(|p| p.threads.iter().map(move |t| (t.no, p.page)))
            .collect();
        Ok(BoardPages {
            fetched_at: Instant::now(),
            total_pages,
            thread_pages,
        })
    }

    /// Start a background refresh unless one is already running or there is
    /// no runtime to run it on.
    fn spawn_refresh(&self, thread: &ThreadDescriptor) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if !self
            .state()
            .in_flight
            .insert(board_key(&thread.site, &thread.board))
        {
            return;
        }
        let cache = self.clone();
        let (site, board) = (thread.site.clone(), thread.board.clone());
        runtime.spawn(async move {
            if let Err(e) = cache.refresh_board(&site, &board).await {
                warn!(site = %site, board = %board, "Failed to refresh board pages: {e:#}");
            }
        });
    }

    fn notify_listeners(&self) {
        let listeners: Vec<Arc<dyn PagesListener>> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener.on_pages_received();
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PageInfoSource for BoardPageCache {
    fn get_page(&self, thread: &ThreadDescriptor) -> Option<ThreadPage> {
        let (page, stale) = {
            let state = self.state();
            match state.boards.get(&board_key(&thread.site, &thread.board)) {
                Some(pages) => (
                    pages
                        .thread_pages
                        .get(&thread.thread_no)
                        .map(|page| ThreadPage {
                            page: *page,
                            total_pages: pages.total_pages,
                        }),
                    pages.fetched_at.elapsed() >= self.inner.ttl,
                ),
                None => (None, true),
            }
        };
        if stale {
            self.spawn_refresh(thread);
        }
        page
    }

    fn add_listener(&self, listener: Arc<dyn PagesListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, listener);
        id
    }

    fn remove_listener(&self, id: ListenerId) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}
