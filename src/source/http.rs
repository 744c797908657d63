//! Thread data source backed by a JSON thread API.
//!
//! `GET {base}/{board}/thread/{no}.json` returns `{"posts": [...]}` with the
//! OP first. A 404 means the thread is gone for good.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::saved::SavedReplies;
use crate::collaborators::ThreadDataSource;
use crate::constants::WATCHER_USER_AGENT;
use crate::models::{FetchError, Loadable, Post, ThreadDescriptor, ThreadSnapshot};

static QUOTE_PATTERN: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"(?:&gt;|>){2}(\d+)").unwrap());

static TAG_PATTERN: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"<[^>]*>").unwrap());

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    posts: Vec<ApiPost>,
}

#[derive(Debug, Deserialize)]
struct ApiPost {
    no: u64,
    #[serde(default)]
    resto: u64,
    sub: Option<String>,
    com: Option<String>,
    tim: Option<u64>,
    #[serde(default)]
    archived: u8,
    #[serde(default)]
    closed: u8,
    replies: Option<u32>,
}

/// Fetches threads over HTTP with a per-thread minimum poll interval.
#[derive(Debug)]
pub struct HttpThreadSource {
    client: Client,
    base_url: String,
    min_interval: Duration,
    last_fetch: Mutex<HashMap<ThreadDescriptor, Instant>>,
    saved: Arc<SavedReplies>,
}

impl HttpThreadSource {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: &str, min_interval: Duration, saved: Arc<SavedReplies>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(WATCHER_USER_AGENT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            min_interval,
            last_fetch: Mutex::new(HashMap::new()),
            saved,
        })
    }

    #[must_use]
    pub fn thread_url(&self, thread: &ThreadDescriptor) -> String {
        format!(
            "{}/{}/thread/{}.json",
            self.base_url, thread.board, thread.thread_no
        )
    }

    fn mark_fetched(&self, thread: &ThreadDescriptor) {
        self.last_fetch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(thread.clone(), Instant::now());
    }

    async fn fetch_body(&self, thread: &ThreadDescriptor) -> Result<String, FetchError> {
        let url = self.thread_url(thread);
        debug!(%url, "Fetching thread");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status if !status.is_success() => {
                Err(FetchError::Transient(format!("HTTP {status} from {url}")))
            }
            _ => response
                .text()
                .await
                .map_err(|e| FetchError::Transient(e.to_string())),
        }
    }
}

#[async_trait]
impl ThreadDataSource for HttpThreadSource {
    fn should_poll_now(&self, loadable: &Loadable) -> bool {
        let last_fetch = self.last_fetch.lock().unwrap_or_else(PoisonError::into_inner);
        last_fetch
            .get(&loadable.thread)
            .is_none_or(|at| at.elapsed() >= self.min_interval)
    }

    async fn fetch(&self, loadable: &Loadable, force: bool) -> Result<ThreadSnapshot, FetchError> {
        let thread = &loadable.thread;
        trace!(%thread, force, "Thread fetch requested");
        self.mark_fetched(thread);

        let body = self.fetch_body(thread).await?;
        parse_thread(&self.base_url, thread, &body, &self.saved)
    }
}

/// Turn a thread API response into a snapshot.
///
/// # Errors
///
/// Returns [`FetchError::Transient`] if the body is not a valid thread.
pub fn parse_thread(
    base_url: &str,
    thread: &ThreadDescriptor,
    body: &str,
    saved: &SavedReplies,
) -> Result<ThreadSnapshot, FetchError> {
    let response: ThreadResponse = serde_json::from_str(body)
        .map_err(|e| FetchError::Transient(format!("invalid thread JSON: {e}")))?;

    let Some(op) = response.posts.first() else {
        return Err(FetchError::Transient("thread has no posts".to_string()));
    };
    let archived = op.archived != 0;
    let closed = op.closed != 0;
    let reply_count = op.replies;

    let posts = response
        .posts
        .iter()
        .map(|p| {
            let raw = p.com.as_deref().unwrap_or_default();
            Post {
                no: p.no,
                is_op: p.resto == 0,
                subject: p.sub.as_deref().map(html_to_text).filter(|s| !s.is_empty()),
                comment: html_to_text(raw),
                replies_to: extract_quotes(raw),
                is_saved_reply: saved.contains(thread, p.no),
                thumbnail_url: p
                    .tim
                    .map(|tim| format!("{base_url}/{}/{tim}s.jpg", thread.board)),
            }
        })
        .collect();

    Ok(ThreadSnapshot {
        posts,
        archived,
        closed,
        reply_count,
    })
}

/// Post numbers referenced as `>>NNN` in a comment, in first-seen order.
#[must_use]
pub fn extract_quotes(comment: &str) -> Vec<u64> {
    let mut quotes: Vec<u64> = Vec::new();
    for caps in QUOTE_PATTERN.captures_iter(comment) {
        if let Ok(no) = caps[1].parse() {
            if !quotes.contains(&no) {
                quotes.push(no);
            }
        }
    }
    quotes
}

/// Strip tags and decode the handful of entities the API emits.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let with_breaks = html.replace("<br>", "\n").replace("<br/>", "\n");
    TAG_PATTERN
        .replace_all(&with_breaks, "")
        .replace("&gt;", ">")
        .replace("&lt;", "<")
        .replace("&quot;", "\"")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_quotes_dedups_and_handles_escaped_markup() {
        let com = r##"<a href="#p101" class="quotelink">&gt;&gt;101</a><br>lol<br>>>102 >>101"##;
        assert_eq!(extract_quotes(com), vec![101, 102]);
        assert!(extract_quotes("no quotes > here").is_empty());
    }

    #[test]
    fn test_html_to_text() {
        assert_eq!(
            html_to_text("<span class=\"quote\">&gt;be me</span><br>&quot;hi&quot; &amp; bye"),
            ">be me\n\"hi\" & bye"
        );
    }

    #[test]
    fn test_parse_thread_marks_saved_replies_and_state() {
        let thread = ThreadDescriptor::new("site", "g", 100);
        let saved = SavedReplies::default();
        saved.add(&thread, 102);
        let body = r#"{"posts":[
            {"no":100,"resto":0,"sub":"Thread","com":"op","tim":1234,"closed":1,"replies":2},
            {"no":101,"resto":100,"com":"first"},
            {"no":102,"resto":100,"com":"&gt;&gt;101 mine"}
        ]}"#;

        let snapshot = parse_thread("http://api", &thread, body, &saved).unwrap();
        assert!(snapshot.closed);
        assert!(!snapshot.archived);
        assert_eq!(snapshot.reply_count, Some(2));
        assert_eq!(snapshot.posts.len(), 3);
        assert!(snapshot.posts[0].is_op);
        assert_eq!(snapshot.posts[0].thumbnail_url.as_deref(), Some("http://api/g/1234s.jpg"));
        assert!(snapshot.posts[2].is_saved_reply);
        assert_eq!(snapshot.posts[2].replies_to, vec![101]);
    }

    #[test]
    fn test_parse_thread_rejects_garbage() {
        let thread = ThreadDescriptor::new("site", "g", 1);
        let saved = SavedReplies::default();
        assert!(matches!(
            parse_thread("http://api", &thread, "<html>", &saved),
            Err(FetchError::Transient(_))
        ));
        assert!(matches!(
            parse_thread("http://api", &thread, r#"{"posts":[]}"#, &saved),
            Err(FetchError::Transient(_))
        ));
    }
}
