//! Integration tests for the HTTP thread source and board page cache.

use std::sync::Arc;
use std::time::Duration;

use thread_pin_watcher::collaborators::{PageInfoSource, PagesListener, ThreadDataSource};
use thread_pin_watcher::models::{FetchError, Loadable, ThreadDescriptor, ThreadPage};
use thread_pin_watcher::source::{BoardPageCache, HttpThreadSource, SavedReplies};
use tokio::sync::Notify;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const THREAD_JSON: &str = r##"{"posts":[
    {"no":500,"resto":0,"sub":"Pinned thread","com":"hello","tim":1700000000,"replies":3},
    {"no":501,"resto":500,"com":"first reply"},
    {"no":502,"resto":500,"com":"<a href=\"#p501\" class=\"quotelink\">&gt;&gt;501</a><br>my reply"},
    {"no":503,"resto":500,"com":"<a href=\"#p502\" class=\"quotelink\">&gt;&gt;502</a><br>replying to you"}
]}"##;

fn loadable(no: u64) -> Loadable {
    Loadable::new(1, ThreadDescriptor::new("test", "g", no))
}

#[tokio::test]
async fn test_fetch_parses_thread() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/g/thread/500.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(THREAD_JSON))
        .mount(&server)
        .await;

    let saved = Arc::new(SavedReplies::default());
    saved.add(&loadable(500).thread, 502);
    let source = HttpThreadSource::new(&server.uri(), Duration::from_secs(60), saved).unwrap();

    let snapshot = source.fetch(&loadable(500), false).await.unwrap();
    assert_eq!(snapshot.posts.len(), 4);
    assert_eq!(snapshot.reply_count, Some(3));
    assert_eq!(snapshot.op().unwrap().subject.as_deref(), Some("Pinned thread"));
    assert!(snapshot.posts[2].is_saved_reply);
    assert_eq!(snapshot.posts[3].replies_to, vec![502]);
    assert_eq!(snapshot.posts[3].comment, ">>502\nreplying to you");
}

#[tokio::test]
async fn test_missing_thread_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/g/thread/404.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let source = HttpThreadSource::new(
        &server.uri(),
        Duration::from_secs(60),
        Arc::new(SavedReplies::default()),
    )
    .unwrap();

    let err = source.fetch(&loadable(404), true).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/g/thread/1.json"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let source = HttpThreadSource::new(
        &server.uri(),
        Duration::from_secs(60),
        Arc::new(SavedReplies::default()),
    )
    .unwrap();

    let err = source.fetch(&loadable(1), true).await.unwrap_err();
    assert!(matches!(err, FetchError::Transient(_)));
}

#[tokio::test]
async fn test_throttle_applies_per_thread() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/g/thread/500.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(THREAD_JSON))
        .expect(2)
        .mount(&server)
        .await;

    let source = HttpThreadSource::new(
        &server.uri(),
        Duration::from_secs(60),
        Arc::new(SavedReplies::default()),
    )
    .unwrap();

    assert!(source.should_poll_now(&loadable(500)));
    source.fetch(&loadable(500), false).await.unwrap();
    assert!(!source.should_poll_now(&loadable(500)));
    assert!(source.should_poll_now(&loadable(501)));

    // Forced fetches still go out
    source.fetch(&loadable(500), true).await.unwrap();
}

struct NotifyingListener(Notify);

impl PagesListener for NotifyingListener {
    fn on_pages_received(&self) {
        self.0.notify_one();
    }
}

#[tokio::test]
async fn test_page_cache_refreshes_in_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/g/threads.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[
                {"page":1,"threads":[{"no":10},{"no":11}]},
                {"page":2,"threads":[{"no":12}]},
                {"page":3,"threads":[{"no":500}]}
            ]"#,
        ))
        .mount(&server)
        .await;

    let cache = BoardPageCache::new(&server.uri(), Duration::from_secs(60)).unwrap();
    let listener = Arc::new(NotifyingListener(Notify::new()));
    let id = cache.add_listener(listener.clone());

    let thread = ThreadDescriptor::new("test", "g", 500);
    assert!(cache.get_page(&thread).is_none());

    tokio::time::timeout(Duration::from_secs(5), listener.0.notified())
        .await
        .expect("pages never arrived");

    assert_eq!(
        cache.get_page(&thread),
        Some(ThreadPage {
            page: 3,
            total_pages: 3
        })
    );
    assert_eq!(
        cache.get_page(&ThreadDescriptor::new("test", "g", 12)),
        Some(ThreadPage {
            page: 2,
            total_pages: 3
        })
    );
    assert!(cache
        .get_page(&ThreadDescriptor::new("test", "g", 999))
        .is_none());

    cache.remove_listener(id);
}

#[tokio::test]
async fn test_page_refresh_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v/threads.json"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let cache = BoardPageCache::new(&server.uri(), Duration::from_secs(60)).unwrap();
    assert!(cache.refresh_board("test", "v").await.is_err());
    assert!(cache
        .get_page(&ThreadDescriptor::new("test", "v", 1))
        .is_none());
}

#[tokio::test]
async fn test_page_cache_keeps_sites_apart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/g/threads.json"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"[{"page":1,"threads":[{"no":10}]},{"page":2,"threads":[{"no":20}]}]"#,
        ))
        .mount(&server)
        .await;

    let cache = BoardPageCache::new(&server.uri(), Duration::from_secs(60)).unwrap();
    cache.refresh_board("first", "g").await.unwrap();

    assert_eq!(
        cache.get_page(&ThreadDescriptor::new("first", "g", 20)),
        Some(ThreadPage {
            page: 2,
            total_pages: 2
        })
    );
    assert!(cache
        .get_page(&ThreadDescriptor::new("second", "g", 20))
        .is_none());
}
