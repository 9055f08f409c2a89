#![forbid(unsafe_code)]

use std::sync::Mutex;

use chrono::DateTime;
use conduit_core::prelude::*;
use conduit_feed::FeedService;
use conduit_store::MemStore;
use rustc_hash::{FxHashMap, FxHashSet};

/// Records every datastore call and optionally fails one of them.
struct Probe {
    inner: MemStore,
    calls: Mutex<Vec<&'static str>>,
    fail: Option<&'static str>,
}

impl Probe {
    fn new(inner: MemStore) -> Self { Self { inner, calls: Mutex::new(Vec::new()), fail: None } }
    fn failing(inner: MemStore, call: &'static str) -> Self { Self { fail: Some(call), ..Self::new(inner) } }
    fn calls(&self) -> Vec<&'static str> { self.calls.lock().unwrap().clone() }

    fn hit(&self, call: &'static str) -> StoreResult<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail == Some(call) {
            return Err(StoreError::Unavailable(format!("{} timed out", call)));
        }
        Ok(())
    }
}

impl Datastore for Probe {
    fn scan_articles(&self, scan: &RangeScan<ArticleScope>) -> StoreResult<Vec<Article>> {
        self.hit("scan_articles")?;
        self.inner.scan_articles(scan)
    }
    fn scan_comments(&self, scan: &RangeScan<CommentScope>) -> StoreResult<Vec<Comment>> {
        self.hit("scan_comments")?;
        self.inner.scan_comments(scan)
    }
    fn favorite_counts(&self, articles: &[ArticleId]) -> StoreResult<FxHashMap<ArticleId, u64>> {
        self.hit("favorite_counts")?;
        self.inner.favorite_counts(articles)
    }
    fn favorited_by(&self, viewer: &UserId, articles: &[ArticleId]) -> StoreResult<FxHashSet<ArticleId>> {
        self.hit("favorited_by")?;
        self.inner.favorited_by(viewer, articles)
    }
    fn followed_among(&self, viewer: &UserId, authors: &[UserId]) -> StoreResult<FxHashSet<UserId>> {
        self.hit("followed_among")?;
        self.inner.followed_among(viewer, authors)
    }
}

fn seeded() -> (MemStore, UserId) {
    let s = MemStore::new();
    let alice = s.create_user("alice").unwrap();
    let bob = s.create_user("bob").unwrap();
    for i in 0..4 {
        let new = NewArticle { title: format!("a{}", i), ..Default::default() };
        let a = s.create_article_at(&alice.id, new, DateTime::from_timestamp_millis(i).unwrap()).unwrap();
        s.favorite(&bob.id, &a.id).unwrap();
    }
    (s, bob.id)
}

#[test]
fn anonymous_viewer_only_fetches_counts() {
    let (s, _) = seeded();
    let svc = FeedService::new(Probe::new(s));
    svc.fetch_recent_articles(&FeedFilter::default(), &PageRequest::first(10), &ViewerContext::Anonymous).unwrap();
    assert_eq!(svc.store().calls(), ["scan_articles", "favorite_counts"]);
}

#[test]
fn known_viewer_uses_one_batch_per_fact() {
    let (s, bob) = seeded();
    let svc = FeedService::new(Probe::new(s));
    let page = svc.fetch_recent_articles(&FeedFilter::default(), &PageRequest::first(10), &ViewerContext::User(bob)).unwrap();
    assert_eq!(page.len(), 4);
    assert!(page.items.iter().all(|a| a.facts.is_favorited_by_viewer && a.facts.favorite_count == 1));
    assert_eq!(svc.store().calls(), ["scan_articles", "favorite_counts", "favorited_by", "followed_among"]);
}

#[test]
fn comments_skip_favorite_lookups() {
    let (s, bob) = seeded();
    let article = s.article_by_slug("a0").unwrap();
    s.add_comment(&bob, &article.id, "hi").unwrap();
    let svc = FeedService::new(Probe::new(s));
    svc.fetch_article_comments(&article.id, &PageRequest::first(10), &ViewerContext::User(bob)).unwrap();
    assert_eq!(svc.store().calls(), ["scan_comments", "followed_among"]);
}

#[test]
fn empty_page_makes_no_fact_calls() {
    let svc = FeedService::new(Probe::new(MemStore::new()));
    svc.fetch_recent_articles(&FeedFilter::default(), &PageRequest::first(10), &ViewerContext::user("ghost")).unwrap();
    assert_eq!(svc.store().calls(), ["scan_articles"]);
}

#[test]
fn enrichment_failure_aborts_page() {
    let (s, bob) = seeded();
    let svc = FeedService::new(Probe::failing(s, "favorited_by"));
    let err = svc.fetch_recent_articles(&FeedFilter::default(), &PageRequest::first(10), &ViewerContext::User(bob)).unwrap_err();
    assert!(matches!(err, FeedError::DatastoreUnavailable(StoreError::Unavailable(_))));
    assert!(!err.is_client_error());
}

#[test]
fn scan_failure_propagates_unchanged() {
    let (s, _) = seeded();
    let svc = FeedService::new(Probe::failing(s, "scan_articles"));
    let err = svc.fetch_recent_articles(&FeedFilter::default(), &PageRequest::first(10), &ViewerContext::Anonymous).unwrap_err();
    assert_eq!(err, FeedError::DatastoreUnavailable(StoreError::Unavailable("scan_articles timed out".into())));
}

#[test]
fn bad_cursor_fails_before_any_datastore_call() {
    let (s, bob) = seeded();
    let svc = FeedService::new(Probe::new(s));
    let foreign = Cursor::at(Collection::Comments, DateTime::from_timestamp_millis(1).unwrap());
    assert!(svc.fetch_user_feed(&ViewerContext::User(bob), &PageRequest::next(foreign, 3)).is_err());
    assert!(svc.store().calls().is_empty());
}

#[test]
fn anonymous_user_feed_touches_nothing() {
    let (s, _) = seeded();
    let svc = FeedService::new(Probe::new(s));
    let page = svc.fetch_user_feed(&ViewerContext::Anonymous, &PageRequest::first(5)).unwrap();
    assert!(page.is_empty());
    assert!(svc.store().calls().is_empty());
}
