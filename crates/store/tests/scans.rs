#![forbid(unsafe_code)]

use chrono::DateTime;
use conduit_core::prelude::*;
use conduit_store::{MemStore, NewArticle};

fn ms(v: i64) -> Timestamp { DateTime::from_timestamp_millis(v).unwrap() }

fn post(store: &MemStore, author: &UserId, title: &str, tags: &[&str], at: i64) -> Article {
    let new = NewArticle { title: title.into(), description: "d".into(), body: "b".into(), tags: tags.iter().map(|t| t.to_string()).collect() };
    store.create_article_at(author, new, ms(at)).unwrap()
}

fn scan(scope: ArticleScope, bound: Option<ScanBound>, order: ScanOrder, limit: Option<usize>) -> RangeScan<ArticleScope> {
    RangeScan { scope, bound, order, limit }
}

fn titles(rows: &[Article]) -> Vec<&str> { rows.iter().map(|a| a.title.as_str()).collect() }

#[test]
fn scans_are_ordered_bounded_and_limited() {
    let s = MemStore::new();
    let alice = s.create_user("alice").unwrap();
    for (i, t) in ["one", "two", "three", "four"].iter().enumerate() {
        post(&s, &alice.id, t, &[], (i as i64 + 1) * 10);
    }
    let all = s.scan_articles(&scan(ArticleScope::Recent(FeedFilter::default()), None, ScanOrder::Descending, None)).unwrap();
    assert_eq!(titles(&all), ["four", "three", "two", "one"]);

    let below = ScanBound::Below(KeyBound { at: ms(30), id: None });
    let rows = s.scan_articles(&scan(ArticleScope::Recent(FeedFilter::default()), Some(below), ScanOrder::Descending, Some(1))).unwrap();
    assert_eq!(titles(&rows), ["two"]);

    let above = ScanBound::Above(KeyBound { at: ms(10), id: None });
    let rows = s.scan_articles(&scan(ArticleScope::Recent(FeedFilter::default()), Some(above), ScanOrder::Ascending, Some(2))).unwrap();
    assert_eq!(titles(&rows), ["two", "three"]);
}

#[test]
fn filters_combine() {
    let s = MemStore::new();
    let alice = s.create_user("alice").unwrap();
    let bob = s.create_user("bob").unwrap();
    let a1 = post(&s, &alice.id, "rust tips", &["rust"], 1);
    post(&s, &alice.id, "go tips", &["go"], 2);
    post(&s, &bob.id, "rust news", &["rust"], 3);
    s.favorite(&bob.id, &a1.id).unwrap();

    let by_tag = FeedFilter { tag: Some("rust".into()), ..Default::default() };
    let rows = s.scan_articles(&scan(ArticleScope::Recent(by_tag), None, ScanOrder::Descending, None)).unwrap();
    assert_eq!(titles(&rows), ["rust news", "rust tips"]);

    let combo = FeedFilter { tag: Some("rust".into()), author: Some("alice".into()), favorited_by: Some("bob".into()) };
    let rows = s.scan_articles(&scan(ArticleScope::Recent(combo), None, ScanOrder::Descending, None)).unwrap();
    assert_eq!(titles(&rows), ["rust tips"]);

    let ghost = FeedFilter { favorited_by: Some("nobody".into()), ..Default::default() };
    assert!(s.scan_articles(&scan(ArticleScope::Recent(ghost), None, ScanOrder::Descending, None)).unwrap().is_empty());
}

#[test]
fn followed_scope_and_facts() {
    let s = MemStore::new();
    let alice = s.create_user("alice").unwrap();
    let bob = s.create_user("bob").unwrap();
    let carol = s.create_user("carol").unwrap();
    let a = post(&s, &alice.id, "from alice", &[], 1);
    post(&s, &bob.id, "from bob", &[], 2);
    s.follow(&carol.id, &alice.id).unwrap();
    s.favorite(&carol.id, &a.id).unwrap();
    s.favorite(&bob.id, &a.id).unwrap();

    let rows = s.scan_articles(&scan(ArticleScope::FollowedBy(carol.id.clone()), None, ScanOrder::Descending, None)).unwrap();
    assert_eq!(titles(&rows), ["from alice"]);

    let counts = s.favorite_counts(&[a.id.clone()]).unwrap();
    assert_eq!(counts.get(&a.id), Some(&2));
    assert!(s.favorited_by(&carol.id, &[a.id.clone()]).unwrap().contains(&a.id));
    let followed = s.followed_among(&carol.id, &[alice.id.clone(), bob.id.clone()]).unwrap();
    assert!(followed.contains(&alice.id) && !followed.contains(&bob.id));
}

#[test]
fn writes_bump_epoch_and_keep_slugs_unique() {
    let s = MemStore::new();
    let alice = s.create_user("alice").unwrap();
    assert!(s.create_user("alice").is_err());
    let a = post(&s, &alice.id, "Same Title", &[], 1);
    let b = post(&s, &alice.id, "Same Title", &[], 2);
    assert_eq!(a.slug, "same-title");
    assert_ne!(a.slug, b.slug);
    assert_eq!(s.article_by_slug(&b.slug).map(|x| x.id), Some(b.id));
    assert_eq!(s.current().epoch, 3);
}
