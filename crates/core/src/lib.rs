//! Conduit core types
//!
//! Entities (articles, comments, authors), the cursor codec, page request/result
//! values and the `Datastore` seam the feed engine reads through.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod cursor;
pub mod error;
pub mod page;

pub use cursor::{Collection, Cursor};
pub use error::{CursorError, FeedError, FeedResult, StoreError, StoreResult};
pub use page::{Connection, Direction, Edge, PageInfo, PageRequest, PageResult};

/// Ordering key time. Always carried at millisecond precision.
pub type Timestamp = DateTime<Utc>;

/// Current time truncated to whole milliseconds.
pub fn now_ms() -> Timestamp { truncate_ms(Utc::now()) }

pub fn truncate_ms(t: Timestamp) -> Timestamp {
    DateTime::from_timestamp_millis(t.timestamp_millis()).unwrap_or(t)
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str { &self.0 }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str { &self.0 }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self { Self(s.to_string()) }
        }
    };
}

string_id!(UserId);
string_id!(ArticleId);
string_id!(CommentId);

/// Public profile of a user as embedded in articles and comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub username: String,
    pub bio: Option<String>,
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: ArticleId,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub body: String,
    /// Tag names, sorted.
    pub tag_list: SmallVec<[String; 4]>,
    pub author: Author,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub article_id: ArticleId,
    pub body: String,
    pub author: Author,
    pub created_at: Timestamp,
}

/// Fields for a new article; the store assigns id, slug and timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewArticle {
    pub title: String,
    pub description: String,
    pub body: String,
    pub tags: Vec<String>,
}

/// Entities that live in a creation-time ordered collection.
///
/// The total order is `(created_at, key_id)`; the id breaks timestamp ties.
pub trait Keyed {
    const COLLECTION: Collection;
    fn created_at(&self) -> Timestamp;
    fn key_id(&self) -> &str;
}

/// Entities that carry viewer-relative relationship facts.
pub trait Relational: Keyed {
    fn author_id(&self) -> &UserId;
    /// The article whose favorites apply to this entity, if any.
    fn favorite_target(&self) -> Option<&ArticleId> { None }
}

impl Keyed for Article {
    const COLLECTION: Collection = Collection::Articles;
    fn created_at(&self) -> Timestamp { self.created_at }
    fn key_id(&self) -> &str { self.id.as_str() }
}

impl Relational for Article {
    fn author_id(&self) -> &UserId { &self.author.id }
    fn favorite_target(&self) -> Option<&ArticleId> { Some(&self.id) }
}

impl Keyed for Comment {
    const COLLECTION: Collection = Collection::Comments;
    fn created_at(&self) -> Timestamp { self.created_at }
    fn key_id(&self) -> &str { self.id.as_str() }
}

impl Relational for Comment {
    fn author_id(&self) -> &UserId { &self.author.id }
}

/// Optional article predicates; combinable, all must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedFilter {
    pub tag: Option<String>,
    pub author: Option<String>,
    pub favorited_by: Option<String>,
}

impl FeedFilter {
    pub fn is_empty(&self) -> bool { self.tag.is_none() && self.author.is_none() && self.favorited_by.is_none() }
}

/// The requesting principal, resolved by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ViewerContext {
    #[default]
    Anonymous,
    User(UserId),
}

impl ViewerContext {
    pub fn user(id: impl Into<String>) -> Self { Self::User(UserId(id.into())) }
    pub fn id(&self) -> Option<&UserId> {
        match self {
            Self::Anonymous => None,
            Self::User(id) => Some(id),
        }
    }
}

/// Viewer-relative facts. All false/zero for an anonymous viewer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipFacts {
    pub is_favorited_by_viewer: bool,
    pub favorite_count: u64,
    pub is_author_followed_by_viewer: bool,
}

/// An entity merged with the viewer's relationship facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Enriched<T> {
    #[serde(flatten)]
    pub item: T,
    #[serde(flatten)]
    pub facts: RelationshipFacts,
}

pub type EnrichedArticle = Enriched<Article>;
pub type EnrichedComment = Enriched<Comment>;

impl<T: Keyed> Keyed for Enriched<T> {
    const COLLECTION: Collection = T::COLLECTION;
    fn created_at(&self) -> Timestamp { self.item.created_at() }
    fn key_id(&self) -> &str { self.item.key_id() }
}

// ---- datastore seam ----

/// Which articles a scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArticleScope {
    Recent(FeedFilter),
    /// Articles authored by anyone the given user follows.
    FollowedBy(UserId),
}

/// Comments of a single article.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentScope {
    pub article: ArticleId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// A position on the `(created_at, id)` order. Without an id only the timestamp is compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBound {
    pub at: Timestamp,
    pub id: Option<String>,
}

/// Exclusive bound on the ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanBound {
    /// Strictly older than the key.
    Below(KeyBound),
    /// Strictly newer than the key.
    Above(KeyBound),
}

impl ScanBound {
    pub fn admits(&self, at: Timestamp, id: &str) -> bool {
        match self {
            Self::Below(k) => at < k.at || (at == k.at && k.id.as_deref().is_some_and(|kid| id < kid)),
            Self::Above(k) => at > k.at || (at == k.at && k.id.as_deref().is_some_and(|kid| id > kid)),
        }
    }
}

/// One bounded, ordered range scan. `limit: None` means all matching rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScan<S> {
    pub scope: S,
    pub bound: Option<ScanBound>,
    pub order: ScanOrder,
    pub limit: Option<usize>,
}

/// The data the feed engine consumes. Implementations return rows already
/// ordered by `(created_at, id)` in `scan.order`, bounded and limited.
pub trait Datastore: Send + Sync {
    fn scan_articles(&self, scan: &RangeScan<ArticleScope>) -> StoreResult<Vec<Article>>;
    fn scan_comments(&self, scan: &RangeScan<CommentScope>) -> StoreResult<Vec<Comment>>;
    /// Favorite counts per article; absent ids have no favorites.
    fn favorite_counts(&self, articles: &[ArticleId]) -> StoreResult<FxHashMap<ArticleId, u64>>;
    /// Subset of `articles` the viewer has favorited.
    fn favorited_by(&self, viewer: &UserId, articles: &[ArticleId]) -> StoreResult<FxHashSet<ArticleId>>;
    /// Subset of `authors` the viewer follows.
    fn followed_among(&self, viewer: &UserId, authors: &[UserId]) -> StoreResult<FxHashSet<UserId>>;
}

impl<T: Datastore + ?Sized> Datastore for std::sync::Arc<T> {
    fn scan_articles(&self, scan: &RangeScan<ArticleScope>) -> StoreResult<Vec<Article>> { (**self).scan_articles(scan) }
    fn scan_comments(&self, scan: &RangeScan<CommentScope>) -> StoreResult<Vec<Comment>> { (**self).scan_comments(scan) }
    fn favorite_counts(&self, articles: &[ArticleId]) -> StoreResult<FxHashMap<ArticleId, u64>> { (**self).favorite_counts(articles) }
    fn favorited_by(&self, viewer: &UserId, articles: &[ArticleId]) -> StoreResult<FxHashSet<ArticleId>> { (**self).favorited_by(viewer, articles) }
    fn followed_among(&self, viewer: &UserId, authors: &[UserId]) -> StoreResult<FxHashSet<UserId>> { (**self).followed_among(viewer, authors) }
}

/// URL-friendly slug from a title: lowercase ascii alphanumerics joined by '-'.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('-') {
            out.push('-');
        }
    }
    while out.ends_with('-') { out.pop(); }
    if out.is_empty() { out.push_str("article"); }
    out
}

pub mod prelude {
    pub use super::{
        Article, ArticleId, ArticleScope, Author, Collection, Comment, CommentId, CommentScope, Cursor, CursorError, Datastore,
        Direction, Enriched, EnrichedArticle, EnrichedComment, FeedError, FeedFilter, FeedResult, KeyBound, Keyed,
        NewArticle, PageRequest, PageResult, RangeScan, Relational, RelationshipFacts, ScanBound, ScanOrder, StoreError,
        StoreResult, Timestamp, UserId, ViewerContext,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: i64) -> Timestamp { DateTime::from_timestamp_millis(ms).unwrap() }

    #[test]
    fn bound_without_id_is_strict_on_time() {
        let b = ScanBound::Below(KeyBound { at: at(100), id: None });
        assert!(b.admits(at(99), "z"));
        assert!(!b.admits(at(100), "a"));
        let b = ScanBound::Above(KeyBound { at: at(100), id: None });
        assert!(b.admits(at(101), "a"));
        assert!(!b.admits(at(100), "z"));
    }

    #[test]
    fn bound_with_id_breaks_ties() {
        let b = ScanBound::Below(KeyBound { at: at(100), id: Some("m".into()) });
        assert!(b.admits(at(100), "a"));
        assert!(!b.admits(at(100), "m"));
        assert!(!b.admits(at(100), "z"));
        let b = ScanBound::Above(KeyBound { at: at(100), id: Some("m".into()) });
        assert!(b.admits(at(100), "z"));
        assert!(!b.admits(at(100), "m"));
    }

    #[test]
    fn slugify_titles() {
        assert_eq!(slugify("How to train your Dragon!"), "how-to-train-your-dragon");
        assert_eq!(slugify("  --  "), "article");
    }

    #[test]
    fn truncate_drops_sub_millisecond() {
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        assert_eq!(truncate_ms(t).timestamp_subsec_nanos(), 123_000_000);
    }
}
