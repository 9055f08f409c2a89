//! Conduit in-RAM datastore.
//!
//! Readers scan an immutable `Dataset` snapshot; writers clone, mutate and swap it.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Result};
use arc_swap::ArcSwap;
use conduit_core::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::debug;

pub use conduit_core::NewArticle;

/// Everything the store knows at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub epoch: u64,
    users: FxHashMap<UserId, Author>,
    usernames: FxHashMap<String, UserId>,
    /// (follower, followee)
    follows: FxHashSet<(UserId, UserId)>,
    articles: Vec<Article>,
    slugs: FxHashMap<String, ArticleId>,
    /// (user, article)
    favorites: FxHashSet<(UserId, ArticleId)>,
    comments: Vec<Comment>,
}

impl Dataset {
    fn user_by_name(&self, username: &str) -> Option<&UserId> { self.usernames.get(username) }

    fn article_matches(&self, a: &Article, scope: &ArticleScope) -> bool {
        match scope {
            ArticleScope::FollowedBy(viewer) => self.follows.contains(&(viewer.clone(), a.author.id.clone())),
            ArticleScope::Recent(f) => {
                if let Some(tag) = &f.tag {
                    if !a.tag_list.iter().any(|t| t == tag) { return false; }
                }
                if let Some(author) = &f.author {
                    if &a.author.username != author { return false; }
                }
                if let Some(fav) = &f.favorited_by {
                    match self.user_by_name(fav) {
                        Some(uid) => if !self.favorites.contains(&(uid.clone(), a.id.clone())) { return false; },
                        None => return false,
                    }
                }
                true
            }
        }
    }
}

/// Apply bound, order and limit to candidate rows.
pub fn apply_scan<'a, T, I, S>(rows: I, scan: &RangeScan<S>) -> Vec<T>
where
    T: Keyed + Clone + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut out: Vec<&T> = rows
        .into_iter()
        .filter(|r| scan.bound.as_ref().map_or(true, |b| b.admits(r.created_at(), r.key_id())))
        .collect();
    out.sort_unstable_by(|a, b| (a.created_at(), a.key_id()).cmp(&(b.created_at(), b.key_id())));
    if scan.order == ScanOrder::Descending { out.reverse(); }
    if let Some(n) = scan.limit { out.truncate(n); }
    out.into_iter().cloned().collect()
}

pub struct MemStore {
    snap: ArcSwap<Dataset>,
    writer: Mutex<()>,
}

impl Default for MemStore {
    fn default() -> Self { Self::new() }
}

impl MemStore {
    pub fn new() -> Self { Self { snap: ArcSwap::from_pointee(Dataset::default()), writer: Mutex::new(()) } }

    pub fn current(&self) -> Arc<Dataset> { self.snap.load_full() }

    fn write<R>(&self, f: impl FnOnce(&mut Dataset) -> Result<R>) -> Result<R> {
        let _guard = self.writer.lock().map_err(|_| anyhow!("memstore writer poisoned"))?;
        let mut next = (*self.snap.load_full()).clone();
        let out = f(&mut next)?;
        next.epoch = next.epoch.saturating_add(1);
        debug!(epoch = next.epoch, "memstore swap");
        self.snap.store(Arc::new(next));
        Ok(out)
    }

    pub fn user_by_username(&self, username: &str) -> Option<Author> {
        let d = self.current();
        d.user_by_name(username).and_then(|id| d.users.get(id)).cloned()
    }

    pub fn article_by_slug(&self, slug: &str) -> Option<Article> {
        let d = self.current();
        let id = d.slugs.get(slug)?;
        d.articles.iter().find(|a| &a.id == id).cloned()
    }

    pub fn create_user(&self, username: &str) -> Result<Author> {
        self.write(|d| {
            if d.usernames.contains_key(username) { bail!("username '{}' already taken", username); }
            let author = Author { id: UserId(uuid::Uuid::new_v4().to_string()), username: username.to_string(), bio: None, image: None };
            d.usernames.insert(author.username.clone(), author.id.clone());
            d.users.insert(author.id.clone(), author.clone());
            Ok(author)
        })
    }

    pub fn follow(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.write(|d| {
            if !d.users.contains_key(follower) || !d.users.contains_key(followee) { bail!("unknown user"); }
            d.follows.insert((follower.clone(), followee.clone()));
            Ok(())
        })
    }

    pub fn unfollow(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.write(|d| { d.follows.remove(&(follower.clone(), followee.clone())); Ok(()) })
    }

    pub fn create_article(&self, author: &UserId, new: NewArticle) -> Result<Article> {
        self.create_article_at(author, new, conduit_core::now_ms())
    }

    /// Create an article with an explicit creation time (ms precision).
    pub fn create_article_at(&self, author: &UserId, new: NewArticle, at: Timestamp) -> Result<Article> {
        let at = conduit_core::truncate_ms(at);
        self.write(|d| {
            let author = d.users.get(author).cloned().ok_or_else(|| anyhow!("unknown author {}", author))?;
            let id = ArticleId(uuid::Uuid::new_v4().to_string());
            let mut slug = conduit_core::slugify(&new.title);
            if d.slugs.contains_key(&slug) { slug = format!("{}-{}", slug, &id.as_str()[..8]); }
            let mut tags: SmallVec<[String; 4]> = new.tags.into_iter().collect();
            tags.sort_unstable();
            tags.dedup();
            let article = Article {
                id, slug, title: new.title, description: new.description, body: new.body,
                tag_list: tags, author, created_at: at, updated_at: at,
            };
            d.slugs.insert(article.slug.clone(), article.id.clone());
            d.articles.push(article.clone());
            Ok(article)
        })
    }

    pub fn favorite(&self, user: &UserId, article: &ArticleId) -> Result<()> {
        self.write(|d| {
            if !d.articles.iter().any(|a| &a.id == article) { bail!("unknown article {}", article); }
            d.favorites.insert((user.clone(), article.clone()));
            Ok(())
        })
    }

    pub fn unfavorite(&self, user: &UserId, article: &ArticleId) -> Result<()> {
        self.write(|d| { d.favorites.remove(&(user.clone(), article.clone())); Ok(()) })
    }

    pub fn add_comment(&self, author: &UserId, article: &ArticleId, body: &str) -> Result<Comment> {
        self.add_comment_at(author, article, body, conduit_core::now_ms())
    }

    pub fn add_comment_at(&self, author: &UserId, article: &ArticleId, body: &str, at: Timestamp) -> Result<Comment> {
        let at = conduit_core::truncate_ms(at);
        self.write(|d| {
            let author = d.users.get(author).cloned().ok_or_else(|| anyhow!("unknown author {}", author))?;
            if !d.articles.iter().any(|a| &a.id == article) { bail!("unknown article {}", article); }
            let c = Comment {
                id: CommentId(uuid::Uuid::new_v4().to_string()),
                article_id: article.clone(),
                body: body.to_string(),
                author,
                created_at: at,
            };
            d.comments.push(c.clone());
            Ok(c)
        })
    }
}

impl Datastore for MemStore {
    fn scan_articles(&self, scan: &RangeScan<ArticleScope>) -> StoreResult<Vec<Article>> {
        let d = self.current();
        Ok(apply_scan(d.articles.iter().filter(|a| d.article_matches(a, &scan.scope)), scan))
    }

    fn scan_comments(&self, scan: &RangeScan<CommentScope>) -> StoreResult<Vec<Comment>> {
        let d = self.current();
        Ok(apply_scan(d.comments.iter().filter(|c| c.article_id == scan.scope.article), scan))
    }

    fn favorite_counts(&self, articles: &[ArticleId]) -> StoreResult<FxHashMap<ArticleId, u64>> {
        let d = self.current();
        let wanted: FxHashSet<&ArticleId> = articles.iter().collect();
        let mut out: FxHashMap<ArticleId, u64> = FxHashMap::default();
        for (_, a) in d.favorites.iter().filter(|(_, a)| wanted.contains(a)) {
            *out.entry(a.clone()).or_default() += 1;
        }
        Ok(out)
    }

    fn favorited_by(&self, viewer: &UserId, articles: &[ArticleId]) -> StoreResult<FxHashSet<ArticleId>> {
        let d = self.current();
        Ok(articles.iter().filter(|a| d.favorites.contains(&(viewer.clone(), (*a).clone()))).cloned().collect())
    }

    fn followed_among(&self, viewer: &UserId, authors: &[UserId]) -> StoreResult<FxHashSet<UserId>> {
        let d = self.current();
        Ok(authors.iter().filter(|u| d.follows.contains(&(viewer.clone(), (*u).clone()))).cloned().collect())
    }
}
