//! Conduit persistence: SQLite-backed `Datastore`.
//! Range scans compile to one bounded `ORDER BY created_at, id LIMIT n` query.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use chrono::DateTime;
use conduit_core::prelude::*;
use metrics::{counter, histogram};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{debug, info};

/// SQLite caps bound parameters per statement; batch lookups are chunked below it.
const FACT_CHUNK: usize = 500;

const TAG_SEP: char = '\u{1f}';

const ARTICLE_SELECT: &str = "SELECT a.id, a.slug, a.title, a.description, a.body, a.created_at, a.updated_at,
        u.id, u.username, u.bio, u.image,
        (SELECT group_concat(t.tag, char(31)) FROM article_tags t WHERE t.article_id = a.id)
   FROM articles a JOIN users u ON u.id = a.author_id
  WHERE 1 = 1";

const COMMENT_SELECT: &str = "SELECT c.id, c.article_id, c.body, c.created_at, u.id, u.username, u.bio, u.image
   FROM comments c JOIN users u ON u.id = c.author_id
  WHERE 1 = 1";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id       TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    bio      TEXT,
    image    TEXT
);
CREATE TABLE IF NOT EXISTS follows (
    follower TEXT NOT NULL,
    followee TEXT NOT NULL,
    PRIMARY KEY (follower, followee)
);
CREATE TABLE IF NOT EXISTS articles (
    id          TEXT PRIMARY KEY,
    slug        TEXT NOT NULL UNIQUE,
    title       TEXT NOT NULL,
    description TEXT NOT NULL,
    body        TEXT NOT NULL,
    author_id   TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_articles_created ON articles(created_at, id);
CREATE INDEX IF NOT EXISTS idx_articles_author ON articles(author_id, created_at, id);
CREATE TABLE IF NOT EXISTS article_tags (
    article_id TEXT NOT NULL,
    tag        TEXT NOT NULL,
    PRIMARY KEY (article_id, tag)
);
CREATE INDEX IF NOT EXISTS idx_article_tags_tag ON article_tags(tag);
CREATE TABLE IF NOT EXISTS favorites (
    user_id    TEXT NOT NULL,
    article_id TEXT NOT NULL,
    PRIMARY KEY (user_id, article_id)
);
CREATE INDEX IF NOT EXISTS idx_favorites_article ON favorites(article_id);
CREATE TABLE IF NOT EXISTS comments (
    id         TEXT PRIMARY KEY,
    article_id TEXT NOT NULL,
    author_id  TEXT NOT NULL,
    body       TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_comments_article ON comments(article_id, created_at, id);
";

/// SQLite-backed store. Synchronous; one connection behind a mutex.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("CONDUIT_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = Instant::now();
        let db = Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::bootstrap(db, started)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("opening in-memory sqlite db")?;
        Self::bootstrap(db, Instant::now())
    }

    fn bootstrap(db: Connection, started: Instant) -> Result<Self> {
        db.execute_batch(SCHEMA).context("creating conduit schema")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!("sqlite store ready");
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| StoreError::Unavailable("sqlite connection poisoned".into()))
    }

    // ---- writes ----

    pub fn create_user(&self, username: &str, bio: Option<&str>, image: Option<&str>) -> Result<Author> {
        let author = Author {
            id: UserId(uuid::Uuid::new_v4().to_string()),
            username: username.to_string(),
            bio: bio.map(str::to_string),
            image: image.map(str::to_string),
        };
        self.lock()?
            .execute(
                "INSERT INTO users(id, username, bio, image) VALUES (?1, ?2, ?3, ?4)",
                params![author.id.as_str(), author.username, author.bio, author.image],
            )
            .with_context(|| format!("creating user '{}'", username))?;
        counter!("persist_put_total", 1u64, "table" => "users");
        Ok(author)
    }

    pub fn user_by_username(&self, username: &str) -> Result<Option<Author>> {
        let db = self.lock()?;
        let found = db
            .query_row("SELECT id, username, bio, image FROM users WHERE username = ?1", [username], |r| author_from_row(r, 0))
            .optional()?;
        Ok(found)
    }

    pub fn follow(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO follows(follower, followee) VALUES (?1, ?2)",
            params![follower.as_str(), followee.as_str()],
        )?;
        counter!("persist_put_total", 1u64, "table" => "follows");
        Ok(())
    }

    pub fn unfollow(&self, follower: &UserId, followee: &UserId) -> Result<()> {
        self.lock()?.execute(
            "DELETE FROM follows WHERE follower = ?1 AND followee = ?2",
            params![follower.as_str(), followee.as_str()],
        )?;
        Ok(())
    }

    pub fn create_article(&self, author: &UserId, new: NewArticle) -> Result<Article> {
        self.create_article_at(author, new, conduit_core::now_ms())
    }

    pub fn create_article_at(&self, author: &UserId, new: NewArticle, at: Timestamp) -> Result<Article> {
        let at = conduit_core::truncate_ms(at);
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let author = tx
            .query_row("SELECT id, username, bio, image FROM users WHERE id = ?1", [author.as_str()], |r| author_from_row(r, 0))
            .optional()?
            .ok_or_else(|| anyhow!("unknown author {}", author))?;
        let id = ArticleId(uuid::Uuid::new_v4().to_string());
        let mut slug = conduit_core::slugify(&new.title);
        let taken: bool = tx.query_row("SELECT EXISTS(SELECT 1 FROM articles WHERE slug = ?1)", [&slug], |r| r.get(0))?;
        if taken { slug = format!("{}-{}", slug, &id.as_str()[..8]); }
        tx.execute(
            "INSERT INTO articles(id, slug, title, description, body, author_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![id.as_str(), slug, new.title, new.description, new.body, author.id.as_str(), at.timestamp_millis()],
        )?;
        let mut tags: SmallVec<[String; 4]> = new.tags.into_iter().collect();
        tags.sort_unstable();
        tags.dedup();
        for tag in tags.iter() {
            tx.execute("INSERT INTO article_tags(article_id, tag) VALUES (?1, ?2)", params![id.as_str(), tag])?;
        }
        tx.commit()?;
        counter!("persist_put_total", 1u64, "table" => "articles");
        debug!(slug = %slug, "article created");
        Ok(Article {
            id, slug, title: new.title, description: new.description, body: new.body,
            tag_list: tags, author, created_at: at, updated_at: at,
        })
    }

    pub fn article_by_slug(&self, slug: &str) -> Result<Option<Article>> {
        let db = self.lock()?;
        let sql = format!("{} AND a.slug = ?1", ARTICLE_SELECT);
        Ok(db.query_row(&sql, [slug], article_from_row).optional()?)
    }

    pub fn favorite(&self, user: &UserId, article: &ArticleId) -> Result<()> {
        let db = self.lock()?;
        let exists: bool = db.query_row("SELECT EXISTS(SELECT 1 FROM articles WHERE id = ?1)", [article.as_str()], |r| r.get(0))?;
        if !exists { bail!("unknown article {}", article); }
        db.execute(
            "INSERT OR IGNORE INTO favorites(user_id, article_id) VALUES (?1, ?2)",
            params![user.as_str(), article.as_str()],
        )?;
        counter!("persist_put_total", 1u64, "table" => "favorites");
        Ok(())
    }

    pub fn unfavorite(&self, user: &UserId, article: &ArticleId) -> Result<()> {
        self.lock()?.execute(
            "DELETE FROM favorites WHERE user_id = ?1 AND article_id = ?2",
            params![user.as_str(), article.as_str()],
        )?;
        Ok(())
    }

    pub fn add_comment(&self, author: &UserId, article: &ArticleId, body: &str) -> Result<Comment> {
        self.add_comment_at(author, article, body, conduit_core::now_ms())
    }

    pub fn add_comment_at(&self, author: &UserId, article: &ArticleId, body: &str, at: Timestamp) -> Result<Comment> {
        let at = conduit_core::truncate_ms(at);
        let db = self.lock()?;
        let author = db
            .query_row("SELECT id, username, bio, image FROM users WHERE id = ?1", [author.as_str()], |r| author_from_row(r, 0))
            .optional()?
            .ok_or_else(|| anyhow!("unknown author {}", author))?;
        let exists: bool = db.query_row("SELECT EXISTS(SELECT 1 FROM articles WHERE id = ?1)", [article.as_str()], |r| r.get(0))?;
        if !exists { bail!("unknown article {}", article); }
        let id = CommentId(uuid::Uuid::new_v4().to_string());
        db.execute(
            "INSERT INTO comments(id, article_id, author_id, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id.as_str(), article.as_str(), author.id.as_str(), body, at.timestamp_millis()],
        )?;
        counter!("persist_put_total", 1u64, "table" => "comments");
        Ok(Comment { id, article_id: article.clone(), body: body.to_string(), author, created_at: at })
    }
}

/// Incrementally built statement with positional parameters.
struct Query {
    sql: String,
    params: Vec<Value>,
}

impl Query {
    fn new(base: &str) -> Self { Self { sql: base.to_string(), params: Vec::new() } }

    fn and(&mut self, clause: &str, params: impl IntoIterator<Item = Value>) {
        self.sql.push_str(" AND ");
        self.sql.push_str(clause);
        self.params.extend(params);
    }

    fn bound(&mut self, at_col: &str, id_col: &str, bound: Option<&ScanBound>) {
        let (op, key) = match bound {
            Some(ScanBound::Below(k)) => ("<", k),
            Some(ScanBound::Above(k)) => (">", k),
            None => return,
        };
        let ms = Value::Integer(key.at.timestamp_millis());
        match &key.id {
            Some(id) => self.and(
                &format!("({at} {op} ? OR ({at} = ? AND {id_col} {op} ?))", at = at_col),
                [ms.clone(), ms, Value::Text(id.clone())],
            ),
            None => self.and(&format!("{} {} ?", at_col, op), [ms]),
        }
    }

    fn order_limit(&mut self, at_col: &str, id_col: &str, order: ScanOrder, limit: Option<usize>) {
        let dir = match order {
            ScanOrder::Ascending => "ASC",
            ScanOrder::Descending => "DESC",
        };
        self.sql.push_str(&format!(" ORDER BY {at} {dir}, {id} {dir}", at = at_col, id = id_col));
        if let Some(n) = limit {
            self.sql.push_str(" LIMIT ?");
            self.params.push(Value::Integer(i64::try_from(n).unwrap_or(i64::MAX)));
        }
    }
}

fn store_err(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(e.to_string()),
        other => StoreError::Unavailable(other.to_string()),
    }
}

fn millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<Timestamp> {
    let ms: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn author_from_row(row: &Row<'_>, at: usize) -> rusqlite::Result<Author> {
    Ok(Author {
        id: UserId(row.get(at)?),
        username: row.get(at + 1)?,
        bio: row.get(at + 2)?,
        image: row.get(at + 3)?,
    })
}

fn article_from_row(row: &Row<'_>) -> rusqlite::Result<Article> {
    let tags: Option<String> = row.get(11)?;
    let mut tag_list: SmallVec<[String; 4]> = tags
        .as_deref()
        .map(|s| s.split(TAG_SEP).filter(|t| !t.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    tag_list.sort_unstable();
    Ok(Article {
        id: ArticleId(row.get(0)?),
        slug: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        body: row.get(4)?,
        created_at: millis(row, 5)?,
        updated_at: millis(row, 6)?,
        author: author_from_row(row, 7)?,
        tag_list,
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: CommentId(row.get(0)?),
        article_id: ArticleId(row.get(1)?),
        body: row.get(2)?,
        created_at: millis(row, 3)?,
        author: author_from_row(row, 4)?,
    })
}

fn placeholders(n: usize) -> String { vec!["?"; n].join(", ") }

impl SqliteStore {
    fn run_scan<T>(&self, q: Query, collection: &'static str, map: fn(&Row<'_>) -> rusqlite::Result<T>) -> StoreResult<Vec<T>> {
        let started = Instant::now();
        let db = self.lock()?;
        let mut stmt = db.prepare(&q.sql).map_err(store_err)?;
        let rows = stmt.query_map(params_from_iter(q.params.iter()), map).map_err(store_err)?;
        let out = rows.collect::<rusqlite::Result<Vec<T>>>().map_err(store_err)?;
        histogram!("persist_scan_ms", started.elapsed().as_secs_f64() * 1000.0, "collection" => collection);
        debug!(collection, rows = out.len(), "range scan");
        Ok(out)
    }

    /// Run `sql_for(n)` once per chunk of `ids`, with `lead` bound before the id list.
    fn chunked<K, R>(
        &self,
        ids: &[K],
        lead: Option<&str>,
        sql_for: impl Fn(usize) -> String,
        mut each: impl FnMut(&Row<'_>) -> rusqlite::Result<R>,
        mut sink: impl FnMut(R),
    ) -> StoreResult<()>
    where
        K: AsRef<str>,
    {
        let db = self.lock()?;
        for chunk in ids.chunks(FACT_CHUNK) {
            let mut params: Vec<Value> = Vec::with_capacity(chunk.len() + 1);
            if let Some(l) = lead { params.push(Value::Text(l.to_string())); }
            params.extend(chunk.iter().map(|k| Value::Text(k.as_ref().to_string())));
            let mut stmt = db.prepare(&sql_for(chunk.len())).map_err(store_err)?;
            let mut rows = stmt.query(params_from_iter(params.iter())).map_err(store_err)?;
            while let Some(row) = rows.next().map_err(store_err)? {
                sink(each(row).map_err(store_err)?);
            }
        }
        Ok(())
    }
}

impl Datastore for SqliteStore {
    fn scan_articles(&self, scan: &RangeScan<ArticleScope>) -> StoreResult<Vec<Article>> {
        let mut q = Query::new(ARTICLE_SELECT);
        match &scan.scope {
            ArticleScope::Recent(f) => {
                if let Some(tag) = &f.tag {
                    q.and("EXISTS (SELECT 1 FROM article_tags t WHERE t.article_id = a.id AND t.tag = ?)", [Value::Text(tag.clone())]);
                }
                if let Some(author) = &f.author {
                    q.and("u.username = ?", [Value::Text(author.clone())]);
                }
                if let Some(fav) = &f.favorited_by {
                    q.and(
                        "EXISTS (SELECT 1 FROM favorites f JOIN users fu ON fu.id = f.user_id WHERE f.article_id = a.id AND fu.username = ?)",
                        [Value::Text(fav.clone())],
                    );
                }
            }
            ArticleScope::FollowedBy(viewer) => {
                q.and("a.author_id IN (SELECT followee FROM follows WHERE follower = ?)", [Value::Text(viewer.0.clone())]);
            }
        }
        q.bound("a.created_at", "a.id", scan.bound.as_ref());
        q.order_limit("a.created_at", "a.id", scan.order, scan.limit);
        self.run_scan(q, "articles", article_from_row)
    }

    fn scan_comments(&self, scan: &RangeScan<CommentScope>) -> StoreResult<Vec<Comment>> {
        let mut q = Query::new(COMMENT_SELECT);
        q.and("c.article_id = ?", [Value::Text(scan.scope.article.0.clone())]);
        q.bound("c.created_at", "c.id", scan.bound.as_ref());
        q.order_limit("c.created_at", "c.id", scan.order, scan.limit);
        self.run_scan(q, "comments", comment_from_row)
    }

    fn favorite_counts(&self, articles: &[ArticleId]) -> StoreResult<FxHashMap<ArticleId, u64>> {
        let mut out = FxHashMap::default();
        self.chunked(
            articles,
            None,
            |n| format!("SELECT article_id, COUNT(*) FROM favorites WHERE article_id IN ({}) GROUP BY article_id", placeholders(n)),
            |r| Ok((ArticleId(r.get(0)?), r.get::<_, i64>(1)?)),
            |(id, n)| { out.insert(id, u64::try_from(n).unwrap_or(0)); },
        )?;
        Ok(out)
    }

    fn favorited_by(&self, viewer: &UserId, articles: &[ArticleId]) -> StoreResult<FxHashSet<ArticleId>> {
        let mut out = FxHashSet::default();
        self.chunked(
            articles,
            Some(viewer.as_str()),
            |n| format!("SELECT article_id FROM favorites WHERE user_id = ? AND article_id IN ({})", placeholders(n)),
            |r| Ok(ArticleId(r.get(0)?)),
            |id| { out.insert(id); },
        )?;
        Ok(out)
    }

    fn followed_among(&self, viewer: &UserId, authors: &[UserId]) -> StoreResult<FxHashSet<UserId>> {
        let mut out = FxHashSet::default();
        self.chunked(
            authors,
            Some(viewer.as_str()),
            |n| format!("SELECT followee FROM follows WHERE follower = ? AND followee IN ({})", placeholders(n)),
            |r| Ok(UserId(r.get(0)?)),
            |id| { out.insert(id); },
        )?;
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".conduit");
        let _ = std::fs::create_dir_all(&p);
        p.push("conduit.db");
        return p.to_string_lossy().to_string();
    }
    "conduit.db".to_string()
}
