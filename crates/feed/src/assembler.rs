//! Feed assembler: planner -> datastore -> enricher -> page.

use std::time::Instant;

use conduit_core::{
    ArticleId, ArticleScope, CommentScope, CursorError, Datastore, Enriched, EnrichedArticle, EnrichedComment, FeedError,
    FeedFilter, FeedResult, Keyed, PageRequest, PageResult, RangeScan, Relational, StoreResult, ViewerContext,
};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use crate::{enricher, planner, FeedConfig};

/// Entry point for the three list operations. Holds no mutable state; one call
/// is one planner -> scan -> fact-lookup chain.
pub struct FeedService<D> {
    store: D,
    config: FeedConfig,
}

impl<D: Datastore> FeedService<D> {
    pub fn new(store: D) -> Self { Self::with_config(store, FeedConfig::default()) }
    pub fn with_config(store: D, config: FeedConfig) -> Self { Self { store, config } }

    pub fn store(&self) -> &D { &self.store }
    pub fn config(&self) -> &FeedConfig { &self.config }

    /// Recent articles, optionally filtered by tag, author and favorited-by.
    pub fn fetch_recent_articles(
        &self,
        filter: &FeedFilter,
        page: &PageRequest,
        viewer: &ViewerContext,
    ) -> FeedResult<PageResult<EnrichedArticle>> {
        self.assemble("recent", ArticleScope::Recent(filter.clone()), page, viewer, |s, scan| s.scan_articles(scan))
    }

    /// Articles by authors the viewer follows. Anonymous viewers get an empty page.
    pub fn fetch_user_feed(&self, viewer: &ViewerContext, page: &PageRequest) -> FeedResult<PageResult<EnrichedArticle>> {
        let Some(me) = viewer.id() else {
            check_cursor::<EnrichedArticle>(page)?;
            debug!(feed = "user_feed", "anonymous viewer; empty page");
            return Ok(PageResult::empty());
        };
        self.assemble("user_feed", ArticleScope::FollowedBy(me.clone()), page, viewer, |s, scan| s.scan_articles(scan))
    }

    pub fn fetch_article_comments(
        &self,
        article: &ArticleId,
        page: &PageRequest,
        viewer: &ViewerContext,
    ) -> FeedResult<PageResult<EnrichedComment>> {
        let scope = CommentScope { article: article.clone() };
        self.assemble("comments", scope, page, viewer, |s, scan| s.scan_comments(scan))
    }

    fn assemble<S, T>(
        &self,
        feed: &'static str,
        scope: S,
        page: &PageRequest,
        viewer: &ViewerContext,
        scan: impl FnOnce(&D, &RangeScan<S>) -> StoreResult<Vec<T>>,
    ) -> FeedResult<PageResult<Enriched<T>>>
    where
        T: Relational,
    {
        let started = Instant::now();
        let result = self.run(scope, page, viewer, scan);
        match &result {
            Ok(p) => {
                counter!("feed_pages_total", 1u64, "feed" => feed);
                histogram!("feed_page_ms", started.elapsed().as_secs_f64() * 1000.0, "feed" => feed);
                debug!(feed, items = p.len(), has_next = p.has_next, has_previous = p.has_previous, "page assembled");
            }
            Err(e) => {
                counter!("feed_errors_total", 1u64, "feed" => feed, "kind" => e.kind());
                warn!(feed, error = %e, "page fetch failed");
            }
        }
        result
    }

    fn run<S, T>(
        &self,
        scope: S,
        page: &PageRequest,
        viewer: &ViewerContext,
        scan: impl FnOnce(&D, &RangeScan<S>) -> StoreResult<Vec<T>>,
    ) -> FeedResult<PageResult<Enriched<T>>>
    where
        T: Relational,
    {
        check_cursor::<T>(page)?;
        let page = PageRequest { limit: self.config.clamp(page.limit), ..page.clone() };
        let plan = planner::plan(scope, &page);
        let rows = scan(&self.store, &plan.scan)?;
        debug!(rows = rows.len(), limit = plan.limit, direction = ?page.direction, "range scan returned");
        let window = plan.settle(rows);
        let items = enricher::enrich(&self.store, window.rows, viewer)?;
        Ok(PageResult::from_items(items, window.has_next, window.has_previous))
    }
}

/// A cursor minted for one collection must not page another.
fn check_cursor<T: Keyed>(page: &PageRequest) -> FeedResult<()> {
    match &page.cursor {
        Some(c) if c.collection() != T::COLLECTION => Err(FeedError::MalformedCursor(CursorError::Collection {
            expected: T::COLLECTION,
            found: c.collection().tag().to_string(),
        })),
        _ => Ok(()),
    }
}
