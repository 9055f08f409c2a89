//! Conduit feed engine: turns "recent articles", "user feed" and "article comments"
//! into cursor-paginated, viewer-enriched pages.
//!
//! Cursors are best-effort positions, not snapshots: rows inserted between two
//! page fetches may or may not show up on later pages. Within one page fetch the
//! `limit + 1` probe and the page rows come from a single bounded scan.

#![forbid(unsafe_code)]

pub mod assembler;
pub mod enricher;
pub mod planner;

pub use assembler::FeedService;
pub use enricher::enrich;
pub use planner::{plan, Plan, Window};

/// Page size policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedConfig {
    /// Used by callers that receive no explicit limit.
    pub default_limit: usize,
    /// Upper bound for positive limits; 0 disables clamping.
    pub max_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self { Self { default_limit: 20, max_limit: 100 } }
}

impl FeedConfig {
    /// Read `CONDUIT_PAGE_LIMIT` / `CONDUIT_MAX_PAGE_LIMIT`, falling back to defaults.
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Unset or unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let read = |key: &str, fallback: usize| lookup(key).and_then(|s| s.trim().parse::<usize>().ok()).unwrap_or(fallback);
        Self { default_limit: read("CONDUIT_PAGE_LIMIT", d.default_limit), max_limit: read("CONDUIT_MAX_PAGE_LIMIT", d.max_limit) }
    }

    /// `0` keeps its "no limit" meaning and is never clamped.
    pub fn clamp(&self, limit: usize) -> usize {
        if self.max_limit == 0 || limit == 0 { limit } else { limit.min(self.max_limit) }
    }
}
