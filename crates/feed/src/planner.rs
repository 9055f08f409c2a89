//! Feed query planner.
//!
//! `NEXT` scans strictly below the cursor, newest first. `PREV` scans strictly
//! above it, closest-to-cursor first, and the rows are reversed afterwards so
//! every page comes out newest-first. Without a cursor both directions start at
//! the newest row. One extra row is requested to learn whether more exist.

use conduit_core::{Direction, PageRequest, RangeScan, ScanBound, ScanOrder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan<S> {
    pub scan: RangeScan<S>,
    /// Page size; 0 means no truncation.
    pub limit: usize,
    has_cursor: bool,
}

/// Rows of one page in final (newest-first) order plus the truncation flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window<T> {
    pub rows: Vec<T>,
    pub has_next: bool,
    pub has_previous: bool,
}

pub fn plan<S>(scope: S, page: &PageRequest) -> Plan<S> {
    let (bound, order) = match (&page.cursor, page.direction) {
        (None, _) => (None, ScanOrder::Descending),
        (Some(c), Direction::Next) => (Some(ScanBound::Below(c.key_bound())), ScanOrder::Descending),
        (Some(c), Direction::Prev) => (Some(ScanBound::Above(c.key_bound())), ScanOrder::Ascending),
    };
    let limit = page.limit;
    let fetch = if limit == 0 { None } else { Some(limit.saturating_add(1)) };
    Plan { scan: RangeScan { scope, bound, order, limit: fetch }, limit, has_cursor: page.cursor.is_some() }
}

impl<S> Plan<S> {
    /// Trim the probe row and orient `rows` (as returned by the scan) newest-first.
    pub fn settle<T>(&self, mut rows: Vec<T>) -> Window<T> {
        // rows are in scan order, so the probe row is always the last one
        let extra = self.limit != 0 && rows.len() > self.limit;
        if extra {
            rows.truncate(self.limit);
        }
        let (has_next, has_previous) = match self.scan.order {
            ScanOrder::Descending => (extra, self.has_cursor),
            ScanOrder::Ascending => {
                rows.reverse();
                (self.has_cursor, extra)
            }
        };
        if rows.is_empty() {
            return Window { rows, has_next: false, has_previous: false };
        }
        Window { rows, has_next, has_previous }
    }
}
