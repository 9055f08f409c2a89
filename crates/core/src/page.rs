//! Page request and page result values, plus the Relay-style connection view.

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, FeedResult};
use crate::{Collection, Cursor, Keyed};

/// Paging direction over a newest-first feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Older than the cursor.
    #[default]
    Next,
    /// Newer than the cursor.
    Prev,
}

impl std::str::FromStr for Direction {
    type Err = FeedError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "next" => Ok(Self::Next),
            "prev" | "previous" => Ok(Self::Prev),
            other => Err(FeedError::InvalidPageRequest(format!("unknown direction '{}'", other))),
        }
    }
}

/// Pagination intent. `limit == 0` disables truncation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<Cursor>,
    pub limit: usize,
    pub direction: Direction,
}

impl PageRequest {
    /// Newest page, no cursor.
    pub fn first(limit: usize) -> Self { Self { cursor: None, limit, direction: Direction::Next } }
    pub fn next(cursor: Cursor, limit: usize) -> Self { Self { cursor: Some(cursor), limit, direction: Direction::Next } }
    pub fn prev(cursor: Cursor, limit: usize) -> Self { Self { cursor: Some(cursor), limit, direction: Direction::Prev } }

    /// Build a request from raw transport parameters. Validation happens here,
    /// before anything touches the datastore.
    pub fn parse(collection: Collection, cursor: Option<&str>, limit: i64, direction: Direction) -> FeedResult<Self> {
        let limit = checked_limit(limit)?;
        let cursor = cursor.map(|t| Cursor::decode(t, collection)).transpose()?;
        Ok(Self { cursor, limit, direction })
    }

    /// Relay arguments: `first`/`after` page older, `last`/`before` page newer.
    /// A missing count falls back to `default_limit`.
    pub fn from_relay(
        collection: Collection,
        first: Option<i64>,
        after: Option<&str>,
        last: Option<i64>,
        before: Option<&str>,
        default_limit: usize,
    ) -> FeedResult<Self> {
        if after.is_some() && before.is_some() {
            return Err(FeedError::InvalidPageRequest("'after' and 'before' are mutually exclusive".into()));
        }
        if first.is_some() && last.is_some() {
            return Err(FeedError::InvalidPageRequest("'first' and 'last' are mutually exclusive".into()));
        }
        if first.is_some() && before.is_some() {
            return Err(FeedError::InvalidPageRequest("'first' pairs with 'after', not 'before'".into()));
        }
        if last.is_some() && after.is_some() {
            return Err(FeedError::InvalidPageRequest("'last' pairs with 'before', not 'after'".into()));
        }
        let (cursor, count, direction) = if before.is_some() || last.is_some() {
            (before, last, Direction::Prev)
        } else {
            (after, first, Direction::Next)
        };
        let limit = match count {
            Some(n) => checked_limit(n)?,
            None => default_limit,
        };
        let cursor = cursor.map(|t| Cursor::decode(t, collection)).transpose()?;
        Ok(Self { cursor, limit, direction })
    }

    pub fn is_unbounded(&self) -> bool { self.limit == 0 }
}

fn checked_limit(limit: i64) -> FeedResult<usize> {
    if limit < 0 {
        return Err(FeedError::InvalidPageRequest(format!("limit must not be negative (got {})", limit)));
    }
    usize::try_from(limit).map_err(|_| FeedError::InvalidPageRequest(format!("limit too large: {}", limit)))
}

/// A produced page. `items` are always newest-first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult<T> {
    pub items: Vec<T>,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> PageResult<T> {
    pub fn empty() -> Self {
        Self { items: Vec::new(), start_cursor: None, end_cursor: None, has_next: false, has_previous: false }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}

impl<T: Keyed> PageResult<T> {
    /// Assemble a page; cursors come from the first and last of `items`.
    pub fn from_items(items: Vec<T>, has_next: bool, has_previous: bool) -> Self {
        if items.is_empty() {
            return Self::empty();
        }
        let start_cursor = items.first().map(Cursor::for_item);
        let end_cursor = items.last().map(Cursor::for_item);
        Self { items, start_cursor, end_cursor, has_next, has_previous }
    }

    pub fn into_connection(self) -> Connection<T> {
        let page_info = PageInfo {
            has_next_page: self.has_next,
            has_previous_page: self.has_previous,
            start_cursor: self.start_cursor,
            end_cursor: self.end_cursor,
        };
        let edges = self.items.into_iter().map(|node| Edge { cursor: Cursor::for_item(&node), node }).collect();
        Connection { edges, page_info }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection<T> {
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct Edge<T> {
    pub node: T,
    pub cursor: Cursor,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CursorError;
    use crate::Timestamp;
    use chrono::DateTime;

    struct Row(i64, &'static str);

    impl Keyed for Row {
        const COLLECTION: Collection = Collection::Articles;
        fn created_at(&self) -> Timestamp { DateTime::from_timestamp_millis(self.0).unwrap() }
        fn key_id(&self) -> &str { self.1 }
    }

    #[test]
    fn negative_limit_is_rejected() {
        let err = PageRequest::parse(Collection::Articles, None, -1, Direction::Next).unwrap_err();
        assert!(matches!(err, FeedError::InvalidPageRequest(_)));
        assert!(err.is_client_error());
    }

    #[test]
    fn malformed_cursor_is_not_treated_as_absent() {
        let err = PageRequest::parse(Collection::Articles, Some("%%%"), 10, Direction::Next).unwrap_err();
        assert_eq!(err, FeedError::MalformedCursor(CursorError::Encoding));
    }

    #[test]
    fn zero_limit_means_unbounded() {
        let req = PageRequest::parse(Collection::Articles, None, 0, Direction::Prev).unwrap();
        assert!(req.is_unbounded());
        assert_eq!(req.direction, Direction::Prev);
    }

    #[test]
    fn relay_arguments_map_to_directions() {
        let token = Cursor::at(Collection::Articles, DateTime::from_timestamp_millis(10).unwrap()).encode();
        let fwd = PageRequest::from_relay(Collection::Articles, Some(5), Some(&token), None, None, 20).unwrap();
        assert_eq!((fwd.direction, fwd.limit), (Direction::Next, 5));
        let back = PageRequest::from_relay(Collection::Articles, None, None, Some(3), Some(&token), 20).unwrap();
        assert_eq!((back.direction, back.limit), (Direction::Prev, 3));
        assert!(PageRequest::from_relay(Collection::Articles, None, Some(&token), None, Some(&token), 20).is_err());
    }

    #[test]
    fn relay_rejects_mismatched_count_and_cursor() {
        let token = Cursor::at(Collection::Articles, DateTime::from_timestamp_millis(0).unwrap()).encode();
        let err = PageRequest::from_relay(Collection::Articles, Some(2), None, None, Some(&token), 20).unwrap_err();
        assert!(matches!(err, FeedError::InvalidPageRequest(_)));
        let err = PageRequest::from_relay(Collection::Articles, None, Some(&token), Some(2), None, 20).unwrap_err();
        assert!(matches!(err, FeedError::InvalidPageRequest(_)));
    }

    #[test]
    fn relay_without_count_uses_default_limit() {
        let token = Cursor::at(Collection::Articles, DateTime::from_timestamp_millis(0).unwrap()).encode();
        let req = PageRequest::from_relay(Collection::Articles, None, None, None, None, 20).unwrap();
        assert_eq!((req.direction, req.limit, req.cursor), (Direction::Next, 20, None));
        let req = PageRequest::from_relay(Collection::Articles, None, None, None, Some(&token), 7).unwrap();
        assert_eq!((req.direction, req.limit), (Direction::Prev, 7));
        assert!(!req.is_unbounded());
        let req = PageRequest::from_relay(Collection::Articles, Some(0), None, None, None, 20).unwrap();
        assert!(req.is_unbounded());
    }

    #[test]
    fn direction_parses() {
        assert_eq!("NEXT".parse::<Direction>().unwrap(), Direction::Next);
        assert_eq!("prev".parse::<Direction>().unwrap(), Direction::Prev);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn cursors_follow_first_and_last_items() {
        let page = PageResult::from_items(vec![Row(30, "c"), Row(20, "b"), Row(10, "a")], true, false);
        assert_eq!(page.start_cursor.as_ref().and_then(|c| c.tiebreak()), Some("c"));
        assert_eq!(page.end_cursor.as_ref().and_then(|c| c.tiebreak()), Some("a"));
        let conn = page.into_connection();
        assert_eq!(conn.edges.len(), 3);
        assert!(conn.page_info.has_next_page);
        assert_eq!(conn.edges[1].cursor.tiebreak(), Some("b"));
    }

    #[test]
    fn empty_page_drops_flags() {
        let page: PageResult<Row> = PageResult::from_items(Vec::new(), true, true);
        assert!(page.is_empty());
        assert!(!page.has_next && !page.has_previous);
        assert!(page.start_cursor.is_none() && page.end_cursor.is_none());
    }
}
