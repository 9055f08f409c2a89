//! Error taxonomy for the feed engine and its datastore collaborator.

use crate::Collection;

/// Failures reported by a `Datastore` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("datastore unavailable: {0}")]
    Unavailable(String),
    #[error("datastore returned corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Why a cursor token could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CursorError {
    #[error("cursor token is empty")]
    Empty,
    #[error("cursor token exceeds max length: {len} chars (max {max})")]
    TooLong { len: usize, max: usize },
    #[error("cursor token is not valid base64")]
    Encoding,
    #[error("cursor token has an unexpected layout")]
    Layout,
    #[error("cursor belongs to {found}, not {expected}")]
    Collection { expected: Collection, found: String },
    #[error("cursor timestamp out of range: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("malformed cursor: {0}")]
    MalformedCursor(#[from] CursorError),
    #[error("invalid page request: {0}")]
    InvalidPageRequest(String),
    #[error(transparent)]
    DatastoreUnavailable(#[from] StoreError),
}

impl FeedError {
    /// True for errors caused by the request itself (400-class).
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MalformedCursor(_) | Self::InvalidPageRequest(_))
    }

    /// Short stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedCursor(_) => "malformed_cursor",
            Self::InvalidPageRequest(_) => "invalid_page_request",
            Self::DatastoreUnavailable(_) => "datastore",
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
