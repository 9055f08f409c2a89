//! Cursor codec.
//!
//! A cursor is an opaque position on one collection's `(created_at, id)` order.
//! The wire token is URL-safe base64 (no padding) of `<collection>:<millis>[:<id>]`,
//! so it passes through query parameters and JSON strings untouched.
//!
//! Cursors are transient: minted per page item, never persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::DateTime;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::CursorError;
use crate::{KeyBound, Keyed, Timestamp};

const MAX_CURSOR_TOKEN_LEN: usize = 1024;

/// The ordered collection a cursor was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Articles,
    Comments,
}

impl Collection {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Articles => "articles",
            Self::Comments => "comments",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.tag()) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    collection: Collection,
    at: Timestamp,
    id: Option<String>,
}

impl Cursor {
    /// Cursor on a bare timestamp. Bounds built from it compare on time only.
    pub fn at(collection: Collection, at: Timestamp) -> Self { Self { collection, at, id: None } }

    /// Cursor positioned exactly on `item`.
    pub fn for_item<T: Keyed>(item: &T) -> Self {
        Self { collection: T::COLLECTION, at: item.created_at(), id: Some(item.key_id().to_string()) }
    }

    pub fn collection(&self) -> Collection { self.collection }
    pub fn timestamp(&self) -> Timestamp { self.at }
    pub fn tiebreak(&self) -> Option<&str> { self.id.as_deref() }

    pub fn key_bound(&self) -> KeyBound { KeyBound { at: self.at, id: self.id.clone() } }

    pub fn encode(&self) -> String {
        let raw = match &self.id {
            Some(id) => format!("{}:{}:{}", self.collection.tag(), self.at.timestamp_millis(), id),
            None => format!("{}:{}", self.collection.tag(), self.at.timestamp_millis()),
        };
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode a token, requiring it to belong to `expected`.
    pub fn decode(token: &str, expected: Collection) -> Result<Self, CursorError> {
        if token.is_empty() {
            return Err(CursorError::Empty);
        }
        if token.len() > MAX_CURSOR_TOKEN_LEN {
            return Err(CursorError::TooLong { len: token.len(), max: MAX_CURSOR_TOKEN_LEN });
        }
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| CursorError::Encoding)?;
        let raw = String::from_utf8(bytes).map_err(|_| CursorError::Encoding)?;

        let mut parts = raw.splitn(3, ':');
        let tag = parts.next().ok_or(CursorError::Layout)?;
        let millis = parts.next().ok_or(CursorError::Layout)?;
        let id = parts.next();

        if tag != expected.tag() {
            return Err(CursorError::Collection { expected, found: tag.to_string() });
        }
        let ms: i64 = millis.parse().map_err(|_| CursorError::Layout)?;
        // one token per position: no sign prefix, no padding zeros
        if ms.to_string() != millis {
            return Err(CursorError::Layout);
        }
        let at = DateTime::from_timestamp_millis(ms).ok_or_else(|| CursorError::Timestamp(millis.to_string()))?;
        let id = match id {
            Some("") => return Err(CursorError::Layout),
            Some(id) => Some(id.to_string()),
            None => None,
        };
        Ok(Self { collection: expected, at, id })
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.encode()) }
}

impl Serialize for Cursor {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { s.serialize_str(&self.encode()) }
}
