//! Keyset pagination with opaque cursors.
//!
//! A cursor encodes the ordering timestamp and id of the last item returned,
//! base64 encoded so callers treat it as an opaque token.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hookrelay_core::models::{JobCursor, JobId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Page size used when the caller does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Largest page a caller may request.
pub const MAX_PAGE_LIMIT: usize = 500;

/// A page request: where to resume and how many items to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    /// Cursor from a previous page's `next_cursor`, or `None` to start.
    pub cursor: Option<String>,
    /// Requested page size; clamped to `1..=MAX_PAGE_LIMIT`.
    pub limit: Option<usize>,
}

impl PageRequest {
    /// First page with the default size.
    pub fn first() -> Self {
        Self::default()
    }

    /// First page with `limit` items.
    pub fn with_limit(limit: usize) -> Self {
        Self { cursor: None, limit: Some(limit) }
    }

    /// Continues after `cursor`.
    #[must_use]
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Effective page size.
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
    }

    /// Decodes the cursor, if any.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidInput` for a malformed cursor.
    pub fn decode_cursor(&self) -> Result<Option<JobCursor>> {
        self.cursor.as_deref().map(decode_cursor).transpose()
    }
}

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Builds a page from a fetch of up to `limit + 1` rows.
    ///
    /// The extra row only signals that another page exists; it is dropped
    /// and the cursor points at the last kept row.
    pub fn from_overfetch(
        mut rows: Vec<T>,
        limit: usize,
        cursor_of: impl Fn(&T) -> JobCursor,
    ) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor =
            if has_more { rows.last().map(|row| encode_cursor(&cursor_of(row))) } else { None };
        Self { items: rows, next_cursor }
    }

    /// Transforms every item, keeping the cursor.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page { items: self.items.into_iter().map(f).collect(), next_cursor: self.next_cursor }
    }
}

/// Encodes a keyset position as an opaque cursor.
pub fn encode_cursor(cursor: &JobCursor) -> String {
    URL_SAFE_NO_PAD.encode(format!("{}:{}", cursor.at.timestamp_micros(), cursor.id))
}

/// Decodes a cursor produced by `encode_cursor`.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidInput` if the token is not a cursor.
pub fn decode_cursor(token: &str) -> Result<JobCursor> {
    let invalid = || DeliveryError::invalid_input(format!("invalid page cursor: {token}"));

    let raw = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    let raw = String::from_utf8(raw).map_err(|_| invalid())?;
    let (micros, id) = raw.split_once(':').ok_or_else(invalid)?;
    let micros: i64 = micros.parse().map_err(|_| invalid())?;
    let at: DateTime<Utc> = DateTime::from_timestamp_micros(micros).ok_or_else(invalid)?;
    let id = Uuid::parse_str(id).map_err(|_| invalid())?;

    Ok(JobCursor { at, id: JobId(id) })
}
