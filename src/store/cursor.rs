//! Opaque pagination cursors
//!
//! A cursor is the last returned key serialized as JSON and encoded with
//! URL-safe base64. Clients treat it as an opaque token.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{Page, StoreError};

pub fn encode_cursor<K: Serialize>(key: &K) -> Result<String, StoreError> {
    let json = serde_json::to_vec(key)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a cursor produced by [`encode_cursor`]. Any malformed token is
/// reported as [`StoreError::InvalidCursor`].
pub fn decode_cursor<K: DeserializeOwned>(cursor: &str) -> Result<K, StoreError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim())
        .map_err(|_| StoreError::InvalidCursor)?;
    serde_json::from_slice(&bytes).map_err(|_| StoreError::InvalidCursor)
}

/// Decode an optional cursor
pub fn decode_opt<K: DeserializeOwned>(cursor: Option<&str>) -> Result<Option<K>, StoreError> {
    cursor.map(decode_cursor).transpose()
}

/// Build a page from up to `limit + 1` items already in cursor order.
/// The extra item, when present, only signals that another page exists.
pub(crate) fn paginate<T, K: Serialize>(
    mut items: Vec<T>,
    limit: usize,
    key: impl Fn(&T) -> K,
) -> Result<Page<T>, StoreError> {
    if items.len() <= limit {
        return Ok(Page {
            items,
            next_cursor: None,
        });
    }
    items.truncate(limit);
    let next_cursor = items.last().map(|t| encode_cursor(&key(t))).transpose()?;
    Ok(Page { items, next_cursor })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TradeCursor;

    #[test]
    fn test_cursor_decodes_to_same_key() {
        let key = TradeCursor {
            timestamp: 42,
            trade_id: "t-1".into(),
        };
        let token = encode_cursor(&key).unwrap();
        assert!(!token.contains('='));
        let back: TradeCursor = decode_cursor(&token).unwrap();
        assert_eq!(back.timestamp, 42);
        assert_eq!(back.trade_id, "t-1");
    }

    #[test]
    fn test_garbage_cursor_rejected() {
        let err = decode_cursor::<TradeCursor>("not*base64").unwrap_err();
        assert!(matches!(err, StoreError::InvalidCursor));

        // valid base64, wrong shape
        let token = URL_SAFE_NO_PAD.encode(b"{\"foo\":1}");
        let err = decode_cursor::<TradeCursor>(&token).unwrap_err();
        assert!(matches!(err, StoreError::InvalidCursor));
    }

    #[test]
    fn test_paginate_sets_cursor_only_when_more() {
        let page = paginate(vec![1, 2, 3], 3, |n| *n).unwrap();
        assert_eq!(page.items, vec![1, 2, 3]);
        assert!(page.next_cursor.is_none());

        let page = paginate(vec![1, 2, 3, 4], 3, |n| *n).unwrap();
        assert_eq!(page.items, vec![1, 2, 3]);
        let last: i32 = decode_cursor(page.next_cursor.as_deref().unwrap()).unwrap();
        assert_eq!(last, 3);
    }
}
