//! Common types used across storage operations.

use bytes::Bytes;

/// Key-value pair returned from range queries.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use ticketd_storage::KeyValue;
///
/// let kv = KeyValue::new(Bytes::from("tickets/st/abc"), Bytes::from("{}"));
/// assert_eq!(kv.key, Bytes::from("tickets/st/abc"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key identifying this entry.
    pub key: Bytes,

    /// The value stored at this key.
    pub value: Bytes,
}

impl KeyValue {
    /// Creates a new key-value pair.
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self { key, value }
    }
}

/// Returns the exclusive upper bound of all keys starting with `prefix`.
///
/// The result is the shortest byte string greater than every key carrying the
/// prefix, so `prefix.to_vec()..prefix_end(prefix)` selects exactly the keys
/// under that prefix. Returns `None` when no such bound exists (the prefix is
/// empty or consists only of `0xFF` bytes); callers should then use an
/// unbounded range end.
///
/// # Examples
///
/// ```
/// use ticketd_storage::types::prefix_end;
///
/// assert_eq!(prefix_end(b"idx/"), Some(b"idx0".to_vec()));
/// assert_eq!(prefix_end(b"a\xff"), Some(b"b".to_vec()));
/// assert_eq!(prefix_end(b"\xff\xff"), None);
/// ```
#[must_use]
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
