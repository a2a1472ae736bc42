//! Shared test utilities for storage backend testing.
//!
//! Feature-gated behind `testutil`. Enable it from dependent crates:
//!
//! ```toml
//! [dev-dependencies]
//! ticketd-storage = { workspace = true, features = ["testutil"] }
//! ```

use crate::{StorageBackend, memory::MemoryBackend};

/// Create a deterministic test key from a prefix and index.
///
/// Produces keys like `"prefix:000042"`; zero-padding keeps lexicographic
/// order equal to numeric order.
#[must_use]
pub fn make_key(prefix: &str, idx: usize) -> Vec<u8> {
    format!("{prefix}:{idx:06}").into_bytes()
}

/// Create a [`MemoryBackend`] pre-populated with `count` keys under `prefix`.
///
/// # Panics
///
/// Panics if any `set` operation fails.
pub async fn populated_backend(prefix: &str, count: usize) -> MemoryBackend {
    let backend = MemoryBackend::new();
    for i in 0..count {
        backend
            .set(make_key(prefix, i), format!("value-{i}").into_bytes())
            .await
            .expect("populate set failed");
    }
    backend
}

/// Assert that a [`StorageResult`](crate::StorageResult) is a
/// [`StorageError::Conflict`](crate::StorageError::Conflict).
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict)),
            "expected StorageError::Conflict, got: {:?}",
            result,
        );
    }};
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict)),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Assert that a [`StorageResult`](crate::StorageResult) is `Ok` and return
/// the inner value.
#[macro_export]
macro_rules! assert_storage_ok {
    ($result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => panic!("expected Ok, got StorageError: {e:?}"),
        }
    };
}
