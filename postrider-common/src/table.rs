//! String-to-string lookup tables.
//!
//! Tables back the `source_in`/`destination_in` routing entries and
//! alias-style modifiers. Implementations may be in-memory maps, files,
//! or network services; lookups may block and must honor cancellation.

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error produced by a failing table lookup.
///
/// Routing treats these as soft failures: the entry is logged and
/// skipped, never fatal to the transaction.
#[derive(Debug, Clone, Error)]
#[error("table lookup failed: {0}")]
pub struct TableError(pub String);

/// A keyed lookup table.
#[async_trait]
pub trait Table: Send + Sync {
    /// Looks up `key`, returning the mapped value if the key is present.
    ///
    /// # Errors
    ///
    /// Returns [`TableError`] when the lookup itself failed (as opposed
    /// to the key being absent).
    async fn lookup(
        &self,
        ctx: &CancellationToken,
        key: &str,
    ) -> Result<Option<String>, TableError>;
}

#[async_trait]
impl<T: Table + ?Sized> Table for Arc<T> {
    async fn lookup(
        &self,
        ctx: &CancellationToken,
        key: &str,
    ) -> Result<Option<String>, TableError> {
        (**self).lookup(ctx, key).await
    }
}

/// An immutable in-memory table.
#[derive(Debug, Clone, Default)]
pub struct MapTable {
    entries: AHashMap<String, String>,
}

impl MapTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MapTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl Table for MapTable {
    async fn lookup(
        &self,
        _ctx: &CancellationToken,
        key: &str,
    ) -> Result<Option<String>, TableError> {
        Ok(self.entries.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn test_map_table_lookup() {
        let table: MapTable = [("a@example.com", "present")].into_iter().collect();
        let ctx = CancellationToken::new();
        assert_eq!(
            table.lookup(&ctx, "a@example.com").await.unwrap(),
            Some("present".to_owned())
        );
        assert_eq!(table.lookup(&ctx, "b@example.com").await.unwrap(), None);
    }
}
