//! Process-wide set of documents the client must not try to sync.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Documents known to be inaccessible.
///
/// Clones share one set. Entries are only removed by an explicit
/// [`clear`](Self::clear) / [`clear_all`](Self::clear_all), e.g. when the
/// caller learns that access was granted again.
#[derive(Debug, Clone, Default)]
pub struct AccessDenialCache {
    denied: Arc<RwLock<HashSet<String>>>,
}

impl AccessDenialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_denied(&self, doc_id: &str) -> bool {
        self.denied
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(doc_id)
    }

    /// Returns true if the document was not already denied.
    pub fn mark_denied(&self, doc_id: &str) -> bool {
        let inserted = self
            .denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(doc_id.to_string());
        if inserted {
            log::warn!("Document {doc_id} marked as access-denied");
        }
        inserted
    }

    /// Returns true if the document was denied.
    pub fn clear(&self, doc_id: &str) -> bool {
        let removed = self
            .denied
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(doc_id);
        if removed {
            log::info!("Access denial cleared for document {doc_id}");
        }
        removed
    }

    pub fn clear_all(&self) {
        self.denied.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.denied.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_clear() {
        let cache = AccessDenialCache::new();
        assert!(!cache.is_denied("abc"));

        assert!(cache.mark_denied("abc"));
        assert!(!cache.mark_denied("abc"));
        assert!(cache.is_denied("abc"));
        assert!(!cache.is_denied("abd"));

        assert!(cache.clear("abc"));
        assert!(!cache.clear("abc"));
        assert!(!cache.is_denied("abc"));
    }

    #[test]
    fn test_clones_share_state() {
        let cache = AccessDenialCache::new();
        let other = cache.clone();
        other.mark_denied("x");
        other.mark_denied("y");
        assert!(cache.is_denied("x"));
        assert_eq!(cache.len(), 2);

        cache.clear_all();
        assert!(other.is_empty());
    }

    #[test]
    fn test_separate_caches_are_isolated() {
        let a = AccessDenialCache::new();
        let b = AccessDenialCache::new();
        a.mark_denied("doc");
        assert!(!b.is_denied("doc"));
    }
}
