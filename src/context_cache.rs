use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};

use lru::LruCache;

use crate::engine::PastState;

/// Decode state carried between turns of one generation context.
#[derive(Debug)]
pub struct ContextEntry {
    /// Full token history of the context.
    pub tokens: Vec<u32>,
    pub past: Option<PastState>,
    /// Number of leading `tokens` covered by `past`; zero without one.
    pub seq_len: usize,
}

impl ContextEntry {
    pub fn new(tokens: Vec<u32>, past: Option<PastState>, seq_len: usize) -> Self {
        let seq_len = if past.is_some() {
            seq_len.min(tokens.len())
        } else {
            0
        };
        Self {
            tokens,
            past,
            seq_len,
        }
    }
}

/// Bounded map from caller-supplied context id to its decode state; the least
/// recently used context is evicted when full.
pub struct ContextCache {
    entries: Mutex<LruCache<String, ContextEntry>>,
}

impl ContextCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Remove and return the entry. A caller that fails simply never stores it
    /// back, so the context restarts from scratch.
    pub fn checkout(&self, id: &str) -> Option<ContextEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(id)
    }

    pub fn store(&self, id: &str, entry: ContextEntry) {
        let evicted = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id.to_string(), entry);
        if let Some((evicted_id, _)) = evicted.filter(|(k, _)| k != id) {
            tracing::info!(context = %evicted_id, "context evicted");
        }
    }

    /// Drop every context, e.g. once the model they were decoded with is gone.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{ContextCache, ContextEntry};
    use crate::engine::PastState;

    fn entry(tokens: &[u32]) -> ContextEntry {
        ContextEntry::new(
            tokens.to_vec(),
            Some(PastState::KeyValues(Vec::new())),
            tokens.len(),
        )
    }

    #[test]
    fn checkout_removes_the_entry() {
        let cache = ContextCache::new(4);
        cache.store("a", entry(&[1, 2, 3]));

        let taken = cache.checkout("a").expect("stored entry");
        assert_eq!(taken.tokens, vec![1, 2, 3]);
        assert_eq!(taken.seq_len, 3);
        assert!(cache.checkout("a").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_used_context_is_evicted() {
        let cache = ContextCache::new(2);
        cache.store("a", entry(&[1]));
        cache.store("b", entry(&[2]));
        let a = cache.checkout("a").expect("a");
        cache.store("a", a);
        cache.store("c", entry(&[3]));

        assert_eq!(cache.len(), 2);
        assert!(cache.checkout("b").is_none());
        assert!(cache.checkout("a").is_some());
        assert!(cache.checkout("c").is_some());
    }

    #[test]
    fn storing_same_id_replaces() {
        let cache = ContextCache::new(2);
        cache.store("a", entry(&[1]));
        cache.store("a", entry(&[1, 2]));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.checkout("a").expect("a").tokens, vec![1, 2]);
    }

    #[test]
    fn entry_without_past_covers_nothing() {
        let e = ContextEntry::new(vec![1, 2, 3], None, 3);
        assert_eq!(e.seq_len, 0);

        let e = ContextEntry::new(vec![1], Some(PastState::KeyValues(Vec::new())), 9);
        assert_eq!(e.seq_len, 1);
    }

    #[test]
    fn zero_capacity_still_holds_one_context() {
        let cache = ContextCache::new(0);
        cache.store("a", entry(&[1]));
        cache.store("b", entry(&[2]));
        assert_eq!(cache.len(), 1);
        assert!(cache.checkout("b").is_some());
    }
}
