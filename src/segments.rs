//! Qualified-segment seam for audience targeting backed by an external
//! customer-data platform.
//!
//! The `qualified` condition operator matches against segment strings held
//! on the user context. Where those strings come from is behind
//! [`SegmentSource`]; fetches are cached per user id and failures degrade
//! to an empty segment set.
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

/// Default capacity of the per-user segment cache.
pub const DEFAULT_SEGMENT_CACHE_SIZE: usize = 100;

#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum SegmentError {
    #[error("segment fetch failed: {0}")]
    Fetch(String),

    #[error("segment event send failed: {0}")]
    Send(String),
}

/// An event forwarded to the segment platform (user identification,
/// conversion context, and the like).
#[derive(Debug, Clone, Default)]
pub struct SegmentEvent {
    pub event_type: String,
    pub action: String,
    pub identifiers: HashMap<String, String>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// External source of qualified segments for a user.
pub trait SegmentSource: Send + Sync {
    fn fetch_qualified_segments(&self, user_id: &str) -> Result<Vec<String>, SegmentError>;
    fn send_event(&self, event: &SegmentEvent) -> Result<(), SegmentError>;
}

/// Caching layer over a [`SegmentSource`].
pub struct SegmentManager {
    source: Arc<dyn SegmentSource>,
    cache: Mutex<LruCache<String, Vec<String>>>,
}

impl SegmentManager {
    pub fn new(source: Arc<dyn SegmentSource>) -> SegmentManager {
        let capacity = NonZeroUsize::new(DEFAULT_SEGMENT_CACHE_SIZE)
            .expect("default cache size is non-zero");
        SegmentManager::with_cache_size(source, capacity)
    }

    pub fn with_cache_size(source: Arc<dyn SegmentSource>, capacity: NonZeroUsize) -> SegmentManager {
        SegmentManager {
            source,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn fetch_qualified_segments(&self, user_id: &str) -> Result<Vec<String>, SegmentError> {
        if let Some(segments) = self.lock_cache().get(user_id) {
            return Ok(segments.clone());
        }

        let segments = self.source.fetch_qualified_segments(user_id)?;
        self.lock_cache()
            .put(user_id.to_owned(), segments.clone());
        Ok(segments)
    }

    pub fn send_event(&self, event: &SegmentEvent) -> Result<(), SegmentError> {
        self.source.send_event(event)
    }

    pub fn reset_cache(&self) {
        self.lock_cache().clear();
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Vec<String>>> {
        // Err() is possible only if a thread panicked while holding the
        // lock, which should never happen.
        self.cache
            .lock()
            .expect("thread holding segment cache lock should not panic")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl SegmentSource for CountingSource {
        fn fetch_qualified_segments(&self, _user_id: &str) -> Result<Vec<String>, SegmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["segment-1".to_owned()])
        }

        fn send_event(&self, _event: &SegmentEvent) -> Result<(), SegmentError> {
            Ok(())
        }
    }

    #[test]
    fn fetches_are_cached_per_user() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let manager = SegmentManager::new(source.clone());

        assert_eq!(
            manager.fetch_qualified_segments("u1").unwrap(),
            vec!["segment-1".to_owned()]
        );
        manager.fetch_qualified_segments("u1").unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        manager.fetch_qualified_segments("u2").unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        manager.reset_cache();
        manager.fetch_qualified_segments("u1").unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
