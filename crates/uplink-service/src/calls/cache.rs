use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;

use super::fingerprint::Fingerprint;

/// A value saved in the response cache.
#[derive(Debug, Clone)]
struct CachedValue<T> {
    /// When to evict this value from the cache.
    deadline: Instant,
    /// The actual response.
    value: T,
}

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

/// A struct implementing [`moka::Expiry`] that uses the [`CachedValue`] [`Instant`] as the explicit
/// expiration time.
struct ValueExpiration;

impl<T> Expiry<Fingerprint, CachedValue<T>> for ValueExpiration {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        value: &CachedValue<T>,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        value: &CachedValue<T>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

/// Cache of successful responses with a per-entry time-to-live.
///
/// Entries expire `ttl` after insertion and are evicted lazily when they are
/// next accessed; `get` never returns a value past its deadline. The expiry
/// policy additionally reclaims memory for entries that are never touched
/// again.
pub struct ResponseCache<T: Clone + Send + Sync + 'static> {
    cache: Cache<Fingerprint, CachedValue<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for ResponseCache<T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for ResponseCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("name", &self.cache.name())
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> ResponseCache<T> {
    /// Creates a cache holding up to `capacity` responses.
    pub fn new(name: &str, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .name(name)
            .expire_after(ValueExpiration)
            .build();

        Self { cache }
    }

    /// Looks up the response cached for `fingerprint`.
    ///
    /// Returns `None` if there is no entry or the entry has expired; an
    /// expired entry is evicted on the spot.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<T> {
        let entry = self.cache.get(fingerprint)?;
        if entry.deadline <= Instant::now() {
            self.cache.invalidate(fingerprint);
            return None;
        }
        Some(entry.value)
    }

    /// Stores a response, overwriting any existing entry.
    ///
    /// A zero `ttl` means the response is not cacheable and the call is a
    /// no-op.
    pub fn put(&self, fingerprint: Fingerprint, value: T, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let deadline = Instant::now() + ttl;
        self.cache.insert(fingerprint, CachedValue { deadline, value });
    }

    /// Explicitly removes the entry for `fingerprint`, if any.
    ///
    /// Used by callers that need freshness after a mutating operation.
    pub fn invalidate(&self, fingerprint: &Fingerprint) {
        self.cache.invalidate(fingerprint);
    }

    /// Drops all entries.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn fingerprint(text: &str) -> Fingerprint {
        let mut params = serde_json::Map::new();
        params.insert("text".into(), json!(text));
        crate::calls::CallRequest::new("moderate", params)
            .unwrap()
            .fingerprint()
    }

    #[test]
    fn test_serves_until_deadline() {
        let cache = ResponseCache::new("test", 64);
        let fp = fingerprint("hello");

        cache.put(fp.clone(), json!({"flagged": false}), Duration::from_millis(100));
        assert_eq!(cache.get(&fp), Some(json!({"flagged": false})));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.get(&fp), None);
    }

    #[test]
    fn test_zero_ttl_disables_storage() {
        let cache = ResponseCache::new("test", 64);
        let fp = fingerprint("hello");

        cache.put(fp.clone(), json!(1), Duration::ZERO);
        assert_eq!(cache.get(&fp), None);
    }

    #[test]
    fn test_put_overwrites() {
        let cache = ResponseCache::new("test", 64);
        let fp = fingerprint("hello");

        cache.put(fp.clone(), json!(1), Duration::from_secs(60));
        cache.put(fp.clone(), json!(2), Duration::from_secs(60));
        assert_eq!(cache.get(&fp), Some(json!(2)));
    }

    #[test]
    fn test_invalidate_and_clear() {
        let cache = ResponseCache::new("test", 64);
        let one = fingerprint("one");
        let two = fingerprint("two");

        cache.put(one.clone(), json!(1), Duration::from_secs(60));
        cache.put(two.clone(), json!(2), Duration::from_secs(60));

        cache.invalidate(&one);
        assert_eq!(cache.get(&one), None);
        assert_eq!(cache.get(&two), Some(json!(2)));

        cache.clear();
        assert_eq!(cache.get(&two), None);
    }
}
