use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash as StdHash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use pvt_common::{CacheError, EncryptedPayloadHash, ExtraMetadata};

/// Default lifetime of a cached item
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(5 * 60);

/// Interval between sweeps of expired items
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Store<K, V> = Arc<RwLock<HashMap<K, Entry<V>>>>;

/// Time-expiring key/value store.
///
/// Expired items are invisible to readers immediately and physically removed by
/// a background sweep. The sweep task only holds a weak reference, so it ends
/// once the last clone of the cache is dropped.
pub struct TtlCache<K, V> {
    items: Store<K, V>,
    default_ttl: Duration,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + StdHash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_expiration(DEFAULT_EXPIRATION, CLEANUP_INTERVAL)
    }

    pub fn with_expiration(default_ttl: Duration, cleanup_interval: Duration) -> Self {
        let items: Store<K, V> = Arc::new(RwLock::new(HashMap::new()));
        spawn_janitor(Arc::downgrade(&items), cleanup_interval);
        Self { items, default_ttl }
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.items.write().insert(key, Entry { value, expires_at });
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let items = self.items.read();
        items
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone())
    }

    /// Insert only if no live item exists for `key`
    pub fn add(&self, key: K, value: V) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut items = self.items.write();
        if let Some(existing) = items.get(&key) {
            if !existing.is_expired(now) {
                return Err(CacheError::AlreadyExists(format!("{:?}", key)));
            }
        }
        items.insert(
            key,
            Entry {
                value,
                expires_at: now + self.default_ttl,
            },
        );
        Ok(())
    }

    /// Atomically compute the next value from the current live one.
    ///
    /// `f` returning `None` leaves the store untouched. Returns whether a value was written.
    pub fn update<F>(&self, key: K, f: F) -> bool
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let now = Instant::now();
        let mut items = self.items.write();
        let current = items.get(&key).filter(|e| !e.is_expired(now)).map(|e| &e.value);
        match f(current) {
            Some(value) => {
                items.insert(
                    key,
                    Entry {
                        value,
                        expires_at: now + self.default_ttl,
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.items.write().remove(key).map(|e| e.value)
    }

    /// Number of stored items, including expired ones not yet swept
    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    pub fn delete_expired(&self) -> usize {
        purge_expired(&self.items)
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + StdHash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn purge_expired<K: Eq + StdHash, V>(items: &RwLock<HashMap<K, Entry<V>>>) -> usize {
    let now = Instant::now();
    let mut items = items.write();
    let before = items.len();
    items.retain(|_, entry| !entry.is_expired(now));
    before - items.len()
}

fn spawn_janitor<K, V>(items: Weak<RwLock<HashMap<K, Entry<V>>>>, interval: Duration)
where
    K: Eq + StdHash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // Outside a runtime expiry stays lazy and callers may sweep with delete_expired.
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        trace!("no tokio runtime, cache sweep disabled");
        return;
    };
    handle.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(items) = items.upgrade() else {
                break;
            };
            let evicted = purge_expired(&items);
            if evicted > 0 {
                debug!(evicted, "swept expired cache items");
            }
        }
    });
}

/// Payload and metadata held for an encrypted payload hash
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrivateCacheItem {
    pub payload: Vec<u8>,
    pub extra: ExtraMetadata,
    /// Known sender flag, set when the item came from a peer that already asked the PTM
    pub is_sender: Option<bool>,
}

impl PrivateCacheItem {
    pub fn new(payload: Vec<u8>, extra: ExtraMetadata) -> Self {
        Self {
            payload,
            extra,
            is_sender: None,
        }
    }
}

/// State of a payload hash in the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry {
    /// Known not to be a recipient; no payload exists for this node
    Empty,
    /// Payload known, metadata pending a matching send-signed-tx
    Incomplete(PrivateCacheItem),
    Complete(PrivateCacheItem),
}

impl CacheEntry {
    pub fn item(&self) -> Option<&PrivateCacheItem> {
        match self {
            CacheEntry::Empty => None,
            CacheEntry::Incomplete(item) | CacheEntry::Complete(item) => Some(item),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, CacheEntry::Complete(_))
    }

    /// Next state when `next` is written over `current`, `None` to keep `current`.
    ///
    /// A complete entry is never replaced by an incomplete or empty one, so a
    /// slow raw receive cannot clobber a concurrently completed item.
    pub fn transition(current: Option<&CacheEntry>, next: CacheEntry) -> Option<CacheEntry> {
        match (current, next) {
            (_, next @ CacheEntry::Complete(_)) => Some(next),
            (Some(CacheEntry::Complete(_)), _) => None,
            (None, next) => Some(next),
            (Some(_), next @ CacheEntry::Incomplete(_)) => Some(next),
            (Some(_), CacheEntry::Empty) => None,
        }
    }
}

/// Per-adapter cache of PTM payloads keyed by encrypted payload hash
#[derive(Clone)]
pub struct PayloadCache {
    inner: TtlCache<EncryptedPayloadHash, CacheEntry>,
}

impl PayloadCache {
    pub fn new() -> Self {
        Self { inner: TtlCache::new() }
    }

    pub fn with_expiration(ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            inner: TtlCache::with_expiration(ttl, cleanup_interval),
        }
    }

    pub fn get(&self, hash: &EncryptedPayloadHash) -> Option<CacheEntry> {
        let entry = self.inner.get(hash);
        if entry.is_some() {
            metrics::counter!("ptm_cache_hits_total").increment(1);
        } else {
            metrics::counter!("ptm_cache_misses_total").increment(1);
        }
        entry
    }

    /// Apply the entry state machine; returns whether the write took effect
    pub fn put(&self, hash: EncryptedPayloadHash, next: CacheEntry) -> bool {
        if hash.is_empty() {
            return false;
        }
        self.inner.update(hash, |current| CacheEntry::transition(current, next))
    }

    pub fn put_complete(&self, hash: EncryptedPayloadHash, item: PrivateCacheItem) -> bool {
        self.put(hash, CacheEntry::Complete(item))
    }

    pub fn put_incomplete(&self, hash: EncryptedPayloadHash, item: PrivateCacheItem) -> bool {
        self.put(hash, CacheEntry::Incomplete(item))
    }

    /// Record that this node holds no payload for `hash`, unless something is already known
    pub fn mark_empty(&self, hash: EncryptedPayloadHash) -> bool {
        self.put(hash, CacheEntry::Empty)
    }

    /// Upgrade an incomplete entry with the metadata supplied at send-signed-tx time
    pub fn complete(&self, hash: EncryptedPayloadHash, extra: ExtraMetadata) -> bool {
        self.inner.update(hash, |current| match current {
            Some(CacheEntry::Incomplete(item)) => Some(CacheEntry::Complete(PrivateCacheItem {
                payload: item.payload.clone(),
                extra,
                is_sender: item.is_sender,
            })),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.inner.item_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PayloadCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvt_common::PrivacyFlag;

    fn hash(s: &str) -> EncryptedPayloadHash {
        EncryptedPayloadHash::from_slice(s.as_bytes())
    }

    fn item(payload: &str) -> PrivateCacheItem {
        PrivateCacheItem::new(payload.as_bytes().to_vec(), ExtraMetadata::default())
    }

    #[test]
    fn test_add_fails_when_key_exists() {
        let cache: TtlCache<String, u32> = TtlCache::new();
        assert!(cache.add("k".to_string(), 1).is_ok());
        assert!(matches!(cache.add("k".to_string(), 2), Err(CacheError::AlreadyExists(_))));
        assert_eq!(cache.get(&"k".to_string()), Some(1));
    }

    #[test]
    fn test_expired_items_are_invisible_and_replaceable() {
        let cache: TtlCache<String, u32> = TtlCache::with_expiration(Duration::from_millis(0), CLEANUP_INTERVAL);
        cache.set("k".to_string(), 1);
        assert_eq!(cache.get(&"k".to_string()), None);
        assert!(cache.add("k".to_string(), 2).is_ok());
        assert_eq!(cache.delete_expired(), 1);
        assert_eq!(cache.item_count(), 0);
    }

    #[tokio::test]
    async fn test_janitor_sweeps_expired_items() {
        let cache: TtlCache<String, u32> =
            TtlCache::with_expiration(Duration::from_millis(10), Duration::from_millis(20));
        cache.set("k".to_string(), 1);
        cache.set_with_ttl("long".to_string(), 2, Duration::from_secs(3600));
        assert_eq!(cache.item_count(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(cache.item_count(), 1);
        assert_eq!(cache.get(&"long".to_string()), Some(2));
    }

    #[test]
    fn test_complete_is_never_downgraded() {
        let cache = PayloadCache::new();
        let h = hash("tx");
        assert!(cache.put_complete(h, item("payload")));
        assert!(!cache.put_incomplete(h, item("stale")));
        assert!(!cache.mark_empty(h));
        assert_eq!(cache.get(&h), Some(CacheEntry::Complete(item("payload"))));
    }

    #[test]
    fn test_incomplete_then_complete() {
        let cache = PayloadCache::new();
        let h = hash("tx");
        cache.put_incomplete(h, item("payload"));

        let extra = ExtraMetadata::with_privacy_flag(PrivacyFlag::StateValidation);
        assert!(cache.complete(h, extra.clone()));

        let entry = cache.get(&h).unwrap();
        assert!(entry.is_complete());
        assert_eq!(entry.item().unwrap().extra.privacy_flag, PrivacyFlag::StateValidation);
        assert_eq!(entry.item().unwrap().payload, b"payload".to_vec());

        // a second completion has nothing to upgrade
        assert!(!cache.complete(h, extra));
    }

    #[test]
    fn test_complete_without_placeholder_is_noop() {
        let cache = PayloadCache::new();
        assert!(!cache.complete(hash("tx"), ExtraMetadata::default()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_empty_marker_only_when_absent() {
        let cache = PayloadCache::new();
        let h = hash("tx");
        assert!(cache.mark_empty(h));
        assert_eq!(cache.get(&h), Some(CacheEntry::Empty));
        assert!(cache.put_complete(h, item("payload")));
        assert!(cache.get(&h).unwrap().is_complete());
    }

    #[test]
    fn test_zero_hash_is_never_stored() {
        let cache = PayloadCache::new();
        assert!(!cache.put_complete(EncryptedPayloadHash::default(), item("payload")));
        assert!(cache.is_empty());
    }
}
