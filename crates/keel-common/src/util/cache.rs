use {
    dashmap::DashMap,
    sha2::{Digest, Sha256},
    std::{
        hash::Hash,
        io::{self, Read},
        num::NonZeroUsize,
        sync::Mutex,
        time::{Duration, Instant},
    },
};

use crate::error::{KeelError, KeelResult};

// This trait is implemented by things we can take a cryptographic hash of, such as keys and
// event names.
pub trait CryptoHash {
    // Compute a cryptographic hash. The guarantees:
    //   1. For all `x`, `hash_str(x)` = `hash_str(x)`.
    //   1. For all known `x` and `y`, `x` != `y` implies `hash_str(x)` != `hash_str(y)`.
    fn crypto_hash(&self) -> String;
}

impl CryptoHash for str {
    fn crypto_hash(&self) -> String {
        hex::encode(Sha256::digest(self.as_bytes()))
    }
}

impl CryptoHash for String {
    fn crypto_hash(&self) -> String {
        self.as_str().crypto_hash()
    }
}

impl CryptoHash for [u8] {
    fn crypto_hash(&self) -> String {
        hex::encode(Sha256::digest(self))
    }
}

// Compute a cryptographic hash of a readable object (e.g., a manifest file) without loading
// it in memory at once.
pub fn hash_read<R: Read>(input: &mut R) -> KeelResult<String> {
    let mut hasher = Sha256::new();
    io::copy(input, &mut hasher).map_err(KeelError::IOError)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Concurrent map whose entries expire `ttl` after they were written.
///
/// Expired entries are invisible to readers and physically removed by
/// [`TtlCache::evict_expired`], which owners call every `evict_interval`.
#[derive(Debug)]
pub struct TtlCache<K: Eq + Hash, V> {
    entries: DashMap<K, (V, Instant)>,
    ttl: Duration,
    evict_interval: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, evict_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            evict_interval,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.get(key)?;
        let (value, written) = entry.value();
        if written.elapsed() >= self.ttl {
            return None;
        }
        Some(value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now()));
    }

    pub fn delete(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn evict_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, (_, written)| written.elapsed() < ttl);
        before - self.entries.len()
    }

    pub fn evict_interval(&self) -> Duration {
        self.evict_interval
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Thread-safe bounded cache evicting the least recently used entry.
#[derive(Debug)]
pub struct LruMap<K: Eq + Hash, V> {
    inner: Mutex<lru::LruCache<K, V>>,
}

impl<K: Eq + Hash, V: Clone> LruMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(lru::LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.put(key, value);
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
