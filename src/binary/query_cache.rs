//! Per-connection cache of parsed query descriptions.
//!
//! A hit lets the connection skip Parse and send Execute straight away, as
//! long as both codecs it names are still in the [`CodecCache`].
//!
//! [`CodecCache`]: super::builder::CodecCache

use std::num::NonZeroUsize;

use lru::LruCache;
use uuid::Uuid;

use super::protocol::{Cardinality, IoFormat};

/// Everything that changes how the server compiles a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub query: String,
    pub cardinality: Cardinality,
    pub format: IoFormat,
    pub capabilities: u64,
}

impl QueryKey {
    pub fn new(query: impl Into<String>, cardinality: Cardinality, format: IoFormat, capabilities: u64) -> Self {
        Self {
            query: query.into(),
            cardinality,
            format,
            capabilities,
        }
    }
}

/// Outcome of a Parse worth remembering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTypes {
    pub input_type_id: Uuid,
    pub output_type_id: Uuid,
    /// Cardinality the server reported for the result.
    pub result_cardinality: Cardinality,
    pub capabilities: u64,
}

/// O(1) LRU cache from [`QueryKey`] to [`QueryTypes`].
pub struct QueryCache {
    cache: LruCache<QueryKey, QueryTypes>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Look up without touching the LRU order.
    pub fn get(&self, key: &QueryKey) -> Option<QueryTypes> {
        self.cache.peek(key).copied()
    }

    /// Look up and mark as recently used.
    pub fn get_and_touch(&mut self, key: &QueryKey) -> Option<QueryTypes> {
        self.cache.get(key).copied()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.cache.contains(key)
    }

    /// Insert or replace. Returns the evicted key if the cache was full.
    pub fn insert(&mut self, key: QueryKey, types: QueryTypes) -> Option<QueryKey> {
        match self.cache.push(key, types) {
            // `push` also hands back the old entry when the key was present
            Some((evicted, _)) if !self.cache.contains(&evicted) => Some(evicted),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &QueryKey) -> Option<QueryTypes> {
        self.cache.pop(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.cap().get()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(256)
    }
}
