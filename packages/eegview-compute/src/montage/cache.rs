//! Kernel caches.
//!
//! Tier-2 ([`KernelCache`]) keeps built kernels in memory with least recently
//! used eviction. Tier-3 ([`BinaryCache`]) keeps program binaries on disk, one
//! JSON file per (platform, device), bounded with the oldest insertion
//! evicted first.

use crate::device::{DeviceId, Kernel};
use crate::error::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct LruNode<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded map with O(1) recency updates.
///
/// Nodes live in a slab linked from head (oldest) to tail (newest); freed
/// slots are reused.
struct LruMap<K, V> {
    map: HashMap<K, usize>,
    nodes: Vec<Option<LruNode<K, V>>>,
    free_indices: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> LruMap<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free_indices: Vec::new(),
            head: None,
            tail: None,
            capacity,
        }
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Look up without changing recency.
    fn peek(&self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.nodes[idx].as_ref().map(|node| &node.value)
    }

    /// Look up and mark as most recently used.
    fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.move_to_tail(idx);
        self.nodes[idx].as_ref().map(|node| &node.value)
    }

    /// Insert or replace `key`, evicting from the head while over capacity.
    /// Returns the evicted keys.
    fn insert(&mut self, key: K, value: V) -> Vec<K> {
        if let Some(&idx) = self.map.get(&key) {
            if let Some(node) = self.nodes[idx].as_mut() {
                node.value = value;
            }
            self.move_to_tail(idx);
            return Vec::new();
        }

        let node = LruNode {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free_indices.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.append_to_tail(idx);
        self.shrink_to_capacity()
    }

    fn set_capacity(&mut self, capacity: usize) -> Vec<K> {
        self.capacity = capacity;
        self.shrink_to_capacity()
    }

    fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free_indices.clear();
        self.head = None;
        self.tail = None;
    }

    /// Entries from oldest to newest.
    fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let node = self.nodes[cursor?].as_ref()?;
            cursor = node.next;
            Some((&node.key, &node.value))
        })
    }

    fn shrink_to_capacity(&mut self) -> Vec<K> {
        let mut evicted = Vec::new();
        while self.map.len() > self.capacity {
            let Some(head) = self.head else { break };
            match self.remove_node(head) {
                Some(key) => {
                    self.map.remove(&key);
                    evicted.push(key);
                }
                None => break,
            }
        }
        evicted
    }

    fn remove_node(&mut self, idx: usize) -> Option<K> {
        let node = self.nodes[idx].take()?;
        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.nodes[prev].as_mut() {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.nodes[next].as_mut() {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.free_indices.push(idx);
        Some(node.key)
    }

    fn move_to_tail(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                    prev_node.next = next;
                }
            }
            None => self.head = next,
        }
        if let Some(next_idx) = next {
            if let Some(next_node) = self.nodes[next_idx].as_mut() {
                next_node.prev = prev;
            }
        }

        self.append_to_tail(idx);
    }

    fn append_to_tail(&mut self, idx: usize) {
        if let Some(tail_idx) = self.tail {
            if let Some(tail_node) = self.nodes[tail_idx].as_mut() {
                tail_node.next = Some(idx);
            }
        } else {
            self.head = Some(idx);
        }
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = self.tail;
            node.next = None;
        }
        self.tail = Some(idx);
    }
}

/// Tier-2: built kernels keyed by full kernel source text.
pub struct KernelCache {
    entries: Mutex<LruMap<String, Arc<Kernel>>>,
    configured_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl KernelCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruMap::new(capacity)),
            configured_capacity: capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Grow the capacity to `max(configured, channels)` so that one pass
    /// over `channels` montages never evicts its own kernels.
    pub fn ensure_capacity(&self, channels: usize) {
        let capacity = self.configured_capacity.max(channels);
        let evicted = self.entries.lock().set_capacity(capacity);
        if !evicted.is_empty() {
            log::debug!("Kernel cache shrunk to {} entries, evicted {}", capacity, evicted.len());
        }
    }

    /// Fetch a kernel, counting a hit or a miss.
    pub fn get(&self, source: &str) -> Option<Arc<Kernel>> {
        let found = self.entries.lock().get(&source.to_string()).cloned();
        match found {
            Some(kernel) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(kernel)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Membership test that touches neither recency nor statistics.
    pub fn contains(&self, source: &str) -> bool {
        self.entries.lock().contains(&source.to_string())
    }

    pub fn insert(&self, source: String, kernel: Arc<Kernel>) {
        let evicted = self.entries.lock().insert(source, kernel);
        for _ in &evicted {
            log::debug!("Kernel cache full, evicted least recently used kernel");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    count: usize,
    entries: Vec<CacheEntry>,
}

#[derive(Serialize, Deserialize)]
struct CacheEntry {
    source: String,
    binary: String,
}

/// Tier-3: program binaries persisted across runs.
pub struct BinaryCache {
    path: PathBuf,
    entries: LruMap<String, Vec<u8>>,
    dirty: bool,
}

impl BinaryCache {
    /// File name of the cache for one device.
    pub fn file_name(device: DeviceId) -> String {
        format!("kernel-cache-{}.json", device)
    }

    /// Empty cache that will be written to `path`.
    pub fn new(path: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            path: path.into(),
            entries: LruMap::new(capacity),
            dirty: false,
        }
    }

    /// Load the cache stored at `path`. A missing file gives an empty cache.
    pub fn load(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let mut cache = Self::new(path, capacity);
        if !cache.path.exists() {
            return Ok(cache);
        }

        let content = std::fs::read_to_string(&cache.path)?;
        let file: CacheFile = serde_json::from_str(&content)?;
        if file.count != file.entries.len() {
            log::warn!(
                "Kernel cache {:?} declares {} entries but holds {}",
                cache.path,
                file.count,
                file.entries.len()
            );
        }

        for entry in file.entries {
            match STANDARD.decode(entry.binary.as_bytes()) {
                Ok(binary) => {
                    cache.entries.insert(entry.source, binary);
                }
                Err(e) => log::warn!("Skipping undecodable kernel cache entry: {}", e),
            }
        }
        log::debug!("Loaded {} kernel binaries from {:?}", cache.len(), cache.path);
        Ok(cache)
    }

    /// Rewrite the whole file. Concurrent writers of the same file race; the
    /// last one wins.
    pub fn save(&mut self) -> Result<()> {
        let entries: Vec<CacheEntry> = self
            .entries
            .iter()
            .map(|(source, binary)| CacheEntry {
                source: source.clone(),
                binary: STANDARD.encode(binary),
            })
            .collect();
        let file = CacheFile {
            count: entries.len(),
            entries,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string(&file)?)?;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, source: &str) -> Option<&[u8]> {
        self.entries.peek(&source.to_string()).map(Vec::as_slice)
    }

    /// Store `binary` for `source`, replacing a different stored binary.
    pub fn insert(&mut self, source: String, binary: Vec<u8>) {
        if self.entries.peek(&source) == Some(&binary) {
            return;
        }
        self.entries.insert(source, binary);
        self.dirty = true;
    }

    /// Whether entries changed since the last load or save.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn sources(&self) -> Vec<String> {
        self.entries.iter().map(|(source, _)| source.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Precision;
    use tempfile::TempDir;

    #[test]
    fn test_lru_map_evicts_least_recently_used() {
        let mut map = LruMap::new(2);
        map.insert("a", 1);
        map.insert("b", 2);
        assert_eq!(map.get(&"a"), Some(&1));

        let evicted = map.insert("c", 3);
        assert_eq!(evicted, vec!["b"]);
        assert!(map.contains(&"a"));
        assert!(map.contains(&"c"));

        let order: Vec<_> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec!["a", "c"]);
    }

    #[test]
    fn test_lru_map_reuses_freed_slots() {
        let mut map = LruMap::new(1);
        for i in 0..10 {
            map.insert(i, i * 2);
        }
        assert_eq!(map.len(), 1);
        assert_eq!(map.peek(&9), Some(&18));
        assert!(map.nodes.len() <= 2);
    }

    #[test]
    fn test_kernel_cache_counts_hits_and_misses() {
        let cache = KernelCache::new(1);
        assert!(cache.get("k").is_none());
        cache.insert("k".to_string(), Arc::new(Kernel::identity(Precision::Float)));
        assert!(cache.get("k").is_some());
        assert!(cache.contains("k"));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[test]
    fn test_kernel_cache_capacity_follows_channel_count() {
        let cache = KernelCache::new(2);
        cache.ensure_capacity(5);
        assert_eq!(cache.capacity(), 5);
        for i in 0..5 {
            cache.insert(i.to_string(), Arc::new(Kernel::copy(Precision::Float)));
        }
        assert_eq!(cache.len(), 5);

        cache.ensure_capacity(1);
        assert_eq!(cache.capacity(), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("4"));
    }

    #[test]
    fn test_binary_cache_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(BinaryCache::file_name(DeviceId {
            platform: 0,
            device: 0,
        }));

        let mut cache = BinaryCache::new(&path, 2);
        cache.insert("one".to_string(), vec![1, 2, 3]);
        cache.insert("two".to_string(), vec![4]);
        cache.insert("three".to_string(), vec![5, 6]);
        assert_eq!(cache.sources(), vec!["two", "three"]);
        cache.save().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let json: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(json["count"], 2);
        assert_eq!(json["entries"][1]["binary"], "BQY=");

        let reloaded = BinaryCache::load(&path, 2).unwrap();
        assert_eq!(reloaded.get("three"), Some(&[5u8, 6][..]));
        assert!(reloaded.get("one").is_none());
        assert!(!reloaded.is_dirty());
    }

    #[test]
    fn test_binary_cache_replaces_a_different_binary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.json");
        let mut cache = BinaryCache::new(&path, 4);
        cache.insert("k".to_string(), vec![1]);
        cache.save().unwrap();

        cache.insert("k".to_string(), vec![1]);
        assert!(!cache.is_dirty());

        cache.insert("k".to_string(), vec![2, 3]);
        assert!(cache.is_dirty());
        assert_eq!(cache.get("k"), Some(&[2u8, 3][..]));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_missing_binary_cache_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let cache = BinaryCache::load(dir.path().join("absent.json"), 4).unwrap();
        assert!(cache.is_empty());
    }
}
