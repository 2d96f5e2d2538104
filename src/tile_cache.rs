//! Global LRU cache for decompressed tiles.
//!
//! Remote tile reads cost a network round-trip plus decompression; windows
//! that overlap the same tiles (across bands of different scenes sharing a
//! grid, or repeated crops of a local raster) hit the cache instead. The
//! cache is byte-bounded and evicts least-recently-used entries.

use std::cmp::max;
use std::sync::{Arc, Mutex};

use lru::LruCache;

const CACHE_CAPACITY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone, Eq, PartialEq, Hash)]
struct TileKey {
    source: Arc<str>,
    /// Overview level, `None` for full resolution.
    level: Option<usize>,
    index: u32,
}

struct CacheEntry {
    data: Arc<Vec<f32>>,
    size_bytes: usize,
}

struct TileCache {
    current_bytes: usize,
    capacity_bytes: usize,
    entries: LruCache<TileKey, CacheEntry>,
}

impl TileCache {
    fn new(capacity_bytes: usize) -> Self {
        TileCache {
            current_bytes: 0,
            capacity_bytes,
            entries: LruCache::unbounded(),
        }
    }

    fn get(&mut self, key: &TileKey) -> Option<Arc<Vec<f32>>> {
        self.entries.get(key).map(|entry| Arc::clone(&entry.data))
    }

    fn insert(&mut self, key: TileKey, data: Arc<Vec<f32>>, size_bytes: usize) {
        if size_bytes > self.capacity_bytes {
            return;
        }

        if let Some(old) = self.entries.pop(&key) {
            self.current_bytes = self.current_bytes.saturating_sub(old.size_bytes);
        }

        while self.current_bytes + size_bytes > self.capacity_bytes {
            if let Some((_key, entry)) = self.entries.pop_lru() {
                self.current_bytes = self.current_bytes.saturating_sub(entry.size_bytes);
            } else {
                break;
            }
        }

        self.current_bytes = self.current_bytes.saturating_add(size_bytes);
        self.entries.put(key, CacheEntry { data, size_bytes });
    }
}

static TILE_CACHE: std::sync::LazyLock<Mutex<TileCache>> = std::sync::LazyLock::new(|| {
    let cap = max(CACHE_CAPACITY_BYTES, 64 * 1024 * 1024); // never below 64MB
    Mutex::new(TileCache::new(cap))
});

fn make_key(source: &str, level: Option<usize>, index: usize) -> TileKey {
    TileKey {
        source: Arc::from(source),
        level,
        index: index as u32,
    }
}

pub fn get(source: &str, level: Option<usize>, index: usize) -> Option<Arc<Vec<f32>>> {
    let key = make_key(source, level, index);
    TILE_CACHE.lock().unwrap().get(&key)
}

pub fn insert(source: &str, level: Option<usize>, index: usize, data: Arc<Vec<f32>>) {
    let size_bytes = data.len() * std::mem::size_of::<f32>();
    let key = make_key(source, level, index);
    TILE_CACHE.lock().unwrap().insert(key, data, size_bytes);
}
