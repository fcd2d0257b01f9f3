//! Bounded, TTL-expiring store of encoded images keyed by request fingerprint.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::models::{ImageBytes, ImageFormat};

/// Prompts are fingerprinted by their first `PROMPT_KEY_CHARS` characters only.
pub const PROMPT_KEY_CHARS: usize = 200;

/// Minimum gap between full expiry sweeps on insert, unless the cache is full.
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Two prompts sharing the same trimmed 200-character prefix and the same other
    /// fields map to the same key.
    pub fn derive(
        prompt: &str,
        steps: u32,
        width: u32,
        height: u32,
        format: ImageFormat,
    ) -> Self {
        let prefix: String = prompt.trim().chars().take(PROMPT_KEY_CHARS).collect();
        CacheKey(format!("{}|s{}|{}x{}|{}", prefix, steps, width, height, format))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    value: ImageBytes,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    // Least recently used at the front.
    lru: VecDeque<CacheKey>,
    last_prune_at: Option<Instant>,
}

impl CacheState {
    fn touch(&mut self, key: &CacheKey) {
        if self.lru.back().is_some_and(|k| k == key) {
            return;
        }
        if let Some(k) = self.take_from_lru(key) {
            self.lru.push_back(k);
        }
    }

    fn remove(&mut self, key: &CacheKey) {
        self.entries.remove(key);
        self.take_from_lru(key);
    }

    fn take_from_lru(&mut self, key: &CacheKey) -> Option<CacheKey> {
        if self.lru.front().is_some_and(|k| k == key) {
            return self.lru.pop_front();
        }
        if self.lru.back().is_some_and(|k| k == key) {
            return self.lru.pop_back();
        }
        let pos = self.lru.iter().position(|k| k == key)?;
        self.lru.remove(pos)
    }

    fn should_prune(&self, now: Instant, full: bool) -> bool {
        full || self
            .last_prune_at
            .map_or(true, |last| now.saturating_duration_since(last) >= PRUNE_INTERVAL)
    }

    fn prune_expired(&mut self, ttl: Duration, now: Instant) -> usize {
        self.last_prune_at = Some(now);
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) < ttl);
        let entries = &self.entries;
        self.lru.retain(|k| entries.contains_key(k));
        before - self.entries.len()
    }
}

pub struct ResultCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            ttl,
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, key: &CacheKey) -> Option<ImageBytes> {
        self.get_at(key, Instant::now())
    }

    pub fn put(&self, key: CacheKey, value: ImageBytes) {
        self.put_at(key, value, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &CacheKey, now: Instant) -> Option<ImageBytes> {
        let mut state = self.lock();
        let found = state.entries.get(key).map(|entry| {
            let expired = now.saturating_duration_since(entry.inserted_at) >= self.ttl;
            (expired, entry.value.clone())
        });

        match found {
            Some((false, value)) => {
                state.touch(key);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            Some((true, _)) => {
                state.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub(crate) fn put_at(&self, key: CacheKey, value: ImageBytes, now: Instant) {
        let mut state = self.lock();
        let full = state.entries.len() >= self.capacity;
        if state.should_prune(now, full) {
            state.prune_expired(self.ttl, now);
        }

        if state.entries.contains_key(&key) {
            state.touch(&key);
        } else {
            while state.entries.len() >= self.capacity {
                let Some(oldest) = state.lru.pop_front() else {
                    break;
                };
                state.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                log::debug!("Evicted cache entry: {}", truncate_for_log(oldest.as_str()));
            }
            state.lru.push_back(key.clone());
        }

        state.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        let state = self.lock();
        state
            .entries
            .get(key)
            .is_some_and(|entry| entry.inserted_at.elapsed() < self.ttl)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.lru.clear();
        state.last_prune_at = None;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Every mutation leaves the state consistent, so a poisoned lock is still usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

pub(crate) fn truncate_for_log(key: &str) -> String {
    key.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn key(prompt: &str) -> CacheKey {
        CacheKey::derive(prompt, 8, 512, 512, ImageFormat::Png)
    }

    fn bytes(b: &[u8]) -> ImageBytes {
        Arc::from(b)
    }

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(key("a red fox"), key("  a red fox\n"));
        assert_eq!(key("a red fox").as_str(), "a red fox|s8|512x512|PNG");
        assert_ne!(key("a red fox"), key("a grey fox"));
        assert_ne!(
            CacheKey::derive("a", 8, 512, 512, ImageFormat::Png),
            CacheKey::derive("a", 8, 512, 512, ImageFormat::Jpeg)
        );
    }

    #[test]
    fn test_long_prompts_share_prefix_key() {
        let base = "x".repeat(PROMPT_KEY_CHARS);
        assert_eq!(key(&format!("{}tail-one", base)), key(&format!("{}tail-two", base)));

        let wide = "é".repeat(PROMPT_KEY_CHARS + 5);
        assert!(key(&wide).as_str().starts_with(&"é".repeat(PROMPT_KEY_CHARS)));
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = ResultCache::new(Duration::from_secs(60), 4);
        assert!(cache.get(&key("a")).is_none());
        cache.put(key("a"), bytes(b"img"));
        assert_eq!(cache.get(&key("a")).as_deref(), Some(&b"img"[..]));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_entries_expire_at_ttl() {
        let ttl = Duration::from_secs(10);
        let cache = ResultCache::new(ttl, 4);
        let t0 = Instant::now();
        cache.put_at(key("a"), bytes(b"1"), t0);

        assert!(cache.get_at(&key("a"), t0 + ttl - Duration::from_millis(1)).is_some());
        assert!(cache.get_at(&key("a"), t0 + ttl).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.put(key("a"), bytes(b"a"));
        cache.put(key("b"), bytes(b"b"));
        cache.put(key("c"), bytes(b"c"));

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(&key("a")));
        assert!(cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));

        // Reading "b" makes "c" the eviction candidate.
        assert!(cache.get(&key("b")).is_some());
        cache.put(key("d"), bytes(b"d"));
        assert!(cache.contains(&key("b")));
        assert!(!cache.contains(&key("c")));
        assert_eq!(cache.stats().evictions, 2);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = ResultCache::new(Duration::from_secs(60), 2);
        cache.put(key("a"), bytes(b"1"));
        cache.put(key("b"), bytes(b"2"));
        cache.put(key("a"), bytes(b"3"));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&key("a")).as_deref(), Some(&b"3"[..]));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_expired_entries_pruned_before_eviction() {
        let ttl = Duration::from_secs(5);
        let cache = ResultCache::new(ttl, 2);
        let t0 = Instant::now();
        cache.put_at(key("old"), bytes(b"o"), t0);
        cache.put_at(key("fresh"), bytes(b"f"), t0 + Duration::from_secs(4));
        cache.put_at(key("new"), bytes(b"n"), t0 + Duration::from_secs(6));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert!(cache.get_at(&key("fresh"), t0 + Duration::from_secs(6)).is_some());
    }

    #[test]
    fn test_expiry_sweep_is_throttled_until_full() {
        let ttl = Duration::from_millis(100);
        let cache = ResultCache::new(ttl, 3);
        let t0 = Instant::now();
        cache.put_at(key("a"), bytes(b"a"), t0);

        // "a" is stale but the sweep interval has not elapsed yet.
        cache.put_at(key("b"), bytes(b"b"), t0 + Duration::from_millis(200));
        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&key("a"), t0 + Duration::from_millis(200)).is_none());
        assert_eq!(cache.len(), 1);

        cache.put_at(key("c"), bytes(b"c"), t0 + Duration::from_millis(300));
        cache.put_at(key("d"), bytes(b"d"), t0 + Duration::from_millis(400));
        assert_eq!(cache.len(), 3);

        // A full cache always sweeps before it evicts.
        cache.put_at(key("e"), bytes(b"e"), t0 + Duration::from_millis(450));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);

        cache.put_at(key("f"), bytes(b"f"), t0 + PRUNE_INTERVAL + Duration::from_millis(500));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_access_stays_bounded() {
        let cache = Arc::new(ResultCache::new(Duration::from_secs(60), 16));
        let workers: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let k = key(&format!("{}-{}", t, i % 24));
                        cache.put(k.clone(), bytes(format!("{}", i).as_bytes()));
                        let _ = cache.get(&k);
                        assert!(cache.len() <= 16);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(cache.len() <= 16);
    }
}
