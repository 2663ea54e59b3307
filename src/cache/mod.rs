//! Result cache — per-loader memo table of resolved keys.
//!
//! Each entry holds the terminal outcome for a key, success or failure. A
//! cached failure means "attempted and failed", which is different from a
//! missing entry ("never attempted"). Entries are write-once: a second
//! [`ResultCache::put`] for the same key is ignored until the key is
//! invalidated with [`ResultCache::clear_key`] or [`ResultCache::clear`].
//!
//! The cache itself is not synchronized; the loader keeps it behind its
//! dispatcher lock.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::hash::Hash;

/// Write-once map from key to resolved result.
///
/// `T` is the stored outcome, normally `Result<V, LoadError>`.
///
/// # Examples
///
/// ```
/// use dataloader::cache::ResultCache;
///
/// let mut cache: ResultCache<u32, Result<u32, String>> = ResultCache::new();
/// assert!(cache.put(5, Ok(10)));
/// assert!(!cache.put(5, Ok(11)));
/// assert_eq!(cache.get(&5), Some(&Ok(10)));
///
/// cache.clear_key(&5);
/// assert!(cache.get(&5).is_none());
/// ```
#[derive(Debug, Clone)]
pub struct ResultCache<K, T> {
    entries: HashMap<K, T>,
}

impl<K, T> Default for ResultCache<K, T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, T> ResultCache<K, T>
where
    K: Eq + Hash,
{
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached outcome for `key`, if one exists.
    pub fn get<Q>(&self, key: &Q) -> Option<&T>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.get(key)
    }

    /// Returns `true` if `key` has a cached outcome.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Stores `value` for `key` unless the key is already cached.
    ///
    /// Returns `true` if the entry was written. An existing entry is never
    /// overwritten; clear it first to replace it.
    pub fn put(&mut self, key: K, value: T) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(value);
                true
            }
        }
    }

    /// Removes the entry for `key`, returning it if present.
    ///
    /// The next load of `key` goes back through the batch path.
    pub fn clear_key<Q>(&mut self, key: &Q) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.remove(key)
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of cached keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Cache = ResultCache<String, Result<u32, String>>;

    #[test]
    fn starts_empty() {
        let cache = Cache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn put_then_get() {
        let mut cache = Cache::new();
        assert!(cache.put("a".into(), Ok(1)));
        assert_eq!(cache.get("a"), Some(&Ok(1)));
        assert!(cache.contains("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn entries_are_write_once() {
        let mut cache = Cache::new();
        cache.put("a".into(), Ok(1));
        assert!(!cache.put("a".into(), Ok(2)));
        assert_eq!(cache.get("a"), Some(&Ok(1)));
    }

    #[test]
    fn errors_are_cached() {
        let mut cache = Cache::new();
        cache.put("missing".into(), Err("not found".into()));
        assert_eq!(cache.get("missing"), Some(&Err("not found".to_string())));
        assert!(!cache.put("missing".into(), Ok(3)));
    }

    #[test]
    fn clear_key_removes_one_entry() {
        let mut cache = Cache::new();
        cache.put("a".into(), Ok(1));
        cache.put("b".into(), Ok(2));
        assert_eq!(cache.clear_key("a"), Some(Ok(1)));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(&Ok(2)));
        assert!(cache.put("a".into(), Ok(9)));
        assert_eq!(cache.get("a"), Some(&Ok(9)));
    }

    #[test]
    fn clear_key_on_absent_key() {
        let mut cache = Cache::new();
        assert!(cache.clear_key("nope").is_none());
    }

    #[test]
    fn clear_removes_everything() {
        let mut cache = Cache::new();
        cache.put("a".into(), Ok(1));
        cache.put("b".into(), Err("boom".into()));
        cache.clear();
        assert!(cache.is_empty());
    }
}
