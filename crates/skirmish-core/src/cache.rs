//! Read-through cache for universe reference data.
//!
//! System and type metadata never changes during a job, so lookups are
//! memoised. The cache is an ordinary value owned by whoever builds the
//! [`Detector`](crate::detector::Detector); there is no process-wide state.

use std::{
  collections::{HashMap, VecDeque},
  hash::Hash,
  sync::Mutex,
  time::{Duration, Instant},
};

use crate::{
  Error, Result,
  battle::SystemInfo,
  killmail::{EntityId, LocationId},
  store::SystemDirectory,
};

// ─── ReferenceCache ──────────────────────────────────────────────────────────

/// A bounded map whose entries expire `ttl` after insertion. When full, the
/// oldest insertion is evicted.
pub struct ReferenceCache<K, V> {
  capacity: usize,
  ttl:      Duration,
  inner:    Mutex<CacheState<K, V>>,
}

struct CacheState<K, V> {
  entries: HashMap<K, Entry<V>>,
  /// Insertion order as `(key, seq)`; stale pairs are skipped on eviction.
  order:   VecDeque<(K, u64)>,
  seq:     u64,
}

struct Entry<V> {
  inserted: Instant,
  seq:      u64,
  value:    V,
}

impl<K, V> ReferenceCache<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new(capacity: usize, ttl: Duration) -> Self {
    Self {
      capacity: capacity.max(1),
      ttl,
      inner: Mutex::new(CacheState {
        entries: HashMap::new(),
        order:   VecDeque::new(),
        seq:     0,
      }),
    }
  }

  /// A live entry for `key`, if any.
  pub fn get(&self, key: &K) -> Option<V> {
    let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
    state
      .entries
      .get(key)
      .filter(|e| e.inserted.elapsed() < self.ttl)
      .map(|e| e.value.clone())
  }

  pub fn insert(&self, key: K, value: V) {
    let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());

    if !state.entries.contains_key(&key) {
      while state.entries.len() >= self.capacity {
        let Some((old, seq)) = state.order.pop_front() else { break };
        if state.entries.get(&old).is_some_and(|e| e.seq == seq) {
          state.entries.remove(&old);
        }
      }
    }

    state.seq += 1;
    let seq = state.seq;
    state
      .entries
      .insert(key.clone(), Entry { inserted: Instant::now(), seq, value });
    state.order.push_back((key, seq));

    if state.order.len() > self.capacity * 2 {
      let CacheState { entries, order, .. } = &mut *state;
      order.retain(|(k, seq)| entries.get(k).is_some_and(|e| e.seq == *seq));
    }
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
  }

  pub fn is_empty(&self) -> bool { self.len() == 0 }
}

// ─── CachedDirectory ─────────────────────────────────────────────────────────

/// A [`SystemDirectory`] fronted by two [`ReferenceCache`]s. Misses are cached
/// too, so an unknown system costs one lookup per TTL.
pub struct CachedDirectory<D> {
  inner:   D,
  systems: ReferenceCache<LocationId, Option<SystemInfo>>,
  types:   ReferenceCache<EntityId, Option<String>>,
}

impl<D: SystemDirectory> CachedDirectory<D> {
  pub fn new(inner: D, capacity: usize, ttl: Duration) -> Self {
    Self {
      inner,
      systems: ReferenceCache::new(capacity, ttl),
      types: ReferenceCache::new(capacity, ttl),
    }
  }

  /// System metadata, or a placeholder carrying only the id.
  pub async fn system(&self, location_id: LocationId) -> Result<SystemInfo> {
    let info = match self.systems.get(&location_id) {
      Some(hit) => hit,
      None => {
        let fetched = self
          .inner
          .system_info(location_id)
          .await
          .map_err(Error::query)?;
        self.systems.insert(location_id, fetched.clone());
        fetched
      }
    };
    Ok(info.unwrap_or_else(|| SystemInfo::unknown(location_id)))
  }

  pub async fn type_name(&self, type_id: EntityId) -> Result<Option<String>> {
    if let Some(hit) = self.types.get(&type_id) {
      return Ok(hit);
    }
    let fetched = self.inner.type_name(type_id).await.map_err(Error::query)?;
    self.types.insert(type_id, fetched.clone());
    Ok(fetched)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::fixtures::MemoryDirectory;

  #[test]
  fn evicts_oldest_when_full() {
    let cache = ReferenceCache::new(2, Duration::from_secs(60));
    cache.insert(1, "a");
    cache.insert(2, "b");
    cache.insert(3, "c");

    assert_eq!(cache.len(), 2);
    assert_eq!(cache.get(&1), None);
    assert_eq!(cache.get(&3), Some("c"));
  }

  #[test]
  fn reinserting_a_key_does_not_evict_it() {
    let cache = ReferenceCache::new(2, Duration::from_secs(60));
    cache.insert(1, "a");
    cache.insert(2, "b");
    cache.insert(1, "a2");
    cache.insert(3, "c");

    assert_eq!(cache.get(&1), Some("a2"));
    assert_eq!(cache.get(&2), None);
  }

  #[test]
  fn expired_entries_miss() {
    let cache = ReferenceCache::new(4, Duration::ZERO);
    cache.insert(1, "a");
    assert_eq!(cache.get(&1), None);
  }

  #[tokio::test]
  async fn directory_lookups_are_memoised() {
    let directory = MemoryDirectory::with_system(30000142, "Jita");
    let cached = CachedDirectory::new(directory, 16, Duration::from_secs(60));

    assert_eq!(cached.system(30000142).await.unwrap().name.as_deref(), Some("Jita"));
    assert_eq!(cached.system(30000142).await.unwrap().name.as_deref(), Some("Jita"));
    assert_eq!(cached.inner.system_lookups(), 1);

    let unknown = cached.system(1).await.unwrap();
    assert_eq!(unknown, SystemInfo::unknown(1));
  }

  #[tokio::test]
  async fn type_misses_are_cached_too() {
    let directory = MemoryDirectory::default().and_type(587, "Rifter");
    let cached = CachedDirectory::new(directory, 16, Duration::from_secs(60));

    assert_eq!(cached.type_name(587).await.unwrap().as_deref(), Some("Rifter"));
    assert_eq!(cached.type_name(1).await.unwrap(), None);
    assert_eq!(cached.type_name(1).await.unwrap(), None);
    assert_eq!(cached.inner.type_lookups(), 2);
  }
}
