//! Concurrent key/value store whose entries expire at an absolute time.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::error::QuotaExceededError;

/// When expired entries are purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// On writes, once the population reaches the low-water mark and the
    /// purge interval has passed since the last purge
    AccessBased,
    /// From a background task that runs while the cache is non-empty
    TimerBased,
}

/// What to do when an add finds the cache full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Fail with a quota error
    Reject,
    /// Purge expired entries, then fail if still full
    PurgeExpired,
}

/// Cache construction options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub name: &'static str,
    pub capacity: usize,
    pub purge_mode: PurgeMode,
    pub purge_interval: Duration,
    pub low_water_mark: usize,
    pub overflow: OverflowPolicy,
}

impl CacheOptions {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            purge_mode: PurgeMode::AccessBased,
            purge_interval: Duration::from_secs(60),
            low_water_mark: 0,
            overflow: OverflowPolicy::Reject,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    last_purge: DateTime<Utc>,
}

struct Shared<K, V> {
    options: CacheOptions,
    state: RwLock<CacheState<K, V>>,
    timer_armed: AtomicBool,
    timer_unavailable: AtomicBool,
}

static NO_RUNTIME_WARNING: Once = Once::new();

/// A capacity-bounded cache of expiring entries.
///
/// Writes run under the exclusive lock and reads under the shared lock.
/// Entries found expired on read are reported absent but stay in place
/// until a purge pass or a write to the same key.
pub struct TimeBoundedCache<K, V> {
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for TimeBoundedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<K, V> TimeBoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(options: CacheOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                state: RwLock::new(CacheState {
                    entries: HashMap::new(),
                    last_purge: Utc::now(),
                }),
                timer_armed: AtomicBool::new(false),
                timer_unavailable: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.options.capacity
    }

    /// Add an item expiring at `expires_at`.
    ///
    /// Returns `Ok(false)` when an unexpired item with the same key exists
    /// and `replace_existing` is not set. Never adds partially: a quota
    /// error leaves the cache unchanged.
    pub fn try_add(
        &self,
        key: K,
        value: V,
        expires_at: DateTime<Utc>,
        replace_existing: bool,
    ) -> Result<bool, QuotaExceededError> {
        {
            let mut state = self.shared.state.write();
            let now = Utc::now();
            self.shared.purge_if_due(&mut state, now);

            let existing_expired = state.entries.get(&key).map(|e| e.is_expired(now));
            match existing_expired {
                Some(false) if !replace_existing => return Ok(false),
                Some(_) => {}
                None => {
                    if state.entries.len() >= self.shared.options.capacity {
                        self.shared.enforce_quota(&mut state, now)?;
                    }
                }
            }
            state.entries.insert(key, Entry { value, expires_at });
        }
        self.arm_timer();
        Ok(true)
    }

    /// Unexpired value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let state = self.shared.state.read();
        let now = Utc::now();
        state
            .entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
    }

    /// Whether an unexpired entry exists for `key`.
    pub fn contains(&self, key: &K) -> bool {
        let state = self.shared.state.read();
        let now = Utc::now();
        state.entries.get(key).is_some_and(|e| !e.is_expired(now))
    }

    pub fn try_remove(&self, key: &K) -> bool {
        let mut state = self.shared.state.write();
        let now = Utc::now();
        self.shared.purge_if_due(&mut state, now);
        state.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.shared.state.write();
        state.entries.clear();
    }

    /// Number of stored entries, expired ones not yet purged included.
    pub fn len(&self) -> usize {
        self.shared.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.shared.state.write();
        purge(&mut state, Utc::now())
    }

    /// Snapshot of unexpired values.
    pub fn values(&self) -> Vec<V> {
        let state = self.shared.state.read();
        let now = Utc::now();
        state
            .entries
            .values()
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value.clone())
            .collect()
    }

    /// Whether a background purge task is currently scheduled.
    pub fn is_timer_armed(&self) -> bool {
        self.shared.timer_armed.load(Ordering::Acquire)
    }

    fn arm_timer(&self) {
        let shared = &self.shared;
        if shared.options.purge_mode != PurgeMode::TimerBased
            || shared.timer_unavailable.load(Ordering::Acquire)
        {
            return;
        }
        if shared.timer_armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                shared.timer_armed.store(false, Ordering::Release);
                shared.timer_unavailable.store(true, Ordering::Release);
                NO_RUNTIME_WARNING.call_once(|| {
                    warn!(
                        cache = shared.options.name,
                        "No async runtime available, falling back to access-based purging"
                    );
                });
                return;
            }
        };

        let weak = Arc::downgrade(shared);
        let interval = shared.options.purge_interval;
        handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                let done = {
                    let mut state = shared.state.write();
                    let removed = purge(&mut state, Utc::now());
                    if removed > 0 {
                        debug!(cache = shared.options.name, removed, "Purged expired entries");
                    }
                    if state.entries.is_empty() {
                        shared.timer_armed.store(false, Ordering::Release);
                        true
                    } else {
                        false
                    }
                };
                if done {
                    break;
                }
            }
        });
    }
}

impl<K, V> Shared<K, V>
where
    K: Eq + Hash,
{
    fn purge_if_due(&self, state: &mut CacheState<K, V>, now: DateTime<Utc>) {
        let access_based = self.options.purge_mode == PurgeMode::AccessBased
            || self.timer_unavailable.load(Ordering::Acquire);
        if !access_based || state.entries.len() < self.options.low_water_mark {
            return;
        }
        let interval = chrono::Duration::from_std(self.options.purge_interval)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        if now.signed_duration_since(state.last_purge) >= interval {
            let removed = purge(state, now);
            if removed > 0 {
                debug!(cache = self.options.name, removed, "Purged expired entries");
            }
        }
    }

    fn enforce_quota(
        &self,
        state: &mut CacheState<K, V>,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaExceededError> {
        if !self.state.is_locked_exclusive() {
            error!(
                cache = self.options.name,
                "Cache quota enforcement ran without the exclusive lock held, aborting"
            );
            std::process::abort();
        }

        if self.options.overflow == OverflowPolicy::PurgeExpired {
            purge(state, now);
        }
        if state.entries.len() >= self.options.capacity {
            warn!(
                cache = self.options.name,
                capacity = self.options.capacity,
                "Cache quota exceeded"
            );
            return Err(QuotaExceededError {
                cache: self.options.name,
                capacity: self.options.capacity,
            });
        }
        Ok(())
    }
}

fn purge<K: Eq + Hash, V>(state: &mut CacheState<K, V>, now: DateTime<Utc>) -> usize {
    let before = state.entries.len();
    state.entries.retain(|_, e| !e.is_expired(now));
    state.last_purge = now;
    before - state.entries.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn cache(capacity: usize, overflow: OverflowPolicy) -> TimeBoundedCache<String, u32> {
        let mut options = CacheOptions::new("test cache", capacity);
        options.overflow = overflow;
        TimeBoundedCache::new(options)
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + ChronoDuration::minutes(5)
    }

    // --- Basic operations ---

    #[test]
    fn test_add_and_get() {
        let cache = cache(10, OverflowPolicy::Reject);
        assert!(cache.try_add("a".into(), 1, later(), false).unwrap());
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn test_add_existing_without_replace() {
        let cache = cache(10, OverflowPolicy::Reject);
        assert!(cache.try_add("a".into(), 1, later(), false).unwrap());
        assert!(!cache.try_add("a".into(), 2, later(), false).unwrap());
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert!(cache.try_add("a".into(), 3, later(), true).unwrap());
        assert_eq!(cache.get(&"a".to_string()), Some(3));
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = cache(10, OverflowPolicy::Reject);
        cache.try_add("a".into(), 1, later(), false).unwrap();
        cache.try_add("b".into(), 2, later(), false).unwrap();
        assert!(cache.try_remove(&"a".to_string()));
        assert!(!cache.try_remove(&"a".to_string()));
        cache.clear();
        assert!(cache.is_empty());
    }

    // --- Expiration ---

    #[test]
    fn test_expiration_is_inclusive() {
        let cache = cache(10, OverflowPolicy::Reject);
        let now = Utc::now();
        cache.try_add("past".into(), 1, now, false).unwrap();
        assert_eq!(cache.get(&"past".to_string()), None);
        // Expired entries stay until purged
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entry_can_be_overwritten() {
        let cache = cache(10, OverflowPolicy::Reject);
        cache
            .try_add("a".into(), 1, Utc::now() - ChronoDuration::seconds(1), false)
            .unwrap();
        assert!(cache.try_add("a".into(), 2, later(), false).unwrap());
        assert_eq!(cache.get(&"a".to_string()), Some(2));
    }

    // --- Capacity ---

    #[test]
    fn test_capacity_reject() {
        let cache = cache(3, OverflowPolicy::Reject);
        for i in 0..3 {
            cache.try_add(format!("k{}", i), i, later(), false).unwrap();
        }
        let err = cache.try_add("k3".into(), 3, later(), false).unwrap_err();
        assert_eq!(err.capacity, 3);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_capacity_purges_expired_first() {
        let cache = cache(3, OverflowPolicy::PurgeExpired);
        cache
            .try_add("old".into(), 0, Utc::now() - ChronoDuration::seconds(1), false)
            .unwrap();
        cache.try_add("k1".into(), 1, later(), false).unwrap();
        cache.try_add("k2".into(), 2, later(), false).unwrap();
        assert!(cache.try_add("k3".into(), 3, later(), false).unwrap());
        assert_eq!(cache.len(), 3);
        assert!(cache.try_add("k4".into(), 4, later(), false).is_err());
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_replace_at_capacity_does_not_grow() {
        let cache = cache(1, OverflowPolicy::Reject);
        cache.try_add("a".into(), 1, later(), false).unwrap();
        assert!(cache.try_add("a".into(), 2, later(), true).unwrap());
        assert_eq!(cache.len(), 1);
    }

    // --- Purging ---

    #[test]
    fn test_access_based_purge_respects_low_water_mark() {
        let mut options = CacheOptions::new("test cache", 100);
        options.purge_interval = std::time::Duration::ZERO;
        options.low_water_mark = 3;
        let cache: TimeBoundedCache<String, u32> = TimeBoundedCache::new(options);
        let past = Utc::now() - ChronoDuration::seconds(1);
        cache.try_add("a".into(), 1, past, false).unwrap();
        cache.try_add("b".into(), 2, past, false).unwrap();
        // Two entries: below the mark, nothing purged
        cache.try_add("c".into(), 3, later(), false).unwrap();
        assert_eq!(cache.len(), 3);
        // Three entries: the next write purges the two expired ones
        cache.try_add("d".into(), 4, later(), false).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_timer_based_purge_disarms_when_empty() {
        let mut options = CacheOptions::new("test cache", 100);
        options.purge_mode = PurgeMode::TimerBased;
        options.purge_interval = std::time::Duration::from_millis(20);
        let cache: TimeBoundedCache<String, u32> = TimeBoundedCache::new(options);
        cache
            .try_add("a".into(), 1, Utc::now() + ChronoDuration::milliseconds(10), false)
            .unwrap();
        assert!(cache.is_timer_armed());
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        assert!(cache.is_empty());
        assert!(!cache.is_timer_armed());
    }

    #[test]
    fn test_timer_mode_without_runtime_falls_back() {
        let mut options = CacheOptions::new("test cache", 100);
        options.purge_mode = PurgeMode::TimerBased;
        options.purge_interval = std::time::Duration::ZERO;
        let cache: TimeBoundedCache<String, u32> = TimeBoundedCache::new(options);
        cache
            .try_add("a".into(), 1, Utc::now() - ChronoDuration::seconds(1), false)
            .unwrap();
        assert!(!cache.is_timer_armed());
        cache.try_add("b".into(), 2, later(), false).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_adds_never_exceed_capacity() {
        let cache = cache(50, OverflowPolicy::Reject);
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..20 {
                        let _ = cache.try_add(format!("{}-{}", t, i), i, later(), false);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 50);
    }
}
