//! Replay detection cache.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::Utc;

use crate::cache::time_bounded::{CacheOptions, OverflowPolicy, PurgeMode, TimeBoundedCache};
use crate::error::{Error, UsageError};

/// Shortest nonce accepted.
pub const MIN_NONCE_LENGTH: usize = 4;

/// Population below which the cache never purges.
const PURGE_LOW_WATER_MARK: usize = 50;

/// Records nonces for replay detection.
///
/// Implementations are shared by every message an open protocol factory
/// processes and must be safe for concurrent use.
pub trait NonceCache: Send + Sync {
    /// Record a nonce. `Ok(false)` means it was already present: a replay.
    fn try_add_nonce(&self, nonce: &[u8]) -> Result<bool, Error>;

    /// Whether a nonce is present, without recording it.
    fn check_nonce(&self, nonce: &[u8]) -> Result<bool, Error>;

    /// How long each nonce is retained.
    fn caching_time_span(&self) -> Duration;
}

/// Nonce bytes hashed by their leading four bytes and compared in full.
#[derive(Debug, Clone, PartialEq, Eq)]
struct NonceKey(Vec<u8>);

impl Hash for NonceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let mut head = [0u8; 4];
        head.copy_from_slice(&self.0[..MIN_NONCE_LENGTH]);
        state.write_u32(u32::from_le_bytes(head));
    }
}

fn check_length(nonce: &[u8]) -> Result<(), Error> {
    if nonce.len() < MIN_NONCE_LENGTH {
        return Err(UsageError::InvalidArgument {
            name: "nonce",
            reason: format!(
                "must be at least {} bytes, got {}",
                MIN_NONCE_LENGTH,
                nonce.len()
            ),
        }
        .into());
    }
    Ok(())
}

/// In-memory [`NonceCache`] on a [`TimeBoundedCache`].
///
/// Size `caching_time_span` to at least the replay window plus twice the
/// maximum clock skew, so a nonce cannot age out while a replay of its
/// message would still be accepted as fresh.
pub struct InMemoryNonceCache {
    cache: TimeBoundedCache<NonceKey, ()>,
    caching_time_span: Duration,
}

impl InMemoryNonceCache {
    pub fn new(caching_time_span: Duration, capacity: usize) -> Self {
        let mut options = CacheOptions::new("nonce cache", capacity);
        options.purge_mode = PurgeMode::AccessBased;
        options.purge_interval = caching_time_span / 4;
        options.low_water_mark = PURGE_LOW_WATER_MARK;
        options.overflow = OverflowPolicy::PurgeExpired;
        Self {
            cache: TimeBoundedCache::new(options),
            caching_time_span,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Run a purge pass now.
    pub fn purge(&self) -> usize {
        self.cache.purge_expired()
    }
}

impl NonceCache for InMemoryNonceCache {
    fn try_add_nonce(&self, nonce: &[u8]) -> Result<bool, Error> {
        check_length(nonce)?;
        let span = chrono::Duration::from_std(self.caching_time_span).map_err(|e| {
            UsageError::InvalidArgument {
                name: "caching_time_span",
                reason: e.to_string(),
            }
        })?;
        let expires_at = Utc::now() + span;
        Ok(self
            .cache
            .try_add(NonceKey(nonce.to_vec()), (), expires_at, false)?)
    }

    fn check_nonce(&self, nonce: &[u8]) -> Result<bool, Error> {
        check_length(nonce)?;
        Ok(self.cache.contains(&NonceKey(nonce.to_vec())))
    }

    fn caching_time_span(&self) -> Duration {
        self.caching_time_span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_replay_rejected() {
        let cache = InMemoryNonceCache::new(Duration::from_secs(60), 100);
        assert!(!cache.check_nonce(b"nonce-1").unwrap());
        assert!(cache.try_add_nonce(b"nonce-1").unwrap());
        assert!(cache.check_nonce(b"nonce-1").unwrap());
        assert!(!cache.try_add_nonce(b"nonce-1").unwrap());
    }

    #[test]
    fn test_nonce_expires_after_span() {
        let cache = InMemoryNonceCache::new(Duration::from_millis(30), 100);
        assert!(cache.try_add_nonce(b"nonce-2").unwrap());
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.purge(), 1);
        assert!(!cache.check_nonce(b"nonce-2").unwrap());
        assert!(cache.try_add_nonce(b"nonce-2").unwrap());
    }

    #[test]
    fn test_short_nonce_rejected() {
        let cache = InMemoryNonceCache::new(Duration::from_secs(60), 100);
        let err = cache.try_add_nonce(b"abc").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(cache.check_nonce(&[]).is_err());
    }

    #[test]
    fn test_shared_prefix_compared_in_full() {
        let cache = InMemoryNonceCache::new(Duration::from_secs(60), 100);
        assert!(cache.try_add_nonce(b"abcd-1").unwrap());
        assert!(cache.try_add_nonce(b"abcd-2").unwrap());
        assert!(!cache.check_nonce(b"abcd-3").unwrap());
    }

    #[test]
    fn test_full_cache_reports_quota() {
        let cache = InMemoryNonceCache::new(Duration::from_secs(60), 2);
        cache.try_add_nonce(b"n-0001").unwrap();
        cache.try_add_nonce(b"n-0002").unwrap();
        let err = cache.try_add_nonce(b"n-0003").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_full_cache_reclaims_expired_nonces() {
        let cache = InMemoryNonceCache::new(Duration::from_millis(20), 2);
        cache.try_add_nonce(b"n-0001").unwrap();
        cache.try_add_nonce(b"n-0002").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.try_add_nonce(b"n-0003").unwrap());
        assert_eq!(cache.len(), 1);
    }
}
