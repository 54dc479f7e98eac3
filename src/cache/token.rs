//! Cache of issued session tokens, keyed by context id and generation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::cache::time_bounded::{CacheOptions, OverflowPolicy, PurgeMode, TimeBoundedCache};
use crate::error::{Error, UsageError};
use crate::resolver::TokenLookup;
use crate::tokens::{KeyIdentifierClause, SecurityToken, TokenReference};

type ContextKey = (String, Option<String>);

/// Session tokens known to a responder.
///
/// Entries expire with their token. Tokens without an expiry are kept for
/// the configured default lifetime.
#[derive(Clone)]
pub struct SecurityContextTokenCache {
    cache: TimeBoundedCache<ContextKey, Arc<SecurityToken>>,
    default_lifetime: Duration,
}

impl SecurityContextTokenCache {
    pub fn new(capacity: usize, purge_interval: Duration, default_lifetime: Duration) -> Self {
        let mut options = CacheOptions::new("session token cache", capacity);
        options.purge_mode = PurgeMode::TimerBased;
        options.purge_interval = purge_interval;
        options.overflow = OverflowPolicy::PurgeExpired;
        Self {
            cache: TimeBoundedCache::new(options),
            default_lifetime,
        }
    }

    /// Add a session token. Returns `Ok(false)` if one with the same
    /// context and generation is already cached.
    pub fn add_context(&self, token: Arc<SecurityToken>) -> Result<bool, Error> {
        let (context_id, generation) = token.context().ok_or_else(|| UsageError::InvalidArgument {
            name: "token",
            reason: format!("token '{}' is not a session token", token.id()),
        })?;
        let key = (context_id.to_string(), generation.map(str::to_string));
        let expires_at = match token.valid_to() {
            Some(valid_to) => valid_to,
            None => {
                Utc::now()
                    + chrono::Duration::from_std(self.default_lifetime)
                        .unwrap_or_else(|_| chrono::Duration::days(1))
            }
        };
        let added = self
            .cache
            .try_add(key, Arc::clone(&token), expires_at, false)?;
        if added {
            debug!(context_id = %context_id, "Cached session token");
        }
        Ok(added)
    }

    pub fn get_context(&self, context_id: &str, generation: Option<&str>) -> Option<Arc<SecurityToken>> {
        self.cache
            .get(&(context_id.to_string(), generation.map(str::to_string)))
    }

    pub fn remove_context(&self, context_id: &str, generation: Option<&str>) -> bool {
        self.cache
            .try_remove(&(context_id.to_string(), generation.map(str::to_string)))
    }

    /// Every unexpired token of a context, all generations.
    pub fn get_all_contexts(&self, context_id: &str) -> Vec<Arc<SecurityToken>> {
        self.cache
            .values()
            .into_iter()
            .filter(|t| t.context().is_some_and(|(c, _)| c == context_id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&self) {
        self.cache.clear();
    }
}

impl TokenLookup for SecurityContextTokenCache {
    fn lookup(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>> {
        match &clause.reference {
            TokenReference::SecurityContext {
                context_id,
                generation,
            } => self.get_context(context_id, generation.as_deref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SymmetricKey;
    use crate::tokens::TokenKind;

    fn session(context: &str, generation: Option<&str>) -> Arc<SecurityToken> {
        Arc::new(SecurityToken::new(
            format!("id-{}", context),
            TokenKind::SecurityContext {
                context_id: context.to_string(),
                generation: generation.map(str::to_string),
                key: SymmetricKey::new(vec![3; 32]),
            },
        ))
    }

    fn cache() -> SecurityContextTokenCache {
        SecurityContextTokenCache::new(10, Duration::from_secs(60), Duration::from_secs(600))
    }

    #[test]
    fn test_add_and_lookup() {
        let cache = cache();
        assert!(cache.add_context(session("urn:a", None)).unwrap());
        assert!(!cache.add_context(session("urn:a", None)).unwrap());
        assert!(cache.get_context("urn:a", None).is_some());
        assert!(cache.get_context("urn:a", Some("1")).is_none());

        let clause = KeyIdentifierClause::security_context("urn:a", None);
        assert_eq!(cache.lookup(&clause).unwrap().id(), "id-urn:a");
        assert!(cache.lookup(&KeyIdentifierClause::local("id-urn:a")).is_none());
    }

    #[test]
    fn test_generations_are_distinct() {
        let cache = cache();
        cache.add_context(session("urn:b", Some("1"))).unwrap();
        cache.add_context(session("urn:b", Some("2"))).unwrap();
        assert_eq!(cache.get_all_contexts("urn:b").len(), 2);
        assert!(cache.remove_context("urn:b", Some("1")));
        assert_eq!(cache.get_all_contexts("urn:b").len(), 1);
    }

    #[test]
    fn test_expired_token_not_returned() {
        let cache = cache();
        let now = Utc::now();
        let token = SecurityToken::new(
            "old",
            TokenKind::SecurityContext {
                context_id: "urn:c".to_string(),
                generation: None,
                key: SymmetricKey::new(vec![3; 32]),
            },
        )
        .with_validity(now - chrono::Duration::hours(2), Some(now - chrono::Duration::hours(1)));
        cache.add_context(Arc::new(token)).unwrap();
        assert!(cache.get_context("urn:c", None).is_none());
    }

    #[test]
    fn test_rejects_non_session_token() {
        let cache = cache();
        let token = Arc::new(SecurityToken::new(
            "bs",
            TokenKind::BinarySecret {
                key: SymmetricKey::new(vec![1; 16]),
            },
        ));
        assert!(cache.add_context(token).is_err());
    }
}
