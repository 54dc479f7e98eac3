//! Resolution of key identifier clauses to tokens and keys.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::crypto::SymmetricKey;
use crate::error::MessageSecurityError;
use crate::tokens::{
    unique_id, KeyIdentifierClause, ReferenceStyle, SecurityToken, SecurityTokenParameters,
    TokenKind, TokenReference,
};

/// Out-of-band token source consulted when no registered token matches,
/// such as a responder's session token cache.
pub trait TokenLookup: Send + Sync {
    fn lookup(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>>;
}

/// Bounds on implicit key derivation.
#[derive(Debug, Clone)]
pub struct ResolverLimits {
    /// Longest derived key a reference may request, in bytes
    pub max_derived_key_length: usize,
    /// Derived keys that may be created for one message
    pub max_derived_keys: usize,
    /// Length used when a reference does not request one, in bytes
    pub default_derived_key_length: usize,
    pub derivation_label: String,
}

impl Default for ResolverLimits {
    fn default() -> Self {
        Self {
            max_derived_key_length: 64,
            max_derived_keys: 16,
            default_derived_key_length: 32,
            derivation_label: "WS-SecureConversationWS-SecureConversation".to_string(),
        }
    }
}

struct ResolverEntry {
    token: Arc<SecurityToken>,
    style: ReferenceStyle,
    parameters: Option<SecurityTokenParameters>,
}

impl ResolverEntry {
    fn matches(&self, clause: &KeyIdentifierClause) -> bool {
        match &self.parameters {
            Some(parameters) => {
                parameters.matches_key_identifier_clause(&self.token, clause, self.style)
            }
            None => match (&clause.reference, self.style) {
                (TokenReference::LocalId(id), ReferenceStyle::Internal) => self.token.id() == id,
                (TokenReference::LocalId(_), ReferenceStyle::External) => false,
                (_, _) => self.token.matches_key_identifier_clause(clause),
            },
        }
    }
}

/// Derived keys are memoized per (base token, nonce, length).
type DerivedKeyId = (String, Vec<u8>, usize);

/// Tokens seen so far while processing one message.
///
/// Matching is a linear scan in insertion order: the first token that
/// matches wins.
pub struct TokenResolver {
    entries: Vec<ResolverEntry>,
    derived: HashMap<DerivedKeyId, Arc<SecurityToken>>,
    derived_count: usize,
    limits: ResolverLimits,
    fallback: Option<Arc<dyn TokenLookup>>,
}

impl TokenResolver {
    pub fn new(limits: ResolverLimits) -> Self {
        Self {
            entries: Vec::new(),
            derived: HashMap::new(),
            derived_count: 0,
            limits,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn TokenLookup>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn limits(&self) -> &ResolverLimits {
        &self.limits
    }

    /// Register a token.
    pub fn add(
        &mut self,
        token: Arc<SecurityToken>,
        style: ReferenceStyle,
        parameters: Option<SecurityTokenParameters>,
    ) {
        self.entries.push(ResolverEntry {
            token,
            style,
            parameters,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Derived keys created so far, explicit and implicit.
    pub fn derived_key_count(&self) -> usize {
        self.derived_count
    }

    /// Registered token with this id.
    pub fn find_by_id(&self, id: &str) -> Option<Arc<SecurityToken>> {
        self.entries
            .iter()
            .find(|e| e.token.id() == id)
            .map(|e| Arc::clone(&e.token))
    }

    /// Count one derived key against the per-message budget.
    pub fn record_derived_key(&mut self) -> Result<(), MessageSecurityError> {
        if self.derived_count >= self.limits.max_derived_keys {
            return Err(MessageSecurityError::DerivedKeyLimitExceeded(
                self.limits.max_derived_keys,
            ));
        }
        self.derived_count += 1;
        Ok(())
    }

    /// Check a requested derivation window against the limit.
    ///
    /// P_SHA1 generates every byte up to `offset + length`, so the end of
    /// the window is what gets bounded, not just its length.
    pub fn check_derived_key_range(&self, offset: usize, length: usize) -> Result<(), MessageSecurityError> {
        let max = self.limits.max_derived_key_length;
        match offset.checked_add(length) {
            Some(end) if end <= max => Ok(()),
            Some(end) => Err(MessageSecurityError::DerivedKeyTooLong { requested: end, max }),
            None => Err(MessageSecurityError::DerivedKeyTooLong {
                requested: usize::MAX,
                max,
            }),
        }
    }

    /// Resolve a clause to a token.
    ///
    /// `allow_intrinsic` covers tokens the resolver creates itself rather
    /// than finds. With it, a clause with a derivation resolves its base and
    /// derives (once) a key of the requested length from the base token's
    /// symmetric key, and an unmatched certificate reference yields a token
    /// built from the embedded certificate; trusting it is up to the caller.
    /// Without it, neither is created and such clauses resolve to `None`.
    pub fn resolve(
        &mut self,
        clause: &KeyIdentifierClause,
        match_only_external: bool,
        allow_intrinsic: bool,
    ) -> Result<Option<Arc<SecurityToken>>, MessageSecurityError> {
        let Some(derivation) = &clause.derivation else {
            return Ok(self.resolve_exact(clause, match_only_external, allow_intrinsic));
        };
        if !allow_intrinsic {
            return Ok(None);
        }

        let Some(base) = self.resolve_exact(&clause.base(), match_only_external, allow_intrinsic)
        else {
            return Ok(None);
        };
        let key = base
            .symmetric_key()
            .ok_or_else(|| MessageSecurityError::MissingSymmetricKey(base.id().to_string()))?;
        let length = derivation
            .length
            .unwrap_or(self.limits.default_derived_key_length);
        self.check_derived_key_range(0, length)?;

        let memo_key = (base.id().to_string(), derivation.nonce.clone(), length);
        if let Some(existing) = self.derived.get(&memo_key) {
            return Ok(Some(Arc::clone(existing)));
        }

        self.record_derived_key()?;
        let label = self.limits.derivation_label.clone();
        let derived_key = key.derive(label.as_bytes(), &derivation.nonce, 0, length);
        let token = Arc::new(SecurityToken::new(
            unique_id(),
            TokenKind::DerivedKey {
                base_id: base.id().to_string(),
                label,
                nonce: derivation.nonce.clone(),
                offset: 0,
                length,
                key: derived_key,
            },
        ));
        debug!(base = %base.id(), length, "Derived implicit key");
        self.derived.insert(memo_key, Arc::clone(&token));
        Ok(Some(token))
    }

    /// Resolve a clause straight to its symmetric key.
    pub fn resolve_key(
        &mut self,
        clause: &KeyIdentifierClause,
    ) -> Result<Option<SymmetricKey>, MessageSecurityError> {
        Ok(self
            .resolve(clause, false, true)?
            .and_then(|token| token.symmetric_key().cloned()))
    }

    fn resolve_exact(
        &mut self,
        clause: &KeyIdentifierClause,
        match_only_external: bool,
        allow_intrinsic: bool,
    ) -> Option<Arc<SecurityToken>> {
        let found = self
            .entries
            .iter()
            .filter(|e| !match_only_external || e.style == ReferenceStyle::External)
            .find(|e| e.matches(clause))
            .map(|e| Arc::clone(&e.token));
        if found.is_some() {
            return found;
        }

        if let Some(token) = self.fallback.as_ref().and_then(|f| f.lookup(clause)) {
            self.add(Arc::clone(&token), ReferenceStyle::External, None);
            return Some(token);
        }

        if let (true, TokenReference::X509RawData(raw)) = (allow_intrinsic, &clause.reference) {
            let token = Arc::new(SecurityToken::new(
                unique_id(),
                TokenKind::X509 {
                    raw_data: raw.clone(),
                },
            ));
            self.add(Arc::clone(&token), ReferenceStyle::External, None);
            return Some(token);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, context: &str, key: u8) -> Arc<SecurityToken> {
        Arc::new(SecurityToken::new(
            id,
            TokenKind::SecurityContext {
                context_id: context.to_string(),
                generation: None,
                key: SymmetricKey::new(vec![key; 32]),
            },
        ))
    }

    fn resolver() -> TokenResolver {
        TokenResolver::new(ResolverLimits::default())
    }

    // --- Matching ---

    #[test]
    fn test_internal_token_by_id() {
        let mut resolver = resolver();
        resolver.add(session("s1", "urn:a", 1), ReferenceStyle::Internal, None);
        let found = resolver
            .resolve(&KeyIdentifierClause::local("s1"), false, false)
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), "s1");
        assert!(resolver
            .resolve(&KeyIdentifierClause::local("s2"), false, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_match_only_external_skips_internal_tokens() {
        let mut resolver = resolver();
        resolver.add(session("s1", "urn:a", 1), ReferenceStyle::Internal, None);
        let clause = KeyIdentifierClause::security_context("urn:a", None);
        assert!(resolver.resolve(&clause, true, false).unwrap().is_none());
        assert!(resolver.resolve(&clause, false, false).unwrap().is_some());
    }

    #[test]
    fn test_first_added_wins() {
        let mut resolver = resolver();
        resolver.add(
            session("by-params", "urn:same", 1),
            ReferenceStyle::External,
            Some(SecurityTokenParameters::secure_conversation(false)),
        );
        resolver.add(session("plain", "urn:same", 2), ReferenceStyle::External, None);
        let clause = KeyIdentifierClause::security_context("urn:same", None);
        let found = resolver.resolve(&clause, false, false).unwrap().unwrap();
        assert_eq!(found.id(), "by-params");

        let mut reversed = TokenResolver::new(ResolverLimits::default());
        reversed.add(session("plain", "urn:same", 2), ReferenceStyle::External, None);
        reversed.add(
            session("by-params", "urn:same", 1),
            ReferenceStyle::External,
            Some(SecurityTokenParameters::secure_conversation(false)),
        );
        let found = reversed.resolve(&clause, false, false).unwrap().unwrap();
        assert_eq!(found.id(), "plain");
    }

    #[test]
    fn test_fallback_lookup_registers_token() {
        struct One(Arc<SecurityToken>);
        impl TokenLookup for One {
            fn lookup(&self, clause: &KeyIdentifierClause) -> Option<Arc<SecurityToken>> {
                self.0
                    .matches_key_identifier_clause(clause)
                    .then(|| Arc::clone(&self.0))
            }
        }
        let token = session("cached", "urn:cached", 4);
        let mut resolver = resolver().with_fallback(Arc::new(One(token)));
        let clause = KeyIdentifierClause::security_context("urn:cached", None);
        assert!(resolver.resolve(&clause, false, false).unwrap().is_some());
        assert_eq!(resolver.len(), 1);
        assert!(resolver.find_by_id("cached").is_some());
    }

    // --- Derived keys ---

    #[test]
    fn test_derived_key_is_memoized() {
        let mut resolver = resolver();
        resolver.add(session("s1", "urn:a", 1), ReferenceStyle::Internal, None);
        let clause = KeyIdentifierClause::local("s1").with_derivation(vec![7; 16], Some(24));
        let first = resolver.resolve(&clause, false, true).unwrap().unwrap();
        let second = resolver.resolve(&clause, false, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.symmetric_key().unwrap().len(), 24);
        assert_eq!(resolver.derived_key_count(), 1);

        let other_length = KeyIdentifierClause::local("s1").with_derivation(vec![7; 16], Some(32));
        let third = resolver.resolve(&other_length, false, true).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn test_derived_key_matches_direct_derivation() {
        let mut resolver = resolver();
        let base = session("s1", "urn:a", 1);
        resolver.add(Arc::clone(&base), ReferenceStyle::Internal, None);
        let clause = KeyIdentifierClause::local("s1").with_derivation(vec![9; 16], None);
        let key = resolver.resolve_key(&clause).unwrap().unwrap();
        let expected = base.symmetric_key().unwrap().derive(
            b"WS-SecureConversationWS-SecureConversation",
            &[9; 16],
            0,
            32,
        );
        assert_eq!(key, expected);
    }

    #[test]
    fn test_derivation_requires_intrinsic() {
        let mut resolver = resolver();
        resolver.add(session("s1", "urn:a", 1), ReferenceStyle::Internal, None);
        let clause = KeyIdentifierClause::local("s1").with_derivation(vec![3; 16], None);
        assert!(resolver.resolve(&clause, false, false).unwrap().is_none());
        assert_eq!(resolver.derived_key_count(), 0);
        assert!(resolver.resolve(&clause, false, true).unwrap().is_some());
        assert_eq!(resolver.derived_key_count(), 1);
    }

    #[test]
    fn test_derived_key_length_limit() {
        let mut resolver = resolver();
        resolver.add(session("s1", "urn:a", 1), ReferenceStyle::Internal, None);
        let clause = KeyIdentifierClause::local("s1").with_derivation(vec![1; 16], Some(4096));
        assert_eq!(
            resolver.resolve(&clause, false, true).unwrap_err(),
            MessageSecurityError::DerivedKeyTooLong {
                requested: 4096,
                max: 64
            }
        );
    }

    #[test]
    fn test_derived_key_range_counts_offset() {
        let resolver = resolver();
        assert!(resolver.check_derived_key_range(32, 32).is_ok());
        assert_eq!(
            resolver.check_derived_key_range(20_000_000, 32).unwrap_err(),
            MessageSecurityError::DerivedKeyTooLong {
                requested: 20_000_032,
                max: 64
            }
        );
        assert_eq!(
            resolver.check_derived_key_range(usize::MAX, 32).unwrap_err(),
            MessageSecurityError::DerivedKeyTooLong {
                requested: usize::MAX,
                max: 64
            }
        );
    }

    #[test]
    fn test_derived_key_budget() {
        let mut resolver = TokenResolver::new(ResolverLimits {
            max_derived_keys: 2,
            ..ResolverLimits::default()
        });
        resolver.add(session("s1", "urn:a", 1), ReferenceStyle::Internal, None);
        for n in 0..2u8 {
            let clause = KeyIdentifierClause::local("s1").with_derivation(vec![n; 16], None);
            resolver.resolve(&clause, false, true).unwrap();
        }
        let clause = KeyIdentifierClause::local("s1").with_derivation(vec![99; 16], None);
        assert_eq!(
            resolver.resolve(&clause, false, true).unwrap_err(),
            MessageSecurityError::DerivedKeyLimitExceeded(2)
        );
    }

    #[test]
    fn test_derivation_needs_symmetric_key() {
        let mut resolver = resolver();
        resolver.add(
            Arc::new(SecurityToken::new("cert", TokenKind::X509 { raw_data: vec![1] })),
            ReferenceStyle::Internal,
            None,
        );
        let clause = KeyIdentifierClause::local("cert").with_derivation(vec![1; 16], None);
        assert_eq!(
            resolver.resolve(&clause, false, true).unwrap_err(),
            MessageSecurityError::MissingSymmetricKey("cert".to_string())
        );
    }

    // --- Intrinsic tokens ---

    #[test]
    fn test_intrinsic_x509() {
        let mut resolver = resolver();
        let clause = KeyIdentifierClause::x509(vec![0x30, 0x01]);
        assert!(resolver.resolve(&clause, false, false).unwrap().is_none());
        let first = resolver.resolve(&clause, false, true).unwrap().unwrap();
        let second = resolver.resolve(&clause, false, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(resolver.resolve_key(&clause).unwrap().is_none());
    }
}
