//! Configuration types for WS-Security message protection.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::algorithms::AlgorithmSuite;
use crate::cache::SecurityContextTokenCache;
use crate::error::ConfigError;
use crate::header::{MessageProtectionOrder, SecurityHeaderLayout};
use crate::message::SoapVersion;
use crate::negotiation::{IssuerSettings, NegotiationSettings};
use crate::protocol::{ProtocolSettings, ProtocolVariant};
use crate::resolver::ResolverLimits;
use crate::serializer::PasswordType;
use crate::standards::StandardsDriver;
use crate::trust::KeyEntropyMode;
use crate::xml::DEFAULT_MAX_DEPTH;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsSecurityConfig {
    /// Config version
    pub version: String,

    /// Message protection
    pub protocol: ProtocolConfig,

    /// Algorithm suite for signatures, encryption and key derivation
    pub algorithm_suite: AlgorithmSuite,

    /// WS-Security, WS-Trust and WS-SecureConversation versions
    pub standards: StandardsDriver,

    /// Session token negotiation and issuing
    pub negotiation: NegotiationConfig,

    /// Per-message resource limits
    pub limits: LimitsConfig,

    /// Session token cache
    pub token_cache: TokenCacheConfig,
}

impl Default for WsSecurityConfig {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            protocol: ProtocolConfig::default(),
            algorithm_suite: AlgorithmSuite::default(),
            standards: StandardsDriver::default(),
            negotiation: NegotiationConfig::default(),
            limits: LimitsConfig::default(),
            token_cache: TokenCacheConfig::default(),
        }
    }
}

impl WsSecurityConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Load(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&yaml)
    }

    /// Settings for a protocol factory.
    pub fn protocol_settings(&self) -> ProtocolSettings {
        let p = &self.protocol;
        let defaults = ProtocolSettings::default();
        ProtocolSettings {
            protection_order: p.protection_order,
            layout: p.layout,
            include_timestamp: p.include_timestamp,
            timestamp_validity: Duration::from_secs(p.timestamp_validity_secs),
            detect_replays: p.detect_replays,
            max_clock_skew: p.max_clock_skew_secs.map(Duration::from_secs),
            replay_window: p.replay_window_secs.map(Duration::from_secs),
            max_cached_nonces: p.max_cached_nonces,
            require_derived_keys: p.require_derived_keys,
            require_signature_confirmation: p.require_signature_confirmation,
            encrypt_signature: p.encrypt_signature,
            limits: ResolverLimits {
                max_derived_key_length: self.limits.max_derived_key_length,
                max_derived_keys: self.limits.max_derived_keys,
                ..ResolverLimits::default()
            },
            max_message_size: self.limits.max_message_size,
            max_depth: self.limits.max_depth,
            password_type: p.password_type,
            ..defaults
        }
    }

    /// Settings for the negotiating side.
    pub fn negotiation_settings(&self) -> NegotiationSettings {
        NegotiationSettings {
            key_entropy_mode: self.negotiation.key_entropy_mode,
            key_size_bits: self.negotiation.key_size_bits,
            soap_version: self.negotiation.soap_version,
            renewal_margin: Duration::from_secs(self.negotiation.renewal_margin_secs),
        }
    }

    /// Settings for the issuing side.
    pub fn issuer_settings(&self) -> IssuerSettings {
        IssuerSettings {
            key_entropy_mode: self.negotiation.key_entropy_mode,
            key_size_bits: self
                .negotiation
                .key_size_bits
                .unwrap_or(self.algorithm_suite.capabilities().default_symmetric_key_length),
            token_lifetime: Duration::from_secs(self.negotiation.token_lifetime_secs),
        }
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation.timeout_secs)
    }

    /// Empty session token cache sized from this configuration.
    pub fn build_token_cache(&self) -> SecurityContextTokenCache {
        SecurityContextTokenCache::new(
            self.token_cache.max_cached_tokens,
            Duration::from_secs(self.token_cache.purge_interval_secs),
            Duration::from_secs(self.negotiation.token_lifetime_secs),
        )
    }
}

/// Message protection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub variant: ProtocolVariant,

    /// Sign then encrypt, or encrypt then sign
    pub protection_order: MessageProtectionOrder,

    pub layout: SecurityHeaderLayout,

    /// Add a timestamp to outgoing headers and require one on incoming
    pub include_timestamp: bool,

    pub timestamp_validity_secs: u64,

    /// Reject messages whose signature was already seen
    pub detect_replays: bool,

    /// `null` is infinite
    pub max_clock_skew_secs: Option<u64>,

    /// `null` is infinite
    pub replay_window_secs: Option<u64>,

    pub max_cached_nonces: usize,

    /// Sign and encrypt with keys derived from the session key
    pub require_derived_keys: bool,

    /// Echo request signatures in replies (WS-Security 1.1)
    pub require_signature_confirmation: bool,

    pub encrypt_signature: bool,

    /// How username tokens carry their password
    pub password_type: PasswordType,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            variant: ProtocolVariant::SymmetricSessionKey,
            protection_order: MessageProtectionOrder::SignBeforeEncrypt,
            layout: SecurityHeaderLayout::Strict,
            include_timestamp: true,
            timestamp_validity_secs: 300,
            detect_replays: true,
            max_clock_skew_secs: Some(300),
            replay_window_secs: Some(300),
            max_cached_nonces: 900_000,
            require_derived_keys: true,
            require_signature_confirmation: false,
            encrypt_signature: false,
            password_type: PasswordType::PasswordDigest,
        }
    }
}

/// Session token negotiation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    pub key_entropy_mode: KeyEntropyMode,

    /// Session key size; `null` uses the algorithm suite default
    pub key_size_bits: Option<usize>,

    /// Lifetime of issued session tokens
    pub token_lifetime_secs: u64,

    /// Timeout for one negotiation exchange
    pub timeout_secs: u64,

    /// Renew the session token this long before it expires
    pub renewal_margin_secs: u64,

    pub soap_version: SoapVersion,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            key_entropy_mode: KeyEntropyMode::CombinedEntropy,
            key_size_bits: None,
            token_lifetime_secs: 36_000, // 10 hours
            timeout_secs: 60,
            renewal_margin_secs: 60,
            soap_version: SoapVersion::Soap12,
        }
    }
}

/// Per-message limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Derived key tokens accepted in one header
    pub max_derived_keys: usize,

    /// Longest derived key accepted, in bytes
    pub max_derived_key_length: usize,

    /// Largest envelope accepted, in bytes
    pub max_message_size: usize,

    /// Deepest element nesting accepted
    pub max_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_derived_keys: 16,
            max_derived_key_length: 64,
            max_message_size: 1_048_576, // 1MB
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Session token cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenCacheConfig {
    pub max_cached_tokens: usize,

    pub purge_interval_secs: u64,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            max_cached_tokens: 1000,
            purge_interval_secs: 60,
        }
    }
}
