//! WS-Security message protection for SOAP.
//!
//! Secures outgoing SOAP messages and verifies incoming ones under a
//! session key negotiated over WS-Trust / WS-SecureConversation.
//!
//! # Features
//!
//! - Session token negotiation (requester, issuer and combined entropy)
//! - Sign then encrypt or encrypt then sign, with derived keys
//! - Timestamp freshness and replay detection with an expiring nonce cache
//! - Supporting tokens (username, signed, endorsing) and encrypted headers
//! - Signature confirmation (WS-Security 1.1)
//! - SOAP Fault responses for rejected messages
//!
//! # Example
//!
//! ```ignore
//! use zentinel_wssec::{ProtocolVariant, SecurityProtocolFactory, StaticTokenProvider};
//!
//! let mut factory = SecurityProtocolFactory::new(ProtocolVariant::SymmetricSessionKey);
//! factory.set_settings(config.protocol_settings())?;
//! factory.set_token_provider(Arc::new(StaticTokenProvider::new(token)))?;
//! factory.open()?;
//! let protocol = factory.create_security_protocol(EndpointAddress::new(uri), None)?;
//! let (secured, correlation) = protocol.secure_outgoing_message(message, timeout).await?;
//! ```

pub mod algorithms;
pub mod cache;
pub mod canonical;
pub mod channel;
pub mod claims;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod header;
pub mod message;
pub mod negotiation;
pub mod parts;
pub mod protocol;
pub mod resolver;
pub mod serializer;
pub mod standards;
pub mod timestamp;
pub mod tokens;
pub mod trust;
pub mod xml;

pub use algorithms::AlgorithmSuite;
pub use cache::{InMemoryNonceCache, NonceCache, SecurityContextTokenCache, TimeBoundedCache};
pub use channel::{BootstrapBinding, EndpointAddress, RequestChannel, RequestChannelFactory};
pub use claims::{Claim, ClaimSet, ClaimType};
pub use config::WsSecurityConfig;
pub use credentials::{CredentialStore, InMemoryCredentialStore};
pub use crypto::SymmetricKey;
pub use error::{
    soap_fault_response, ConfigError, Error, ErrorKind, FaultCode, MessageSecurityError, Result,
    UsageError,
};
pub use header::{
    MessageProtectionOrder, ProcessedMessage, ReceiveSecurityHeader, SecurityMessageProperty,
    SendSecurityHeader, SupportingToken, SupportingTokenAttachment,
};
pub use message::{Message, SoapVersion};
pub use negotiation::{
    IssuerSettings, NegotiationSettings, NegotiationState, SecurityTokenProvider,
    SessionTokenIssuer, SessionTokenProvider, StaticTokenProvider,
};
pub use parts::{MessagePartSpecification, ScopedMessagePartSpecification};
pub use protocol::{
    CorrelationState, ProtocolSettings, ProtocolVariant, SecurityProtocol, SecurityProtocolFactory,
};
pub use standards::StandardsDriver;
pub use tokens::SecurityToken;
pub use trust::KeyEntropyMode;
