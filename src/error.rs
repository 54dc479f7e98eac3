//! Error types for the WS-Security engine.
//!
//! Errors are split along the lines callers need to act on: configuration
//! problems surface at open time, message security failures reject a single
//! message, quota failures are resource exhaustion, and usage errors are
//! programming mistakes. [`Error`] is the uniform outer type returned by the
//! message-processing entry points.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Uniform error returned by the engine.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("message security error: {0}")]
    MessageSecurity(#[from] MessageSecurityError),

    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceededError),

    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),

    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("failed to secure outgoing message")]
    Outgoing(#[source] Box<Error>),

    #[error("failed to verify incoming message")]
    Incoming(#[source] Box<Error>),
}

/// Coarse classification of an [`Error`], looking through wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    MessageSecurity,
    Resource,
    Usage,
    Timeout,
    Communication,
    Xml,
    Crypto,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::MessageSecurity(_) => ErrorKind::MessageSecurity,
            Self::QuotaExceeded(_) => ErrorKind::Resource,
            Self::Usage(_) => ErrorKind::Usage,
            Self::Xml(_) => ErrorKind::Xml,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Communication(_) => ErrorKind::Communication,
            Self::Outgoing(inner) | Self::Incoming(inner) => inner.kind(),
        }
    }

    /// The innermost message security error, if that is what this is.
    pub fn as_message_security(&self) -> Option<&MessageSecurityError> {
        match self {
            Self::MessageSecurity(e) => Some(e),
            Self::Outgoing(inner) | Self::Incoming(inner) => inner.as_message_security(),
            _ => None,
        }
    }

    /// The innermost usage error, if that is what this is.
    pub fn as_usage(&self) -> Option<&UsageError> {
        match self {
            Self::Usage(e) => Some(e),
            Self::Outgoing(inner) | Self::Incoming(inner) => inner.as_usage(),
            _ => None,
        }
    }

    /// WS-Security fault code reported to the remote party.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            Self::MessageSecurity(e) => e.fault_code(),
            Self::Outgoing(inner) | Self::Incoming(inner) => inner.fault_code(),
            Self::Xml(_) => FaultCode::InvalidSecurity,
            Self::Crypto(_) => FaultCode::FailedCheck,
            _ => FaultCode::InvalidSecurity,
        }
    }
}

/// Configuration problems detected while opening a factory or provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no bootstrap security binding is configured for session negotiation")]
    MissingBootstrapBinding,

    #[error("no security token provider is configured for the initiator")]
    MissingTokenProvider,

    #[error("replay detection is not supported by the {0} protocol variant")]
    ReplayDetectionNotSupported(&'static str),

    #[error("{0} must be finite when replay detection is enabled")]
    InfiniteWindow(&'static str),

    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("{feature} requires {version}")]
    UnsupportedByVersion {
        feature: &'static str,
        version: &'static str,
    },

    #[error("security protocol factory did not produce a protocol for {0}")]
    ProtocolCreationFailed(String),

    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Protocol and security violations. Fatal for the message being processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageSecurityError {
    #[error("message has no security header")]
    MissingSecurityHeader,

    #[error("id '{0}' appears more than once in the message")]
    DuplicateId(String),

    #[error("element '{0}' is not allowed in the security header")]
    UnexpectedElement(String),

    #[error("malformed {element}: {reason}")]
    Malformed {
        element: &'static str,
        reason: String,
    },

    #[error("security header layout violation: {0}")]
    LayoutViolation(String),

    #[error("no element with id '{0}' could be found")]
    ReferenceNotFound(String),

    #[error("signature verification failed")]
    SignatureMismatch,

    #[error("message is not signed")]
    SignatureMissing,

    #[error("unexpected signing token: {0}")]
    UnexpectedSigningToken(String),

    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("digest mismatch for reference '{0}'")]
    DigestMismatch(String),

    #[error("signature confirmation does not match the request signature")]
    SignatureConfirmationMismatch,

    #[error("security timestamp creation time {created} is after its expiry {expires}")]
    TimestampInverted { created: String, expires: String },

    #[error("security timestamp expired at {expires} (now {now}, allowed skew {skew_secs}s)")]
    TimestampExpired {
        expires: String,
        now: String,
        skew_secs: i64,
    },

    #[error("security timestamp created at {created} is in the future (now {now}, allowed skew {skew_secs}s)")]
    TimestampInFuture {
        created: String,
        now: String,
        skew_secs: i64,
    },

    #[error("security timestamp created at {created} is older than the validity window of {validity_secs}s")]
    TimestampTooOld { created: String, validity_secs: i64 },

    #[error("a security timestamp is required but not present")]
    TimestampMissing,

    #[error("replayed message detected")]
    ReplayDetected,

    #[error("cannot resolve key reference {0}")]
    UnresolvedKey(String),

    #[error("token '{0}' has no symmetric key")]
    MissingSymmetricKey(String),

    #[error("requested derived key length {requested} exceeds the maximum of {max} bytes")]
    DerivedKeyTooLong { requested: usize, max: usize },

    #[error("more than {0} derived keys were requested while processing one header")]
    DerivedKeyLimitExceeded(usize),

    #[error("algorithm '{0}' is not allowed by the algorithm suite")]
    UnsupportedAlgorithm(String),

    #[error("required part {0} is not signed")]
    PartNotSigned(String),

    #[error("required part {0} is not encrypted")]
    PartNotEncrypted(String),

    #[error("unexpected action '{actual}', expected '{expected}'")]
    UnexpectedAction { expected: String, actual: String },

    #[error("response context '{actual}' does not match request context '{expected}'")]
    ContextMismatch { expected: String, actual: String },

    #[error("response collection contains {0} responses, exactly one is required")]
    AmbiguousResponseCollection(usize),

    #[error("response collection contains no response")]
    MissingResponse,

    #[error("unsupported {0}")]
    UnsupportedVersion(String),

    #[error("authentication failed for user '{0}'")]
    AuthenticationFailed(String),

    #[error("security token is not available: {0}")]
    TokenUnavailable(String),

    #[error("security token '{0}' has expired")]
    TokenExpired(String),
}

impl MessageSecurityError {
    /// Map to the WS-Security fault code sent back to the peer.
    pub fn fault_code(&self) -> FaultCode {
        match self {
            Self::SignatureMismatch
            | Self::SignatureMissing
            | Self::DigestMismatch(_)
            | Self::SignatureConfirmationMismatch
            | Self::PartNotSigned(_)
            | Self::PartNotEncrypted(_) => FaultCode::FailedCheck,
            Self::TimestampExpired { .. }
            | Self::TimestampTooOld { .. }
            | Self::TimestampInFuture { .. }
            | Self::ReplayDetected
            | Self::TokenExpired(_) => FaultCode::MessageExpired,
            Self::UnresolvedKey(_) | Self::TokenUnavailable(_) | Self::MissingSymmetricKey(_) => {
                FaultCode::SecurityTokenUnavailable
            }
            Self::AuthenticationFailed(_) => FaultCode::FailedAuthentication,
            Self::UnexpectedSigningToken(_) => FaultCode::InvalidSecurityToken,
            Self::UnsupportedAlgorithm(_) => FaultCode::UnsupportedAlgorithm,
            _ => FaultCode::InvalidSecurity,
        }
    }
}

/// A time-bounded cache could not make room for a new item.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{cache} quota of {capacity} items exceeded")]
pub struct QuotaExceededError {
    pub cache: &'static str,
    pub capacity: usize,
}

/// Programming errors. Not meant to be caught and retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    #[error("{0} cannot be modified once it is open")]
    ObjectImmutable(&'static str),

    #[error("{0} is not open")]
    NotOpen(&'static str),

    #[error("invalid state transition for {object}: {state}")]
    InvalidState {
        object: &'static str,
        state: String,
    },

    #[error("negotiation has not completed")]
    NegotiationNotCompleted,

    #[error("negotiation has already completed")]
    NegotiationAlreadyCompleted,

    #[error("security has already been applied to this message")]
    SecurityAlreadyApplied,

    #[error("a responder reply requires the request's correlation state")]
    MissingCorrelationState,

    #[error("invalid argument {name}: {reason}")]
    InvalidArgument {
        name: &'static str,
        reason: String,
    },
}

/// XML parsing and structure errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XmlError {
    #[error("XML parse error: {0}")]
    Parse(String),

    #[error("DOCTYPE declarations are not allowed")]
    DoctypeNotAllowed,

    #[error("entity declarations are not allowed")]
    EntityNotAllowed,

    #[error("processing instructions are not allowed")]
    ProcessingInstructionNotAllowed,

    #[error("namespace prefix '{0}' is not bound")]
    UnboundPrefix(String),

    #[error("invalid SOAP envelope: {0}")]
    InvalidEnvelope(String),

    #[error("element nesting exceeds {0} levels")]
    DepthExceeded(usize),
}

/// Cipher and MAC failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length {0} for {1}")]
    InvalidKeyLength(usize, &'static str),

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("invalid base64 data: {0}")]
    Base64(String),
}

/// WS-Security fault codes (OASIS WSS 1.0 §12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCode {
    /// An error was discovered processing the security header
    InvalidSecurity,
    /// An invalid security token was provided
    InvalidSecurityToken,
    /// The security token could not be authenticated or authorized
    FailedAuthentication,
    /// The signature or decryption was invalid
    FailedCheck,
    /// Referenced security token could not be retrieved
    SecurityTokenUnavailable,
    /// The message has expired
    MessageExpired,
    /// An unsupported signature or encryption algorithm was used
    UnsupportedAlgorithm,
}

impl FaultCode {
    /// Qualified fault code string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidSecurity => "wsse:InvalidSecurity",
            Self::InvalidSecurityToken => "wsse:InvalidSecurityToken",
            Self::FailedAuthentication => "wsse:FailedAuthentication",
            Self::FailedCheck => "wsse:FailedCheck",
            Self::SecurityTokenUnavailable => "wsse:SecurityTokenUnavailable",
            Self::MessageExpired => "wsse:MessageExpired",
            Self::UnsupportedAlgorithm => "wsse:UnsupportedAlgorithm",
        }
    }
}

/// SOAP Fault version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoapFaultVersion {
    Soap11,
    Soap12,
}

/// Generate a SOAP Fault envelope describing why a message was rejected.
///
/// The reason text is deliberately generic for message security errors so a
/// sender cannot probe which check failed; the detailed error belongs in the
/// local log.
pub fn soap_fault_response(error: &Error, version: SoapFaultVersion) -> String {
    let code = error.fault_code();
    let reason = match error.kind() {
        ErrorKind::MessageSecurity | ErrorKind::Crypto | ErrorKind::Xml => {
            "An error occurred when verifying security for the message.".to_string()
        }
        _ => error.to_string(),
    };

    match version {
        SoapFaultVersion::Soap11 => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/" xmlns:wsse="{wsse}">
  <soap:Body>
    <soap:Fault>
      <faultcode>{code}</faultcode>
      <faultstring>{reason}</faultstring>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
            wsse = crate::standards::WSSE_NS,
            code = code.as_str(),
            reason = xml_escape(&reason),
        ),
        SoapFaultVersion::Soap12 => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope" xmlns:wsse="{wsse}">
  <soap:Body>
    <soap:Fault>
      <soap:Code>
        <soap:Value>soap:Sender</soap:Value>
        <soap:Subcode>
          <soap:Value>{code}</soap:Value>
        </soap:Subcode>
      </soap:Code>
      <soap:Reason>
        <soap:Text xml:lang="en">{reason}</soap:Text>
      </soap:Reason>
    </soap:Fault>
  </soap:Body>
</soap:Envelope>"#,
            wsse = crate::standards::WSSE_NS,
            code = code.as_str(),
            reason = xml_escape(&reason),
        ),
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_code_as_str() {
        assert_eq!(FaultCode::FailedCheck.as_str(), "wsse:FailedCheck");
        assert_eq!(FaultCode::MessageExpired.as_str(), "wsse:MessageExpired");
    }

    #[test]
    fn test_kind_looks_through_wrappers() {
        let inner: Error = MessageSecurityError::ReplayDetected.into();
        let outer = Error::Incoming(Box::new(inner));
        assert_eq!(outer.kind(), ErrorKind::MessageSecurity);
        assert_eq!(
            outer.as_message_security(),
            Some(&MessageSecurityError::ReplayDetected)
        );
        assert_eq!(outer.fault_code(), FaultCode::MessageExpired);
    }

    #[test]
    fn test_source_is_preserved() {
        use std::error::Error as _;
        let outer = Error::Outgoing(Box::new(UsageError::SecurityAlreadyApplied.into()));
        let source = outer.source().unwrap().to_string();
        assert!(source.contains("already been applied"));
    }

    #[test]
    fn test_soap_11_fault() {
        let error: Error = MessageSecurityError::SignatureMismatch.into();
        let fault = soap_fault_response(&error, SoapFaultVersion::Soap11);
        assert!(fault.contains("http://schemas.xmlsoap.org/soap/envelope/"));
        assert!(fault.contains("wsse:FailedCheck"));
        assert!(!fault.contains("signature verification failed"));
    }

    #[test]
    fn test_soap_12_fault() {
        let error: Error = MessageSecurityError::ReplayDetected.into();
        let fault = soap_fault_response(&error, SoapFaultVersion::Soap12);
        assert!(fault.contains("http://www.w3.org/2003/05/soap-envelope"));
        assert!(fault.contains("soap:Sender"));
        assert!(fault.contains("wsse:MessageExpired"));
    }

    #[test]
    fn test_quota_error_is_resource_kind() {
        let error: Error = QuotaExceededError {
            cache: "nonce cache",
            capacity: 10,
        }
        .into();
        assert_eq!(error.kind(), ErrorKind::Resource);
        assert!(error.to_string().contains("quota of 10"));
    }
}
