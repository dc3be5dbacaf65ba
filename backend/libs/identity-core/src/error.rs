//! Error taxonomy for identity verification
//!
//! Every failure carries a stable, machine-readable `reason()` string. Transports
//! use it for logging and map the failure class to their own status codes;
//! nothing in here is meant to be echoed back to a caller verbatim.

use thiserror::Error;

/// Failure resolving a verification key
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeySourceError {
    /// The key id is not in the published key set, even after a refresh
    #[error("signing key not found: {kid}")]
    NotFound { kid: String },

    /// The identity provider's key endpoint could not be reached or read
    #[error("key source unavailable: {0}")]
    Unavailable(String),
}

/// Why a bearer credential was not accepted
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    #[error("malformed token")]
    MalformedToken,

    #[error("unknown signing key")]
    UnknownSigningKey,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("token expired")]
    TokenExpired,

    #[error("token not yet valid")]
    TokenNotYetValid,

    #[error("audience mismatch")]
    AudienceMismatch,

    #[error("issuer mismatch")]
    IssuerMismatch,

    #[error("forwarded identity rejected")]
    ForwardedIdentityInvalid,

    /// Infrastructure failure, not a verdict about the credential
    #[error("key source unavailable")]
    KeySourceUnavailable,
}

impl VerificationError {
    pub fn reason(&self) -> &'static str {
        match self {
            VerificationError::MalformedToken => "malformed_token",
            VerificationError::UnknownSigningKey => "unknown_signing_key",
            VerificationError::InvalidSignature => "invalid_signature",
            VerificationError::TokenExpired => "token_expired",
            VerificationError::TokenNotYetValid => "token_not_yet_valid",
            VerificationError::AudienceMismatch => "audience_mismatch",
            VerificationError::IssuerMismatch => "issuer_mismatch",
            VerificationError::ForwardedIdentityInvalid => "forwarded_identity_invalid",
            VerificationError::KeySourceUnavailable => "key_source_unavailable",
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, VerificationError::KeySourceUnavailable)
    }
}

impl From<KeySourceError> for VerificationError {
    fn from(err: KeySourceError) -> Self {
        match err {
            KeySourceError::NotFound { .. } => VerificationError::UnknownSigningKey,
            KeySourceError::Unavailable(_) => VerificationError::KeySourceUnavailable,
        }
    }
}

/// The caller is authenticated but lacks the role an endpoint requires
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("endpoint {endpoint} requires role {required_role}")]
pub struct Forbidden {
    pub endpoint: String,
    pub required_role: String,
}

/// Transport-neutral outcome class of a rejected request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Unauthenticated,
    Forbidden,
    Unavailable,
}

impl FailureClass {
    /// Short reason returned to callers in error bodies
    pub fn public_reason(&self) -> &'static str {
        match self {
            FailureClass::Unauthenticated => "unauthenticated",
            FailureClass::Forbidden => "forbidden",
            FailureClass::Unavailable => "unavailable",
        }
    }
}

/// Any reason the identity layer refused to let a request reach its handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthFailure {
    #[error("missing credential")]
    MissingCredential,

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Forbidden(#[from] Forbidden),
}

impl AuthFailure {
    /// Failure kind recorded in logs
    pub fn kind(&self) -> &'static str {
        match self {
            AuthFailure::MissingCredential => "missing_credential",
            AuthFailure::Verification(err) => err.reason(),
            AuthFailure::Forbidden(_) => "forbidden",
        }
    }

    pub fn class(&self) -> FailureClass {
        match self {
            AuthFailure::MissingCredential => FailureClass::Unauthenticated,
            AuthFailure::Verification(err) if err.is_unavailable() => FailureClass::Unavailable,
            AuthFailure::Verification(_) => FailureClass::Unauthenticated,
            AuthFailure::Forbidden(_) => FailureClass::Forbidden,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_source_errors_map_to_verification_errors() {
        let not_found = KeySourceError::NotFound { kid: "k1".into() };
        assert_eq!(
            VerificationError::from(not_found),
            VerificationError::UnknownSigningKey
        );

        let unavailable = KeySourceError::Unavailable("connection refused".into());
        assert_eq!(
            VerificationError::from(unavailable),
            VerificationError::KeySourceUnavailable
        );
    }

    #[test]
    fn test_failure_classes() {
        assert_eq!(
            AuthFailure::MissingCredential.class(),
            FailureClass::Unauthenticated
        );
        assert_eq!(
            AuthFailure::from(VerificationError::TokenExpired).class(),
            FailureClass::Unauthenticated
        );
        assert_eq!(
            AuthFailure::from(VerificationError::KeySourceUnavailable).class(),
            FailureClass::Unavailable
        );

        let forbidden = AuthFailure::from(Forbidden {
            endpoint: "/svc/Method".into(),
            required_role: "admin".into(),
        });
        assert_eq!(forbidden.class(), FailureClass::Forbidden);
        assert_eq!(forbidden.kind(), "forbidden");
    }

    #[test]
    fn test_kind_is_verifier_reason() {
        let failure = AuthFailure::from(VerificationError::AudienceMismatch);
        assert_eq!(failure.kind(), "audience_mismatch");
        assert_eq!(FailureClass::Unavailable.public_reason(), "unavailable");
    }
}
