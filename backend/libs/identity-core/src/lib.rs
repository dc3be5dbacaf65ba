//! Identity verification core
//!
//! Transport-neutral building blocks shared by the gRPC and HTTP layers:
//!
//! - **IdentityClaims**: verified subject id and role set, immutable
//! - **KeySource / JwksKeySource**: verification keys, cached, refreshed on key-id miss
//! - **TokenVerifier**: bearer token validation (signature, time, audience, issuer)
//! - **IdentityContext**: write-once, request-scoped holder for the verified claims
//! - **AuthorizationPolicy**: endpoint id to minimum role table
//! - **ForwardedIdentityCodec**: signed hand-off of verified claims between transports
//!
//! ## Usage
//!
//! ```rust,no_run
//! use identity_core::{HttpKeySetFetcher, JwksKeySource, TokenVerifier};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = HttpKeySetFetcher::new(
//!     "https://keycloak.example.com/realms/omni/protocol/openid-connect/certs",
//!     Duration::from_secs(5),
//! )?;
//! let keys = JwksKeySource::new(Arc::new(fetcher));
//! let verifier = TokenVerifier::new(Arc::new(keys))
//!     .with_issuer("https://keycloak.example.com/realms/omni");
//!
//! let claims = verifier.verify("eyJhbGc...", "omniauth").await?;
//! println!("{} has roles {:?}", claims.subject_id(), claims.roles());
//! # Ok(())
//! # }
//! ```
//!
//! ## Security Guarantees
//!
//! - The algorithm is taken from the resolved key, never from the token header
//! - Symmetric keys are never accepted from a published key set
//! - Failures carry a reason code for logs; none of them echo the credential

mod claims;
mod context;
mod error;
mod jwks;
mod key_source;
mod policy;
mod propagation;
mod verifier;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use claims::IdentityClaims;
pub use context::{AlreadyBound, IdentityContext};
pub use error::{AuthFailure, FailureClass, Forbidden, KeySourceError, VerificationError};
pub use jwks::{parse_key_set, VerificationKey};
pub use key_source::{HttpKeySetFetcher, JwksKeySource, KeySetFetcher, KeySource, StaticKeySource};
pub use policy::{AuthorizationPolicy, AuthorizationRule, PolicyParseError};
pub use propagation::{
    CodecError, ForwardedIdentityCodec, PropagationMode, UnknownPropagationMode,
    FORWARDED_IDENTITY_HEADER,
};
pub use verifier::{Clock, FixedClock, SystemClock, TokenVerifier, MAX_CREDENTIAL_LEN};

/// Strip a case-insensitive `Bearer` scheme from an authorization value
///
/// Returns `None` when the scheme is missing or the credential is empty.
pub fn strip_bearer(value: &str) -> Option<&str> {
    let value = value.trim();
    let (scheme, credential) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let credential = credential.trim();
    (!credential.is_empty()).then_some(credential)
}
