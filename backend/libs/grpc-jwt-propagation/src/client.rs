//! Client-side interceptors for outgoing gRPC calls
//!
//! Two ways to carry a caller's identity to the next hop:
//!
//! - [`BearerForwardingInterceptor`] resends the caller's own bearer token,
//!   for servers that re-verify (the default propagation mode)
//! - [`ForwardedIdentityInterceptor`] attaches already-verified claims as a
//!   signed `x-forwarded-identity` entry, for servers that trust it

use identity_core::{ForwardedIdentityCodec, IdentityClaims, FORWARDED_IDENTITY_HEADER};
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::error;

/// Injects `authorization: Bearer <token>` into every outgoing request
///
/// ## Usage
///
/// ```rust,no_run
/// use grpc_jwt_propagation::BearerForwardingInterceptor;
/// use tonic::transport::Channel;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let interceptor = BearerForwardingInterceptor::new("eyJhbGc...")?;
/// let channel = Channel::from_static("http://[::1]:50051").connect().await?;
/// // let client = AuthServiceClient::with_interceptor(channel, interceptor);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct BearerForwardingInterceptor {
    auth_header: AsciiMetadataValue,
}

impl BearerForwardingInterceptor {
    /// Fails with `Status::unauthenticated` when the token is not valid metadata
    pub fn new(token: impl AsRef<str>) -> Result<Self, Status> {
        let auth_header = AsciiMetadataValue::try_from(format!("Bearer {}", token.as_ref()))
            .map_err(|_| Status::unauthenticated("unauthenticated"))?;
        Ok(Self { auth_header })
    }

    /// Forward an authorization value exactly as it was received
    pub fn from_header(auth_header: AsciiMetadataValue) -> Self {
        Self { auth_header }
    }

    /// The single `authorization` entry of an incoming call
    pub fn extract_from_metadata(metadata: &MetadataMap) -> Result<&AsciiMetadataValue, Status> {
        metadata
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("unauthenticated"))
    }
}

impl Interceptor for BearerForwardingInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert("authorization", self.auth_header.clone());
        Ok(request)
    }
}

/// Attaches a signed copy of verified claims to every outgoing request
///
/// The value is encoded once at construction; build a new interceptor per
/// caller. The receiving server must be configured with the same secret and
/// in trust-forwarded mode, otherwise the entry is stripped and ignored.
#[derive(Clone, Debug)]
pub struct ForwardedIdentityInterceptor {
    forwarded: AsciiMetadataValue,
}

impl ForwardedIdentityInterceptor {
    pub fn new(codec: &ForwardedIdentityCodec, claims: &IdentityClaims) -> Result<Self, Status> {
        let encoded = codec.encode(claims).map_err(|err| {
            error!(error = %err, "Failed to encode forwarded identity");
            Status::internal("internal error")
        })?;
        let forwarded = AsciiMetadataValue::try_from(encoded)
            .map_err(|_| Status::internal("internal error"))?;
        Ok(Self { forwarded })
    }
}

impl Interceptor for ForwardedIdentityInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        request
            .metadata_mut()
            .insert(FORWARDED_IDENTITY_HEADER, self.forwarded.clone());
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_core::test_utils::{test_claims, TEST_AUDIENCE};

    #[test]
    fn test_bearer_interceptor_injects_header() {
        let mut interceptor = BearerForwardingInterceptor::new("test-token-123").unwrap();

        let request = interceptor.call(Request::new(())).unwrap();

        let auth = request.metadata().get("authorization").unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer test-token-123");
    }

    #[test]
    fn test_bearer_interceptor_rejects_non_ascii_token() {
        let err = BearerForwardingInterceptor::new("tok\nen").unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn test_extract_from_metadata() {
        let mut metadata = MetadataMap::new();
        assert_eq!(
            BearerForwardingInterceptor::extract_from_metadata(&metadata)
                .unwrap_err()
                .code(),
            tonic::Code::Unauthenticated
        );

        metadata.insert("authorization", "Bearer abc".parse().unwrap());
        let value = BearerForwardingInterceptor::extract_from_metadata(&metadata).unwrap();
        let mut forwarding = BearerForwardingInterceptor::from_header(value.clone());

        let request = forwarding.call(Request::new(())).unwrap();
        let forwarded = request.metadata().get("authorization").unwrap();
        assert_eq!(forwarded.to_str().unwrap(), "Bearer abc");
    }

    #[test]
    fn test_forwarded_identity_round_trips_through_metadata() {
        let codec = ForwardedIdentityCodec::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let mut interceptor =
            ForwardedIdentityInterceptor::new(&codec, &test_claims("user-8", &["admin"])).unwrap();

        let request = interceptor.call(Request::new(())).unwrap();
        let value = request
            .metadata()
            .get(FORWARDED_IDENTITY_HEADER)
            .unwrap()
            .to_str()
            .unwrap();

        let claims = codec.decode(value, TEST_AUDIENCE).unwrap();
        assert_eq!(claims.subject_id(), "user-8");
        assert!(claims.has_role("admin"));
    }
}
