//! Server-side identity layer
//!
//! Authenticates every incoming call before it reaches a service, and binds
//! the verified claims into the request's `IdentityContext`.

use crate::rejection::rejection_response;
use futures::future::BoxFuture;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use identity_core::{
    strip_bearer, AuthFailure, ForwardedIdentityCodec, IdentityClaims, IdentityContext,
    PropagationMode, TokenVerifier, VerificationError, FORWARDED_IDENTITY_HEADER,
};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, warn};

/// Paths served without authentication
const DEFAULT_EXEMPT_PREFIXES: &[&str] = &["/grpc.health.v1.Health/", "/grpc.reflection."];

struct IdentityConfig {
    verifier: TokenVerifier,
    audience: String,
    mode: PropagationMode,
    codec: Option<ForwardedIdentityCodec>,
    exempt_prefixes: Vec<String>,
}

impl IdentityConfig {
    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Credential extraction and verification, without touching the request
    ///
    /// Header names are case-insensitive by construction: `HeaderMap`
    /// normalizes them, whatever spelling the client sent.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<IdentityClaims, AuthFailure> {
        if let (PropagationMode::TrustForwarded, Some(codec)) = (self.mode, &self.codec) {
            if let Some(value) = headers.get(FORWARDED_IDENTITY_HEADER) {
                let value = value
                    .to_str()
                    .map_err(|_| VerificationError::ForwardedIdentityInvalid)?;
                return Ok(codec.decode(value, &self.audience)?);
            }
        }

        let mut values = headers.get_all(AUTHORIZATION).iter();
        let value = values.next().ok_or(AuthFailure::MissingCredential)?;
        if values.next().is_some() {
            return Err(VerificationError::MalformedToken.into());
        }

        let credential = value
            .to_str()
            .ok()
            .and_then(strip_bearer)
            .ok_or(VerificationError::MalformedToken)?;

        Ok(self.verifier.verify(credential, &self.audience).await?)
    }
}

/// Tower layer that verifies bearer credentials on every gRPC call
///
/// This layer:
/// 1. Reads the single `authorization` entry from call metadata
/// 2. Rejects with `Unauthenticated` before any verification when it is absent
/// 3. Strips the `Bearer` scheme (any case) and verifies the token against
///    the service's own client id as audience
/// 4. Binds the claims into the request's `IdentityContext` and calls the
///    inner service with it
///
/// ## Design
///
/// - **Async**: key resolution may hit the network, which tonic's
///   synchronous `Interceptor` cannot wait for
/// - **Generic failures**: callers only ever see `unauthenticated` or
///   `unavailable`; the precise reason goes to the logs
/// - **Short-circuit**: on failure the inner service is never called
///
/// ## Usage
///
/// ```rust,no_run
/// use grpc_jwt_propagation::{IdentityLayer, LoggingLayer};
/// use identity_core::{StaticKeySource, TokenVerifier};
/// use std::sync::Arc;
///
/// let verifier = TokenVerifier::new(Arc::new(StaticKeySource::default()));
/// let server = tonic::transport::Server::builder()
///     .layer(LoggingLayer::new())
///     .layer(IdentityLayer::new(verifier, "omniauth"));
/// // server.add_service(AuthServiceServer::new(svc)).serve(addr)
/// ```
#[derive(Clone)]
pub struct IdentityLayer {
    config: Arc<IdentityConfig>,
}

impl IdentityLayer {
    pub fn new(verifier: TokenVerifier, audience: impl Into<String>) -> Self {
        Self {
            config: Arc::new(IdentityConfig {
                verifier,
                audience: audience.into(),
                mode: PropagationMode::ReVerify,
                codec: None,
                exempt_prefixes: DEFAULT_EXEMPT_PREFIXES
                    .iter()
                    .map(|p| p.to_string())
                    .collect(),
            }),
        }
    }

    /// Accept `x-forwarded-identity` from trusted hops, falling back to the bearer token
    pub fn trust_forwarded(self, codec: ForwardedIdentityCodec) -> Self {
        self.map_config(|config| {
            config.mode = PropagationMode::TrustForwarded;
            config.codec = Some(codec);
        })
    }

    /// Serve paths starting with `prefix` without authentication
    pub fn exempt(self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.map_config(|config| config.exempt_prefixes.push(prefix))
    }

    pub fn mode(&self) -> PropagationMode {
        self.config.mode
    }

    fn map_config(self, f: impl FnOnce(&mut IdentityConfig)) -> Self {
        let mut config = match Arc::try_unwrap(self.config) {
            Ok(config) => config,
            Err(shared) => IdentityConfig {
                verifier: shared.verifier.clone(),
                audience: shared.audience.clone(),
                mode: shared.mode,
                codec: shared.codec.clone(),
                exempt_prefixes: shared.exempt_prefixes.clone(),
            },
        };
        f(&mut config);
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for IdentityLayer {
    type Service = IdentityService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        IdentityService {
            inner,
            config: Arc::clone(&self.config),
        }
    }
}

#[derive(Clone)]
pub struct IdentityService<S> {
    inner: S,
    config: Arc<IdentityConfig>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for IdentityService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        // Call the instance that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = Arc::clone(&self.config);

        Box::pin(async move {
            if config.is_exempt(req.uri().path()) {
                return inner.call(req).await;
            }

            if config.mode == PropagationMode::ReVerify {
                req.headers_mut().remove(FORWARDED_IDENTITY_HEADER);
            }

            let claims = match config.authenticate(req.headers()).await {
                Ok(claims) => claims,
                Err(failure) => {
                    debug!(
                        path = %req.uri().path(),
                        failure_kind = failure.kind(),
                        "gRPC call rejected by identity layer"
                    );
                    return Ok(rejection_response(failure));
                }
            };

            let existing = req.extensions().get::<IdentityContext>().cloned();
            let ctx = match existing {
                Some(ctx) => ctx,
                None => {
                    let ctx = IdentityContext::new();
                    req.extensions_mut().insert(ctx.clone());
                    ctx
                }
            };
            if ctx.bind(claims).is_err() {
                warn!(path = %req.uri().path(), "Identity already bound; keeping the first binding");
            }

            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity_core::test_utils::*;
    use identity_core::StaticKeySource;

    fn config(mode: PropagationMode) -> IdentityConfig {
        let verifier = TokenVerifier::new(Arc::new(StaticKeySource::new(vec![trusted_key()])));
        IdentityConfig {
            verifier,
            audience: TEST_AUDIENCE.to_string(),
            mode,
            codec: Some(
                ForwardedIdentityCodec::new(b"0123456789abcdef0123456789abcdef").unwrap(),
            ),
            exempt_prefixes: vec![],
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[tokio::test]
    async fn test_missing_header_fails_before_verification() {
        let err = config(PropagationMode::ReVerify)
            .authenticate(&HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err, AuthFailure::MissingCredential);
    }

    #[tokio::test]
    async fn test_scheme_is_case_insensitive() {
        let token = token_with_roles("user-1", &["member"]);
        let value = format!("bEaReR {token}");

        let claims = config(PropagationMode::ReVerify)
            .authenticate(&headers(&[("Authorization", value.as_str())]))
            .await
            .unwrap();
        assert_eq!(claims.subject_id(), "user-1");
    }

    #[tokio::test]
    async fn test_wrong_scheme_and_duplicates_are_malformed() {
        let config = config(PropagationMode::ReVerify);

        let err = config
            .authenticate(&headers(&[("authorization", "Basic dXNlcg==")]))
            .await
            .unwrap_err();
        assert_eq!(err, AuthFailure::from(VerificationError::MalformedToken));

        let token = token_with_roles("user-1", &[]);
        let value = format!("Bearer {token}");
        let err = config
            .authenticate(&headers(&[("authorization", value.as_str()), ("authorization", value.as_str())]))
            .await
            .unwrap_err();
        assert_eq!(err, AuthFailure::from(VerificationError::MalformedToken));
    }

    #[tokio::test]
    async fn test_forwarded_identity_only_honoured_when_trusted() {
        let codec = ForwardedIdentityCodec::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let forwarded = codec.encode(&test_claims("user-5", &["admin"])).unwrap();
        let headers = headers(&[(FORWARDED_IDENTITY_HEADER, forwarded.as_str())]);

        let claims = config(PropagationMode::TrustForwarded)
            .authenticate(&headers)
            .await
            .unwrap();
        assert_eq!(claims.subject_id(), "user-5");

        let err = config(PropagationMode::ReVerify)
            .authenticate(&headers)
            .await
            .unwrap_err();
        assert_eq!(err, AuthFailure::MissingCredential);
    }

    #[test]
    fn test_health_and_reflection_are_exempt_by_default() {
        let verifier = TokenVerifier::new(Arc::new(StaticKeySource::default()));
        let layer = IdentityLayer::new(verifier, TEST_AUDIENCE);

        assert!(layer.config.is_exempt("/grpc.health.v1.Health/Check"));
        assert!(layer
            .config
            .is_exempt("/grpc.reflection.v1.ServerReflection/ServerReflectionInfo"));
        assert!(layer
            .config
            .is_exempt("/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo"));
        assert!(!layer.config.is_exempt("/omnauth.v1.AuthService/GetUser"));
        assert_eq!(layer.mode(), PropagationMode::ReVerify);
    }

    #[test]
    fn test_extra_exempt_prefix_is_added() {
        let verifier = TokenVerifier::new(Arc::new(StaticKeySource::default()));
        let layer = IdentityLayer::new(verifier, TEST_AUDIENCE).exempt("/internal.Debug/");

        assert!(layer.config.is_exempt("/internal.Debug/Dump"));
        assert!(layer.config.is_exempt("/grpc.health.v1.Health/Watch"));
    }
}
