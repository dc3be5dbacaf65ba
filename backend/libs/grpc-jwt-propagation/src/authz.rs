//! Role checks for gRPC endpoints
//!
//! Runs after [`IdentityLayer`](crate::IdentityLayer). The endpoint id is the
//! full method path, e.g. `/omnauth.v1.AuthService/GetUser`.

use crate::rejection::rejection_response;
use futures::future::BoxFuture;
use identity_core::{AuthFailure, AuthorizationPolicy, IdentityContext};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::debug;

/// Tower layer enforcing an [`AuthorizationPolicy`] on bound identities
///
/// Calls without a bound identity only pass when no rule names their
/// endpoint (health checks and other exempt paths); a ruled endpoint reached
/// without an identity is refused as unauthenticated.
#[derive(Clone)]
pub struct AuthorizationLayer {
    policy: Arc<AuthorizationPolicy>,
}

impl AuthorizationLayer {
    pub fn new(policy: Arc<AuthorizationPolicy>) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for AuthorizationLayer {
    type Service = AuthorizationService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthorizationService {
            inner,
            policy: Arc::clone(&self.policy),
        }
    }
}

#[derive(Clone)]
pub struct AuthorizationService<S> {
    inner: S,
    policy: Arc<AuthorizationPolicy>,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for AuthorizationService<S>
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

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let endpoint = req.uri().path();
        let claims = req
            .extensions()
            .get::<IdentityContext>()
            .and_then(IdentityContext::shared_claims);

        let verdict = match claims {
            Some(claims) => self
                .policy
                .check(endpoint, &claims)
                .map_err(AuthFailure::from),
            None if self.policy.governs(endpoint) => {
                Err(AuthFailure::MissingCredential)
            }
            None => Ok(()),
        };

        if let Err(failure) = verdict {
            debug!(endpoint = %endpoint, failure_kind = failure.kind(), "gRPC call refused by policy");
            return Box::pin(async move { Ok(rejection_response(failure)) });
        }

        Box::pin(async move { inner.call(req).await })
    }
}
