use crate::error::AuthError;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http::header::AUTHORIZATION,
    Error, FromRequest, HttpMessage, HttpRequest,
};
use futures::future::{ready, Ready};
use identity_core::{
    strip_bearer, AuthFailure, IdentityClaims, IdentityContext, TokenVerifier, VerificationError,
};
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;

/// Verified caller, extracted from the request's `IdentityContext`
///
/// Fails with 401 when no identity was bound, e.g. on a route that is not
/// wrapped by [`JwtAuthMiddleware`].
#[derive(Debug, Clone)]
pub struct Identity(pub Arc<IdentityClaims>);

impl Deref for Identity {
    type Target = IdentityClaims;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Bearer token authentication middleware
///
/// Verifies `Authorization: Bearer <token>` against the service's client id
/// and binds the claims into the request's `IdentityContext`. Rejections are
/// `AuthError`s: 401 with `WWW-Authenticate: Bearer`, or 503 when signing keys
/// cannot be fetched. The handler is never called on failure.
#[derive(Clone)]
pub struct JwtAuthMiddleware {
    verifier: TokenVerifier,
    audience: Arc<str>,
}

impl JwtAuthMiddleware {
    pub fn new(verifier: TokenVerifier, audience: impl Into<String>) -> Self {
        Self {
            verifier,
            audience: Arc::from(audience.into()),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for JwtAuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = JwtAuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(JwtAuthMiddlewareService {
            service: Rc::new(service),
            verifier: self.verifier.clone(),
            audience: Arc::clone(&self.audience),
        }))
    }
}

pub struct JwtAuthMiddlewareService<S> {
    service: Rc<S>,
    verifier: TokenVerifier,
    audience: Arc<str>,
}

impl<S, B> Service<ServiceRequest> for JwtAuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let verifier = self.verifier.clone();
        let audience = Arc::clone(&self.audience);

        Box::pin(async move {
            let credential = match bearer_credential(&req) {
                Ok(credential) => credential,
                Err(failure) => return Ok(reject(req, failure)),
            };

            let claims = match verifier.verify(&credential, &audience).await {
                Ok(claims) => claims,
                Err(err) => return Ok(reject(req, err.into())),
            };

            let existing = req.extensions().get::<IdentityContext>().cloned();
            let ctx = existing.unwrap_or_else(|| {
                let ctx = IdentityContext::new();
                req.extensions_mut().insert(ctx.clone());
                ctx
            });
            if ctx.bind(claims).is_err() {
                tracing::warn!(path = %req.path(), "Identity already bound; keeping the first binding");
            }

            let res = service.call(req).await?;
            Ok(res.map_into_left_body())
        })
    }
}

/// The single bearer credential of the request
fn bearer_credential(req: &ServiceRequest) -> Result<String, AuthFailure> {
    let mut values = req.headers().get_all(AUTHORIZATION);
    let value = values.next().ok_or(AuthFailure::MissingCredential)?;
    if values.next().is_some() {
        return Err(VerificationError::MalformedToken.into());
    }

    value
        .to_str()
        .ok()
        .and_then(strip_bearer)
        .map(str::to_string)
        .ok_or_else(|| VerificationError::MalformedToken.into())
}

/// Short-circuit with the JSON rejection; the handler is never called
fn reject<B>(req: ServiceRequest, failure: AuthFailure) -> ServiceResponse<EitherBody<B>> {
    tracing::debug!(
        path = %req.path(),
        failure_kind = failure.kind(),
        "HTTP request rejected by identity middleware"
    );
    req.error_response(AuthError(failure)).map_into_right_body()
}

impl FromRequest for Identity {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let claims = req
            .extensions()
            .get::<IdentityContext>()
            .and_then(IdentityContext::shared_claims);

        match claims {
            Some(claims) => ready(Ok(Identity(claims))),
            None => ready(Err(AuthError(AuthFailure::MissingCredential).into())),
        }
    }
}
