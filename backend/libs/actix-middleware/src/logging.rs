//! Logging middleware
//!
//! Logs one record per HTTP request with the caller's identity, using tracing.
//! Wrap it last so it runs first: it creates the request's `IdentityContext`
//! that the authentication middleware later binds.

use crate::error::AuthError;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::StatusCode,
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use identity_core::IdentityContext;
use std::future::{ready, Ready};
use std::rc::Rc;
use std::time::Instant;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Middleware that logs HTTP requests with subject, roles and outcome
#[derive(Clone, Default)]
pub struct Logging {
    excluded: Rc<Vec<String>>,
}

impl Logging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Do not log requests to `path` (health probes)
    pub fn exclude(mut self, path: impl Into<String>) -> Self {
        Rc::make_mut(&mut self.excluded).push(path.into());
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for Logging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = LoggingService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(LoggingService {
            service,
            excluded: Rc::clone(&self.excluded),
        }))
    }
}

pub struct LoggingService<S> {
    service: S,
    excluded: Rc<Vec<String>>,
}

impl<S, B> Service<ServiceRequest> for LoggingService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let ctx = IdentityContext::new();
        req.extensions_mut().insert(ctx.clone());

        if self.excluded.iter().any(|path| path == req.path()) {
            return Box::pin(self.service.call(req));
        }

        let start = Instant::now();
        let method = req.method().clone();
        let path = req.path().to_string();
        let correlation_id = req
            .headers()
            .get(CORRELATION_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let claims = ctx.shared_claims();
            let subject = claims.as_ref().map_or("-", |c| c.subject_id());
            let roles = claims
                .as_ref()
                .map(|c| c.roles_display())
                .unwrap_or_default();

            match &result {
                Ok(res) => {
                    let status = res.status().as_u16();
                    // Rejections relayed from upstream carry no AuthError.
                    let failure_kind = res
                        .response()
                        .error()
                        .and_then(|err| err.as_error::<AuthError>())
                        .map(|rejection| rejection.failure().kind())
                        .or_else(|| status_failure_kind(res.status()));
                    match failure_kind {
                        Some(failure_kind) => tracing::warn!(
                            method = %method,
                            path = %path,
                            subject = %subject,
                            roles = %roles,
                            outcome = "rejected",
                            failure_kind,
                            status,
                            duration_ms,
                            correlation_id = %correlation_id,
                            "HTTP request rejected"
                        ),
                        None => tracing::info!(
                            method = %method,
                            path = %path,
                            subject = %subject,
                            roles = %roles,
                            outcome = "completed",
                            status,
                            duration_ms,
                            correlation_id = %correlation_id,
                            "HTTP request completed"
                        ),
                    }
                }
                Err(err) => tracing::error!(
                    method = %method,
                    path = %path,
                    subject = %subject,
                    roles = %roles,
                    outcome = "error",
                    status = err.as_response_error().status_code().as_u16(),
                    duration_ms,
                    correlation_id = %correlation_id,
                    error = %err,
                    "HTTP request failed"
                ),
            }

            result
        })
    }
}

/// Failure kind implied by a status the middleware did not produce itself
fn status_failure_kind(status: StatusCode) -> Option<&'static str> {
    match status {
        StatusCode::UNAUTHORIZED => Some("unauthenticated"),
        StatusCode::FORBIDDEN => Some("forbidden"),
        StatusCode::SERVICE_UNAVAILABLE => Some("unavailable"),
        _ => None,
    }
}
