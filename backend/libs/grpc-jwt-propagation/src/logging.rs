//! Per-call structured logging for gRPC services
//!
//! Outermost layer: it creates the request's `IdentityContext` before any
//! other layer runs, and reads back whatever identity was bound once the
//! call has completed, whether it succeeded or not.

use crate::rejection::AuthRejection;
use futures::future::BoxFuture;
use http::HeaderValue;
use identity_core::IdentityContext;
use std::fmt::Display;
use std::task::{Context, Poll};
use std::time::Instant;
use tonic::Status;
use tower::{Layer, Service};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Tower layer emitting one log record per gRPC call
///
/// Each record carries the endpoint, subject id (`-` when no identity was
/// bound), roles, outcome, failure kind, gRPC code, duration and correlation
/// id. Credentials are never logged.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingLayer;

impl LoggingLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for LoggingLayer {
    type Service = LoggingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoggingService { inner }
    }
}

#[derive(Clone)]
pub struct LoggingService<S> {
    inner: S,
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for LoggingService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    S::Error: Display,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<ReqBody>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let start = Instant::now();
        let endpoint = req.uri().path().to_string();
        let correlation_id = correlation_id(&mut req);

        let ctx = IdentityContext::new();
        req.extensions_mut().insert(ctx.clone());

        Box::pin(async move {
            let result = inner.call(req).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let claims = ctx.shared_claims();
            let subject = claims.as_ref().map_or("-", |c| c.subject_id());
            let roles = claims
                .as_ref()
                .map(|c| c.roles_display())
                .unwrap_or_default();

            match &result {
                Ok(response) => {
                    let grpc_code = grpc_code(response);
                    match response.extensions().get::<AuthRejection>() {
                        Some(AuthRejection(failure)) => warn!(
                            endpoint = %endpoint,
                            subject = %subject,
                            roles = %roles,
                            outcome = "rejected",
                            failure_kind = failure.kind(),
                            grpc_code,
                            duration_ms,
                            correlation_id = %correlation_id,
                            "gRPC call rejected"
                        ),
                        None => info!(
                            endpoint = %endpoint,
                            subject = %subject,
                            roles = %roles,
                            outcome = "completed",
                            grpc_code,
                            duration_ms,
                            correlation_id = %correlation_id,
                            "gRPC call completed"
                        ),
                    }
                }
                Err(err) => error!(
                    endpoint = %endpoint,
                    subject = %subject,
                    roles = %roles,
                    outcome = "error",
                    duration_ms,
                    correlation_id = %correlation_id,
                    error = %err,
                    "gRPC call failed"
                ),
            }

            result
        })
    }
}

/// Reuse the caller's correlation id or mint one and attach it to the request
fn correlation_id<B>(req: &mut http::Request<B>) -> String {
    if let Some(existing) = req
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return existing.to_string();
    }

    let correlation_id = Uuid::new_v4().to_string();
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        req.headers_mut().insert(CORRELATION_HEADER, value);
    }
    correlation_id
}

/// Status code from the response headers; handlers that succeed leave it for
/// the trailers, which this layer never sees
fn grpc_code<B>(response: &http::Response<B>) -> i32 {
    response
        .headers()
        .get(Status::GRPC_STATUS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
