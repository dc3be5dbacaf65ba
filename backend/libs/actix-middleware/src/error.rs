/// HTTP rendering of identity failures
///
/// Every rejection produced by the middleware in this crate is an `AuthError`.
/// The body only ever names the failure class; the precise kind is kept for
/// the logging middleware, which reads it back from the `actix_web::Error`.
use actix_web::{
    error::ResponseError,
    http::{header, StatusCode},
    HttpResponse,
};
use identity_core::{AuthFailure, FailureClass};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("request rejected: {}", .0.kind())]
pub struct AuthError(pub AuthFailure);

impl AuthError {
    pub fn failure(&self) -> &AuthFailure {
        &self.0
    }
}

impl From<AuthFailure> for AuthError {
    fn from(failure: AuthFailure) -> Self {
        Self(failure)
    }
}

impl ResponseError for AuthError {
    fn status_code(&self) -> StatusCode {
        match self.0.class() {
            FailureClass::Unauthenticated => StatusCode::UNAUTHORIZED,
            FailureClass::Forbidden => StatusCode::FORBIDDEN,
            FailureClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let class = self.0.class();
        let mut response = HttpResponse::build(self.status_code());
        if class == FailureClass::Unauthenticated {
            response.insert_header((header::WWW_AUTHENTICATE, "Bearer"));
        }
        response.json(json!({ "error": class.public_reason() }))
    }
}
