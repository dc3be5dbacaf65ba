//! Role gate for direct HTTP routes
//!
//! Endpoint ids are `"<METHOD> <route pattern>"`, e.g. `GET /api/me` or
//! `GET /v1/users/{id}`, so one rule covers every concrete path of a route.

use crate::error::AuthError;
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpMessage,
};
use futures::future::LocalBoxFuture;
use identity_core::{AuthFailure, AuthorizationPolicy, IdentityContext};
use std::future::{ready, Ready};
use std::sync::Arc;

/// Middleware enforcing an [`AuthorizationPolicy`]; wrap it inside
/// [`JwtAuthMiddleware`](crate::JwtAuthMiddleware)
#[derive(Clone)]
pub struct Authorization {
    policy: Arc<AuthorizationPolicy>,
}

impl Authorization {
    pub fn new(policy: Arc<AuthorizationPolicy>) -> Self {
        Self { policy }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Authorization
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = AuthorizationService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AuthorizationService {
            service,
            policy: Arc::clone(&self.policy),
        }))
    }
}

pub struct AuthorizationService<S> {
    service: S,
    policy: Arc<AuthorizationPolicy>,
}

impl<S, B> Service<ServiceRequest> for AuthorizationService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let endpoint = endpoint_id(&req);
        let claims = req
            .extensions()
            .get::<IdentityContext>()
            .and_then(IdentityContext::shared_claims);

        let verdict = match claims {
            Some(claims) => self
                .policy
                .check(&endpoint, &claims)
                .map_err(AuthFailure::from),
            None if self.policy.governs(&endpoint) => {
                Err(AuthFailure::MissingCredential)
            }
            None => Ok(()),
        };

        if let Err(failure) = verdict {
            tracing::debug!(
                endpoint = %endpoint,
                failure_kind = failure.kind(),
                "HTTP request refused by policy"
            );
            let res = req.error_response(AuthError(failure)).map_into_right_body();
            return Box::pin(async move { Ok(res) });
        }

        let fut = self.service.call(req);
        Box::pin(async move { Ok(fut.await?.map_into_left_body()) })
    }
}

/// `"<METHOD> <pattern>"`, falling back to the raw path for unmatched requests
pub fn endpoint_id(req: &ServiceRequest) -> String {
    let pattern = req
        .match_pattern()
        .unwrap_or_else(|| req.path().to_string());
    format!("{} {}", req.method(), pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JwtAuthMiddleware;
    use actix_web::{http::StatusCode, test, web, App, HttpResponse};
    use identity_core::test_utils::*;
    use identity_core::{AuthorizationRule, StaticKeySource, TokenVerifier};

    async fn ok() -> HttpResponse {
        HttpResponse::Ok().finish()
    }

    fn policy() -> Arc<AuthorizationPolicy> {
        Arc::new(AuthorizationPolicy::new(vec![AuthorizationRule::require(
            "GET /v1/users/{id}",
            "admin",
        )]))
    }

    fn authenticated(token: &str) -> test::TestRequest {
        test::TestRequest::get()
            .uri("/v1/users/42")
            .insert_header(("Authorization", format!("Bearer {token}")))
    }

    #[actix_web::test]
    async fn test_role_gate_on_route_pattern() {
        let verifier = TokenVerifier::new(Arc::new(StaticKeySource::new(vec![trusted_key()])));
        let app = test::init_service(
            App::new()
                .wrap(Authorization::new(policy()))
                .wrap(JwtAuthMiddleware::new(verifier, TEST_AUDIENCE))
                .route("/v1/users/{id}", web::get().to(ok)),
        )
        .await;

        let member = authenticated(&token_with_roles("user-1", &["member"])).to_request();
        let resp = test::call_service(&app, member).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let admin = authenticated(&token_with_roles("user-2", &["admin"])).to_request();
        let resp = test::call_service(&app, admin).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_ruled_route_without_identity_is_401() {
        let app = test::init_service(
            App::new()
                .wrap(Authorization::new(policy()))
                .route("/v1/users/{id}", web::get().to(ok))
                .route("/open", web::get().to(ok)),
        )
        .await;

        let req = test::TestRequest::get().uri("/v1/users/42").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get().uri("/open").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
