//! HTTP front door
//!
//! - `GET /health`: identity provider reachability, never logged
//! - `GET /v1/users/{id}`: forwarded to `AuthService.GetUser` over gRPC
//! - `GET /api/me`: the verified caller, served directly
//!
//! In re-verify mode the caller's `Authorization` header travels to the gRPC
//! server, which verifies it again. In trust-forwarded mode the token is
//! verified here and the gRPC call carries a signed `x-forwarded-identity`.

use crate::proto::auth_service_client::AuthServiceClient;
use crate::proto::{GetUserRequest, PublicUser};
use actix_middleware::{Authorization, Identity, JwtAuthMiddleware};
use actix_web::{
    http::header::{AUTHORIZATION, WWW_AUTHENTICATE},
    http::StatusCode,
    web, HttpMessage, HttpRequest, HttpResponse,
};
use grpc_jwt_propagation::{BearerForwardingInterceptor, ForwardedIdentityInterceptor};
use identity_core::{
    AuthorizationPolicy, ForwardedIdentityCodec, IdentityContext, KeySource, TokenVerifier,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::AsciiMetadataValue;
use tonic::service::Interceptor;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tracing::warn;

/// Upper bound on the identity provider probe behind `/health`
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state of the HTTP handlers
pub struct GatewayState {
    key_source: Arc<dyn KeySource>,
    channel: Channel,
    codec: Option<ForwardedIdentityCodec>,
}

impl GatewayState {
    /// `codec` selects trust-forwarded mode
    pub fn new(
        key_source: Arc<dyn KeySource>,
        channel: Channel,
        codec: Option<ForwardedIdentityCodec>,
    ) -> Self {
        Self {
            key_source,
            channel,
            codec,
        }
    }

    pub fn trusts_forwarded(&self) -> bool {
        self.codec.is_some()
    }
}

/// Verification inputs for the HTTP middleware
#[derive(Clone)]
pub struct HttpAuth {
    pub verifier: TokenVerifier,
    pub audience: String,
    pub policy: Arc<AuthorizationPolicy>,
}

/// Register the routes; wrap the app in `Logging::new().exclude("/health")`
pub fn configure(cfg: &mut web::ServiceConfig, auth: &HttpAuth, trust_forwarded: bool) {
    cfg.route("/health", web::get().to(health));

    let users = web::scope("/v1").route("/users/{id}", web::get().to(get_user));
    if trust_forwarded {
        cfg.service(users.wrap(JwtAuthMiddleware::new(
            auth.verifier.clone(),
            auth.audience.clone(),
        )));
    } else {
        cfg.service(users);
    }

    cfg.service(
        web::scope("/api")
            .wrap(Authorization::new(Arc::clone(&auth.policy)))
            .wrap(JwtAuthMiddleware::new(
                auth.verifier.clone(),
                auth.audience.clone(),
            ))
            .route("/me", web::get().to(me)),
    );
}

async fn health(state: web::Data<GatewayState>) -> HttpResponse {
    match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, state.key_source.probe()).await {
        Ok(Ok(())) => HttpResponse::Ok().json(json!({ "status": "ok" })),
        Ok(Err(err)) => {
            warn!(error = %err, "Identity provider probe failed");
            unhealthy()
        }
        Err(_) => {
            warn!(
                timeout_ms = HEALTH_PROBE_TIMEOUT.as_millis() as u64,
                "Identity provider probe timed out"
            );
            unhealthy()
        }
    }
}

fn unhealthy() -> HttpResponse {
    HttpResponse::ServiceUnavailable().json(json!({
        "status": "unhealthy",
        "reason": "identity_provider_unreachable",
    }))
}

async fn me(identity: Identity) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "subject": identity.subject_id(),
        "roles": identity.roles(),
    }))
}

#[derive(Debug, Serialize)]
struct UserBody {
    id: String,
    username: String,
    firstname: String,
    lastname: String,
    email: String,
}

impl From<PublicUser> for UserBody {
    fn from(user: PublicUser) -> Self {
        Self {
            id: user.id,
            username: user.username,
            firstname: user.firstname,
            lastname: user.lastname,
            email: user.email,
        }
    }
}

async fn get_user(
    req: HttpRequest,
    path: web::Path<String>,
    state: web::Data<GatewayState>,
) -> HttpResponse {
    let forwarding = match Forwarding::for_request(&req, &state) {
        Ok(forwarding) => forwarding,
        Err(status) => return status_response(&status),
    };

    let mut client = AuthServiceClient::with_interceptor(state.channel.clone(), forwarding);
    let request = GetUserRequest {
        user_id: path.into_inner(),
    };

    match client.get_user(request).await {
        Ok(response) => {
            let user = response.into_inner().user.unwrap_or_default();
            HttpResponse::Ok().json(UserBody::from(user))
        }
        Err(status) => status_response(&status),
    }
}

/// How the caller's identity travels on the outgoing gRPC call
#[derive(Clone)]
enum Forwarding {
    Anonymous,
    Bearer(BearerForwardingInterceptor),
    Identity(ForwardedIdentityInterceptor),
}

impl Forwarding {
    fn for_request(req: &HttpRequest, state: &GatewayState) -> Result<Self, Status> {
        if let Some(codec) = &state.codec {
            let claims = req
                .extensions()
                .get::<IdentityContext>()
                .and_then(IdentityContext::shared_claims)
                .ok_or_else(|| Status::unauthenticated("unauthenticated"))?;
            let interceptor = ForwardedIdentityInterceptor::new(codec, &claims)?;
            return Ok(Forwarding::Identity(interceptor));
        }

        // Missing credentials are rejected by the gRPC identity layer
        let Some(value) = req.headers().get(AUTHORIZATION) else {
            return Ok(Forwarding::Anonymous);
        };
        let value = value
            .to_str()
            .ok()
            .and_then(|v| AsciiMetadataValue::try_from(v).ok())
            .ok_or_else(|| Status::unauthenticated("unauthenticated"))?;
        Ok(Forwarding::Bearer(BearerForwardingInterceptor::from_header(
            value,
        )))
    }
}

impl Interceptor for Forwarding {
    fn call(&mut self, request: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        match self {
            Forwarding::Anonymous => Ok(request),
            Forwarding::Bearer(interceptor) => interceptor.call(request),
            Forwarding::Identity(interceptor) => interceptor.call(request),
        }
    }
}

/// Map a gRPC status from the upstream call to a JSON error response
pub fn status_response(status: &Status) -> HttpResponse {
    let (http_status, reason) = match status.code() {
        Code::Unauthenticated => (StatusCode::UNAUTHORIZED, "unauthenticated"),
        Code::PermissionDenied => (StatusCode::FORBIDDEN, "forbidden"),
        Code::Unavailable => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
        Code::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        Code::InvalidArgument => (StatusCode::BAD_REQUEST, "invalid_argument"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };

    let mut builder = HttpResponse::build(http_status);
    if http_status == StatusCode::UNAUTHORIZED {
        builder.insert_header((WWW_AUTHENTICATE, "Bearer"));
    }
    builder.json(json!({ "error": reason }))
}
