//! # Actix Middleware Library
//!
//! Identity middleware for the HTTP front door
//!
//! ## Modules
//! - `logging`: per-request record with subject, roles and outcome; creates the `IdentityContext`
//! - `jwt_auth`: bearer token verification and the `Identity` extractor
//! - `authorization`: minimum-role gate keyed by `"<METHOD> <route pattern>"`
//! - `error`: JSON rejections (`{"error": "unauthenticated"}` and friends)
//!
//! ## Ordering
//!
//! actix runs the last `wrap` first, so register them innermost first:
//!
//! ```rust,no_run
//! use actix_middleware::{Authorization, JwtAuthMiddleware, Logging};
//! use actix_web::{web, App, HttpResponse};
//! use identity_core::{AuthorizationPolicy, StaticKeySource, TokenVerifier};
//! use std::sync::Arc;
//!
//! let verifier = TokenVerifier::new(Arc::new(StaticKeySource::default()));
//! let app = App::new()
//!     .wrap(Authorization::new(Arc::new(AuthorizationPolicy::default())))
//!     .wrap(JwtAuthMiddleware::new(verifier, "omniauth"))
//!     .wrap(Logging::new())
//!     .route("/api/me", web::get().to(|| async { HttpResponse::Ok().finish() }));
//! ```

pub mod authorization;
pub mod error;
pub mod jwt_auth;
pub mod logging;

pub use authorization::{endpoint_id, Authorization};
pub use error::AuthError;
pub use jwt_auth::{Identity, JwtAuthMiddleware};
pub use logging::{Logging, CORRELATION_HEADER};
