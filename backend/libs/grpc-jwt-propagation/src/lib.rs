//! Identity propagation for gRPC services
//!
//! Tower layers that authenticate, authorize and log every incoming gRPC
//! call, plus client interceptors that carry the caller's identity to the
//! next hop.
//!
//! ## Core Components
//!
//! - **LoggingLayer**: outermost; creates the request's `IdentityContext` and
//!   emits one structured record per call
//! - **IdentityLayer**: verifies the bearer credential (or a signed forwarded
//!   identity) and binds the claims
//! - **AuthorizationLayer**: enforces the endpoint's minimum role
//! - **IdentityRequestExt**: handler access to the bound claims
//! - **BearerForwardingInterceptor / ForwardedIdentityInterceptor**: outgoing calls
//!
//! ## Design
//!
//! - **Layers, not interceptors**: tonic's `Interceptor` is synchronous, and
//!   resolving a signing key may wait on the identity provider
//! - **Fail closed**: a call that cannot be authenticated never reaches a
//!   handler; when keys cannot be fetched it is `Unavailable`, not let through
//! - **Opaque errors**: status messages are `unauthenticated`, `forbidden` or
//!   `unavailable`; the precise reason is only logged
//!
//! ## Usage
//!
//! ```rust,no_run
//! use grpc_jwt_propagation::{AuthorizationLayer, IdentityLayer, LoggingLayer};
//! use identity_core::{
//!     AuthorizationPolicy, HttpKeySetFetcher, JwksKeySource, TokenVerifier,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fetcher = HttpKeySetFetcher::new(
//!     "http://keycloak:8080/realms/omni/protocol/openid-connect/certs",
//!     Duration::from_secs(5),
//! )?;
//! let verifier = TokenVerifier::new(Arc::new(JwksKeySource::new(Arc::new(fetcher))));
//! let policy: AuthorizationPolicy = "/omnauth.v1.AuthService/GetUser=admin".parse()?;
//!
//! let server = tonic::transport::Server::builder()
//!     .layer(LoggingLayer::new())
//!     .layer(IdentityLayer::new(verifier, "omniauth"))
//!     .layer(AuthorizationLayer::new(Arc::new(policy)));
//! // server.add_service(AuthServiceServer::new(svc)).serve(addr).await?;
//! # Ok(())
//! # }
//! ```
//!
//! In a handler:
//!
//! ```rust,no_run
//! use grpc_jwt_propagation::IdentityRequestExt;
//! use tonic::{Request, Response, Status};
//!
//! async fn get_user(request: Request<()>) -> Result<Response<()>, Status> {
//!     let caller = request.identity()?;
//!     tracing::info!(subject = %caller.subject_id(), roles = %caller.roles_display());
//!     Ok(Response::new(()))
//! }
//! ```

mod authz;
mod client;
mod extensions;
mod logging;
mod rejection;
mod server;

pub use authz::{AuthorizationLayer, AuthorizationService};
pub use client::{BearerForwardingInterceptor, ForwardedIdentityInterceptor};
pub use extensions::IdentityRequestExt;
pub use logging::{LoggingLayer, LoggingService, CORRELATION_HEADER};
pub use rejection::{rejection_status, AuthRejection};
pub use server::{IdentityLayer, IdentityService};

// Re-export tonic Status for convenience
pub use tonic::Status;
