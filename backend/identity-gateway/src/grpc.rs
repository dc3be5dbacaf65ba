//! gRPC AuthService implementation
//!
//! Handlers run behind the identity layers; the caller is read from the
//! request's `IdentityContext` through `IdentityRequestExt`.

use crate::directory::{ProfileDirectory, UserProfile};
use crate::proto::auth_service_server::AuthService;
use crate::proto::FILE_DESCRIPTOR_SET;
use crate::proto::{GetUserRequest, GetUserResponse, PublicUser};
use grpc_jwt_propagation::{AuthorizationLayer, IdentityLayer, IdentityRequestExt, LoggingLayer};
use identity_core::{AuthorizationPolicy, ForwardedIdentityCodec, TokenVerifier};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

pub use crate::proto::auth_service_server::AuthServiceServer;

/// Fully qualified method path, also the authorization endpoint id
pub const GET_USER_PATH: &str = "/omnauth.v1.AuthService/GetUser";

#[derive(Clone)]
pub struct AuthServiceImpl {
    directory: Arc<dyn ProfileDirectory>,
}

impl AuthServiceImpl {
    pub fn new(directory: Arc<dyn ProfileDirectory>) -> Self {
        Self { directory }
    }
}

#[tonic::async_trait]
impl AuthService for AuthServiceImpl {
    async fn get_user(
        &self,
        request: Request<GetUserRequest>,
    ) -> Result<Response<GetUserResponse>, Status> {
        let caller = request.identity()?;
        let user_id = &request.get_ref().user_id;

        info!(
            subject = %caller.subject_id(),
            roles = %caller.roles_display(),
            user_id = %user_id,
            "Caller requests to view user profile"
        );

        let profile = self
            .directory
            .get_user_profile(user_id)
            .await
            .map_err(|err| {
                warn!(user_id = %user_id, error = %err, kind = err.kind(), "Profile lookup failed");
                err.to_status()
            })?;

        Ok(Response::new(GetUserResponse {
            user: Some(public_user(profile)),
        }))
    }
}

/// Verification and authorization inputs for the gRPC server
#[derive(Clone)]
pub struct GrpcAuth {
    pub verifier: TokenVerifier,
    pub audience: String,
    pub policy: Arc<AuthorizationPolicy>,
    /// Accept signed forwarded identities; `None` re-verifies every call
    pub codec: Option<ForwardedIdentityCodec>,
}

/// Serve `AuthService`, health and reflection on `listener`
///
/// Every call passes Logging -> Identity -> Authorization before reaching a
/// handler. Health and reflection are exempt from authentication.
pub async fn serve(
    auth: GrpcAuth,
    directory: Arc<dyn ProfileDirectory>,
    listener: TcpListener,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<AuthServiceServer<AuthServiceImpl>>()
        .await;

    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let mut identity = IdentityLayer::new(auth.verifier, auth.audience);
    if let Some(codec) = auth.codec {
        identity = identity.trust_forwarded(codec);
    }
    info!(mode = %identity.mode(), "gRPC identity propagation configured");

    Server::builder()
        .layer(LoggingLayer::new())
        .layer(identity)
        .layer(AuthorizationLayer::new(auth.policy))
        .add_service(health_service)
        .add_service(reflection_service)
        .add_service(AuthServiceServer::new(AuthServiceImpl::new(directory)))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;

    Ok(())
}

fn public_user(profile: UserProfile) -> PublicUser {
    PublicUser {
        id: profile.id.unwrap_or_default(),
        username: profile.username.unwrap_or_default(),
        firstname: profile.first_name.unwrap_or_default(),
        lastname: profile.last_name.unwrap_or_default(),
        email: profile.email.unwrap_or_default(),
    }
}
