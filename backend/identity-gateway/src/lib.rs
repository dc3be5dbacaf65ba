/// Identity Gateway Library
///
/// Serves user profiles over gRPC and HTTP with bearer token verification on
/// both transports.
///
/// ## Modules
///
/// - `config`: Service configuration
/// - `directory`: Keycloak profile directory
/// - `error`: Error types
/// - `grpc`: gRPC AuthService and server bootstrap
/// - `http`: HTTP front door (health, profile forwarding, caller info)
pub mod config;
pub mod directory;
pub mod error;
pub mod grpc;
pub mod http;

pub mod proto {
    tonic::include_proto!("omnauth.v1");

    /// Encoded descriptors served by the reflection service
    pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("omnauth_descriptor");
}

// Re-export commonly used types
pub use directory::{KeycloakDirectory, ProfileDirectory, UserProfile};
pub use error::DirectoryError;
pub use grpc::{AuthServiceImpl, GrpcAuth};
pub use http::{GatewayState, HttpAuth};
