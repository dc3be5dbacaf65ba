//! Handler-side access to the caller's identity

use identity_core::{IdentityClaims, IdentityContext};
use tonic::{Request, Status};

/// Extension trait for reading the identity bound by [`IdentityLayer`](crate::IdentityLayer)
///
/// Implemented for every `Request<T>`. The layer stores an `IdentityContext`
/// in the http extensions, which tonic carries over into the request handed
/// to the service method.
///
/// ## Usage
///
/// ```rust,no_run
/// use grpc_jwt_propagation::IdentityRequestExt;
/// use tonic::{Request, Response, Status};
///
/// async fn get_user(request: Request<()>) -> Result<Response<()>, Status> {
///     let caller = request.require_role("admin")?;
///     tracing::info!(subject = %caller.subject_id(), "GetUser");
///     Ok(Response::new(()))
/// }
/// ```
pub trait IdentityRequestExt {
    /// Request-scoped context, bound or not
    fn identity_context(&self) -> Option<&IdentityContext>;

    /// Verified claims of the caller
    ///
    /// `Status::unauthenticated` when the layer was not attached or the call
    /// reached the handler through an exempt path.
    fn identity(&self) -> Result<&IdentityClaims, Status>;

    /// Verified claims of a caller holding `role`
    ///
    /// `Status::permission_denied` when the role is missing.
    fn require_role(&self, role: &str) -> Result<&IdentityClaims, Status>;
}

impl<T> IdentityRequestExt for Request<T> {
    fn identity_context(&self) -> Option<&IdentityContext> {
        self.extensions().get::<IdentityContext>()
    }

    fn identity(&self) -> Result<&IdentityClaims, Status> {
        self.identity_context()
            .and_then(IdentityContext::claims)
            .ok_or_else(|| Status::unauthenticated("unauthenticated"))
    }

    fn require_role(&self, role: &str) -> Result<&IdentityClaims, Status> {
        let claims = self.identity()?;
        if !claims.has_role(role) {
            return Err(Status::permission_denied("forbidden"));
        }
        Ok(claims)
    }
}
