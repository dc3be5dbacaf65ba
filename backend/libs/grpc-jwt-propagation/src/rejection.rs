//! Translation of identity failures into gRPC responses

use http::header::CONTENT_TYPE;
use http::HeaderValue;
use identity_core::{AuthFailure, FailureClass};
use tonic::{Code, Status};

/// Response extension naming why a request was refused
///
/// Set by the identity and authorization layers on every rejection so the
/// logging layer can report the failure kind without parsing status text.
#[derive(Debug, Clone)]
pub struct AuthRejection(pub AuthFailure);

/// Caller-visible status for a failure; never carries verifier detail
pub fn rejection_status(failure: &AuthFailure) -> Status {
    let class = failure.class();
    Status::new(class_code(class), class.public_reason())
}

fn class_code(class: FailureClass) -> Code {
    match class {
        FailureClass::Unauthenticated => Code::Unauthenticated,
        FailureClass::Forbidden => Code::PermissionDenied,
        FailureClass::Unavailable => Code::Unavailable,
    }
}

/// Trailers-only gRPC response for a rejected call
pub(crate) fn rejection_response<B: Default>(failure: AuthFailure) -> http::Response<B> {
    let class = failure.class();

    let mut response = http::Response::new(B::default());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert(Status::GRPC_STATUS, HeaderValue::from(class_code(class) as i32));
    headers.insert(
        Status::GRPC_MESSAGE,
        HeaderValue::from_static(class.public_reason()),
    );

    response.extensions_mut().insert(AuthRejection(failure));
    response
}
