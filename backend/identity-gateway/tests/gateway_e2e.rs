//! End-to-end tests for the identity gateway
//!
//! A real gRPC server runs on an ephemeral port with a fake profile
//! directory; the HTTP front door forwards `/v1/users/{id}` to it, so every
//! request crosses both transports and both identity stacks.

use actix_middleware::Logging;
use actix_web::{http::StatusCode, test, web, App};
use async_trait::async_trait;
use grpc_jwt_propagation::BearerForwardingInterceptor;
use identity_core::test_utils::*;
use identity_core::{
    ForwardedIdentityCodec, HttpKeySetFetcher, JwksKeySource, KeySource, TokenVerifier,
};
use identity_gateway::grpc::{self, GrpcAuth};
use identity_gateway::http::{configure, GatewayState, HttpAuth};
use identity_gateway::proto::auth_service_client::AuthServiceClient;
use identity_gateway::proto::GetUserRequest;
use identity_gateway::{DirectoryError, ProfileDirectory, UserProfile};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const POLICY: &str = "/omnauth.v1.AuthService/GetUser=admin;GET /api/me";
const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

struct FakeDirectory;

#[async_trait]
impl ProfileDirectory for FakeDirectory {
    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
        match user_id {
            "user-42" => Ok(UserProfile {
                id: Some("user-42".into()),
                username: Some("ada".into()),
                first_name: Some("Ada".into()),
                last_name: Some("Lovelace".into()),
                email: None,
            }),
            _ => Err(DirectoryError::NotFound),
        }
    }
}

struct Gateway {
    fetcher: Arc<CountingFetcher>,
    key_source: Arc<dyn KeySource>,
    http_auth: HttpAuth,
    channel: Channel,
    codec: Option<ForwardedIdentityCodec>,
}

impl Gateway {
    /// Start the gRPC server; `codec` selects trust-forwarded mode
    async fn start(codec: Option<ForwardedIdentityCodec>) -> Self {
        let fetcher = CountingFetcher::new(vec![trusted_key()]);
        let key_source: Arc<dyn KeySource> = Arc::new(JwksKeySource::new(fetcher.clone()));
        let verifier = TokenVerifier::new(Arc::clone(&key_source)).with_issuer(TEST_ISSUER);
        let policy = Arc::new(POLICY.parse().unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let grpc_auth = GrpcAuth {
            verifier: verifier.clone(),
            audience: TEST_AUDIENCE.to_string(),
            policy: Arc::clone(&policy),
            codec: codec.clone(),
        };
        tokio::spawn(grpc::serve(
            grpc_auth,
            Arc::new(FakeDirectory),
            listener,
            std::future::pending(),
        ));

        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect_lazy();

        Self {
            fetcher,
            key_source,
            http_auth: HttpAuth {
                verifier,
                audience: TEST_AUDIENCE.to_string(),
                policy,
            },
            channel,
            codec,
        }
    }

    fn state(&self) -> web::Data<GatewayState> {
        web::Data::new(GatewayState::new(
            Arc::clone(&self.key_source),
            self.channel.clone(),
            self.codec.clone(),
        ))
    }
}

macro_rules! app {
    ($gateway:expr) => {{
        let state = $gateway.state();
        let trust_forwarded = state.trusts_forwarded();
        let auth = $gateway.http_auth.clone();
        test::init_service(
            App::new()
                .app_data(state)
                .wrap(Logging::new().exclude("/health"))
                .configure(move |cfg| configure(cfg, &auth, trust_forwarded)),
        )
        .await
    }};
}

fn get_user_as(roles: &[&str]) -> test::TestRequest {
    let token = token_with_roles("caller-1", roles);
    test::TestRequest::get()
        .uri("/v1/users/user-42")
        .insert_header(("Authorization", format!("Bearer {token}")))
}

#[actix_rt::test]
async fn test_admin_reads_profile_through_both_transports() {
    let gateway = Gateway::start(None).await;
    let app = app!(gateway);

    let resp = test::call_service(&app, get_user_as(&["admin"]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(
        body,
        json!({
            "id": "user-42",
            "username": "ada",
            "firstname": "Ada",
            "lastname": "Lovelace",
            "email": "",
        })
    );
}

#[actix_rt::test]
async fn test_member_is_forbidden_by_rpc_policy() {
    let gateway = Gateway::start(None).await;
    let app = app!(gateway);

    let resp = test::call_service(&app, get_user_as(&["member"]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "error": "forbidden" }));
}

#[actix_rt::test]
async fn test_missing_credential_is_401_without_key_fetch() {
    let gateway = Gateway::start(None).await;
    let app = app!(gateway);

    let req = test::TestRequest::get().uri("/v1/users/user-42").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get("www-authenticate").unwrap(), "Bearer");
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body, json!({ "error": "unauthenticated" }));
    assert_eq!(gateway.fetcher.calls(), 0);
}

#[actix_rt::test]
async fn test_unknown_user_is_404() {
    let gateway = Gateway::start(None).await;
    let app = app!(gateway);

    let token = token_with_roles("caller-1", &["admin"]);
    let req = test::TestRequest::get()
        .uri("/v1/users/nobody")
        .insert_header(("Authorization", format!("Bearer {token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[actix_rt::test]
async fn test_key_source_outage_then_recovery() {
    let gateway = Gateway::start(None).await;
    let app = app!(gateway);
    gateway.fetcher.set_failing(true);

    let resp = test::call_service(&app, get_user_as(&["admin"]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    gateway.fetcher.set_failing(false);
    let resp = test::call_service(&app, get_user_as(&["admin"]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let calls = gateway.fetcher.calls();

    let resp = test::call_service(&app, get_user_as(&["admin"]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(gateway.fetcher.calls(), calls);
}

#[actix_rt::test]
async fn test_trust_forwarded_mode_verifies_once_at_the_edge() {
    let codec = ForwardedIdentityCodec::new(SECRET).unwrap();
    let gateway = Gateway::start(Some(codec)).await;
    let app = app!(gateway);

    let resp = test::call_service(&app, get_user_as(&["admin"]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["username"], "ada");

    let resp = test::call_service(&app, get_user_as(&["member"]).to_request()).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let req = test::TestRequest::get().uri("/v1/users/user-42").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[actix_rt::test]
async fn test_direct_grpc_client() {
    let gateway = Gateway::start(None).await;

    let token = token_with_roles("caller-1", &["admin"]);
    let interceptor = BearerForwardingInterceptor::new(&token).unwrap();
    let mut client = AuthServiceClient::with_interceptor(gateway.channel.clone(), interceptor);
    let user = client
        .get_user(GetUserRequest {
            user_id: "user-42".into(),
        })
        .await
        .unwrap()
        .into_inner()
        .user
        .unwrap();
    assert_eq!(user.firstname, "Ada");

    let mut anonymous = AuthServiceClient::new(gateway.channel.clone());
    let status = anonymous
        .get_user(GetUserRequest {
            user_id: "user-42".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::Unauthenticated);
}

#[actix_rt::test]
async fn test_grpc_health_is_exempt() {
    use tonic_health::pb::health_check_response::ServingStatus;
    use tonic_health::pb::health_client::HealthClient;
    use tonic_health::pb::HealthCheckRequest;

    let gateway = Gateway::start(None).await;
    let mut client = HealthClient::new(gateway.channel.clone());

    let response = client
        .check(HealthCheckRequest {
            service: "omnauth.v1.AuthService".into(),
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.status(), ServingStatus::Serving);
    assert_eq!(gateway.fetcher.calls(), 0);
}

#[actix_rt::test]
async fn test_http_health_probes_key_endpoint() {
    let provider = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/realms/omni/protocol/openid-connect/certs"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(jwks_document(&[(TRUSTED_KID, TRUSTED_MODULUS)])),
        )
        .mount(&provider)
        .await;

    let mut gateway = Gateway::start(None).await;
    let fetcher = HttpKeySetFetcher::new(
        format!("{}/realms/omni/protocol/openid-connect/certs", provider.uri()),
        Duration::from_secs(1),
    )
    .unwrap();
    gateway.key_source = Arc::new(JwksKeySource::new(Arc::new(fetcher)));
    let app = app!(gateway);

    let req = test::TestRequest::get().uri("/health").to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body, json!({ "status": "ok" }));

    provider.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&provider)
        .await;

    let req = test::TestRequest::get().uri("/health").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["reason"], "identity_provider_unreachable");
}

#[actix_rt::test]
async fn test_grpc_reflection_is_served_without_credentials() {
    use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
    use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
    use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
    use tonic_reflection::pb::v1::ServerReflectionRequest;

    let gateway = Gateway::start(None).await;
    let mut client = ServerReflectionClient::new(gateway.channel.clone());

    let request = ServerReflectionRequest {
        host: String::new(),
        message_request: Some(MessageRequest::ListServices(String::new())),
    };
    let mut responses = client
        .server_reflection_info(tokio_stream::iter(vec![request]))
        .await
        .unwrap()
        .into_inner();
    let response = responses.message().await.unwrap().unwrap();

    let Some(MessageResponse::ListServicesResponse(listed)) = &response.message_response else {
        panic!("unexpected reflection response: {response:?}");
    };
    let names: Vec<_> = listed.service.iter().map(|s| s.name.as_str()).collect();
    assert!(names.contains(&"omnauth.v1.AuthService"), "{names:?}");
    assert_eq!(gateway.fetcher.calls(), 0);
}
