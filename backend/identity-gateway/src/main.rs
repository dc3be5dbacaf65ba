/// Identity Gateway Main Entry Point
///
/// Starts:
/// - gRPC server (AuthService, health, reflection) behind the identity layers
/// - HTTP front door forwarding to the gRPC server
use actix_middleware::Logging;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use identity_core::{HttpKeySetFetcher, JwksKeySource, KeySource, TokenVerifier};
use identity_gateway::{
    config::Settings,
    grpc::{self, GrpcAuth},
    http::{configure, GatewayState, HttpAuth},
    KeycloakDirectory, ProfileDirectory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tonic::transport::Endpoint;
use tracing::{error, info, warn};

/// Timeout for Keycloak admin API calls
const DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);

#[actix_web::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "identity_gateway=info,info".into()),
        )
        .with_target(false)
        .json()
        .init();

    info!("Starting identity gateway");

    let settings = Settings::load().context("Failed to load configuration")?;
    info!(
        audience = %settings.keycloak.client_id,
        jwks_url = %settings.jwks.url,
        propagation = %settings.auth.propagation,
        rules = settings.auth.policy.len(),
        "Configuration loaded successfully"
    );

    // Verification keys, fetched on demand
    let fetcher = HttpKeySetFetcher::new(&settings.jwks.url, settings.jwks.fetch_timeout)
        .context("Failed to build key set fetcher")?;
    let key_source: Arc<dyn KeySource> = Arc::new(JwksKeySource::with_refresh_cooldown(
        Arc::new(fetcher),
        settings.jwks.refresh_cooldown,
    ));

    let mut verifier = TokenVerifier::new(Arc::clone(&key_source)).with_leeway(settings.auth.leeway);
    match &settings.keycloak.issuer {
        Some(issuer) => verifier = verifier.with_issuer(issuer.clone()),
        None => warn!("KEYCLOAK_ISSUER is empty; issuer check disabled"),
    }

    let policy = Arc::new(settings.auth.policy.clone());
    let codec = settings.auth.forwarded_codec()?;

    if settings.keycloak.client_secret.is_none() {
        warn!("KEYCLOAK_CLIENT_SECRET not set; profile lookups will report unavailable");
    }
    let directory: Arc<dyn ProfileDirectory> = Arc::new(
        KeycloakDirectory::new(
            settings.keycloak.url.clone(),
            settings.keycloak.realm.clone(),
            settings.keycloak.client_id.clone(),
            settings.keycloak.client_secret.clone(),
            DIRECTORY_TIMEOUT,
        )
        .context("Failed to build profile directory client")?,
    );

    // gRPC server in the background
    let grpc_addr = settings.server.grpc_addr();
    let listener = TcpListener::bind(&grpc_addr)
        .await
        .with_context(|| format!("Failed to bind gRPC listener on {grpc_addr}"))?;
    info!("Starting gRPC server on {}", grpc_addr);

    let grpc_auth = GrpcAuth {
        verifier: verifier.clone(),
        audience: settings.keycloak.client_id.clone(),
        policy: Arc::clone(&policy),
        codec: codec.clone(),
    };
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let grpc_handle = tokio::spawn(async move {
        let shutdown = async {
            shutdown_rx.await.ok();
        };
        if let Err(e) = grpc::serve(grpc_auth, directory, listener, shutdown).await {
            error!("gRPC server error: {}", e);
        }
    });

    // HTTP front door, calling the local gRPC server
    let channel = Endpoint::from_shared(format!("http://127.0.0.1:{}", settings.server.grpc_port))
        .context("Invalid gRPC upstream address")?
        .connect_lazy();
    let state = web::Data::new(GatewayState::new(key_source, channel, codec));
    let http_auth = HttpAuth {
        verifier,
        audience: settings.keycloak.client_id.clone(),
        policy,
    };

    let http_addr = settings.server.http_addr();
    info!("Starting HTTP server on {}", http_addr);

    let result = HttpServer::new(move || {
        let trust_forwarded = state.trusts_forwarded();
        let auth = http_auth.clone();
        App::new()
            .app_data(state.clone())
            .wrap(Logging::new().exclude("/health"))
            .configure(move |cfg| configure(cfg, &auth, trust_forwarded))
    })
    .bind(&http_addr)
    .with_context(|| format!("Failed to bind HTTP server on {http_addr}"))?
    .run()
    .await
    .context("HTTP server error");

    // HttpServer returns after SIGINT/SIGTERM; stop gRPC as well
    let _ = shutdown_tx.send(());
    if let Err(e) = grpc_handle.await {
        error!("gRPC server task failed: {}", e);
    }

    info!("Identity gateway shutdown complete");
    result
}
