//! Configuration management for the identity gateway
//!
//! Settings are read once at startup from environment variables, with a
//! `.env` file loaded in debug builds. Missing required values abort startup.
//!
//! # Example
//!
//! ```no_run
//! use identity_gateway::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("gRPC on port {}", settings.server.grpc_port);
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use identity_core::{AuthorizationPolicy, ForwardedIdentityCodec, PropagationMode};
use std::env;
use std::time::Duration;
use tracing::info;

/// Application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub keycloak: KeycloakSettings,
    pub jwks: JwksSettings,
    pub auth: AuthSettings,
}

impl Settings {
    pub fn load() -> Result<Self> {
        // Load .env file in development
        if cfg!(debug_assertions) {
            dotenvy::dotenv().ok();
            info!("Loaded .env file for development");
        }

        Self::from_env()
    }

    /// Read settings from the process environment only
    pub fn from_env() -> Result<Self> {
        let keycloak = KeycloakSettings::from_env()?;
        let jwks = JwksSettings::from_env(&keycloak)?;

        Ok(Settings {
            server: ServerSettings::from_env()?,
            keycloak,
            jwks,
            auth: AuthSettings::from_env()?,
        })
    }
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub grpc_port: u16,
    pub http_port: u16,
}

impl ServerSettings {
    fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            grpc_port: env::var("GRPC_PORT")
                .context("GRPC_PORT must be set")?
                .parse()
                .context("Invalid GRPC_PORT")?,
            http_port: env::var("SERVER_PORT")
                .context("SERVER_PORT must be set")?
                .parse()
                .context("Invalid SERVER_PORT")?,
        })
    }

    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.host, self.grpc_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

/// Identity provider settings
#[derive(Debug, Clone)]
pub struct KeycloakSettings {
    pub url: String,
    pub realm: String,
    /// Expected audience of every token
    pub client_id: String,
    /// Admin client secret for profile lookups; `None` disables the directory
    pub client_secret: Option<String>,
    /// Expected `iss`; `None` disables the issuer check
    pub issuer: Option<String>,
}

impl KeycloakSettings {
    fn from_env() -> Result<Self> {
        let url = env::var("KEYCLOAK_URL")
            .context("KEYCLOAK_URL must be set")?
            .trim_end_matches('/')
            .to_string();
        let realm = env::var("KEYCLOAK_REALM").unwrap_or_else(|_| "omni".to_string());
        let client_id = env::var("KEYCLOAK_CLIENT_ID").context("KEYCLOAK_CLIENT_ID must be set")?;
        if client_id.trim().is_empty() {
            bail!("KEYCLOAK_CLIENT_ID must not be empty");
        }

        let issuer = match env::var("KEYCLOAK_ISSUER") {
            Ok(issuer) if issuer.is_empty() => None,
            Ok(issuer) => Some(issuer),
            Err(_) => Some(format!("{url}/realms/{realm}")),
        };

        Ok(Self {
            client_secret: env::var("KEYCLOAK_CLIENT_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            url,
            realm,
            client_id,
            issuer,
        })
    }
}

/// Key set endpoint settings
#[derive(Debug, Clone)]
pub struct JwksSettings {
    pub url: String,
    pub fetch_timeout: Duration,
    pub refresh_cooldown: Duration,
}

impl JwksSettings {
    fn from_env(keycloak: &KeycloakSettings) -> Result<Self> {
        let url = env::var("JWKS_URL").unwrap_or_else(|_| {
            format!(
                "{}/realms/{}/protocol/openid-connect/certs",
                keycloak.url, keycloak.realm
            )
        });

        Ok(Self {
            url,
            fetch_timeout: Duration::from_secs(
                env::var("JWKS_FETCH_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .context("Invalid JWKS_FETCH_TIMEOUT_SECS")?,
            ),
            refresh_cooldown: Duration::from_secs(
                env::var("JWKS_REFRESH_COOLDOWN_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .context("Invalid JWKS_REFRESH_COOLDOWN_SECS")?,
            ),
        })
    }
}

/// Verification, authorization and propagation settings
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub leeway: Duration,
    pub policy: AuthorizationPolicy,
    pub propagation: PropagationMode,
    /// Shared secret for `x-forwarded-identity`; set in trust-forwarded mode
    pub forwarded_secret: Option<String>,
    pub forwarded_max_age: Duration,
}

impl AuthSettings {
    fn from_env() -> Result<Self> {
        let policy = env::var("ENDPOINT_ROLES")
            .unwrap_or_default()
            .parse()
            .context("Invalid ENDPOINT_ROLES")?;
        let propagation: PropagationMode = env::var("IDENTITY_PROPAGATION")
            .unwrap_or_else(|_| "re-verify".to_string())
            .parse()
            .context("Invalid IDENTITY_PROPAGATION")?;

        let forwarded_secret = env::var("FORWARDED_IDENTITY_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        if propagation == PropagationMode::TrustForwarded {
            match &forwarded_secret {
                None => bail!("FORWARDED_IDENTITY_SECRET must be set in trust-forwarded-identity mode"),
                Some(secret) if secret.len() < ForwardedIdentityCodec::MIN_SECRET_LEN => bail!(
                    "FORWARDED_IDENTITY_SECRET must be at least {} bytes",
                    ForwardedIdentityCodec::MIN_SECRET_LEN
                ),
                Some(_) => {}
            }
        }

        Ok(Self {
            leeway: Duration::from_secs(
                env::var("TOKEN_LEEWAY_SECS")
                    .unwrap_or_else(|_| "0".to_string())
                    .parse()
                    .context("Invalid TOKEN_LEEWAY_SECS")?,
            ),
            policy,
            propagation,
            forwarded_secret,
            forwarded_max_age: Duration::from_secs(
                env::var("FORWARDED_IDENTITY_MAX_AGE_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Invalid FORWARDED_IDENTITY_MAX_AGE_SECS")?,
            ),
        })
    }

    /// Codec for forwarded identities, built only in trust-forwarded mode
    pub fn forwarded_codec(&self) -> Result<Option<ForwardedIdentityCodec>> {
        if self.propagation != PropagationMode::TrustForwarded {
            return Ok(None);
        }
        let secret = self
            .forwarded_secret
            .as_deref()
            .context("FORWARDED_IDENTITY_SECRET must be set")?;
        let codec = ForwardedIdentityCodec::new(secret.as_bytes())
            .context("Invalid FORWARDED_IDENTITY_SECRET")?
            .with_max_age(self.forwarded_max_age);
        Ok(Some(codec))
    }
}
