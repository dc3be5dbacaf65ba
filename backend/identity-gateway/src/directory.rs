//! User profile lookups against the identity provider
//!
//! `KeycloakDirectory` authenticates with the client-credentials grant and
//! reads users through the Keycloak admin REST API. The service account token
//! is cached until shortly before it expires.

use crate::error::DirectoryError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Renew the service account token this long before it expires
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(10);

/// Public profile fields of a directory user
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    pub id: Option<String>,
    pub username: Option<String>,
    #[serde(rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName")]
    pub last_name: Option<String>,
    pub email: Option<String>,
}

/// Source of user profiles
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    60
}

struct CachedToken {
    value: String,
    renew_at: Instant,
}

/// Keycloak admin API client
pub struct KeycloakDirectory {
    http: reqwest::Client,
    base_url: String,
    realm: String,
    client_id: String,
    client_secret: Option<String>,
    token: Mutex<Option<CachedToken>>,
}

impl KeycloakDirectory {
    pub fn new(
        base_url: impl Into<String>,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectoryError::Internal(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            realm: realm.into(),
            client_id: client_id.into(),
            client_secret,
            token: Mutex::new(None),
        })
    }

    fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.base_url, self.realm
        )
    }

    fn user_url(&self, user_id: &str) -> String {
        format!(
            "{}/admin/realms/{}/users/{}",
            self.base_url, self.realm, user_id
        )
    }

    /// Service account token, from cache when still fresh
    async fn access_token(&self) -> Result<String, DirectoryError> {
        let secret = self
            .client_secret
            .as_deref()
            .ok_or(DirectoryError::NotConfigured)?;

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.renew_at {
                return Ok(token.value.clone());
            }
        }

        debug!(realm = %self.realm, "Requesting directory service account token");
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", secret),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DirectoryError::Unavailable(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            renew_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }
}

#[async_trait]
impl ProfileDirectory for KeycloakDirectory {
    async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, DirectoryError> {
        if !is_valid_user_id(user_id) {
            return Err(DirectoryError::InvalidUserId);
        }

        let token = self.access_token().await?;
        let response = self
            .http
            .get(self.user_url(user_id))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => Ok(response.json().await?),
            StatusCode::NOT_FOUND => Err(DirectoryError::NotFound),
            StatusCode::UNAUTHORIZED => {
                warn!("Directory rejected the service account token");
                self.forget_token().await;
                Err(DirectoryError::Unavailable(
                    "service account token rejected".to_string(),
                ))
            }
            status => Err(DirectoryError::Unavailable(format!(
                "admin API returned {status}"
            ))),
        }
    }
}

/// Keycloak ids are UUIDs; usernames are not accepted here
fn is_valid_user_id(user_id: &str) -> bool {
    !user_id.is_empty()
        && user_id.len() <= 64
        && user_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
