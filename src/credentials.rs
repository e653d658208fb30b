//! OAuth credential lifecycle: storage, proactive refresh, and the
//! authorization handshake.
//!
//! Tokens live in the key-value store under a per-user key. A credential
//! close to expiry is refreshed before use; the refreshed token is persisted
//! with compare-and-set so concurrent refreshers of the same credential
//! converge on a single winner instead of clobbering each other.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::api_client::{ApiError, RateLimitedClient};
use crate::catalog::Service;
use crate::store::{KvStore, StoreError, credential_key};

/// Stored credentials expire out of the store after this long regardless of
/// the token's own lifetime.
const CREDENTIAL_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Tokens expiring within this window get refreshed before use.
const REFRESH_WINDOW_MINUTES: i64 = 10;
const REFRESH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub service: Service,
    pub user_id: i64,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Credential {
    /// Whether the access token expires within `window` from now.
    pub fn expires_within(&self, window: ChronoDuration) -> bool {
        self.expires_at <= Utc::now() + window
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no stored credential for {service} user {user_id}")]
    NotFound { service: Service, user_id: i64 },
    #[error("{service} authorization expired, user must re-authorize")]
    AuthExpired { service: Service },
    #[error("{service} token endpoint returned {status}: {message}")]
    TokenEndpoint {
        service: Service,
        status: StatusCode,
        message: String,
    },
    #[error("no OAuth client configured for {0}")]
    Unconfigured(Service),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode credential: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    token_type: Option<String>,
}

fn token_url(service: Service) -> &'static str {
    match service {
        Service::Spotify => "https://accounts.spotify.com/api/token",
        Service::Youtube => "https://oauth2.googleapis.com/token",
        Service::Soundcloud => "https://api.soundcloud.com/oauth2/token",
    }
}

fn authorize_endpoint(service: Service) -> &'static str {
    match service {
        Service::Spotify => "https://accounts.spotify.com/authorize",
        Service::Youtube => "https://accounts.google.com/o/oauth2/v2/auth",
        Service::Soundcloud => "https://secure.soundcloud.com/authorize",
    }
}

fn scopes(service: Service) -> &'static str {
    match service {
        Service::Spotify => {
            "playlist-read-private playlist-modify-private playlist-modify-public"
        }
        Service::Youtube => "https://www.googleapis.com/auth/youtube",
        Service::Soundcloud => "non-expiring",
    }
}

pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
    api: Arc<RateLimitedClient>,
    oauth: HashMap<Service, OAuthClientConfig>,
    refresh_backoff: Duration,
    #[cfg(test)]
    token_url_override: Option<String>,
}

impl CredentialStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        api: Arc<RateLimitedClient>,
        oauth: HashMap<Service, OAuthClientConfig>,
    ) -> Self {
        Self {
            kv,
            api,
            oauth,
            refresh_backoff: Duration::from_secs(1),
            #[cfg(test)]
            token_url_override: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_token_url(mut self, url: String) -> Self {
        self.token_url_override = Some(url);
        self
    }

    #[cfg(test)]
    pub(crate) fn with_refresh_backoff(mut self, backoff: Duration) -> Self {
        self.refresh_backoff = backoff;
        self
    }

    fn token_endpoint(&self, service: Service) -> String {
        #[cfg(test)]
        if let Some(url) = &self.token_url_override {
            return url.clone();
        }
        token_url(service).to_string()
    }

    fn oauth_client(&self, service: Service) -> Result<&OAuthClientConfig, CredentialError> {
        self.oauth
            .get(&service)
            .ok_or(CredentialError::Unconfigured(service))
    }

    /// Persists a credential, replacing whatever was stored for the user.
    pub async fn store(&self, credential: &Credential) -> Result<(), CredentialError> {
        let key = credential_key(credential.service, credential.user_id);
        let raw = serde_json::to_string(credential)?;
        self.kv.set(&key, &raw, CREDENTIAL_TTL).await?;
        Ok(())
    }

    /// The usable credential for a user, refreshing first when forced or when
    /// the token expires inside the refresh window.
    pub async fn get(
        &self,
        service: Service,
        user_id: i64,
        force_refresh: bool,
    ) -> Result<Credential, CredentialError> {
        let key = credential_key(service, user_id);
        let raw = self
            .kv
            .get(&key)
            .await?
            .ok_or(CredentialError::NotFound { service, user_id })?;
        let credential: Credential = serde_json::from_str(&raw)
            .map_err(|_| CredentialError::NotFound { service, user_id })?;

        if force_refresh || credential.expires_within(ChronoDuration::minutes(REFRESH_WINDOW_MINUTES))
        {
            return self.refresh_with_retry(credential, raw).await;
        }
        Ok(credential)
    }

    /// Refreshes against the token endpoint, persisting the result with
    /// compare-and-set against the raw blob the refresh started from. A lost
    /// race means another worker already refreshed; its credential wins.
    async fn refresh_with_retry(
        &self,
        credential: Credential,
        current_raw: String,
    ) -> Result<Credential, CredentialError> {
        let service = credential.service;
        let user_id = credential.user_id;
        let mut last_error: Option<CredentialError> = None;

        for attempt in 1..=REFRESH_ATTEMPTS {
            if attempt > 1 {
                tokio::time::sleep(self.refresh_backoff * (attempt - 1)).await;
            }
            match self.request_refresh(&credential).await {
                Ok(refreshed) => {
                    let key = credential_key(service, user_id);
                    let raw = serde_json::to_string(&refreshed)?;
                    let won = self
                        .kv
                        .compare_and_set(&key, Some(&current_raw), &raw, CREDENTIAL_TTL)
                        .await?;
                    if won {
                        return Ok(refreshed);
                    }
                    // Someone else refreshed first; use their token.
                    tracing::debug!(%service, user_id, "lost refresh race, loading winner");
                    let winner = self
                        .kv
                        .get(&key)
                        .await?
                        .ok_or(CredentialError::NotFound { service, user_id })?;
                    let winner: Credential = serde_json::from_str(&winner)
                        .map_err(|_| CredentialError::NotFound { service, user_id })?;
                    return Ok(winner);
                }
                Err(e) => {
                    tracing::warn!(%service, user_id, attempt, error = %e, "token refresh failed");
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            tracing::error!(%service, user_id, error = %e, "token refresh exhausted");
        }
        Err(CredentialError::AuthExpired { service })
    }

    async fn request_refresh(&self, credential: &Credential) -> Result<Credential, CredentialError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.as_str()),
        ];
        let response = self.post_token(credential.service, &params).await?;

        Ok(Credential {
            service: credential.service,
            user_id: credential.user_id,
            access_token: response.access_token,
            // Some endpoints rotate the refresh token, others omit it.
            refresh_token: response
                .refresh_token
                .unwrap_or_else(|| credential.refresh_token.clone()),
            expires_at: Utc::now() + ChronoDuration::seconds(response.expires_in),
            token_type: response.token_type.unwrap_or_else(default_token_type),
        })
    }

    /// Completes the authorization-code handshake and persists the resulting
    /// credential.
    pub async fn exchange_code(
        &self,
        service: Service,
        user_id: i64,
        code: &str,
    ) -> Result<Credential, CredentialError> {
        let client = self.oauth_client(service)?;
        let redirect_uri = client.redirect_uri.clone();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
        ];
        let response = self.post_token(service, &params).await?;

        let credential = Credential {
            service,
            user_id,
            access_token: response.access_token,
            refresh_token: response.refresh_token.unwrap_or_default(),
            expires_at: Utc::now() + ChronoDuration::seconds(response.expires_in),
            token_type: response.token_type.unwrap_or_else(default_token_type),
        };
        self.store(&credential).await?;
        Ok(credential)
    }

    /// The URL a user visits to grant access, with a random state parameter.
    pub fn authorize_url(&self, service: Service) -> Result<String, CredentialError> {
        let client = self.oauth_client(service)?;
        Ok(format!(
            "{}?client_id={}&response_type=code&redirect_uri={}&scope={}&state={}",
            authorize_endpoint(service),
            urlencoding::encode(&client.client_id),
            urlencoding::encode(&client.redirect_uri),
            urlencoding::encode(scopes(service)),
            random_state(),
        ))
    }

    /// POSTs a grant to the service's token endpoint. Spotify and SoundCloud
    /// take client credentials as a Basic header, Google wants them in the
    /// form body.
    async fn post_token(
        &self,
        service: Service,
        params: &[(&str, &str)],
    ) -> Result<TokenResponse, CredentialError> {
        let client = self.oauth_client(service)?;
        let url = self.token_endpoint(service);

        let mut form: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let mut request = self.api.http().post(&url);
        match service {
            Service::Spotify | Service::Soundcloud => {
                let basic = BASE64.encode(format!("{}:{}", client.client_id, client.client_secret));
                request = request.header("Authorization", format!("Basic {basic}"));
            }
            Service::Youtube => {
                form.push(("client_id".to_string(), client.client_id.clone()));
                form.push(("client_secret".to_string(), client.client_secret.clone()));
            }
        }

        let (status, body) = self.api.execute(request.form(&form)).await?;
        if !status.is_success() {
            return Err(CredentialError::TokenEndpoint {
                service,
                status,
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        serde_json::from_slice(&body).map_err(CredentialError::Payload)
    }
}

const STATE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const STATE_LEN: usize = 16;

fn random_state() -> String {
    let mut rng = rand::rng();
    (0..STATE_LEN)
        .map(|_| STATE_CHARSET[rng.random_range(0..STATE_CHARSET.len())] as char)
        .collect()
}
