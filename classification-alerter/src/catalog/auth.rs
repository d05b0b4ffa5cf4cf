use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(120);

pub const CATALOG_SCOPE: &str = "https://purview.azure.net/.default";

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid authority url: {0}")]
    InvalidAuthority(#[from] url::ParseError),
    #[error("token request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("token endpoint responded with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// How requests to the catalog are authenticated.
pub enum CatalogCredential {
    /// A pre-issued bearer token, used as is.
    StaticToken(String),
    ClientSecret(ClientSecretCredential),
}

impl CatalogCredential {
    pub async fn bearer_token(&self) -> Result<String, AuthError> {
        match self {
            CatalogCredential::StaticToken(token) => Ok(token.clone()),
            CatalogCredential::ClientSecret(credential) => credential.token().await,
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// OAuth2 client-credentials grant against `{authority}/{tenant}/oauth2/v2.0/token`.
pub struct ClientSecretCredential {
    http: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
    scope: String,
    cached: Mutex<Option<CachedToken>>,
}

impl ClientSecretCredential {
    pub fn new(
        http: reqwest::Client,
        authority_host: &str,
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, AuthError> {
        let token_path = format!("{tenant_id}/oauth2/v2.0/token");
        let token_url = Url::parse(authority_host)?.join(&token_path)?;

        Ok(Self {
            http,
            token_url,
            client_id: client_id.to_owned(),
            client_secret: client_secret.to_owned(),
            scope: CATALOG_SCOPE.to_owned(),
            cached: Mutex::new(None),
        })
    }

    pub async fn token(&self) -> Result<String, AuthError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
            debug!("catalog token close to expiry, refreshing");
        }

        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(AuthError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response.json().await.map_err(AuthError::Request)?;
        let lifetime = Duration::from_secs(token.expires_in);
        info!(
            expires_in_secs = token.expires_in,
            "acquired catalog access token"
        );

        let access_token = token.access_token;
        *cached = Some(CachedToken {
            access_token: access_token.clone(),
            refresh_at: Instant::now() + lifetime.saturating_sub(REFRESH_MARGIN),
        });

        Ok(access_token)
    }
}
