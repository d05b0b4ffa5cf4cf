use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::catalog::auth::CatalogCredential;
use crate::catalog::record::EntityRecord;
use crate::catalog::{LookupError, LookupOutcome, MetadataLookup};
use crate::event::EntityGuid;
use crate::metrics_consts::{CATALOG_LOOKUP_DURATION_MS, CATALOG_LOOKUPS};

const BULK_ENTITY_PATH: &str = "catalog/api/atlas/v2/entity/bulk";
const ATLAS_NOT_FOUND_PREFIX: &str = "ATLAS-404";

#[derive(Debug, Clone)]
pub struct CatalogClientConfig {
    pub endpoint: Url,
    pub timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtlasErrorResponse {
    error_code: String,
}

/// Only a 404 carrying an Atlas not-found error code means the entity is gone;
/// proxies and misrouted paths also answer 404.
fn is_atlas_not_found(body: &str) -> bool {
    serde_json::from_str::<AtlasErrorResponse>(body)
        .map(|e| e.error_code.starts_with(ATLAS_NOT_FOUND_PREFIX))
        .unwrap_or(false)
}

#[derive(Deserialize)]
struct BulkEntityResponse {
    #[serde(default)]
    entities: Vec<EntityRecord>,
}

/// Typed client for the catalog's bulk entity API.
pub struct CatalogClient {
    http: reqwest::Client,
    bulk_url: Url,
    credential: CatalogCredential,
}

impl CatalogClient {
    pub fn new(
        config: &CatalogClientConfig,
        credential: CatalogCredential,
    ) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(LookupError::Transport)?;
        Self::with_http_client(http, config, credential)
    }

    pub fn with_http_client(
        http: reqwest::Client,
        config: &CatalogClientConfig,
        credential: CatalogCredential,
    ) -> Result<Self, LookupError> {
        let mut bulk_url = config.endpoint.clone();
        bulk_url.set_path(BULK_ENTITY_PATH);

        Ok(Self {
            http,
            bulk_url,
            credential,
        })
    }

    /// Acquire a token once, so bad credentials fail the process at startup
    /// instead of stalling every partition later.
    pub async fn verify_credentials(&self) -> Result<(), LookupError> {
        self.credential.bearer_token().await?;
        Ok(())
    }

    async fn fetch(&self, guid: &EntityGuid) -> Result<LookupOutcome, LookupError> {
        let token = self.credential.bearer_token().await?;

        let response = self
            .http
            .get(self.bulk_url.clone())
            .query(&[("guid", guid.as_str())])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LookupError::Timeout
                } else {
                    LookupError::Transport(e)
                }
            })?;

        let status = response.status();
        match status {
            StatusCode::NOT_FOUND => {
                let body = response.text().await.unwrap_or_default();
                if is_atlas_not_found(&body) {
                    debug!(guid = %guid, "entity not found in catalog");
                    return Ok(LookupOutcome::NotFound);
                }
                return Err(LookupError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(LookupError::Unauthorized {
                    status: status.as_u16(),
                });
            }
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                return Err(LookupError::Status {
                    status: s.as_u16(),
                    body,
                });
            }
            _ => {}
        }

        let body: BulkEntityResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                LookupError::Timeout
            } else {
                LookupError::Decode(e)
            }
        })?;

        let entity = body
            .entities
            .into_iter()
            .find(|e| e.guid.as_deref().map_or(true, |g| g == guid.as_str()));

        match entity {
            Some(entity) if !entity.is_deleted() => Ok(LookupOutcome::Found(Box::new(entity))),
            _ => Ok(LookupOutcome::NotFound),
        }
    }
}

#[async_trait]
impl MetadataLookup for CatalogClient {
    async fn lookup(&self, guid: &EntityGuid) -> Result<LookupOutcome, LookupError> {
        let start = Instant::now();
        let result = self.fetch(guid).await;

        let outcome = match &result {
            Ok(LookupOutcome::Found(_)) => "found",
            Ok(LookupOutcome::NotFound) => "not_found",
            Err(e) => {
                warn!(guid = %guid, error = ?e, "catalog lookup failed");
                e.kind()
            }
        };
        metrics::counter!(CATALOG_LOOKUPS, "outcome" => outcome).increment(1);
        metrics::histogram!(CATALOG_LOOKUP_DURATION_MS).record(start.elapsed().as_millis() as f64);

        result
    }
}
