//! Operator / AVS metadata documents
//!
//! A metadata URI event carries a URL to a JSON document. Fetching it is
//! best effort: any failure (timeout, non-2xx, bad JSON, non-http URI)
//! leaves the metadata columns NULL and never fails the batch.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fields projected onto `operators` / `avs` rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityMetadata {
    pub name: Option<String>,
    pub website: Option<String>,
    pub description: Option<String>,
    pub logo: Option<String>,
    pub twitter: Option<String>,
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// `None` on any failure.
    async fn fetch_metadata(&self, uri: &str) -> Option<EntityMetadata>;
}

/// GET `url` and return the body, bounded by `timeout`.
pub async fn fetch_with_timeout(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<String> {
    let response = tokio::time::timeout(timeout, client.get(url).send())
        .await
        .map_err(|_| SyncError::Timeout(url.to_string()))??;

    if !response.status().is_success() {
        return Err(SyncError::Source(format!(
            "{} returned HTTP {}",
            url,
            response.status()
        )));
    }

    let body = tokio::time::timeout(timeout, response.text())
        .await
        .map_err(|_| SyncError::Timeout(url.to_string()))??;
    Ok(body)
}

/// Parse a metadata document. Blank strings count as absent.
pub fn parse_metadata(text: &str) -> Option<EntityMetadata> {
    let mut meta: EntityMetadata = serde_json::from_str(text).ok()?;
    for field in [
        &mut meta.name,
        &mut meta.website,
        &mut meta.description,
        &mut meta.logo,
        &mut meta.twitter,
    ] {
        if field.as_deref().map(str::trim).map_or(false, str::is_empty) {
            *field = None;
        }
    }
    Some(meta)
}

pub struct HttpMetadataFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpMetadataFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self> {
        let timeout = Duration::from_millis(timeout_ms);
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataFetcher {
    async fn fetch_metadata(&self, uri: &str) -> Option<EntityMetadata> {
        let uri = uri.trim();
        if !(uri.starts_with("https://") || uri.starts_with("http://")) {
            log::debug!("Not fetching non-http metadata URI {:?}", uri);
            return None;
        }

        match fetch_with_timeout(&self.client, uri, self.timeout).await {
            Ok(body) => {
                let parsed = parse_metadata(&body);
                if parsed.is_none() {
                    log::warn!("⚠️  Metadata at {} is not a JSON object", uri);
                }
                parsed
            }
            Err(e) => {
                log::warn!("⚠️  Metadata fetch failed for {}: {}", uri, e);
                None
            }
        }
    }
}
