//! HTTP object-store provider for the cold-storage tier.
//!
//! Objects live at `<endpoint>/<prefix>/<run_hash>.tar.gz` and are written
//! with `PUT`, read with `GET` and checked with `HEAD`. Works against any
//! store that accepts plain authenticated PUTs (S3-compatible gateways,
//! presigning proxies, WebDAV).

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::core::cold_storage::{ColdStorage, ARCHIVE_SUFFIX};
use crate::error::{Result, VaultError};

/// Cold-storage provider backed by an HTTP object store
pub struct HttpObjectStore {
    endpoint: String,
    prefix: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            prefix: prefix.into().trim_matches('/').to_string(),
            token: None,
            client: reqwest::Client::new(),
        }
    }

    /// Send `Authorization: Bearer <token>` with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn object_url(&self, run_hash: &str) -> String {
        if self.prefix.is_empty() {
            format!("{}/{}{}", self.endpoint, run_hash, ARCHIVE_SUFFIX)
        } else {
            format!("{}/{}/{}{}", self.endpoint, self.prefix, run_hash, ARCHIVE_SUFFIX)
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }
}

fn transport(e: reqwest::Error) -> VaultError {
    VaultError::ColdStorage(format!("object store request failed: {}", e))
}

#[async_trait]
impl ColdStorage for HttpObjectStore {
    fn provider(&self) -> &'static str {
        "http"
    }

    async fn put(&self, run_hash: &str, archive: Vec<u8>) -> Result<String> {
        let url = self.object_url(run_hash);
        let response = self
            .authorized(self.client.put(&url))
            .header("Content-Type", "application/gzip")
            .body(archive)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::ColdStorage(format!(
                "PUT {} returned {}: {}",
                url, status, text
            )));
        }

        debug!(%url, "Archive uploaded");
        Ok(url)
    }

    async fn get(&self, run_hash: &str) -> Result<Vec<u8>> {
        let url = self.object_url(run_hash);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(VaultError::not_found("archive", run_hash)),
            status if status.is_success() => {
                Ok(response.bytes().await.map_err(transport)?.to_vec())
            }
            status => Err(VaultError::ColdStorage(format!("GET {} returned {}", url, status))),
        }
    }

    async fn exists(&self, run_hash: &str) -> Result<bool> {
        let url = self.object_url(run_hash);
        let response = self
            .authorized(self.client.head(&url))
            .send()
            .await
            .map_err(transport)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(VaultError::ColdStorage(format!("HEAD {} returned {}", url, status))),
        }
    }
}
