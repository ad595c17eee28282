//! Catalog service client.
//!
//! The personal reference catalog is an external, possibly multi-writer
//! service. This module defines the [`CatalogService`] trait consumed by
//! the flow and a JSON-over-HTTP implementation, [`HttpCatalog`].
//!
//! Attachment is idempotent: attaching the same file twice with
//! `replace_existing = false` succeeds without duplicating anything,
//! because existing attachment state is queried first.

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::config::CatalogConfig;
use crate::error::CatalogError;
use crate::models::{CatalogEntry, ReconciledRecord, SearchQuery};

/// Result of an attach call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    Attached,
    /// The same file was already attached; nothing was duplicated.
    AlreadyAttached,
    Replaced,
}

/// The catalog capability consumed by the interactive flow.
#[async_trait]
pub trait CatalogService: Send + Sync {
    /// Search for entries loosely matching the query. Scoring and ranking
    /// happen client-side in [`crate::matcher`].
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CatalogEntry>, CatalogError>;

    /// Create a new entry from a reconciled record and return its key.
    async fn create(&self, record: &ReconciledRecord) -> Result<String, CatalogError>;

    /// File names currently attached to an entry.
    async fn attachments(&self, key: &str) -> Result<Vec<String>, CatalogError>;

    /// Attach a file to an entry. Must be idempotent for the same file
    /// path when `replace_existing` is false.
    async fn attach(
        &self,
        key: &str,
        file: &Path,
        replace_existing: bool,
    ) -> Result<AttachResult, CatalogError>;
}

/// JSON-over-HTTP catalog client.
///
/// Endpoints:
/// - `GET  /search?author=..&year=..&title=..` → `[CatalogEntry]`
/// - `POST /entries` with a record body → `{ "key": .. }`
/// - `GET  /entries/{key}/attachments` → `[file name]`
/// - `POST /entries/{key}/attachments` with `{ path, replace }`
pub struct HttpCatalog {
    base_url: String,
    api_token: Option<String>,
    client: reqwest::Client,
}

/// Transparent retries on transient failures, before anything is surfaced
/// to the operator.
const TRANSIENT_ATTEMPTS: u32 = 3;

impl HttpCatalog {
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            client,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.header("Authorization", format!("Bearer {}", token)),
            None => builder,
        }
    }

    /// Run one catalog operation with exponential backoff on transient
    /// failures. Rejections and malformed responses are returned as-is.
    async fn with_retry<T, F, Fut>(&self, op_name: &str, mut op: F) -> Result<T, CatalogError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CatalogError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Err(e) if e.is_retryable() && attempt < TRANSIENT_ATTEMPTS => {
                    let backoff = Duration::from_millis(250 * (1u64 << (attempt - 1).min(5)));
                    debug!(op = op_name, attempt, ?backoff, error = %e, "catalog retry");
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, CatalogError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() || status.as_u16() == 429 {
            Err(CatalogError::Unavailable(format!("{}: {}", status, body)))
        } else {
            Err(CatalogError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

#[derive(Serialize)]
struct AttachRequest<'a> {
    path: &'a str,
    replace: bool,
}

impl HttpCatalog {
    async fn search_once(&self, query: &SearchQuery) -> Result<Vec<CatalogEntry>, CatalogError> {
        let mut params: Vec<(&str, String)> = Vec::new();
        for author in &query.authors {
            params.push(("author", author.clone()));
        }
        if let Some(year) = query.year {
            params.push(("year", year.to_string()));
        }
        if let Some(title) = &query.title {
            params.push(("title", title.clone()));
        }

        let resp = self
            .request(self.client.get(format!("{}/search", self.base_url)))
            .query(&params)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<Vec<CatalogEntry>>()
            .await
            .map_err(|e| CatalogError::Malformed(e.to_string()))
    }

    async fn create_once(&self, record: &ReconciledRecord) -> Result<String, CatalogError> {
        let resp = self
            .request(self.client.post(format!("{}/entries", self.base_url)))
            .json(record)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CatalogError::Malformed(e.to_string()))?;
        json.get("key")
            .and_then(|k| k.as_str())
            .map(|k| k.to_string())
            .ok_or_else(|| CatalogError::Malformed("create response missing 'key'".to_string()))
    }

    async fn attachments_once(&self, key: &str) -> Result<Vec<String>, CatalogError> {
        let resp = self
            .request(
                self.client
                    .get(format!("{}/entries/{}/attachments", self.base_url, key)),
            )
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        let resp = Self::check_status(resp).await?;
        resp.json::<Vec<String>>()
            .await
            .map_err(|e| CatalogError::Malformed(e.to_string()))
    }

    async fn post_attachment(
        &self,
        key: &str,
        file: &Path,
        replace: bool,
    ) -> Result<(), CatalogError> {
        let body = AttachRequest {
            path: &file.to_string_lossy(),
            replace,
        };
        let resp = self
            .request(
                self.client
                    .post(format!("{}/entries/{}/attachments", self.base_url, key)),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| CatalogError::Unavailable(e.to_string()))?;
        Self::check_status(resp).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogService for HttpCatalog {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<CatalogEntry>, CatalogError> {
        self.with_retry("search", || self.search_once(query)).await
    }

    async fn create(&self, record: &ReconciledRecord) -> Result<String, CatalogError> {
        self.with_retry("create", || self.create_once(record)).await
    }

    async fn attachments(&self, key: &str) -> Result<Vec<String>, CatalogError> {
        self.with_retry("attachments", || self.attachments_once(key))
            .await
    }

    async fn attach(
        &self,
        key: &str,
        file: &Path,
        replace_existing: bool,
    ) -> Result<AttachResult, CatalogError> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // Query first so a repeated attach is a clean no-op.
        let existing = self.attachments(key).await?;
        let already = existing.iter().any(|a| *a == file_name);
        if already && !replace_existing {
            return Ok(AttachResult::AlreadyAttached);
        }

        self.with_retry("attach", || {
            self.post_attachment(key, file, replace_existing)
        })
        .await?;

        if already {
            Ok(AttachResult::Replaced)
        } else {
            Ok(AttachResult::Attached)
        }
    }
}
