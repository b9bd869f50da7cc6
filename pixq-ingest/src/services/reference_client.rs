//! Reference data client
//!
//! Looks up product reference data for an item key over HTTP. A miss is a
//! normal outcome (the item proceeds unmatched); only transport and
//! upstream failures surface as errors.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Reference record matched to an item key
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RefMatch {
    pub key: String,
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    #[error("reference transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("reference service error ({status}): {message}")]
    Upstream { status: u16, message: String },
}

/// Source of product reference data
#[async_trait]
pub trait ReferenceLookup: Send + Sync {
    /// Look up a key; Ok(None) means the key has no reference record
    async fn lookup(&self, key: &str) -> Result<Option<RefMatch>, ReferenceError>;
}

/// HTTP reference data client
pub struct HttpReferenceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReferenceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ReferenceLookup for HttpReferenceClient {
    async fn lookup(&self, key: &str) -> Result<Option<RefMatch>, ReferenceError> {
        let url = format!("{}/products/{}", self.base_url, key);

        tracing::debug!(key = %key, "Looking up reference data");

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(key = %key, "No reference record");
            return Ok(None);
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ReferenceError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let record: RefMatch = response.json().await?;
        Ok(Some(record))
    }
}
