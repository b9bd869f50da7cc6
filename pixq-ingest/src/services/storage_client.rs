//! Object store client
//!
//! Uploads processed image bytes to the object store over HTTP. The store
//! answers `PUT /{bucket}/{object_name}` with a JSON body carrying the
//! assigned object id; stored objects are addressed by that id for
//! `GET`/`HEAD` afterwards.
//!
//! Workers talk to the store through the `ObjectStore` trait so tests can
//! substitute an in-memory fake.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Identifier assigned by the store
    pub object_id: String,
    /// Name the object was stored under
    pub object_name: String,
    pub size: i64,
}

/// Upload failure
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("object not found: {0}")]
    NotFound(String),
}

/// Destination for processed image bytes
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store one object; the name follows the `<KEY>[_<SEQ>].<ext>` convention
    async fn put(
        &self,
        object_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError>;

    /// Fetch a stored object's bytes by its id
    async fn download(&self, object_id: &str) -> Result<Vec<u8>, StorageError>;

    /// Whether the store holds an object with this id
    async fn exists(&self, object_id: &str) -> Result<bool, StorageError>;
}

/// HTTP object store client
pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    bucket: String,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    object_id: String,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into(),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        object_name: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        let url = format!("{}/{}/{}", self.base_url, self.bucket, object_name);
        let size = bytes.len() as i64;

        tracing::debug!(object = %object_name, size = size, "Uploading object");

        let response = self
            .client
            .put(&url)
            .header("Content-Type", content_type)
            .body(bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message: truncate(&message, 200),
            });
        }

        let body: PutResponse = response.json().await?;

        tracing::debug!(object = %object_name, object_id = %body.object_id, "Upload complete");

        Ok(StoredObject {
            object_id: body.object_id,
            object_name: object_name.to_string(),
            size,
        })
    }

    async fn download(&self, object_id: &str) -> Result<Vec<u8>, StorageError> {
        let url = format!("{}/{}/{}", self.base_url, self.bucket, object_id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(object_id.to_string()));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message: truncate(&message, 200),
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    async fn exists(&self, object_id: &str) -> Result<bool, StorageError> {
        let url = format!("{}/{}/{}", self.base_url, self.bucket, object_id);
        let response = self.client.head(&url).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(StorageError::Rejected {
                status: status.as_u16(),
                message: String::new(),
            });
        }

        Ok(true)
    }
}

/// Content type from an image file extension
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s[..end].to_string()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_cover_supported_extensions() {
        assert_eq!(content_type_for("ABC-123_front.jpg"), "image/jpeg");
        assert_eq!(content_type_for("x.JPEG"), "image/jpeg");
        assert_eq!(content_type_for("x.png"), "image/png");
        assert_eq!(content_type_for("x.webp"), "image/webp");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn mock_store_fails_then_succeeds() {
        let store = mock::MockStore::failing_first(1);

        let first = store.put("a.jpg", vec![1, 2, 3], "image/jpeg").await;
        assert!(matches!(first, Err(StorageError::Rejected { status: 503, .. })));

        let second = store.put("a.jpg", vec![1, 2, 3], "image/jpeg").await.unwrap();
        assert_eq!(second.object_name, "a.jpg");
        assert_eq!(second.size, 3);
        assert_eq!(store.stored_count(), 1);
    }

    #[tokio::test]
    async fn mock_store_serves_objects_by_id() {
        let store = mock::MockStore::new();
        let stored = store.put("b.png", vec![9, 8, 7], "image/png").await.unwrap();

        assert!(store.exists(&stored.object_id).await.unwrap());
        assert_eq!(store.download(&stored.object_id).await.unwrap(), vec![9, 8, 7]);

        assert!(!store.exists("obj-999").await.unwrap());
        assert!(matches!(
            store.download("obj-999").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
