//! Content-addressed blob storage.
//!
//! `save` hashes the payload with SHA-256 and derives the URI from the
//! digest, so identical content always yields the same URI and repeated
//! saves are idempotent.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::types::StorageError;

fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn validate_object_name(name: &str) -> Result<(), StorageError> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || !name.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(StorageError::PathViolation(format!(
            "invalid blob object name: {name}"
        )));
    }
    Ok(())
}

/// Blob store capability.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist `bytes`, returning a content-addressed URI.
    async fn save(&self, bytes: &[u8]) -> Result<String, StorageError>;

    /// Load the bytes a URI points at.
    async fn load(&self, uri: &str) -> Result<Vec<u8>, StorageError>;
}

/// Filesystem backend. Objects live under `base/<aa>/<digest>` where `aa`
/// is the first hash byte, keeping directories shallow.
pub struct FsBlobStore {
    base: PathBuf,
}

impl FsBlobStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    fn object_path(&self, digest: &str) -> Result<PathBuf, StorageError> {
        validate_object_name(digest)?;
        let path = self.base.join(&digest[..2]).join(digest);
        // The name validation above makes traversal impossible, but the
        // resolved path must still sit inside the base directory.
        if !path.starts_with(&self.base) {
            return Err(StorageError::PathViolation(format!(
                "blob path escapes base: {}",
                path.display()
            )));
        }
        Ok(path)
    }

    fn parse_uri<'a>(&self, uri: &'a str) -> Result<&'a str, StorageError> {
        uri.strip_prefix("blob:sha256:")
            .ok_or_else(|| StorageError::NotFound(format!("unrecognized blob uri: {uri}")))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn save(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let digest = content_digest(bytes);
        let path = self.object_path(&digest)?;
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        {
            return Ok(format!("blob:sha256:{digest}"));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(format!("blob:sha256:{digest}"))
    }

    async fn load(&self, uri: &str) -> Result<Vec<u8>, StorageError> {
        let digest = self.parse_uri(uri)?;
        let path = self.object_path(digest)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(uri.to_string()))
            }
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }
}

/// Google Cloud Storage backend over the JSON API. Failures surface as
/// typed `StorageError`s rather than raw HTTP errors.
pub struct GcsBlobStore {
    client: reqwest::Client,
    bucket: String,
    access_token: Option<String>,
}

impl GcsBlobStore {
    pub fn new(bucket: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bucket: bucket.into(),
            access_token,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl BlobStore for GcsBlobStore {
    async fn save(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let digest = content_digest(bytes);
        let url = format!(
            "https://storage.googleapis.com/upload/storage/v1/b/{}/o?uploadType=media&name={digest}",
            self.bucket
        );
        let response = self
            .authorize(self.client.post(&url))
            .header("content-type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("GCS upload failed: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Backend(format!(
                "GCS upload returned {status}: {body}"
            )));
        }
        Ok(format!("gs://{}/{digest}", self.bucket))
    }

    async fn load(&self, uri: &str) -> Result<Vec<u8>, StorageError> {
        let object = uri
            .strip_prefix(&format!("gs://{}/", self.bucket))
            .ok_or_else(|| StorageError::NotFound(format!("unrecognized blob uri: {uri}")))?;
        validate_object_name(object)?;
        let url = format!(
            "https://storage.googleapis.com/storage/v1/b/{}/o/{object}?alt=media",
            self.bucket
        );
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| StorageError::ConnectionFailed(format!("GCS download failed: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(uri.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(StorageError::Backend(format!(
                "GCS download returned {status}"
            )));
        }
        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| StorageError::Backend(format!("GCS body read failed: {e}")))
    }
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn save(&self, bytes: &[u8]) -> Result<String, StorageError> {
        let digest = content_digest(bytes);
        self.objects.insert(digest.clone(), bytes.to_vec());
        Ok(format!("blob:sha256:{digest}"))
    }

    async fn load(&self, uri: &str) -> Result<Vec<u8>, StorageError> {
        let digest = uri
            .strip_prefix("blob:sha256:")
            .ok_or_else(|| StorageError::NotFound(format!("unrecognized blob uri: {uri}")))?;
        self.objects
            .get(digest)
            .map(|v| v.clone())
            .ok_or_else(|| StorageError::NotFound(uri.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_is_content_addressed_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());

        let uri1 = store.save(b"hello world").await.unwrap();
        let uri2 = store.save(b"hello world").await.unwrap();
        assert_eq!(uri1, uri2);

        let other = store.save(b"different").await.unwrap();
        assert_ne!(uri1, other);

        let loaded = store.load(&uri1).await.unwrap();
        assert_eq!(loaded, b"hello world");
    }

    #[tokio::test]
    async fn load_rejects_traversal_uris() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let err = store.load("blob:sha256:../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::PathViolation(_)));

        let err = store.load("blob:sha256:aa/bb").await.unwrap_err();
        assert!(matches!(err, StorageError::PathViolation(_)));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        let digest = content_digest(b"never saved");
        let err = store
            .load(&format!("blob:sha256:{digest}"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryBlobStore::new();
        let uri = store.save(b"payload").await.unwrap();
        assert_eq!(store.load(&uri).await.unwrap(), b"payload");
        // Second save of identical content does not grow the store.
        store.save(b"payload").await.unwrap();
        assert_eq!(store.len(), 1);
    }
}
