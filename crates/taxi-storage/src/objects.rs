//! Object storage targets for the published artifact.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::{
    classify_reqwest_error, classify_status, write_atomic, ArtifactStore, GcpAuthError,
    GcpTokenProvider, RetryDisposition,
};

const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedObject {
    pub uri: String,
    pub byte_size: u64,
    pub content_hash: String,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error(transparent)]
    Auth(#[from] GcpAuthError),
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upload to {url} returned {status}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("local object write failed: {0:#}")]
    Local(anyhow::Error),
}

impl ObjectStoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            ObjectStoreError::Auth(err) => err.disposition(),
            ObjectStoreError::Request(err) => classify_reqwest_error(err),
            ObjectStoreError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            ObjectStoreError::Read { .. } => RetryDisposition::NonRetryable,
            ObjectStoreError::Local(_) => RetryDisposition::Retryable,
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// URI the warehouse uses to read the object back.
    fn object_uri(&self, bucket: &str, key: &str) -> String;

    /// Uploads `source` to `bucket/key`, replacing any existing object.
    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
    ) -> Result<PublishedObject, ObjectStoreError>;
}

async fn read_source(source: &Path) -> Result<Vec<u8>, ObjectStoreError> {
    fs::read(source).await.map_err(|err| ObjectStoreError::Read {
        path: source.to_path_buf(),
        source: err,
    })
}

/// Google Cloud Storage via the JSON API media upload.
#[derive(Debug, Clone)]
pub struct GcsObjectStore {
    http: reqwest::Client,
    auth: Arc<GcpTokenProvider>,
    upload_base: String,
}

impl GcsObjectStore {
    pub fn new(http: reqwest::Client, auth: Arc<GcpTokenProvider>) -> Self {
        Self {
            http,
            auth,
            upload_base: GCS_UPLOAD_BASE.to_string(),
        }
    }

    pub fn with_upload_base(mut self, base: impl Into<String>) -> Self {
        self.upload_base = base.into();
        self
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    fn object_uri(&self, bucket: &str, key: &str) -> String {
        format!("gs://{bucket}/{key}")
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
    ) -> Result<PublishedObject, ObjectStoreError> {
        let bytes = read_source(source).await?;
        let content_hash = ArtifactStore::sha256_hex(&bytes);
        let byte_size = bytes.len() as u64;
        let token = self.auth.access_token().await?;
        let url = format!("{}/b/{}/o", self.upload_base, bucket);

        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .query(&[("uploadType", "media"), ("name", key)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ObjectStoreError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let uri = self.object_uri(bucket, key);
        info!(%uri, byte_size, "uploaded object");
        Ok(PublishedObject {
            uri,
            byte_size,
            content_hash,
        })
    }
}

/// Filesystem-backed bucket layout (`<root>/<bucket>/<key>`), for local runs
/// and tests.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn object_uri(&self, bucket: &str, key: &str) -> String {
        format!("file://{}", self.path_for(bucket, key).display())
    }

    async fn put_file(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
    ) -> Result<PublishedObject, ObjectStoreError> {
        let bytes = read_source(source).await?;
        let stored = write_atomic(&self.path_for(bucket, key), &bytes)
            .await
            .map_err(ObjectStoreError::Local)?;
        Ok(PublishedObject {
            uri: self.object_uri(bucket, key),
            byte_size: stored.byte_size as u64,
            content_hash: stored.content_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_store_overwrites_fixed_key() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path().join("buckets"));
        let source = dir.path().join("artifact.parquet");

        std::fs::write(&source, b"run one").unwrap();
        let first = store
            .put_file("trips", "processed/yellow_taxi_trips.parquet", &source)
            .await
            .expect("first upload");
        std::fs::write(&source, b"run two").unwrap();
        let second = store
            .put_file("trips", "processed/yellow_taxi_trips.parquet", &source)
            .await
            .expect("second upload");

        assert_eq!(first.uri, second.uri);
        assert!(first.uri.starts_with("file://"));
        let published = store.path_for("trips", "processed/yellow_taxi_trips.parquet");
        assert_eq!(std::fs::read(published).unwrap(), b"run two");
    }

    #[tokio::test]
    async fn missing_source_is_not_retryable() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        let err = store
            .put_file("trips", "processed/x.parquet", &dir.path().join("absent.parquet"))
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
    }

    #[test]
    fn gcs_uri_uses_gs_scheme() {
        let auth = Arc::new(GcpTokenProvider::new(reqwest::Client::new(), "/tmp/key.json"));
        let store = GcsObjectStore::new(reqwest::Client::new(), auth);
        assert_eq!(
            store.object_uri("nyc-taxi-data-pipeline", "processed/yellow_taxi_trips.parquet"),
            "gs://nyc-taxi-data-pipeline/processed/yellow_taxi_trips.parquet"
        );
    }
}
