//! Local data layout, atomic file writes, streamed HTTP downloads and the
//! object-storage seam for the taxi pipeline.

mod gcp;
mod objects;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use taxi_core::RunPeriod;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub use gcp::{GcpAuthError, GcpTokenProvider, ServiceAccountKey, CLOUD_PLATFORM_SCOPE};
pub use objects::{GcsObjectStore, LocalObjectStore, ObjectStore, ObjectStoreError, PublishedObject};

pub const CRATE_NAME: &str = "taxi-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
}

/// Local working directory: `raw/` holds fetched source files, `cleaned/`
/// holds the normalized artifact, `runs/` holds run logs.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("raw")
    }

    pub fn cleaned_dir(&self) -> PathBuf {
        self.root.join("cleaned")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn raw_path_for(&self, period: RunPeriod, prefix: &str) -> PathBuf {
        self.raw_dir().join(period.file_name(prefix))
    }

    /// One fixed path per table, overwritten by every run.
    pub fn cleaned_artifact_path(&self, table: &str) -> PathBuf {
        self.cleaned_dir().join(format!("{table}_cleaned.parquet"))
    }

    /// Most recent raw file by name. Names embed the zero-padded period, so
    /// lexical order is chronological.
    pub async fn latest_raw_file(&self, extension: &str) -> anyhow::Result<Option<PathBuf>> {
        let dir = self.raw_dir();
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking raw directory {}", dir.display()))?
        {
            return Ok(None);
        }

        let suffix = format!(".{}", extension.trim_start_matches('.'));
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("reading raw directory {}", dir.display()))?;
        let mut latest: Option<String> = None;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing raw directory {}", dir.display()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !name.ends_with(&suffix) {
                continue;
            }
            if latest.as_deref().map_or(true, |current| name.as_str() > current) {
                latest = Some(name);
            }
        }
        Ok(latest.map(|name| dir.join(name)))
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }
}

/// Hidden sibling of `dest`, on the same filesystem so a rename is atomic.
pub fn temp_path_for(dest: &Path) -> PathBuf {
    let name = format!(".{}.tmp", Uuid::new_v4());
    match dest.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Moves a fully written temp file over `dest`, replacing any previous file.
pub async fn promote(temp: &Path, dest: &Path) -> anyhow::Result<()> {
    match fs::rename(temp, dest).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(temp).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming temp file {} -> {}",
                    temp.display(),
                    dest.display()
                )
            })
        }
    }
}

/// Overwrites `dest` with `bytes` via a temp file and rename. Readers never
/// observe a partial file.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let temp_path = temp_path_for(dest);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    promote(&temp_path, dest).await?;
    Ok(StoredArtifact {
        content_hash: ArtifactStore::sha256_hex(bytes),
        path: dest.to_path_buf(),
        byte_size: bytes.len(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else if let Some(status) = err.status() {
        classify_status(status)
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            connect_timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub final_url: String,
    pub path: PathBuf,
    pub byte_size: u64,
    pub content_hash: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Io { .. } => RetryDisposition::Retryable,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> FetchError + '_ {
    move |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Streams `url` into `dest`. The body lands in a temp file that is only
    /// renamed over `dest` once fully received, so a failed download never
    /// leaves a partial file at the final path. Existing files are replaced.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<DownloadedFile, FetchError> {
        let span = info_span!("http_download", url, dest = %dest.display());
        async {
            let mut resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await.map_err(io_error(parent))?;
            }
            let temp_path = temp_path_for(dest);
            let streamed = stream_body(&mut resp, &temp_path).await;
            let (byte_size, content_hash) = match streamed {
                Ok(done) => done,
                Err(err) => {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(err);
                }
            };

            if let Err(source) = fs::rename(&temp_path, dest).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(FetchError::Io {
                    path: dest.to_path_buf(),
                    source,
                });
            }
            debug!(byte_size, "download complete");

            Ok(DownloadedFile {
                final_url,
                path: dest.to_path_buf(),
                byte_size,
                content_hash,
            })
        }
        .instrument(span)
        .await
    }
}

async fn stream_body(
    resp: &mut reqwest::Response,
    temp_path: &Path,
) -> Result<(u64, String), FetchError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .map_err(io_error(temp_path))?;
    let mut hasher = Sha256::new();
    let mut byte_size = 0u64;

    while let Some(chunk) = resp.chunk().await? {
        hasher.update(&chunk);
        byte_size += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(io_error(temp_path))?;
    }
    file.flush().await.map_err(io_error(temp_path))?;
    Ok((byte_size, hex::encode(hasher.finalize())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_replace_previous_content() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("cleaned").join("trips_cleaned.parquet");

        let first = write_atomic(&dest, b"first").await.expect("first write");
        let second = write_atomic(&dest, b"second snapshot").await.expect("second write");

        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(std::fs::read(&dest).expect("read"), b"second snapshot");
        let leftovers = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn latest_raw_file_uses_name_order() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        assert!(store.latest_raw_file("parquet").await.expect("empty").is_none());

        std::fs::create_dir_all(store.raw_dir()).unwrap();
        for name in [
            "yellow_tripdata_2024-11.parquet",
            "yellow_tripdata_2025-01.parquet",
            "yellow_tripdata_2024-12.parquet",
            ".0000.tmp",
            "notes.txt",
        ] {
            std::fs::write(store.raw_dir().join(name), b"x").unwrap();
        }

        let latest = store.latest_raw_file("parquet").await.expect("list").expect("some");
        assert_eq!(
            latest.file_name().unwrap().to_string_lossy(),
            "yellow_tripdata_2025-01.parquet"
        );
    }

    #[test]
    fn layout_paths_are_deterministic() {
        let store = ArtifactStore::new("/data");
        let period = RunPeriod::new(2024, 2).unwrap();
        assert_eq!(
            store.raw_path_for(period, "yellow_tripdata"),
            PathBuf::from("/data/raw/yellow_tripdata_2024-02.parquet")
        );
        assert_eq!(
            store.cleaned_artifact_path("yellow_taxi_trips"),
            PathBuf::from("/data/cleaned/yellow_taxi_trips_cleaned.parquet")
        );
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(
            FetchError::HttpStatus {
                status: 502,
                url: "https://example.test".into()
            }
            .disposition(),
            RetryDisposition::Retryable
        );
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("raw").join("yellow_tripdata_2024-01.parquet");
        let fetcher = HttpFetcher::new(HttpClientConfig {
            connect_timeout: Duration::from_millis(200),
            timeout: Duration::from_secs(1),
            user_agent: None,
        })
        .expect("client");

        let result = fetcher.download_to("http://127.0.0.1:9/missing.parquet", &dest).await;
        assert!(result.is_err());
        assert!(!dest.exists());
    }
}
