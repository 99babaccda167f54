//! Service-account OAuth for Google Cloud APIs.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::{classify_reqwest_error, classify_status, RetryDisposition};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const REFRESH_SLACK_SECS: i64 = 60;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_json(text: &str) -> Result<Self, GcpAuthError> {
        serde_json::from_str(text).map_err(GcpAuthError::KeyFormat)
    }

    pub async fn from_file(path: &Path) -> Result<Self, GcpAuthError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| GcpAuthError::KeyFile {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_json(&text)
    }
}

#[derive(Debug, Error)]
pub enum GcpAuthError {
    #[error("reading service account key {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing service account key: {0}")]
    KeyFormat(#[source] serde_json::Error),
    #[error("signing token assertion: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
    #[error("token request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },
}

impl GcpAuthError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            GcpAuthError::Request(err) => classify_reqwest_error(err),
            GcpAuthError::TokenEndpoint { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + ChronoDuration::seconds(REFRESH_SLACK_SECS) < self.expires_at
    }
}

/// Exchanges a service-account key for bearer tokens. The key file is read
/// on first use, so constructing a provider has no side effects.
#[derive(Debug)]
pub struct GcpTokenProvider {
    http: reqwest::Client,
    key_path: PathBuf,
    scope: String,
    key: OnceCell<ServiceAccountKey>,
    cached: Mutex<Option<CachedToken>>,
}

impl GcpTokenProvider {
    pub fn new(http: reqwest::Client, key_path: impl Into<PathBuf>) -> Self {
        Self {
            http,
            key_path: key_path.into(),
            scope: CLOUD_PLATFORM_SCOPE.to_string(),
            key: OnceCell::new(),
            cached: Mutex::new(None),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub async fn access_token(&self) -> Result<String, GcpAuthError> {
        let mut cached = self.cached.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh(now)) {
            return Ok(token.value.clone());
        }

        let key = self
            .key
            .get_or_try_init(|| ServiceAccountKey::from_file(&self.key_path))
            .await?;
        let assertion = signed_assertion(key, &self.scope, now)?;

        let resp = self
            .http
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GcpAuthError::TokenEndpoint {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = resp.json().await?;
        debug!(client_email = %key.client_email, expires_in = token.expires_in, "refreshed access token");

        let fresh = CachedToken {
            value: token.access_token,
            expires_at: now + ChronoDuration::seconds(token.expires_in),
        };
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }
}

fn signed_assertion(
    key: &ServiceAccountKey,
    scope: &str,
    now: DateTime<Utc>,
) -> Result<String, GcpAuthError> {
    let claims = AssertionClaims {
        iss: &key.client_email,
        scope,
        aud: &key.token_uri,
        iat: now.timestamp(),
        exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
    };
    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
    Ok(encode(&Header::new(Algorithm::RS256), &claims, &signing_key)?)
}
