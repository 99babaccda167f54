use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use taxi_warehouse::TableRef;

use crate::orchestrator::RetryPolicy;

pub const DEFAULT_SOURCE_URL_TEMPLATE: &str =
    "https://d37ci6vzurychx.cloudfront.net/trip-data/yellow_tripdata_{year}-{month}.parquet";
pub const DEFAULT_SOURCE_FILE_PREFIX: &str = "yellow_tripdata";
pub const DEFAULT_SCHEDULE_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    pub table: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            host: "postgres".to_string(),
            port: 5432,
            user: "taxi_user".to_string(),
            password: "taxi_pass".to_string(),
            database: "nyc_taxi".to_string(),
            table: "yellow_taxi_trips".to_string(),
        }
    }
}

impl StagingConfig {
    /// Built from discrete fields so the password never needs URL escaping.
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub source_url_template: String,
    pub source_file_prefix: String,
    pub staging: StagingConfig,
    pub bucket_name: String,
    pub object_prefix: String,
    pub key_path: PathBuf,
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
    pub warehouse_location: Option<String>,
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub schedule_cron: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            source_url_template: DEFAULT_SOURCE_URL_TEMPLATE.to_string(),
            source_file_prefix: DEFAULT_SOURCE_FILE_PREFIX.to_string(),
            staging: StagingConfig::default(),
            bucket_name: "nyc-taxi-data-pipeline".to_string(),
            object_prefix: "processed".to_string(),
            key_path: PathBuf::from("../config/gcs_service_account.json"),
            project_id: "nyc-taxi-data-pipeline".to_string(),
            dataset_id: "nyc_taxi_data".to_string(),
            table_id: "yellow_taxi_trips".to_string(),
            warehouse_location: None,
            max_retries: 2,
            retry_delay_secs: 300,
            schedule_cron: DEFAULT_SCHEDULE_CRON.to_string(),
            http_timeout_secs: 600,
            user_agent: format!("taxi-pipeline/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

fn env_string(name: &str, default: String) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Reads the deployment's environment variables; anything unset keeps its
    /// default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            data_dir: PathBuf::from(env_string("TAXI_DATA_DIR", d.data_dir.display().to_string())),
            source_url_template: env_string("TAXI_SOURCE_URL_TEMPLATE", d.source_url_template),
            source_file_prefix: env_string("TAXI_SOURCE_FILE_PREFIX", d.source_file_prefix),
            staging: StagingConfig {
                host: env_string("DB_HOST", d.staging.host),
                port: env_parse("DB_PORT", d.staging.port),
                user: env_string("DB_USER", d.staging.user),
                password: env_string("DB_PASS", d.staging.password),
                database: env_string("DB_NAME", d.staging.database),
                table: env_string("TAXI_STAGING_TABLE", d.staging.table),
            },
            bucket_name: env_string("GCS_BUCKET_NAME", d.bucket_name),
            object_prefix: env_string("TAXI_OBJECT_PREFIX", d.object_prefix),
            key_path: PathBuf::from(env_string("GCS_KEY_PATH", d.key_path.display().to_string())),
            project_id: env_string("GCP_PROJECT_ID", d.project_id),
            dataset_id: env_string("BQ_DATASET_ID", d.dataset_id),
            table_id: env_string("BQ_TABLE_ID", d.table_id),
            warehouse_location: std::env::var("TAXI_WAREHOUSE_LOCATION")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .or(d.warehouse_location),
            max_retries: env_parse("TAXI_MAX_RETRIES", d.max_retries),
            retry_delay_secs: env_parse("TAXI_RETRY_DELAY_SECS", d.retry_delay_secs),
            schedule_cron: env_string("TAXI_SCHEDULE_CRON", d.schedule_cron),
            http_timeout_secs: env_parse("TAXI_HTTP_TIMEOUT_SECS", d.http_timeout_secs),
            user_agent: env_string("TAXI_USER_AGENT", d.user_agent),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("parsing pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Rejects identifiers that would be unsafe to interpolate into SQL or
    /// warehouse paths.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("staging.table", self.staging.table.as_str()),
            ("dataset_id", self.dataset_id.as_str()),
            ("table_id", self.table_id.as_str()),
        ] {
            if !is_identifier(value) {
                bail!("{field} {value:?} must match [a-z_][a-z0-9_]*");
            }
        }
        if self.bucket_name.trim().is_empty() {
            bail!("bucket_name must not be empty");
        }
        if self.project_id.trim().is_empty() {
            bail!("project_id must not be empty");
        }
        if !self.source_url_template.contains("{year}") || !self.source_url_template.contains("{month}") {
            bail!("source_url_template must contain {{year}} and {{month}}");
        }
        Ok(())
    }

    /// Fixed object key, overwritten every run.
    pub fn published_key(&self) -> String {
        let prefix = self.object_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}.parquet", self.staging.table)
        } else {
            format!("{prefix}/{}.parquet", self.staging.table)
        }
    }

    pub fn table_ref(&self) -> TableRef {
        TableRef::new(&self.project_id, &self.dataset_id, &self.table_id)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
