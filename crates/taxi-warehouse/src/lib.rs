//! Analytical warehouse seam: dataset/table existence checks, partitioned
//! table definitions and append-only loads.

mod bigquery;
mod memory;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use taxi_core::{
    ColumnKind, ColumnSpec, WriteMode, DROPOFF_ZONE_COLUMN, PICKUP_COLUMN, PICKUP_ZONE_COLUMN,
    TRIP_COLUMNS,
};
use taxi_storage::{classify_reqwest_error, classify_status, GcpAuthError, RetryDisposition};
use thiserror::Error;
use tracing::info;

pub use bigquery::BigQueryWarehouse;
pub use memory::{MemoryTable, MemoryWarehouse};

pub const CRATE_NAME: &str = "taxi-warehouse";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetRef {
    pub project_id: String,
    pub dataset_id: String,
}

impl DatasetRef {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.project_id, self.dataset_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

impl TableRef {
    pub fn new(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
        }
    }

    pub fn dataset(&self) -> DatasetRef {
        DatasetRef {
            project_id: self.project_id.clone(),
            dataset_id: self.dataset_id.clone(),
        }
    }

    /// `project.dataset.table`
    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.project_id, self.dataset_id, self.table_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionGranularity {
    Day,
}

impl PartitionGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionGranularity::Day => "DAY",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimePartitioning {
    pub field: String,
    pub granularity: PartitionGranularity,
}

/// Destination table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub columns: Vec<ColumnSpec>,
    pub partitioning: Option<TimePartitioning>,
    pub clustering: Vec<String>,
}

impl TableSpec {
    /// Trip table: daily partitions on pickup time, clustered by pickup and
    /// dropoff zone.
    pub fn trip_table() -> Self {
        Self {
            columns: TRIP_COLUMNS.to_vec(),
            partitioning: Some(TimePartitioning {
                field: PICKUP_COLUMN.to_string(),
                granularity: PartitionGranularity::Day,
            }),
            clustering: vec![PICKUP_ZONE_COLUMN.to_string(), DROPOFF_ZONE_COLUMN.to_string()],
        }
    }
}

pub fn warehouse_type(kind: ColumnKind) -> &'static str {
    match kind {
        ColumnKind::Integer => "INTEGER",
        ColumnKind::Float => "FLOAT",
        ColumnKind::Timestamp => "TIMESTAMP",
        ColumnKind::Flag => "STRING",
    }
}

pub fn write_disposition(mode: WriteMode) -> &'static str {
    match mode {
        WriteMode::Append => "WRITE_APPEND",
        WriteMode::Replace => "WRITE_TRUNCATE",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSummary {
    pub job_id: String,
    pub output_rows: Option<u64>,
}

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error(transparent)]
    Auth(#[from] GcpAuthError),
    #[error("warehouse request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("warehouse api returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("load job {job_id} failed: {message}")]
    JobFailed { job_id: String, message: String },
    #[error("cannot read load source {uri}: {message}")]
    Source { uri: String, message: String },
}

impl WarehouseError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            WarehouseError::Auth(err) => err.disposition(),
            WarehouseError::Request(err) => classify_reqwest_error(err),
            WarehouseError::Api { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            WarehouseError::AlreadyExists(_)
            | WarehouseError::NotFound(_)
            | WarehouseError::JobFailed { .. }
            | WarehouseError::Source { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Existence checks and creation are separate calls so "absent" is never
/// inferred from an unrelated failure.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, WarehouseError>;

    /// Fails with `AlreadyExists` if another writer created it first.
    async fn create_dataset(&self, dataset: &DatasetRef) -> Result<(), WarehouseError>;

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError>;

    /// Fails with `AlreadyExists` if another writer created it first.
    async fn create_table(&self, table: &TableRef, spec: &TableSpec) -> Result<(), WarehouseError>;

    /// Loads every row of the parquet object at `source_uri` and waits for
    /// the load to finish. `Append` keeps existing rows, `Replace` discards them.
    async fn load(
        &self,
        source_uri: &str,
        table: &TableRef,
        mode: WriteMode,
    ) -> Result<LoadSummary, WarehouseError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Existing,
    Created,
}

pub async fn ensure_dataset(
    warehouse: &dyn Warehouse,
    dataset: &DatasetRef,
) -> Result<Ensured, WarehouseError> {
    if warehouse.dataset_exists(dataset).await? {
        info!(dataset = %dataset.qualified(), "dataset already exists");
        return Ok(Ensured::Existing);
    }
    match warehouse.create_dataset(dataset).await {
        Ok(()) => {
            info!(dataset = %dataset.qualified(), "created dataset");
            Ok(Ensured::Created)
        }
        Err(WarehouseError::AlreadyExists(_)) => Ok(Ensured::Existing),
        Err(err) => Err(err),
    }
}

pub async fn ensure_table(
    warehouse: &dyn Warehouse,
    table: &TableRef,
    spec: &TableSpec,
) -> Result<Ensured, WarehouseError> {
    if warehouse.table_exists(table).await? {
        info!(table = %table.qualified(), "table already exists");
        return Ok(Ensured::Existing);
    }
    match warehouse.create_table(table, spec).await {
        Ok(()) => {
            info!(table = %table.qualified(), "created table");
            Ok(Ensured::Created)
        }
        Err(WarehouseError::AlreadyExists(_)) => Ok(Ensured::Existing),
        Err(err) => Err(err),
    }
}
