use std::sync::Arc;

use async_trait::async_trait;
use taxi_core::{StageError, StageKind, StageReport};
use taxi_storage::{ArtifactStore, HttpFetcher, ObjectStore, ObjectStoreError, RetryDisposition};
use taxi_warehouse::{ensure_dataset, ensure_table, TableRef, TableSpec, Warehouse, WarehouseError};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::normalize::{normalize, write_trip_artifact, NormalizeError, Normalized};
use crate::orchestrator::{Stage, StageContext};
use crate::staging::{read_source_parquet, StagingError, StagingStore};

const SOURCE_EXTENSION: &str = "parquet";

fn staging_error(err: StagingError) -> StageError {
    match err {
        StagingError::Cast { .. } => StageError::Schema(err.to_string()),
        other => StageError::transient(other),
    }
}

fn by_disposition(disposition: RetryDisposition, err: impl Into<anyhow::Error>) -> StageError {
    match disposition {
        RetryDisposition::Retryable => StageError::transient(err),
        RetryDisposition::NonRetryable => StageError::rejected(err),
    }
}

fn object_error(err: ObjectStoreError) -> StageError {
    by_disposition(err.disposition(), err)
}

fn warehouse_error(err: WarehouseError) -> StageError {
    by_disposition(err.disposition(), err)
}

/// Downloads the period's source file into `raw/`.
pub struct FetchStage {
    http: HttpFetcher,
    store: ArtifactStore,
    url_template: String,
    file_prefix: String,
}

impl FetchStage {
    pub fn new(config: &PipelineConfig, http: HttpFetcher) -> Self {
        Self {
            http,
            store: ArtifactStore::new(&config.data_dir),
            url_template: config.source_url_template.clone(),
            file_prefix: config.source_file_prefix.clone(),
        }
    }
}

#[async_trait]
impl Stage for FetchStage {
    fn kind(&self) -> StageKind {
        StageKind::Fetch
    }

    async fn run(&self, ctx: &StageContext) -> Result<StageReport, StageError> {
        let url = ctx.period.render_template(&self.url_template);
        let dest = self.store.raw_path_for(ctx.period, &self.file_prefix);
        // Every fetch failure is worth another attempt, including HTTP 4xx:
        // the month's file is often published late.
        let file = self.http.download_to(&url, &dest).await.map_err(|err| {
            warn!(%url, disposition = ?err.disposition(), "download failed");
            StageError::transient(err)
        })?;
        Ok(StageReport::new(format!("downloaded {} bytes from {}", file.byte_size, file.final_url))
            .with_location(file.path.display().to_string())
            .with_content_hash(file.content_hash))
    }
}

/// Replaces the staging table with the newest file in `raw/`.
pub struct StagingLoadStage {
    store: ArtifactStore,
    staging: Arc<dyn StagingStore>,
}

impl StagingLoadStage {
    pub fn new(config: &PipelineConfig, staging: Arc<dyn StagingStore>) -> Self {
        Self {
            store: ArtifactStore::new(&config.data_dir),
            staging,
        }
    }
}

#[async_trait]
impl Stage for StagingLoadStage {
    fn kind(&self) -> StageKind {
        StageKind::StageLoad
    }

    async fn run(&self, _ctx: &StageContext) -> Result<StageReport, StageError> {
        let Some(path) = self
            .store
            .latest_raw_file(SOURCE_EXTENSION)
            .await
            .map_err(StageError::transient)?
        else {
            return Err(StageError::InputMissing(format!(
                "no .{SOURCE_EXTENSION} files in {}",
                self.store.raw_dir().display()
            )));
        };

        let source = path.clone();
        let frame = tokio::task::spawn_blocking(move || read_source_parquet(&source))
            .await
            .map_err(StageError::transient)?
            .map_err(|err| StageError::Schema(format!("{err:#}")))?;

        self.staging.ensure_table().await.map_err(staging_error)?;
        let rows = self.staging.replace_all(&frame).await.map_err(staging_error)?;
        info!(file = %path.display(), rows, "staging table replaced");
        Ok(StageReport::new(format!("staged {rows} rows"))
            .with_rows(rows)
            .with_location(path.display().to_string()))
    }
}

/// Normalizes the staging table into the cleaned artifact.
pub struct NormalizeStage {
    store: ArtifactStore,
    staging: Arc<dyn StagingStore>,
    table: String,
}

impl NormalizeStage {
    pub fn new(config: &PipelineConfig, staging: Arc<dyn StagingStore>) -> Self {
        Self {
            store: ArtifactStore::new(&config.data_dir),
            staging,
            table: config.staging.table.clone(),
        }
    }
}

#[async_trait]
impl Stage for NormalizeStage {
    fn kind(&self) -> StageKind {
        StageKind::Normalize
    }

    async fn run(&self, _ctx: &StageContext) -> Result<StageReport, StageError> {
        let frame = self.staging.read_all().await.map_err(staging_error)?;
        let Normalized { records, stats } = tokio::task::spawn_blocking(move || normalize(&frame))
            .await
            .map_err(StageError::transient)?
            .map_err(|err| match err {
                NormalizeError::EmptyInput => StageError::InputMissing(err.to_string()),
                other => StageError::Schema(other.to_string()),
            })?;

        let dest = self.store.cleaned_artifact_path(&self.table);
        write_trip_artifact(&dest, records)
            .await
            .map_err(StageError::transient)?;

        info!(
            input_rows = stats.input_rows,
            dropped_null_timestamp = stats.dropped_null_timestamp,
            dropped_out_of_range = stats.dropped_out_of_range,
            duplicates_removed = stats.duplicates_removed,
            output_rows = stats.output_rows,
            "normalized staging rows"
        );
        Ok(StageReport::new(format!(
            "kept {} of {} rows ({} null timestamps, {} out of range, {} duplicates)",
            stats.output_rows,
            stats.input_rows,
            stats.dropped_null_timestamp,
            stats.dropped_out_of_range,
            stats.duplicates_removed
        ))
        .with_rows(stats.output_rows)
        .with_location(dest.display().to_string()))
    }
}

/// Copies the cleaned artifact to its fixed object key.
pub struct PublishStage {
    store: ArtifactStore,
    objects: Arc<dyn ObjectStore>,
    table: String,
    bucket: String,
    key: String,
}

impl PublishStage {
    pub fn new(config: &PipelineConfig, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            store: ArtifactStore::new(&config.data_dir),
            objects,
            table: config.staging.table.clone(),
            bucket: config.bucket_name.clone(),
            key: config.published_key(),
        }
    }
}

#[async_trait]
impl Stage for PublishStage {
    fn kind(&self) -> StageKind {
        StageKind::Publish
    }

    async fn run(&self, _ctx: &StageContext) -> Result<StageReport, StageError> {
        let source = self.store.cleaned_artifact_path(&self.table);
        let present = tokio::fs::try_exists(&source)
            .await
            .map_err(StageError::transient)?;
        if !present {
            return Err(StageError::InputMissing(format!(
                "cleaned artifact {} does not exist",
                source.display()
            )));
        }

        let published = self
            .objects
            .put_file(&self.bucket, &self.key, &source)
            .await
            .map_err(object_error)?;
        Ok(StageReport::new(format!("published {} bytes", published.byte_size))
            .with_location(published.uri)
            .with_content_hash(published.content_hash))
    }
}

/// Appends the published object to the partitioned warehouse table. The
/// write mode comes from the stage kind, so re-runs accumulate snapshots.
pub struct WarehouseLoadStage {
    warehouse: Arc<dyn Warehouse>,
    table: TableRef,
    spec: TableSpec,
    source_uri: String,
}

impl WarehouseLoadStage {
    pub fn new(config: &PipelineConfig, warehouse: Arc<dyn Warehouse>, objects: &dyn ObjectStore) -> Self {
        Self {
            warehouse,
            table: config.table_ref(),
            spec: TableSpec::trip_table(),
            source_uri: objects.object_uri(&config.bucket_name, &config.published_key()),
        }
    }
}

#[async_trait]
impl Stage for WarehouseLoadStage {
    fn kind(&self) -> StageKind {
        StageKind::WarehouseLoad
    }

    async fn run(&self, _ctx: &StageContext) -> Result<StageReport, StageError> {
        let warehouse = self.warehouse.as_ref();
        ensure_dataset(warehouse, &self.table.dataset())
            .await
            .map_err(warehouse_error)?;
        ensure_table(warehouse, &self.table, &self.spec)
            .await
            .map_err(warehouse_error)?;
        let summary = warehouse
            .load(&self.source_uri, &self.table, self.kind().write_mode())
            .await
            .map_err(warehouse_error)?;

        let mut report = StageReport::new(format!(
            "load job {} appended {} into {}",
            summary.job_id, self.source_uri, self.table.qualified()
        ))
        .with_location(self.table.qualified());
        if let Some(rows) = summary.output_rows {
            report = report.with_rows(rows);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxi_core::RunPeriod;
    use uuid::Uuid;

    #[test]
    fn cast_failures_are_schema_errors() {
        let err = staging_error(StagingError::Cast {
            row: 4,
            column: "vendor_id",
            source: taxi_core::CastError::NonIntegral(1.5),
        });
        assert!(matches!(err, StageError::Schema(_)));
        assert!(staging_error(StagingError::MissingTable("t".into())).is_retryable());
    }

    #[test]
    fn warehouse_conflicts_are_terminal() {
        assert!(!warehouse_error(WarehouseError::JobFailed {
            job_id: "j".into(),
            message: "invalid parquet".into()
        })
        .is_retryable());
        assert!(warehouse_error(WarehouseError::Api {
            status: 500,
            message: "backend".into()
        })
        .is_retryable());
    }

    #[tokio::test]
    async fn staging_load_without_raw_files_is_missing_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let stage = StagingLoadStage::new(&config, Arc::new(crate::staging::MemoryStagingStore::new()));
        let ctx = StageContext {
            run_id: Uuid::new_v4(),
            period: RunPeriod::new(2024, 1).unwrap(),
        };
        let err = stage.run(&ctx).await.unwrap_err();
        assert!(matches!(err, StageError::InputMissing(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn normalize_stage_writes_artifact_from_staging() {
        use taxi_core::{RawFrame, StagingValue, TRIP_COLUMNS};

        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let staging = Arc::new(crate::staging::MemoryStagingStore::new());
        staging.ensure_table().await.unwrap();

        let mut frame = RawFrame::new(TRIP_COLUMNS.iter().map(|c| c.name.to_string()).collect());
        let mut cells = vec![StagingValue::Null; TRIP_COLUMNS.len()];
        cells[1] = StagingValue::Text("2024-01-01 00:05:00".into());
        cells[2] = StagingValue::Text("2024-01-01 00:25:00".into());
        frame.push_row(cells.clone()).unwrap();
        frame.push_row(cells).unwrap();
        staging.replace_all(&frame).await.unwrap();

        let stage = NormalizeStage::new(&config, staging);
        let ctx = StageContext {
            run_id: Uuid::new_v4(),
            period: RunPeriod::new(2024, 1).unwrap(),
        };
        let report = stage.run(&ctx).await.expect("normalize stage");
        assert_eq!(report.rows, Some(1));

        let artifact = ArtifactStore::new(dir.path()).cleaned_artifact_path(&config.staging.table);
        let records = crate::normalize::read_trip_artifact(&artifact).expect("artifact");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].passenger_count, 0);
        assert_eq!(records[0].rate_code_id, 0);
    }
}
