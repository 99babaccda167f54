//! NYC taxi trip pipeline: fetch, stage, normalize, publish and load, run
//! in strict order with per-stage retries.

pub mod config;
pub mod normalize;
pub mod orchestrator;
pub mod staging;
pub mod stages;

use std::sync::Arc;

use anyhow::Result;
use taxi_core::{PipelineRun, RunPeriod};
use taxi_storage::{
    ArtifactStore, GcpTokenProvider, GcsObjectStore, HttpClientConfig, HttpFetcher, ObjectStore,
};
use taxi_warehouse::{BigQueryWarehouse, Warehouse};

pub use config::{PipelineConfig, StagingConfig};
pub use normalize::{normalize, read_trip_artifact, NormalizeError, NormalizeStats, Normalized};
pub use orchestrator::{build_scheduler, Pipeline, RetryPolicy, Stage, StageContext};
pub use staging::{MemoryStagingStore, PgStagingStore, StagingError, StagingStore};
pub use stages::{FetchStage, NormalizeStage, PublishStage, StagingLoadStage, WarehouseLoadStage};

pub const CRATE_NAME: &str = "taxi-pipeline";

/// External systems the stages talk to, injectable for local runs and tests.
#[derive(Clone)]
pub struct Collaborators {
    pub staging: Arc<dyn StagingStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
}

impl Collaborators {
    /// Postgres staging, Google Cloud Storage and BigQuery. Nothing connects
    /// until a stage first needs it.
    pub fn production(config: &PipelineConfig, http: reqwest::Client) -> Self {
        let auth = Arc::new(GcpTokenProvider::new(http.clone(), &config.key_path));
        Self {
            staging: Arc::new(PgStagingStore::connect_lazy(&config.staging)),
            objects: Arc::new(GcsObjectStore::new(http.clone(), auth.clone())),
            warehouse: Arc::new(
                BigQueryWarehouse::new(http, auth).with_location(config.warehouse_location.clone()),
            ),
        }
    }
}

pub fn http_fetcher(config: &PipelineConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.http_timeout(),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })
}

/// Wires the five stages in order over the given collaborators.
pub fn build_pipeline_with(
    config: &PipelineConfig,
    http: HttpFetcher,
    collaborators: Collaborators,
) -> Result<Pipeline> {
    config.validate()?;
    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(FetchStage::new(config, http)),
        Box::new(StagingLoadStage::new(config, collaborators.staging.clone())),
        Box::new(NormalizeStage::new(config, collaborators.staging.clone())),
        Box::new(PublishStage::new(config, collaborators.objects.clone())),
        Box::new(WarehouseLoadStage::new(
            config,
            collaborators.warehouse.clone(),
            collaborators.objects.as_ref(),
        )),
    ];
    Ok(Pipeline::new(stages, config.retry_policy())?
        .with_run_log(ArtifactStore::new(&config.data_dir).runs_dir()))
}

pub fn build_pipeline(config: &PipelineConfig) -> Result<Pipeline> {
    let http = http_fetcher(config)?;
    let collaborators = Collaborators::production(config, http.client().clone());
    build_pipeline_with(config, http, collaborators)
}

pub async fn run_once(config: &PipelineConfig) -> Result<PipelineRun> {
    build_pipeline(config)?.run(RunPeriod::current()).await
}

pub async fn run_once_from_env() -> Result<PipelineRun> {
    run_once(&PipelineConfig::from_env()).await
}
