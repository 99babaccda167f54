//! BigQuery v2 REST client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use taxi_core::WriteMode;
use taxi_storage::GcpTokenProvider;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    warehouse_type, write_disposition, DatasetRef, LoadSummary, TableRef, TableSpec, Warehouse,
    WarehouseError,
};

const BIGQUERY_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

#[derive(Debug, Clone)]
pub struct BigQueryWarehouse {
    http: reqwest::Client,
    auth: Arc<GcpTokenProvider>,
    base_url: String,
    location: Option<String>,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

impl JobResource {
    fn is_done(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.state == "DONE")
    }

    fn output_rows(&self) -> Option<u64> {
        self.statistics
            .as_ref()
            .and_then(|s| s.load.as_ref())
            .and_then(|l| l.output_rows.as_deref())
            .and_then(|rows| rows.parse().ok())
    }
}

impl BigQueryWarehouse {
    pub fn new(http: reqwest::Client, auth: Arc<GcpTokenProvider>) -> Self {
        Self {
            http,
            auth,
            base_url: BIGQUERY_BASE.to_string(),
            location: None,
            poll_interval: Duration::from_secs(2),
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn dataset_url(&self, dataset: &DatasetRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}",
            self.base_url, dataset.project_id, dataset.dataset_id
        )
    }

    fn table_url(&self, table: &TableRef) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.base_url, table.project_id, table.dataset_id, table.table_id
        )
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::Response, WarehouseError> {
        let token = self.auth.access_token().await?;
        Ok(self.http.get(url).bearer_auth(token).query(query).send().await?)
    }

    async fn post(&self, url: &str, body: &JsonValue) -> Result<reqwest::Response, WarehouseError> {
        let token = self.auth.access_token().await?;
        Ok(self.http.post(url).bearer_auth(token).json(body).send().await?)
    }

    async fn exists(&self, url: &str) -> Result<bool, WarehouseError> {
        let resp = self.get(url, &[]).await?;
        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(api_error(resp).await),
        }
    }

    async fn insert(&self, url: &str, body: &JsonValue, name: String) -> Result<(), WarehouseError> {
        let resp = self.post(url, body).await?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(WarehouseError::AlreadyExists(name)),
            _ => Err(api_error(resp).await),
        }
    }

    async fn job(&self, project_id: &str, reference: &JobReference) -> Result<JobResource, WarehouseError> {
        let url = format!("{}/projects/{}/jobs/{}", self.base_url, project_id, reference.job_id);
        let query: Vec<(&str, &str)> = reference
            .location
            .as_deref()
            .map(|loc| vec![("location", loc)])
            .unwrap_or_default();
        let resp = self.get(&url, &query).await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(resp.json().await?)
    }
}

async fn api_error(resp: reqwest::Response) -> WarehouseError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    let message = serde_json::from_str::<JsonValue>(&body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(ToString::to_string))
        .unwrap_or(body);
    WarehouseError::Api { status, message }
}

fn table_body(table: &TableRef, spec: &TableSpec) -> JsonValue {
    let fields: Vec<JsonValue> = spec
        .columns
        .iter()
        .map(|c| json!({ "name": c.name, "type": warehouse_type(c.kind), "mode": "NULLABLE" }))
        .collect();
    let mut body = json!({
        "tableReference": {
            "projectId": table.project_id,
            "datasetId": table.dataset_id,
            "tableId": table.table_id,
        },
        "schema": { "fields": fields },
    });
    if let Some(partitioning) = &spec.partitioning {
        body["timePartitioning"] = json!({
            "type": partitioning.granularity.as_str(),
            "field": partitioning.field,
        });
    }
    if !spec.clustering.is_empty() {
        body["clustering"] = json!({ "fields": spec.clustering });
    }
    body
}

fn load_job_body(
    job_id: &str,
    location: Option<&str>,
    source_uri: &str,
    table: &TableRef,
    mode: WriteMode,
) -> JsonValue {
    let mut job_reference = json!({ "projectId": table.project_id, "jobId": job_id });
    if let Some(location) = location {
        job_reference["location"] = json!(location);
    }
    json!({
        "jobReference": job_reference,
        "configuration": {
            "load": {
                "sourceUris": [source_uri],
                "destinationTable": {
                    "projectId": table.project_id,
                    "datasetId": table.dataset_id,
                    "tableId": table.table_id,
                },
                "sourceFormat": "PARQUET",
                "writeDisposition": write_disposition(mode),
            }
        }
    })
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, WarehouseError> {
        self.exists(&self.dataset_url(dataset)).await
    }

    async fn create_dataset(&self, dataset: &DatasetRef) -> Result<(), WarehouseError> {
        let mut body = json!({
            "datasetReference": {
                "projectId": dataset.project_id,
                "datasetId": dataset.dataset_id,
            }
        });
        if let Some(location) = &self.location {
            body["location"] = json!(location);
        }
        let url = format!("{}/projects/{}/datasets", self.base_url, dataset.project_id);
        self.insert(&url, &body, dataset.qualified()).await
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        self.exists(&self.table_url(table)).await
    }

    async fn create_table(&self, table: &TableRef, spec: &TableSpec) -> Result<(), WarehouseError> {
        let url = format!(
            "{}/projects/{}/datasets/{}/tables",
            self.base_url, table.project_id, table.dataset_id
        );
        self.insert(&url, &table_body(table, spec), table.qualified()).await
    }

    async fn load(
        &self,
        source_uri: &str,
        table: &TableRef,
        mode: WriteMode,
    ) -> Result<LoadSummary, WarehouseError> {
        let job_id = format!("taxi_load_{}", Uuid::new_v4().simple());
        let url = format!("{}/projects/{}/jobs", self.base_url, table.project_id);
        let body = load_job_body(&job_id, self.location.as_deref(), source_uri, table, mode);

        let resp = self.post(&url, &body).await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        let mut job: JobResource = resp.json().await?;
        info!(job_id = %job.job_reference.job_id, %source_uri, table = %table.qualified(), ?mode, "load job submitted");

        while !job.is_done() {
            tokio::time::sleep(self.poll_interval).await;
            job = self.job(&table.project_id, &job.job_reference).await?;
            debug!(job_id = %job.job_reference.job_id, state = ?job.status.as_ref().map(|s| &s.state), "polled load job");
        }

        if let Some(err) = job.status.as_ref().and_then(|s| s.error_result.as_ref()) {
            return Err(WarehouseError::JobFailed {
                job_id: job.job_reference.job_id.clone(),
                message: format!(
                    "{}: {}",
                    err.reason.as_deref().unwrap_or("unknown"),
                    err.message.as_deref().unwrap_or("no message")
                ),
            });
        }

        Ok(LoadSummary {
            output_rows: job.output_rows(),
            job_id: job.job_reference.job_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_body_carries_partitioning_and_clustering() {
        let table = TableRef::new("proj", "nyc_taxi_data", "yellow_taxi_trips");
        let body = table_body(&table, &TableSpec::trip_table());
        assert_eq!(body["timePartitioning"]["type"], "DAY");
        assert_eq!(body["timePartitioning"]["field"], "pickup_datetime");
        assert_eq!(
            body["clustering"]["fields"],
            json!(["pickup_location_id", "dropoff_location_id"])
        );
        assert_eq!(body["schema"]["fields"].as_array().unwrap().len(), 17);
        assert_eq!(body["schema"]["fields"][1]["type"], "TIMESTAMP");
        assert_eq!(body["schema"]["fields"][6]["type"], "STRING");
    }

    #[test]
    fn load_job_appends_parquet() {
        let table = TableRef::new("proj", "ds", "trips");
        let body = load_job_body(
            "job1",
            Some("US"),
            "gs://bucket/processed/trips.parquet",
            &table,
            WriteMode::Append,
        );
        let load = &body["configuration"]["load"];
        assert_eq!(load["writeDisposition"], "WRITE_APPEND");
        assert_eq!(load["sourceFormat"], "PARQUET");
        assert_eq!(load["sourceUris"][0], "gs://bucket/processed/trips.parquet");
        assert_eq!(body["jobReference"]["location"], "US");
    }

    #[test]
    fn job_resource_reads_output_rows() {
        let job: JobResource = serde_json::from_value(json!({
            "jobReference": { "projectId": "p", "jobId": "j", "location": "US" },
            "status": { "state": "DONE" },
            "statistics": { "load": { "outputRows": "42" } }
        }))
        .expect("job");
        assert!(job.is_done());
        assert_eq!(job.output_rows(), Some(42));
    }
}
