//! In-process warehouse that reads `file://` parquet sources. Used for local
//! dry runs and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::Path;

use async_trait::async_trait;
use parquet::file::reader::{FileReader, SerializedFileReader};
use tokio::sync::Mutex;
use taxi_core::WriteMode;
use uuid::Uuid;

use crate::{DatasetRef, LoadSummary, TableRef, TableSpec, Warehouse, WarehouseError};

#[derive(Debug, Clone)]
pub struct MemoryTable {
    pub spec: TableSpec,
    pub row_count: u64,
    pub loads: Vec<LoadSummary>,
}

#[derive(Debug, Default)]
struct MemoryState {
    datasets: BTreeSet<DatasetRef>,
    tables: BTreeMap<TableRef, MemoryTable>,
}

#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<MemoryState>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn table(&self, table: &TableRef) -> Option<MemoryTable> {
        self.state.lock().await.tables.get(table).cloned()
    }

    pub async fn row_count(&self, table: &TableRef) -> Option<u64> {
        self.table(table).await.map(|t| t.row_count)
    }
}

fn parquet_row_count(uri: &str) -> Result<u64, WarehouseError> {
    let source_error = |message: String| WarehouseError::Source {
        uri: uri.to_string(),
        message,
    };
    let path = uri
        .strip_prefix("file://")
        .ok_or_else(|| source_error("only file:// sources are supported".to_string()))?;
    let file = File::open(Path::new(path)).map_err(|e| source_error(e.to_string()))?;
    let reader = SerializedFileReader::new(file).map_err(|e| source_error(e.to_string()))?;
    let rows = reader.metadata().file_metadata().num_rows();
    u64::try_from(rows).map_err(|_| source_error(format!("negative row count {rows}")))
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn dataset_exists(&self, dataset: &DatasetRef) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().await.datasets.contains(dataset))
    }

    async fn create_dataset(&self, dataset: &DatasetRef) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        if !state.datasets.insert(dataset.clone()) {
            return Err(WarehouseError::AlreadyExists(dataset.qualified()));
        }
        Ok(())
    }

    async fn table_exists(&self, table: &TableRef) -> Result<bool, WarehouseError> {
        Ok(self.state.lock().await.tables.contains_key(table))
    }

    async fn create_table(&self, table: &TableRef, spec: &TableSpec) -> Result<(), WarehouseError> {
        let mut state = self.state.lock().await;
        if !state.datasets.contains(&table.dataset()) {
            return Err(WarehouseError::NotFound(table.dataset().qualified()));
        }
        if state.tables.contains_key(table) {
            return Err(WarehouseError::AlreadyExists(table.qualified()));
        }
        state.tables.insert(
            table.clone(),
            MemoryTable {
                spec: spec.clone(),
                row_count: 0,
                loads: Vec::new(),
            },
        );
        Ok(())
    }

    async fn load(
        &self,
        source_uri: &str,
        table: &TableRef,
        mode: WriteMode,
    ) -> Result<LoadSummary, WarehouseError> {
        let rows = parquet_row_count(source_uri)?;
        let mut state = self.state.lock().await;
        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| WarehouseError::NotFound(table.qualified()))?;
        let summary = LoadSummary {
            job_id: format!("memory_{}", Uuid::new_v4().simple()),
            output_rows: Some(rows),
        };
        match mode {
            WriteMode::Append => target.row_count += rows,
            WriteMode::Replace => {
                target.row_count = rows;
                target.loads.clear();
            }
        }
        target.loads.push(summary.clone());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use arrow_array::{Int64Array, RecordBatch};
    use arrow_schema::{DataType, Field, Schema};
    use parquet::arrow::ArrowWriter;
    use tempfile::tempdir;

    fn write_rows(path: &Path, rows: i64) {
        let schema = Arc::new(Schema::new(vec![Field::new("vendor_id", DataType::Int64, true)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from((0..rows).collect::<Vec<_>>()))],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[tokio::test]
    async fn loads_accumulate() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trips.parquet");
        write_rows(&path, 3);
        let uri = format!("file://{}", path.display());

        let warehouse = MemoryWarehouse::new();
        let table = TableRef::new("p", "d", "t");
        warehouse.create_dataset(&table.dataset()).await.unwrap();
        warehouse.create_table(&table, &TableSpec::trip_table()).await.unwrap();

        warehouse.load(&uri, &table, WriteMode::Append).await.unwrap();
        warehouse.load(&uri, &table, WriteMode::Append).await.unwrap();
        assert_eq!(warehouse.row_count(&table).await, Some(6));
        assert_eq!(warehouse.table(&table).await.unwrap().loads.len(), 2);
    }

    #[tokio::test]
    async fn replace_load_discards_earlier_rows() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("trips.parquet");
        write_rows(&path, 3);
        let uri = format!("file://{}", path.display());

        let warehouse = MemoryWarehouse::new();
        let table = TableRef::new("p", "d", "t");
        warehouse.create_dataset(&table.dataset()).await.unwrap();
        warehouse.create_table(&table, &TableSpec::trip_table()).await.unwrap();

        warehouse.load(&uri, &table, WriteMode::Append).await.unwrap();
        warehouse.load(&uri, &table, WriteMode::Replace).await.unwrap();
        assert_eq!(warehouse.row_count(&table).await, Some(3));
        assert_eq!(warehouse.table(&table).await.unwrap().loads.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_create_reports_conflict() {
        let warehouse = MemoryWarehouse::new();
        let table = TableRef::new("p", "d", "t");
        warehouse.create_dataset(&table.dataset()).await.unwrap();
        assert!(matches!(
            warehouse.create_dataset(&table.dataset()).await,
            Err(WarehouseError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn load_into_missing_table_fails() {
        let warehouse = MemoryWarehouse::new();
        let err = warehouse
            .load("gs://bucket/x.parquet", &TableRef::new("p", "d", "t"), WriteMode::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, WarehouseError::Source { .. }));
    }
}
