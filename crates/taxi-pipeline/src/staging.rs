//! Relational staging store. Holds exactly one fetched period at a time:
//! every load truncates the table and inserts the new file's rows in a single
//! transaction.

use std::borrow::Cow;
use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::{
    Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type,
    TimestampMicrosecondType, TimestampMillisecondType, TimestampNanosecondType,
    TimestampSecondType, UInt16Type, UInt32Type, UInt64Type, UInt8Type,
};
use arrow_array::{Array, ArrowPrimitiveType, PrimitiveArray};
use arrow_schema::{DataType, TimeUnit};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Postgres, QueryBuilder, Row, TypeInfo};
use taxi_core::{
    canonical_column_name, CastError, ColumnKind, RawFrame, StagingValue, TRIP_COLUMNS,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::StagingConfig;

/// Rows per INSERT statement. Keeps the bind count (17 per row) well under
/// the Postgres limit of 65535 parameters.
pub const INSERT_CHUNK_ROWS: usize = 3000;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("row {row}, column {column}: {source}")]
    Cast {
        row: usize,
        column: &'static str,
        #[source]
        source: CastError,
    },
    #[error("staging table {0} does not exist")]
    MissingTable(String),
    #[error("staging database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Creates the canonical table if absent. An existing table is left as is.
    async fn ensure_table(&self) -> Result<(), StagingError>;

    /// Replaces the table contents with `frame`, projected onto the canonical
    /// columns. Returns the number of rows written.
    async fn replace_all(&self, frame: &RawFrame) -> Result<u64, StagingError>;

    async fn read_all(&self) -> Result<RawFrame, StagingError>;
}

pub fn create_table_sql(table: &str) -> String {
    let columns: Vec<String> = TRIP_COLUMNS
        .iter()
        .map(|c| format!("{} {}", c.name, c.staging_sql))
        .collect();
    format!("CREATE TABLE IF NOT EXISTS {table} ({})", columns.join(", "))
}

fn column_list() -> String {
    TRIP_COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A cell converted to the physical type of its staging column.
#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    Int(Option<i32>),
    Double(Option<f64>),
    Text(Option<String>),
    Timestamp(Option<NaiveDateTime>),
}

fn bind_value(staging_sql: &str, kind: ColumnKind, value: &StagingValue) -> Result<BindValue, CastError> {
    if kind == ColumnKind::Timestamp {
        return Ok(BindValue::Timestamp(value.to_instant().map(|t| t.naive_utc())));
    }
    match staging_sql {
        "INTEGER" => match value.to_integer()? {
            None => Ok(BindValue::Int(None)),
            Some(v) => i32::try_from(v)
                .map(|v| BindValue::Int(Some(v)))
                .map_err(|_| CastError::OutOfRange(v.to_string())),
        },
        "DOUBLE PRECISION" => Ok(BindValue::Double(value.to_float()?)),
        _ => Ok(BindValue::Text(value.to_flag()?)),
    }
}

fn bind_row(row_idx: usize, row: &[StagingValue]) -> Result<Vec<BindValue>, StagingError> {
    TRIP_COLUMNS
        .iter()
        .zip(row)
        .map(|(spec, value)| {
            bind_value(spec.staging_sql, spec.kind, value).map_err(|source| StagingError::Cast {
                row: row_idx,
                column: spec.name,
                source,
            })
        })
        .collect()
}

/// Binds one insert chunk. `first_row` is the chunk's offset in the frame,
/// so cast errors name the row as the caller sees it.
fn bind_rows(rows: &[Vec<StagingValue>], first_row: usize) -> Result<Vec<Vec<BindValue>>, StagingError> {
    rows.iter()
        .enumerate()
        .map(|(offset, row)| bind_row(first_row + offset, row))
        .collect()
}

/// The frame on the canonical staging columns. Frames that already are,
/// such as those from `read_source_parquet`, are borrowed as is.
fn canonical_frame(frame: &RawFrame) -> Cow<'_, RawFrame> {
    if frame.has_trip_columns() {
        Cow::Borrowed(frame)
    } else {
        Cow::Owned(frame.project_to_trip_columns())
    }
}

/// Postgres-backed staging table.
#[derive(Debug, Clone)]
pub struct PgStagingStore {
    pool: PgPool,
    table: String,
}

impl PgStagingStore {
    /// No connection is opened until the first query.
    pub fn connect_lazy(config: &StagingConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy_with(config.connect_options());
        Self::with_pool(pool, config.table.clone())
    }

    pub fn with_pool(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    async fn ensure_table(&self) -> Result<(), StagingError> {
        sqlx::query(&create_table_sql(&self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// A cast failure in any chunk drops the transaction, so the previous
    /// contents survive.
    async fn replace_all(&self, frame: &RawFrame) -> Result<u64, StagingError> {
        let frame = canonical_frame(frame);
        let insert_prefix = format!("INSERT INTO {} ({}) ", self.table, column_list());

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("TRUNCATE TABLE {}", self.table))
            .execute(&mut *tx)
            .await?;
        for (chunk_idx, chunk) in frame.rows.chunks(INSERT_CHUNK_ROWS).enumerate() {
            let rows = bind_rows(chunk, chunk_idx * INSERT_CHUNK_ROWS)?;
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&insert_prefix);
            builder.push_values(rows, |mut row_builder, row| {
                for value in row {
                    match value {
                        BindValue::Int(v) => row_builder.push_bind(v),
                        BindValue::Double(v) => row_builder.push_bind(v),
                        BindValue::Text(v) => row_builder.push_bind(v),
                        BindValue::Timestamp(v) => row_builder.push_bind(v),
                    };
                }
            });
            builder.build().execute(&mut *tx).await?;
            debug!(chunk = chunk_idx, rows = chunk.len(), "inserted staging chunk");
        }
        tx.commit().await?;

        info!(table = %self.table, rows = frame.len(), "replaced staging table contents");
        Ok(frame.len() as u64)
    }

    async fn read_all(&self) -> Result<RawFrame, StagingError> {
        let rows = sqlx::query(&format!("SELECT * FROM {}", self.table))
            .fetch_all(&self.pool)
            .await?;
        let Some(first) = rows.first() else {
            return Ok(RawFrame::new(Vec::new()));
        };
        let columns: Vec<String> = first.columns().iter().map(|c| c.name().to_string()).collect();

        let mut frame = RawFrame::new(columns);
        for row in &rows {
            let cells = (0..row.len())
                .map(|idx| decode_cell(row, idx))
                .collect::<Result<Vec<_>, _>>()?;
            frame.rows.push(cells);
        }
        Ok(frame)
    }
}

fn decode_cell(row: &PgRow, idx: usize) -> Result<StagingValue, sqlx::Error> {
    let type_name = row.columns()[idx].type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "INT2" => row.try_get::<Option<i16>, _>(idx)?.map(|v| StagingValue::Integer(v.into())),
        "INT4" => row.try_get::<Option<i32>, _>(idx)?.map(|v| StagingValue::Integer(v.into())),
        "INT8" => row.try_get::<Option<i64>, _>(idx)?.map(StagingValue::Integer),
        "FLOAT4" => row.try_get::<Option<f32>, _>(idx)?.map(|v| StagingValue::Float(v.into())),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx)?.map(StagingValue::Float),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(idx)?.map(StagingValue::Text)
        }
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)?
            .map(|v| StagingValue::Timestamp(v.and_utc())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)?
            .map(StagingValue::Timestamp),
        other => {
            return Err(sqlx::Error::Decode(
                format!("unsupported staging column type {other}").into(),
            ))
        }
    };
    Ok(value.unwrap_or(StagingValue::Null))
}

/// In-process staging table for local runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    table: Mutex<Option<RawFrame>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn row_count(&self) -> Option<usize> {
        self.table.lock().await.as_ref().map(RawFrame::len)
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn ensure_table(&self) -> Result<(), StagingError> {
        let mut table = self.table.lock().await;
        if table.is_none() {
            *table = Some(RawFrame::new(
                TRIP_COLUMNS.iter().map(|c| c.name.to_string()).collect(),
            ));
        }
        Ok(())
    }

    async fn replace_all(&self, frame: &RawFrame) -> Result<u64, StagingError> {
        let frame = canonical_frame(frame);
        for (row_idx, row) in frame.rows.iter().enumerate() {
            bind_row(row_idx, row)?;
        }
        let mut table = self.table.lock().await;
        let Some(current) = table.as_mut() else {
            return Err(StagingError::MissingTable("memory".to_string()));
        };
        let rows = frame.len() as u64;
        *current = frame.into_owned();
        Ok(rows)
    }

    async fn read_all(&self) -> Result<RawFrame, StagingError> {
        self.table
            .lock()
            .await
            .clone()
            .ok_or_else(|| StagingError::MissingTable("memory".to_string()))
    }
}

fn primitive_values<T, F>(array: &PrimitiveArray<T>, convert: F) -> Vec<StagingValue>
where
    T: ArrowPrimitiveType,
    F: Fn(T::Native) -> StagingValue,
{
    (0..array.len())
        .map(|i| {
            if array.is_null(i) {
                StagingValue::Null
            } else {
                convert(array.value(i))
            }
        })
        .collect()
}

fn instant_or_null(instant: Option<DateTime<Utc>>) -> StagingValue {
    instant.map(StagingValue::Timestamp).unwrap_or(StagingValue::Null)
}

fn column_values(array: &dyn Array) -> Result<Vec<StagingValue>> {
    use StagingValue::{Float, Integer, Text, Timestamp};

    let values = match array.data_type() {
        DataType::Null => vec![StagingValue::Null; array.len()],
        DataType::Int8 => primitive_values(array.as_primitive::<Int8Type>(), |v| Integer(v.into())),
        DataType::Int16 => primitive_values(array.as_primitive::<Int16Type>(), |v| Integer(v.into())),
        DataType::Int32 => primitive_values(array.as_primitive::<Int32Type>(), |v| Integer(v.into())),
        DataType::Int64 => primitive_values(array.as_primitive::<Int64Type>(), Integer),
        DataType::UInt8 => primitive_values(array.as_primitive::<UInt8Type>(), |v| Integer(v.into())),
        DataType::UInt16 => primitive_values(array.as_primitive::<UInt16Type>(), |v| Integer(v.into())),
        DataType::UInt32 => primitive_values(array.as_primitive::<UInt32Type>(), |v| Integer(v.into())),
        DataType::UInt64 => primitive_values(array.as_primitive::<UInt64Type>(), |v| {
            i64::try_from(v).map(Integer).unwrap_or(Float(v as f64))
        }),
        DataType::Float32 => primitive_values(array.as_primitive::<Float32Type>(), |v| Float(v.into())),
        DataType::Float64 => primitive_values(array.as_primitive::<Float64Type>(), Float),
        DataType::Utf8 => array
            .as_string::<i32>()
            .iter()
            .map(|v| v.map(|s| Text(s.to_string())).unwrap_or(StagingValue::Null))
            .collect(),
        DataType::LargeUtf8 => array
            .as_string::<i64>()
            .iter()
            .map(|v| v.map(|s| Text(s.to_string())).unwrap_or(StagingValue::Null))
            .collect(),
        DataType::Timestamp(TimeUnit::Second, _) => {
            primitive_values(array.as_primitive::<TimestampSecondType>(), |v| {
                instant_or_null(DateTime::from_timestamp(v, 0))
            })
        }
        DataType::Timestamp(TimeUnit::Millisecond, _) => {
            primitive_values(array.as_primitive::<TimestampMillisecondType>(), |v| {
                instant_or_null(DateTime::from_timestamp_millis(v))
            })
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            primitive_values(array.as_primitive::<TimestampMicrosecondType>(), |v| {
                instant_or_null(DateTime::from_timestamp_micros(v))
            })
        }
        DataType::Timestamp(TimeUnit::Nanosecond, _) => {
            primitive_values(array.as_primitive::<TimestampNanosecondType>(), |v| {
                Timestamp(DateTime::from_timestamp_nanos(v))
            })
        }
        other => bail!("unsupported source column type {other}"),
    };
    Ok(values)
}

/// Reads a fetched source file straight onto the canonical staging columns.
/// Only source fields that fill a staging slot are decoded; the rest are
/// skipped whatever their type. When two fields map to one slot the first
/// wins.
pub fn read_source_parquet(path: &Path) -> Result<RawFrame> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?;
    let source_names: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();

    let mut slots: [Option<usize>; TRIP_COLUMNS.len()] = [None; TRIP_COLUMNS.len()];
    for (idx, name) in source_names.iter().enumerate() {
        let canonical = canonical_column_name(name);
        match TRIP_COLUMNS.iter().position(|c| c.name == canonical) {
            Some(pos) if slots[pos].is_none() => slots[pos] = Some(idx),
            _ => debug!(column = %name, "skipping source column"),
        }
    }

    let reader = builder
        .build()
        .with_context(|| format!("building parquet reader {}", path.display()))?;

    let mut frame = RawFrame::new(TRIP_COLUMNS.iter().map(|c| c.name.to_string()).collect());
    for batch in reader {
        let batch = batch.with_context(|| format!("decoding record batch {}", path.display()))?;
        let columns = slots
            .iter()
            .map(|slot| match slot {
                Some(idx) => column_values(batch.column(*idx).as_ref())
                    .with_context(|| format!("column {}", source_names[*idx]))
                    .map(Some),
                None => Ok(None),
            })
            .collect::<Result<Vec<_>>>()?;

        frame.rows.reserve(batch.num_rows());
        for row_idx in 0..batch.num_rows() {
            frame.rows.push(
                columns
                    .iter()
                    .map(|values| match values {
                        Some(values) => values[row_idx].clone(),
                        None => StagingValue::Null,
                    })
                    .collect(),
            );
        }
    }
    debug!(path = %path.display(), rows = frame.len(), "read source file");
    Ok(frame)
}
