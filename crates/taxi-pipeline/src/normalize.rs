//! Schema normalization: turns the untyped staging frame into validated,
//! deduplicated `TripRecord`s and writes them as the cleaned parquet artifact.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::cast::AsArray;
use arrow_array::types::{Float64Type, Int64Type, TimestampMicrosecondType};
use arrow_array::{
    Array, ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, SchemaRef, TimeUnit};
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use taxi_core::{
    canonical_column_name, is_legacy_column, truncate_to_micros, within_warehouse_range,
    CastError, ColumnKind, RawFrame, StagingValue, TripRecord, TRIP_COLUMNS,
};
use taxi_storage::{promote, temp_path_for};
use thiserror::Error;
use tracing::debug;

// Positions in TRIP_COLUMNS.
const VENDOR_ID: usize = 0;
const PICKUP: usize = 1;
const DROPOFF: usize = 2;
const PASSENGER_COUNT: usize = 3;
const TRIP_DISTANCE: usize = 4;
const RATE_CODE_ID: usize = 5;
const STORE_AND_FWD_FLAG: usize = 6;
const PICKUP_LOCATION_ID: usize = 7;
const DROPOFF_LOCATION_ID: usize = 8;
const PAYMENT_TYPE: usize = 9;
const FARE_AMOUNT: usize = 10;
const EXTRA: usize = 11;
const MTA_TAX: usize = 12;
const TIP_AMOUNT: usize = 13;
const TOLLS_AMOUNT: usize = 14;
const IMPROVEMENT_SURCHARGE: usize = 15;
const TOTAL_AMOUNT: usize = 16;

const REQUIRED_COLUMNS: [usize; 4] = [PICKUP, DROPOFF, PASSENGER_COUNT, RATE_CODE_ID];

static NULL_CELL: StagingValue = StagingValue::Null;

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("staging table is empty")]
    EmptyInput,
    #[error("required column {0} is missing")]
    MissingColumn(&'static str),
    #[error("columns {first:?} and {second:?} both map to {canonical}")]
    AmbiguousColumn {
        canonical: &'static str,
        first: String,
        second: String,
    },
    #[error("row {row}, column {column}: {source}")]
    Cast {
        row: usize,
        column: &'static str,
        #[source]
        source: CastError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub input_rows: u64,
    pub dropped_null_timestamp: u64,
    pub dropped_out_of_range: u64,
    pub duplicates_removed: u64,
    pub output_rows: u64,
}

#[derive(Debug, Clone)]
pub struct Normalized {
    pub records: Vec<TripRecord>,
    pub stats: NormalizeStats,
}

/// Where each canonical column lives in the input frame, if anywhere.
type ColumnSlots = [Option<usize>; TRIP_COLUMNS.len()];

fn resolve_columns(columns: &[String]) -> Result<ColumnSlots, NormalizeError> {
    let mut slots: ColumnSlots = [None; TRIP_COLUMNS.len()];
    for (idx, raw) in columns.iter().enumerate() {
        let canonical = canonical_column_name(raw);
        if is_legacy_column(&canonical) {
            debug!(column = %raw, "dropping legacy column");
            continue;
        }
        let Some(pos) = TRIP_COLUMNS.iter().position(|c| c.name == canonical) else {
            debug!(column = %raw, "dropping unrecognised column");
            continue;
        };
        if let Some(previous) = slots[pos] {
            return Err(NormalizeError::AmbiguousColumn {
                canonical: TRIP_COLUMNS[pos].name,
                first: columns[previous].clone(),
                second: raw.clone(),
            });
        }
        slots[pos] = Some(idx);
    }
    for pos in REQUIRED_COLUMNS {
        if slots[pos].is_none() {
            return Err(NormalizeError::MissingColumn(TRIP_COLUMNS[pos].name));
        }
    }
    Ok(slots)
}

struct RowView<'a> {
    index: usize,
    cells: &'a [StagingValue],
    slots: &'a ColumnSlots,
}

impl RowView<'_> {
    fn cell(&self, pos: usize) -> &StagingValue {
        self.slots[pos]
            .and_then(|idx| self.cells.get(idx))
            .unwrap_or(&NULL_CELL)
    }

    fn cast_error(&self, pos: usize) -> impl FnOnce(CastError) -> NormalizeError + '_ {
        move |source| NormalizeError::Cast {
            row: self.index,
            column: TRIP_COLUMNS[pos].name,
            source,
        }
    }

    fn integer(&self, pos: usize) -> Result<Option<i64>, NormalizeError> {
        self.cell(pos).to_integer().map_err(self.cast_error(pos))
    }

    fn float(&self, pos: usize) -> Result<Option<f64>, NormalizeError> {
        self.cell(pos).to_float().map_err(self.cast_error(pos))
    }

    fn flag(&self, pos: usize) -> Result<Option<String>, NormalizeError> {
        self.cell(pos).to_flag().map_err(self.cast_error(pos))
    }

    fn record(
        &self,
        pickup: DateTime<Utc>,
        dropoff: DateTime<Utc>,
    ) -> Result<TripRecord, NormalizeError> {
        Ok(TripRecord {
            vendor_id: self.integer(VENDOR_ID)?,
            pickup_datetime: truncate_to_micros(pickup),
            dropoff_datetime: truncate_to_micros(dropoff),
            passenger_count: self.integer(PASSENGER_COUNT)?.unwrap_or(0),
            trip_distance: self.float(TRIP_DISTANCE)?,
            rate_code_id: self.integer(RATE_CODE_ID)?.unwrap_or(0),
            store_and_fwd_flag: self.flag(STORE_AND_FWD_FLAG)?,
            pickup_location_id: self.integer(PICKUP_LOCATION_ID)?,
            dropoff_location_id: self.integer(DROPOFF_LOCATION_ID)?,
            payment_type: self.integer(PAYMENT_TYPE)?,
            fare_amount: self.float(FARE_AMOUNT)?,
            extra: self.float(EXTRA)?,
            mta_tax: self.float(MTA_TAX)?,
            tip_amount: self.float(TIP_AMOUNT)?,
            tolls_amount: self.float(TOLLS_AMOUNT)?,
            improvement_surcharge: self.float(IMPROVEMENT_SURCHARGE)?,
            total_amount: self.float(TOTAL_AMOUNT)?,
        })
    }
}

/// Applies rename, timestamp parsing, range filtering, microsecond
/// truncation, null defaults and full-row deduplication. The first occurrence
/// of a duplicate wins. Any cell that cannot be coerced fails the whole frame.
pub fn normalize(frame: &RawFrame) -> Result<Normalized, NormalizeError> {
    if frame.is_empty() {
        return Err(NormalizeError::EmptyInput);
    }
    let slots = resolve_columns(&frame.columns)?;

    let mut stats = NormalizeStats {
        input_rows: frame.len() as u64,
        ..Default::default()
    };
    let mut seen = HashSet::with_capacity(frame.len());
    let mut records = Vec::with_capacity(frame.len());

    for (index, cells) in frame.rows.iter().enumerate() {
        let row = RowView {
            index,
            cells,
            slots: &slots,
        };
        let (Some(pickup), Some(dropoff)) = (row.cell(PICKUP).to_instant(), row.cell(DROPOFF).to_instant())
        else {
            stats.dropped_null_timestamp += 1;
            continue;
        };
        if !within_warehouse_range(&pickup) || !within_warehouse_range(&dropoff) {
            stats.dropped_out_of_range += 1;
            continue;
        }

        let record = row.record(pickup, dropoff)?;
        if seen.insert(record.fingerprint()) {
            records.push(record);
        } else {
            stats.duplicates_removed += 1;
        }
    }

    stats.output_rows = records.len() as u64;
    Ok(Normalized { records, stats })
}

fn arrow_type(kind: ColumnKind) -> DataType {
    match kind {
        ColumnKind::Integer => DataType::Int64,
        ColumnKind::Float => DataType::Float64,
        ColumnKind::Flag => DataType::Utf8,
        ColumnKind::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
    }
}

/// Schema of the cleaned artifact, field for field the warehouse table.
pub fn trip_arrow_schema() -> SchemaRef {
    let fields: Vec<ArrowField> = TRIP_COLUMNS
        .iter()
        .enumerate()
        .map(|(pos, c)| {
            let nullable = !REQUIRED_COLUMNS.contains(&pos);
            ArrowField::new(c.name, arrow_type(c.kind), nullable)
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn int_column<F: Fn(&TripRecord) -> Option<i64>>(records: &[TripRecord], f: F) -> ArrayRef {
    Arc::new(Int64Array::from(records.iter().map(f).collect::<Vec<_>>()))
}

fn float_column<F: Fn(&TripRecord) -> Option<f64>>(records: &[TripRecord], f: F) -> ArrayRef {
    Arc::new(Float64Array::from(records.iter().map(f).collect::<Vec<_>>()))
}

fn instant_column<F: Fn(&TripRecord) -> i64>(records: &[TripRecord], f: F) -> ArrayRef {
    Arc::new(
        TimestampMicrosecondArray::from(records.iter().map(f).collect::<Vec<_>>())
            .with_timezone("UTC"),
    )
}

pub fn trip_record_batch(records: &[TripRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        int_column(records, |r| r.vendor_id),
        instant_column(records, |r| r.pickup_datetime.timestamp_micros()),
        instant_column(records, |r| r.dropoff_datetime.timestamp_micros()),
        Arc::new(Int64Array::from(
            records.iter().map(|r| r.passenger_count).collect::<Vec<_>>(),
        )),
        float_column(records, |r| r.trip_distance),
        Arc::new(Int64Array::from(
            records.iter().map(|r| r.rate_code_id).collect::<Vec<_>>(),
        )),
        Arc::new(StringArray::from(
            records
                .iter()
                .map(|r| r.store_and_fwd_flag.as_deref())
                .collect::<Vec<_>>(),
        )),
        int_column(records, |r| r.pickup_location_id),
        int_column(records, |r| r.dropoff_location_id),
        int_column(records, |r| r.payment_type),
        float_column(records, |r| r.fare_amount),
        float_column(records, |r| r.extra),
        float_column(records, |r| r.mta_tax),
        float_column(records, |r| r.tip_amount),
        float_column(records, |r| r.tolls_amount),
        float_column(records, |r| r.improvement_surcharge),
        float_column(records, |r| r.total_amount),
    ];
    RecordBatch::try_new(trip_arrow_schema(), columns).context("building trip record batch")
}

fn write_parquet(path: &Path, batch: &RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Writes the cleaned artifact to `dest` through a temp file, so a failed
/// write leaves the previous artifact in place. Encoding runs on the blocking
/// pool.
pub async fn write_trip_artifact(dest: &Path, records: Vec<TripRecord>) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let temp = temp_path_for(dest);
    let target = temp.clone();
    let written = tokio::task::spawn_blocking(move || {
        let batch = trip_record_batch(&records)?;
        write_parquet(&target, &batch)
    })
    .await
    .context("parquet writer task failed")?;
    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(err);
    }
    promote(&temp, dest).await
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .with_context(|| format!("artifact has no column {name}"))
}

fn opt_i64(array: &ArrayRef, row: usize) -> Option<i64> {
    let values = array.as_primitive::<Int64Type>();
    (!values.is_null(row)).then(|| values.value(row))
}

fn opt_f64(array: &ArrayRef, row: usize) -> Option<f64> {
    let values = array.as_primitive::<Float64Type>();
    (!values.is_null(row)).then(|| values.value(row))
}

fn instant(array: &ArrayRef, row: usize) -> Result<DateTime<Utc>> {
    let micros = array.as_primitive::<TimestampMicrosecondType>().value(row);
    DateTime::from_timestamp_micros(micros).with_context(|| format!("timestamp {micros} out of range"))
}

/// Reads a cleaned artifact back into records.
pub fn read_trip_artifact(path: &Path) -> Result<Vec<TripRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("building parquet reader {}", path.display()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("decoding record batch {}", path.display()))?;
        let by_pos: Vec<&ArrayRef> = TRIP_COLUMNS
            .iter()
            .map(|c| column(&batch, c.name))
            .collect::<Result<_>>()?;
        let flags = by_pos[STORE_AND_FWD_FLAG].as_string::<i32>();
        for row in 0..batch.num_rows() {
            records.push(TripRecord {
                vendor_id: opt_i64(by_pos[VENDOR_ID], row),
                pickup_datetime: instant(by_pos[PICKUP], row)?,
                dropoff_datetime: instant(by_pos[DROPOFF], row)?,
                passenger_count: opt_i64(by_pos[PASSENGER_COUNT], row).unwrap_or(0),
                trip_distance: opt_f64(by_pos[TRIP_DISTANCE], row),
                rate_code_id: opt_i64(by_pos[RATE_CODE_ID], row).unwrap_or(0),
                store_and_fwd_flag: (!flags.is_null(row)).then(|| flags.value(row).to_string()),
                pickup_location_id: opt_i64(by_pos[PICKUP_LOCATION_ID], row),
                dropoff_location_id: opt_i64(by_pos[DROPOFF_LOCATION_ID], row),
                payment_type: opt_i64(by_pos[PAYMENT_TYPE], row),
                fare_amount: opt_f64(by_pos[FARE_AMOUNT], row),
                extra: opt_f64(by_pos[EXTRA], row),
                mta_tax: opt_f64(by_pos[MTA_TAX], row),
                tip_amount: opt_f64(by_pos[TIP_AMOUNT], row),
                tolls_amount: opt_f64(by_pos[TOLLS_AMOUNT], row),
                improvement_surcharge: opt_f64(by_pos[IMPROVEMENT_SURCHARGE], row),
                total_amount: opt_f64(by_pos[TOTAL_AMOUNT], row),
            });
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn source_columns() -> Vec<String> {
        [
            "VendorID",
            "tpep_pickup_datetime",
            "tpep_dropoff_datetime",
            "passenger_count",
            "trip_distance",
            "RatecodeID",
            "store_and_fwd_flag",
            "PULocationID",
            "DOLocationID",
            "payment_type",
            "fare_amount",
            "total_amount",
            "congestion_surcharge",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn row(pickup: StagingValue, passengers: StagingValue) -> Vec<StagingValue> {
        vec![
            StagingValue::Integer(2),
            pickup,
            StagingValue::Text("2024-01-01 00:20:00".into()),
            passengers,
            StagingValue::Float(3.2),
            StagingValue::Float(1.0),
            StagingValue::Text("N".into()),
            StagingValue::Integer(161),
            StagingValue::Integer(236),
            StagingValue::Integer(1),
            StagingValue::Float(17.7),
            StagingValue::Float(22.7),
            StagingValue::Float(2.5),
        ]
    }

    fn frame(rows: Vec<Vec<StagingValue>>) -> RawFrame {
        RawFrame {
            columns: source_columns(),
            rows,
        }
    }

    fn ts(text: &str) -> StagingValue {
        StagingValue::Text(text.to_string())
    }

    #[test]
    fn slot_constants_match_column_order() {
        for (pos, name) in [
            (VENDOR_ID, "vendor_id"),
            (PICKUP, "pickup_datetime"),
            (DROPOFF, "dropoff_datetime"),
            (PASSENGER_COUNT, "passenger_count"),
            (RATE_CODE_ID, "rate_code_id"),
            (STORE_AND_FWD_FLAG, "store_and_fwd_flag"),
            (PICKUP_LOCATION_ID, "pickup_location_id"),
            (DROPOFF_LOCATION_ID, "dropoff_location_id"),
            (PAYMENT_TYPE, "payment_type"),
            (TOTAL_AMOUNT, "total_amount"),
        ] {
            assert_eq!(TRIP_COLUMNS[pos].name, name);
        }
    }

    #[test]
    fn empty_staging_is_missing_input() {
        assert!(matches!(
            normalize(&frame(Vec::new())),
            Err(NormalizeError::EmptyInput)
        ));
    }

    #[test]
    fn renames_source_columns_and_drops_legacy_fields() {
        let out = normalize(&frame(vec![row(ts("2024-01-01 00:05:00"), StagingValue::Float(1.0))]))
            .expect("normalize");
        let record = &out.records[0];
        assert_eq!(record.vendor_id, Some(2));
        assert_eq!(record.rate_code_id, 1);
        assert_eq!(record.pickup_location_id, Some(161));
        assert_eq!(record.dropoff_location_id, Some(236));
        assert_eq!(record.total_amount, Some(22.7));
        assert_eq!(record.extra, None);
    }

    #[test]
    fn null_passenger_count_defaults_to_zero() {
        let out = normalize(&frame(vec![row(ts("2024-01-01 00:05:00"), StagingValue::Null)]))
            .expect("normalize");
        assert_eq!(out.records[0].passenger_count, 0);

        let nan = normalize(&frame(vec![row(ts("2024-01-01 00:05:00"), StagingValue::Float(f64::NAN))]))
            .expect("normalize");
        assert_eq!(nan.records[0].passenger_count, 0);
    }

    #[test]
    fn drops_unparseable_and_out_of_range_timestamps() {
        let out = normalize(&frame(vec![
            row(ts("not a time"), StagingValue::Float(1.0)),
            row(StagingValue::Null, StagingValue::Float(1.0)),
            row(ts("10000-01-01T00:00:00Z"), StagingValue::Float(1.0)),
            row(ts("0001-01-01 00:00:00"), StagingValue::Float(1.0)),
        ]))
        .expect("normalize");
        assert_eq!(out.stats.dropped_null_timestamp, 3);
        assert_eq!(out.records.len(), 1);
        assert_eq!(
            out.records[0].pickup_datetime,
            Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn null_rate_code_defaults_to_zero() {
        let mut cells = row(ts("2024-01-01 00:05:00"), StagingValue::Float(1.0));
        cells[RATE_CODE_ID] = StagingValue::Null;
        let out = normalize(&frame(vec![cells])).expect("normalize");
        assert_eq!(out.records[0].rate_code_id, 0);
        assert_eq!(out.records[0].passenger_count, 1);
    }

    #[test]
    fn dropoff_is_filtered_like_pickup() {
        let mut late = row(ts("2024-01-01 00:05:00"), StagingValue::Float(1.0));
        late[DROPOFF] = StagingValue::Timestamp(Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap());
        let mut garbage = row(ts("2024-01-01 00:06:00"), StagingValue::Float(1.0));
        garbage[DROPOFF] = ts("soon");
        let kept = row(ts("2024-01-01 00:07:00"), StagingValue::Float(1.0));

        let out = normalize(&frame(vec![late, garbage, kept])).expect("normalize");
        assert_eq!(out.stats.dropped_out_of_range, 1);
        assert_eq!(out.stats.dropped_null_timestamp, 1);
        assert_eq!(out.records.len(), 1);
        assert_eq!(
            out.records[0].pickup_datetime,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 0).unwrap()
        );
    }

    #[test]
    fn last_sub_microsecond_of_year_9999_is_kept() {
        let out = normalize(&frame(vec![row(
            ts("9999-12-31 23:59:59.9999995"),
            StagingValue::Float(1.0),
        )]))
        .expect("normalize");
        assert_eq!(out.stats.dropped_out_of_range, 0);
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].pickup_datetime.timestamp_subsec_micros(), 999_999);
    }

    #[test]
    fn native_year_ten_thousand_is_out_of_range() {
        let late = Utc.with_ymd_and_hms(10000, 1, 1, 0, 0, 0).unwrap();
        let out = normalize(&frame(vec![
            row(StagingValue::Timestamp(late), StagingValue::Float(1.0)),
            row(ts("2024-01-01 00:05:00"), StagingValue::Float(1.0)),
        ]))
        .expect("normalize");
        assert_eq!(out.stats.dropped_out_of_range, 1);
        assert_eq!(out.stats.output_rows, 1);
    }

    #[test]
    fn truncates_to_microseconds_before_dedup() {
        let out = normalize(&frame(vec![
            row(ts("2024-01-01 00:05:00.123456789"), StagingValue::Float(1.0)),
            row(ts("2024-01-01 00:05:00.123456001"), StagingValue::Float(1.0)),
        ]))
        .expect("normalize");
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.stats.duplicates_removed, 1);
        assert_eq!(out.records[0].pickup_datetime.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn identical_rows_collapse() {
        let duplicate = row(ts("2024-01-01 00:05:00"), StagingValue::Float(2.0));
        let out = normalize(&frame(vec![
            duplicate.clone(),
            row(ts("2024-01-01 00:06:00"), StagingValue::Float(2.0)),
            duplicate,
        ]))
        .expect("normalize");
        assert_eq!(out.stats.input_rows, 3);
        assert_eq!(out.stats.duplicates_removed, 1);
        assert_eq!(out.records.len(), 2);
    }

    #[test]
    fn non_integral_count_fails_the_frame() {
        let err = normalize(&frame(vec![row(ts("2024-01-01 00:05:00"), StagingValue::Float(1.5))]))
            .unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::Cast {
                row: 0,
                column: "passenger_count",
                ..
            }
        ));
    }

    #[test]
    fn missing_required_column_is_reported() {
        let input = RawFrame {
            columns: vec!["tpep_pickup_datetime".into(), "tpep_dropoff_datetime".into()],
            rows: vec![vec![ts("2024-01-01 00:05:00"), ts("2024-01-01 00:10:00")]],
        };
        assert!(matches!(
            normalize(&input),
            Err(NormalizeError::MissingColumn("passenger_count"))
        ));
    }

    #[test]
    fn two_names_for_one_column_are_ambiguous() {
        let mut columns = source_columns();
        columns[0] = "vendor_id".into();
        columns[1] = "pickup_datetime".into();
        columns[2] = "tpep_pickup_datetime".into();
        let input = RawFrame {
            columns,
            rows: vec![row(ts("2024-01-01 00:05:00"), StagingValue::Float(1.0))],
        };
        assert!(matches!(
            normalize(&input),
            Err(NormalizeError::AmbiguousColumn {
                canonical: "pickup_datetime",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn artifact_matches_warehouse_schema() {
        let dir = tempdir().expect("tempdir");
        let dest = dir.path().join("cleaned").join("yellow_taxi_trips_cleaned.parquet");
        let out = normalize(&frame(vec![row(ts("2024-01-01 00:05:00.5"), StagingValue::Null)]))
            .expect("normalize");

        write_trip_artifact(&dest, out.records.clone()).await.expect("write");
        let back = read_trip_artifact(&dest).expect("read");
        assert_eq!(back, out.records);

        let schema = trip_arrow_schema();
        assert_eq!(schema.fields().len(), 17);
        assert_eq!(schema.field(3).data_type(), &DataType::Int64);
        assert!(!schema.field(3).is_nullable());
        assert_eq!(
            schema.field(1).data_type(),
            &DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
        let leftovers: Vec<_> = std::fs::read_dir(dest.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
