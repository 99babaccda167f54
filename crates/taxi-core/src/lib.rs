//! Core domain model for the taxi trip pipeline: periods, the canonical trip
//! schema, staging cell values, and the per-run stage state machine.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "taxi-core";

/// Months between the wall-clock date and the period the publisher has data for.
pub const SOURCE_LAG_MONTHS: i32 = 2;

/// The (year, month) a pipeline run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunPeriod {
    pub year: i32,
    pub month: u32,
}

impl RunPeriod {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    /// Period for a given wall-clock date: the month `SOURCE_LAG_MONTHS` back,
    /// rolling into the previous year when needed.
    pub fn for_date(date: NaiveDate) -> Self {
        let absolute = date.year() * 12 + date.month0() as i32 - SOURCE_LAG_MONTHS;
        Self {
            year: absolute.div_euclid(12),
            month: absolute.rem_euclid(12) as u32 + 1,
        }
    }

    pub fn current() -> Self {
        Self::for_date(Utc::now().date_naive())
    }

    pub fn month_padded(&self) -> String {
        format!("{:02}", self.month)
    }

    /// Local file name for the period. Zero padding keeps lexical order chronological.
    pub fn file_name(&self, prefix: &str) -> String {
        format!("{prefix}_{:04}-{:02}.parquet", self.year, self.month)
    }

    /// Expands `{year}` and `{month}` (zero-padded) placeholders.
    pub fn render_template(&self, template: &str) -> String {
        template
            .replace("{year}", &format!("{:04}", self.year))
            .replace("{month}", &self.month_padded())
    }
}

impl fmt::Display for RunPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Integer,
    Float,
    Timestamp,
    Flag,
}

/// One column of the canonical trip schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Physical type in the staging table. Mirrors the source file, so the two
    /// nullable count columns stay floating point until normalization.
    pub staging_sql: &'static str,
}

const fn column(name: &'static str, kind: ColumnKind, staging_sql: &'static str) -> ColumnSpec {
    ColumnSpec {
        name,
        kind,
        staging_sql,
    }
}

pub const TRIP_COLUMNS: [ColumnSpec; 17] = [
    column("vendor_id", ColumnKind::Integer, "INTEGER"),
    column("pickup_datetime", ColumnKind::Timestamp, "TIMESTAMP"),
    column("dropoff_datetime", ColumnKind::Timestamp, "TIMESTAMP"),
    column("passenger_count", ColumnKind::Integer, "DOUBLE PRECISION"),
    column("trip_distance", ColumnKind::Float, "DOUBLE PRECISION"),
    column("rate_code_id", ColumnKind::Integer, "DOUBLE PRECISION"),
    column("store_and_fwd_flag", ColumnKind::Flag, "VARCHAR(1)"),
    column("pickup_location_id", ColumnKind::Integer, "INTEGER"),
    column("dropoff_location_id", ColumnKind::Integer, "INTEGER"),
    column("payment_type", ColumnKind::Integer, "INTEGER"),
    column("fare_amount", ColumnKind::Float, "DOUBLE PRECISION"),
    column("extra", ColumnKind::Float, "DOUBLE PRECISION"),
    column("mta_tax", ColumnKind::Float, "DOUBLE PRECISION"),
    column("tip_amount", ColumnKind::Float, "DOUBLE PRECISION"),
    column("tolls_amount", ColumnKind::Float, "DOUBLE PRECISION"),
    column("improvement_surcharge", ColumnKind::Float, "DOUBLE PRECISION"),
    column("total_amount", ColumnKind::Float, "DOUBLE PRECISION"),
];

pub const PICKUP_COLUMN: &str = "pickup_datetime";
pub const DROPOFF_COLUMN: &str = "dropoff_datetime";
pub const PICKUP_ZONE_COLUMN: &str = "pickup_location_id";
pub const DROPOFF_ZONE_COLUMN: &str = "dropoff_location_id";

/// Source fields that are no longer part of the trip schema.
pub const LEGACY_COLUMNS: [&str; 2] = ["congestion_surcharge", "airport_fee"];

/// Lower-cased source names that differ from the canonical name.
const SOURCE_ALIASES: [(&str, &str); 6] = [
    ("vendorid", "vendor_id"),
    ("tpep_pickup_datetime", "pickup_datetime"),
    ("tpep_dropoff_datetime", "dropoff_datetime"),
    ("ratecodeid", "rate_code_id"),
    ("pulocationid", "pickup_location_id"),
    ("dolocationid", "dropoff_location_id"),
];

/// Maps a source column name (any case) to its canonical name. Names without
/// an alias are returned lower-cased.
pub fn canonical_column_name(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    SOURCE_ALIASES
        .iter()
        .find(|(source, _)| *source == lower)
        .map(|(_, canonical)| (*canonical).to_string())
        .unwrap_or(lower)
}

pub fn is_legacy_column(canonical: &str) -> bool {
    LEGACY_COLUMNS.contains(&canonical)
}

/// Inclusive lower bound of the warehouse timestamp range.
pub fn warehouse_min_instant() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_micro_opt(0, 0, 0, 0))
        .expect("0001-01-01 is a valid date")
        .and_utc()
}

/// Exclusive upper bound of the warehouse timestamp range. Anything earlier
/// still falls in year 9999 after microsecond truncation.
pub fn warehouse_end_instant() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(10000, 1, 1)
        .and_then(|d| d.and_hms_micro_opt(0, 0, 0, 0))
        .expect("10000-01-01 is a valid date")
        .and_utc()
}

pub fn within_warehouse_range(instant: &DateTime<Utc>) -> bool {
    *instant >= warehouse_min_instant() && *instant < warehouse_end_instant()
}

/// Drops any precision finer than one microsecond.
pub fn truncate_to_micros(instant: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = instant.timestamp_subsec_nanos();
    instant.with_nanosecond(nanos - nanos % 1_000).unwrap_or(instant)
}

/// One untyped cell as read from the staging store or a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StagingValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CastError {
    #[error("non-integral value {0}")]
    NonIntegral(f64),
    #[error("value {0} is out of range")]
    OutOfRange(String),
    #[error("cannot read {found} as {expected}")]
    Mismatch {
        expected: &'static str,
        found: String,
    },
}

const TEXT_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

impl StagingValue {
    pub fn is_null(&self) -> bool {
        match self {
            StagingValue::Null => true,
            StagingValue::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    fn describe(&self) -> String {
        match self {
            StagingValue::Null => "null".to_string(),
            StagingValue::Integer(v) => format!("integer {v}"),
            StagingValue::Float(v) => format!("float {v}"),
            StagingValue::Text(v) => format!("text {v:?}"),
            StagingValue::Timestamp(v) => format!("timestamp {}", v.to_rfc3339()),
        }
    }

    /// Integer view. NaN counts as null; floats must be integral.
    pub fn to_integer(&self) -> Result<Option<i64>, CastError> {
        match self {
            StagingValue::Null => Ok(None),
            StagingValue::Integer(v) => Ok(Some(*v)),
            StagingValue::Float(f) if f.is_nan() => Ok(None),
            StagingValue::Float(f) => float_to_integer(*f).map(Some),
            StagingValue::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    return Ok(None);
                }
                if let Ok(v) = trimmed.parse::<i64>() {
                    return Ok(Some(v));
                }
                match trimmed.parse::<f64>() {
                    Ok(f) if f.is_nan() => Ok(None),
                    Ok(f) => float_to_integer(f).map(Some),
                    Err(_) => Err(CastError::Mismatch {
                        expected: "integer",
                        found: self.describe(),
                    }),
                }
            }
            StagingValue::Timestamp(_) => Err(CastError::Mismatch {
                expected: "integer",
                found: self.describe(),
            }),
        }
    }

    pub fn to_float(&self) -> Result<Option<f64>, CastError> {
        match self {
            StagingValue::Null => Ok(None),
            StagingValue::Integer(v) => Ok(Some(*v as f64)),
            StagingValue::Float(f) if f.is_nan() => Ok(None),
            StagingValue::Float(f) => Ok(Some(*f)),
            StagingValue::Text(s) if s.trim().is_empty() => Ok(None),
            StagingValue::Text(s) => match s.trim().parse::<f64>() {
                Ok(f) if f.is_nan() => Ok(None),
                Ok(f) => Ok(Some(f)),
                Err(_) => Err(CastError::Mismatch {
                    expected: "float",
                    found: self.describe(),
                }),
            },
            StagingValue::Timestamp(_) => Err(CastError::Mismatch {
                expected: "float",
                found: self.describe(),
            }),
        }
    }

    /// Single-character flag view; blank text is null.
    pub fn to_flag(&self) -> Result<Option<String>, CastError> {
        match self {
            StagingValue::Null => Ok(None),
            StagingValue::Float(f) if f.is_nan() => Ok(None),
            StagingValue::Text(s) => {
                let trimmed = s.trim();
                match trimmed.chars().count() {
                    0 => Ok(None),
                    1 => Ok(Some(trimmed.to_string())),
                    _ => Err(CastError::Mismatch {
                        expected: "single-character flag",
                        found: self.describe(),
                    }),
                }
            }
            _ => Err(CastError::Mismatch {
                expected: "single-character flag",
                found: self.describe(),
            }),
        }
    }

    /// UTC instant view. Unparseable input is `None`, never an error.
    pub fn to_instant(&self) -> Option<DateTime<Utc>> {
        match self {
            StagingValue::Timestamp(ts) => Some(*ts),
            StagingValue::Integer(nanos) => Some(DateTime::from_timestamp_nanos(*nanos)),
            StagingValue::Text(s) => parse_instant(s.trim()),
            StagingValue::Null | StagingValue::Float(_) => None,
        }
    }
}

fn float_to_integer(f: f64) -> Result<i64, CastError> {
    if !f.is_finite() || f < i64::MIN as f64 || f > i64::MAX as f64 {
        return Err(CastError::OutOfRange(f.to_string()));
    }
    if f.fract() != 0.0 {
        return Err(CastError::NonIntegral(f));
    }
    Ok(f as i64)
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    if text.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    TEXT_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Column-named rows read in bulk from staging or a source file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<StagingValue>>,
}

impl RawFrame {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<StagingValue>) -> anyhow::Result<()> {
        anyhow::ensure!(
            row.len() == self.columns.len(),
            "row has {} cells but frame has {} columns",
            row.len(),
            self.columns.len()
        );
        self.rows.push(row);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// True when the columns are exactly the canonical staging columns, in order.
    pub fn has_trip_columns(&self) -> bool {
        self.columns.len() == TRIP_COLUMNS.len()
            && self.columns.iter().zip(TRIP_COLUMNS.iter()).all(|(c, spec)| c == spec.name)
    }

    /// Re-shapes the frame onto the canonical staging columns, resolving
    /// source names through the alias table. Columns without a staging slot
    /// are discarded; canonical columns absent from the input become null.
    pub fn project_to_trip_columns(&self) -> RawFrame {
        let mut by_canonical: HashMap<String, usize> = HashMap::new();
        for (idx, name) in self.columns.iter().enumerate() {
            by_canonical.entry(canonical_column_name(name)).or_insert(idx);
        }
        let sources: Vec<Option<usize>> = TRIP_COLUMNS
            .iter()
            .map(|c| by_canonical.get(c.name).copied())
            .collect();

        RawFrame {
            columns: TRIP_COLUMNS.iter().map(|c| c.name.to_string()).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| {
                    sources
                        .iter()
                        .map(|src| match src {
                            Some(idx) => row[*idx].clone(),
                            None => StagingValue::Null,
                        })
                        .collect()
                })
                .collect(),
        }
    }
}

/// One cleaned trip, ready for the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripRecord {
    pub vendor_id: Option<i64>,
    pub pickup_datetime: DateTime<Utc>,
    pub dropoff_datetime: DateTime<Utc>,
    pub passenger_count: i64,
    pub trip_distance: Option<f64>,
    pub rate_code_id: i64,
    pub store_and_fwd_flag: Option<String>,
    pub pickup_location_id: Option<i64>,
    pub dropoff_location_id: Option<i64>,
    pub payment_type: Option<i64>,
    pub fare_amount: Option<f64>,
    pub extra: Option<f64>,
    pub mta_tax: Option<f64>,
    pub tip_amount: Option<f64>,
    pub tolls_amount: Option<f64>,
    pub improvement_surcharge: Option<f64>,
    pub total_amount: Option<f64>,
}

/// Hashable identity of a record across every field. Floats compare by
/// value with `-0.0 == 0.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TripFingerprint {
    integers: [Option<i64>; 6],
    instants: [(i64, u32); 2],
    floats: [Option<u64>; 8],
    flag: Option<String>,
}

fn float_key(value: Option<f64>) -> Option<u64> {
    value.map(|f| {
        if f == 0.0 {
            0.0f64.to_bits()
        } else if f.is_nan() {
            f64::NAN.to_bits()
        } else {
            f.to_bits()
        }
    })
}

fn instant_key(instant: &DateTime<Utc>) -> (i64, u32) {
    (instant.timestamp(), instant.timestamp_subsec_nanos())
}

impl TripRecord {
    pub fn fingerprint(&self) -> TripFingerprint {
        TripFingerprint {
            integers: [
                self.vendor_id,
                Some(self.passenger_count),
                Some(self.rate_code_id),
                self.pickup_location_id,
                self.dropoff_location_id,
                self.payment_type,
            ],
            instants: [
                instant_key(&self.pickup_datetime),
                instant_key(&self.dropoff_datetime),
            ],
            floats: [
                float_key(self.trip_distance),
                float_key(self.fare_amount),
                float_key(self.extra),
                float_key(self.mta_tax),
                float_key(self.tip_amount),
                float_key(self.tolls_amount),
                float_key(self.improvement_surcharge),
                float_key(self.total_amount),
            ],
            flag: self.store_and_fwd_flag.clone(),
        }
    }
}

/// How a stage's output relates to the output of earlier runs.
///
/// Staging, the cleaned artifact and the published object are latest-only:
/// each run replaces them wholesale. The warehouse table is append-only and
/// accumulates one full snapshot per successful run. Retries depend on the
/// replace side being idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Replace,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Fetch,
    StageLoad,
    Normalize,
    Publish,
    WarehouseLoad,
}

impl StageKind {
    pub const PIPELINE_ORDER: [StageKind; 5] = [
        StageKind::Fetch,
        StageKind::StageLoad,
        StageKind::Normalize,
        StageKind::Publish,
        StageKind::WarehouseLoad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Fetch => "fetch",
            StageKind::StageLoad => "stage-load",
            StageKind::Normalize => "normalize",
            StageKind::Publish => "publish",
            StageKind::WarehouseLoad => "warehouse-load",
        }
    }

    /// Run state while this stage is executing.
    pub fn running_state(&self) -> RunState {
        match self {
            StageKind::Fetch => RunState::Fetching,
            StageKind::StageLoad => RunState::Staging,
            StageKind::Normalize => RunState::Cleaning,
            StageKind::Publish => RunState::Publishing,
            StageKind::WarehouseLoad => RunState::Loading,
        }
    }

    pub fn write_mode(&self) -> WriteMode {
        match self {
            StageKind::WarehouseLoad => WriteMode::Append,
            _ => WriteMode::Replace,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Fetching,
    Staging,
    Cleaning,
    Publishing,
    Loading,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }

    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal() && *self != RunState::Pending
    }

    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (*self, next) {
            (Pending, Fetching)
            | (Fetching, Staging)
            | (Staging, Cleaning)
            | (Cleaning, Publishing)
            | (Publishing, Loading)
            | (Loading, Succeeded) => true,
            (current, Failed) => current.is_in_progress(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid run transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Observable side effects of a successful stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub summary: String,
    pub rows: Option<u64>,
    pub location: Option<String>,
    pub content_hash: Option<String>,
}

impl StageReport {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub status: StageStatus,
    pub attempts: u32,
    pub report: Option<StageReport>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageOutcome {
    pub fn succeeded(stage: StageKind, attempts: u32, report: StageReport) -> Self {
        Self {
            stage,
            status: StageStatus::Succeeded,
            attempts,
            report: Some(report),
            error: None,
            finished_at: Some(Utc::now()),
        }
    }

    pub fn failed(stage: StageKind, attempts: u32, error: &StageError) -> Self {
        Self {
            stage,
            status: StageStatus::Failed,
            attempts,
            report: None,
            error: Some(error.to_string()),
            finished_at: Some(Utc::now()),
        }
    }

    pub fn skipped(stage: StageKind) -> Self {
        Self {
            stage,
            status: StageStatus::Skipped,
            attempts: 0,
            report: None,
            error: None,
            finished_at: None,
        }
    }
}

/// One scheduled invocation of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub period: RunPeriod,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcomes: Vec<StageOutcome>,
}

impl PipelineRun {
    pub fn new(period: RunPeriod) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            period,
            state: RunState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            outcomes: Vec::with_capacity(StageKind::PIPELINE_ORDER.len()),
        }
    }

    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn record(&mut self, outcome: StageOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn failed_stage(&self) -> Option<StageKind> {
        self.outcomes
            .iter()
            .find(|o| o.status == StageStatus::Failed)
            .map(|o| o.stage)
    }

    pub fn outcome(&self, stage: StageKind) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage == stage)
    }
}

/// Failure reported across a stage boundary. Only `Transient` is retried.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
    #[error("input missing: {0}")]
    InputMissing(String),
    #[error("schema violation: {0}")]
    Schema(String),
    #[error("rejected: {0:#}")]
    Rejected(anyhow::Error),
}

impl StageError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        StageError::Transient(err.into())
    }

    pub fn rejected(err: impl Into<anyhow::Error>) -> Self {
        StageError::Rejected(err.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            StageError::Transient(_) => "transient",
            StageError::InputMissing(_) => "input_missing",
            StageError::Schema(_) => "schema",
            StageError::Rejected(_) => "rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("date")
    }

    #[test]
    fn period_rolls_back_across_year_boundary() {
        assert_eq!(RunPeriod::for_date(date(2025, 1, 15)), RunPeriod { year: 2024, month: 11 });
        assert_eq!(RunPeriod::for_date(date(2025, 2, 1)), RunPeriod { year: 2024, month: 12 });
        assert_eq!(RunPeriod::for_date(date(2025, 5, 31)), RunPeriod { year: 2025, month: 3 });
        assert_eq!(RunPeriod::for_date(date(2025, 3, 1)), RunPeriod { year: 2025, month: 1 });
    }

    #[test]
    fn period_month_always_in_range_and_stable() {
        for year in [1999, 2024, 2025] {
            for month in 1..=12 {
                let d = date(year, month, 10);
                let first = RunPeriod::for_date(d);
                let again = RunPeriod::for_date(d);
                assert_eq!(first, again);
                assert!((1..=12).contains(&first.month));
                let expected_year = if month <= 2 { year - 1 } else { year };
                assert_eq!(first.year, expected_year);
            }
        }
    }

    #[test]
    fn period_names_sort_chronologically() {
        let mut names = vec![
            RunPeriod::new(2024, 11).unwrap().file_name("yellow_tripdata"),
            RunPeriod::new(2025, 2).unwrap().file_name("yellow_tripdata"),
            RunPeriod::new(2024, 9).unwrap().file_name("yellow_tripdata"),
        ];
        names.sort();
        assert_eq!(
            names,
            vec![
                "yellow_tripdata_2024-09.parquet",
                "yellow_tripdata_2024-11.parquet",
                "yellow_tripdata_2025-02.parquet",
            ]
        );
    }

    #[test]
    fn template_renders_zero_padded_month() {
        let period = RunPeriod::new(2024, 3).unwrap();
        assert_eq!(
            period.render_template("https://host/trip-data/yellow_tripdata_{year}-{month}.parquet"),
            "https://host/trip-data/yellow_tripdata_2024-03.parquet"
        );
        assert!(RunPeriod::new(2024, 13).is_none());
        assert!(RunPeriod::new(2024, 0).is_none());
    }

    #[test]
    fn source_names_resolve_to_canonical() {
        assert_eq!(canonical_column_name("VendorID"), "vendor_id");
        assert_eq!(canonical_column_name("tpep_pickup_datetime"), "pickup_datetime");
        assert_eq!(canonical_column_name("RatecodeID"), "rate_code_id");
        assert_eq!(canonical_column_name("PULocationID"), "pickup_location_id");
        assert_eq!(canonical_column_name("DOLocationID"), "dropoff_location_id");
        assert_eq!(canonical_column_name("Airport_fee"), "airport_fee");
        assert!(is_legacy_column(&canonical_column_name("Airport_fee")));
        assert_eq!(canonical_column_name("fare_amount"), "fare_amount");
    }

    #[test]
    fn integer_cast_rules() {
        assert_eq!(StagingValue::Null.to_integer(), Ok(None));
        assert_eq!(StagingValue::Float(f64::NAN).to_integer(), Ok(None));
        assert_eq!(StagingValue::Float(2.0).to_integer(), Ok(Some(2)));
        assert_eq!(StagingValue::Text(" 3 ".into()).to_integer(), Ok(Some(3)));
        assert_eq!(
            StagingValue::Float(1.5).to_integer(),
            Err(CastError::NonIntegral(1.5))
        );
        assert!(StagingValue::Text("abc".into()).to_integer().is_err());
    }

    #[test]
    fn flag_cast_rules() {
        assert_eq!(StagingValue::Text("Y".into()).to_flag(), Ok(Some("Y".into())));
        assert_eq!(StagingValue::Text(" ".into()).to_flag(), Ok(None));
        assert!(StagingValue::Text("YES".into()).to_flag().is_err());
        assert!(StagingValue::Integer(1).to_flag().is_err());
    }

    #[test]
    fn instant_parsing_is_fail_open() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        assert_eq!(
            StagingValue::Text("2024-03-01 08:30:00".into()).to_instant(),
            Some(expected)
        );
        assert_eq!(
            StagingValue::Text("2024-03-01T08:30:00Z".into()).to_instant(),
            Some(expected)
        );
        assert_eq!(StagingValue::Text("not a date".into()).to_instant(), None);
        assert_eq!(StagingValue::Float(1.0).to_instant(), None);
        assert_eq!(StagingValue::Null.to_instant(), None);
    }

    #[test]
    fn range_covers_years_one_through_9999() {
        assert!(within_warehouse_range(&warehouse_min_instant()));
        assert!(!within_warehouse_range(&warehouse_end_instant()));
        let last_nanosecond = warehouse_end_instant() - chrono::Duration::nanoseconds(1);
        assert!(within_warehouse_range(&last_nanosecond));
        assert_eq!(truncate_to_micros(last_nanosecond).year(), 9999);
        let before_year_one = warehouse_min_instant() - chrono::Duration::microseconds(1);
        assert!(!within_warehouse_range(&before_year_one));
    }

    #[test]
    fn truncation_keeps_microseconds_only() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let truncated = truncate_to_micros(ts);
        assert_eq!(truncated.nanosecond(), 123_456_000);
    }

    #[test]
    fn projection_lands_source_columns_in_canonical_slots() {
        let mut frame = RawFrame::new(vec![
            "VendorID".into(),
            "congestion_surcharge".into(),
            "fare_amount".into(),
        ]);
        frame
            .push_row(vec![
                StagingValue::Integer(2),
                StagingValue::Float(2.5),
                StagingValue::Float(10.0),
            ])
            .unwrap();
        let projected = frame.project_to_trip_columns();
        assert_eq!(projected.columns.len(), TRIP_COLUMNS.len());
        assert_eq!(projected.rows[0][0], StagingValue::Integer(2));
        let fare = projected.column_index("fare_amount").unwrap();
        assert_eq!(projected.rows[0][fare], StagingValue::Float(10.0));
        let pickup = projected.column_index("pickup_datetime").unwrap();
        assert_eq!(projected.rows[0][pickup], StagingValue::Null);
        assert!(projected.has_trip_columns());
        assert!(!frame.has_trip_columns());
        assert!(frame.push_row(vec![StagingValue::Null]).is_err());
    }

    #[test]
    fn run_state_machine_is_strictly_linear() {
        let mut run = PipelineRun::new(RunPeriod::new(2024, 1).unwrap());
        assert!(run.transition(RunState::Staging).is_err());
        for stage in StageKind::PIPELINE_ORDER {
            run.transition(stage.running_state()).expect("forward transition");
        }
        run.transition(RunState::Succeeded).expect("finish");
        assert!(run.finished_at.is_some());
        assert!(run.transition(RunState::Failed).is_err());
    }

    #[test]
    fn failure_allowed_only_from_in_progress_states() {
        assert!(!RunState::Pending.can_transition_to(RunState::Failed));
        assert!(RunState::Cleaning.can_transition_to(RunState::Failed));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Failed));
    }

    #[test]
    fn only_warehouse_load_appends() {
        for stage in StageKind::PIPELINE_ORDER {
            let expected = if stage == StageKind::WarehouseLoad {
                WriteMode::Append
            } else {
                WriteMode::Replace
            };
            assert_eq!(stage.write_mode(), expected);
        }
    }

    #[test]
    fn only_transient_errors_retry() {
        assert!(StageError::transient(anyhow::anyhow!("timeout")).is_retryable());
        assert!(!StageError::InputMissing("no file".into()).is_retryable());
        assert!(!StageError::Schema("bad cast".into()).is_retryable());
        assert!(!StageError::rejected(anyhow::anyhow!("403")).is_retryable());
    }

    #[test]
    fn pipeline_run_serializes_with_snake_case_states() {
        let run = PipelineRun::new(RunPeriod::new(2024, 6).unwrap());
        let json = serde_json::to_value(&run).expect("serialize");
        assert_eq!(json["state"], "pending");
        assert_eq!(json["period"]["month"], 6);
    }
}
