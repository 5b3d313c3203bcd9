//! Run results: report type, run directories and output files

use super::{RunEvent, RunState};
use crate::data::Bar;
use crate::error::{EngineError, Result};
use crate::execution::{Fill, Order};
use crate::ledger::LedgerSnapshot;
use arrow::array::{ArrayRef, Int64Array, StringArray, TimestampMicrosecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{Local, NaiveDateTime};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind as IoErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything a finished (or aborted) run hands to report generators
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub state: RunState,
    pub run_dir: Option<PathBuf>,
    pub orders: Vec<Order>,
    pub fills: Vec<Fill>,
    /// One ledger snapshot per completed period
    pub snapshots: Vec<LedgerSnapshot>,
    pub benchmark: Vec<Bar>,
    pub events: Vec<RunEvent>,
    /// Why the run aborted
    pub fault: Option<String>,
}

impl RunReport {
    pub fn final_snapshot(&self) -> Option<&LedgerSnapshot> {
        self.snapshots.last()
    }

    pub fn is_finished(&self) -> bool {
        self.state == RunState::Finished
    }
}

const MAX_DIR_ATTEMPTS: usize = 16;

/// `<YYYYmmdd_HHMMSS>_<8 hex>` from the wall clock and a random suffix
pub fn new_run_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), &suffix[..8])
}

/// Create a fresh `<base>/<run id>` directory.
///
/// Uses `create_dir`, which fails on an existing path, so a prior run's
/// output is never reused; a collision draws a new suffix.
pub fn create_run_dir(base: &Path) -> Result<PathBuf> {
    fs::create_dir_all(base)?;

    for _ in 0..MAX_DIR_ATTEMPTS {
        let dir = base.join(new_run_id());
        match fs::create_dir(&dir) {
            Ok(()) => {
                tracing::debug!(path = ?dir, "Run directory created");
                return Ok(dir);
            }
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(EngineError::Results(format!(
        "could not create a unique run directory under {}",
        base.display()
    )))
}

fn micros(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_micros()
}

fn timestamp_field(name: &str) -> Field {
    Field::new(name, DataType::Timestamp(TimeUnit::Microsecond, None), false)
}

/// Fill table schema. Decimals are stored as strings to keep precision.
pub fn fills_schema() -> Schema {
    Schema::new(vec![
        timestamp_field("timestamp"),
        Field::new("order_id", DataType::UInt64, false),
        Field::new("symbol", DataType::Utf8, false),
        Field::new("quantity", DataType::Int64, false),
        Field::new("price", DataType::Utf8, false),
        Field::new("commission", DataType::Utf8, false),
    ])
}

/// Per-period equity schema
pub fn equity_schema() -> Schema {
    Schema::new(vec![
        timestamp_field("timestamp"),
        Field::new("cash", DataType::Utf8, false),
        Field::new("positions_value", DataType::Utf8, false),
        Field::new("total_value", DataType::Utf8, false),
        Field::new("realized_pnl", DataType::Utf8, false),
        Field::new("unrealized_pnl", DataType::Utf8, false),
        Field::new("total_commission", DataType::Utf8, false),
    ])
}

fn strings<T>(rows: &[T], f: impl Fn(&T) -> String) -> ArrayRef {
    Arc::new(StringArray::from(rows.iter().map(f).collect::<Vec<_>>()))
}

fn write_parquet(path: &Path, schema: Schema, columns: Vec<ArrayRef>) -> Result<()> {
    let schema = Arc::new(schema);
    let file = File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();

    let mut writer = ArrowWriter::try_new(file, schema.clone(), Some(props))?;
    let batch = RecordBatch::try_new(schema, columns)?;
    if batch.num_rows() > 0 {
        writer.write(&batch)?;
    }
    writer.close()?;
    Ok(())
}

/// Write `fills.parquet`
pub fn write_fills(path: &Path, fills: &[Fill]) -> Result<()> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMicrosecondArray::from(
            fills.iter().map(|f| micros(f.timestamp)).collect::<Vec<_>>(),
        )),
        Arc::new(UInt64Array::from(
            fills.iter().map(|f| f.order_id.0).collect::<Vec<_>>(),
        )),
        strings(fills, |f| f.symbol.clone()),
        Arc::new(Int64Array::from(
            fills.iter().map(|f| f.quantity).collect::<Vec<_>>(),
        )),
        strings(fills, |f| f.price.to_string()),
        strings(fills, |f| f.commission.to_string()),
    ];
    write_parquet(path, fills_schema(), columns)?;
    tracing::debug!(path = ?path, count = fills.len(), "Wrote fills to Parquet");
    Ok(())
}

/// Write `equity.parquet`
pub fn write_equity(path: &Path, snapshots: &[LedgerSnapshot]) -> Result<()> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampMicrosecondArray::from(
            snapshots
                .iter()
                .map(|s| s.as_of.map_or(0, micros))
                .collect::<Vec<_>>(),
        )),
        strings(snapshots, |s| s.cash.to_string()),
        strings(snapshots, |s| s.positions_value.to_string()),
        strings(snapshots, |s| s.total_value.to_string()),
        strings(snapshots, |s| s.realized_pnl.to_string()),
        strings(snapshots, |s| s.unrealized_pnl.to_string()),
        strings(snapshots, |s| s.total_commission.to_string()),
    ];
    write_parquet(path, equity_schema(), columns)?;
    tracing::debug!(path = ?path, count = snapshots.len(), "Wrote equity curve to Parquet");
    Ok(())
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    Ok(())
}

/// Write every output file for a report into `dir`
pub fn write_report(dir: &Path, report: &RunReport) -> Result<()> {
    write_json(&dir.join("orders.json"), &report.orders)?;
    write_json(&dir.join("events.json"), &report.events)?;
    write_fills(&dir.join("fills.parquet"), &report.fills)?;
    write_equity(&dir.join("equity.parquet"), &report.snapshots)?;
    tracing::info!(path = ?dir, run_id = %report.run_id, "Run results written");
    Ok(())
}
