//! Session-scoped telemetry file.
//!
//! One snappy-compressed Parquet file per logging session, fixed 16-column
//! schema (int64 raw columns, nullable float64 derived columns). Rows are
//! buffered and written as one row group per `flush_threshold` rows.

use crate::domain::error::{BridgeError, BridgeResult};
use crate::domain::models::TelemetryRow;
use arrow_array::{Array, ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use chrono::{DateTime, Local};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const COLUMNS: [&str; 16] = [
    "sample",
    "acc_x",
    "acc_y",
    "acc_z",
    "gyro_x",
    "gyro_y",
    "gyro_z",
    "mag_x",
    "mag_y",
    "mag_z",
    "sync",
    "roll",
    "pitch",
    "yaw",
    "uncertainty",
    "bat_v",
];

/// `sample`, the nine raw axes and `sync` are int64; the rest float64.
const INT_COLUMNS: usize = 11;

pub const NO_SUBJECT_ID: &str = "NoSubjID";
pub const NO_DEVICE_ID: &str = "NoDeviceID";
pub const SESSION_FILE_SUFFIX: &str = ".parquet";

/// What a finished session wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub rows: usize,
    /// Size of every batch written, in order
    pub flushes: Vec<usize>,
}

fn storage_error(path: &Path, e: impl std::fmt::Display) -> BridgeError {
    BridgeError::Io(format!("{}: {}", path.display(), e))
}

pub fn session_schema() -> SchemaRef {
    let fields: Vec<Field> = COLUMNS
        .iter()
        .enumerate()
        .map(|(i, name)| {
            if i < INT_COLUMNS {
                Field::new(*name, DataType::Int64, false)
            } else {
                Field::new(*name, DataType::Float64, true)
            }
        })
        .collect();
    Arc::new(Schema::new(fields))
}

fn record_batch(
    schema: &SchemaRef,
    rows: &[TelemetryRow],
) -> Result<RecordBatch, arrow_schema::ArrowError> {
    let ints = |f: &dyn Fn(&TelemetryRow) -> i64| -> ArrayRef {
        Arc::new(Int64Array::from_iter_values(rows.iter().map(f)))
    };
    let floats = |f: &dyn Fn(&TelemetryRow) -> Option<f64>| -> ArrayRef {
        Arc::new(rows.iter().map(f).collect::<Float64Array>())
    };

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(COLUMNS.len());
    columns.push(ints(&|r| i64::from(r.sample)));
    for axis in 0..9 {
        columns.push(ints(&|r| i64::from(r.raw[axis])));
    }
    columns.push(ints(&|r| r.sync));
    columns.push(floats(&|r| Some(r.roll)));
    columns.push(floats(&|r| Some(r.pitch)));
    columns.push(floats(&|r| Some(r.yaw)));
    columns.push(floats(&|r| r.uncertainty));
    columns.push(floats(&|r| r.battery_mv.map(|mv| f64::from(mv) / 1000.0)));
    RecordBatch::try_new(Arc::clone(schema), columns)
}

type SessionSink = Box<dyn Write + Send>;

struct Session {
    path: PathBuf,
    created_at: DateTime<Local>,
    schema: SchemaRef,
    writer: ArrowWriter<SessionSink>,
    buffer: Vec<TelemetryRow>,
    rows: usize,
    flushes: Vec<usize>,
}

impl Session {
    fn open(
        path: PathBuf,
        created_at: DateTime<Local>,
        sink: SessionSink,
        capacity: usize,
    ) -> BridgeResult<Self> {
        let schema = session_schema();
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let writer = ArrowWriter::try_new(sink, Arc::clone(&schema), Some(props))
            .map_err(|e| storage_error(&path, e))?;
        Ok(Self {
            path,
            created_at,
            schema,
            writer,
            buffer: Vec::with_capacity(capacity),
            rows: 0,
            flushes: Vec::new(),
        })
    }

    /// Write the buffer as one row group. The buffer is kept if the write fails.
    fn flush(&mut self) -> BridgeResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = record_batch(&self.schema, &self.buffer)
            .map_err(|e| storage_error(&self.path, e))?;
        self.writer
            .write(&batch)
            .and_then(|_| self.writer.flush())
            .map_err(|e| storage_error(&self.path, e))?;

        let written = self.buffer.len();
        self.buffer.clear();
        self.rows += written;
        self.flushes.push(written);
        debug!("Flushed {} rows to {}", written, self.path.display());
        Ok(())
    }
}

pub struct SessionLogger {
    session_dir: PathBuf,
    flush_threshold: usize,
    session: Option<Session>,
}

impl SessionLogger {
    pub fn new(session_dir: impl Into<PathBuf>, flush_threshold: usize) -> Self {
        Self {
            session_dir: session_dir.into(),
            flush_threshold: flush_threshold.max(1),
            session: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.path.as_path())
    }

    pub fn buffered(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.buffer.len())
    }

    /// Open a new session file.
    ///
    /// Starting while a session is active keeps the current one.
    pub fn start(
        &mut self,
        subject_id: Option<&str>,
        session_id: Option<&str>,
        device_id: Option<&str>,
    ) -> BridgeResult<PathBuf> {
        if let Some(session) = &self.session {
            warn!("IMU logging already active: {}", session.path.display());
            return Ok(session.path.clone());
        }

        fs::create_dir_all(&self.session_dir)?;

        let created_at = Local::now();
        let path = self
            .session_dir
            .join(session_file_name(subject_id, session_id, device_id, &created_at));

        let file = File::create(&path)
            .map_err(|e| BridgeError::Io(format!("Cannot create {}: {}", path.display(), e)))?;
        let session = Session::open(
            path.clone(),
            created_at,
            Box::new(file),
            self.flush_threshold,
        )?;

        info!("IMU logging started: {}", path.display());
        self.session = Some(session);
        Ok(path)
    }

    /// Buffer one row, flushing once the buffer reaches the threshold.
    ///
    /// Rows arriving without an active session are dropped.
    pub fn append(&mut self, row: TelemetryRow) -> BridgeResult<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.buffer.push(row);
        if session.buffer.len() >= self.flush_threshold {
            session.flush()?;
        }
        Ok(())
    }

    /// Overwrite the sync column of the most recently buffered row.
    pub fn mark_sync(&mut self, value: i64) -> BridgeResult<()> {
        let row = self
            .session
            .as_mut()
            .and_then(|s| s.buffer.last_mut())
            .ok_or_else(|| BridgeError::state("No IMU data buffer available"))?;
        row.sync = value;
        info!("Sync value {} written to sample {}", value, row.sample);
        Ok(())
    }

    /// Flush and close the session. Safe to call when nothing is active.
    pub fn stop(&mut self) -> BridgeResult<Option<SessionSummary>> {
        let Some(session) = self.session.as_mut() else {
            warn!("IMU logging not active, nothing to stop");
            return Ok(None);
        };
        session.flush()?;

        let Some(session) = self.session.take() else {
            return Ok(None);
        };
        session
            .writer
            .close()
            .map_err(|e| storage_error(&session.path, e))?;

        let elapsed = Local::now() - session.created_at;
        info!(
            "IMU logging stopped: {} ({} rows, {} s)",
            session.path.display(),
            session.rows,
            elapsed.num_seconds()
        );
        Ok(Some(SessionSummary {
            path: session.path,
            rows: session.rows,
            flushes: session.flushes,
        }))
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.stop() {
                warn!("Failed to close IMU session on shutdown: {}", e);
            }
        }
    }
}

/// `<subject>_<session>_<device>_<YYYY_MM_DD_HH_MM_SS>.parquet`
pub fn session_file_name(
    subject_id: Option<&str>,
    session_id: Option<&str>,
    device_id: Option<&str>,
    created_at: &DateTime<Local>,
) -> String {
    format!(
        "{}_{}_{}_{}{}",
        sanitize_id(subject_id, NO_SUBJECT_ID),
        session_number(session_id),
        sanitize_id(device_id, NO_DEVICE_ID),
        created_at.format("%Y_%m_%d_%H_%M_%S"),
        SESSION_FILE_SUFFIX
    )
}

fn sanitize_id(id: Option<&str>, fallback: &str) -> String {
    let id = id.map(str::trim).unwrap_or_default();
    if id.is_empty() {
        return fallback.to_string();
    }
    id.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Session ids are written as integers; anything unparsable becomes 0.
fn session_number(session_id: Option<&str>) -> i64 {
    let Some(raw) = session_id.map(str::trim).filter(|s| !s.is_empty()) else {
        return 0;
    };
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => v.trunc() as i64,
        _ => {
            warn!("Invalid session id '{}', using 0", raw);
            0
        }
    }
}

/// Read a session file back into rows.
pub fn read_session_file(path: &Path) -> BridgeResult<Vec<TelemetryRow>> {
    let file = File::open(path).map_err(|e| storage_error(path, e))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .and_then(|b| b.build())
        .map_err(|e| storage_error(path, e))?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| storage_error(path, e))?;
        let int = |i: usize| batch.column(i).as_any().downcast_ref::<Int64Array>();
        let float = |i: usize| batch.column(i).as_any().downcast_ref::<Float64Array>();
        let (Some(ints), Some(floats)) = (
            (0..INT_COLUMNS).map(int).collect::<Option<Vec<_>>>(),
            (INT_COLUMNS..COLUMNS.len()).map(float).collect::<Option<Vec<_>>>(),
        ) else {
            return Err(storage_error(path, "unexpected column types"));
        };
        let value = |a: &Float64Array, row: usize| (!a.is_null(row)).then(|| a.value(row));

        for r in 0..batch.num_rows() {
            let mut raw = [0i16; 9];
            for (axis, slot) in raw.iter_mut().enumerate() {
                *slot = ints[axis + 1].value(r) as i16;
            }
            rows.push(TelemetryRow {
                sample: ints[0].value(r) as u32,
                raw,
                sync: ints[10].value(r),
                roll: floats[0].value(r),
                pitch: floats[1].value(r),
                yaw: floats[2].value(r),
                uncertainty: value(floats[3], r),
                battery_mv: value(floats[4], r).map(|v| (v * 1000.0).round() as u16),
            });
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "optogrid_session_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn row(sample: u32) -> TelemetryRow {
        TelemetryRow {
            sample,
            raw: [1, -2, 3, 4, -5, 6, 7, 8, -9],
            sync: 0,
            roll: 1.5,
            pitch: -0.25,
            yaw: 359.0,
            uncertainty: Some(0.5),
            battery_mv: None,
        }
    }

    #[test]
    fn test_flush_batches() {
        let dir = temp_dir("flush");
        let mut logger = SessionLogger::new(&dir, 100);
        logger.start(Some("M1"), Some("2"), Some("OptoGrid-1")).unwrap();

        for i in 0..250 {
            logger.append(row(i)).unwrap();
        }
        assert_eq!(logger.buffered(), 50);

        let summary = logger.stop().unwrap().unwrap();
        assert_eq!(summary.flushes, vec![100, 100, 50]);
        assert_eq!(summary.rows, 250);

        let file = File::open(&summary.path).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        let schema = builder.schema().clone();
        assert_eq!(schema.fields().len(), 16);
        assert_eq!(schema.field(0).data_type(), &DataType::Int64);
        assert_eq!(schema.field(10).data_type(), &DataType::Int64);
        assert_eq!(schema.field(15).data_type(), &DataType::Float64);
        let groups: Vec<i64> = builder
            .metadata()
            .row_groups()
            .iter()
            .map(|g| g.num_rows())
            .collect();
        assert_eq!(groups, vec![100, 100, 50]);

        let rows = read_session_file(&summary.path).unwrap();
        assert_eq!(rows.len(), 250);
        assert_eq!(rows[0], row(0));
        assert_eq!(rows[249].sample, 249);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let dir = temp_dir("idempotent");
        let mut logger = SessionLogger::new(&dir, 100);
        assert!(logger.stop().unwrap().is_none());

        logger.start(None, None, None).unwrap();
        let summary = logger.stop().unwrap().unwrap();
        assert!(logger.stop().unwrap().is_none());
        assert!(!logger.is_active());
        assert!(read_session_file(&summary.path).unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_mark_sync_targets_newest_row() {
        let dir = temp_dir("sync");
        let mut logger = SessionLogger::new(&dir, 100);
        assert!(matches!(logger.mark_sync(1), Err(BridgeError::State(_))));

        logger.start(Some("S"), Some("1"), Some("D")).unwrap();
        assert!(logger.mark_sync(1).is_err());

        logger.append(row(1)).unwrap();
        logger.append(row(2)).unwrap();
        logger.mark_sync(65536).unwrap();

        let summary = logger.stop().unwrap().unwrap();
        let rows = read_session_file(&summary.path).unwrap();
        assert_eq!(rows[0].sync, 0);
        assert_eq!(rows[1].sync, 65536);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_nullable_columns() {
        let dir = temp_dir("nullable");
        let mut logger = SessionLogger::new(&dir, 100);
        logger.start(None, None, None).unwrap();

        let mut first = row(1);
        first.battery_mv = Some(3712);
        first.uncertainty = None;
        logger.append(first).unwrap();
        logger.append(row(2)).unwrap();

        let summary = logger.stop().unwrap().unwrap();
        let file = File::open(&summary.path).unwrap();
        let batch = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let bat_v = batch.column(15).as_any().downcast_ref::<Float64Array>().unwrap();
        assert_eq!(bat_v.value(0), 3.712);
        assert!(bat_v.is_null(1));
        assert!(batch.column(14).is_null(0));

        let rows = read_session_file(&summary.path).unwrap();
        assert_eq!(rows[0].battery_mv, Some(3712));
        assert_eq!(rows[0].uncertainty, None);
        assert_eq!(rows[1].battery_mv, None);
        let _ = fs::remove_dir_all(&dir);
    }

    struct FlakySink {
        fail: Arc<AtomicBool>,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            } else {
                Ok(buf.len())
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_failed_flush_keeps_rows() {
        let fail = Arc::new(AtomicBool::new(false));
        let sink = FlakySink {
            fail: Arc::clone(&fail),
        };
        let mut logger = SessionLogger::new(temp_dir("flaky"), 2000);
        logger.session = Some(
            Session::open(PathBuf::from("flaky.parquet"), Local::now(), Box::new(sink), 2000)
                .unwrap(),
        );

        let varied = |i: u32| {
            let mut r = row(i);
            r.roll = (f64::from(i) * 0.731).sin();
            r.pitch = (f64::from(i) * 1.37).cos();
            r.yaw = f64::from(i) * 0.173 % 360.0;
            r
        };
        for i in 0..1999 {
            logger.append(varied(i)).unwrap();
        }
        fail.store(true, Ordering::SeqCst);
        assert!(logger.append(varied(1999)).is_err());
        assert_eq!(logger.buffered(), 2000);

        assert!(logger.stop().is_err());
        assert!(logger.is_active());
        assert_eq!(logger.buffered(), 2000);
        logger.session = None;
    }

    #[test]
    fn test_file_name_fallbacks() {
        let t = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            session_file_name(None, None, Some("  "), &t),
            "NoSubjID_0_NoDeviceID_2024_03_09_14_05_07.parquet"
        );
        assert_eq!(
            session_file_name(Some("M 12/a"), Some("3.0"), Some("OptoGrid-AB12"), &t),
            "M-12-a_3_OptoGrid-AB12_2024_03_09_14_05_07.parquet"
        );
        assert_eq!(session_number(Some("1e3")), 1000);
        assert_eq!(session_number(Some("abc")), 0);
    }

    #[test]
    fn test_second_start_keeps_session() {
        let dir = temp_dir("restart");
        let mut logger = SessionLogger::new(&dir, 100);
        let first = logger.start(Some("A"), Some("1"), None).unwrap();
        let second = logger.start(Some("B"), Some("2"), None).unwrap();
        assert_eq!(first, second);
        logger.stop().unwrap();
        let _ = fs::remove_dir_all(&dir);
    }
}
