//! Flat-file sink: delimited text (CSV) and columnar binary (Parquet).
//!
//! - Every write goes to `{file}.tmp` first and is renamed into place, so a
//!   failed write never leaves a truncated or half-appended file behind.
//! - Parquet is always a full overwrite.
//! - CSV either overwrites (default) or appends. Appending copies the existing
//!   file into the staging file first; the header goes out only when the file
//!   is new or empty.
//! - Until the run finishes, the replaced file is kept as `{file}.bak` so a
//!   commit can be reverted.
//! - Parent directories are created as needed.

use super::{PersistenceError, Sink, StagedWrite, WriteReceipt};
use crate::data::schema::{
    parse_datetime_text, NormalizedRecord, RecordSchema, DATETIME, MARKET_CAP, PRICE,
    TOTAL_VOLUME,
};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Parquet,
}

impl FileFormat {
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Parquet => "parquet",
        }
    }
}

/// What CSV writes do with an existing file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CsvMode {
    #[default]
    Overwrite,
    Append,
}

/// CSV row layout, `datetime` first as the index column.
#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    datetime: String,
    price: f64,
    market_cap: f64,
    total_volume: f64,
}

/// Writes the record set to one file.
#[derive(Debug, Clone)]
pub struct FileSink {
    destination: PathBuf,
    format: FileFormat,
    csv_mode: CsvMode,
}

impl FileSink {
    pub fn new(destination: impl Into<PathBuf>, format: FileFormat) -> Self {
        Self {
            destination: destination.into(),
            format,
            csv_mode: CsvMode::default(),
        }
    }

    pub fn with_csv_mode(mut self, mode: CsvMode) -> Self {
        self.csv_mode = mode;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Write `records` to `destination` in `format`.
    pub fn write(
        &self,
        records: &[NormalizedRecord],
        destination: &Path,
        format: FileFormat,
    ) -> Result<WriteReceipt, PersistenceError> {
        self.stage_at(records, destination, format)?.commit()
    }

    fn stage_at(
        &self,
        records: &[NormalizedRecord],
        destination: &Path,
        format: FileFormat,
    ) -> Result<StagedFile, PersistenceError> {
        if records.is_empty() {
            return Err(PersistenceError::EmptyRecordSet);
        }
        if destination.is_dir() {
            return Err(PersistenceError::Io {
                path: destination.display().to_string(),
                message: "destination is a directory".into(),
            });
        }

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let staged = StagedFile {
            destination: destination.to_path_buf(),
            tmp: sibling(destination, "tmp"),
            backup: None,
            rows: records.len(),
            committed: false,
        };
        let written = match format {
            FileFormat::Csv => write_csv(records, &staged.destination, &staged.tmp, self.csv_mode),
            FileFormat::Parquet => write_parquet(records, &staged.tmp),
        };
        // On error `staged` drops here and removes the partial tmp file.
        written?;

        debug!(path = %staged.tmp.display(), rows = records.len(), "file staged");
        Ok(staged)
    }

    /// Read a Parquet file written by this sink.
    pub fn read_parquet(path: &Path) -> Result<Vec<NormalizedRecord>, PersistenceError> {
        let file = fs::File::open(path).map_err(|e| io_error(path, e))?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| PersistenceError::Parquet(format!("read {}: {e}", path.display())))?;
        Ok(RecordSchema::from_dataframe(&df)?)
    }

    /// Read a CSV file written by this sink.
    pub fn read_csv(path: &Path) -> Result<Vec<NormalizedRecord>, PersistenceError> {
        let mut reader = csv::Reader::from_path(path)
            .map_err(|e| PersistenceError::Csv(format!("open {}: {e}", path.display())))?;

        reader
            .deserialize::<CsvRow>()
            .map(|row| {
                let row = row.map_err(|e| PersistenceError::Csv(e.to_string()))?;
                let timestamp = parse_datetime_text(&row.datetime).ok_or_else(|| {
                    PersistenceError::Csv(format!("bad {DATETIME} value '{}'", row.datetime))
                })?;
                Ok(NormalizedRecord::new(
                    timestamp,
                    row.price,
                    row.market_cap,
                    row.total_volume,
                ))
            })
            .collect()
    }
}

impl Sink for FileSink {
    fn describe(&self) -> String {
        format!("{} file {}", self.format.extension(), self.destination.display())
    }

    fn stage<'a>(
        &'a self,
        records: &'a [NormalizedRecord],
    ) -> Result<Box<dyn StagedWrite + 'a>, PersistenceError> {
        Ok(Box::new(self.stage_at(records, &self.destination, self.format)?))
    }
}

/// A fully written `.tmp` file waiting to be renamed over its destination.
struct StagedFile {
    destination: PathBuf,
    tmp: PathBuf,
    /// Prior contents, moved aside by `commit`.
    backup: Option<PathBuf>,
    rows: usize,
    committed: bool,
}

impl StagedWrite for StagedFile {
    fn commit(&mut self) -> Result<WriteReceipt, PersistenceError> {
        if self.destination.exists() {
            let backup = sibling(&self.destination, "bak");
            fs::rename(&self.destination, &backup).map_err(|e| io_error(&self.destination, e))?;
            self.backup = Some(backup);
        }

        if let Err(e) = fs::rename(&self.tmp, &self.destination) {
            if let Some(backup) = self.backup.take() {
                if let Err(restore) = fs::rename(&backup, &self.destination) {
                    warn!(path = %backup.display(), error = %restore, "could not restore prior file");
                }
            }
            return Err(io_error(&self.destination, e));
        }

        self.committed = true;
        debug!(path = %self.destination.display(), rows = self.rows, "file written");
        Ok(WriteReceipt {
            destination: self.destination.display().to_string(),
            rows_written: self.rows,
        })
    }

    fn reversible(&self) -> bool {
        true
    }

    fn revert(&mut self) -> Result<(), PersistenceError> {
        if !self.committed {
            return Ok(());
        }
        match self.backup.take() {
            Some(backup) => {
                fs::rename(&backup, &self.destination).map_err(|e| io_error(&self.destination, e))?
            }
            None => fs::remove_file(&self.destination).map_err(|e| io_error(&self.destination, e))?,
        }
        self.committed = false;
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        // Leftovers are either an uncommitted tmp file or a no-longer-needed backup.
        remove_if_present(&self.tmp);
        if let Some(backup) = &self.backup {
            remove_if_present(backup);
        }
    }
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove staging file"),
    }
}

/// `{path}.{suffix}` next to `path`.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn io_error(path: &Path, e: std::io::Error) -> PersistenceError {
    PersistenceError::Io {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

/// Write the CSV into `tmp`. In append mode `tmp` starts as a copy of `destination`.
fn write_csv(
    records: &[NormalizedRecord],
    destination: &Path,
    tmp: &Path,
    mode: CsvMode,
) -> Result<(), PersistenceError> {
    let existing = match mode {
        CsvMode::Overwrite => false,
        CsvMode::Append => destination.exists(),
    };
    if existing {
        fs::copy(destination, tmp).map_err(|e| io_error(tmp, e))?;
    }
    let write_header = !existing || fs::metadata(tmp).map(|m| m.len() == 0).unwrap_or(true);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(existing)
        .truncate(!existing)
        .open(tmp)
        .map_err(|e| io_error(tmp, e))?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);

    let csv_err = |e: csv::Error| PersistenceError::Csv(format!("{}: {e}", tmp.display()));

    if write_header {
        writer
            .write_record([DATETIME, PRICE, MARKET_CAP, TOTAL_VOLUME])
            .map_err(csv_err)?;
    }

    for record in records {
        writer
            .serialize(CsvRow {
                datetime: record.datetime_text(),
                price: record.price,
                market_cap: record.market_cap,
                total_volume: record.total_volume,
            })
            .map_err(csv_err)?;
    }

    writer.flush().map_err(|e| io_error(tmp, e))?;
    Ok(())
}

fn write_parquet(records: &[NormalizedRecord], tmp: &Path) -> Result<(), PersistenceError> {
    let mut df = RecordSchema::to_dataframe(records)
        .map_err(|e| PersistenceError::Parquet(format!("dataframe creation: {e}")))?;

    let file = fs::File::create(tmp).map_err(|e| io_error(tmp, e))?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| PersistenceError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn records() -> Vec<NormalizedRecord> {
        vec![
            NormalizedRecord::new(
                Utc.with_ymd_and_hms(2025, 7, 4, 0, 0, 0).unwrap(),
                65000.123,
                1.2e12,
                3.4e10,
            ),
            NormalizedRecord::new(
                Utc.with_ymd_and_hms(2025, 7, 5, 0, 0, 0).unwrap(),
                64000.5,
                1.19e12,
                2.9e10,
            ),
        ]
    }

    #[test]
    fn parquet_roundtrip_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out/btc.parquet");
        let sink = FileSink::new(&path, FileFormat::Parquet);

        let receipt = sink.persist(&records()).unwrap();
        assert_eq!(receipt.rows_written, 2);
        assert_eq!(FileSink::read_parquet(&path).unwrap(), records());
        assert!(!path.with_extension("parquet.tmp").exists());
    }

    #[test]
    fn parquet_always_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.parquet");
        let sink = FileSink::new(&path, FileFormat::Parquet);

        sink.persist(&records()).unwrap();
        sink.persist(&records()[..1]).unwrap();
        assert_eq!(FileSink::read_parquet(&path).unwrap(), records()[..1].to_vec());
    }

    #[test]
    fn csv_overwrite_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let sink = FileSink::new(&path, FileFormat::Csv);

        sink.persist(&records()).unwrap();
        sink.persist(&records()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("datetime,price,market_cap,total_volume"));
        assert_eq!(text.lines().count(), 3);
        assert_eq!(FileSink::read_csv(&path).unwrap(), records());
    }

    #[test]
    fn csv_append_adds_rows_without_repeating_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let sink = FileSink::new(&path, FileFormat::Csv).with_csv_mode(CsvMode::Append);

        sink.persist(&records()[..1]).unwrap();
        sink.persist(&records()[1..]).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("datetime").count(), 1);
        assert_eq!(FileSink::read_csv(&path).unwrap(), records());
    }

    #[test]
    fn empty_record_set_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path().join("x.csv"), FileFormat::Csv);
        assert!(matches!(sink.persist(&[]), Err(PersistenceError::EmptyRecordSet)));
    }

    #[test]
    fn unwritable_destination_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file, not a dir").unwrap();
        let sink = FileSink::new(blocker.join("btc.parquet"), FileFormat::Parquet);
        assert!(matches!(
            sink.persist(&records()),
            Err(PersistenceError::Io { .. })
        ));
    }

    #[test]
    fn failed_csv_overwrite_leaves_prior_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let sink = FileSink::new(&path, FileFormat::Csv);
        sink.persist(&records()).unwrap();
        let before = fs::read(&path).unwrap();

        // A directory squatting on the staging path makes the write fail.
        fs::create_dir(sibling(&path, "tmp")).unwrap();
        assert!(matches!(
            sink.persist(&records()[..1]),
            Err(PersistenceError::Io { .. })
        ));

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn failed_csv_append_leaves_prior_file_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let sink = FileSink::new(&path, FileFormat::Csv).with_csv_mode(CsvMode::Append);
        sink.persist(&records()[..1]).unwrap();
        let before = fs::read(&path).unwrap();

        fs::create_dir(sibling(&path, "tmp")).unwrap();
        assert!(sink.persist(&records()[1..]).is_err());

        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn staging_does_not_touch_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.parquet");
        let sink = FileSink::new(&path, FileFormat::Parquet);
        let rows = records();

        let staged = sink.stage(&rows).unwrap();
        assert!(!path.exists());
        assert!(sibling(&path, "tmp").exists());

        drop(staged);
        assert!(!sibling(&path, "tmp").exists());
        assert!(!path.exists());
    }

    #[test]
    fn revert_restores_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let sink = FileSink::new(&path, FileFormat::Csv);
        sink.persist(&records()[..1]).unwrap();
        let before = fs::read(&path).unwrap();

        let rows = records();
        let mut staged = sink.stage(&rows).unwrap();
        assert!(staged.reversible());
        staged.commit().unwrap();
        assert_eq!(FileSink::read_csv(&path).unwrap(), records());

        staged.revert().unwrap();
        drop(staged);
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!sibling(&path, "bak").exists());
    }

    #[test]
    fn revert_removes_newly_created_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.parquet");
        let sink = FileSink::new(&path, FileFormat::Parquet);

        let rows = records();
        let mut staged = sink.stage(&rows).unwrap();
        staged.commit().unwrap();
        assert!(path.exists());

        staged.revert().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn committed_write_leaves_no_backup_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("btc.csv");
        let sink = FileSink::new(&path, FileFormat::Csv);

        sink.persist(&records()).unwrap();
        sink.persist(&records()).unwrap();

        assert!(!sibling(&path, "bak").exists());
        assert!(!sibling(&path, "tmp").exists());
    }

    #[test]
    fn describe_names_format_and_path() {
        let sink = FileSink::new("data/btc.csv", FileFormat::Csv);
        assert_eq!(sink.describe(), "csv file data/btc.csv");
    }
}
