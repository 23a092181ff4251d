//! Durable CSV output for leadpool runs.
//!
//! The output file doubles as the persisted dedup registry: resuming a run
//! seeds the in-memory registry from the Internal ID column of an existing
//! file, and the sink appends instead of truncating.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use leadpool_core::LeadRecord;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "leadpool-export";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("opening output file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("writing output row: {0}")]
    Write(#[from] csv::Error),
    #[error("flushing output: {0}")]
    Flush(#[from] std::io::Error),
}

/// `wa_{status}_{zip-or-ALL}_{date}.csv` under the output directory.
pub fn output_path(dir: &Path, status: &str, zip_code: Option<&str>, run_date: NaiveDate) -> PathBuf {
    let status = status.replace(char::is_whitespace, "_");
    let zip = zip_code.unwrap_or("ALL");
    dir.join(format!("wa_{status}_{zip}_{}.csv", run_date.format("%Y-%m-%d")))
}

/// Internal IDs already present in an existing output file.
///
/// Missing or unreadable files yield an empty set: a fresh run starts with
/// nothing registered rather than refusing to start.
pub fn read_existing_ids(path: &Path) -> HashSet<String> {
    let mut ids = HashSet::new();
    if !path.exists() {
        return ids;
    }
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "could not read existing output; starting fresh");
            return ids;
        }
    };

    let id_column = reader
        .headers()
        .ok()
        .and_then(|headers| headers.iter().position(|h| h == "Internal ID"))
        .unwrap_or(LeadRecord::HEADER.len() - 1);

    for row in reader.records() {
        match row {
            Ok(row) => {
                if let Some(id) = row.get(id_column) {
                    ids.insert(id.to_string());
                }
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable row while seeding registry");
            }
        }
    }
    ids
}

/// Append-mode CSV sink. Writes the fixed header exactly once, on file
/// creation; flush after each page batch bounds crash loss to one page.
pub struct CsvSink {
    writer: csv::Writer<File>,
    path: PathBuf,
    rows_written: u64,
}

impl CsvSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| ExportError::Open {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| ExportError::Open {
                path: path.clone(),
                source,
            })?;
        let is_new = file.metadata().map(|m| m.len() == 0).unwrap_or(true);

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer.write_record(LeadRecord::HEADER)?;
            writer.flush()?;
        }

        Ok(Self {
            writer,
            path,
            rows_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written by this sink instance (excludes pre-existing rows).
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn append(&mut self, records: &[LeadRecord]) -> Result<(), ExportError> {
        for record in records {
            self.writer.write_record(record.as_row())?;
            self.rows_written += 1;
        }
        Ok(())
    }

    /// Push buffered rows to the file. Called once per page batch.
    pub fn flush(&mut self) -> Result<(), ExportError> {
        self.writer.flush()?;
        Ok(())
    }
}
