//! Append-only CSV table of structured records.
//!
//! Every access to a table goes through a lock shared by all handles that
//! point at the same path, so writers from concurrent batches are serialized.
//! Rows are encoded in memory and written with a single `write_all` on a file
//! opened in append mode.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::fields::StructuredRecord;

pub const NAME_MAX_CHARS: usize = 100;
pub const DOC_NUMBER_MAX_CHARS: usize = 50;
pub const FACILITY_MAX_CHARS: usize = 200;
pub const ADDRESS_MAX_CHARS: usize = 500;
pub const UNIT_MAX_CHARS: usize = 50;

static TABLE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// One table row, in column order
#[derive(Debug, Serialize, Deserialize)]
struct Row {
    #[serde(rename = "First name")]
    first_name: String,
    #[serde(rename = "Middle name")]
    middle_name: String,
    #[serde(rename = "Last name")]
    last_name: String,
    #[serde(rename = "Date created")]
    date_created: String,
    #[serde(rename = "DOC #")]
    doc_number: String,
    #[serde(rename = "Facility name")]
    facility_name: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Unit")]
    unit: String,
    #[serde(rename = "AI Summary")]
    ai_summary: String,
    #[serde(rename = "Raw text")]
    raw_text: String,
}

impl From<&StructuredRecord> for Row {
    fn from(record: &StructuredRecord) -> Self {
        Self {
            first_name: record.first_name.clone(),
            middle_name: record.middle_name.clone().unwrap_or_default(),
            last_name: record.last_name.clone(),
            date_created: record.date_created.clone(),
            doc_number: record.doc_number.clone(),
            facility_name: record.facility_name.clone(),
            address: record.address.clone(),
            unit: record.unit.clone().unwrap_or_default(),
            ai_summary: record.ai_summary.clone(),
            raw_text: record.raw_text.clone(),
        }
    }
}

impl From<Row> for StructuredRecord {
    fn from(row: Row) -> Self {
        Self {
            first_name: row.first_name,
            middle_name: non_empty(row.middle_name),
            last_name: row.last_name,
            date_created: row.date_created,
            doc_number: row.doc_number,
            facility_name: row.facility_name,
            address: row.address,
            unit: non_empty(row.unit),
            ai_summary: row.ai_summary,
            raw_text: row.raw_text,
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

/// Handle to a CSV table
#[derive(Clone)]
pub struct CsvStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let key = std::path::absolute(&path).unwrap_or_else(|_| path.clone());
        let lock = match TABLE_LOCKS.lock() {
            Ok(mut locks) => locks.entry(key).or_default().clone(),
            Err(poisoned) => poisoned.into_inner().entry(key).or_default().clone(),
        };
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Validate and append one record
    pub async fn append(&self, record: &StructuredRecord) -> Result<(), StoreError> {
        validate(record)?;

        let row = Row::from(record);
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.append_blocking(&row))
            .await
            .map_err(|e| StoreError::Task {
                message: e.to_string(),
            })??;

        info!(path = %self.path.display(), doc_number = %record.doc_number, "Record appended");
        Ok(())
    }

    /// Read every record in the table. A missing table reads as empty.
    pub async fn read_all(&self) -> Result<Vec<StructuredRecord>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = store.acquire()?;
            store.read_blocking()
        })
        .await
        .map_err(|e| StoreError::Task {
            message: e.to_string(),
        })?
    }

    pub async fn record_count(&self) -> Result<usize, StoreError> {
        Ok(self.read_all().await?.len())
    }

    /// Copy the table to `<path>.backup_<timestamp>` and return the copy's path
    pub async fn backup(&self) -> Result<PathBuf, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = store.acquire()?;
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let mut target = store.path.clone().into_os_string();
            target.push(format!(".backup_{}", stamp));
            let target = PathBuf::from(target);

            fs::copy(&store.path, &target).map_err(|e| io_error(&store.path, e))?;
            info!(backup = %target.display(), "Table backed up");
            Ok(target)
        })
        .await
        .map_err(|e| StoreError::Task {
            message: e.to_string(),
        })?
    }

    fn acquire(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.lock.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn append_blocking(&self, row: &Row) -> Result<(), StoreError> {
        let _guard = self.acquire()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_error(&self.path, e))?;
        let is_new = file
            .metadata()
            .map_err(|e| io_error(&self.path, e))?
            .len()
            == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(Vec::new());
        writer.serialize(row)?;
        let buffer = writer
            .into_inner()
            .map_err(|e| io_error(&self.path, std::io::Error::other(e.to_string())))?;

        file.write_all(&buffer)
            .and_then(|_| file.flush())
            .map_err(|e| io_error(&self.path, e))?;

        debug!(bytes = buffer.len(), header = is_new, "Row written");
        Ok(())
    }

    fn read_blocking(&self) -> Result<Vec<StructuredRecord>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        reader
            .deserialize::<Row>()
            .map(|row| row.map(StructuredRecord::from).map_err(StoreError::from))
            .collect()
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Schema check applied before a row is written
pub fn validate(record: &StructuredRecord) -> Result<(), StoreError> {
    let required = [
        ("first_name", &record.first_name, NAME_MAX_CHARS),
        ("last_name", &record.last_name, NAME_MAX_CHARS),
        ("doc_number", &record.doc_number, DOC_NUMBER_MAX_CHARS),
        ("facility_name", &record.facility_name, FACILITY_MAX_CHARS),
        ("address", &record.address, ADDRESS_MAX_CHARS),
        ("date_created", &record.date_created, usize::MAX),
        ("ai_summary", &record.ai_summary, usize::MAX),
    ];
    for (field, value, max) in required {
        if value.trim().is_empty() {
            return Err(StoreError::Validation {
                field,
                reason: "is empty".to_string(),
            });
        }
        check_length(field, value, max)?;
    }

    if let Some(middle) = &record.middle_name {
        check_length("middle_name", middle, NAME_MAX_CHARS)?;
    }
    if let Some(unit) = &record.unit {
        check_length("unit", unit, UNIT_MAX_CHARS)?;
    }
    Ok(())
}

fn check_length(field: &'static str, value: &str, max: usize) -> Result<(), StoreError> {
    let len = value.chars().count();
    if len > max {
        return Err(StoreError::Validation {
            field,
            reason: format!("is {} characters (max {})", len, max),
        });
    }
    Ok(())
}
