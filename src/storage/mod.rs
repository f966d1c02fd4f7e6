use std::io::Write;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::collectors::Measurement;

pub mod sqlite;

pub use sqlite::SqliteStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot store an empty batch")]
    EmptyBatch,
}

/// One flushed batch of measurements.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionRound {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub measurements_count: usize,
}

impl CollectionRound {
    fn new(measurements_count: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            measurements_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageStats {
    pub total_measurements: i64,
    pub total_collection_rounds: i64,
    pub latest_collection: Option<CollectionRound>,
    pub database_size_bytes: Option<u64>,
}

/// Destination for flushed measurements.
pub trait Storage: Send {
    fn name(&self) -> &str;
    fn initialize(&self) -> Result<(), StorageError>;
    fn store_measurements(&self, measurements: Vec<Measurement>) -> Result<CollectionRound, StorageError>;
}

/// Writes each measurement as one JSON object per line.
pub struct JsonLinesStorage<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesStorage<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> JsonLinesStorage<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> Storage for JsonLinesStorage<W> {
    fn name(&self) -> &str {
        "stdout"
    }

    fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn store_measurements(&self, measurements: Vec<Measurement>) -> Result<CollectionRound, StorageError> {
        if measurements.is_empty() {
            return Err(StorageError::EmptyBatch);
        }

        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        for measurement in &measurements {
            serde_json::to_writer(&mut *out, measurement)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;

        Ok(CollectionRound::new(measurements.len()))
    }
}
