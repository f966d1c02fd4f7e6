use super::{CollectionRound, Storage, StorageError, StorageStats};
use crate::collectors::{Fields, Measurement, Tags, Value};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};
use std::fs;
use std::path::{Path, PathBuf};

pub struct SqliteStorage {
    db_path: PathBuf,
}

fn format_time(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(idx: usize, raw: &str) -> SqliteResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

impl SqliteStorage {
    pub fn new(db_path: Option<PathBuf>) -> Self {
        let path = db_path.unwrap_or_else(Self::default_path);
        Self { db_path: path }
    }

    pub fn default_path() -> PathBuf {
        let home_dir = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Path::new(&home_dir).join(".gatherd").join("gatherd.db")
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn ensure_db_directory(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    fn get_connection(&self) -> SqliteResult<Connection> {
        Connection::open(&self.db_path)
    }

    fn create_tables(&self) -> Result<(), StorageError> {
        let conn = self.get_connection()?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS collection_rounds (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                measurements_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection_round_id TEXT NOT NULL,
                name TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                tags TEXT NOT NULL,
                FOREIGN KEY(collection_round_id) REFERENCES collection_rounds(id)
            );

            CREATE TABLE IF NOT EXISTS fields (
                measurement_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                value_type TEXT NOT NULL,
                value_int INTEGER,
                value_float REAL,
                value_text TEXT,
                value_bool INTEGER,
                FOREIGN KEY(measurement_id) REFERENCES measurements(id)
            );

            CREATE INDEX IF NOT EXISTS idx_measurements_name_timestamp
                ON measurements(name, timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_measurements_round
                ON measurements(collection_round_id);
            CREATE INDEX IF NOT EXISTS idx_fields_measurement
                ON fields(measurement_id);",
        )?;

        Ok(())
    }

    /// Most recent measurements named `name`, newest first.
    pub fn query_latest(&self, name: &str, limit: usize) -> Result<Vec<Measurement>, StorageError> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, timestamp, tags FROM measurements
             WHERE name = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let mut fields_stmt = conn.prepare(
            "SELECT name, value_type, value_int, value_float, value_text, value_bool
             FROM fields WHERE measurement_id = ?1",
        )?;

        let rows = stmt
            .query_map(params![name, limit as i64], |row| {
                let id: i64 = row.get(0)?;
                let name: String = row.get(1)?;
                let timestamp: String = row.get(2)?;
                let tags: String = row.get(3)?;
                Ok((id, name, parse_time(2, &timestamp)?, tags))
            })?
            .collect::<SqliteResult<Vec<_>>>()?;

        let mut measurements = Vec::with_capacity(rows.len());
        for (id, name, timestamp, tags) in rows {
            let tags: Tags = serde_json::from_str(&tags)?;
            let fields = fields_stmt
                .query_map([id], read_field)?
                .collect::<SqliteResult<Fields>>()?;
            measurements.push(Measurement::new(name, fields, tags, timestamp));
        }

        Ok(measurements)
    }

    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.get_connection()?;

        let total_measurements: i64 =
            conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;

        let total_collection_rounds: i64 =
            conn.query_row("SELECT COUNT(*) FROM collection_rounds", [], |row| row.get(0))?;

        let latest_collection = conn
            .query_row(
                "SELECT id, timestamp, measurements_count FROM collection_rounds
                 ORDER BY timestamp DESC LIMIT 1",
                [],
                |row| {
                    let id: String = row.get(0)?;
                    let timestamp: String = row.get(1)?;
                    let measurements_count = row.get::<_, i64>(2)? as usize;
                    Ok(CollectionRound {
                        id,
                        timestamp: parse_time(1, &timestamp)?,
                        measurements_count,
                    })
                },
            )
            .optional()?;

        let database_size_bytes = fs::metadata(&self.db_path).map(|m| m.len()).ok();

        Ok(StorageStats {
            total_measurements,
            total_collection_rounds,
            latest_collection,
            database_size_bytes,
        })
    }
}

fn read_field(row: &Row<'_>) -> SqliteResult<(String, Value)> {
    let name: String = row.get(0)?;
    let value_type: String = row.get(1)?;
    let value = match value_type.as_str() {
        "integer" => Value::Int(row.get(2)?),
        "float" => Value::Float(row.get(3)?),
        "string" => Value::String(row.get(4)?),
        "boolean" => Value::Bool(row.get::<_, i32>(5)? != 0),
        "timestamp" => Value::Timestamp(parse_time(4, &row.get::<_, String>(4)?)?),
        _ => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                format!("unknown value type '{}'", value_type).into(),
            ))
        }
    };
    Ok((name, value))
}

impl Storage for SqliteStorage {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn initialize(&self) -> Result<(), StorageError> {
        self.ensure_db_directory()?;
        self.create_tables()?;
        Ok(())
    }

    fn store_measurements(&self, measurements: Vec<Measurement>) -> Result<CollectionRound, StorageError> {
        if measurements.is_empty() {
            return Err(StorageError::EmptyBatch);
        }

        let conn = self.get_connection()?;
        let round = CollectionRound::new(measurements.len());

        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO collection_rounds (id, timestamp, measurements_count) VALUES (?1, ?2, ?3)",
            params![round.id, format_time(&round.timestamp), round.measurements_count as i64],
        )?;

        for measurement in &measurements {
            tx.execute(
                "INSERT INTO measurements (collection_round_id, name, timestamp, tags)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    round.id,
                    measurement.name(),
                    format_time(&measurement.timestamp()),
                    serde_json::to_string(measurement.tags())?,
                ],
            )?;
            let measurement_id = tx.last_insert_rowid();

            for (name, value) in measurement.fields() {
                match value {
                    Value::Int(v) => tx.execute(
                        "INSERT INTO fields (measurement_id, name, value_type, value_int)
                         VALUES (?1, ?2, 'integer', ?3)",
                        params![measurement_id, name, v],
                    )?,
                    Value::Float(v) => tx.execute(
                        "INSERT INTO fields (measurement_id, name, value_type, value_float)
                         VALUES (?1, ?2, 'float', ?3)",
                        params![measurement_id, name, v],
                    )?,
                    Value::String(v) => tx.execute(
                        "INSERT INTO fields (measurement_id, name, value_type, value_text)
                         VALUES (?1, ?2, 'string', ?3)",
                        params![measurement_id, name, v],
                    )?,
                    Value::Bool(v) => tx.execute(
                        "INSERT INTO fields (measurement_id, name, value_type, value_bool)
                         VALUES (?1, ?2, 'boolean', ?3)",
                        params![measurement_id, name, *v as i32],
                    )?,
                    Value::Timestamp(v) => tx.execute(
                        "INSERT INTO fields (measurement_id, name, value_type, value_text)
                         VALUES (?1, ?2, 'timestamp', ?3)",
                        params![measurement_id, name, format_time(v)],
                    )?,
                };
            }
        }

        tx.commit()?;
        Ok(round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{Accumulator, ChannelSink};
    use std::sync::Arc;

    fn storage() -> (tempfile::TempDir, SqliteStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::new(Some(dir.path().join("nested").join("test.db")));
        storage.initialize().unwrap();
        (dir, storage)
    }

    #[test]
    fn test_storage_initialization() {
        let (_dir, storage) = storage();
        let conn = storage.get_connection().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
                 AND name IN ('collection_rounds', 'measurements', 'fields')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_measurements, 0);
        assert!(stats.latest_collection.is_none());
    }

    #[test]
    fn test_store_and_query() {
        let (_dir, storage) = storage();
        let (sink, mut rx) = ChannelSink::channel();
        let mut acc = Accumulator::new("proc", Arc::new(sink));

        let t0 = DateTime::parse_from_rfc3339("2024-05-01T12:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut fields = Fields::new();
        fields.insert("time".to_string(), Value::from(12.5));
        fields.insert("threads".to_string(), Value::from(4));
        fields.insert("alive".to_string(), Value::from(true));
        fields.insert("state".to_string(), Value::from("S"));
        fields.insert("started".to_string(), Value::from(t0));
        let mut tags = Tags::new();
        tags.insert("pid".to_string(), "42".to_string());
        acc.add_values_with_time("cpu", fields, tags, t0);
        acc.add("other", 1, Tags::new());

        let batch: Vec<Measurement> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let expected = batch[0].clone();
        let round = storage.store_measurements(batch).unwrap();
        assert_eq!(round.measurements_count, 2);

        let results = storage.query_latest("proc_cpu", 10).unwrap();
        assert_eq!(results, vec![expected]);

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.total_measurements, 2);
        assert_eq!(stats.total_collection_rounds, 1);
        assert_eq!(stats.latest_collection.unwrap().id, round.id);
        assert!(stats.database_size_bytes.unwrap() > 0);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let (_dir, storage) = storage();
        assert!(matches!(
            storage.store_measurements(Vec::new()),
            Err(StorageError::EmptyBatch)
        ));
    }
}
