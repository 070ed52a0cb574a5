//! SQLite-backed measurement store with keyed upsert semantics.

use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// One hourly measurement row for a building. Identity key is
/// `(building_id, ts)`; re-inserting the same key overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub ts: DateTime<Utc>,
    /// kWh consumed during the hour starting at `ts`.
    pub q_flow_heat: f64,
    pub temperature: Option<f64>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Measurement store addressed by database path; a connection is opened
/// per call, so the handle is cheap to clone and share across requests.
#[derive(Debug, Clone)]
pub struct MeasurementStore {
    db_path: PathBuf,
}

impl MeasurementStore {
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let conn = store.connect()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS measurements(
                building_id TEXT NOT NULL,
                ts_utc_s INTEGER NOT NULL,
                q_flow_heat REAL NOT NULL,
                temperature REAL,
                PRIMARY KEY(building_id, ts_utc_s)
            );
            CREATE INDEX IF NOT EXISTS idx_meas_bid_ts
                ON measurements(building_id, ts_utc_s);
            ",
        )?;

        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Ok(Connection::open(&self.db_path)?)
    }

    /// Idempotent last-write-wins upsert of a record batch. Returns the
    /// number of records applied.
    pub fn upsert_batch(
        &self,
        building_id: &str,
        records: &[Measurement],
    ) -> Result<usize, StoreError> {
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT OR REPLACE INTO measurements(building_id, ts_utc_s, q_flow_heat, temperature)
                VALUES (?1, ?2, ?3, ?4)
                ",
            )?;
            for record in records {
                stmt.execute(params![
                    building_id,
                    record.ts.timestamp(),
                    record.q_flow_heat,
                    record.temperature,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "store",
            event = "store.upsert",
            building_id = building_id,
            records = records.len()
        );

        Ok(records.len())
    }

    /// All measurements for one building, ascending by timestamp.
    pub fn query_ordered(&self, building_id: &str) -> Result<Vec<Measurement>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "
            SELECT ts_utc_s, q_flow_heat, temperature
            FROM measurements
            WHERE building_id = ?1
            ORDER BY ts_utc_s ASC
            ",
        )?;

        let mut rows = stmt.query(params![building_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let ts_utc_s: i64 = row.get(0)?;
            let ts = Utc
                .timestamp_opt(ts_utc_s, 0)
                .single()
                .ok_or(StoreError::InvalidTimestamp(ts_utc_s))?;
            out.push(Measurement {
                ts,
                q_flow_heat: row.get(1)?,
                temperature: row.get(2)?,
            });
        }

        Ok(out)
    }

    /// Total stored rows across all buildings.
    pub fn total_rows(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
