//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const DEVICE_COLUMNS: &str =
    "id, name, address, device_type, port, protocol, status, last_polled_at, created_at";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Invalid data: {0}")]
    InvalidData(String),
    #[error("Database connection lock poisoned")]
    Poisoned,
}

/// Device access used by the poll orchestrator.
///
/// The orchestrator only reads devices and writes completed polls; creating
/// and deleting devices belongs to the registry.
pub trait DeviceStore: Send + Sync {
    /// Fetch one device, `None` when the id is not registered.
    fn get_device(&self, id: i64) -> Result<Option<Device>, DbError>;

    /// All devices, ordered by id.
    fn list_devices(&self) -> Result<Vec<Device>, DbError>;

    /// Store a completed poll: the device's status and poll time plus a
    /// history row, in one transaction.
    fn record_poll(&self, record: &PollRecord) -> Result<(), DbError>;
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    // --- Device registry ---

    /// Register a new device and return it with its assigned ID.
    pub fn add_device(&self, device: &NewDevice) -> Result<Device, DbError> {
        let address = device.address.trim();
        if address.is_empty() {
            return Err(DbError::InvalidData("device address must not be empty".into()));
        }

        let created_at = Utc::now();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO devices (name, address, device_type, port, protocol, status, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                device.name,
                address,
                device.device_type,
                device.port,
                device.protocol,
                DeviceStatus::Unknown.as_str(),
                format_db_time(&created_at),
            ],
        )?;

        Ok(Device {
            id: conn.last_insert_rowid(),
            name: device.name.clone(),
            address: address.to_string(),
            device_type: device.device_type.clone(),
            port: device.port,
            protocol: device.protocol.clone(),
            status: DeviceStatus::Unknown,
            last_polled_at: None,
            created_at,
        })
    }

    /// Apply a partial update to a device's registry fields.
    ///
    /// Status and poll time are left alone; they only change through a poll.
    pub fn update_device(&self, id: i64, update: &DeviceUpdate) -> Result<Device, DbError> {
        let address = match &update.address {
            Some(address) => {
                let trimmed = address.trim();
                if trimmed.is_empty() {
                    return Err(DbError::InvalidData("device address must not be empty".into()));
                }
                Some(trimmed.to_string())
            }
            None => None,
        };

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let mut device = tx
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id],
                device_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        if let Some(name) = &update.name {
            device.name = name.clone();
        }
        if let Some(address) = address {
            device.address = address;
        }
        if let Some(device_type) = &update.device_type {
            device.device_type = device_type.clone();
        }
        if let Some(port) = update.port {
            device.port = port;
        }
        if let Some(protocol) = &update.protocol {
            device.protocol = protocol.clone();
        }

        tx.execute(
            "UPDATE devices SET name = ?1, address = ?2, device_type = ?3, port = ?4, protocol = ?5 WHERE id = ?6",
            params![
                device.name,
                device.address,
                device.device_type,
                device.port,
                device.protocol,
                id,
            ],
        )?;
        tx.commit()?;

        Ok(device)
    }

    /// List one page of devices, ordered by id.
    pub fn list_devices_page(&self, skip: u32, limit: u32) -> Result<Vec<Device>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices ORDER BY id ASC LIMIT ?1 OFFSET ?2",
            DEVICE_COLUMNS
        ))?;

        let devices = stmt
            .query_map(params![limit, skip], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(devices)
    }

    /// Delete a device. Its poll history goes with it through the foreign key cascade.
    pub fn delete_device(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute("DELETE FROM devices WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Poll history ---

    /// Get the most recent polls of a device, newest first.
    pub fn get_poll_history(&self, device_id: i64, limit: u32) -> Result<Vec<PollRecord>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, time, status, latency_ms, detail FROM poll_history
             WHERE device_id = ?1 ORDER BY time DESC, id DESC LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![device_id, limit], |row| {
                let time_str: String = row.get(1)?;
                Ok(PollRecord {
                    device_id: row.get(0)?,
                    time: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                    status: status_column(row, 2)?,
                    latency_ms: row.get(3)?,
                    detail: row.get(4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(records)
    }

    /// Delete poll history older than the cutoff. Returns the number of rows removed.
    pub fn delete_poll_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM poll_history WHERE time < ?1",
            params![format_db_time(&cutoff)],
        )?;
        Ok(deleted)
    }
}

impl DeviceStore for Store {
    fn get_device(&self, id: i64) -> Result<Option<Device>, DbError> {
        let conn = self.lock()?;
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn list_devices(&self) -> Result<Vec<Device>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices ORDER BY id ASC",
            DEVICE_COLUMNS
        ))?;

        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(devices)
    }

    fn record_poll(&self, record: &PollRecord) -> Result<(), DbError> {
        if matches!(record.status, DeviceStatus::Unknown | DeviceStatus::Error) {
            return Err(DbError::InvalidData(format!(
                "status {} cannot be recorded as a completed poll",
                record.status
            )));
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let time = format_db_time(&record.time);

        let updated = tx.execute(
            "UPDATE devices SET status = ?1, last_polled_at = ?2 WHERE id = ?3",
            params![record.status.as_str(), time, record.device_id],
        )?;
        if updated == 0 {
            // Dropping the transaction rolls it back.
            return Err(DbError::NotFound);
        }

        tx.execute(
            "INSERT INTO poll_history (device_id, time, status, latency_ms, detail) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.device_id,
                time,
                record.status.as_str(),
                record.latency_ms,
                record.detail,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }
}

fn device_from_row(row: &Row<'_>) -> SqlResult<Device> {
    let last_polled: Option<String> = row.get(7)?;
    let created: String = row.get(8)?;
    Ok(Device {
        id: row.get(0)?,
        name: row.get(1)?,
        address: row.get(2)?,
        device_type: row.get(3)?,
        port: row.get(4)?,
        protocol: row.get(5)?,
        status: status_column(row, 6)?,
        last_polled_at: last_polled.as_deref().and_then(parse_db_time),
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

fn status_column(row: &Row<'_>, idx: usize) -> SqlResult<DeviceStatus> {
    let raw: String = row.get(idx)?;
    raw.parse::<DeviceStatus>()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn format_db_time(dt: &DateTime<Utc>) -> String {
    dt.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
