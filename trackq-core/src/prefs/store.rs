//! Key/value preferences backed by SQLite

use crate::error::Result;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const KEY_QUEUE_LENGTH: &str = "queue.length";
const KEY_QUEUE_HEAD_OFFSET: &str = "queue.head_offset";
const KEY_OPT_OUT: &str = "tracking.opt_out";
const KEY_SAMPLING_EXCLUDED: &str = "sampling.excluded";
const KEY_SAMPLING_RATE: &str = "sampling.rate";
const KEY_EVER_ID: &str = "device.ever_id";
const KEY_FIRST_START: &str = "device.first_start_done";

/// Persisted position of the durable queue.
///
/// `head_offset` is the byte offset of the head entry in the backing file,
/// or `-1` when unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCursor {
    pub length: u64,
    pub head_offset: i64,
}

impl Default for QueueCursor {
    fn default() -> Self {
        Self {
            length: 0,
            head_offset: -1,
        }
    }
}

/// Stored sampling outcome and the rate it was computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplingDecision {
    pub excluded: bool,
    pub rate: u32,
}

/// Preferences handle (single connection)
pub struct Preferences {
    conn: Mutex<Connection>,
}

impl Preferences {
    /// Open or create the preferences database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;
        super::schema::run_migrations(&mut conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        super::schema::run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read a raw value
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Write a raw value
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        upsert(&conn, key, value)?;
        Ok(())
    }

    /// Delete a value
    pub fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM preferences WHERE key = ?1", [key])?;
        Ok(())
    }

    fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.get(key)?.and_then(|v| match v.parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!(key, value = %v, "Ignoring unparseable preference");
                None
            }
        }))
    }

    // ============================================
    // Queue cursor
    // ============================================

    /// Last persisted queue cursor (empty queue if never written)
    pub fn queue_cursor(&self) -> Result<QueueCursor> {
        let length = self.get_parsed::<u64>(KEY_QUEUE_LENGTH)?.unwrap_or(0);
        let head_offset = self.get_parsed::<i64>(KEY_QUEUE_HEAD_OFFSET)?.unwrap_or(-1);
        Ok(QueueCursor {
            length,
            head_offset,
        })
    }

    /// Persist both cursor fields in one transaction
    pub fn set_queue_cursor(&self, cursor: &QueueCursor) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        upsert(&tx, KEY_QUEUE_LENGTH, &cursor.length.to_string())?;
        upsert(&tx, KEY_QUEUE_HEAD_OFFSET, &cursor.head_offset.to_string())?;
        tx.commit()?;
        Ok(())
    }

    // ============================================
    // Opt-out / sampling
    // ============================================

    pub fn is_opted_out(&self) -> Result<bool> {
        Ok(self.get_parsed::<bool>(KEY_OPT_OUT)?.unwrap_or(false))
    }

    pub fn set_opted_out(&self, opted_out: bool) -> Result<()> {
        self.set(KEY_OPT_OUT, &opted_out.to_string())
    }

    /// Stored sampling decision, if one was ever made
    pub fn sampling_decision(&self) -> Result<Option<SamplingDecision>> {
        let excluded = self.get_parsed::<bool>(KEY_SAMPLING_EXCLUDED)?;
        let rate = self.get_parsed::<u32>(KEY_SAMPLING_RATE)?;
        Ok(match (excluded, rate) {
            (Some(excluded), Some(rate)) => Some(SamplingDecision { excluded, rate }),
            _ => None,
        })
    }

    pub fn set_sampling_decision(&self, decision: &SamplingDecision) -> Result<()> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        upsert(&tx, KEY_SAMPLING_EXCLUDED, &decision.excluded.to_string())?;
        upsert(&tx, KEY_SAMPLING_RATE, &decision.rate.to_string())?;
        tx.commit()?;
        Ok(())
    }

    // ============================================
    // Device identity
    // ============================================

    pub fn ever_id(&self) -> Result<Option<String>> {
        self.get(KEY_EVER_ID)
    }

    pub fn set_ever_id(&self, ever_id: &str) -> Result<()> {
        self.set(KEY_EVER_ID, ever_id)
    }

    /// Returns `true` exactly once per installation.
    pub fn take_first_start(&self) -> Result<bool> {
        if self.get(KEY_FIRST_START)?.is_some() {
            return Ok(false);
        }
        self.set(KEY_FIRST_START, "true")?;
        Ok(true)
    }
}

fn upsert(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO preferences (key, value, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
        params![key, value, Utc::now().to_rfc3339()],
    )
}
