//! Persisted per-scan progress cursors.
//!
//! One SQLite row per scan name holds the boundary of the most recently
//! processed post and the last run time. The row is the only durable entity
//! in the system; everything else is scoped to a single invocation.

use crate::core::error::SkywatchError;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

const SCAN_STATE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS scan_state (
    scan_name TEXT PRIMARY KEY,
    handle TEXT NOT NULL,
    last_boundary_created_at TEXT NOT NULL,
    last_boundary_uri TEXT NOT NULL,
    last_run_at TEXT
)";

/// The `(createdAt, uri)` pair of the newest post a scan has processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Boundary {
    pub created_at: DateTime<Utc>,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanState {
    pub scan_name: String,
    pub handle: String,
    pub last_boundary_created_at: DateTime<Utc>,
    pub last_boundary_uri: String,
    pub last_run_at: Option<DateTime<Utc>>,
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, SkywatchError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SkywatchError::State(format!("bad timestamp '{}': {}", raw, e)))
}

pub struct StateStore {
    conn: Connection,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self, SkywatchError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        conn.execute(SCAN_STATE_SCHEMA, [])?;
        Ok(StateStore { conn })
    }

    pub fn get(&self, scan_name: &str) -> Result<Option<ScanState>, SkywatchError> {
        let row = self
            .conn
            .query_row(
                "SELECT scan_name, handle, last_boundary_created_at, last_boundary_uri, last_run_at
                 FROM scan_state WHERE scan_name = ?1",
                params![scan_name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                },
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some((scan_name, handle, boundary_ts, boundary_uri, run_at)) => Ok(Some(ScanState {
                scan_name,
                handle,
                last_boundary_created_at: parse_ts(&boundary_ts)?,
                last_boundary_uri: boundary_uri,
                last_run_at: run_at.as_deref().map(parse_ts).transpose()?,
            })),
        }
    }

    /// Overwrite a scan's cursor. Creates the row on the first successful
    /// commit.
    pub fn commit(
        &self,
        scan_name: &str,
        handle: &str,
        boundary: &Boundary,
        run_at: DateTime<Utc>,
    ) -> Result<(), SkywatchError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO scan_state
                 (scan_name, handle, last_boundary_created_at, last_boundary_uri, last_run_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                scan_name,
                handle,
                boundary.created_at.to_rfc3339(),
                boundary.uri,
                run_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Update only `last_run_at`. A no-op for scans that have never committed
    /// a boundary.
    pub fn touch_run(&self, scan_name: &str, run_at: DateTime<Utc>) -> Result<(), SkywatchError> {
        self.conn.execute(
            "UPDATE scan_state SET last_run_at = ?2 WHERE scan_name = ?1",
            params![scan_name, run_at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Delete one scan's state, or every scan's. Returns rows deleted.
    pub fn reset(&self, scan_name: Option<&str>) -> Result<usize, SkywatchError> {
        let deleted = match scan_name {
            Some(name) => self
                .conn
                .execute("DELETE FROM scan_state WHERE scan_name = ?1", params![name])?,
            None => self.conn.execute("DELETE FROM scan_state", [])?,
        };
        Ok(deleted)
    }

    pub fn list(&self, scan_name: Option<&str>) -> Result<Vec<ScanState>, SkywatchError> {
        match scan_name {
            Some(name) => Ok(self.get(name)?.into_iter().collect()),
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT scan_name, handle, last_boundary_created_at, last_boundary_uri, last_run_at
                     FROM scan_state ORDER BY scan_name",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?;
                let mut states = Vec::new();
                for row in rows {
                    let (scan_name, handle, boundary_ts, boundary_uri, run_at) = row?;
                    states.push(ScanState {
                        scan_name,
                        handle,
                        last_boundary_created_at: parse_ts(&boundary_ts)?,
                        last_boundary_uri: boundary_uri,
                        last_run_at: run_at.as_deref().map(parse_ts).transpose()?,
                    });
                }
                Ok(states)
            }
        }
    }
}
