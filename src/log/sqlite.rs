use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::time::Duration;

use super::{DetectionLogRecord, DetectionLogStore, Inserted};
use crate::pipeline::SourceType;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_COLUMNS: &str = "id, profile, source_type, subject_id, file_name, message, \
     target_present, confidence_score, detections_json, result_image, frames_sampled, \
     degraded, created_at";

/// Unique in-memory database URI shared by every connection opened with it.
pub fn shared_memory_uri() -> String {
    format!(
        "file:firewatch_{}?mode=memory&cache=shared",
        uuid::Uuid::new_v4().simple()
    )
}

pub fn open_db_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?
    } else {
        Connection::open(db_path).with_context(|| format!("open database {}", db_path))?
    };
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

pub struct SqliteDetectionLogStore {
    conn: Connection,
}

impl SqliteDetectionLogStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detection_logs (
              id TEXT PRIMARY KEY,
              profile TEXT NOT NULL,
              source_type TEXT NOT NULL,
              subject_id TEXT,
              file_name TEXT,
              message TEXT NOT NULL,
              target_present INTEGER NOT NULL,
              confidence_score REAL NOT NULL,
              detections_json TEXT NOT NULL,
              result_image TEXT,
              frames_sampled INTEGER NOT NULL,
              degraded INTEGER NOT NULL DEFAULT 0,
              created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detection_logs_created ON detection_logs(created_at);
            "#,
        )?;
        Ok(())
    }
}

impl DetectionLogStore for SqliteDetectionLogStore {
    fn insert(&mut self, record: &DetectionLogRecord) -> Result<Inserted> {
        let detections_json = serde_json::to_string(&record.detections)?;
        let changed = self.conn.execute(
            "INSERT INTO detection_logs (id, profile, source_type, subject_id, file_name, message, \
             target_present, confidence_score, detections_json, result_image, frames_sampled, \
             degraded, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
             ON CONFLICT(id) DO NOTHING",
            params![
                record.id,
                record.profile,
                record.source_type.as_str(),
                record.subject_id,
                record.file_name,
                record.message,
                record.target_present,
                f64::from(record.confidence_score),
                detections_json,
                record.result_image,
                i64::try_from(record.frames_sampled)?,
                record.degraded,
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(if changed == 0 {
            Inserted::Duplicate
        } else {
            Inserted::Created
        })
    }

    fn fetch(&mut self, id: &str) -> Result<Option<DetectionLogRecord>> {
        let sql = format!("SELECT {} FROM detection_logs WHERE id = ?1", SELECT_COLUMNS);
        let raw = self
            .conn
            .query_row(&sql, params![id], RawRecord::from_row)
            .optional()?;
        raw.map(RawRecord::into_record).transpose()
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<DetectionLogRecord>> {
        let sql = format!(
            "SELECT {} FROM detection_logs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![i64::try_from(limit)?], RawRecord::from_row)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(raw?.into_record()?);
        }
        Ok(out)
    }
}

/// Column values as stored, before JSON and timestamp parsing.
struct RawRecord {
    id: String,
    profile: String,
    source_type: String,
    subject_id: Option<String>,
    file_name: Option<String>,
    message: String,
    target_present: bool,
    confidence_score: f64,
    detections_json: String,
    result_image: Option<String>,
    frames_sampled: i64,
    degraded: bool,
    created_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            profile: row.get(1)?,
            source_type: row.get(2)?,
            subject_id: row.get(3)?,
            file_name: row.get(4)?,
            message: row.get(5)?,
            target_present: row.get(6)?,
            confidence_score: row.get(7)?,
            detections_json: row.get(8)?,
            result_image: row.get(9)?,
            frames_sampled: row.get(10)?,
            degraded: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_record(self) -> Result<DetectionLogRecord> {
        let source_type = SourceType::parse(&self.source_type)
            .ok_or_else(|| anyhow!("unknown source type '{}'", self.source_type))?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .with_context(|| format!("parse created_at of {}", self.id))?
            .with_timezone(&Utc);
        Ok(DetectionLogRecord {
            detections: serde_json::from_str(&self.detections_json)
                .with_context(|| format!("parse detections of {}", self.id))?,
            id: self.id,
            profile: self.profile,
            source_type,
            subject_id: self.subject_id,
            file_name: self.file_name,
            message: self.message,
            target_present: self.target_present,
            confidence_score: self.confidence_score as f32,
            result_image: self.result_image,
            frames_sampled: u64::try_from(self.frames_sampled)?,
            degraded: self.degraded,
            created_at,
        })
    }
}
