//! Detection log.
//!
//! Every completed request produces exactly one `DetectionLogRecord`. Records are
//! insert-only: there is no update path and nothing here deletes them. The record
//! id is the same id returned to the client.

mod sqlite;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::detect::Detection;
use crate::error::PipelineError;
use crate::pipeline::{PipelineResult, Provenance, SourceType};

pub use sqlite::{open_db_connection, shared_memory_uri, SqliteDetectionLogStore};

/// Durable projection of a pipeline result plus provenance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionLogRecord {
    pub id: String,
    pub profile: String,
    pub source_type: SourceType,
    pub subject_id: Option<String>,
    pub file_name: Option<String>,
    pub message: String,
    pub target_present: bool,
    pub confidence_score: f32,
    pub detections: Vec<Detection>,
    pub result_image: Option<String>,
    pub frames_sampled: u64,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
}

impl DetectionLogRecord {
    pub fn from_result(result: &PipelineResult, provenance: &Provenance) -> Self {
        Self {
            id: result.id.clone(),
            profile: provenance.profile.clone(),
            source_type: provenance.source_type,
            subject_id: provenance.subject_id.clone(),
            file_name: provenance.file_name.clone(),
            message: result.message.clone(),
            target_present: result.target_present,
            confidence_score: result.max_confidence,
            detections: result.detections.clone(),
            result_image: result.artifact_ref.clone(),
            frames_sampled: result.frames_sampled,
            degraded: result.degraded,
            created_at: result.created_at,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inserted {
    Created,
    /// A record with the same id already exists; nothing was written.
    Duplicate,
}

/// Record store with single-row atomic inserts.
pub trait DetectionLogStore: Send {
    fn insert(&mut self, record: &DetectionLogRecord) -> Result<Inserted>;

    fn fetch(&mut self, id: &str) -> Result<Option<DetectionLogRecord>>;

    /// Most recent records first.
    fn recent(&mut self, limit: usize) -> Result<Vec<DetectionLogRecord>>;
}

/// Builds and persists log records. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct DetectionLogWriter {
    store: Arc<Mutex<dyn DetectionLogStore>>,
}

impl DetectionLogWriter {
    pub fn new<S: DetectionLogStore + 'static>(store: S) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Write the record for a completed request. Exactly one insert.
    pub fn write(
        &self,
        result: &PipelineResult,
        provenance: &Provenance,
    ) -> Result<DetectionLogRecord, PipelineError> {
        let record = DetectionLogRecord::from_result(result, provenance);
        let outcome = self
            .with_store(|store| store.insert(&record))
            .map_err(|source| PipelineError::LogWrite {
                id: record.id.clone(),
                source,
            })?;
        match outcome {
            Inserted::Created => {
                log::info!(
                    "detection log {} written (profile={}, source={}, target={}, confidence={:.3})",
                    record.id,
                    record.profile,
                    record.source_type,
                    record.target_present,
                    record.confidence_score
                );
                Ok(record)
            }
            Inserted::Duplicate => Err(PipelineError::DuplicateLog(record.id)),
        }
    }

    pub fn fetch(&self, id: &str) -> Result<Option<DetectionLogRecord>> {
        self.with_store(|store| store.fetch(id))
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<DetectionLogRecord>> {
        self.with_store(|store| store.recent(limit))
    }

    fn with_store<T>(
        &self,
        f: impl FnOnce(&mut dyn DetectionLogStore) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .store
            .lock()
            .map_err(|_| anyhow!("detection log store lock poisoned"))?;
        f(&mut *guard)
    }
}

/// Volatile store for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionLogStore {
    order: Vec<String>,
    records: HashMap<String, DetectionLogRecord>,
}

impl InMemoryDetectionLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DetectionLogStore for InMemoryDetectionLogStore {
    fn insert(&mut self, record: &DetectionLogRecord) -> Result<Inserted> {
        if self.records.contains_key(&record.id) {
            return Ok(Inserted::Duplicate);
        }
        self.order.push(record.id.clone());
        self.records.insert(record.id.clone(), record.clone());
        Ok(Inserted::Created)
    }

    fn fetch(&mut self, id: &str) -> Result<Option<DetectionLogRecord>> {
        Ok(self.records.get(id).cloned())
    }

    fn recent(&mut self, limit: usize) -> Result<Vec<DetectionLogRecord>> {
        Ok(self
            .order
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.records.get(id).cloned())
            .collect())
    }
}
