//! Persistence of completed inspections.

use async_trait::async_trait;
use chrono::{DateTime, Local};
use schema::{DetectionRecord, InspectionOutcome, InspectionResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InspectionId(pub u64);

impl fmt::Display for InspectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode store record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Unknown inspection id {0}")]
    UnknownInspection(InspectionId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Destination for completed inspections: the outcome row first, then its detections.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn insert_inspection(&self, outcome: &InspectionOutcome)
    -> Result<InspectionId, StoreError>;

    async fn insert_detections(
        &self,
        id: InspectionId,
        detections: &[DetectionRecord],
    ) -> Result<(), StoreError>;
}

/// An inspection row as a store keeps it, detections held separately.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredInspection {
    pub id: InspectionId,
    pub line: String,
    pub timestamp: DateTime<Local>,
    pub result: InspectionResult,
    pub reason: String,
    pub top_path: Option<PathBuf>,
    pub side_path: Option<PathBuf>,
}

impl StoredInspection {
    fn from_outcome(id: InspectionId, outcome: &InspectionOutcome) -> Self {
        Self {
            id,
            line: outcome.line.clone(),
            timestamp: outcome.timestamp,
            result: outcome.result,
            reason: outcome.reason.clone(),
            top_path: outcome.top_path.clone(),
            side_path: outcome.side_path.clone(),
        }
    }
}

/// Rows a [`MemoryStore`] keeps before evicting the oldest inspection.
pub const DEFAULT_MEMORY_CAPACITY: usize = 2000;

#[derive(Debug)]
struct MemoryRow {
    inspection: StoredInspection,
    detections: Vec<DetectionRecord>,
}

#[derive(Debug, Default)]
struct Tables {
    rows: VecDeque<MemoryRow>,
    last_id: u64,
}

/// In-process store bounded to the most recent inspections. Ids start at 1 and
/// keep counting after eviction.
#[derive(Debug)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn inspections(&self) -> Vec<StoredInspection> {
        self.lock()
            .rows
            .iter()
            .map(|row| row.inspection.clone())
            .collect()
    }

    pub fn detections(&self, id: InspectionId) -> Vec<DetectionRecord> {
        self.lock()
            .rows
            .iter()
            .find(|row| row.inspection.id == id)
            .map(|row| row.detections.clone())
            .unwrap_or_default()
    }

    pub fn detection_count(&self) -> usize {
        self.lock().rows.iter().map(|row| row.detections.len()).sum()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn insert_inspection(
        &self,
        outcome: &InspectionOutcome,
    ) -> Result<InspectionId, StoreError> {
        let mut tables = self.lock();
        tables.last_id += 1;
        let id = InspectionId(tables.last_id);
        tables.rows.push_back(MemoryRow {
            inspection: StoredInspection::from_outcome(id, outcome),
            detections: Vec::new(),
        });
        while tables.rows.len() > self.capacity {
            tables.rows.pop_front();
        }
        Ok(id)
    }

    async fn insert_detections(
        &self,
        id: InspectionId,
        detections: &[DetectionRecord],
    ) -> Result<(), StoreError> {
        let mut tables = self.lock();
        let row = tables
            .rows
            .iter_mut()
            .find(|row| row.inspection.id == id)
            .ok_or(StoreError::UnknownInspection(id))?;
        row.detections.extend_from_slice(detections);
        Ok(())
    }
}

/// One line of a JSON-lines result log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JsonlRecord {
    Inspection {
        id: InspectionId,
        line: String,
        #[serde(with = "schema::timestamp")]
        timestamp: DateTime<Local>,
        result: InspectionResult,
        reason: String,
        top_path: Option<PathBuf>,
        side_path: Option<PathBuf>,
    },
    Detections {
        id: InspectionId,
        detections: Vec<DetectionRecord>,
    },
}

/// Append-only JSON-lines file. Reopening continues after the highest id on disk.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    next_id: AtomicU64,
}

impl JsonlStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let last_id = Self::last_id(&path).await.map_err(io_err)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;

        tracing::info!(path = %path.display(), last_id, "Result log opened");

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            next_id: AtomicU64::new(last_id + 1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn last_id(path: &Path) -> io::Result<u64> {
        let file = match File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut lines = BufReader::new(file).lines();
        let mut last = 0;
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonlRecord>(&line) {
                Ok(JsonlRecord::Inspection { id, .. }) => last = last.max(id.0),
                Ok(JsonlRecord::Detections { .. }) => {}
                Err(e) => {
                    tracing::warn!(line = line_no, error = %e, "Skipping unreadable result log line")
                }
            }
        }
        Ok(last)
    }

    async fn append(&self, record: &JsonlRecord) -> Result<(), StoreError> {
        let mut bytes = serde_json::to_vec(record)?;
        bytes.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: self.path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

#[async_trait]
impl ResultStore for JsonlStore {
    async fn insert_inspection(
        &self,
        outcome: &InspectionOutcome,
    ) -> Result<InspectionId, StoreError> {
        let id = InspectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.append(&JsonlRecord::Inspection {
            id,
            line: outcome.line.clone(),
            timestamp: outcome.timestamp,
            result: outcome.result,
            reason: outcome.reason.clone(),
            top_path: outcome.top_path.clone(),
            side_path: outcome.side_path.clone(),
        })
        .await?;
        Ok(id)
    }

    async fn insert_detections(
        &self,
        id: InspectionId,
        detections: &[DetectionRecord],
    ) -> Result<(), StoreError> {
        self.append(&JsonlRecord::Detections {
            id,
            detections: detections.to_vec(),
        })
        .await
    }
}
