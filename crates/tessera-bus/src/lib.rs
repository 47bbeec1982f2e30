#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-bus** – Telemetry buffering and event broadcast for Tessera.
//!
//! Two independent channels leave the engine:
//!
//! - the [`TelemetryBuffer`]: a bounded, non-blocking FIFO of
//!   [`TelemetryEntry`] records (interaction metadata, shadow-captured
//!   errors, guard decisions). The runtime drains it periodically into the
//!   interaction-log table;
//! - the [`EventBroadcaster`] contract: a single append-only `emit`
//!   operation. The default [`FileBroadcaster`] writes one JSON object per
//!   line; [`MemoryBroadcaster`] fans out over a tokio broadcast channel for
//!   tests and live subscribers.
//!
//! Neither channel may block or fail the data plane: `record` reports
//! backpressure by returning `false`, and callers log-and-swallow broadcast
//! failures.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use tessera_types::{InteractionLogRecord, LogKind};

//─────────────────────────────
//  Telemetry entries
//─────────────────────────────

/// A telemetry event waiting to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEntry {
    /// Owning instance.
    pub instance_id: Uuid,
    /// The UOW concerned.
    pub uow_id: Uuid,
    /// The acting identity (the nil UUID when unknown).
    pub actor_id: Uuid,
    /// The role context.
    pub role_id: Uuid,
    /// The interaction context.
    pub interaction_id: Uuid,
    /// Entry category.
    pub log_type: LogKind,
    /// Structured event details.
    pub event_details: Option<serde_json::Value>,
    /// Error context for shadow-captured failures.
    pub error_metadata: Option<serde_json::Value>,
    /// Capture timestamp.
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEntry {
    /// Convert into the interaction-log row shape for persistence.
    pub fn into_log_record(self) -> InteractionLogRecord {
        InteractionLogRecord {
            log_id: Uuid::new_v4(),
            instance_id: self.instance_id,
            uow_id: self.uow_id,
            actor_id: self.actor_id,
            role_id: self.role_id,
            interaction_id: self.interaction_id,
            log_type: self.log_type,
            event_details: self.event_details,
            error_metadata: self.error_metadata,
            timestamp: self.timestamp,
        }
    }
}

//─────────────────────────────
//  Telemetry buffer
//─────────────────────────────

/// Default bound on queued entries.
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Bounded, non-blocking FIFO for telemetry entries.
///
/// `record` never blocks: a full queue reports backpressure by returning
/// `false` and the entry is dropped. Draining preserves FIFO order.
#[derive(Debug)]
pub struct TelemetryBuffer {
    queue: Mutex<VecDeque<TelemetryEntry>>,
    capacity: usize,
}

impl Default for TelemetryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}

impl TelemetryBuffer {
    /// Create a buffer bounded at `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Record an entry. Returns `false` under backpressure (queue full).
    pub fn record(&self, entry: TelemetryEntry) -> bool {
        let mut queue = self.queue.lock().expect("telemetry buffer poisoned");
        if queue.len() >= self.capacity {
            return false;
        }
        queue.push_back(entry);
        true
    }

    /// Number of entries awaiting flush.
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("telemetry buffer poisoned").len()
    }

    /// Remove and return up to `max` entries in FIFO order.
    pub fn drain(&self, max: usize) -> Vec<TelemetryEntry> {
        let mut queue = self.queue.lock().expect("telemetry buffer poisoned");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }
}

//─────────────────────────────
//  Broadcaster contract
//─────────────────────────────

/// Errors raised by broadcaster implementations.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// The backing sink refused the event.
    #[error("failed to emit event: {0}")]
    EmitFailed(String),
}

/// Append-only event publisher for the audit trail.
///
/// Implementations must be thread-safe and append-only; swapping the
/// backend (file, stream, fan-out) never touches engine code.
#[async_trait]
pub trait EventBroadcaster: Send + Sync {
    /// Publish an event to the observation stream.
    async fn emit(&self, event_type: &str, payload: serde_json::Value)
        -> Result<(), BroadcastError>;
}

/// A broadcast event as seen by subscribers and in the JSONL file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Emission timestamp.
    pub timestamp: DateTime<Utc>,
    /// Event classification string.
    pub event_type: String,
    /// Opaque event payload.
    pub payload: serde_json::Value,
}

//─────────────────────────────
//  File implementation (JSON lines)
//─────────────────────────────

/// Append-only JSON-lines event log: one object per line, shape
/// `{timestamp, event_type, payload}`.
#[derive(Debug, Clone)]
pub struct FileBroadcaster {
    log_path: PathBuf,
}

impl FileBroadcaster {
    /// Create a broadcaster appending to `log_path`, creating parent
    /// directories as needed.
    pub fn new<P: AsRef<Path>>(log_path: P) -> std::io::Result<Self> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { log_path })
    }

    /// The path being appended to.
    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

#[async_trait]
impl EventBroadcaster for FileBroadcaster {
    async fn emit(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), BroadcastError> {
        let event = BroadcastEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            payload,
        };
        let line = serde_json::to_string(&event)
            .map_err(|e| BroadcastError::EmitFailed(e.to_string()))?;

        let path = self.log_path.clone();
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")
        })
        .await
        .map_err(|e| BroadcastError::EmitFailed(e.to_string()))?
        .map_err(|e: std::io::Error| BroadcastError::EmitFailed(e.to_string()))?;

        tracing::debug!(event_type, "event emitted");
        Ok(())
    }
}

//─────────────────────────────
//  In-memory implementation
//─────────────────────────────

/// Tokio-broadcast fan-out backend; events reach every live subscriber.
/// Slow subscribers may miss events if the ring buffer overflows.
#[derive(Debug, Clone)]
pub struct MemoryBroadcaster {
    tx: broadcast::Sender<BroadcastEvent>,
}

impl Default for MemoryBroadcaster {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MemoryBroadcaster {
    /// Create a broadcaster with the given ring-buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to the live event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }

    /// Current number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl EventBroadcaster for MemoryBroadcaster {
    async fn emit(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<(), BroadcastError> {
        let event = BroadcastEvent {
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            payload,
        };
        // No subscribers is not an error; events are fire-and-forget.
        let _ = self.tx.send(event);
        Ok(())
    }
}
