#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-store** – Two-tier persistence for the Tessera workflow engine.
//!
//! Storage is split into two physically isolated SQLite databases: the
//! blueprint tier (read-only at runtime, written by the importer) and the
//! instance tier (the mutable runtime world). The crate exposes a narrow
//! repository contract shared by every other component:
//!
//! - [`BlueprintStore`] / [`InstanceStore`] – schema management and entity
//!   queries per tier;
//! - [`UowRepository`] – atomic UOW save with content hashing, versioned
//!   attributes and the append-only history ledger;
//! - [`GuardContext`] – the authorization/pilot capability consulted before
//!   every mutation;
//! - [`state_hash`] – the deterministic SHA-256 content-hash protocol.
//!
//! No business logic lives here: guard evaluation, routing and learning are
//! the engine's concern.

use thiserror::Error;
use uuid::Uuid;

pub mod blueprint;
pub mod guard_context;
pub mod instance;
pub mod repository;
pub mod state_hash;

pub use blueprint::{BlueprintBundle, BlueprintStore};
pub use guard_context::{GuardContext, PilotDecision, SystemGuardContext};
pub use instance::InstanceStore;
pub use repository::{
    HashVerification, HeartbeatAction, PilotCheckOutcome, StateUpdate, UowRecord, UowRepository,
    UowSpec,
};

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Errors produced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Entity family (uow, role, memory, ...).
        entity: &'static str,
        /// The missing id.
        id: Uuid,
    },

    /// A creation spec is missing required fields.
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// The guard context refused the mutation.
    #[error("guard refused mutation of UOW {uow_id}")]
    GuardUnauthorized {
        /// The UOW concerned.
        uow_id: Uuid,
        /// The refused actor, if any.
        actor_id: Option<Uuid>,
    },

    /// The stored content hash no longer matches the live attribute set.
    #[error("state drift on UOW {uow_id}: stored {stored}, computed {computed}")]
    StateDrift {
        /// The UOW concerned.
        uow_id: Uuid,
        /// The recorded hash.
        stored: String,
        /// The recomputed hash.
        computed: String,
    },

    /// A storage-boundary string failed to parse into its vocabulary.
    #[error(transparent)]
    Vocabulary(#[from] tessera_types::EnumParseError),

    /// A JSON column failed to round-trip.
    #[error("column deserialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// The underlying database failed.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Shorthand for a missing entity.
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether this error is the not-found family (maps to HTTP 404).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Crate-wide result alias.
pub type StoreResult<T> = Result<T, StoreError>;
