#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-engine** – The controller every external entry point calls.
//!
//! The [`Engine`] drives the whole token lifecycle: cloning a blueprint into
//! an isolated instance, guarded checkout with transactional locking, submit
//! with atomic versioning and routing, failure reporting down the Ate Path,
//! role-scoped memory (harvest, context injection, retrieval), the pilot
//! override surface, and the sweeper operations the background runtime
//! schedules.
//!
//! Former singletons are constructor dependencies: the engine owns `Arc`s to
//! the two stores, the telemetry buffer, the broadcaster and the model
//! router, and composes its own [`GuardContext`] implementation
//! ([`context::EngineGuardContext`]) over them.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use tessera_bus::{EventBroadcaster, TelemetryBuffer};
use tessera_guard::{GuardError, ModelRouter};
use tessera_store::{BlueprintStore, InstanceStore, StoreError, UowRepository};

pub mod context;
pub mod controller;
pub mod memory;
pub mod pilot;
pub mod sweeper;

pub use context::{EngineGuardContext, PilotDesk};
pub use controller::{Checkout, ChildSpec};
pub use pilot::{KillSwitchReport, PilotInterface};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The blueprint to instantiate does not exist.
    #[error("template workflow {0} not found")]
    TemplateNotFound(Uuid),

    /// The blueprint violates a topology invariant.
    #[error("invalid blueprint: {0}")]
    InvalidBlueprint(String),

    /// Instantiation failed and was rolled back.
    #[error("failed to instantiate workflow: {0}")]
    InstantiationFailed(String),

    /// The actor holds no ACTIVE assignment for the role.
    #[error("actor {actor_id} is not authorized for role {role_id}")]
    NotAuthorized {
        /// The refused actor.
        actor_id: Uuid,
        /// The role they tried to assume.
        role_id: Uuid,
    },

    /// The UOW is not checked out (or is locked by someone else).
    #[error("UOW {uow_id} is not locked by this actor (status: {status})")]
    NotLocked {
        /// The UOW concerned.
        uow_id: Uuid,
        /// Its observed status.
        status: String,
    },

    /// Checkout aborted on an unexpected failure.
    #[error("failed to checkout work: {0}")]
    CheckoutFailed(String),

    /// A pilot action was applied to a UOW in the wrong state.
    #[error("invalid pilot action: {0}")]
    InvalidPilotAction(String),

    /// Persistence-layer failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Guard-evaluation failure that could not be absorbed.
    #[error(transparent)]
    Guard(#[from] GuardError),
}

impl EngineError {
    /// Whether this maps to the not-found family (HTTP 404).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::TemplateNotFound(_) => true,
            Self::Store(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Crate-wide result alias.
pub type EngineResult<T> = Result<T, EngineError>;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Tunables for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a high-risk save waits for the pilot before treating the
    /// request as rejected.
    pub pilot_timeout: Duration,
    /// Interaction budget stamped onto newly created base UOWs. `None`
    /// leaves them unbounded.
    pub default_max_interactions: Option<i64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pilot_timeout: Duration::from_secs(300),
            default_max_interactions: None,
        }
    }
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// The core engine controller.
pub struct Engine {
    blueprints: Arc<BlueprintStore>,
    store: Arc<InstanceStore>,
    repository: UowRepository,
    telemetry: Arc<TelemetryBuffer>,
    broadcaster: Arc<dyn EventBroadcaster>,
    router: ModelRouter,
    guard_ctx: Arc<EngineGuardContext>,
    config: EngineConfig,
}

impl Engine {
    /// Compose an engine from its collaborators.
    pub fn new(
        blueprints: Arc<BlueprintStore>,
        store: Arc<InstanceStore>,
        telemetry: Arc<TelemetryBuffer>,
        broadcaster: Arc<dyn EventBroadcaster>,
        router: ModelRouter,
        config: EngineConfig,
    ) -> Self {
        let repository =
            UowRepository::new(&store).with_pilot_timeout(config.pilot_timeout);
        let guard_ctx = Arc::new(EngineGuardContext::new(
            store.clone(),
            telemetry.clone(),
            broadcaster.clone(),
        ));
        Self {
            blueprints,
            store,
            repository,
            telemetry,
            broadcaster,
            router,
            guard_ctx,
            config,
        }
    }

    /// The blueprint store.
    pub fn blueprints(&self) -> &Arc<BlueprintStore> {
        &self.blueprints
    }

    /// The instance store.
    pub fn store(&self) -> &Arc<InstanceStore> {
        &self.store
    }

    /// The UOW repository.
    pub fn repository(&self) -> &UowRepository {
        &self.repository
    }

    /// The telemetry buffer.
    pub fn telemetry(&self) -> &Arc<TelemetryBuffer> {
        &self.telemetry
    }

    /// The broadcaster.
    pub fn broadcaster(&self) -> &Arc<dyn EventBroadcaster> {
        &self.broadcaster
    }

    /// The model router.
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// The engine's guard context (authorization + pilot desk).
    pub fn guard_context(&self) -> &Arc<EngineGuardContext> {
        &self.guard_ctx
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The pilot override surface.
    pub fn pilot(&self) -> PilotInterface {
        PilotInterface::new(
            self.repository.clone(),
            self.broadcaster.clone(),
            self.guard_ctx.clone(),
        )
    }

    /// Broadcast an event, logging and swallowing failures: the audit stream
    /// never takes the data plane down.
    pub(crate) async fn emit_event(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(error) = self.broadcaster.emit(event_type, payload).await {
            tracing::warn!(event_type, %error, "broadcast failed");
        }
    }
}
