//! Instance-tier entities.
//!
//! Everything here is scoped by `instance_id`, the isolation root. The shapes
//! mirror the blueprint tier plus the mutable runtime state: token location
//! and status, versioned attributes, heartbeats, counters, memory records and
//! the append-only history ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enums::{
    ActorKind, AssignmentStatus, ComponentDirection, DecompositionStrategy, GuardKind,
    InstanceStatus, LogKind, MemoryScope, RoleKind, UowStatus,
};

/// The isolation root: one row per running clone of a blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceContext {
    /// Unique identifier; scopes every other instance-tier row.
    pub instance_id: Uuid,
    /// Display name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// Deployment health.
    pub status: InstanceStatus,
    /// Deployment timestamp.
    pub deployed_at: DateTime<Utc>,
}

/// The cloned workflow inside an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier of the clone.
    pub workflow_id: Uuid,
    /// Owning instance.
    pub instance_id: Uuid,
    /// Traceability link back to the blueprint workflow.
    pub blueprint_workflow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// Semantic notes carried over from the blueprint.
    pub ai_context: Option<serde_json::Value>,
    /// Blueprint version at clone time.
    pub version: i64,
}

/// A cloned role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Unique identifier.
    pub role_id: Uuid,
    /// Parent cloned workflow.
    pub workflow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// Semantic notes for actors assuming this role.
    pub ai_context: Option<serde_json::Value>,
    /// Functional classification.
    pub kind: RoleKind,
    /// Beta decomposition strategy.
    pub strategy: Option<DecompositionStrategy>,
    /// Recursive gateway reference, recorded without expansion.
    pub gateway_workflow_id: Option<Uuid>,
}

/// A cloned queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    /// Unique identifier.
    pub interaction_id: Uuid,
    /// Parent cloned workflow.
    pub workflow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
}

/// A cloned edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Unique identifier.
    pub component_id: Uuid,
    /// Parent cloned workflow.
    pub workflow_id: Uuid,
    /// The queue end of the edge.
    pub interaction_id: Uuid,
    /// The role end of the edge.
    pub role_id: Uuid,
    /// Flow direction relative to the role.
    pub direction: ComponentDirection,
    /// Display name.
    pub name: String,
}

/// A cloned gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guardian {
    /// Unique identifier.
    pub guardian_id: Uuid,
    /// Parent cloned workflow.
    pub workflow_id: Uuid,
    /// The edge being guarded.
    pub component_id: Uuid,
    /// Display name.
    pub name: String,
    /// Logic class.
    pub kind: GuardKind,
    /// Opaque runtime configuration.
    pub config: serde_json::Value,
}

/// An identity authorized to operate within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    /// Unique identifier within the instance.
    pub actor_id: Uuid,
    /// Owning instance.
    pub instance_id: Uuid,
    /// External reference (email, agent id, "SYSTEM").
    pub identity_key: String,
    /// Display name.
    pub name: String,
    /// Kind of actor.
    pub kind: ActorKind,
    /// Tools and skills the actor possesses (opaque JSON).
    pub capabilities: Option<serde_json::Value>,
}

/// Authorizes an actor to check out work for a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// Unique identifier.
    pub assignment_id: Uuid,
    /// The actor.
    pub actor_id: Uuid,
    /// The role they may assume.
    pub role_id: Uuid,
    /// Assignment lifecycle.
    pub status: AssignmentStatus,
}

/// A role-scoped memory record: shared blueprint or personal playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Unique identifier.
    pub memory_id: Uuid,
    /// Owning instance.
    pub instance_id: Uuid,
    /// The role context this memory applies to.
    pub role_id: Uuid,
    /// Scope discriminator.
    pub scope: MemoryScope,
    /// Literal `GLOBAL`, or the actor id string for personal playbooks.
    pub context_id: String,
    /// Retrieval key.
    pub key: String,
    /// The stored knowledge.
    pub value: serde_json::Value,
    /// Confidence level, 0-100.
    pub confidence: i64,
    /// Excluded from every retrieval while set; never deleted by the flag.
    pub is_toxic: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Touched on every retrieval; drives decay. `None` is exempt from decay.
    pub last_accessed_at: Option<DateTime<Utc>>,
}

/// One entry of a conditional-injector mutation audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationAuditEntry {
    /// Guard that produced the mutation.
    pub guard_name: String,
    /// The matching rule condition.
    pub condition: String,
    /// Effective model override, if the payload carried one.
    pub model_override: Option<String>,
    /// Whether the whitelist rejected the requested model.
    pub failover_used: bool,
    /// The substituted model when failover was used.
    pub failover_model: Option<String>,
    /// When the mutation was applied.
    pub timestamp: DateTime<Utc>,
}

/// The atomic token moving through the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uow {
    /// Unique identifier.
    pub uow_id: Uuid,
    /// Owning instance.
    pub instance_id: Uuid,
    /// The cloned workflow this token traverses.
    pub workflow_id: Uuid,
    /// Link to the base UOW when this is a child.
    pub parent_id: Option<Uuid>,
    /// Physical location of the token.
    pub current_interaction_id: Uuid,
    /// Current lifecycle state.
    pub status: UowStatus,
    /// Total children generated (Cerberus bookkeeping).
    pub child_count: i64,
    /// Total children completed (Cerberus bookkeeping).
    pub finished_child_count: i64,
    /// Last liveness signal from the locking actor; cleared on release.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Actor holding the checkout lock while `status` is ACTIVE.
    pub locked_by: Option<Uuid>,
    /// SHA-256 of the current attribute set (canonical JSON, hex).
    pub content_hash: String,
    /// Number of counted interactions so far.
    pub interaction_count: i64,
    /// Interaction budget; reaching it soft-stalls the token. `None` = no limit.
    pub max_interactions: Option<i64>,
    /// Retries attempted for soft-stall recovery.
    pub retry_count: i64,
    /// Immutable routing-policy snapshot taken at creation.
    pub interaction_policy: Option<serde_json::Value>,
    /// Effective model id after conditional injection.
    pub model_id: Option<String>,
    /// Instructions accumulated by conditional injectors.
    pub injected_instructions: Option<String>,
    /// Knowledge fragment references unioned by conditional injectors.
    pub knowledge_fragment_refs: Vec<String>,
    /// Audit trail of every applied injector mutation.
    pub mutation_audit_log: Vec<MutationAuditEntry>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One versioned payload cell. Mutations append rows; the current value of a
/// key is the maximum-version row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UowAttribute {
    /// Unique identifier.
    pub attribute_id: Uuid,
    /// Owning UOW.
    pub uow_id: Uuid,
    /// Owning instance.
    pub instance_id: Uuid,
    /// Attribute key.
    pub key: String,
    /// Attribute value.
    pub value: serde_json::Value,
    /// Strictly monotonic per `(uow_id, key)`, starting at 1.
    pub version: i64,
    /// The actor responsible for this version.
    pub actor_id: Uuid,
    /// Why this version was written.
    pub reasoning: Option<String>,
    /// Write timestamp.
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only state-transition ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UowHistoryRecord {
    /// Unique identifier.
    pub history_id: Uuid,
    /// Owning instance.
    pub instance_id: Uuid,
    /// The UOW this entry tracks.
    pub uow_id: Uuid,
    /// Event classification (UOW_CREATED, STATE_TRANSITION, ...).
    pub event_type: String,
    /// Status before the transition.
    pub previous_status: Option<String>,
    /// Status after the transition.
    pub new_status: Option<String>,
    /// Content hash before the transition; empty for the first entry.
    pub previous_state_hash: String,
    /// Content hash after the transition.
    pub new_state_hash: String,
    /// Interaction before the transition.
    pub previous_interaction_id: Option<Uuid>,
    /// Interaction after the transition.
    pub new_interaction_id: Option<Uuid>,
    /// The actor responsible.
    pub actor_id: Option<Uuid>,
    /// Why the transition happened.
    pub reasoning: Option<String>,
    /// Opaque event payload.
    pub payload: Option<serde_json::Value>,
    /// Transition timestamp.
    pub transition_at: DateTime<Utc>,
}

/// One row of the interaction log (token movement, telemetry, shadow errors).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionLogRecord {
    /// Unique identifier.
    pub log_id: Uuid,
    /// Owning instance.
    pub instance_id: Uuid,
    /// The UOW concerned.
    pub uow_id: Uuid,
    /// The acting identity.
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
    /// Entry timestamp.
    pub timestamp: DateTime<Utc>,
}
