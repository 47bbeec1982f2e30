//! Blueprint-tier entities.
//!
//! Blueprints are immutable at runtime: the importer writes them once, the
//! engine only ever reads them while cloning into an instance. Entities are
//! plain data; relationships are explicit ids resolved by store queries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enums::{ComponentDirection, DecompositionStrategy, GuardKind, RoleKind};

/// A workflow definition: the template every instance is cloned from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDef {
    /// Unique identifier.
    pub workflow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// Semantic notes injected into actor context (opaque JSON).
    pub ai_context: Option<serde_json::Value>,
    /// Monotonic template version.
    pub version: i64,
}

/// A logical node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
    /// Unique identifier.
    pub role_id: Uuid,
    /// Parent workflow.
    pub workflow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
    /// Semantic notes for actors assuming this role.
    pub ai_context: Option<serde_json::Value>,
    /// Functional classification.
    pub kind: RoleKind,
    /// Required for Beta roles; how they split work.
    pub strategy: Option<DecompositionStrategy>,
    /// Recursive gateway reference; recorded but never expanded at clone time.
    pub child_workflow_id: Option<Uuid>,
}

/// A queue between roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionDef {
    /// Unique identifier.
    pub interaction_id: Uuid,
    /// Parent workflow.
    pub workflow_id: Uuid,
    /// Display name.
    pub name: String,
    /// Human description.
    pub description: Option<String>,
}

/// A directed edge joining a role and an interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDef {
    /// Unique identifier.
    pub component_id: Uuid,
    /// Parent workflow.
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

/// A gate attached to a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianDef {
    /// Unique identifier.
    pub guardian_id: Uuid,
    /// Parent workflow.
    pub workflow_id: Uuid,
    /// The edge being guarded.
    pub component_id: Uuid,
    /// Display name.
    pub name: String,
    /// Logic class.
    pub kind: GuardKind,
    /// Opaque runtime configuration (criteria, rules, policies).
    pub config: serde_json::Value,
}
