#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-types** – Shared primitive data structures for Tessera.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the status vocabularies, the blueprint- and instance-tier
//! entities, and the violation packet emitted by guard checks. It makes no
//! assumptions about I/O, hashing, or storage.

use std::collections::BTreeMap;

use uuid::Uuid;

pub mod blueprint;
pub mod enums;
pub mod instance;
pub mod violation;

pub use blueprint::{ComponentDef, GuardianDef, InteractionDef, RoleDef, WorkflowDef};
pub use enums::{
    ActorKind, AssignmentStatus, ComponentDirection, DecompositionStrategy, EnumParseError,
    GuardKind, HistoryEventType, InstanceStatus, LogKind, MemoryScope, RoleKind, Severity,
    UowStatus,
};
pub use instance::{
    Actor, Component, Guardian, InstanceContext, Interaction, InteractionLogRecord, MemoryRecord,
    MutationAuditEntry, Role, RoleAssignment, Uow, UowAttribute, UowHistoryRecord, Workflow,
};
pub use violation::ViolationPacket;

//─────────────────────────────
//  Well-known identifiers
//─────────────────────────────

/// Actor id used for every system-initiated mutation (instantiation,
/// guard rejection routing, zombie reclaim). Fixed so that automated
/// operations carry a consistent identity across instances.
pub const SYSTEM_ACTOR_ID: Uuid = Uuid::from_u128(1);

//─────────────────────────────
//  Attribute maps
//─────────────────────────────

/// The current attribute set of a UOW, keyed by attribute name.
///
/// A `BTreeMap` keeps keys lexicographically sorted by construction, which is
/// what the content-hash protocol requires: the same attribute set always
/// serializes to the same canonical JSON irrespective of insertion order.
pub type AttrMap = BTreeMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_actor_id_is_stable() {
        assert_eq!(
            SYSTEM_ACTOR_ID.to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
    }

    #[test]
    fn attr_map_keys_are_sorted() {
        let mut attrs = AttrMap::new();
        attrs.insert("zeta".into(), serde_json::json!(1));
        attrs.insert("alpha".into(), serde_json::json!(2));
        let keys: Vec<_> = attrs.keys().cloned().collect();
        assert_eq!(keys, vec!["alpha", "zeta"]);
    }
}
