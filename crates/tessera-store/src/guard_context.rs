//! The guard-context capability consulted before every state mutation.
//!
//! The repository never decides authorization or pilot policy itself; it asks
//! the injected [`GuardContext`]. The engine supplies the production
//! implementation (assignment-based authorization plus the pilot desk);
//! [`SystemGuardContext`] is the permissive implementation used by internal
//! maintenance paths and tests.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use tessera_types::ViolationPacket;

/// Outcome of a pilot consultation on a high-risk transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PilotDecision {
    /// The pilot approved the transition.
    pub approved: bool,
    /// The pilot issued a constitutional waiver instead of a plain approval.
    pub waiver_issued: bool,
    /// Justification attached to the waiver.
    pub waiver_reason: Option<String>,
    /// Why the pilot rejected the transition.
    pub rejection_reason: Option<String>,
}

impl PilotDecision {
    /// Plain approval.
    pub fn approved() -> Self {
        Self {
            approved: true,
            ..Self::default()
        }
    }

    /// Rejection with a reason.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            rejection_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Waiver with mandatory justification.
    pub fn waived(reason: impl Into<String>) -> Self {
        Self {
            waiver_issued: true,
            waiver_reason: Some(reason.into()),
            ..Self::default()
        }
    }
}

/// Capability injected into every mutating repository call.
///
/// No transition occurs without this context authorizing it; refusals are
/// always accompanied by a violation packet on the broadcaster.
#[async_trait]
pub trait GuardContext: Send + Sync {
    /// May `actor_id` modify `uow_id`? `None` is the system actor.
    async fn is_authorized(&self, actor_id: Option<Uuid>, uow_id: Uuid) -> bool;

    /// Block until the pilot decides on a high-risk transition, or until the
    /// timeout expires (treated as rejection by callers).
    async fn wait_for_pilot(&self, uow_id: Uuid, reason: &str, timeout: Duration) -> PilotDecision;

    /// Report a detected breach to monitoring.
    async fn emit_violation(&self, packet: ViolationPacket);
}

/// Permissive context for system-initiated mutations: everything is
/// authorized, pilot checks auto-approve, violations go to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemGuardContext;

#[async_trait]
impl GuardContext for SystemGuardContext {
    async fn is_authorized(&self, _actor_id: Option<Uuid>, _uow_id: Uuid) -> bool {
        true
    }

    async fn wait_for_pilot(
        &self,
        _uow_id: Uuid,
        _reason: &str,
        _timeout: Duration,
    ) -> PilotDecision {
        PilotDecision::approved()
    }

    async fn emit_violation(&self, packet: ViolationPacket) {
        tracing::warn!(rule = %packet.rule_id, "violation emitted without broadcaster");
    }
}
