//! The pilot interface: human-in-the-loop overrides.
//!
//! Every pilot action is administrative: it never counts against a token's
//! interaction budget, always lands in history, and always goes out on the
//! broadcaster. Actions that answer a blocked high-risk save also resolve
//! the pending request on the pilot desk.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use tessera_bus::EventBroadcaster;
use tessera_store::repository::StateUpdate;
use tessera_store::{GuardContext, PilotDecision, UowRepository};
use tessera_types::{HistoryEventType, UowStatus};

use crate::context::EngineGuardContext;
use crate::{EngineError, EngineResult};

/// Outcome of a kill-switch sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSwitchReport {
    /// Number of UOWs moved to PAUSED.
    pub paused_uows: u64,
}

/// Human override surface over the repository and broadcaster.
pub struct PilotInterface {
    repository: UowRepository,
    broadcaster: Arc<dyn EventBroadcaster>,
    guard_ctx: Arc<EngineGuardContext>,
}

impl PilotInterface {
    pub(crate) fn new(
        repository: UowRepository,
        broadcaster: Arc<dyn EventBroadcaster>,
        guard_ctx: Arc<EngineGuardContext>,
    ) -> Self {
        Self {
            repository,
            broadcaster,
            guard_ctx,
        }
    }

    async fn emit(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(error) = self.broadcaster.emit(event_type, payload).await {
            tracing::warn!(event_type, %error, "pilot broadcast failed");
        }
    }

    fn guard(&self) -> &dyn GuardContext {
        self.guard_ctx.as_ref()
    }

    /// Emergency pause: every ACTIVE UOW in the instance moves to PAUSED
    /// with the reason in its audit payload.
    pub async fn kill_switch(
        &self,
        instance_id: Uuid,
        reason: &str,
        pilot_id: &str,
    ) -> EngineResult<KillSwitchReport> {
        let active = self
            .repository
            .find_by_status(UowStatus::Active, Some(instance_id))
            .await?;

        let mut paused = 0u64;
        for uow in active {
            self.repository
                .update_state(
                    uow.uow_id,
                    StateUpdate::to(UowStatus::Paused)
                        .set("kill_switch_reason", json!(reason))
                        .set("triggered_by", json!(pilot_id))
                        .because("Kill switch activated")
                        .administrative()
                        .keeping_heartbeat(),
                    self.guard(),
                )
                .await?;
            paused += 1;
            tracing::info!(uow_id = %uow.uow_id, pilot_id, "kill switch paused UOW");
        }

        self.emit(
            "kill_switch_activated",
            json!({
                "instance_id": instance_id.to_string(),
                "paused_uows": paused,
                "reason": reason,
                "triggered_by": pilot_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;

        Ok(KillSwitchReport { paused_uows: paused })
    }

    /// Inject human guidance into a soft-stalled token, reset its
    /// interaction budget and set it running again.
    pub async fn submit_clarification(
        &self,
        uow_id: Uuid,
        text: &str,
        pilot_id: &str,
    ) -> EngineResult<()> {
        let record = self.repository.get(uow_id).await?;
        if record.uow.status != UowStatus::ZombiedSoft {
            return Err(EngineError::InvalidPilotAction(format!(
                "can only clarify ZOMBIED_SOFT UOWs, current status: {}",
                record.uow.status
            )));
        }

        self.repository
            .update_state(
                uow_id,
                StateUpdate::to(UowStatus::Active)
                    .set("pilot_clarification", json!(text))
                    .set("clarification_from", json!(pilot_id))
                    .set("clarification_at", json!(Utc::now().to_rfc3339()))
                    .because("Pilot clarification injected")
                    .administrative()
                    .resetting_interaction_count(),
                self.guard(),
            )
            .await?;

        self.emit(
            "pilot_clarification_submitted",
            json!({
                "uow_id": uow_id.to_string(),
                "clarification": text,
                "submitted_by": pilot_id,
                "new_status": UowStatus::Active.as_str(),
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        Ok(())
    }

    /// Constitutional waiver: override a rule with a mandatory written
    /// justification, then set the blocked token running.
    pub async fn waive_violation(
        &self,
        uow_id: Uuid,
        guard_rule_id: &str,
        reason: &str,
        pilot_id: &str,
    ) -> EngineResult<()> {
        if reason.trim().is_empty() {
            return Err(EngineError::InvalidPilotAction(
                "waiver reason cannot be empty; justification is mandatory for pilot overrides"
                    .to_string(),
            ));
        }

        let record = self.repository.get(uow_id).await?;
        let previous_status = record.uow.status;

        self.repository
            .append_history(
                uow_id,
                HistoryEventType::ConstitutionalWaiver,
                json!({
                    "rule_ignored": guard_rule_id,
                    "waived_by": pilot_id,
                    "justification": reason,
                    "timestamp": Utc::now().to_rfc3339(),
                }),
                &record.uow.content_hash,
            )
            .await?;

        self.repository
            .update_state(
                uow_id,
                StateUpdate::to(UowStatus::Active)
                    .set("waiver_applied", json!(true))
                    .set("waived_rule", json!(guard_rule_id))
                    .set("waived_by", json!(pilot_id))
                    .set("waiver_timestamp", json!(Utc::now().to_rfc3339()))
                    .because("Constitutional waiver granted")
                    .administrative(),
                self.guard(),
            )
            .await?;

        // A blocked high-risk save waiting on the desk gets its answer.
        self.guard_ctx
            .desk()
            .resolve(uow_id, PilotDecision::waived(reason));

        self.emit(
            "pilot_waiver_granted",
            json!({
                "uow_id": uow_id.to_string(),
                "rule": guard_rule_id,
                "previous_status": previous_status.as_str(),
                "new_status": UowStatus::Active.as_str(),
                "pilot": pilot_id,
                "justification": reason,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;

        tracing::info!(%uow_id, guard_rule_id, pilot_id, "constitutional waiver granted");
        Ok(())
    }

    /// Approve a blocked high-risk transition: PENDING_PILOT_APPROVAL goes
    /// back to ACTIVE.
    pub async fn resume_uow(&self, uow_id: Uuid, pilot_id: &str) -> EngineResult<()> {
        let record = self.repository.get(uow_id).await?;
        if record.uow.status != UowStatus::PendingPilotApproval {
            return Err(EngineError::InvalidPilotAction(format!(
                "can only resume PENDING_PILOT_APPROVAL UOWs, current status: {}",
                record.uow.status
            )));
        }

        self.repository
            .update_state(
                uow_id,
                StateUpdate::to(UowStatus::Active)
                    .set("approved_by", json!(pilot_id))
                    .set("approval_timestamp", json!(Utc::now().to_rfc3339()))
                    .because("Pilot approval granted")
                    .administrative(),
                self.guard(),
            )
            .await?;

        self.guard_ctx
            .desk()
            .resolve(uow_id, PilotDecision::approved());

        self.emit(
            "pilot_approval_granted",
            json!({
                "uow_id": uow_id.to_string(),
                "approved_by": pilot_id,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        Ok(())
    }

    /// Reject a blocked high-risk transition: PENDING_PILOT_APPROVAL goes to
    /// FAILED with the cancellation reason on record.
    pub async fn cancel_uow(
        &self,
        uow_id: Uuid,
        pilot_id: &str,
        reason: &str,
    ) -> EngineResult<()> {
        let record = self.repository.get(uow_id).await?;
        if record.uow.status != UowStatus::PendingPilotApproval {
            return Err(EngineError::InvalidPilotAction(format!(
                "can only cancel PENDING_PILOT_APPROVAL UOWs, current status: {}",
                record.uow.status
            )));
        }

        self.repository
            .update_state(
                uow_id,
                StateUpdate::to(UowStatus::Failed)
                    .set("cancelled_by", json!(pilot_id))
                    .set("cancellation_reason", json!(reason))
                    .set("cancellation_timestamp", json!(Utc::now().to_rfc3339()))
                    .because("Pilot cancellation issued")
                    .administrative()
                    .clearing_heartbeat(),
                self.guard(),
            )
            .await?;

        self.guard_ctx
            .desk()
            .resolve(uow_id, PilotDecision::rejected(reason));

        self.emit(
            "pilot_cancellation_issued",
            json!({
                "uow_id": uow_id.to_string(),
                "cancelled_by": pilot_id,
                "reason": reason,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        Ok(())
    }
}
