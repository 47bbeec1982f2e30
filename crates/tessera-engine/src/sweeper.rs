//! Sweeper operations: zombie reclaim, memory decay and the toxic filter.
//!
//! These are plain engine operations; the background runtime schedules them
//! on fixed periods, and the admin endpoints trigger them on demand.

use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use tessera_bus::TelemetryEntry;
use tessera_store::repository::StateUpdate;
use tessera_types::{LogKind, RoleKind, UowStatus, SYSTEM_ACTOR_ID};

use crate::{Engine, EngineResult};

impl Engine {
    /// Reclaim stalled tokens: every ACTIVE UOW whose heartbeat went stale
    /// past `threshold` is marked FAILED, stamped with a `_zombie` attribute
    /// and moved to the Tau inbound queue when the workflow defines one.
    /// Rows that never heartbeat are exempt. Returns the reclaimed count.
    pub async fn run_zombie_protocol(&self, threshold: Duration) -> EngineResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let zombies = self.repository().find_zombies(cutoff).await?;

        let mut reclaimed = 0u64;
        for zombie in zombies {
            let tau_queue = self
                .store()
                .inbound_interaction_for_kind(zombie.workflow_id, RoleKind::Tau)
                .await?;

            let mut update = StateUpdate::to(UowStatus::Failed)
                .set(
                    "_zombie",
                    json!({
                        "reclaimed_at": Utc::now().to_rfc3339(),
                        "stale_heartbeat": zombie.last_heartbeat.map(|t| t.to_rfc3339()),
                    }),
                )
                .because("Heartbeat expired, token reclaimed")
                .administrative()
                .clearing_heartbeat();
            if let Some(tau_queue) = tau_queue {
                update = update.move_to(tau_queue);
            }
            self.repository()
                .update_state(zombie.uow_id, update, self.guard_context().as_ref())
                .await?;

            self.record_telemetry(TelemetryEntry {
                instance_id: zombie.instance_id,
                uow_id: zombie.uow_id,
                actor_id: SYSTEM_ACTOR_ID,
                role_id: Uuid::nil(),
                interaction_id: zombie.current_interaction_id,
                log_type: LogKind::StateTransition,
                event_details: Some(json!({ "event": "zombie_reclaimed" })),
                error_metadata: None,
                timestamp: Utc::now(),
            });
            reclaimed += 1;
        }

        if reclaimed > 0 {
            self.emit_event(
                "zombie_protocol_completed",
                json!({ "reclaimed": reclaimed }),
            )
            .await;
            tracing::info!(reclaimed, "zombie protocol reclaimed stalled tokens");
        }
        Ok(reclaimed)
    }

    /// Prune stale role memory: delete every record whose last access is
    /// older than `retention`. Never-accessed records are exempt. Returns
    /// the deleted count.
    pub async fn run_memory_decay(&self, retention: Duration) -> EngineResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::days(90));
        let deleted = self.store().delete_stale_memories(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "memory decay pruned stale records");
        }
        Ok(deleted)
    }

    /// Flag a memory record as toxic: it survives on disk but disappears
    /// from every retrieval until explicitly un-flagged.
    pub async fn mark_memory_toxic(&self, memory_id: Uuid, reason: &str) -> EngineResult<()> {
        self.store().mark_memory_toxic(memory_id).await?;
        self.emit_event(
            "memory_marked_toxic",
            json!({
                "memory_id": memory_id.to_string(),
                "reason": reason,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        Ok(())
    }
}
