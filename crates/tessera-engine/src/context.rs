//! The engine's [`GuardContext`] implementation and the pilot desk.
//!
//! Authorization is assignment-based: the system actor always passes, any
//! other actor must hold at least one ACTIVE role assignment. Violations go
//! out on the broadcaster and into the telemetry buffer. High-risk saves
//! block on the [`PilotDesk`], an in-process pending-approval map answered by
//! the pilot interface; an unanswered request times out as a rejection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use tessera_bus::{EventBroadcaster, TelemetryBuffer, TelemetryEntry};
use tessera_store::{GuardContext, InstanceStore, PilotDecision};
use tessera_types::{LogKind, ViolationPacket, SYSTEM_ACTOR_ID};

//─────────────────────────────
//  Pilot desk
//─────────────────────────────

/// In-process pending-approval map for high-risk transitions.
///
/// `wait` parks a request under the UOW id; `resolve` (called by the pilot
/// interface) answers it. Unanswered requests expire as rejections.
#[derive(Debug, Default)]
pub struct PilotDesk {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<PilotDecision>>>,
}

impl PilotDesk {
    /// Create an empty desk.
    pub fn new() -> Self {
        Self::default()
    }

    /// UOW ids currently awaiting a pilot decision.
    pub fn pending(&self) -> Vec<Uuid> {
        self.pending
            .lock()
            .expect("pilot desk poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Park a request and wait for the pilot, up to `timeout`.
    pub async fn wait(&self, uow_id: Uuid, timeout: Duration) -> PilotDecision {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pilot desk poisoned");
            // A newer request for the same UOW supersedes the old one, which
            // resolves as rejected when its sender drops.
            pending.insert(uow_id, tx);
        }

        let decision = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => PilotDecision::rejected("pilot request superseded"),
            Err(_) => PilotDecision::rejected("pilot approval timed out"),
        };

        self.pending
            .lock()
            .expect("pilot desk poisoned")
            .remove(&uow_id);
        decision
    }

    /// Answer a parked request. Returns whether one was waiting.
    pub fn resolve(&self, uow_id: Uuid, decision: PilotDecision) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("pilot desk poisoned")
            .remove(&uow_id);
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }
}

//─────────────────────────────
//  Guard context
//─────────────────────────────

/// Production guard context: assignment-based authorization, violation
/// emission over the broadcaster + telemetry buffer, pilot consultation via
/// the desk.
pub struct EngineGuardContext {
    store: Arc<InstanceStore>,
    telemetry: Arc<TelemetryBuffer>,
    broadcaster: Arc<dyn EventBroadcaster>,
    desk: PilotDesk,
}

impl EngineGuardContext {
    /// Compose a context over the engine's collaborators.
    pub fn new(
        store: Arc<InstanceStore>,
        telemetry: Arc<TelemetryBuffer>,
        broadcaster: Arc<dyn EventBroadcaster>,
    ) -> Self {
        Self {
            store,
            telemetry,
            broadcaster,
            desk: PilotDesk::new(),
        }
    }

    /// The pending-approval desk.
    pub fn desk(&self) -> &PilotDesk {
        &self.desk
    }
}

#[async_trait]
impl GuardContext for EngineGuardContext {
    async fn is_authorized(&self, actor_id: Option<Uuid>, _uow_id: Uuid) -> bool {
        let Some(actor_id) = actor_id else {
            return true;
        };
        if actor_id == SYSTEM_ACTOR_ID {
            return true;
        }
        match self.store.has_any_active_assignment(actor_id).await {
            Ok(authorized) => authorized,
            Err(error) => {
                // Fail closed on storage trouble.
                tracing::error!(%actor_id, %error, "authorization lookup failed");
                false
            }
        }
    }

    async fn wait_for_pilot(
        &self,
        uow_id: Uuid,
        reason: &str,
        timeout: Duration,
    ) -> PilotDecision {
        if let Err(error) = self
            .broadcaster
            .emit(
                "intervention_request",
                serde_json::json!({
                    "uow_id": uow_id.to_string(),
                    "reason": reason,
                    "timeout_seconds": timeout.as_secs(),
                    "timestamp": Utc::now().to_rfc3339(),
                }),
            )
            .await
        {
            tracing::warn!(%uow_id, %error, "failed to broadcast intervention request");
        }
        self.desk.wait(uow_id, timeout).await
    }

    async fn emit_violation(&self, packet: ViolationPacket) {
        if let Err(error) = self.broadcaster.emit("violation", packet.to_json()).await {
            tracing::warn!(rule = %packet.rule_id, %error, "failed to broadcast violation");
        }
        let recorded = self.telemetry.record(TelemetryEntry {
            instance_id: Uuid::nil(),
            uow_id: packet.uow_id.unwrap_or_else(Uuid::nil),
            actor_id: Uuid::nil(),
            role_id: Uuid::nil(),
            interaction_id: Uuid::nil(),
            log_type: LogKind::Error,
            event_details: None,
            error_metadata: Some(packet.to_json()),
            timestamp: Utc::now(),
        });
        if !recorded {
            tracing::warn!(rule = %packet.rule_id, "telemetry buffer full, violation dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn desk_resolves_parked_requests() {
        let desk = Arc::new(PilotDesk::new());
        let uow_id = Uuid::new_v4();

        let waiter = {
            let desk = desk.clone();
            tokio::spawn(async move { desk.wait(uow_id, Duration::from_secs(5)).await })
        };

        // Let the waiter park itself.
        tokio::task::yield_now().await;
        for _ in 0..50 {
            if !desk.pending().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(desk.pending(), vec![uow_id]);

        assert!(desk.resolve(uow_id, PilotDecision::approved()));
        let decision = waiter.await.unwrap();
        assert!(decision.approved);
        assert!(desk.pending().is_empty());
    }

    #[tokio::test]
    async fn desk_times_out_as_rejection() {
        let desk = PilotDesk::new();
        let decision = desk.wait(Uuid::new_v4(), Duration::from_millis(20)).await;
        assert!(!decision.approved);
        assert!(!decision.waiver_issued);
        assert!(decision.rejection_reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn resolving_an_unknown_request_reports_false() {
        let desk = PilotDesk::new();
        assert!(!desk.resolve(Uuid::new_v4(), PilotDecision::approved()));
    }
}
