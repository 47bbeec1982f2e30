//! The UOW repository: atomic saves with content hashing, versioned
//! attributes and the append-only history ledger.
//!
//! Every mutating call takes a [`GuardContext`]; no transition occurs without
//! its authorization. The checkout lock is a compare-and-swap on `status`
//! inside [`UowRepository::checkout_lock`]: exactly one concurrent caller
//! wins the `PENDING → ACTIVE` transition for a given row.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use tessera_types::{
    AttrMap, HistoryEventType, MutationAuditEntry, Severity, Uow, UowHistoryRecord, UowStatus,
    ViolationPacket, SYSTEM_ACTOR_ID,
};

use crate::blueprint::{parse_json_column, parse_uuid};
use crate::guard_context::GuardContext;
use crate::instance::{parse_optional_timestamp, parse_timestamp, InstanceStore};
use crate::state_hash;
use crate::{StoreError, StoreResult};

/// Default pilot consultation timeout for high-risk saves.
pub const DEFAULT_PILOT_TIMEOUT: Duration = Duration::from_secs(300);

/// Statuses that require a pilot check by default.
pub const DEFAULT_HIGH_RISK: [UowStatus; 2] = [UowStatus::Completed, UowStatus::Failed];

//─────────────────────────────
//  Inputs and outputs
//─────────────────────────────

/// Creation spec for a new UOW.
#[derive(Debug, Clone)]
pub struct UowSpec {
    /// Explicit id; generated when absent.
    pub uow_id: Option<Uuid>,
    /// Owning instance (required).
    pub instance_id: Uuid,
    /// Cloned workflow the token traverses (required).
    pub workflow_id: Uuid,
    /// Base UOW when this is a child.
    pub parent_id: Option<Uuid>,
    /// Starting queue (required).
    pub current_interaction_id: Uuid,
    /// Initial attribute set, written as version-1 rows.
    pub attributes: AttrMap,
    /// Author of the initial attributes.
    pub attribute_author: Uuid,
    /// Reasoning recorded on every initial attribute row.
    pub attribute_reasoning: String,
    /// Immutable routing-policy snapshot.
    pub interaction_policy: Option<serde_json::Value>,
    /// Interaction budget.
    pub max_interactions: Option<i64>,
}

impl UowSpec {
    /// Minimal spec with system authorship.
    pub fn new(instance_id: Uuid, workflow_id: Uuid, current_interaction_id: Uuid) -> Self {
        Self {
            uow_id: None,
            instance_id,
            workflow_id,
            parent_id: None,
            current_interaction_id,
            attributes: AttrMap::new(),
            attribute_author: SYSTEM_ACTOR_ID,
            attribute_reasoning: "Initial workflow context".to_string(),
            interaction_policy: None,
            max_interactions: None,
        }
    }
}

/// A UOW row together with its current (latest-version) attribute map.
#[derive(Debug, Clone, PartialEq)]
pub struct UowRecord {
    /// The row.
    pub uow: Uow,
    /// Latest-version value per key.
    pub attributes: AttrMap,
}

/// What to do with the heartbeat during a state update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatAction {
    /// Stamp the current time (default: a save is a liveness signal).
    #[default]
    Touch,
    /// Release it (submit, failure, zombie reclaim).
    Clear,
    /// Leave the stored value untouched.
    Keep,
}

/// Parameters of one atomic state update.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    /// Target status.
    pub new_status: UowStatus,
    /// Attributes to merge (appended as new versioned rows when changed).
    pub payload: AttrMap,
    /// Responsible actor; `None` is the system actor.
    pub actor_id: Option<Uuid>,
    /// Why this update happened.
    pub reasoning: Option<String>,
    /// Move the token to this queue.
    pub new_interaction_id: Option<Uuid>,
    /// Count this update against the interaction budget.
    pub auto_increment: bool,
    /// Heartbeat handling.
    pub heartbeat: HeartbeatAction,
    /// Extra payload merged into the history event.
    pub event_payload: Option<serde_json::Value>,
    /// Reset the interaction counter (pilot clarification).
    pub reset_interaction_count: bool,
    /// Ignored: the policy snapshot is immutable after creation. A `Some`
    /// here is logged and dropped.
    pub interaction_policy: Option<serde_json::Value>,
}

impl StateUpdate {
    /// Start an update targeting `status` with defaults: empty payload,
    /// system authorship, counted interaction, heartbeat touch.
    pub fn to(status: UowStatus) -> Self {
        Self {
            new_status: status,
            payload: AttrMap::new(),
            actor_id: None,
            reasoning: None,
            new_interaction_id: None,
            auto_increment: true,
            heartbeat: HeartbeatAction::Touch,
            event_payload: None,
            reset_interaction_count: false,
            interaction_policy: None,
        }
    }

    /// Merge these attributes.
    pub fn with_payload(mut self, payload: AttrMap) -> Self {
        self.payload = payload;
        self
    }

    /// Add one attribute to the payload.
    pub fn set(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Attribute authorship and history attribution.
    pub fn by(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    /// Reasoning for the transition and the attribute rows.
    pub fn because(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Move the token to another queue.
    pub fn move_to(mut self, interaction_id: Uuid) -> Self {
        self.new_interaction_id = Some(interaction_id);
        self
    }

    /// Administrative update: does not count against the interaction budget.
    pub fn administrative(mut self) -> Self {
        self.auto_increment = false;
        self
    }

    /// Release the heartbeat with this update.
    pub fn clearing_heartbeat(mut self) -> Self {
        self.heartbeat = HeartbeatAction::Clear;
        self
    }

    /// Leave the stored heartbeat untouched.
    pub fn keeping_heartbeat(mut self) -> Self {
        self.heartbeat = HeartbeatAction::Keep;
        self
    }

    /// Attach extra history event payload.
    pub fn with_event_payload(mut self, payload: serde_json::Value) -> Self {
        self.event_payload = Some(payload);
        self
    }

    /// Reset the interaction counter to zero (breaks the ambiguity lock).
    pub fn resetting_interaction_count(mut self) -> Self {
        self.reset_interaction_count = true;
        self
    }
}

/// Outcome of the checkout compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// This caller won the `PENDING → ACTIVE` transition.
    Locked,
    /// Another caller got there first (or the row left PENDING).
    Lost,
    /// The lock landed on the interaction budget; the row is now
    /// soft-stalled awaiting pilot clarification.
    Stalled,
}

/// Outcome of a pilot-checked save.
#[derive(Debug, Clone)]
pub struct PilotCheckOutcome {
    /// Whether the save went through.
    pub success: bool,
    /// The pilot explicitly approved.
    pub pilot_approved: bool,
    /// A constitutional waiver was issued instead of an approval.
    pub waiver_issued: bool,
    /// Why the save was blocked (`PILOT_APPROVAL_REQUIRED`).
    pub blocked_by: Option<String>,
    /// The saved record on success.
    pub record: Option<UowRecord>,
}

/// Result of recomputing a stored content hash.
#[derive(Debug, Clone)]
pub struct HashVerification {
    /// Whether the stored hash matches the live attribute set.
    pub is_valid: bool,
    /// The recorded hash.
    pub stored_hash: String,
    /// The recomputed hash.
    pub computed_hash: String,
    /// The packet emitted when drift was detected and emission requested.
    pub violation: Option<ViolationPacket>,
}

/// Conditional-injector mutation to persist onto a UOW.
#[derive(Debug, Clone)]
pub struct InjectionUpdate {
    /// Effective model id, when overridden.
    pub model_id: Option<String>,
    /// Instructions to append.
    pub instructions: Option<String>,
    /// Fragment refs to union in.
    pub knowledge_fragments: Vec<String>,
    /// Audit entry for the mutation log.
    pub audit: MutationAuditEntry,
}

//─────────────────────────────
//  Repository
//─────────────────────────────

/// Atomic persistence operations for units of work.
#[derive(Debug, Clone)]
pub struct UowRepository {
    pool: SqlitePool,
    pilot_timeout: Duration,
}

impl UowRepository {
    /// Build a repository over the instance store's pool.
    pub fn new(store: &InstanceStore) -> Self {
        Self {
            pool: store.pool().clone(),
            pilot_timeout: DEFAULT_PILOT_TIMEOUT,
        }
    }

    /// Override the pilot consultation timeout.
    pub fn with_pilot_timeout(mut self, timeout: Duration) -> Self {
        self.pilot_timeout = timeout;
        self
    }

    /// Insert a PENDING UOW with its initial attributes, compute the initial
    /// content hash and record `UOW_CREATED`.
    pub async fn create(&self, spec: UowSpec) -> StoreResult<Uuid> {
        let mut tx = self.pool.begin().await?;
        let uow_id = self.create_in(tx.as_mut(), spec).await?;
        tx.commit().await?;
        Ok(uow_id)
    }

    /// Like [`UowRepository::create`], inside a caller-owned transaction.
    /// Used by instantiation so the topology clone and the Alpha UOW commit
    /// atomically.
    pub async fn create_in(
        &self,
        conn: &mut SqliteConnection,
        spec: UowSpec,
    ) -> StoreResult<Uuid> {
        validate_spec(&spec)?;
        let uow_id = spec.uow_id.unwrap_or_else(Uuid::new_v4);
        self.insert_uow_tx(conn, uow_id, &spec).await?;
        Ok(uow_id)
    }

    /// Create a child UOW and bump the parent's `child_count` in the same
    /// transaction (Cerberus bookkeeping).
    pub async fn register_child(&self, parent_id: Uuid, mut spec: UowSpec) -> StoreResult<Uuid> {
        spec.parent_id = Some(parent_id);
        validate_spec(&spec)?;
        let uow_id = spec.uow_id.unwrap_or_else(Uuid::new_v4);

        let mut tx = self.pool.begin().await?;
        let parent = sqlx::query("SELECT uow_id FROM units_of_work WHERE uow_id = ?")
            .bind(parent_id.to_string())
            .fetch_optional(tx.as_mut())
            .await?;
        if parent.is_none() {
            return Err(StoreError::not_found("uow", parent_id));
        }

        self.insert_uow_tx(tx.as_mut(), uow_id, &spec).await?;
        sqlx::query("UPDATE units_of_work SET child_count = child_count + 1 WHERE uow_id = ?")
            .bind(parent_id.to_string())
            .execute(tx.as_mut())
            .await?;
        tx.commit().await?;
        Ok(uow_id)
    }

    /// Count a completed child on its parent. Refuses to break the
    /// `finished_child_count <= child_count` invariant.
    pub async fn record_child_finished(&self, parent_id: Uuid) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT child_count, finished_child_count FROM units_of_work WHERE uow_id = ?",
        )
        .bind(parent_id.to_string())
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| StoreError::not_found("uow", parent_id))?;

        let child_count: i64 = row.try_get("child_count")?;
        let finished: i64 = row.try_get("finished_child_count")?;
        if finished >= child_count {
            return Err(StoreError::InvalidSpec(format!(
                "finished_child_count would exceed child_count on UOW {parent_id}"
            )));
        }

        sqlx::query(
            "UPDATE units_of_work SET finished_child_count = finished_child_count + 1 \
             WHERE uow_id = ?",
        )
        .bind(parent_id.to_string())
        .execute(tx.as_mut())
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Fetch the full UOW record including its current attribute map.
    pub async fn get(&self, uow_id: Uuid) -> StoreResult<UowRecord> {
        let row = sqlx::query("SELECT * FROM units_of_work WHERE uow_id = ?")
            .bind(uow_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("uow", uow_id))?;
        let uow = row_to_uow(&row)?;
        let attributes = self.current_attributes(uow_id).await?;
        Ok(UowRecord { uow, attributes })
    }

    /// Latest-version value per key.
    pub async fn current_attributes(&self, uow_id: Uuid) -> StoreResult<AttrMap> {
        let rows = sqlx::query(
            "SELECT key, value FROM uow_attributes WHERE uow_id = ? ORDER BY version ASC",
        )
        .bind(uow_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        let mut attributes = AttrMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: serde_json::Value =
                serde_json::from_str(row.try_get::<String, _>("value")?.as_str())?;
            attributes.insert(key, value);
        }
        Ok(attributes)
    }

    /// Atomic state update: merge payload, recompute hash, stamp heartbeat,
    /// append the `STATE_TRANSITION` history row.
    ///
    /// When an auto-incremented interaction count reaches `max_interactions`
    /// and the target status is PENDING or ACTIVE, the row lands in
    /// `ZOMBIED_SOFT` instead, awaiting pilot clarification.
    pub async fn update_state(
        &self,
        uow_id: Uuid,
        update: StateUpdate,
        guard: &dyn GuardContext,
    ) -> StoreResult<UowRecord> {
        self.authorize(update.actor_id, uow_id, &update, guard).await?;

        if update.interaction_policy.is_some() {
            tracing::warn!(
                %uow_id,
                "attempt to modify immutable interaction_policy ignored"
            );
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM units_of_work WHERE uow_id = ?")
            .bind(uow_id.to_string())
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or_else(|| StoreError::not_found("uow", uow_id))?;
        let uow = row_to_uow(&row)?;

        // Merge payload into the versioned attribute set.
        let (mut attributes, versions) =
            load_attributes_tx(tx.as_mut(), uow_id).await?;
        let author = update.actor_id.unwrap_or(SYSTEM_ACTOR_ID);
        for (key, value) in &update.payload {
            let changed = attributes.get(key) != Some(value);
            if changed {
                let version = versions.get(key).copied().unwrap_or(0) + 1;
                insert_attribute_tx(
                    tx.as_mut(),
                    uow_id,
                    uow.instance_id,
                    key,
                    value,
                    version,
                    author,
                    update.reasoning.as_deref(),
                    now,
                )
                .await?;
                attributes.insert(key.clone(), value.clone());
            }
        }

        let previous_hash = uow.content_hash.clone();
        let new_hash = state_hash::content_hash(Some(&attributes));

        // Interaction budget and the ambiguity lock.
        let mut interaction_count = uow.interaction_count;
        let mut effective_status = update.new_status;
        if update.reset_interaction_count {
            interaction_count = 0;
        } else if update.auto_increment {
            interaction_count += 1;
            if let Some(max) = uow.max_interactions {
                if interaction_count >= max
                    && matches!(effective_status, UowStatus::Pending | UowStatus::Active)
                {
                    interaction_count = interaction_count.min(max);
                    effective_status = UowStatus::ZombiedSoft;
                }
            }
        }

        let heartbeat = match update.heartbeat {
            HeartbeatAction::Touch => Some(now),
            HeartbeatAction::Clear => None,
            HeartbeatAction::Keep => uow.last_heartbeat,
        };
        let new_interaction = update.new_interaction_id.unwrap_or(uow.current_interaction_id);
        let locked_by = if effective_status == UowStatus::Active {
            uow.locked_by
        } else {
            None
        };

        sqlx::query(
            "UPDATE units_of_work SET status = ?, current_interaction_id = ?, content_hash = ?, \
             last_heartbeat = ?, locked_by = ?, interaction_count = ? WHERE uow_id = ?",
        )
        .bind(effective_status.as_str())
        .bind(new_interaction.to_string())
        .bind(&new_hash)
        .bind(heartbeat.map(|t| t.to_rfc3339()))
        .bind(locked_by.map(|id| id.to_string()))
        .bind(interaction_count)
        .bind(uow_id.to_string())
        .execute(tx.as_mut())
        .await?;

        insert_history_tx(
            tx.as_mut(),
            HistoryRow {
                instance_id: uow.instance_id,
                uow_id,
                event_type: HistoryEventType::StateTransition,
                previous_status: Some(uow.status),
                new_status: Some(effective_status),
                previous_state_hash: previous_hash,
                new_state_hash: new_hash,
                previous_interaction_id: Some(uow.current_interaction_id),
                new_interaction_id: Some(new_interaction),
                actor_id: update.actor_id,
                reasoning: update.reasoning.clone(),
                payload: update.event_payload.clone(),
                transition_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        self.get(uow_id).await
    }

    /// Strictly additive history append for non-transition events (waivers,
    /// pilot overrides). Existing rows are never updated or deleted.
    pub async fn append_history(
        &self,
        uow_id: Uuid,
        event_type: HistoryEventType,
        payload: serde_json::Value,
        previous_hash: &str,
    ) -> StoreResult<()> {
        let row = sqlx::query("SELECT * FROM units_of_work WHERE uow_id = ?")
            .bind(uow_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("uow", uow_id))?;
        let uow = row_to_uow(&row)?;

        let mut tx = self.pool.begin().await?;
        insert_history_tx(
            tx.as_mut(),
            HistoryRow {
                instance_id: uow.instance_id,
                uow_id,
                event_type,
                previous_status: None,
                new_status: None,
                previous_state_hash: previous_hash.to_string(),
                // A pure event does not move state; the chain continues from
                // the stored hash.
                new_state_hash: uow.content_hash,
                previous_interaction_id: None,
                new_interaction_id: None,
                actor_id: None,
                reasoning: None,
                payload: Some(payload),
                transition_at: Utc::now(),
            },
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Pilot-checked save: high-risk target statuses require the pilot's
    /// approval (or a waiver) before the update is applied.
    pub async fn save_with_pilot_check(
        &self,
        uow_id: Uuid,
        mut update: StateUpdate,
        guard: &dyn GuardContext,
        high_risk: Option<&[UowStatus]>,
    ) -> StoreResult<PilotCheckOutcome> {
        let high_risk = high_risk.unwrap_or(&DEFAULT_HIGH_RISK);
        let mut outcome = PilotCheckOutcome {
            success: false,
            pilot_approved: false,
            waiver_issued: false,
            blocked_by: None,
            record: None,
        };

        if high_risk.contains(&update.new_status) {
            let reason = format!(
                "UOW {uow_id} transitioning to {}. Reason: {}",
                update.new_status,
                update.reasoning.as_deref().unwrap_or("unspecified")
            );
            let decision = guard
                .wait_for_pilot(uow_id, &reason, self.pilot_timeout)
                .await;

            if decision.approved {
                outcome.pilot_approved = true;
            } else if decision.waiver_issued {
                outcome.waiver_issued = true;
                let waiver = serde_json::json!({
                    "constitutional_waiver": {
                        "issued": true,
                        "reason": decision.waiver_reason,
                        "timestamp": Utc::now().to_rfc3339(),
                    }
                });
                update.event_payload = Some(match update.event_payload.take() {
                    Some(mut existing) => {
                        if let (Some(map), Some(extra)) =
                            (existing.as_object_mut(), waiver.as_object())
                        {
                            for (k, v) in extra {
                                map.insert(k.clone(), v.clone());
                            }
                        }
                        existing
                    }
                    None => waiver,
                });
            } else {
                outcome.blocked_by = Some("PILOT_APPROVAL_REQUIRED".to_string());
                return Ok(outcome);
            }
        }

        let record = self.update_state(uow_id, update, guard).await?;
        outcome.success = true;
        outcome.record = Some(record);
        Ok(outcome)
    }

    /// Recompute the content hash from the live attribute set and compare
    /// with the stored value. Publishes a `STATE_DRIFT` violation when
    /// requested and drift is present.
    pub async fn verify_state_hash(
        &self,
        uow_id: Uuid,
        emit_violation: bool,
        guard: Option<&dyn GuardContext>,
    ) -> StoreResult<HashVerification> {
        let record = self.get(uow_id).await?;
        let computed = state_hash::content_hash(Some(&record.attributes));
        let stored = record.uow.content_hash.clone();
        let is_valid = computed == stored;

        let mut verification = HashVerification {
            is_valid,
            stored_hash: stored.clone(),
            computed_hash: computed.clone(),
            violation: None,
        };

        if !is_valid && emit_violation {
            let packet = ViolationPacket::new("STATE_DRIFT", Severity::Critical, "STATE_HASH_MISMATCH")
                .with_uow(uow_id)
                .with_raw_data(serde_json::json!({
                    "stored_hash": stored,
                    "computed_hash": computed,
                    "attribute_count": record.attributes.len(),
                }))
                .with_remedy(
                    "State drift detected. Remediation options: \
                     ROLLBACK attributes to the recorded hash, \
                     QUARANTINE the UOW for inspection, \
                     or issue a CONSTITUTIONAL_WAIVER and proceed.",
                );
            if let Some(guard) = guard {
                guard.emit_violation(packet.clone()).await;
            }
            verification.violation = Some(packet);
        }

        Ok(verification)
    }

    /// Idempotent liveness touch. Only ACTIVE rows heartbeat; returns whether
    /// the signal was recorded.
    pub async fn heartbeat(&self, uow_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE units_of_work SET last_heartbeat = ? WHERE uow_id = ? AND status = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(uow_id.to_string())
        .bind(UowStatus::Active.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// The checkout lock: a compare-and-swap on `status`. Exactly one
    /// concurrent caller wins `PENDING → ACTIVE`; the winner's identity is
    /// stamped into `locked_by` and the transition is recorded in history.
    pub async fn checkout_lock(
        &self,
        uow_id: Uuid,
        actor_id: Uuid,
        guard: &dyn GuardContext,
    ) -> StoreResult<LockOutcome> {
        if !guard.is_authorized(Some(actor_id), uow_id).await {
            guard
                .emit_violation(authorization_packet(Some(actor_id), uow_id))
                .await;
            return Err(StoreError::GuardUnauthorized {
                uow_id,
                actor_id: Some(actor_id),
            });
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let swapped = sqlx::query(
            "UPDATE units_of_work SET status = ?, locked_by = ?, last_heartbeat = ?, \
             interaction_count = interaction_count + 1 \
             WHERE uow_id = ? AND status = ?",
        )
        .bind(UowStatus::Active.as_str())
        .bind(actor_id.to_string())
        .bind(now.to_rfc3339())
        .bind(uow_id.to_string())
        .bind(UowStatus::Pending.as_str())
        .execute(tx.as_mut())
        .await?;
        if swapped.rows_affected() != 1 {
            return Ok(LockOutcome::Lost);
        }

        let row = sqlx::query("SELECT * FROM units_of_work WHERE uow_id = ?")
            .bind(uow_id.to_string())
            .fetch_one(tx.as_mut())
            .await?;
        let uow = row_to_uow(&row)?;

        // The ambiguity lock: reaching the budget soft-stalls the token
        // instead of handing it out.
        let mut effective_status = UowStatus::Active;
        if let Some(max) = uow.max_interactions {
            if uow.interaction_count >= max {
                effective_status = UowStatus::ZombiedSoft;
                sqlx::query(
                    "UPDATE units_of_work SET status = ?, locked_by = NULL, \
                     interaction_count = ? WHERE uow_id = ?",
                )
                .bind(effective_status.as_str())
                .bind(max)
                .bind(uow_id.to_string())
                .execute(tx.as_mut())
                .await?;
            }
        }

        insert_history_tx(
            tx.as_mut(),
            HistoryRow {
                instance_id: uow.instance_id,
                uow_id,
                event_type: HistoryEventType::StateTransition,
                previous_status: Some(UowStatus::Pending),
                new_status: Some(effective_status),
                previous_state_hash: uow.content_hash.clone(),
                new_state_hash: uow.content_hash,
                previous_interaction_id: Some(uow.current_interaction_id),
                new_interaction_id: Some(uow.current_interaction_id),
                actor_id: Some(actor_id),
                reasoning: Some("Work checked out".to_string()),
                payload: None,
                transition_at: now,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(if effective_status == UowStatus::ZombiedSoft {
            LockOutcome::Stalled
        } else {
            LockOutcome::Locked
        })
    }

    /// Persist a conditional-injector mutation onto the row.
    pub async fn record_injection(
        &self,
        uow_id: Uuid,
        injection: InjectionUpdate,
    ) -> StoreResult<()> {
        let record = self.get(uow_id).await?;
        let uow = record.uow;

        let model_id = injection.model_id.or(uow.model_id);
        let instructions = match (uow.injected_instructions, injection.instructions) {
            (Some(existing), Some(new)) => Some(format!("{existing}\n{new}")),
            (None, Some(new)) => Some(new),
            (existing, None) => existing,
        };
        let mut fragments = uow.knowledge_fragment_refs;
        for fragment in injection.knowledge_fragments {
            if !fragments.contains(&fragment) {
                fragments.push(fragment);
            }
        }
        let mut audit = uow.mutation_audit_log;
        audit.push(injection.audit);

        sqlx::query(
            "UPDATE units_of_work SET model_id = ?, injected_instructions = ?, \
             knowledge_fragment_refs = ?, mutation_audit_log = ? WHERE uow_id = ?",
        )
        .bind(model_id)
        .bind(instructions)
        .bind(serde_json::to_string(&fragments)?)
        .bind(serde_json::to_string(&audit)?)
        .bind(uow_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    //─────────────────────────────
    //  Finders
    //─────────────────────────────

    /// All UOWs with a given status, optionally scoped to one instance, in
    /// creation order.
    pub async fn find_by_status(
        &self,
        status: UowStatus,
        instance_id: Option<Uuid>,
    ) -> StoreResult<Vec<Uow>> {
        let rows = match instance_id {
            Some(instance_id) => {
                sqlx::query(
                    "SELECT * FROM units_of_work WHERE status = ? AND instance_id = ? \
                     ORDER BY created_at, uow_id",
                )
                .bind(status.as_str())
                .bind(instance_id.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM units_of_work WHERE status = ? ORDER BY created_at, uow_id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(row_to_uow).collect()
    }

    /// PENDING tokens waiting at any of these queues, in creation order.
    pub async fn find_pending_at(&self, interaction_ids: &[Uuid]) -> StoreResult<Vec<Uow>> {
        let mut uows = Vec::new();
        for interaction_id in interaction_ids {
            let rows = sqlx::query(
                "SELECT * FROM units_of_work \
                 WHERE current_interaction_id = ? AND status = ? \
                 ORDER BY created_at, uow_id",
            )
            .bind(interaction_id.to_string())
            .bind(UowStatus::Pending.as_str())
            .fetch_all(&self.pool)
            .await?;
            for row in &rows {
                uows.push(row_to_uow(row)?);
            }
        }
        uows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.uow_id.cmp(&b.uow_id)));
        Ok(uows)
    }

    /// UOWs that hit their interaction budget (the ambiguity lock).
    pub async fn find_by_interaction_limit(&self, instance_id: Uuid) -> StoreResult<Vec<Uow>> {
        let rows = sqlx::query(
            "SELECT * FROM units_of_work \
             WHERE instance_id = ? AND max_interactions IS NOT NULL \
             AND interaction_count >= max_interactions \
             ORDER BY created_at, uow_id",
        )
        .bind(instance_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_uow).collect()
    }

    /// ACTIVE tokens whose heartbeat went stale before `cutoff`. Rows with no
    /// heartbeat at all are exempt.
    pub async fn find_zombies(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Uow>> {
        let rows = sqlx::query(
            "SELECT * FROM units_of_work \
             WHERE status = ? AND last_heartbeat IS NOT NULL AND last_heartbeat < ? \
             ORDER BY created_at, uow_id",
        )
        .bind(UowStatus::Active.as_str())
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_uow).collect()
    }

    /// History for a UOW in chronological order, capped at `limit`.
    pub async fn get_history(
        &self,
        uow_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<UowHistoryRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM uow_history WHERE uow_id = ? \
             ORDER BY transition_at ASC, rowid ASC LIMIT ?",
        )
        .bind(uow_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_history).collect()
    }

    //─────────────────────────────
    //  Internals
    //─────────────────────────────

    async fn authorize(
        &self,
        actor_id: Option<Uuid>,
        uow_id: Uuid,
        update: &StateUpdate,
        guard: &dyn GuardContext,
    ) -> StoreResult<()> {
        if guard.is_authorized(actor_id, uow_id).await {
            return Ok(());
        }
        let packet = authorization_packet(actor_id, uow_id).with_raw_data(serde_json::json!({
            "attempted_actor": actor_label(actor_id),
            "new_status": update.new_status.as_str(),
            "new_interaction_id": update.new_interaction_id.map(|id| id.to_string()),
        }));
        guard.emit_violation(packet).await;
        Err(StoreError::GuardUnauthorized { uow_id, actor_id })
    }

    async fn insert_uow_tx(
        &self,
        conn: &mut SqliteConnection,
        uow_id: Uuid,
        spec: &UowSpec,
    ) -> StoreResult<()> {
        let now = Utc::now();
        let content_hash = state_hash::content_hash(Some(&spec.attributes));

        sqlx::query(
            "INSERT INTO units_of_work \
             (uow_id, instance_id, workflow_id, parent_id, current_interaction_id, status, \
              child_count, finished_child_count, last_heartbeat, locked_by, content_hash, \
              interaction_count, max_interactions, retry_count, interaction_policy, \
              model_id, injected_instructions, knowledge_fragment_refs, mutation_audit_log, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, 0, 0, NULL, NULL, ?, 0, ?, 0, ?, NULL, NULL, '[]', '[]', ?)",
        )
        .bind(uow_id.to_string())
        .bind(spec.instance_id.to_string())
        .bind(spec.workflow_id.to_string())
        .bind(spec.parent_id.map(|id| id.to_string()))
        .bind(spec.current_interaction_id.to_string())
        .bind(UowStatus::Pending.as_str())
        .bind(&content_hash)
        .bind(spec.max_interactions)
        .bind(spec.interaction_policy.as_ref().map(|v| v.to_string()))
        .bind(now.to_rfc3339())
        .execute(&mut *conn)
        .await?;

        for (key, value) in &spec.attributes {
            insert_attribute_tx(
                &mut *conn,
                uow_id,
                spec.instance_id,
                key,
                value,
                1,
                spec.attribute_author,
                Some(spec.attribute_reasoning.as_str()),
                now,
            )
            .await?;
        }

        insert_history_tx(
            &mut *conn,
            HistoryRow {
                instance_id: spec.instance_id,
                uow_id,
                event_type: HistoryEventType::UowCreated,
                previous_status: None,
                new_status: Some(UowStatus::Pending),
                previous_state_hash: String::new(),
                new_state_hash: content_hash,
                previous_interaction_id: None,
                new_interaction_id: Some(spec.current_interaction_id),
                actor_id: Some(spec.attribute_author),
                reasoning: None,
                payload: Some(serde_json::json!({
                    "workflow_id": spec.workflow_id.to_string(),
                    "initial_status": UowStatus::Pending.as_str(),
                })),
                transition_at: now,
            },
        )
        .await?;

        Ok(())
    }
}

fn actor_label(actor_id: Option<Uuid>) -> String {
    actor_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "SYSTEM".to_string())
}

fn authorization_packet(actor_id: Option<Uuid>, uow_id: Uuid) -> ViolationPacket {
    ViolationPacket::new("AUTHORIZATION", Severity::Critical, "UNAUTHORIZED_UOW_MODIFICATION")
        .with_uow(uow_id)
        .with_raw_data(serde_json::json!({ "attempted_actor": actor_label(actor_id) }))
        .with_remedy(
            "This UOW modification requires guard approval. \
             Verify actor credentials and role assignments.",
        )
}

fn validate_spec(spec: &UowSpec) -> StoreResult<()> {
    if spec.instance_id.is_nil() {
        return Err(StoreError::InvalidSpec("instance_id is required".into()));
    }
    if spec.workflow_id.is_nil() {
        return Err(StoreError::InvalidSpec("workflow_id is required".into()));
    }
    if spec.current_interaction_id.is_nil() {
        return Err(StoreError::InvalidSpec(
            "current_interaction_id is required".into(),
        ));
    }
    Ok(())
}

async fn load_attributes_tx(
    conn: &mut SqliteConnection,
    uow_id: Uuid,
) -> StoreResult<(AttrMap, std::collections::HashMap<String, i64>)> {
    let rows = sqlx::query(
        "SELECT key, value, version FROM uow_attributes WHERE uow_id = ? ORDER BY version ASC",
    )
    .bind(uow_id.to_string())
    .fetch_all(&mut *conn)
    .await?;

    let mut attributes = AttrMap::new();
    let mut versions = std::collections::HashMap::new();
    for row in rows {
        let key: String = row.try_get("key")?;
        let value: serde_json::Value =
            serde_json::from_str(row.try_get::<String, _>("value")?.as_str())?;
        let version: i64 = row.try_get("version")?;
        attributes.insert(key.clone(), value);
        versions.insert(key, version);
    }
    Ok((attributes, versions))
}

#[allow(clippy::too_many_arguments)]
async fn insert_attribute_tx(
    conn: &mut SqliteConnection,
    uow_id: Uuid,
    instance_id: Uuid,
    key: &str,
    value: &serde_json::Value,
    version: i64,
    actor_id: Uuid,
    reasoning: Option<&str>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO uow_attributes \
         (attribute_id, uow_id, instance_id, key, value, version, actor_id, reasoning, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(uow_id.to_string())
    .bind(instance_id.to_string())
    .bind(key)
    .bind(value.to_string())
    .bind(version)
    .bind(actor_id.to_string())
    .bind(reasoning)
    .bind(now.to_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

struct HistoryRow {
    instance_id: Uuid,
    uow_id: Uuid,
    event_type: HistoryEventType,
    previous_status: Option<UowStatus>,
    new_status: Option<UowStatus>,
    previous_state_hash: String,
    new_state_hash: String,
    previous_interaction_id: Option<Uuid>,
    new_interaction_id: Option<Uuid>,
    actor_id: Option<Uuid>,
    reasoning: Option<String>,
    payload: Option<serde_json::Value>,
    transition_at: DateTime<Utc>,
}

async fn insert_history_tx(conn: &mut SqliteConnection, row: HistoryRow) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO uow_history \
         (history_id, instance_id, uow_id, event_type, previous_status, new_status, \
          previous_state_hash, new_state_hash, previous_interaction_id, new_interaction_id, \
          actor_id, reasoning, payload, transition_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(row.instance_id.to_string())
    .bind(row.uow_id.to_string())
    .bind(row.event_type.as_str())
    .bind(row.previous_status.map(|s| s.as_str()))
    .bind(row.new_status.map(|s| s.as_str()))
    .bind(&row.previous_state_hash)
    .bind(&row.new_state_hash)
    .bind(row.previous_interaction_id.map(|id| id.to_string()))
    .bind(row.new_interaction_id.map(|id| id.to_string()))
    .bind(row.actor_id.map(|id| id.to_string()))
    .bind(&row.reasoning)
    .bind(row.payload.as_ref().map(|v| v.to_string()))
    .bind(row.transition_at.to_rfc3339())
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) fn row_to_uow(row: &SqliteRow) -> StoreResult<Uow> {
    Ok(Uow {
        uow_id: parse_uuid(row.try_get("uow_id")?)?,
        instance_id: parse_uuid(row.try_get("instance_id")?)?,
        workflow_id: parse_uuid(row.try_get("workflow_id")?)?,
        parent_id: row
            .try_get::<Option<String>, _>("parent_id")?
            .map(parse_uuid)
            .transpose()?,
        current_interaction_id: parse_uuid(row.try_get("current_interaction_id")?)?,
        status: UowStatus::from_str(row.try_get::<String, _>("status")?.as_str())?,
        child_count: row.try_get("child_count")?,
        finished_child_count: row.try_get("finished_child_count")?,
        last_heartbeat: parse_optional_timestamp(row.try_get("last_heartbeat")?)?,
        locked_by: row
            .try_get::<Option<String>, _>("locked_by")?
            .map(parse_uuid)
            .transpose()?,
        content_hash: row.try_get("content_hash")?,
        interaction_count: row.try_get("interaction_count")?,
        max_interactions: row.try_get("max_interactions")?,
        retry_count: row.try_get("retry_count")?,
        interaction_policy: parse_json_column(row.try_get("interaction_policy")?)?,
        model_id: row.try_get("model_id")?,
        injected_instructions: row.try_get("injected_instructions")?,
        knowledge_fragment_refs: serde_json::from_str(
            row.try_get::<String, _>("knowledge_fragment_refs")?.as_str(),
        )?,
        mutation_audit_log: serde_json::from_str(
            row.try_get::<String, _>("mutation_audit_log")?.as_str(),
        )?,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
    })
}

fn row_to_history(row: &SqliteRow) -> StoreResult<UowHistoryRecord> {
    Ok(UowHistoryRecord {
        history_id: parse_uuid(row.try_get("history_id")?)?,
        instance_id: parse_uuid(row.try_get("instance_id")?)?,
        uow_id: parse_uuid(row.try_get("uow_id")?)?,
        event_type: row.try_get("event_type")?,
        previous_status: row.try_get("previous_status")?,
        new_status: row.try_get("new_status")?,
        previous_state_hash: row.try_get("previous_state_hash")?,
        new_state_hash: row.try_get("new_state_hash")?,
        previous_interaction_id: row
            .try_get::<Option<String>, _>("previous_interaction_id")?
            .map(parse_uuid)
            .transpose()?,
        new_interaction_id: row
            .try_get::<Option<String>, _>("new_interaction_id")?
            .map(parse_uuid)
            .transpose()?,
        actor_id: row
            .try_get::<Option<String>, _>("actor_id")?
            .map(parse_uuid)
            .transpose()?,
        reasoning: row.try_get("reasoning")?,
        payload: parse_json_column(row.try_get("payload")?)?,
        transition_at: parse_timestamp(row.try_get("transition_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard_context::{PilotDecision, SystemGuardContext};
    use crate::instance::InstanceStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tessera_types::{InstanceContext, InstanceStatus, Interaction, Workflow};

    async fn fixture() -> (InstanceStore, UowRepository, UowSpec) {
        let store = InstanceStore::in_memory().await.unwrap();
        let repository = UowRepository::new(&store);

        let instance_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();
        let interaction_id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        store
            .insert_instance_context(
                tx.as_mut(),
                &InstanceContext {
                    instance_id,
                    name: "fixture".into(),
                    description: None,
                    status: InstanceStatus::Active,
                    deployed_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        store
            .insert_workflow(
                tx.as_mut(),
                &Workflow {
                    workflow_id,
                    instance_id,
                    blueprint_workflow_id: Uuid::new_v4(),
                    name: "wf".into(),
                    description: None,
                    ai_context: None,
                    version: 1,
                },
            )
            .await
            .unwrap();
        store
            .insert_interaction(
                tx.as_mut(),
                &Interaction {
                    interaction_id,
                    workflow_id,
                    name: "queue".into(),
                    description: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut spec = UowSpec::new(instance_id, workflow_id, interaction_id);
        spec.attributes.insert("invoice_id".into(), json!("INV-003"));
        spec.attributes.insert("amount".into(), json!(1500));

        (store, repository, spec)
    }

    #[tokio::test]
    async fn create_records_hash_and_creation_history() {
        let (_store, repository, spec) = fixture().await;
        let expected_hash = state_hash::content_hash(Some(&spec.attributes));

        let uow_id = repository.create(spec).await.unwrap();
        let record = repository.get(uow_id).await.unwrap();

        assert_eq!(record.uow.status, UowStatus::Pending);
        assert_eq!(record.uow.content_hash, expected_hash);
        assert_eq!(record.attributes["invoice_id"], json!("INV-003"));

        let history = repository.get_history(uow_id, 100).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "UOW_CREATED");
        assert_eq!(history[0].previous_state_hash, "");
        assert_eq!(history[0].new_state_hash, expected_hash);
    }

    #[tokio::test]
    async fn create_rejects_missing_required_fields() {
        let (_store, repository, mut spec) = fixture().await;
        spec.instance_id = Uuid::nil();
        let err = repository.create(spec).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn update_appends_versions_and_chains_hashes() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();
        let actor = Uuid::new_v4();
        let guard = SystemGuardContext;

        repository
            .checkout_lock(uow_id, actor, &guard)
            .await
            .unwrap();
        repository
            .update_state(
                uow_id,
                StateUpdate::to(UowStatus::Completed)
                    .set("status", json!("approved"))
                    .by(actor)
                    .because("reviewed")
                    .clearing_heartbeat(),
                &guard,
            )
            .await
            .unwrap();

        let record = repository.get(uow_id).await.unwrap();
        assert_eq!(record.uow.status, UowStatus::Completed);
        assert_eq!(record.attributes["status"], json!("approved"));
        assert!(record.uow.last_heartbeat.is_none());
        assert!(record.uow.locked_by.is_none());

        // Hash chain: previous_state_hash of row k equals new_state_hash of
        // row k-1, starting from the empty sentinel.
        let history = repository.get_history(uow_id, 100).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].previous_state_hash, "");
        for pair in history.windows(2) {
            assert_eq!(pair[1].previous_state_hash, pair[0].new_state_hash);
        }
        assert_eq!(record.uow.content_hash, history.last().unwrap().new_state_hash);
    }

    #[tokio::test]
    async fn attribute_versions_are_contiguous_from_one() {
        let (store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();
        let guard = SystemGuardContext;

        for value in ["first", "second", "third"] {
            repository
                .update_state(
                    uow_id,
                    StateUpdate::to(UowStatus::Pending).set("status", json!(value)),
                    &guard,
                )
                .await
                .unwrap();
        }

        let rows = sqlx::query(
            "SELECT version FROM uow_attributes WHERE uow_id = ? AND key = 'status' ORDER BY version",
        )
        .bind(uow_id.to_string())
        .fetch_all(store.pool())
        .await
        .unwrap();
        let versions: Vec<i64> = rows.iter().map(|r| r.get("version")).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unchanged_values_do_not_append_versions() {
        let (store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();
        let guard = SystemGuardContext;

        repository
            .update_state(
                uow_id,
                StateUpdate::to(UowStatus::Pending).set("amount", json!(1500)),
                &guard,
            )
            .await
            .unwrap();

        let rows = sqlx::query("SELECT version FROM uow_attributes WHERE uow_id = ? AND key = 'amount'")
            .bind(uow_id.to_string())
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn checkout_lock_wins_once() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();
        let guard = SystemGuardContext;
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert_eq!(
            repository.checkout_lock(uow_id, first, &guard).await.unwrap(),
            LockOutcome::Locked
        );
        assert_eq!(
            repository.checkout_lock(uow_id, second, &guard).await.unwrap(),
            LockOutcome::Lost
        );

        let record = repository.get(uow_id).await.unwrap();
        assert_eq!(record.uow.status, UowStatus::Active);
        assert_eq!(record.uow.locked_by, Some(first));
        assert!(record.uow.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn reaching_interaction_budget_soft_stalls() {
        let (_store, repository, mut spec) = fixture().await;
        spec.max_interactions = Some(1);
        let uow_id = repository.create(spec).await.unwrap();
        let guard = SystemGuardContext;

        let outcome = repository
            .checkout_lock(uow_id, Uuid::new_v4(), &guard)
            .await
            .unwrap();
        assert_eq!(outcome, LockOutcome::Stalled);

        let record = repository.get(uow_id).await.unwrap();
        assert_eq!(record.uow.status, UowStatus::ZombiedSoft);
        assert_eq!(record.uow.interaction_count, 1);
        assert!(record.uow.locked_by.is_none());

        let stalled = repository
            .find_by_interaction_limit(record.uow.instance_id)
            .await
            .unwrap();
        assert_eq!(stalled.len(), 1);
    }

    #[tokio::test]
    async fn interaction_policy_cannot_be_mutated_after_creation() {
        let (_store, repository, mut spec) = fixture().await;
        let policy = json!({"branches": [{"condition": "amount > 10", "next_interaction": "fast"}]});
        spec.interaction_policy = Some(policy.clone());
        let uow_id = repository.create(spec).await.unwrap();
        let guard = SystemGuardContext;

        let mut update = StateUpdate::to(UowStatus::Pending);
        update.interaction_policy = Some(json!({"branches": []}));
        repository.update_state(uow_id, update, &guard).await.unwrap();

        let record = repository.get(uow_id).await.unwrap();
        assert_eq!(record.uow.interaction_policy, Some(policy));
    }

    #[tokio::test]
    async fn administrative_updates_leave_interaction_count_unchanged() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();
        let guard = SystemGuardContext;

        repository
            .update_state(
                uow_id,
                StateUpdate::to(UowStatus::Paused).administrative(),
                &guard,
            )
            .await
            .unwrap();

        let record = repository.get(uow_id).await.unwrap();
        assert_eq!(record.uow.interaction_count, 0);
    }

    #[tokio::test]
    async fn heartbeat_is_idempotent_and_active_only() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();
        let guard = SystemGuardContext;

        // PENDING rows do not heartbeat.
        assert!(!repository.heartbeat(uow_id).await.unwrap());

        repository
            .checkout_lock(uow_id, Uuid::new_v4(), &guard)
            .await
            .unwrap();
        let before = repository.get(uow_id).await.unwrap();

        assert!(repository.heartbeat(uow_id).await.unwrap());
        assert!(repository.heartbeat(uow_id).await.unwrap());

        let after = repository.get(uow_id).await.unwrap();
        assert_eq!(after.uow.status, UowStatus::Active);
        assert_eq!(after.uow.interaction_count, before.uow.interaction_count);
        assert!(after.uow.last_heartbeat >= before.uow.last_heartbeat);
    }

    #[tokio::test]
    async fn verify_state_hash_detects_out_of_band_edits() {
        let (store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();

        let clean = repository.verify_state_hash(uow_id, true, None).await.unwrap();
        assert!(clean.is_valid);
        assert!(clean.violation.is_none());

        // Tamper with an attribute row behind the repository's back.
        sqlx::query("UPDATE uow_attributes SET value = ? WHERE uow_id = ? AND key = 'amount'")
            .bind(json!(999999).to_string())
            .bind(uow_id.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let drifted = repository.verify_state_hash(uow_id, true, None).await.unwrap();
        assert!(!drifted.is_valid);
        let violation = drifted.violation.unwrap();
        assert_eq!(violation.rule_id, "STATE_DRIFT");
        assert_eq!(violation.severity, Severity::Critical);
    }

    struct RejectingPilot;

    #[async_trait]
    impl GuardContext for RejectingPilot {
        async fn is_authorized(&self, _actor: Option<Uuid>, _uow: Uuid) -> bool {
            true
        }
        async fn wait_for_pilot(&self, _uow: Uuid, _reason: &str, _t: Duration) -> PilotDecision {
            PilotDecision::rejected("too risky")
        }
        async fn emit_violation(&self, _packet: ViolationPacket) {}
    }

    struct WaivingPilot;

    #[async_trait]
    impl GuardContext for WaivingPilot {
        async fn is_authorized(&self, _actor: Option<Uuid>, _uow: Uuid) -> bool {
            true
        }
        async fn wait_for_pilot(&self, _uow: Uuid, _reason: &str, _t: Duration) -> PilotDecision {
            PilotDecision::waived("CFO authorized")
        }
        async fn emit_violation(&self, _packet: ViolationPacket) {}
    }

    #[tokio::test]
    async fn pilot_rejection_blocks_high_risk_saves() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();

        let outcome = repository
            .save_with_pilot_check(
                uow_id,
                StateUpdate::to(UowStatus::Completed),
                &RejectingPilot,
                None,
            )
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.blocked_by.as_deref(), Some("PILOT_APPROVAL_REQUIRED"));

        let record = repository.get(uow_id).await.unwrap();
        assert_eq!(record.uow.status, UowStatus::Pending);
    }

    #[tokio::test]
    async fn pilot_waiver_records_metadata_and_proceeds() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();

        let outcome = repository
            .save_with_pilot_check(
                uow_id,
                StateUpdate::to(UowStatus::Completed),
                &WaivingPilot,
                None,
            )
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.waiver_issued);

        let history = repository.get_history(uow_id, 100).await.unwrap();
        let transition = history.last().unwrap();
        let payload = transition.payload.as_ref().unwrap();
        assert_eq!(payload["constitutional_waiver"]["issued"], json!(true));
        assert_eq!(payload["constitutional_waiver"]["reason"], json!("CFO authorized"));
    }

    #[tokio::test]
    async fn low_risk_saves_skip_the_pilot() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();

        // RejectingPilot would block, but PENDING is not high-risk.
        let outcome = repository
            .save_with_pilot_check(
                uow_id,
                StateUpdate::to(UowStatus::Pending),
                &RejectingPilot,
                None,
            )
            .await
            .unwrap();
        assert!(outcome.success);
    }

    struct DenyAll;

    #[async_trait]
    impl GuardContext for DenyAll {
        async fn is_authorized(&self, _actor: Option<Uuid>, _uow: Uuid) -> bool {
            false
        }
        async fn wait_for_pilot(&self, _uow: Uuid, _reason: &str, _t: Duration) -> PilotDecision {
            PilotDecision::approved()
        }
        async fn emit_violation(&self, _packet: ViolationPacket) {}
    }

    #[tokio::test]
    async fn unauthorized_mutation_is_refused() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();

        let err = repository
            .update_state(uow_id, StateUpdate::to(UowStatus::Active), &DenyAll)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::GuardUnauthorized { .. }));
    }

    #[tokio::test]
    async fn child_bookkeeping_enforces_invariant_five() {
        let (_store, repository, spec) = fixture().await;
        let parent_spec = spec.clone();
        let parent_id = repository.create(parent_spec).await.unwrap();

        let child_spec = UowSpec {
            attributes: AttrMap::new(),
            ..spec
        };
        repository.register_child(parent_id, child_spec).await.unwrap();

        let parent = repository.get(parent_id).await.unwrap();
        assert_eq!(parent.uow.child_count, 1);
        assert_eq!(parent.uow.finished_child_count, 0);

        repository.record_child_finished(parent_id).await.unwrap();
        let parent = repository.get(parent_id).await.unwrap();
        assert_eq!(parent.uow.finished_child_count, 1);

        // finished_child_count may never exceed child_count.
        let err = repository.record_child_finished(parent_id).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn injection_unions_fragments_and_appends_audit() {
        let (_store, repository, spec) = fixture().await;
        let uow_id = repository.create(spec).await.unwrap();

        let entry = |guard_name: &str| MutationAuditEntry {
            guard_name: guard_name.into(),
            condition: "amount > 10".into(),
            model_override: Some("premium".into()),
            failover_used: false,
            failover_model: None,
            timestamp: Utc::now(),
        };

        repository
            .record_injection(
                uow_id,
                InjectionUpdate {
                    model_id: Some("premium".into()),
                    instructions: Some("verify twice".into()),
                    knowledge_fragments: vec!["policies_v2".into()],
                    audit: entry("first"),
                },
            )
            .await
            .unwrap();
        repository
            .record_injection(
                uow_id,
                InjectionUpdate {
                    model_id: None,
                    instructions: Some("escalate on doubt".into()),
                    knowledge_fragments: vec!["policies_v2".into(), "fraud_list".into()],
                    audit: entry("second"),
                },
            )
            .await
            .unwrap();

        let record = repository.get(uow_id).await.unwrap();
        assert_eq!(record.uow.model_id.as_deref(), Some("premium"));
        assert_eq!(
            record.uow.injected_instructions.as_deref(),
            Some("verify twice\nescalate on doubt")
        );
        assert_eq!(record.uow.knowledge_fragment_refs, vec!["policies_v2", "fraud_list"]);
        assert_eq!(record.uow.mutation_audit_log.len(), 2);
    }

    #[tokio::test]
    async fn find_zombies_skips_missing_heartbeats() {
        let (store, repository, spec) = fixture().await;
        let guard = SystemGuardContext;

        let stale = repository.create(spec.clone()).await.unwrap();
        repository.checkout_lock(stale, Uuid::new_v4(), &guard).await.unwrap();
        // Backdate the heartbeat past the threshold.
        sqlx::query("UPDATE units_of_work SET last_heartbeat = ? WHERE uow_id = ?")
            .bind((Utc::now() - chrono::Duration::minutes(10)).to_rfc3339())
            .bind(stale.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let fresh = repository.create(spec.clone()).await.unwrap();
        repository.checkout_lock(fresh, Uuid::new_v4(), &guard).await.unwrap();

        let no_heartbeat = repository.create(spec).await.unwrap();
        repository.checkout_lock(no_heartbeat, Uuid::new_v4(), &guard).await.unwrap();
        sqlx::query("UPDATE units_of_work SET last_heartbeat = NULL WHERE uow_id = ?")
            .bind(no_heartbeat.to_string())
            .execute(store.pool())
            .await
            .unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        let zombies = repository.find_zombies(cutoff).await.unwrap();
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].uow_id, stale);
    }
}
