//! The core operations: instantiate, checkout, submit, report failure,
//! heartbeat and child spawning.

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use tessera_bus::TelemetryEntry;
use tessera_guard::{
    evaluate_guard, evaluation_scope, plan_injection, RouteDecision, RoutePolicy,
};
use tessera_store::repository::{InjectionUpdate, LockOutcome, StateUpdate, UowSpec};
use tessera_types::{
    AttrMap, Component, ComponentDirection, GuardKind, Guardian, InstanceContext, InstanceStatus,
    Interaction, LogKind, Role, RoleKind, Uow, UowStatus, Workflow, SYSTEM_ACTOR_ID,
};

use crate::{Engine, EngineError, EngineResult};

/// Reserved attribute key carrying a learned rule on submit. Harvested into
/// role memory, never persisted onto the UOW itself.
pub const LEARNED_RULE_KEY: &str = "_learned_rule";

/// What an actor receives from a successful checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkout {
    /// The locked token.
    pub uow_id: Uuid,
    /// Its current attribute map.
    pub attributes: AttrMap,
    /// The merged memory context for this actor and role.
    pub context: AttrMap,
}

/// Creation request for one child UOW during Beta decomposition.
#[derive(Debug, Clone, Default)]
pub struct ChildSpec {
    /// Initial attributes for the child.
    pub attributes: AttrMap,
    /// Interaction budget for the child.
    pub max_interactions: Option<i64>,
}

impl Engine {
    //─────────────────────────────
    //  Instantiation
    //─────────────────────────────

    /// Clone a blueprint into a fresh, isolated runtime instance and deposit
    /// the Alpha UOW at the Alpha role's outbound queue.
    ///
    /// Runs inside a single instance-tier transaction; any failure rolls the
    /// whole clone back.
    pub async fn instantiate_workflow(
        &self,
        template_id: Uuid,
        initial_context: AttrMap,
        name: Option<String>,
        description: Option<String>,
    ) -> EngineResult<Uuid> {
        let bundle = self.blueprints().fetch_bundle(template_id).await.map_err(|e| {
            if e.is_not_found() {
                EngineError::TemplateNotFound(template_id)
            } else {
                EngineError::Store(e)
            }
        })?;

        // Topology assertions (the importer enforces the full rule set; a
        // malformed instance must still be impossible to create).
        let alpha_defs: Vec<_> = bundle
            .roles
            .iter()
            .filter(|r| r.kind == RoleKind::Alpha)
            .collect();
        let alpha_def = match alpha_defs.as_slice() {
            [single] => *single,
            [] => {
                return Err(EngineError::InvalidBlueprint(format!(
                    "template {template_id} has no Alpha role"
                )))
            }
            _ => {
                return Err(EngineError::InvalidBlueprint(format!(
                    "template {template_id} has more than one Alpha role"
                )))
            }
        };

        let instance_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();
        let now = Utc::now();

        let mut tx = self
            .store()
            .begin()
            .await
            .map_err(|e| EngineError::InstantiationFailed(e.to_string()))?;

        let result: EngineResult<Uuid> = async {
            let store = self.store();

            store
                .insert_instance_context(
                    tx.as_mut(),
                    &InstanceContext {
                        instance_id,
                        name: name.unwrap_or_else(|| format!("Instance_{}", bundle.workflow.name)),
                        description: Some(description.unwrap_or_else(|| {
                            format!("Instantiated from {}", bundle.workflow.name)
                        })),
                        status: InstanceStatus::Active,
                        deployed_at: now,
                    },
                )
                .await?;

            store
                .insert_workflow(
                    tx.as_mut(),
                    &Workflow {
                        workflow_id,
                        instance_id,
                        blueprint_workflow_id: bundle.workflow.workflow_id,
                        name: bundle.workflow.name.clone(),
                        description: bundle.workflow.description.clone(),
                        ai_context: bundle.workflow.ai_context.clone(),
                        version: bundle.workflow.version,
                    },
                )
                .await?;

            // Clone roles, keeping the blueprint -> instance id map so edges
            // survive the re-keying.
            let mut role_map = std::collections::HashMap::new();
            let mut alpha_role_id = None;
            for role_def in &bundle.roles {
                let role_id = Uuid::new_v4();
                role_map.insert(role_def.role_id, role_id);
                if role_def.role_id == alpha_def.role_id {
                    alpha_role_id = Some(role_id);
                }
                if role_def.child_workflow_id.is_some() {
                    // Recursive gateways are recorded without expansion.
                    tracing::debug!(
                        role = %role_def.name,
                        "cloning recursive gateway without sub-instance"
                    );
                }
                store
                    .insert_role(
                        tx.as_mut(),
                        &Role {
                            role_id,
                            workflow_id,
                            name: role_def.name.clone(),
                            description: role_def.description.clone(),
                            ai_context: role_def.ai_context.clone(),
                            kind: role_def.kind,
                            strategy: role_def.strategy,
                            gateway_workflow_id: role_def.child_workflow_id,
                        },
                    )
                    .await?;
            }
            let alpha_role_id = alpha_role_id.expect("alpha role id recorded above");

            let mut interaction_map = std::collections::HashMap::new();
            for interaction_def in &bundle.interactions {
                let interaction_id = Uuid::new_v4();
                interaction_map.insert(interaction_def.interaction_id, interaction_id);
                store
                    .insert_interaction(
                        tx.as_mut(),
                        &Interaction {
                            interaction_id,
                            workflow_id,
                            name: interaction_def.name.clone(),
                            description: interaction_def.description.clone(),
                        },
                    )
                    .await?;
            }

            let mut component_map = std::collections::HashMap::new();
            let mut alpha_outbound_interaction_id = None;
            let mut alpha_outbound_component_id = None;
            for component_def in &bundle.components {
                let component_id = Uuid::new_v4();
                component_map.insert(component_def.component_id, component_id);
                let role_id = *role_map.get(&component_def.role_id).ok_or_else(|| {
                    EngineError::InvalidBlueprint(format!(
                        "component {} references unknown role",
                        component_def.name
                    ))
                })?;
                let interaction_id = *interaction_map
                    .get(&component_def.interaction_id)
                    .ok_or_else(|| {
                        EngineError::InvalidBlueprint(format!(
                            "component {} references unknown interaction",
                            component_def.name
                        ))
                    })?;

                if role_id == alpha_role_id
                    && component_def.direction == ComponentDirection::Outbound
                {
                    alpha_outbound_interaction_id = Some(interaction_id);
                    alpha_outbound_component_id = Some(component_id);
                }

                store
                    .insert_component(
                        tx.as_mut(),
                        &Component {
                            component_id,
                            workflow_id,
                            interaction_id,
                            role_id,
                            direction: component_def.direction,
                            name: component_def.name.clone(),
                        },
                    )
                    .await?;
            }

            let alpha_outbound_interaction_id = alpha_outbound_interaction_id.ok_or_else(|| {
                EngineError::InvalidBlueprint(
                    "no outbound interaction found for Alpha role".to_string(),
                )
            })?;

            let mut alpha_policy = None;
            for guardian_def in &bundle.guardians {
                let Some(component_id) = component_map.get(&guardian_def.component_id) else {
                    continue;
                };
                if Some(*component_id) == alpha_outbound_component_id {
                    // The Alpha outbound gate supplies the routing-policy
                    // snapshot frozen onto the base UOW.
                    alpha_policy = guardian_def.config.get("interaction_policy").cloned();
                }
                store
                    .insert_guardian(
                        tx.as_mut(),
                        &Guardian {
                            guardian_id: Uuid::new_v4(),
                            workflow_id,
                            component_id: *component_id,
                            name: guardian_def.name.clone(),
                            kind: guardian_def.kind,
                            config: guardian_def.config.clone(),
                        },
                    )
                    .await?;
            }

            let mut spec = UowSpec::new(instance_id, workflow_id, alpha_outbound_interaction_id);
            spec.attributes = initial_context;
            spec.interaction_policy = alpha_policy;
            spec.max_interactions = self.config().default_max_interactions;
            let uow_id = self.repository().create_in(tx.as_mut(), spec).await?;
            tracing::info!(%instance_id, %uow_id, "workflow instantiated");
            Ok(instance_id)
        }
        .await;

        match result {
            Ok(instance_id) => {
                tx.commit()
                    .await
                    .map_err(|e| EngineError::InstantiationFailed(e.to_string()))?;
                self.emit_event(
                    "workflow_instantiated",
                    json!({
                        "instance_id": instance_id.to_string(),
                        "template_id": template_id.to_string(),
                    }),
                )
                .await;
                Ok(instance_id)
            }
            Err(EngineError::InvalidBlueprint(detail)) => {
                let _ = tx.rollback().await;
                Err(EngineError::InvalidBlueprint(detail))
            }
            Err(error) => {
                let _ = tx.rollback().await;
                Err(EngineError::InstantiationFailed(error.to_string()))
            }
        }
    }

    //─────────────────────────────
    //  Checkout
    //─────────────────────────────

    /// Atomic find-and-lock: scan the role's inbound queues for a PENDING
    /// token that passes its gate, claim it with the compare-and-swap, apply
    /// conditional injection and hand it out with the actor's memory context.
    ///
    /// Rejected candidates travel the Ate Path to the Epsilon queue; `None`
    /// means no admissible work.
    pub async fn checkout_work(
        &self,
        actor_id: Uuid,
        role_id: Uuid,
    ) -> EngineResult<Option<Checkout>> {
        // The role must exist before the assignment check means anything.
        self.store().get_role(role_id).await?;
        if !self.store().has_active_assignment(actor_id, role_id).await? {
            return Err(EngineError::NotAuthorized { actor_id, role_id });
        }

        let inbound = self
            .store()
            .components_for_role(role_id, ComponentDirection::Inbound)
            .await?;
        if inbound.is_empty() {
            return Ok(None);
        }
        let queue_ids: Vec<Uuid> = inbound.iter().map(|c| c.interaction_id).collect();

        let candidates = self.repository().find_pending_at(&queue_ids).await?;

        for candidate in candidates {
            let Some(component) = inbound
                .iter()
                .find(|c| c.interaction_id == candidate.current_interaction_id)
            else {
                continue;
            };
            let guard = self
                .store()
                .guardian_for_component(component.component_id)
                .await?;
            let attributes = self.repository().current_attributes(candidate.uow_id).await?;

            let mut admitted = true;
            if let Some(guard) = &guard {
                if guard.kind == GuardKind::Cerberus
                    && candidate.finished_child_count != candidate.child_count
                {
                    // Reconciliation pending: not a rejection, the set is
                    // simply not complete yet.
                    continue;
                }
                match evaluate_guard(guard, &attributes) {
                    Ok(allowed) => admitted = allowed,
                    Err(error) => {
                        admitted = false;
                        self.shadow_log(
                            &candidate,
                            Some(role_id),
                            &format!("guard '{}' evaluation failed", guard.name),
                            &error.to_string(),
                            &attributes,
                        );
                    }
                }
            }

            if !admitted {
                self.route_to_ate_path(&candidate, guard.as_ref()).await?;
                continue;
            }

            match self
                .repository()
                .checkout_lock(candidate.uow_id, actor_id, self.guard_context().as_ref())
                .await?
            {
                LockOutcome::Locked => {}
                LockOutcome::Lost => continue,
                LockOutcome::Stalled => {
                    self.emit_event(
                        "ambiguity_lock_detected",
                        json!({
                            "uow_id": candidate.uow_id.to_string(),
                            "interaction_count": candidate.interaction_count + 1,
                        }),
                    )
                    .await;
                    continue;
                }
            }

            if let Some(guard) = guard
                .as_ref()
                .filter(|g| g.kind == GuardKind::ConditionalInjector)
            {
                self.apply_injection(&candidate, guard, &attributes, role_id)
                    .await?;
            }

            let context = self.build_memory_context(role_id, actor_id).await?;

            self.record_telemetry(TelemetryEntry {
                instance_id: candidate.instance_id,
                uow_id: candidate.uow_id,
                actor_id,
                role_id,
                interaction_id: candidate.current_interaction_id,
                log_type: LogKind::Interaction,
                event_details: Some(json!({ "event": "checkout" })),
                error_metadata: None,
                timestamp: Utc::now(),
            });

            return Ok(Some(Checkout {
                uow_id: candidate.uow_id,
                attributes,
                context,
            }));
        }

        Ok(None)
    }

    //─────────────────────────────
    //  Submit
    //─────────────────────────────

    /// Submit the results of a completed task: append changed attributes at
    /// the next versions, harvest any learned rule, pick the next queue and
    /// release the lock.
    pub async fn submit_work(
        &self,
        uow_id: Uuid,
        actor_id: Uuid,
        result_attributes: AttrMap,
        reasoning: Option<String>,
    ) -> EngineResult<()> {
        let record = self.repository().get(uow_id).await?;
        self.require_lock(&record.uow, actor_id)?;

        // Harvest before the status flips; failures never fail the submit.
        if let Some(learning_role) = self
            .store()
            .role_consuming_interaction(record.uow.current_interaction_id)
            .await?
        {
            if let Err(error) = self
                .harvest_experience(&record.uow, actor_id, learning_role.role_id, &result_attributes)
                .await
            {
                tracing::warn!(%uow_id, %error, "learning harvest failed");
            }
        }

        let mut payload = result_attributes;
        payload.remove(LEARNED_RULE_KEY);

        // Routing: the policy snapshot decides; otherwise the submitting
        // role's default outbound queue; a dead end completes the token.
        let mut merged = record.attributes.clone();
        for (key, value) in &payload {
            merged.insert(key.clone(), value.clone());
        }
        let next_interaction = self.resolve_next_interaction(&record.uow, &merged).await?;

        let reasoning =
            reasoning.unwrap_or_else(|| format!("Work submitted by actor {actor_id}"));
        let update = match next_interaction {
            Some(next) => StateUpdate::to(UowStatus::Pending)
                .with_payload(payload)
                .by(actor_id)
                .because(reasoning)
                .move_to(next)
                .clearing_heartbeat(),
            None => StateUpdate::to(UowStatus::Completed)
                .with_payload(payload)
                .by(actor_id)
                .because(reasoning)
                .clearing_heartbeat(),
        };
        let saved = self
            .repository()
            .update_state(uow_id, update, self.guard_context().as_ref())
            .await?;

        // Cerberus reconciliation: a finished child counts on its parent.
        if saved.uow.status == UowStatus::Completed {
            if let Some(parent_id) = saved.uow.parent_id {
                self.repository().record_child_finished(parent_id).await?;
            }
        }

        self.record_telemetry(TelemetryEntry {
            instance_id: saved.uow.instance_id,
            uow_id,
            actor_id,
            role_id: Uuid::nil(),
            interaction_id: saved.uow.current_interaction_id,
            log_type: LogKind::Interaction,
            event_details: Some(json!({
                "event": "submit",
                "outcome": saved.uow.status.as_str(),
            })),
            error_metadata: None,
            timestamp: Utc::now(),
        });

        Ok(())
    }

    //─────────────────────────────
    //  Failure reporting
    //─────────────────────────────

    /// Explicitly flag a checked-out UOW as failed, recording the error and
    /// routing it down the Ate Path to the Epsilon queue.
    pub async fn report_failure(
        &self,
        uow_id: Uuid,
        actor_id: Uuid,
        error_code: &str,
        details: Option<String>,
    ) -> EngineResult<()> {
        let record = self.repository().get(uow_id).await?;
        self.require_lock(&record.uow, actor_id)?;

        let ate_interaction = self
            .store()
            .inbound_interaction_for_kind(record.uow.workflow_id, RoleKind::Epsilon)
            .await?;

        let mut update = StateUpdate::to(UowStatus::Failed)
            .set(
                "_error",
                json!({
                    "error_code": error_code,
                    "details": details,
                    "timestamp": Utc::now().to_rfc3339(),
                    "actor_id": actor_id.to_string(),
                }),
            )
            .by(actor_id)
            .because(format!("Failure reported: {error_code}"))
            .clearing_heartbeat()
            .with_event_payload(json!({ "error_code": error_code }));
        if let Some(ate) = ate_interaction {
            update = update.move_to(ate);
        }
        let saved = self
            .repository()
            .update_state(uow_id, update, self.guard_context().as_ref())
            .await?;

        self.record_telemetry(TelemetryEntry {
            instance_id: saved.uow.instance_id,
            uow_id,
            actor_id,
            role_id: Uuid::nil(),
            interaction_id: saved.uow.current_interaction_id,
            log_type: LogKind::Interaction,
            event_details: Some(json!({ "event": "failure", "error_code": error_code })),
            error_metadata: None,
            timestamp: Utc::now(),
        });

        Ok(())
    }

    //─────────────────────────────
    //  Heartbeat
    //─────────────────────────────

    /// Signal continued liveness on a checked-out UOW. Idempotent; only the
    /// heartbeat timestamp moves.
    pub async fn heartbeat(&self, uow_id: Uuid, actor_id: Uuid) -> EngineResult<bool> {
        let record = self.repository().get(uow_id).await?;
        if let Some(owner) = record.uow.locked_by {
            if owner != actor_id {
                return Err(EngineError::NotLocked {
                    uow_id,
                    status: record.uow.status.to_string(),
                });
            }
        }
        Ok(self.repository().heartbeat(uow_id).await?)
    }

    //─────────────────────────────
    //  Decomposition
    //─────────────────────────────

    /// Decompose a checked-out base UOW into child UOWs (Beta roles).
    ///
    /// Children are born PENDING at the Beta role's outbound queue with the
    /// parent's policy snapshot; the parent's `child_count` moves in the same
    /// transaction as each insert, so Cerberus reconciliation at Omega sees
    /// consistent counters.
    pub async fn spawn_child_uows(
        &self,
        parent_id: Uuid,
        actor_id: Uuid,
        children: Vec<ChildSpec>,
    ) -> EngineResult<Vec<Uuid>> {
        let record = self.repository().get(parent_id).await?;
        self.require_lock(&record.uow, actor_id)?;

        let role = self
            .store()
            .role_consuming_interaction(record.uow.current_interaction_id)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidBlueprint(
                    "no role consumes the parent's current interaction".to_string(),
                )
            })?;
        let outbound = self
            .store()
            .components_for_role(role.role_id, ComponentDirection::Outbound)
            .await?;
        let target = outbound.first().ok_or_else(|| {
            EngineError::InvalidBlueprint(format!(
                "role {} has no outbound interaction for decomposition",
                role.name
            ))
        })?;

        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            let mut spec = UowSpec::new(
                record.uow.instance_id,
                record.uow.workflow_id,
                target.interaction_id,
            );
            spec.attributes = child.attributes;
            spec.attribute_author = actor_id;
            spec.attribute_reasoning = "Decomposed from base UOW".to_string();
            spec.interaction_policy = record.uow.interaction_policy.clone();
            spec.max_interactions = child.max_interactions;
            let child_id = self.repository().register_child(parent_id, spec).await?;
            child_ids.push(child_id);
        }

        Ok(child_ids)
    }

    //─────────────────────────────
    //  Helpers
    //─────────────────────────────

    fn require_lock(&self, uow: &Uow, actor_id: Uuid) -> EngineResult<()> {
        if uow.status != UowStatus::Active {
            return Err(EngineError::NotLocked {
                uow_id: uow.uow_id,
                status: uow.status.to_string(),
            });
        }
        // Rows locked before the locked_by column existed carry NULL and
        // match any caller.
        if let Some(owner) = uow.locked_by {
            if owner != actor_id {
                return Err(EngineError::NotLocked {
                    uow_id: uow.uow_id,
                    status: uow.status.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn resolve_next_interaction(
        &self,
        uow: &Uow,
        merged_attributes: &AttrMap,
    ) -> EngineResult<Option<Uuid>> {
        if let Some(policy_value) = &uow.interaction_policy {
            let policy = RoutePolicy::parse(policy_value)?;
            if !policy.is_empty() {
                let scope = evaluation_scope(uow, merged_attributes);
                let (decision, errors) = policy.route(&scope);
                for (condition, error) in errors {
                    self.shadow_log(
                        uow,
                        None,
                        &condition,
                        &error.to_string(),
                        merged_attributes,
                    );
                }
                if let RouteDecision::Next(name) = decision {
                    match self
                        .store()
                        .interaction_by_name(uow.workflow_id, &name)
                        .await?
                    {
                        Some(interaction) => return Ok(Some(interaction.interaction_id)),
                        None => {
                            tracing::warn!(
                                uow_id = %uow.uow_id,
                                target = %name,
                                "policy routed to unknown interaction, falling through"
                            );
                        }
                    }
                }
            }
        }

        // Default: the submitting role's first outbound queue.
        let Some(role) = self
            .store()
            .role_consuming_interaction(uow.current_interaction_id)
            .await?
        else {
            return Ok(None);
        };
        let outbound = self
            .store()
            .components_for_role(role.role_id, ComponentDirection::Outbound)
            .await?;
        Ok(outbound.first().map(|c| c.interaction_id))
    }

    async fn route_to_ate_path(
        &self,
        candidate: &Uow,
        guard: Option<&Guardian>,
    ) -> EngineResult<()> {
        let Some(ate_interaction) = self
            .store()
            .inbound_interaction_for_kind(candidate.workflow_id, RoleKind::Epsilon)
            .await?
        else {
            // No error handler declared; the token stays where it is.
            tracing::warn!(uow_id = %candidate.uow_id, "guard rejected but no Epsilon queue exists");
            return Ok(());
        };

        let timestamp = Utc::now();
        let update = StateUpdate::to(UowStatus::Failed)
            .set(
                "_guard_rejection",
                json!({
                    "error_code": "GUARD_REJECTION",
                    "rule": "guard criteria not met",
                    "details": format!(
                        "Criteria failed for guard: {}",
                        guard.map(|g| g.name.as_str()).unwrap_or("unknown")
                    ),
                    "guard_name": guard.map(|g| g.name.clone()),
                    "guard_type": guard.map(|g| g.kind.as_str()),
                    "timestamp": timestamp.to_rfc3339(),
                    "actor_id": SYSTEM_ACTOR_ID.to_string(),
                }),
            )
            .because("Guard criteria not met")
            .move_to(ate_interaction)
            .administrative()
            .clearing_heartbeat();
        self.repository()
            .update_state(candidate.uow_id, update, self.guard_context().as_ref())
            .await?;

        self.record_telemetry(TelemetryEntry {
            instance_id: candidate.instance_id,
            uow_id: candidate.uow_id,
            actor_id: SYSTEM_ACTOR_ID,
            role_id: Uuid::nil(),
            interaction_id: candidate.current_interaction_id,
            log_type: LogKind::GuardianDecision,
            event_details: Some(json!({
                "guardian_name": guard.map(|g| g.name.clone()),
                "decision": "rejected",
            })),
            error_metadata: None,
            timestamp,
        });

        Ok(())
    }

    async fn apply_injection(
        &self,
        candidate: &Uow,
        guard: &Guardian,
        attributes: &AttrMap,
        role_id: Uuid,
    ) -> EngineResult<()> {
        let scope = evaluation_scope(candidate, attributes);
        let plan = match plan_injection(guard, &scope, self.router()) {
            Ok(plan) => plan,
            Err(error) => {
                // A malformed injector must not block admission.
                self.shadow_log(
                    candidate,
                    Some(role_id),
                    &format!("injector '{}' misconfigured", guard.name),
                    &error.to_string(),
                    attributes,
                );
                return Ok(());
            }
        };

        for (condition, error) in &plan.errors {
            self.shadow_log(
                candidate,
                Some(role_id),
                condition,
                &error.to_string(),
                attributes,
            );
        }

        if let Some(outcome) = plan.outcome {
            self.repository()
                .record_injection(
                    candidate.uow_id,
                    InjectionUpdate {
                        model_id: outcome.model_id,
                        instructions: outcome.instructions,
                        knowledge_fragments: outcome.knowledge_fragments,
                        audit: outcome.audit,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Capture an evaluation failure into the telemetry stream without
    /// interrupting execution.
    pub(crate) fn shadow_log(
        &self,
        uow: &Uow,
        role_id: Option<Uuid>,
        condition: &str,
        message: &str,
        variables: &AttrMap,
    ) {
        let recorded = self.telemetry().record(TelemetryEntry {
            instance_id: uow.instance_id,
            uow_id: uow.uow_id,
            actor_id: SYSTEM_ACTOR_ID,
            role_id: role_id.unwrap_or_else(Uuid::nil),
            interaction_id: uow.current_interaction_id,
            log_type: LogKind::Error,
            event_details: None,
            error_metadata: Some(json!({
                "error_message": message,
                "condition": condition,
                "variables": variables,
                "timestamp": Utc::now().to_rfc3339(),
            })),
            timestamp: Utc::now(),
        });
        if !recorded {
            tracing::warn!(uow_id = %uow.uow_id, "telemetry buffer full, shadow entry dropped");
        }
    }

    pub(crate) fn record_telemetry(&self, entry: TelemetryEntry) {
        if !self.telemetry().record(entry) {
            tracing::warn!("telemetry buffer full, entry dropped");
        }
    }
}
