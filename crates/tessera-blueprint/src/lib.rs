#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-blueprint** – YAML blueprint import and topology validation.
//!
//! A blueprint document names its pieces; ids exist only after import. The
//! importer parses the YAML, validates the topology rules R1–R10, resolves
//! names to fresh UUIDs and persists the bundle into the blueprint store.
//! Export rebuilds an equivalent document from a stored bundle, so
//! import → export is a fixed point up to field ordering.
//!
//! The rules:
//!
//! | Rule | Requirement |
//! |---|---|
//! | R1–R4 | exactly one ALPHA, OMEGA, EPSILON and TAU role |
//! | R5 | every BETA role declares a decomposition strategy |
//! | R6 | every interaction has at least one producer and one consumer |
//! | R7 | components reference declared names; no duplicate edges |
//! | R8 | EPSILON- and OMEGA-inbound edges carry guardians; OMEGA's is CERBERUS |
//! | R9 | guardian configs are well-formed for their type |
//! | R10 | every DSL condition validates against the declared attributes |

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use tessera_guard::{injector, validate_policy, GuardError};
use tessera_store::{BlueprintBundle, BlueprintStore, StoreError};
use tessera_types::{
    ComponentDef, ComponentDirection, DecompositionStrategy, GuardKind, GuardianDef,
    InteractionDef, RoleDef, RoleKind, WorkflowDef,
};

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by the importer.
#[derive(Debug, Error)]
pub enum BlueprintError {
    /// The document is not valid YAML for the schema.
    #[error("failed to parse blueprint document: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A topology rule was violated.
    #[error("blueprint rule {rule} violated: {detail}")]
    Invalid {
        /// Which rule (R1..R10).
        rule: &'static str,
        /// What went wrong.
        detail: String,
    },

    /// A DSL condition failed validation (R10).
    #[error(transparent)]
    Guard(#[from] GuardError),

    /// The store refused the bundle.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn invalid(rule: &'static str, detail: impl Into<String>) -> BlueprintError {
    BlueprintError::Invalid {
        rule,
        detail: detail.into(),
    }
}

/// Crate-wide result alias.
pub type BlueprintResult<T> = Result<T, BlueprintError>;

//─────────────────────────────
//  Document schema
//─────────────────────────────

/// Top-level blueprint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintDoc {
    /// Workflow metadata.
    pub workflow: WorkflowSection,
    /// Attribute names tokens of this workflow may carry; the permitted set
    /// for every DSL condition.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Role declarations.
    pub roles: Vec<RoleSection>,
    /// Queue declarations.
    pub interactions: Vec<InteractionSection>,
    /// Edge declarations, by role and interaction name.
    pub components: Vec<ComponentSection>,
    /// Gate declarations, by component name.
    #[serde(default)]
    pub guardians: Vec<GuardianSection>,
}

/// Workflow metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Workflow name.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Semantic notes carried to actors.
    #[serde(default)]
    pub ai_context: Option<serde_json::Value>,
    /// Template version.
    #[serde(default = "default_version")]
    pub version: i64,
}

fn default_version() -> i64 {
    1
}

/// One role declaration. `kind` and `strategy` use the storage string forms
/// (`ALPHA`, `HOMOGENEOUS`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSection {
    /// Role name, unique within the document.
    pub name: String,
    /// Functional classification string.
    pub kind: String,
    /// Beta decomposition strategy string.
    #[serde(default)]
    pub strategy: Option<String>,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
    /// Recursive gateway target (an already-imported workflow id).
    #[serde(default)]
    pub child_workflow: Option<Uuid>,
}

/// One queue declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionSection {
    /// Queue name, unique within the document.
    pub name: String,
    /// Human description.
    #[serde(default)]
    pub description: Option<String>,
}

/// One edge declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSection {
    /// Edge name, unique within the document.
    pub name: String,
    /// Role name this edge touches.
    pub role: String,
    /// Interaction name this edge touches.
    pub interaction: String,
    /// `INBOUND` or `OUTBOUND` relative to the role.
    pub direction: String,
}

/// One gate declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianSection {
    /// Gate name.
    pub name: String,
    /// Component name being guarded.
    pub component: String,
    /// Guard type string (`PASS_THRU`, `CRITERIA_GATE`, ...).
    #[serde(rename = "type")]
    pub guard_type: String,
    /// Opaque configuration payload.
    #[serde(default)]
    pub config: serde_json::Value,
}

//─────────────────────────────
//  Parsing and validation
//─────────────────────────────

/// Parse a YAML blueprint document.
pub fn parse_document(yaml: &str) -> BlueprintResult<BlueprintDoc> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Validate the topology rules R1–R10 against a parsed document.
pub fn validate_document(doc: &BlueprintDoc) -> BlueprintResult<()> {
    // Roles parse and singleton kinds hold (R1-R5).
    let mut kind_counts: HashMap<RoleKind, usize> = HashMap::new();
    let mut role_names = HashSet::new();
    for role in &doc.roles {
        if !role_names.insert(role.name.as_str()) {
            return Err(invalid("R7", format!("duplicate role name '{}'", role.name)));
        }
        let kind: RoleKind = role
            .kind
            .parse()
            .map_err(|_| invalid("R1", format!("unknown role kind '{}'", role.kind)))?;
        *kind_counts.entry(kind).or_default() += 1;

        if kind == RoleKind::Beta {
            let strategy = role
                .strategy
                .as_deref()
                .ok_or_else(|| {
                    invalid(
                        "R5",
                        format!("Beta role '{}' declares no decomposition strategy", role.name),
                    )
                })?;
            strategy.parse::<DecompositionStrategy>().map_err(|_| {
                invalid(
                    "R5",
                    format!("Beta role '{}' has unknown strategy '{strategy}'", role.name),
                )
            })?;
        }
    }
    for (rule, kind) in [
        ("R1", RoleKind::Alpha),
        ("R2", RoleKind::Omega),
        ("R3", RoleKind::Epsilon),
        ("R4", RoleKind::Tau),
    ] {
        match kind_counts.get(&kind).copied().unwrap_or(0) {
            1 => {}
            0 => return Err(invalid(rule, format!("no {kind} role declared"))),
            n => return Err(invalid(rule, format!("{n} {kind} roles declared"))),
        }
    }

    // Interactions and components reference declared names (R7).
    let mut interaction_names = HashSet::new();
    for interaction in &doc.interactions {
        if !interaction_names.insert(interaction.name.as_str()) {
            return Err(invalid(
                "R7",
                format!("duplicate interaction name '{}'", interaction.name),
            ));
        }
    }

    let mut component_names = HashSet::new();
    let mut edges = HashSet::new();
    let mut producers: HashSet<&str> = HashSet::new();
    let mut consumers: HashSet<&str> = HashSet::new();
    for component in &doc.components {
        if !component_names.insert(component.name.as_str()) {
            return Err(invalid(
                "R7",
                format!("duplicate component name '{}'", component.name),
            ));
        }
        if !role_names.contains(component.role.as_str()) {
            return Err(invalid(
                "R7",
                format!("component '{}' references unknown role '{}'", component.name, component.role),
            ));
        }
        if !interaction_names.contains(component.interaction.as_str()) {
            return Err(invalid(
                "R7",
                format!(
                    "component '{}' references unknown interaction '{}'",
                    component.name, component.interaction
                ),
            ));
        }
        let direction: ComponentDirection = component.direction.parse().map_err(|_| {
            invalid(
                "R7",
                format!("component '{}' has unknown direction '{}'", component.name, component.direction),
            )
        })?;
        if !edges.insert((
            component.role.as_str(),
            component.interaction.as_str(),
            direction,
        )) {
            return Err(invalid(
                "R7",
                format!(
                    "duplicate edge {} {} '{}'",
                    component.role, component.direction, component.interaction
                ),
            ));
        }
        match direction {
            ComponentDirection::Outbound => producers.insert(component.interaction.as_str()),
            ComponentDirection::Inbound => consumers.insert(component.interaction.as_str()),
        };
    }

    // Every queue has a producer and a consumer (R6).
    for interaction in &doc.interactions {
        if !producers.contains(interaction.name.as_str()) {
            return Err(invalid(
                "R6",
                format!("interaction '{}' has no producer", interaction.name),
            ));
        }
        if !consumers.contains(interaction.name.as_str()) {
            return Err(invalid(
                "R6",
                format!("interaction '{}' has no consumer", interaction.name),
            ));
        }
    }

    // Guard coverage on the mandatory edges (R8) and config shape (R9, R10).
    let role_kinds: HashMap<&str, RoleKind> = doc
        .roles
        .iter()
        .map(|r| (r.name.as_str(), r.kind.parse().expect("validated above")))
        .collect();
    let guarded: HashMap<&str, &GuardianSection> = doc
        .guardians
        .iter()
        .map(|g| (g.component.as_str(), g))
        .collect();

    for guardian in &doc.guardians {
        if !component_names.contains(guardian.component.as_str()) {
            return Err(invalid(
                "R7",
                format!(
                    "guardian '{}' references unknown component '{}'",
                    guardian.name, guardian.component
                ),
            ));
        }
        let kind: GuardKind = guardian.guard_type.parse().map_err(|_| {
            invalid(
                "R9",
                format!("guardian '{}' has unknown type '{}'", guardian.name, guardian.guard_type),
            )
        })?;
        validate_guard_config(guardian, kind, doc)?;
    }

    for component in &doc.components {
        let direction: ComponentDirection = component.direction.parse().expect("validated above");
        if direction != ComponentDirection::Inbound {
            continue;
        }
        match role_kinds.get(component.role.as_str()) {
            Some(RoleKind::Epsilon) => {
                if !guarded.contains_key(component.name.as_str()) {
                    return Err(invalid(
                        "R8",
                        format!("Epsilon inbound component '{}' has no guardian", component.name),
                    ));
                }
            }
            Some(RoleKind::Omega) => {
                let guardian = guarded.get(component.name.as_str()).ok_or_else(|| {
                    invalid(
                        "R8",
                        format!("Omega inbound component '{}' has no guardian", component.name),
                    )
                })?;
                if guardian.guard_type != GuardKind::Cerberus.as_str() {
                    return Err(invalid(
                        "R8",
                        format!(
                            "Omega inbound component '{}' must be guarded by CERBERUS, found {}",
                            component.name, guardian.guard_type
                        ),
                    ));
                }
            }
            _ => {}
        }
    }

    Ok(())
}

fn permitted_attributes(doc: &BlueprintDoc) -> HashSet<String> {
    doc.attributes.iter().cloned().collect()
}

fn validate_guard_config(
    guardian: &GuardianSection,
    kind: GuardKind,
    doc: &BlueprintDoc,
) -> BlueprintResult<()> {
    let config = &guardian.config;
    let permitted = permitted_attributes(doc);

    match kind {
        GuardKind::CriteriaGate => {
            for field in ["field", "operator"] {
                if config.get(field).and_then(|v| v.as_str()).is_none() {
                    return Err(invalid(
                        "R9",
                        format!("criteria gate '{}' is missing '{field}'", guardian.name),
                    ));
                }
            }
        }
        GuardKind::TtlCheck => {
            if config.get("reference_field").and_then(|v| v.as_str()).is_none()
                || config.get("max_age_seconds").and_then(|v| v.as_f64()).is_none()
            {
                return Err(invalid(
                    "R9",
                    format!(
                        "TTL check '{}' needs 'reference_field' and 'max_age_seconds'",
                        guardian.name
                    ),
                ));
            }
        }
        GuardKind::Composite => {
            let steps = config.get("steps").and_then(|v| v.as_array()).ok_or_else(|| {
                invalid("R9", format!("composite '{}' has no steps", guardian.name))
            })?;
            for step in steps {
                let step_type = step.get("type").and_then(|v| v.as_str()).ok_or_else(|| {
                    invalid("R9", format!("composite '{}' step missing 'type'", guardian.name))
                })?;
                step_type.parse::<GuardKind>().map_err(|_| {
                    invalid(
                        "R9",
                        format!("composite '{}' step has unknown type '{step_type}'", guardian.name),
                    )
                })?;
            }
        }
        GuardKind::ConditionalInjector => {
            injector::validate_rules(config, &permitted)?;
        }
        GuardKind::PassThru | GuardKind::DirectionalFilter | GuardKind::Cerberus => {}
    }

    // Any guard may carry a routing policy; its conditions validate against
    // the declared attribute set (R10).
    if let Some(policy) = config.get("interaction_policy") {
        validate_policy(policy, &permitted)?;
    }
    Ok(())
}

//─────────────────────────────
//  Resolution, import, export
//─────────────────────────────

/// Resolve a validated document into a bundle with fresh UUIDs.
pub fn resolve_document(doc: &BlueprintDoc) -> BlueprintResult<BlueprintBundle> {
    validate_document(doc)?;

    let workflow_id = Uuid::new_v4();
    let workflow = WorkflowDef {
        workflow_id,
        name: doc.workflow.name.clone(),
        description: doc.workflow.description.clone(),
        ai_context: doc.workflow.ai_context.clone(),
        version: doc.workflow.version,
    };

    let mut role_ids = HashMap::new();
    let roles = doc
        .roles
        .iter()
        .map(|role| {
            let role_id = Uuid::new_v4();
            role_ids.insert(role.name.clone(), role_id);
            RoleDef {
                role_id,
                workflow_id,
                name: role.name.clone(),
                description: role.description.clone(),
                ai_context: None,
                kind: role.kind.parse().expect("validated"),
                strategy: role.strategy.as_deref().map(|s| s.parse().expect("validated")),
                child_workflow_id: role.child_workflow,
            }
        })
        .collect();

    let mut interaction_ids = HashMap::new();
    let interactions = doc
        .interactions
        .iter()
        .map(|interaction| {
            let interaction_id = Uuid::new_v4();
            interaction_ids.insert(interaction.name.clone(), interaction_id);
            InteractionDef {
                interaction_id,
                workflow_id,
                name: interaction.name.clone(),
                description: interaction.description.clone(),
            }
        })
        .collect();

    let mut component_ids = HashMap::new();
    let components = doc
        .components
        .iter()
        .map(|component| {
            let component_id = Uuid::new_v4();
            component_ids.insert(component.name.clone(), component_id);
            ComponentDef {
                component_id,
                workflow_id,
                interaction_id: interaction_ids[&component.interaction],
                role_id: role_ids[&component.role],
                direction: component.direction.parse().expect("validated"),
                name: component.name.clone(),
            }
        })
        .collect();

    let guardians = doc
        .guardians
        .iter()
        .map(|guardian| GuardianDef {
            guardian_id: Uuid::new_v4(),
            workflow_id,
            component_id: component_ids[&guardian.component],
            name: guardian.name.clone(),
            kind: guardian.guard_type.parse().expect("validated"),
            config: guardian.config.clone(),
        })
        .collect();

    Ok(BlueprintBundle {
        workflow,
        roles,
        interactions,
        components,
        guardians,
    })
}

/// Parse, validate, resolve and persist a YAML blueprint. Returns the new
/// workflow id.
pub async fn import_yaml(store: &BlueprintStore, yaml: &str) -> BlueprintResult<Uuid> {
    let doc = parse_document(yaml)?;
    let bundle = resolve_document(&doc)?;
    let workflow_id = bundle.workflow.workflow_id;
    store.insert_bundle(&bundle).await?;
    tracing::info!(%workflow_id, name = %bundle.workflow.name, "blueprint imported");
    Ok(workflow_id)
}

/// Rebuild the document form of a stored blueprint.
///
/// Attribute declarations are not persisted on the bundle; pass the original
/// declaration list to reproduce the imported document exactly.
pub async fn export_document(
    store: &BlueprintStore,
    workflow_id: Uuid,
    attributes: Vec<String>,
) -> BlueprintResult<BlueprintDoc> {
    let bundle = store.fetch_bundle(workflow_id).await?;

    let role_names: HashMap<Uuid, String> = bundle
        .roles
        .iter()
        .map(|r| (r.role_id, r.name.clone()))
        .collect();
    let interaction_names: HashMap<Uuid, String> = bundle
        .interactions
        .iter()
        .map(|i| (i.interaction_id, i.name.clone()))
        .collect();
    let component_names: HashMap<Uuid, String> = bundle
        .components
        .iter()
        .map(|c| (c.component_id, c.name.clone()))
        .collect();

    Ok(BlueprintDoc {
        workflow: WorkflowSection {
            name: bundle.workflow.name,
            description: bundle.workflow.description,
            ai_context: bundle.workflow.ai_context,
            version: bundle.workflow.version,
        },
        attributes,
        roles: bundle
            .roles
            .into_iter()
            .map(|role| RoleSection {
                name: role.name,
                kind: role.kind.as_str().to_string(),
                strategy: role.strategy.map(|s| s.as_str().to_string()),
                description: role.description,
                child_workflow: role.child_workflow_id,
            })
            .collect(),
        interactions: bundle
            .interactions
            .into_iter()
            .map(|interaction| InteractionSection {
                name: interaction.name,
                description: interaction.description,
            })
            .collect(),
        components: bundle
            .components
            .into_iter()
            .map(|component| ComponentSection {
                name: component.name,
                role: role_names[&component.role_id].clone(),
                interaction: interaction_names[&component.interaction_id].clone(),
                direction: component.direction.as_str().to_string(),
            })
            .collect(),
        guardians: bundle
            .guardians
            .into_iter()
            .map(|guardian| GuardianSection {
                name: guardian.name,
                component: component_names[&guardian.component_id].clone(),
                guard_type: guardian.kind.as_str().to_string(),
                config: guardian.config,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_DOC: &str = r#"
workflow:
  name: invoice_review
  description: invoice review pipeline
  version: 2
attributes: [invoice_id, amount, status, risk_score]
roles:
  - name: intake
    kind: ALPHA
  - name: review
    kind: BETA
    strategy: HOMOGENEOUS
  - name: finalize
    kind: OMEGA
  - name: remediate
    kind: EPSILON
  - name: reclaim
    kind: TAU
interactions:
  - name: review_queue
  - name: finalize_queue
  - name: ate_queue
  - name: chronos_queue
components:
  - name: intake_out
    role: intake
    interaction: review_queue
    direction: OUTBOUND
  - name: review_in
    role: review
    interaction: review_queue
    direction: INBOUND
  - name: review_out
    role: review
    interaction: finalize_queue
    direction: OUTBOUND
  - name: finalize_in
    role: finalize
    interaction: finalize_queue
    direction: INBOUND
  - name: remediate_in
    role: remediate
    interaction: ate_queue
    direction: INBOUND
  - name: review_reject
    role: review
    interaction: ate_queue
    direction: OUTBOUND
  - name: reclaim_in
    role: reclaim
    interaction: chronos_queue
    direction: INBOUND
  - name: review_expire
    role: review
    interaction: chronos_queue
    direction: OUTBOUND
guardians:
  - name: review_gate
    component: review_in
    type: CRITERIA_GATE
    config:
      field: amount
      operator: GT
      threshold: 1000
  - name: set_reconciler
    component: finalize_in
    type: CERBERUS
    config: {}
  - name: ate_gate
    component: remediate_in
    type: PASS_THRU
    config: {}
  - name: intake_router
    component: intake_out
    type: DIRECTIONAL_FILTER
    config:
      interaction_policy:
        branches:
          - condition: "risk_score > 8"
            next_interaction: finalize_queue
        default: review_queue
"#;

    #[test]
    fn valid_document_passes_validation() {
        let doc = parse_document(VALID_DOC).unwrap();
        validate_document(&doc).unwrap();
    }

    #[test]
    fn missing_singleton_roles_are_rejected() {
        let doc = parse_document(VALID_DOC).unwrap();

        for (kind, rule) in [("ALPHA", "R1"), ("OMEGA", "R2"), ("EPSILON", "R3"), ("TAU", "R4")] {
            let mut stripped = doc.clone();
            stripped.roles.retain(|r| r.kind != kind);
            stripped
                .components
                .retain(|c| doc.roles.iter().any(|r| r.name == c.role && r.kind != kind));
            stripped
                .guardians
                .retain(|g| stripped.components.iter().any(|c| c.name == g.component));
            // Interactions may lose their only producer/consumer; drop them
            // from the check by keeping only referenced ones.
            stripped.interactions.retain(|i| {
                stripped.components.iter().any(|c| c.interaction == i.name)
            });
            let err = validate_document(&stripped).unwrap_err();
            match err {
                BlueprintError::Invalid { rule: got, .. } => assert_eq!(got, rule),
                other => panic!("expected rule violation, got {other}"),
            }
        }
    }

    #[test]
    fn duplicate_alpha_is_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.roles.push(RoleSection {
            name: "intake2".into(),
            kind: "ALPHA".into(),
            strategy: None,
            description: None,
            child_workflow: None,
        });
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R1", .. }));
    }

    #[test]
    fn beta_without_strategy_is_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.roles
            .iter_mut()
            .find(|r| r.kind == "BETA")
            .unwrap()
            .strategy = None;
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R5", .. }));
    }

    #[test]
    fn interaction_without_producer_is_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.components.retain(|c| c.name != "intake_out");
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R6", .. }));
    }

    #[test]
    fn component_with_unknown_role_is_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.components[0].role = "ghost".into();
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R7", .. }));
    }

    #[test]
    fn duplicate_edges_are_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        let mut dup = doc.components[1].clone();
        dup.name = "review_in_again".into();
        doc.components.push(dup);
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R7", .. }));
    }

    #[test]
    fn unguarded_omega_inbound_is_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.guardians.retain(|g| g.name != "set_reconciler");
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R8", .. }));
    }

    #[test]
    fn omega_guard_must_be_cerberus() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.guardians
            .iter_mut()
            .find(|g| g.name == "set_reconciler")
            .unwrap()
            .guard_type = "PASS_THRU".into();
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R8", .. }));
    }

    #[test]
    fn unguarded_epsilon_inbound_is_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.guardians.retain(|g| g.name != "ate_gate");
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R8", .. }));
    }

    #[test]
    fn malformed_guard_config_is_rejected() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.guardians
            .iter_mut()
            .find(|g| g.name == "review_gate")
            .unwrap()
            .config = serde_json::json!({"field": "amount"});
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Invalid { rule: "R9", .. }));
    }

    #[test]
    fn policy_conditions_validate_against_declared_attributes() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.guardians
            .iter_mut()
            .find(|g| g.name == "intake_router")
            .unwrap()
            .config = serde_json::json!({
            "interaction_policy": {
                "branches": [
                    {"condition": "undeclared_attr > 8", "next_interaction": "finalize_queue"}
                ]
            }
        });
        let err = validate_document(&doc).unwrap_err();
        assert!(matches!(err, BlueprintError::Guard(_)));
    }

    #[test]
    fn reserved_metadata_is_always_permitted_in_policies() {
        let mut doc = parse_document(VALID_DOC).unwrap();
        doc.guardians
            .iter_mut()
            .find(|g| g.name == "intake_router")
            .unwrap()
            .config = serde_json::json!({
            "interaction_policy": {
                "branches": [
                    {"condition": "finished_child_count == child_count",
                     "next_interaction": "finalize_queue"}
                ]
            }
        });
        validate_document(&doc).unwrap();
    }

    #[tokio::test]
    async fn import_then_export_is_a_fixed_point() {
        let store = BlueprintStore::in_memory().await.unwrap();
        let doc = parse_document(VALID_DOC).unwrap();

        let workflow_id = import_yaml(&store, VALID_DOC).await.unwrap();
        let exported = export_document(&store, workflow_id, doc.attributes.clone())
            .await
            .unwrap();

        // Fixed point up to field ordering: compare section sets.
        assert_eq!(exported.workflow, doc.workflow);
        assert_eq!(exported.attributes, doc.attributes);
        let sort_by_name = |mut v: Vec<RoleSection>| {
            v.sort_by(|a, b| a.name.cmp(&b.name));
            v
        };
        assert_eq!(sort_by_name(exported.roles.clone()), sort_by_name(doc.roles.clone()));
        assert_eq!(exported.interactions.len(), doc.interactions.len());
        assert_eq!(exported.components.len(), doc.components.len());
        for component in &doc.components {
            let found = exported
                .components
                .iter()
                .find(|c| c.name == component.name)
                .unwrap();
            assert_eq!(found, component);
        }
        for guardian in &doc.guardians {
            let found = exported
                .guardians
                .iter()
                .find(|g| g.name == guardian.name)
                .unwrap();
            assert_eq!(found, guardian);
        }

        // And the exported document re-imports cleanly.
        let yaml = serde_yaml::to_string(&exported).unwrap();
        import_yaml(&store, &yaml).await.unwrap();
    }

    #[test]
    fn garbage_yaml_is_a_parse_error() {
        let err = parse_document("not: [valid").unwrap_err();
        assert!(matches!(err, BlueprintError::Parse(_)));
    }
}
