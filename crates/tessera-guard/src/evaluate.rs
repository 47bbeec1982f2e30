//! Guard dispatch.
//!
//! Blocking guards gate admission at checkout: they receive the candidate's
//! current attribute map and answer allow/reject. Evaluation failures bubble
//! up as errors so the caller can shadow-log them; the caller treats them as
//! rejection.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use tessera_types::{AttrMap, GuardKind, Guardian, Uow};

use crate::{GuardError, GuardResult};

/// Evaluate a blocking guard against a candidate UOW's attribute map.
///
/// `PASS_THRU`, `DIRECTIONAL_FILTER`, `CERBERUS` and `CONDITIONAL_INJECTOR`
/// always admit here: filters route rather than block, injectors mutate after
/// admission, and Cerberus reconciliation is checked by the engine against
/// the child-set counters.
pub fn evaluate_guard(guard: &Guardian, attributes: &AttrMap) -> GuardResult<bool> {
    match guard.kind {
        GuardKind::PassThru
        | GuardKind::DirectionalFilter
        | GuardKind::Cerberus
        | GuardKind::ConditionalInjector => Ok(true),
        GuardKind::CriteriaGate => Ok(criteria_gate(&guard.config, attributes)),
        GuardKind::TtlCheck => Ok(ttl_check(&guard.config, attributes)),
        GuardKind::Composite => composite(guard, attributes),
    }
}

/// Build the DSL evaluation scope: the attribute map plus the reserved
/// metadata names (`uow_id`, `child_count`, `finished_child_count`,
/// `status`, `parent_id`).
pub fn evaluation_scope(uow: &Uow, attributes: &AttrMap) -> AttrMap {
    let mut scope = attributes.clone();
    scope.insert("uow_id".into(), Value::String(uow.uow_id.to_string()));
    scope.insert("child_count".into(), Value::from(uow.child_count));
    scope.insert(
        "finished_child_count".into(),
        Value::from(uow.finished_child_count),
    );
    scope.insert("status".into(), Value::String(uow.status.to_string()));
    scope.insert(
        "parent_id".into(),
        uow.parent_id
            .map(|id| Value::String(id.to_string()))
            .unwrap_or(Value::Null),
    );
    scope
}

/// Compare `attr[field]` to `threshold` under GT/LT/EQ/IN. Missing
/// configuration, a missing attribute or an unknown operator reject.
fn criteria_gate(config: &Value, attributes: &AttrMap) -> bool {
    let Some(field) = config.get("field").and_then(Value::as_str) else {
        return false;
    };
    let Some(operator) = config.get("operator").and_then(Value::as_str) else {
        return false;
    };
    let threshold = config.get("threshold").cloned().unwrap_or(Value::Null);

    let Some(field_value) = attributes.get(field) else {
        return false;
    };

    match operator {
        "GT" => ordered(field_value, &threshold)
            .map(|o| o == std::cmp::Ordering::Greater)
            .unwrap_or(false),
        "LT" => ordered(field_value, &threshold)
            .map(|o| o == std::cmp::Ordering::Less)
            .unwrap_or(false),
        "EQ" => field_value == &threshold,
        "IN" => match &threshold {
            Value::Array(items) => items.contains(field_value),
            _ => false,
        },
        _ => false,
    }
}

fn ordered(lhs: &Value, rhs: &Value) -> Option<std::cmp::Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Allow iff `(now - attr[reference_field]) <= max_age_seconds`. The
/// reference parses as ISO-8601; a naive timestamp is assumed UTC. Any
/// missing or malformed input rejects.
fn ttl_check(config: &Value, attributes: &AttrMap) -> bool {
    let Some(reference_field) = config.get("reference_field").and_then(Value::as_str) else {
        return false;
    };
    let Some(max_age_seconds) = config.get("max_age_seconds").and_then(Value::as_f64) else {
        return false;
    };
    let Some(Value::String(raw)) = attributes.get(reference_field) else {
        return false;
    };
    let Some(reference) = parse_iso8601(raw) else {
        return false;
    };

    let age = Utc::now().signed_duration_since(reference);
    age.num_milliseconds() as f64 / 1000.0 <= max_age_seconds
}

fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    // Naive timestamps are assumed UTC.
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// Recursively evaluate `steps` under AND/OR logic. Each step is synthesized
/// as a temporary guard from its `{type, config}` tuple. No steps or an
/// unknown logic string reject; an unknown step type is an error.
fn composite(guard: &Guardian, attributes: &AttrMap) -> GuardResult<bool> {
    let logic = guard
        .config
        .get("logic")
        .and_then(Value::as_str)
        .unwrap_or("AND")
        .to_uppercase();
    let Some(steps) = guard.config.get("steps").and_then(Value::as_array) else {
        return Ok(false);
    };
    if steps.is_empty() {
        return Ok(false);
    }

    let mut step_guards = Vec::with_capacity(steps.len());
    for step in steps {
        step_guards.push(synthesize_step(guard, step)?);
    }

    match logic.as_str() {
        "AND" => {
            for step_guard in &step_guards {
                if !evaluate_guard(step_guard, attributes)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "OR" => {
            for step_guard in &step_guards {
                if evaluate_guard(step_guard, attributes)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

fn synthesize_step(parent: &Guardian, step: &Value) -> GuardResult<Guardian> {
    let type_text = step
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GuardError::InvalidConfig("composite step missing 'type'".into()))?;
    let kind: GuardKind = type_text
        .parse()
        .map_err(|_| GuardError::UnknownGuardType(type_text.to_string()))?;
    Ok(Guardian {
        guardian_id: Uuid::new_v4(),
        workflow_id: parent.workflow_id,
        component_id: parent.component_id,
        name: format!("{}_step", parent.name),
        kind,
        config: step.get("config").cloned().unwrap_or(Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn guard(kind: GuardKind, config: Value) -> Guardian {
        Guardian {
            guardian_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            component_id: Uuid::new_v4(),
            name: "test_guard".into(),
            kind,
            config,
        }
    }

    fn attrs(pairs: &[(&str, Value)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn pass_thru_always_admits() {
        let g = guard(GuardKind::PassThru, json!({}));
        assert!(evaluate_guard(&g, &AttrMap::new()).unwrap());
    }

    #[test]
    fn directional_filter_and_cerberus_never_block() {
        for kind in [GuardKind::DirectionalFilter, GuardKind::Cerberus] {
            let g = guard(kind, json!({}));
            assert!(evaluate_guard(&g, &AttrMap::new()).unwrap());
        }
    }

    #[test]
    fn criteria_gate_thresholds() {
        let g = guard(
            GuardKind::CriteriaGate,
            json!({"field": "amount", "operator": "GT", "threshold": 1000}),
        );
        assert!(evaluate_guard(&g, &attrs(&[("amount", json!(1500))])).unwrap());
        assert!(!evaluate_guard(&g, &attrs(&[("amount", json!(500))])).unwrap());
        // Missing attribute rejects.
        assert!(!evaluate_guard(&g, &AttrMap::new()).unwrap());
    }

    #[test]
    fn criteria_gate_eq_and_in() {
        let eq = guard(
            GuardKind::CriteriaGate,
            json!({"field": "status", "operator": "EQ", "threshold": "approved"}),
        );
        assert!(evaluate_guard(&eq, &attrs(&[("status", json!("approved"))])).unwrap());
        assert!(!evaluate_guard(&eq, &attrs(&[("status", json!("pending"))])).unwrap());

        let contains = guard(
            GuardKind::CriteriaGate,
            json!({"field": "region", "operator": "IN", "threshold": ["eu", "us"]}),
        );
        assert!(evaluate_guard(&contains, &attrs(&[("region", json!("eu"))])).unwrap());
        assert!(!evaluate_guard(&contains, &attrs(&[("region", json!("apac"))])).unwrap());
    }

    #[test]
    fn criteria_gate_missing_config_rejects() {
        let g = guard(GuardKind::CriteriaGate, json!({"field": "amount"}));
        assert!(!evaluate_guard(&g, &attrs(&[("amount", json!(5))])).unwrap());

        let unknown_op = guard(
            GuardKind::CriteriaGate,
            json!({"field": "amount", "operator": "BETWEEN", "threshold": 1}),
        );
        assert!(!evaluate_guard(&unknown_op, &attrs(&[("amount", json!(5))])).unwrap());
    }

    #[test]
    fn ttl_check_admits_fresh_and_rejects_stale() {
        let g = guard(
            GuardKind::TtlCheck,
            json!({"reference_field": "submitted_at", "max_age_seconds": 3600}),
        );

        let fresh = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
        assert!(evaluate_guard(&g, &attrs(&[("submitted_at", json!(fresh))])).unwrap());

        let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        assert!(!evaluate_guard(&g, &attrs(&[("submitted_at", json!(stale))])).unwrap());
    }

    #[test]
    fn ttl_check_assumes_utc_for_naive_timestamps() {
        let g = guard(
            GuardKind::TtlCheck,
            json!({"reference_field": "submitted_at", "max_age_seconds": 3600}),
        );
        let naive = (Utc::now() - chrono::Duration::minutes(5))
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        assert!(evaluate_guard(&g, &attrs(&[("submitted_at", json!(naive))])).unwrap());
    }

    #[test]
    fn ttl_check_rejects_garbage() {
        let g = guard(
            GuardKind::TtlCheck,
            json!({"reference_field": "submitted_at", "max_age_seconds": 3600}),
        );
        assert!(!evaluate_guard(&g, &attrs(&[("submitted_at", json!("yesterday"))])).unwrap());
        assert!(!evaluate_guard(&g, &AttrMap::new()).unwrap());
    }

    #[test]
    fn composite_and_requires_every_step() {
        let g = guard(
            GuardKind::Composite,
            json!({
                "logic": "AND",
                "steps": [
                    {"type": "CRITERIA_GATE", "config": {"field": "amount", "operator": "GT", "threshold": 100}},
                    {"type": "CRITERIA_GATE", "config": {"field": "region", "operator": "EQ", "threshold": "eu"}},
                ]
            }),
        );
        let passing = attrs(&[("amount", json!(500)), ("region", json!("eu"))]);
        assert!(evaluate_guard(&g, &passing).unwrap());

        let failing = attrs(&[("amount", json!(500)), ("region", json!("us"))]);
        assert!(!evaluate_guard(&g, &failing).unwrap());
    }

    #[test]
    fn composite_or_needs_one_step() {
        let g = guard(
            GuardKind::Composite,
            json!({
                "logic": "OR",
                "steps": [
                    {"type": "CRITERIA_GATE", "config": {"field": "amount", "operator": "GT", "threshold": 1000}},
                    {"type": "PASS_THRU", "config": {}},
                ]
            }),
        );
        assert!(evaluate_guard(&g, &attrs(&[("amount", json!(1))])).unwrap());
    }

    #[test]
    fn composite_without_steps_rejects() {
        let g = guard(GuardKind::Composite, json!({"logic": "AND", "steps": []}));
        assert!(!evaluate_guard(&g, &AttrMap::new()).unwrap());
    }

    #[test]
    fn composite_with_unknown_step_type_errors() {
        let g = guard(
            GuardKind::Composite,
            json!({"logic": "AND", "steps": [{"type": "ORACLE", "config": {}}]}),
        );
        let err = evaluate_guard(&g, &AttrMap::new()).unwrap_err();
        assert!(matches!(err, GuardError::UnknownGuardType(t) if t == "ORACLE"));
    }

    #[test]
    fn scope_carries_reserved_metadata() {
        let uow = Uow {
            uow_id: Uuid::new_v4(),
            instance_id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            parent_id: None,
            current_interaction_id: Uuid::new_v4(),
            status: tessera_types::UowStatus::Pending,
            child_count: 3,
            finished_child_count: 1,
            last_heartbeat: None,
            locked_by: None,
            content_hash: String::new(),
            interaction_count: 0,
            max_interactions: None,
            retry_count: 0,
            interaction_policy: None,
            model_id: None,
            injected_instructions: None,
            knowledge_fragment_refs: vec![],
            mutation_audit_log: vec![],
            created_at: Utc::now(),
        };
        let scope = evaluation_scope(&uow, &attrs(&[("amount", json!(5))]));

        assert_eq!(scope["child_count"], json!(3));
        assert_eq!(scope["finished_child_count"], json!(1));
        assert_eq!(scope["status"], json!("PENDING"));
        assert_eq!(scope["parent_id"], Value::Null);
        assert_eq!(scope["amount"], json!(5));

        assert!(crate::dsl::evaluate("child_count <= 5 and status == 'PENDING'", &scope).unwrap());
        assert!(crate::dsl::evaluate("parent_id == None", &scope).unwrap());
    }
}
