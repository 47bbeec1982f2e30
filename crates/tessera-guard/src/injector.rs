//! Conditional-injector mutation planning.
//!
//! A `CONDITIONAL_INJECTOR` guard carries an ordered list of rules
//! `{condition, action: "mutate", payload}`. Every rule is evaluated against
//! the admission scope; the **last** matching rule supplies the effective
//! mutation. Payloads may override the model (validated against the router's
//! whitelist, with safe failover), append instructions, and union knowledge
//! fragments.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use tessera_types::{AttrMap, Guardian, MutationAuditEntry};

use crate::dsl::{self, DslError};
use crate::router::ModelRouter;
use crate::{GuardError, GuardResult};

/// The effective mutation selected by an injector.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectorOutcome {
    /// Effective model id (failover already applied).
    pub model_id: Option<String>,
    /// Instructions to append to the UOW.
    pub instructions: Option<String>,
    /// Knowledge fragment refs to union in.
    pub knowledge_fragments: Vec<String>,
    /// Audit entry describing the mutation.
    pub audit: MutationAuditEntry,
}

/// The result of planning one injector: the winning mutation, if any, plus
/// every rule-evaluation error encountered on the way (shadow-logged by the
/// caller, never fatal for admission).
#[derive(Debug, Clone, Default)]
pub struct InjectionPlan {
    /// The last-match-wins mutation.
    pub outcome: Option<InjectorOutcome>,
    /// Per-rule evaluation failures, with the failing condition.
    pub errors: Vec<(String, DslError)>,
}

#[derive(Debug, Deserialize)]
struct InjectorRule {
    condition: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    payload: RulePayload,
}

#[derive(Debug, Default, Deserialize)]
struct RulePayload {
    #[serde(default)]
    model_override: Option<String>,
    #[serde(default)]
    instructions: Option<String>,
    #[serde(default)]
    knowledge_fragments: Vec<String>,
}

/// Plan the mutation for one conditional injector.
///
/// Rules are evaluated in order; later matches win, so the plan carries at
/// most one mutation and one audit entry. A rule whose condition fails to
/// evaluate is treated as non-matching and its error is surfaced for the
/// shadow log.
pub fn plan_injection(
    guard: &Guardian,
    scope: &AttrMap,
    router: &ModelRouter,
) -> GuardResult<InjectionPlan> {
    let rules = parse_rules(&guard.config)?;
    let mut plan = InjectionPlan::default();
    let mut winner: Option<&InjectorRule> = None;

    for rule in &rules {
        if rule.action.as_deref() != Some("mutate") {
            continue;
        }
        match dsl::evaluate(&rule.condition, scope) {
            Ok(true) => winner = Some(rule),
            Ok(false) => {}
            Err(error) => plan.errors.push((rule.condition.clone(), error)),
        }
    }

    let Some(rule) = winner else {
        return Ok(plan);
    };

    let mut failover_used = false;
    let mut failover_model = None;
    let model_id = rule.payload.model_override.as_ref().map(|requested| {
        if router.is_whitelisted(requested) {
            requested.clone()
        } else {
            failover_used = true;
            let failover = router.failover_model().to_string();
            failover_model = Some(failover.clone());
            failover
        }
    });

    plan.outcome = Some(InjectorOutcome {
        model_id,
        instructions: rule.payload.instructions.clone(),
        knowledge_fragments: rule.payload.knowledge_fragments.clone(),
        audit: MutationAuditEntry {
            guard_name: guard.name.clone(),
            condition: rule.condition.clone(),
            model_override: rule.payload.model_override.clone(),
            failover_used,
            failover_model,
            timestamp: Utc::now(),
        },
    });
    Ok(plan)
}

fn parse_rules(config: &Value) -> GuardResult<Vec<InjectorRule>> {
    let Some(raw_rules) = config.get("rules") else {
        return Ok(Vec::new());
    };
    serde_json::from_value(raw_rules.clone())
        .map_err(|e| GuardError::InvalidConfig(format!("malformed injector rules: {e}")))
}

/// Validate every rule condition at blueprint-import time.
pub fn validate_rules<S: std::hash::BuildHasher>(
    config: &Value,
    permitted: &std::collections::HashSet<String, S>,
) -> GuardResult<()> {
    for rule in parse_rules(config)? {
        dsl::validate(&rule.condition, permitted)?;
    }
    Ok(())
}
