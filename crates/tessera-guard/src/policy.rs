//! Routing-policy resolution.
//!
//! An interaction policy is the immutable routing table snapshotted onto a
//! UOW at creation: ordered branches of `{condition, next_interaction}` plus
//! optional `on_error` and `default` targets. On submit, the engine asks the
//! policy where the token goes next; branch names are resolved to queue ids
//! by the store.

use serde::Deserialize;
use serde_json::Value;

use tessera_types::AttrMap;

use crate::dsl::{self, DslError};
use crate::{GuardError, GuardResult};

/// One routing branch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PolicyBranch {
    /// DSL condition deciding the branch.
    pub condition: String,
    /// Target interaction name.
    pub next_interaction: String,
}

/// A parsed interaction policy.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct RoutePolicy {
    /// Ordered decision table; the first matching branch wins.
    #[serde(default)]
    pub branches: Vec<PolicyBranch>,
    /// Target when every branch misses.
    #[serde(default)]
    pub default: Option<String>,
    /// Target when a branch condition fails to evaluate.
    #[serde(default)]
    pub on_error: Option<String>,
}

/// Where the routing decision landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Move the token to this named interaction.
    Next(String),
    /// The policy has no opinion; the caller falls back to the submitting
    /// role's default outbound interaction.
    Fallthrough,
}

impl RoutePolicy {
    /// Parse a policy snapshot. `null` parses as the empty policy.
    pub fn parse(value: &Value) -> GuardResult<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| GuardError::InvalidConfig(format!("malformed interaction policy: {e}")))
    }

    /// Whether the policy can ever produce a decision.
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty() && self.default.is_none()
    }

    /// Evaluate the decision table against a scope.
    ///
    /// Branches are tried in order; the first match wins. A branch whose
    /// condition fails to evaluate sends the token to `on_error` (falling
    /// back to `default`), and the error is surfaced for the shadow log. No
    /// match falls back to `default`, then to [`RouteDecision::Fallthrough`].
    pub fn route(&self, scope: &AttrMap) -> (RouteDecision, Vec<(String, DslError)>) {
        let mut errors = Vec::new();

        for branch in &self.branches {
            match dsl::evaluate(&branch.condition, scope) {
                Ok(true) => return (RouteDecision::Next(branch.next_interaction.clone()), errors),
                Ok(false) => {}
                Err(error) => {
                    errors.push((branch.condition.clone(), error));
                    let target = self.on_error.clone().or_else(|| self.default.clone());
                    return match target {
                        Some(name) => (RouteDecision::Next(name), errors),
                        None => (RouteDecision::Fallthrough, errors),
                    };
                }
            }
        }

        match &self.default {
            Some(name) => (RouteDecision::Next(name.clone()), errors),
            None => (RouteDecision::Fallthrough, errors),
        }
    }
}

/// Validate every branch condition at blueprint-import time.
pub fn validate_policy<S: std::hash::BuildHasher>(
    value: &Value,
    permitted: &std::collections::HashSet<String, S>,
) -> GuardResult<()> {
    let policy = RoutePolicy::parse(value)?;
    for branch in &policy.branches {
        dsl::validate(&branch.condition, permitted)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope(pairs: &[(&str, Value)]) -> AttrMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn policy(value: Value) -> RoutePolicy {
        RoutePolicy::parse(&value).unwrap()
    }

    #[test]
    fn first_matching_branch_wins() {
        let p = policy(json!({
            "branches": [
                {"condition": "risk_score > 8", "next_interaction": "critical_queue"},
                {"condition": "risk_score > 0", "next_interaction": "standard_queue"},
            ]
        }));
        let (decision, errors) = p.route(&scope(&[("risk_score", json!(9))]));
        assert_eq!(decision, RouteDecision::Next("critical_queue".into()));
        assert!(errors.is_empty());

        let (decision, _) = p.route(&scope(&[("risk_score", json!(3))]));
        assert_eq!(decision, RouteDecision::Next("standard_queue".into()));
    }

    #[test]
    fn no_match_falls_back_to_default_then_fallthrough() {
        let with_default = policy(json!({
            "branches": [{"condition": "amount > 100", "next_interaction": "review"}],
            "default": "archive"
        }));
        let (decision, _) = with_default.route(&scope(&[("amount", json!(5))]));
        assert_eq!(decision, RouteDecision::Next("archive".into()));

        let without_default = policy(json!({
            "branches": [{"condition": "amount > 100", "next_interaction": "review"}]
        }));
        let (decision, _) = without_default.route(&scope(&[("amount", json!(5))]));
        assert_eq!(decision, RouteDecision::Fallthrough);
    }

    #[test]
    fn evaluation_error_routes_to_on_error_branch() {
        let p = policy(json!({
            "branches": [{"condition": "missing_field > 1", "next_interaction": "review"}],
            "on_error": "quarantine",
            "default": "archive"
        }));
        let (decision, errors) = p.route(&scope(&[]));
        assert_eq!(decision, RouteDecision::Next("quarantine".into()));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].1, DslError::Attribute(_)));
    }

    #[test]
    fn evaluation_error_without_on_error_uses_default() {
        let p = policy(json!({
            "branches": [{"condition": "missing_field > 1", "next_interaction": "review"}],
            "default": "archive"
        }));
        let (decision, errors) = p.route(&scope(&[]));
        assert_eq!(decision, RouteDecision::Next("archive".into()));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn null_parses_as_empty_policy() {
        let p = RoutePolicy::parse(&Value::Null).unwrap();
        assert!(p.is_empty());
        let (decision, _) = p.route(&scope(&[]));
        assert_eq!(decision, RouteDecision::Fallthrough);
    }

    #[test]
    fn validation_checks_every_branch() {
        let permitted: std::collections::HashSet<String> =
            ["amount".to_string()].into_iter().collect();
        let good = json!({
            "branches": [
                {"condition": "amount > 100", "next_interaction": "review"},
                {"condition": "child_count == 0", "next_interaction": "fast"},
            ]
        });
        validate_policy(&good, &permitted).unwrap();

        let bad = json!({
            "branches": [{"condition": "undeclared > 1", "next_interaction": "review"}]
        });
        assert!(validate_policy(&bad, &permitted).is_err());
    }
}
