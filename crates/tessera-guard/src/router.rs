//! The model router: whitelist validation and safe failover for
//! conditional-injector model overrides.
//!
//! Resolution only: the engine never talks to a provider; it records which
//! model an admitted token should be processed with.

use std::collections::BTreeMap;

/// Resolution of a model id to its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelResolution {
    /// The effective model id (the failover when the request was rejected).
    pub model_id: String,
    /// Provider owning the model.
    pub provider: String,
    /// Whether the failover was substituted.
    pub is_failover: bool,
}

/// Maps abstract model ids to provider names and enforces the whitelist.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    providers: BTreeMap<String, String>,
    failover: String,
}

impl Default for ModelRouter {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        for (model, provider) in [
            ("gpt-4o", "openai"),
            ("gpt-4-turbo", "openai"),
            ("gpt-4", "openai"),
            ("gpt-3.5-turbo", "openai"),
            ("claude-3-opus", "anthropic"),
            ("claude-3-sonnet", "anthropic"),
            ("claude-3-haiku", "anthropic"),
            ("gemini-pro", "google"),
            ("gemini-flash", "google"),
            ("grok-1-pro", "xai"),
        ] {
            providers.insert(model.to_string(), provider.to_string());
        }
        Self {
            providers,
            failover: "gemini-flash".to_string(),
        }
    }
}

impl ModelRouter {
    /// Build a router from an explicit `(model, provider)` whitelist and a
    /// failover model. The failover is always whitelisted.
    pub fn new<I, S>(whitelist: I, failover: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut providers: BTreeMap<String, String> = whitelist
            .into_iter()
            .map(|(model, provider)| (model.into(), provider.into()))
            .collect();
        let failover = failover.into();
        providers
            .entry(failover.clone())
            .or_insert_with(|| "default".to_string());
        Self { providers, failover }
    }

    /// Whether the model id passes the whitelist.
    pub fn is_whitelisted(&self, model_id: &str) -> bool {
        self.providers.contains_key(model_id)
    }

    /// The configured safe failover model.
    pub fn failover_model(&self) -> &str {
        &self.failover
    }

    /// Resolve a model id to its provider, substituting the failover for
    /// anything outside the whitelist.
    pub fn resolve(&self, model_id: &str) -> ModelResolution {
        if let Some(provider) = self.providers.get(model_id) {
            return ModelResolution {
                model_id: model_id.to_string(),
                provider: provider.clone(),
                is_failover: false,
            };
        }
        tracing::warn!(model_id, failover = %self.failover, "model failed whitelist, using failover");
        let provider = self
            .providers
            .get(&self.failover)
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        ModelResolution {
            model_id: self.failover.clone(),
            provider,
            is_failover: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve_to_their_provider() {
        let router = ModelRouter::default();
        let resolved = router.resolve("gpt-4");
        assert_eq!(resolved.provider, "openai");
        assert_eq!(resolved.model_id, "gpt-4");
        assert!(!resolved.is_failover);

        let resolved = router.resolve("claude-3-sonnet");
        assert_eq!(resolved.provider, "anthropic");
    }

    #[test]
    fn whitelist_validation() {
        let router = ModelRouter::default();
        assert!(router.is_whitelisted("gpt-4"));
        assert!(router.is_whitelisted("claude-3-sonnet"));
        assert!(!router.is_whitelisted("invalid-model"));
    }

    #[test]
    fn unknown_models_fail_over() {
        let router = ModelRouter::default();
        let resolved = router.resolve("invalid-model-999");
        assert!(resolved.is_failover);
        assert_eq!(resolved.model_id, "gemini-flash");
        assert_eq!(resolved.provider, "google");
    }

    #[test]
    fn custom_whitelist_always_contains_its_failover() {
        let router = ModelRouter::new([("premium", "acme")], "budget");
        assert!(router.is_whitelisted("premium"));
        assert!(router.is_whitelisted("budget"));
        assert_eq!(router.resolve("other").model_id, "budget");
    }
}
