//! Role-scoped memory: harvest, context assembly and retrieval.
//!
//! Memory lives in two scopes per role: GLOBAL blueprints shared by every
//! actor, and per-actor playbooks. The harvester runs on submit and upserts
//! explicit `_learned_rule` teachings with full confidence; the context
//! builder runs on checkout and merges both scopes (actor overrides global),
//! refreshing access timestamps so the decay sweeper spares what is in use.

use serde_json::Value;
use uuid::Uuid;

use tessera_types::{AttrMap, MemoryRecord, MemoryScope, Uow};

use crate::controller::LEARNED_RULE_KEY;
use crate::{Engine, EngineResult};

impl Engine {
    /// Harvest an explicitly taught rule from submitted attributes.
    ///
    /// Expects `_learned_rule = {key, value}`; malformed shapes are logged
    /// and skipped. The rule is upserted into the actor's personal playbook
    /// with confidence 100.
    pub(crate) async fn harvest_experience(
        &self,
        uow: &Uow,
        actor_id: Uuid,
        role_id: Uuid,
        result_attributes: &AttrMap,
    ) -> EngineResult<()> {
        let Some(learned) = result_attributes.get(LEARNED_RULE_KEY) else {
            return Ok(());
        };

        let Value::Object(rule) = learned else {
            tracing::warn!(uow_id = %uow.uow_id, "invalid _learned_rule: not a mapping");
            return Ok(());
        };
        let Some(Value::String(key)) = rule.get("key") else {
            tracing::warn!(uow_id = %uow.uow_id, "invalid _learned_rule: missing 'key'");
            return Ok(());
        };
        let value = rule.get("value").cloned().unwrap_or(Value::Null);

        let memory_id = self
            .store()
            .upsert_memory(
                uow.instance_id,
                role_id,
                MemoryScope::Actor,
                &actor_id.to_string(),
                key,
                &value,
                100,
            )
            .await?;
        tracing::info!(%memory_id, %actor_id, %role_id, key, "learned rule harvested");
        Ok(())
    }

    /// Build the merged memory context injected at checkout: non-toxic
    /// GLOBAL rows overlaid by the actor's playbook, with every touched
    /// record's access timestamp refreshed.
    pub(crate) async fn build_memory_context(
        &self,
        role_id: Uuid,
        actor_id: Uuid,
    ) -> EngineResult<AttrMap> {
        let memories = self.store().visible_memories(role_id, actor_id, None).await?;

        let mut context = AttrMap::new();
        // Global first, then actor entries override per key.
        for record in memories.iter().filter(|m| m.scope == MemoryScope::Global) {
            context.insert(record.key.clone(), record.value.clone());
        }
        for record in memories.iter().filter(|m| m.scope == MemoryScope::Actor) {
            context.insert(record.key.clone(), record.value.clone());
        }

        let touched: Vec<Uuid> = memories.iter().map(|m| m.memory_id).collect();
        self.store()
            .touch_memories(&touched, chrono::Utc::now())
            .await?;

        Ok(context)
    }

    /// Query accumulated knowledge for an actor in a role: the GLOBAL
    /// blueprints plus the actor's playbook, toxic rows excluded, optionally
    /// filtered by a case-insensitive substring on the key.
    pub async fn get_memory(
        &self,
        actor_id: Uuid,
        role_id: Uuid,
        query: Option<&str>,
    ) -> EngineResult<Vec<MemoryRecord>> {
        Ok(self
            .store()
            .visible_memories(role_id, actor_id, query)
            .await?)
    }
}
