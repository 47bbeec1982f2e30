//! Instance-tier store.
//!
//! The mutable runtime world: instance contexts, cloned topology, actors and
//! assignments, role memory, and the interaction log. UOW rows themselves are
//! managed by [`crate::UowRepository`] over the same pool.
//!
//! Topology writers take a `&mut SqliteConnection` so the engine can clone an
//! entire blueprint inside one transaction; readers go through the pool.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use tessera_types::{
    Actor, ActorKind, AssignmentStatus, Component, ComponentDirection, Guardian, GuardKind,
    InstanceContext, InstanceStatus, Interaction, InteractionLogRecord, MemoryRecord, MemoryScope,
    Role, RoleAssignment, RoleKind, Workflow,
};

use crate::blueprint::{parse_json_column, parse_uuid};
use crate::{StoreError, StoreResult};

/// SQLite-backed instance store.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    pool: SqlitePool,
}

impl InstanceStore {
    /// Open or create the instance database at `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory instance database pinned to a single connection.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Build a store over an existing pool, running migrations.
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// The underlying pool (shared with the UOW repository).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin an instance-tier transaction.
    pub async fn begin(&self) -> StoreResult<Transaction<'_, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn migrate(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS instance_context (
                instance_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                deployed_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                workflow_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instance_context(instance_id),
                blueprint_workflow_id TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                ai_context TEXT,
                version INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS roles (
                role_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
                name TEXT NOT NULL,
                description TEXT,
                ai_context TEXT,
                kind TEXT NOT NULL,
                strategy TEXT,
                gateway_workflow_id TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS interactions (
                interaction_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
                name TEXT NOT NULL,
                description TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS components (
                component_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
                interaction_id TEXT NOT NULL REFERENCES interactions(interaction_id),
                role_id TEXT NOT NULL REFERENCES roles(role_id),
                direction TEXT NOT NULL,
                name TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS guardians (
                guardian_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
                component_id TEXT NOT NULL REFERENCES components(component_id),
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                config TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS actors (
                actor_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instance_context(instance_id),
                identity_key TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                capabilities TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS actor_role_assignments (
                assignment_id TEXT PRIMARY KEY,
                actor_id TEXT NOT NULL REFERENCES actors(actor_id),
                role_id TEXT NOT NULL REFERENCES roles(role_id),
                status TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS role_attributes (
                memory_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instance_context(instance_id),
                role_id TEXT NOT NULL REFERENCES roles(role_id),
                scope TEXT NOT NULL,
                context_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                confidence INTEGER NOT NULL DEFAULT 50,
                is_toxic INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS units_of_work (
                uow_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL REFERENCES instance_context(instance_id),
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
                parent_id TEXT REFERENCES units_of_work(uow_id),
                current_interaction_id TEXT NOT NULL REFERENCES interactions(interaction_id),
                status TEXT NOT NULL,
                child_count INTEGER NOT NULL DEFAULT 0,
                finished_child_count INTEGER NOT NULL DEFAULT 0,
                last_heartbeat TEXT,
                locked_by TEXT,
                content_hash TEXT NOT NULL,
                interaction_count INTEGER NOT NULL DEFAULT 0,
                max_interactions INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                interaction_policy TEXT,
                model_id TEXT,
                injected_instructions TEXT,
                knowledge_fragment_refs TEXT NOT NULL DEFAULT '[]',
                mutation_audit_log TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS uow_attributes (
                attribute_id TEXT PRIMARY KEY,
                uow_id TEXT NOT NULL REFERENCES units_of_work(uow_id),
                instance_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                version INTEGER NOT NULL,
                actor_id TEXT NOT NULL,
                reasoning TEXT,
                created_at TEXT NOT NULL,
                UNIQUE (uow_id, key, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS uow_history (
                history_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                uow_id TEXT NOT NULL REFERENCES units_of_work(uow_id),
                event_type TEXT NOT NULL,
                previous_status TEXT,
                new_status TEXT,
                previous_state_hash TEXT NOT NULL,
                new_state_hash TEXT NOT NULL,
                previous_interaction_id TEXT,
                new_interaction_id TEXT,
                actor_id TEXT,
                reasoning TEXT,
                payload TEXT,
                transition_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS interaction_logs (
                log_id TEXT PRIMARY KEY,
                instance_id TEXT NOT NULL,
                uow_id TEXT NOT NULL,
                actor_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                interaction_id TEXT NOT NULL,
                log_type TEXT NOT NULL,
                event_details TEXT,
                error_metadata TEXT,
                timestamp TEXT NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_uow_status ON units_of_work(status)",
            "CREATE INDEX IF NOT EXISTS idx_uow_interaction ON units_of_work(current_interaction_id)",
            "CREATE INDEX IF NOT EXISTS idx_uow_attrs_uow ON uow_attributes(uow_id)",
            "CREATE INDEX IF NOT EXISTS idx_uow_history_uow ON uow_history(uow_id)",
            "CREATE INDEX IF NOT EXISTS idx_components_role ON components(role_id)",
            "CREATE INDEX IF NOT EXISTS idx_memory_role ON role_attributes(role_id)",
        ];
        for statement in indexes {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    //─────────────────────────────
    //  Topology writers (transactional)
    //─────────────────────────────

    /// Insert the instance context row.
    pub async fn insert_instance_context(
        &self,
        conn: &mut SqliteConnection,
        ctx: &InstanceContext,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO instance_context (instance_id, name, description, status, deployed_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(ctx.instance_id.to_string())
        .bind(&ctx.name)
        .bind(&ctx.description)
        .bind(ctx.status.as_str())
        .bind(ctx.deployed_at.to_rfc3339())
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert a cloned workflow row.
    pub async fn insert_workflow(
        &self,
        conn: &mut SqliteConnection,
        workflow: &Workflow,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO workflows (workflow_id, instance_id, blueprint_workflow_id, name, description, ai_context, version) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(workflow.workflow_id.to_string())
        .bind(workflow.instance_id.to_string())
        .bind(workflow.blueprint_workflow_id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(workflow.ai_context.as_ref().map(|v| v.to_string()))
        .bind(workflow.version)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert a cloned role row.
    pub async fn insert_role(&self, conn: &mut SqliteConnection, role: &Role) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO roles (role_id, workflow_id, name, description, ai_context, kind, strategy, gateway_workflow_id) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(role.role_id.to_string())
        .bind(role.workflow_id.to_string())
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.ai_context.as_ref().map(|v| v.to_string()))
        .bind(role.kind.as_str())
        .bind(role.strategy.map(|s| s.as_str()))
        .bind(role.gateway_workflow_id.map(|id| id.to_string()))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert a cloned interaction row.
    pub async fn insert_interaction(
        &self,
        conn: &mut SqliteConnection,
        interaction: &Interaction,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO interactions (interaction_id, workflow_id, name, description) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(interaction.interaction_id.to_string())
        .bind(interaction.workflow_id.to_string())
        .bind(&interaction.name)
        .bind(&interaction.description)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert a cloned component row.
    pub async fn insert_component(
        &self,
        conn: &mut SqliteConnection,
        component: &Component,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO components (component_id, workflow_id, interaction_id, role_id, direction, name) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(component.component_id.to_string())
        .bind(component.workflow_id.to_string())
        .bind(component.interaction_id.to_string())
        .bind(component.role_id.to_string())
        .bind(component.direction.as_str())
        .bind(&component.name)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Insert a cloned guardian row.
    pub async fn insert_guardian(
        &self,
        conn: &mut SqliteConnection,
        guardian: &Guardian,
    ) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO guardians (guardian_id, workflow_id, component_id, name, kind, config) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(guardian.guardian_id.to_string())
        .bind(guardian.workflow_id.to_string())
        .bind(guardian.component_id.to_string())
        .bind(&guardian.name)
        .bind(guardian.kind.as_str())
        .bind(guardian.config.to_string())
        .execute(conn)
        .await?;
        Ok(())
    }

    //─────────────────────────────
    //  Actors and assignments
    //─────────────────────────────

    /// Register an actor in an instance.
    pub async fn insert_actor(&self, actor: &Actor) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO actors (actor_id, instance_id, identity_key, name, kind, capabilities) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(actor.actor_id.to_string())
        .bind(actor.instance_id.to_string())
        .bind(&actor.identity_key)
        .bind(&actor.name)
        .bind(actor.kind.as_str())
        .bind(actor.capabilities.as_ref().map(|v| v.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Authorize an actor for a role.
    pub async fn insert_assignment(&self, assignment: &RoleAssignment) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO actor_role_assignments (assignment_id, actor_id, role_id, status) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(assignment.assignment_id.to_string())
        .bind(assignment.actor_id.to_string())
        .bind(assignment.role_id.to_string())
        .bind(assignment.status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch an actor row.
    pub async fn get_actor(&self, actor_id: Uuid) -> StoreResult<Option<Actor>> {
        let row = sqlx::query("SELECT * FROM actors WHERE actor_id = ?")
            .bind(actor_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row_to_actor(&row)).transpose()
    }

    /// Whether an ACTIVE assignment exists for this actor and role.
    pub async fn has_active_assignment(&self, actor_id: Uuid, role_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM actor_role_assignments \
             WHERE actor_id = ? AND role_id = ? AND status = ?",
        )
        .bind(actor_id.to_string())
        .bind(role_id.to_string())
        .bind(AssignmentStatus::Active.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? > 0)
    }

    /// Whether the actor holds any ACTIVE assignment at all.
    pub async fn has_any_active_assignment(&self, actor_id: Uuid) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM actor_role_assignments WHERE actor_id = ? AND status = ?",
        )
        .bind(actor_id.to_string())
        .bind(AssignmentStatus::Active.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")? > 0)
    }

    //─────────────────────────────
    //  Topology queries
    //─────────────────────────────

    /// Fetch the instance context.
    pub async fn get_instance(&self, instance_id: Uuid) -> StoreResult<InstanceContext> {
        let row = sqlx::query("SELECT * FROM instance_context WHERE instance_id = ?")
            .bind(instance_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("instance", instance_id))?;
        Ok(InstanceContext {
            instance_id,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: InstanceStatus::from_str(row.try_get::<String, _>("status")?.as_str())?,
            deployed_at: parse_timestamp(row.try_get("deployed_at")?)?,
        })
    }

    /// The cloned workflows living inside an instance.
    pub async fn workflows_for_instance(&self, instance_id: Uuid) -> StoreResult<Vec<Workflow>> {
        sqlx::query("SELECT * FROM workflows WHERE instance_id = ? ORDER BY name")
            .bind(instance_id.to_string())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| -> StoreResult<Workflow> {
                Ok(Workflow {
                    workflow_id: parse_uuid(row.try_get("workflow_id")?)?,
                    instance_id,
                    blueprint_workflow_id: parse_uuid(row.try_get("blueprint_workflow_id")?)?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    ai_context: parse_json_column(row.try_get("ai_context")?)?,
                    version: row.try_get("version")?,
                })
            })
            .collect()
    }

    /// Fetch a role row.
    pub async fn get_role(&self, role_id: Uuid) -> StoreResult<Role> {
        let row = sqlx::query("SELECT * FROM roles WHERE role_id = ?")
            .bind(role_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("role", role_id))?;
        row_to_role(&row)
    }

    /// All roles of a given kind inside a cloned workflow.
    pub async fn roles_by_kind(&self, workflow_id: Uuid, kind: RoleKind) -> StoreResult<Vec<Role>> {
        sqlx::query("SELECT * FROM roles WHERE workflow_id = ? AND kind = ?")
            .bind(workflow_id.to_string())
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_role)
            .collect()
    }

    /// The components of a role pointing in one direction.
    pub async fn components_for_role(
        &self,
        role_id: Uuid,
        direction: ComponentDirection,
    ) -> StoreResult<Vec<Component>> {
        sqlx::query("SELECT * FROM components WHERE role_id = ? AND direction = ? ORDER BY name")
            .bind(role_id.to_string())
            .bind(direction.as_str())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_component)
            .collect()
    }

    /// The guardian attached to a component, if any.
    pub async fn guardian_for_component(
        &self,
        component_id: Uuid,
    ) -> StoreResult<Option<Guardian>> {
        let row = sqlx::query("SELECT * FROM guardians WHERE component_id = ?")
            .bind(component_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row_to_guardian(&row)).transpose()
    }

    /// Resolve an interaction by display name inside a cloned workflow.
    ///
    /// Routing policies name their targets; the clone step preserves names,
    /// so this lookup is how branch decisions become queue ids.
    pub async fn interaction_by_name(
        &self,
        workflow_id: Uuid,
        name: &str,
    ) -> StoreResult<Option<Interaction>> {
        let row = sqlx::query("SELECT * FROM interactions WHERE workflow_id = ? AND name = ?")
            .bind(workflow_id.to_string())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Interaction {
                interaction_id: parse_uuid(row.try_get("interaction_id")?)?,
                workflow_id,
                name: row.try_get("name")?,
                description: row.try_get("description")?,
            })
        })
        .transpose()
    }

    /// The role consuming a given interaction (first INBOUND component).
    pub async fn role_consuming_interaction(
        &self,
        interaction_id: Uuid,
    ) -> StoreResult<Option<Role>> {
        let row = sqlx::query(
            "SELECT r.* FROM roles r \
             JOIN components c ON c.role_id = r.role_id \
             WHERE c.interaction_id = ? AND c.direction = ? \
             ORDER BY c.name LIMIT 1",
        )
        .bind(interaction_id.to_string())
        .bind(ComponentDirection::Inbound.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| row_to_role(&row)).transpose()
    }

    /// The inbound interaction of the first role of `kind` in a workflow.
    ///
    /// This is how failed tokens find the Epsilon queue (the Ate Path) and
    /// reclaimed zombies find the Tau queue.
    pub async fn inbound_interaction_for_kind(
        &self,
        workflow_id: Uuid,
        kind: RoleKind,
    ) -> StoreResult<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT c.interaction_id FROM components c \
             JOIN roles r ON r.role_id = c.role_id \
             WHERE r.workflow_id = ? AND r.kind = ? AND c.direction = ? \
             ORDER BY c.name LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .bind(kind.as_str())
        .bind(ComponentDirection::Inbound.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| parse_uuid(row.try_get("interaction_id")?))
            .transpose()
    }

    //─────────────────────────────
    //  Role memory
    //─────────────────────────────

    /// Insert a memory record verbatim (seeding and tests).
    pub async fn insert_memory(&self, record: &MemoryRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO role_attributes \
             (memory_id, instance_id, role_id, scope, context_id, key, value, confidence, is_toxic, created_at, last_accessed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.memory_id.to_string())
        .bind(record.instance_id.to_string())
        .bind(record.role_id.to_string())
        .bind(record.scope.as_str())
        .bind(&record.context_id)
        .bind(&record.key)
        .bind(record.value.to_string())
        .bind(record.confidence)
        .bind(record.is_toxic as i64)
        .bind(record.created_at.to_rfc3339())
        .bind(record.last_accessed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a harvested rule into the `(role, scope, context, key)` slot.
    ///
    /// Existing rows are updated in place (value, confidence, access time);
    /// there is never more than one row per slot.
    pub async fn upsert_memory(
        &self,
        instance_id: Uuid,
        role_id: Uuid,
        scope: MemoryScope,
        context_id: &str,
        key: &str,
        value: &serde_json::Value,
        confidence: i64,
    ) -> StoreResult<Uuid> {
        let now = Utc::now();
        let existing = sqlx::query(
            "SELECT memory_id FROM role_attributes \
             WHERE role_id = ? AND scope = ? AND context_id = ? AND key = ?",
        )
        .bind(role_id.to_string())
        .bind(scope.as_str())
        .bind(context_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let memory_id = parse_uuid(row.try_get("memory_id")?)?;
            sqlx::query(
                "UPDATE role_attributes SET value = ?, confidence = ?, last_accessed_at = ? \
                 WHERE memory_id = ?",
            )
            .bind(value.to_string())
            .bind(confidence)
            .bind(now.to_rfc3339())
            .bind(memory_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(memory_id)
        } else {
            let memory_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO role_attributes \
                 (memory_id, instance_id, role_id, scope, context_id, key, value, confidence, is_toxic, created_at, last_accessed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
            )
            .bind(memory_id.to_string())
            .bind(instance_id.to_string())
            .bind(role_id.to_string())
            .bind(scope.as_str())
            .bind(context_id)
            .bind(key)
            .bind(value.to_string())
            .bind(confidence)
            .bind(now.to_rfc3339())
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(memory_id)
        }
    }

    /// Non-toxic memories visible to `actor_id` in `role_id`: the GLOBAL
    /// blueprints plus the actor's personal playbook, optionally filtered by
    /// a case-insensitive substring on the key.
    pub async fn visible_memories(
        &self,
        role_id: Uuid,
        actor_id: Uuid,
        key_filter: Option<&str>,
    ) -> StoreResult<Vec<MemoryRecord>> {
        let mut sql = String::from(
            "SELECT * FROM role_attributes \
             WHERE role_id = ? AND is_toxic = 0 \
             AND (scope = 'GLOBAL' OR (scope = 'ACTOR' AND context_id = ?))",
        );
        if key_filter.is_some() {
            sql.push_str(" AND lower(key) LIKE ?");
        }
        sql.push_str(" ORDER BY scope, key");

        let mut query = sqlx::query(&sql)
            .bind(role_id.to_string())
            .bind(actor_id.to_string());
        if let Some(filter) = key_filter {
            query = query.bind(format!("%{}%", filter.to_lowercase()));
        }

        query
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_memory)
            .collect()
    }

    /// Refresh `last_accessed_at` for a set of memory records.
    pub async fn touch_memories(&self, memory_ids: &[Uuid], when: DateTime<Utc>) -> StoreResult<()> {
        for memory_id in memory_ids {
            sqlx::query("UPDATE role_attributes SET last_accessed_at = ? WHERE memory_id = ?")
                .bind(when.to_rfc3339())
                .bind(memory_id.to_string())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Delete memories whose `last_accessed_at` is older than `cutoff`.
    /// Rows that were never accessed are exempt. Returns the deleted count.
    pub async fn delete_stale_memories(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM role_attributes \
             WHERE last_accessed_at IS NOT NULL AND last_accessed_at < ?",
        )
        .bind(cutoff.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Flag a memory as toxic without deleting it.
    pub async fn mark_memory_toxic(&self, memory_id: Uuid) -> StoreResult<()> {
        let result = sqlx::query("UPDATE role_attributes SET is_toxic = 1 WHERE memory_id = ?")
            .bind(memory_id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("memory", memory_id));
        }
        Ok(())
    }

    /// Fetch a single memory record.
    pub async fn get_memory(&self, memory_id: Uuid) -> StoreResult<Option<MemoryRecord>> {
        let row = sqlx::query("SELECT * FROM role_attributes WHERE memory_id = ?")
            .bind(memory_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row_to_memory(&row)).transpose()
    }

    //─────────────────────────────
    //  Interaction log
    //─────────────────────────────

    /// Bulk-insert drained telemetry entries; returns the written count.
    pub async fn insert_interaction_logs(
        &self,
        records: &[InteractionLogRecord],
    ) -> StoreResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO interaction_logs \
                 (log_id, instance_id, uow_id, actor_id, role_id, interaction_id, log_type, event_details, error_metadata, timestamp) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(record.log_id.to_string())
            .bind(record.instance_id.to_string())
            .bind(record.uow_id.to_string())
            .bind(record.actor_id.to_string())
            .bind(record.role_id.to_string())
            .bind(record.interaction_id.to_string())
            .bind(record.log_type.as_str())
            .bind(record.event_details.as_ref().map(|v| v.to_string()))
            .bind(record.error_metadata.as_ref().map(|v| v.to_string()))
            .bind(record.timestamp.to_rfc3339())
            .execute(tx.as_mut())
            .await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }

    /// Count interaction-log rows (diagnostics and tests).
    pub async fn interaction_log_count(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM interaction_logs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

//─────────────────────────────
//  Row mapping
//─────────────────────────────

pub(crate) fn parse_timestamp(text: String) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::InvalidSpec(format!("malformed timestamp: {text}")))
}

pub(crate) fn parse_optional_timestamp(
    text: Option<String>,
) -> StoreResult<Option<DateTime<Utc>>> {
    text.map(parse_timestamp).transpose()
}

fn row_to_role(row: &SqliteRow) -> StoreResult<Role> {
    Ok(Role {
        role_id: parse_uuid(row.try_get("role_id")?)?,
        workflow_id: parse_uuid(row.try_get("workflow_id")?)?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        ai_context: parse_json_column(row.try_get("ai_context")?)?,
        kind: RoleKind::from_str(row.try_get::<String, _>("kind")?.as_str())?,
        strategy: row
            .try_get::<Option<String>, _>("strategy")?
            .map(|s| s.parse())
            .transpose()?,
        gateway_workflow_id: row
            .try_get::<Option<String>, _>("gateway_workflow_id")?
            .map(parse_uuid)
            .transpose()?,
    })
}

fn row_to_component(row: &SqliteRow) -> StoreResult<Component> {
    Ok(Component {
        component_id: parse_uuid(row.try_get("component_id")?)?,
        workflow_id: parse_uuid(row.try_get("workflow_id")?)?,
        interaction_id: parse_uuid(row.try_get("interaction_id")?)?,
        role_id: parse_uuid(row.try_get("role_id")?)?,
        direction: ComponentDirection::from_str(row.try_get::<String, _>("direction")?.as_str())?,
        name: row.try_get("name")?,
    })
}

fn row_to_guardian(row: &SqliteRow) -> StoreResult<Guardian> {
    Ok(Guardian {
        guardian_id: parse_uuid(row.try_get("guardian_id")?)?,
        workflow_id: parse_uuid(row.try_get("workflow_id")?)?,
        component_id: parse_uuid(row.try_get("component_id")?)?,
        name: row.try_get("name")?,
        kind: GuardKind::from_str(row.try_get::<String, _>("kind")?.as_str())?,
        config: serde_json::from_str(row.try_get::<String, _>("config")?.as_str())?,
    })
}

fn row_to_actor(row: &SqliteRow) -> StoreResult<Actor> {
    Ok(Actor {
        actor_id: parse_uuid(row.try_get("actor_id")?)?,
        instance_id: parse_uuid(row.try_get("instance_id")?)?,
        identity_key: row.try_get("identity_key")?,
        name: row.try_get("name")?,
        kind: ActorKind::from_str(row.try_get::<String, _>("kind")?.as_str())?,
        capabilities: parse_json_column(row.try_get("capabilities")?)?,
    })
}

fn row_to_memory(row: &SqliteRow) -> StoreResult<MemoryRecord> {
    Ok(MemoryRecord {
        memory_id: parse_uuid(row.try_get("memory_id")?)?,
        instance_id: parse_uuid(row.try_get("instance_id")?)?,
        role_id: parse_uuid(row.try_get("role_id")?)?,
        scope: MemoryScope::from_str(row.try_get::<String, _>("scope")?.as_str())?,
        context_id: row.try_get("context_id")?,
        key: row.try_get("key")?,
        value: serde_json::from_str(row.try_get::<String, _>("value")?.as_str())?,
        confidence: row.try_get("confidence")?,
        is_toxic: row.try_get::<i64, _>("is_toxic")? != 0,
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        last_accessed_at: parse_optional_timestamp(row.try_get("last_accessed_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn seeded_store() -> (InstanceStore, Uuid, Uuid) {
        let store = InstanceStore::in_memory().await.unwrap();
        let instance_id = Uuid::new_v4();
        let workflow_id = Uuid::new_v4();

        let mut tx = store.begin().await.unwrap();
        store
            .insert_instance_context(
                tx.as_mut(),
                &InstanceContext {
                    instance_id,
                    name: "test".into(),
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
        tx.commit().await.unwrap();

        (store, instance_id, workflow_id)
    }

    async fn seed_role(store: &InstanceStore, workflow_id: Uuid, kind: RoleKind) -> Uuid {
        let role_id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        store
            .insert_role(
                tx.as_mut(),
                &Role {
                    role_id,
                    workflow_id,
                    name: format!("{}-role", kind.as_str().to_lowercase()),
                    description: None,
                    ai_context: None,
                    kind,
                    strategy: None,
                    gateway_workflow_id: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        role_id
    }

    #[tokio::test]
    async fn epsilon_inbound_lookup_finds_the_ate_queue() {
        let (store, _instance, workflow_id) = seeded_store().await;
        let epsilon = seed_role(&store, workflow_id, RoleKind::Epsilon).await;

        let interaction_id = Uuid::new_v4();
        let mut tx = store.begin().await.unwrap();
        store
            .insert_interaction(
                tx.as_mut(),
                &Interaction {
                    interaction_id,
                    workflow_id,
                    name: "ate".into(),
                    description: None,
                },
            )
            .await
            .unwrap();
        store
            .insert_component(
                tx.as_mut(),
                &Component {
                    component_id: Uuid::new_v4(),
                    workflow_id,
                    interaction_id,
                    role_id: epsilon,
                    direction: ComponentDirection::Inbound,
                    name: "ate_in".into(),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let found = store
            .inbound_interaction_for_kind(workflow_id, RoleKind::Epsilon)
            .await
            .unwrap();
        assert_eq!(found, Some(interaction_id));

        let none = store
            .inbound_interaction_for_kind(workflow_id, RoleKind::Tau)
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn memory_upsert_keeps_a_single_row_per_slot() {
        let (store, instance_id, workflow_id) = seeded_store().await;
        let role_id = seed_role(&store, workflow_id, RoleKind::Beta).await;
        let actor = Uuid::new_v4();
        let ctx = actor.to_string();

        let first = store
            .upsert_memory(instance_id, role_id, MemoryScope::Actor, &ctx, "invoice_limit", &json!(500), 100)
            .await
            .unwrap();
        let second = store
            .upsert_memory(instance_id, role_id, MemoryScope::Actor, &ctx, "invoice_limit", &json!(600), 100)
            .await
            .unwrap();

        assert_eq!(first, second);
        let visible = store.visible_memories(role_id, actor, None).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].value, json!(600));
    }

    #[tokio::test]
    async fn toxic_memories_are_invisible_but_not_deleted() {
        let (store, instance_id, workflow_id) = seeded_store().await;
        let role_id = seed_role(&store, workflow_id, RoleKind::Beta).await;
        let actor = Uuid::new_v4();

        let memory_id = store
            .upsert_memory(
                instance_id,
                role_id,
                MemoryScope::Global,
                "GLOBAL",
                "bad_pattern",
                &json!({"data": "wrong"}),
                50,
            )
            .await
            .unwrap();

        store.mark_memory_toxic(memory_id).await.unwrap();

        let visible = store.visible_memories(role_id, actor, None).await.unwrap();
        assert!(visible.is_empty());

        let record = store.get_memory(memory_id).await.unwrap().unwrap();
        assert!(record.is_toxic);
    }

    #[tokio::test]
    async fn marking_unknown_memory_is_not_found() {
        let (store, _, _) = seeded_store().await;
        let err = store.mark_memory_toxic(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn decay_spares_never_accessed_rows() {
        let (store, instance_id, workflow_id) = seeded_store().await;
        let role_id = seed_role(&store, workflow_id, RoleKind::Beta).await;
        let now = Utc::now();

        let stale = MemoryRecord {
            memory_id: Uuid::new_v4(),
            instance_id,
            role_id,
            scope: MemoryScope::Global,
            context_id: "GLOBAL".into(),
            key: "old_pattern".into(),
            value: json!({"data": "stale"}),
            confidence: 50,
            is_toxic: false,
            created_at: now,
            last_accessed_at: Some(now - chrono::Duration::days(100)),
        };
        let never_accessed = MemoryRecord {
            memory_id: Uuid::new_v4(),
            last_accessed_at: None,
            key: "never_accessed".into(),
            ..stale.clone()
        };
        let fresh = MemoryRecord {
            memory_id: Uuid::new_v4(),
            last_accessed_at: Some(now - chrono::Duration::days(30)),
            key: "recent_pattern".into(),
            ..stale.clone()
        };
        for record in [&stale, &never_accessed, &fresh] {
            store.insert_memory(record).await.unwrap();
        }

        let deleted = store
            .delete_stale_memories(now - chrono::Duration::days(90))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        assert!(store.get_memory(stale.memory_id).await.unwrap().is_none());
        assert!(store.get_memory(never_accessed.memory_id).await.unwrap().is_some());
        assert!(store.get_memory(fresh.memory_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn memory_key_filter_is_case_insensitive() {
        let (store, instance_id, workflow_id) = seeded_store().await;
        let role_id = seed_role(&store, workflow_id, RoleKind::Beta).await;
        let actor = Uuid::new_v4();

        store
            .upsert_memory(instance_id, role_id, MemoryScope::Global, "GLOBAL", "Invoice_Limit", &json!(1), 50)
            .await
            .unwrap();
        store
            .upsert_memory(instance_id, role_id, MemoryScope::Global, "GLOBAL", "retry_budget", &json!(2), 50)
            .await
            .unwrap();

        let hits = store
            .visible_memories(role_id, actor, Some("INVOICE"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "Invoice_Limit");
    }
}
