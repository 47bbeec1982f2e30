//! Blueprint-tier store.
//!
//! Written once by the importer, read-only for the rest of the process
//! lifetime. The engine fetches a whole workflow bundle at instantiation and
//! clones it into the instance tier.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use tessera_types::{
    ComponentDef, ComponentDirection, GuardianDef, GuardKind, InteractionDef, RoleDef, RoleKind,
    WorkflowDef,
};

use crate::{StoreError, StoreResult};

/// A complete workflow definition: the unit of import and instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct BlueprintBundle {
    /// The workflow row.
    pub workflow: WorkflowDef,
    /// Its roles.
    pub roles: Vec<RoleDef>,
    /// Its queues.
    pub interactions: Vec<InteractionDef>,
    /// Its edges.
    pub components: Vec<ComponentDef>,
    /// Its gates.
    pub guardians: Vec<GuardianDef>,
}

/// SQLite-backed blueprint store.
#[derive(Debug, Clone)]
pub struct BlueprintStore {
    pool: SqlitePool,
}

impl BlueprintStore {
    /// Open or create the blueprint database at `path`.
    pub async fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Open an in-memory blueprint database (testing and ephemeral runs).
    ///
    /// The pool is pinned to a single connection: each SQLite `:memory:`
    /// connection is its own database.
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

    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                workflow_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                ai_context TEXT,
                version INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS roles (
                role_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
                name TEXT NOT NULL,
                description TEXT,
                ai_context TEXT,
                kind TEXT NOT NULL,
                strategy TEXT,
                child_workflow_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS interactions (
                interaction_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL REFERENCES workflows(workflow_id),
                name TEXT NOT NULL,
                description TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
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
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
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
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_roles_workflow ON roles(workflow_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_components_workflow ON components(workflow_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Persist a complete workflow bundle in one transaction.
    pub async fn insert_bundle(&self, bundle: &BlueprintBundle) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let wf = &bundle.workflow;
        sqlx::query(
            "INSERT INTO workflows (workflow_id, name, description, ai_context, version) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(wf.workflow_id.to_string())
        .bind(&wf.name)
        .bind(&wf.description)
        .bind(wf.ai_context.as_ref().map(|v| v.to_string()))
        .bind(wf.version)
        .execute(tx.as_mut())
        .await?;

        for role in &bundle.roles {
            sqlx::query(
                "INSERT INTO roles (role_id, workflow_id, name, description, ai_context, kind, strategy, child_workflow_id) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(role.role_id.to_string())
            .bind(role.workflow_id.to_string())
            .bind(&role.name)
            .bind(&role.description)
            .bind(role.ai_context.as_ref().map(|v| v.to_string()))
            .bind(role.kind.as_str())
            .bind(role.strategy.map(|s| s.as_str()))
            .bind(role.child_workflow_id.map(|id| id.to_string()))
            .execute(tx.as_mut())
            .await?;
        }

        for interaction in &bundle.interactions {
            sqlx::query(
                "INSERT INTO interactions (interaction_id, workflow_id, name, description) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(interaction.interaction_id.to_string())
            .bind(interaction.workflow_id.to_string())
            .bind(&interaction.name)
            .bind(&interaction.description)
            .execute(tx.as_mut())
            .await?;
        }

        for component in &bundle.components {
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
            .execute(tx.as_mut())
            .await?;
        }

        for guardian in &bundle.guardians {
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
            .execute(tx.as_mut())
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Fetch a complete workflow bundle; `NotFound` when absent.
    pub async fn fetch_bundle(&self, workflow_id: Uuid) -> StoreResult<BlueprintBundle> {
        let id = workflow_id.to_string();

        let row = sqlx::query("SELECT * FROM workflows WHERE workflow_id = ?")
            .bind(&id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("workflow blueprint", workflow_id))?;

        let workflow = WorkflowDef {
            workflow_id,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            ai_context: parse_json_column(row.try_get("ai_context")?)?,
            version: row.try_get("version")?,
        };

        let roles = sqlx::query("SELECT * FROM roles WHERE workflow_id = ? ORDER BY name")
            .bind(&id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| -> StoreResult<RoleDef> {
                Ok(RoleDef {
                    role_id: parse_uuid(row.try_get("role_id")?)?,
                    workflow_id,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    ai_context: parse_json_column(row.try_get("ai_context")?)?,
                    kind: RoleKind::from_str(row.try_get::<String, _>("kind")?.as_str())?,
                    strategy: row
                        .try_get::<Option<String>, _>("strategy")?
                        .map(|s| s.parse())
                        .transpose()?,
                    child_workflow_id: row
                        .try_get::<Option<String>, _>("child_workflow_id")?
                        .map(|s| parse_uuid(s))
                        .transpose()?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        let interactions =
            sqlx::query("SELECT * FROM interactions WHERE workflow_id = ? ORDER BY name")
                .bind(&id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| -> StoreResult<InteractionDef> {
                    Ok(InteractionDef {
                        interaction_id: parse_uuid(row.try_get("interaction_id")?)?,
                        workflow_id,
                        name: row.try_get("name")?,
                        description: row.try_get("description")?,
                    })
                })
                .collect::<StoreResult<Vec<_>>>()?;

        let components =
            sqlx::query("SELECT * FROM components WHERE workflow_id = ? ORDER BY name")
                .bind(&id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| -> StoreResult<ComponentDef> {
                    Ok(ComponentDef {
                        component_id: parse_uuid(row.try_get("component_id")?)?,
                        workflow_id,
                        interaction_id: parse_uuid(row.try_get("interaction_id")?)?,
                        role_id: parse_uuid(row.try_get("role_id")?)?,
                        direction: ComponentDirection::from_str(
                            row.try_get::<String, _>("direction")?.as_str(),
                        )?,
                        name: row.try_get("name")?,
                    })
                })
                .collect::<StoreResult<Vec<_>>>()?;

        let guardians = sqlx::query("SELECT * FROM guardians WHERE workflow_id = ? ORDER BY name")
            .bind(&id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| -> StoreResult<GuardianDef> {
                Ok(GuardianDef {
                    guardian_id: parse_uuid(row.try_get("guardian_id")?)?,
                    workflow_id,
                    component_id: parse_uuid(row.try_get("component_id")?)?,
                    name: row.try_get("name")?,
                    kind: GuardKind::from_str(row.try_get::<String, _>("kind")?.as_str())?,
                    config: serde_json::from_str(row.try_get::<String, _>("config")?.as_str())?,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(BlueprintBundle {
            workflow,
            roles,
            interactions,
            components,
            guardians,
        })
    }

    /// List all imported workflow definitions.
    pub async fn list_workflows(&self) -> StoreResult<Vec<WorkflowDef>> {
        sqlx::query("SELECT * FROM workflows ORDER BY name")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| -> StoreResult<WorkflowDef> {
                Ok(WorkflowDef {
                    workflow_id: parse_uuid(row.try_get("workflow_id")?)?,
                    name: row.try_get("name")?,
                    description: row.try_get("description")?,
                    ai_context: parse_json_column(row.try_get("ai_context")?)?,
                    version: row.try_get("version")?,
                })
            })
            .collect()
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub(crate) fn parse_uuid(text: String) -> StoreResult<Uuid> {
    Uuid::parse_str(&text).map_err(|_| StoreError::InvalidSpec(format!("malformed uuid: {text}")))
}

pub(crate) fn parse_json_column(
    text: Option<String>,
) -> StoreResult<Option<serde_json::Value>> {
    text.map(|t| serde_json::from_str(&t)).transpose().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_bundle() -> BlueprintBundle {
        let workflow_id = Uuid::new_v4();
        let alpha = Uuid::new_v4();
        let queue = Uuid::new_v4();
        let component = Uuid::new_v4();
        BlueprintBundle {
            workflow: WorkflowDef {
                workflow_id,
                name: "invoice_review".into(),
                description: Some("review pipeline".into()),
                ai_context: None,
                version: 1,
            },
            roles: vec![RoleDef {
                role_id: alpha,
                workflow_id,
                name: "intake".into(),
                description: None,
                ai_context: None,
                kind: RoleKind::Alpha,
                strategy: None,
                child_workflow_id: None,
            }],
            interactions: vec![InteractionDef {
                interaction_id: queue,
                workflow_id,
                name: "intake_out".into(),
                description: None,
            }],
            components: vec![ComponentDef {
                component_id: component,
                workflow_id,
                interaction_id: queue,
                role_id: alpha,
                direction: ComponentDirection::Outbound,
                name: "intake_to_queue".into(),
            }],
            guardians: vec![GuardianDef {
                guardian_id: Uuid::new_v4(),
                workflow_id,
                component_id: component,
                name: "open_gate".into(),
                kind: GuardKind::PassThru,
                config: json!({}),
            }],
        }
    }

    #[tokio::test]
    async fn bundle_round_trips() {
        let store = BlueprintStore::in_memory().await.unwrap();
        let bundle = sample_bundle();

        store.insert_bundle(&bundle).await.unwrap();
        let fetched = store.fetch_bundle(bundle.workflow.workflow_id).await.unwrap();

        assert_eq!(fetched, bundle);
    }

    #[tokio::test]
    async fn missing_workflow_is_not_found() {
        let store = BlueprintStore::in_memory().await.unwrap();
        let err = store.fetch_bundle(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn bundles_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blueprint.db");
        let bundle = sample_bundle();

        {
            let store = BlueprintStore::open(&path).await.unwrap();
            store.insert_bundle(&bundle).await.unwrap();
            store.close().await;
        }

        let store = BlueprintStore::open(&path).await.unwrap();
        let fetched = store.fetch_bundle(bundle.workflow.workflow_id).await.unwrap();
        assert_eq!(fetched, bundle);
    }

    #[tokio::test]
    async fn list_returns_imported_workflows() {
        let store = BlueprintStore::in_memory().await.unwrap();
        assert!(store.list_workflows().await.unwrap().is_empty());

        let bundle = sample_bundle();
        store.insert_bundle(&bundle).await.unwrap();

        let listed = store.list_workflows().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "invoice_review");
    }
}
