#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **tessera-server** – Thin HTTP adapter over the engine.
//!
//! No business logic lives here: handlers deserialize requests, call the
//! engine or pilot interface, and map typed errors to status codes
//! (not-found → 404, validation → 400, authorization → 403, lock conflicts
//! → 409). Checkout answers `204 No Content` when no work is available.
//! Pilot endpoints require the `X-Pilot-ID` header.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use tessera_engine::{Engine, EngineError};
use tessera_store::{BlueprintStore, StoreError};
use tessera_types::AttrMap;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The engine controller.
    pub engine: Arc<Engine>,
    /// The blueprint store (import target).
    pub blueprints: Arc<BlueprintStore>,
}

/// Build the HTTP router over an engine.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workflow/instantiate", post(instantiate))
        .route("/workflow/checkout", post(checkout))
        .route("/workflow/submit", post(submit))
        .route("/workflow/failure", post(failure))
        .route("/workflow/uow/:uow_id/heartbeat", post(heartbeat))
        .route("/memory", get(memory))
        .route("/pilot/kill-switch", post(pilot_kill_switch))
        .route("/pilot/clarification", post(pilot_clarification))
        .route("/pilot/waiver", post(pilot_waiver))
        .route("/pilot/resume", post(pilot_resume))
        .route("/pilot/cancel", post(pilot_cancel))
        .route("/admin/run-zombie-protocol", post(admin_zombie))
        .route("/admin/run-memory-decay", post(admin_decay))
        .route("/admin/mark-toxic", post(admin_mark_toxic))
        .route("/admin/import-blueprint", post(admin_import_blueprint))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//─────────────────────────────
//  Error mapping
//─────────────────────────────

/// An error with its HTTP status.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        let status = match &error {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            EngineError::NotAuthorized { .. } => StatusCode::FORBIDDEN,
            EngineError::Store(StoreError::GuardUnauthorized { .. }) => StatusCode::FORBIDDEN,
            EngineError::InvalidBlueprint(_)
            | EngineError::InvalidPilotAction(_)
            | EngineError::Store(StoreError::InvalidSpec(_)) => StatusCode::BAD_REQUEST,
            EngineError::NotLocked { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(%error, "request failed");
        }
        Self::new(status, error.to_string())
    }
}

fn pilot_id(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("X-Pilot-ID")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or_else(|| ApiError::bad_request("missing X-Pilot-ID header"))
}

//─────────────────────────────
//  Workflow handlers
//─────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct InstantiateRequest {
    template_id: Uuid,
    #[serde(default)]
    initial_context: AttrMap,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

async fn instantiate(
    State(state): State<AppState>,
    Json(request): Json<InstantiateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let instance_id = state
        .engine
        .instantiate_workflow(
            request.template_id,
            request.initial_context,
            request.name,
            request.description,
        )
        .await?;
    Ok(Json(json!({ "instance_id": instance_id })))
}

#[derive(Deserialize)]
struct CheckoutRequest {
    actor_id: Uuid,
    role_id: Uuid,
}

async fn checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<Response, ApiError> {
    match state
        .engine
        .checkout_work(request.actor_id, request.role_id)
        .await?
    {
        Some(checkout) => Ok(Json(json!({
            "uow_id": checkout.uow_id,
            "attributes": checkout.attributes,
            "context": checkout.context,
        }))
        .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Deserialize)]
struct SubmitRequest {
    uow_id: Uuid,
    actor_id: Uuid,
    result_attributes: AttrMap,
    #[serde(default)]
    reasoning: Option<String>,
}

async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .engine
        .submit_work(
            request.uow_id,
            request.actor_id,
            request.result_attributes,
            request.reasoning,
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct FailureRequest {
    uow_id: Uuid,
    actor_id: Uuid,
    error_code: String,
    #[serde(default)]
    details: Option<String>,
}

async fn failure(
    State(state): State<AppState>,
    Json(request): Json<FailureRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .engine
        .report_failure(
            request.uow_id,
            request.actor_id,
            &request.error_code,
            request.details,
        )
        .await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
struct HeartbeatRequest {
    actor_id: Uuid,
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(uow_id): Path<Uuid>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let recorded = state.engine.heartbeat(uow_id, request.actor_id).await?;
    Ok(Json(json!({ "success": true, "heartbeat_recorded": recorded })))
}

#[derive(Deserialize)]
struct MemoryQuery {
    actor_id: Uuid,
    role_id: Uuid,
    #[serde(default)]
    query: Option<String>,
}

async fn memory(
    State(state): State<AppState>,
    Query(params): Query<MemoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let records = state
        .engine
        .get_memory(params.actor_id, params.role_id, params.query.as_deref())
        .await?;
    let memories: Vec<_> = records
        .into_iter()
        .map(|m| {
            json!({
                "memory_id": m.memory_id,
                "key": m.key,
                "value": m.value,
                "context_type": m.scope.as_str(),
                "confidence_score": m.confidence,
                "created_at": m.created_at.to_rfc3339(),
                "last_accessed_at": m.last_accessed_at.map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    Ok(Json(json!({ "memories": memories })))
}

//─────────────────────────────
//  Pilot handlers
//─────────────────────────────

#[derive(Deserialize)]
struct KillSwitchRequest {
    instance_id: Uuid,
    reason: String,
}

async fn pilot_kill_switch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<KillSwitchRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pilot = pilot_id(&headers)?;
    let report = state
        .engine
        .pilot()
        .kill_switch(request.instance_id, &request.reason, &pilot)
        .await?;
    Ok(Json(json!({ "success": true, "paused_uows": report.paused_uows })))
}

#[derive(Deserialize)]
struct ClarificationRequest {
    uow_id: Uuid,
    text: String,
}

async fn pilot_clarification(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ClarificationRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pilot = pilot_id(&headers)?;
    state
        .engine
        .pilot()
        .submit_clarification(request.uow_id, &request.text, &pilot)
        .await?;
    Ok(Json(json!({ "success": true, "status": "ACTIVE" })))
}

#[derive(Deserialize)]
struct WaiverRequest {
    uow_id: Uuid,
    rule_id: String,
    reason: String,
}

async fn pilot_waiver(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<WaiverRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pilot = pilot_id(&headers)?;
    state
        .engine
        .pilot()
        .waive_violation(request.uow_id, &request.rule_id, &request.reason, &pilot)
        .await?;
    Ok(Json(json!({
        "success": true,
        "waived_rule": request.rule_id,
        "new_status": "ACTIVE",
    })))
}

#[derive(Deserialize)]
struct ResumeRequest {
    uow_id: Uuid,
}

async fn pilot_resume(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pilot = pilot_id(&headers)?;
    state.engine.pilot().resume_uow(request.uow_id, &pilot).await?;
    Ok(Json(json!({ "success": true, "status": "ACTIVE" })))
}

#[derive(Deserialize)]
struct CancelRequest {
    uow_id: Uuid,
    reason: String,
}

async fn pilot_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CancelRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let pilot = pilot_id(&headers)?;
    state
        .engine
        .pilot()
        .cancel_uow(request.uow_id, &pilot, &request.reason)
        .await?;
    Ok(Json(json!({ "success": true, "status": "FAILED" })))
}

//─────────────────────────────
//  Admin handlers
//─────────────────────────────

#[derive(Deserialize)]
struct ZombieRequest {
    #[serde(default = "default_zombie_timeout")]
    timeout_seconds: u64,
}

fn default_zombie_timeout() -> u64 {
    300
}

async fn admin_zombie(
    State(state): State<AppState>,
    Json(request): Json<ZombieRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reclaimed = state
        .engine
        .run_zombie_protocol(std::time::Duration::from_secs(request.timeout_seconds))
        .await?;
    Ok(Json(json!({ "success": true, "zombies_reclaimed": reclaimed })))
}

#[derive(Deserialize)]
struct DecayRequest {
    #[serde(default = "default_retention_days")]
    retention_days: u64,
}

fn default_retention_days() -> u64 {
    90
}

async fn admin_decay(
    State(state): State<AppState>,
    Json(request): Json<DecayRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deleted = state
        .engine
        .run_memory_decay(std::time::Duration::from_secs(
            request.retention_days * 24 * 3600,
        ))
        .await?;
    Ok(Json(json!({ "success": true, "memories_deleted": deleted })))
}

#[derive(Deserialize)]
struct MarkToxicRequest {
    memory_id: Uuid,
    reason: String,
}

async fn admin_mark_toxic(
    State(state): State<AppState>,
    Json(request): Json<MarkToxicRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .engine
        .mark_memory_toxic(request.memory_id, &request.reason)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn admin_import_blueprint(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let workflow_id = tessera_blueprint::import_yaml(&state.blueprints, &body)
        .await
        .map_err(|e| match &e {
            tessera_blueprint::BlueprintError::Store(inner) if !inner.is_not_found() => {
                tracing::error!(error = %e, "blueprint import failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            _ => ApiError::bad_request(e.to_string()),
        })?;
    Ok(Json(json!({ "workflow_id": workflow_id })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tessera_bus::{MemoryBroadcaster, TelemetryBuffer};
    use tessera_engine::EngineConfig;
    use tessera_guard::ModelRouter;
    use tessera_store::InstanceStore;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let blueprints = Arc::new(BlueprintStore::in_memory().await.unwrap());
        let store = Arc::new(InstanceStore::in_memory().await.unwrap());
        let engine = Engine::new(
            blueprints.clone(),
            store,
            Arc::new(TelemetryBuffer::default()),
            Arc::new(MemoryBroadcaster::default()),
            ModelRouter::default(),
            EngineConfig {
                pilot_timeout: Duration::from_millis(10),
                default_max_interactions: None,
            },
        );
        AppState {
            engine: Arc::new(engine),
            blueprints,
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_answers_ok() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn instantiating_an_unknown_template_is_404() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(post_json(
                "/workflow/instantiate",
                json!({ "template_id": Uuid::new_v4(), "initial_context": {} }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn checkout_for_an_unknown_role_is_404() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(post_json(
                "/workflow/checkout",
                json!({ "actor_id": Uuid::new_v4(), "role_id": Uuid::new_v4() }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn pilot_endpoints_require_the_header() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(post_json(
                "/pilot/kill-switch",
                json!({ "instance_id": Uuid::new_v4(), "reason": "incident" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn mark_toxic_on_an_unknown_memory_is_404() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(post_json(
                "/admin/mark-toxic",
                json!({ "memory_id": Uuid::new_v4(), "reason": "bad" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn zombie_endpoint_reports_zero_on_an_empty_store() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(post_json("/admin/run-zombie-protocol", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["zombies_reclaimed"], json!(0));
    }

    #[tokio::test]
    async fn blueprint_import_round_trips_through_the_adapter() {
        let app = build_router(test_state().await);
        let yaml = r#"
workflow:
  name: mini
attributes: [amount]
roles:
  - name: a
    kind: ALPHA
  - name: b
    kind: BETA
    strategy: HOMOGENEOUS
  - name: o
    kind: OMEGA
  - name: e
    kind: EPSILON
  - name: t
    kind: TAU
interactions:
  - name: q1
  - name: q2
  - name: ate
  - name: chronos
components:
  - name: a_out
    role: a
    interaction: q1
    direction: OUTBOUND
  - name: b_in
    role: b
    interaction: q1
    direction: INBOUND
  - name: b_out
    role: b
    interaction: q2
    direction: OUTBOUND
  - name: o_in
    role: o
    interaction: q2
    direction: INBOUND
  - name: e_in
    role: e
    interaction: ate
    direction: INBOUND
  - name: b_reject
    role: b
    interaction: ate
    direction: OUTBOUND
  - name: t_in
    role: t
    interaction: chronos
    direction: INBOUND
  - name: b_expire
    role: b
    interaction: chronos
    direction: OUTBOUND
guardians:
  - name: o_gate
    component: o_in
    type: CERBERUS
  - name: e_gate
    component: e_in
    type: PASS_THRU
"#;
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/import-blueprint")
                    .header("content-type", "text/plain")
                    .body(Body::from(yaml))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_blueprints_are_400() {
        let app = build_router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/import-blueprint")
                    .body(Body::from("workflow: {name: broken}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
