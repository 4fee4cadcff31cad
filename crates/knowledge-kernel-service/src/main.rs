use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use knowledge_kernel_api::{
    AddItemRequest, AddRuleRequest, KnowledgeApi, PromptResult, SelectRequest,
    API_CONTRACT_VERSION,
};
use knowledge_kernel_core::KnowledgeTree;
use serde::{Deserialize, Serialize};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Debug, Clone)]
struct ServiceState {
    api: KnowledgeApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "knowledge-kernel-service")]
#[command(about = "Local HTTP service for Knowledge Kernel")]
struct Args {
    #[arg(long, default_value = "./knowledge_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = StatusCode::BAD_REQUEST;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError { service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/tree", get(tree_show).put(tree_import))
        .route("/v1/tree/items", post(tree_add_item))
        .route("/v1/rules", post(rule_add))
        .route("/v1/query/select", post(query_select))
        .route("/v1/query/legacy", post(query_legacy))
        .route("/v1/prompt", post(prompt_generate))
        .route("/v1/selection/:selection_id", get(selection_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState { api: KnowledgeApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<knowledge_kernel_store_sqlite::SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<knowledge_kernel_api::MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn tree_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<KnowledgeTree>>, ServiceError> {
    let tree = state.api.tree_show().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(tree)))
}

async fn tree_import(
    State(state): State<ServiceState>,
    Json(tree): Json<KnowledgeTree>,
) -> Result<Json<ServiceEnvelope<KnowledgeTree>>, ServiceError> {
    let imported =
        state.api.tree_import(&tree).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(imported)))
}

async fn tree_add_item(
    State(state): State<ServiceState>,
    Json(request): Json<AddItemRequest>,
) -> Result<Json<ServiceEnvelope<knowledge_kernel_core::KnowledgeItem>>, ServiceError> {
    let item = state.api.add_item(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(item)))
}

async fn rule_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddRuleRequest>,
) -> Result<Json<ServiceEnvelope<knowledge_kernel_core::FlatRule>>, ServiceError> {
    let rule = state.api.add_rule(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(rule)))
}

async fn query_select(
    State(state): State<ServiceState>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<ServiceEnvelope<knowledge_kernel_core::SelectionResult>>, ServiceError> {
    let result =
        state.api.query_select(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn query_legacy(
    State(state): State<ServiceState>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<ServiceEnvelope<knowledge_kernel_core::SelectionResult>>, ServiceError> {
    let result = state
        .api
        .query_select_legacy(request)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn prompt_generate(
    State(state): State<ServiceState>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<ServiceEnvelope<PromptResult>>, ServiceError> {
    let result = state.api.prompt(request).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn selection_show(
    State(state): State<ServiceState>,
    Path(selection_id): Path<String>,
) -> Result<Json<ServiceEnvelope<knowledge_kernel_core::SelectionResult>>, ServiceError> {
    let result = state
        .api
        .result_show(&selection_id)
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("knowledgekernel-service-{}.sqlite3", ulid::Ulid::new()))
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    async fn post_json(router: Router, uri: &str, payload: &serde_json::Value) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("POST")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(payload.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    async fn get_response(router: Router, uri: &str) -> Response {
        match router
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .method("GET")
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|err| panic!("failed to build request for {uri}: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("request to {uri} failed: {err}"),
        }
    }

    fn select_payload() -> serde_json::Value {
        serde_json::json!({
            "user_id": "u_100",
            "user_role": "PA",
            "user_department": "Claims",
            "user_state": null,
            "claim_severity": null,
            "intent": null,
            "workflow_context": null,
            "as_of": "2024-03-01T12:00:00Z"
        })
    }

    async fn seed_tree_with_rule(router: &Router) {
        let state_tree = serde_json::json!({
            "version": 1,
            "lastModified": "2024-01-01T00:00:00Z",
            "departments": [{
                "id": ulid::Ulid::new().to_string(),
                "name": "Claims",
                "order": 1,
                "subDepartments": [{
                    "id": ulid::Ulid::new().to_string(),
                    "name": "MMC",
                    "order": 1,
                    "workflows": [{
                        "id": ulid::Ulid::new().to_string(),
                        "name": "Intake",
                        "order": 1,
                        "items": [{
                            "id": ulid::Ulid::new().to_string(),
                            "title": "Lien verification",
                            "type": "rule",
                            "aiInstructions": "Always verify lien documentation before proceeding.",
                            "scope": {},
                            "tags": ["lien"],
                            "priority": "High",
                            "order": 1,
                            "version": 1,
                            "effective": "2023-01-01",
                            "isActive": true,
                            "createdAt": "2023-01-01T00:00:00Z",
                            "updatedAt": "2023-01-01T00:00:00Z",
                            "updatedBy": "tester"
                        }]
                    }]
                }]
            }]
        });

        let response = match router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/tree")
                    .method("PUT")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(state_tree.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build tree import request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("tree import request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let state = ServiceState { api: KnowledgeApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = get_response(router, "/v1/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(
            value.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let state = ServiceState { api: KnowledgeApi::new(unique_temp_db_path()) };
        let router = app(state);

        let response = get_response(router, "/v1/openapi").await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/query/select"));
        assert!(body.contains("/v1/selection/{selectionId}"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn tree_import_select_and_replay_round_trip() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: KnowledgeApi::new(db_path.clone()) };
        let router = app(state);

        seed_tree_with_rule(&router).await;

        let select_response =
            post_json(router.clone(), "/v1/query/select", &select_payload()).await;
        assert_eq!(select_response.status(), StatusCode::OK);
        let select_value = response_json(select_response).await;
        let selection_id = select_value
            .get("data")
            .and_then(|data| data.get("selectionId"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.selectionId in response: {select_value}"))
            .to_string();
        assert_eq!(
            select_value
                .get("data")
                .and_then(|data| data.get("selectedItems"))
                .and_then(serde_json::Value::as_array)
                .map(Vec::len),
            Some(1)
        );

        let replay_response =
            get_response(router, &format!("/v1/selection/{selection_id}")).await;
        assert_eq!(replay_response.status(), StatusCode::OK);
        let replay_value = response_json(replay_response).await;
        assert_eq!(
            replay_value
                .get("data")
                .and_then(|data| data.get("selectionId"))
                .and_then(serde_json::Value::as_str),
            Some(selection_id.as_str())
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn prompt_endpoint_renders_selected_rules() {
        let db_path = unique_temp_db_path();
        let state = ServiceState { api: KnowledgeApi::new(db_path.clone()) };
        let router = app(state);

        seed_tree_with_rule(&router).await;

        let prompt_response = post_json(router, "/v1/prompt", &select_payload()).await;
        assert_eq!(prompt_response.status(), StatusCode::OK);
        let prompt_value = response_json(prompt_response).await;
        let prompt = prompt_value
            .get("data")
            .and_then(|data| data.get("prompt"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.prompt in response: {prompt_value}"));
        assert!(prompt.contains("1. Always verify lien documentation before proceeding."));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn invalid_tree_import_returns_bad_request() {
        let state = ServiceState { api: KnowledgeApi::new(unique_temp_db_path()) };
        let router = app(state);

        // rule item without aiInstructions fails entry-time validation
        let invalid_tree = serde_json::json!({
            "version": 1,
            "lastModified": "2024-01-01T00:00:00Z",
            "departments": [{
                "id": ulid::Ulid::new().to_string(),
                "name": "Claims",
                "order": 1,
                "subDepartments": [{
                    "id": ulid::Ulid::new().to_string(),
                    "name": "MMC",
                    "order": 1,
                    "workflows": [{
                        "id": ulid::Ulid::new().to_string(),
                        "name": "Intake",
                        "order": 1,
                        "items": [{
                            "id": ulid::Ulid::new().to_string(),
                            "title": "Broken rule",
                            "type": "rule",
                            "scope": {},
                            "tags": [],
                            "priority": "High",
                            "order": 1,
                            "version": 1,
                            "effective": "2023-01-01",
                            "isActive": true,
                            "createdAt": "2023-01-01T00:00:00Z",
                            "updatedAt": "2023-01-01T00:00:00Z",
                            "updatedBy": "tester"
                        }]
                    }]
                }]
            }]
        });

        let response = match router
            .oneshot(
                Request::builder()
                    .uri("/v1/tree")
                    .method("PUT")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(invalid_tree.to_string()))
                    .unwrap_or_else(|err| panic!("failed to build tree import request: {err}")),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => panic!("tree import request failed: {err}"),
        };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
