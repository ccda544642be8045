use axum::{
    extract::{rejection::FormRejection, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::hypervisor::StopMethod;
use crate::provisioning::{
    DeleteRequest, ProvisionError, ProvisioningRequest, VmTarget, MAX_BATCH_COUNT,
};
use crate::scheduling::CoreOverrides;
use crate::server::state::AppState;

pub const AUTH_HEADER: &str = "x-auth-token";
pub const CREATE_PATH: &str = "/api/v1/create";
pub const DELETE_PATH: &str = "/api/v1/delete";

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Form body of `POST /api/v1/create`
#[derive(Debug, Default, Deserialize)]
pub struct CreateForm {
    #[serde(default)]
    pub base_template: String,
    #[serde(default)]
    pub vm_template: String,
    pub name: Option<String>,
    pub node: Option<String>,
    pub numa: Option<String>,
    pub phy: Option<String>,
    pub ht: Option<String>,
    pub phy_only: Option<String>,
    pub ht_only: Option<String>,
    pub reset: Option<String>,
    pub count: Option<String>,
}

/// Form body of `POST /api/v1/delete`
#[derive(Debug, Default, Deserialize)]
pub struct DeleteForm {
    pub vm_name: Option<String>,
    pub node: Option<String>,
    pub vm_id: Option<String>,
    pub stop_method: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Pure form conversion
// ============================================================================

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn flag(value: &Option<String>) -> bool {
    value.as_deref() == Some("1")
}

impl CreateForm {
    pub fn into_request(self) -> Result<ProvisioningRequest, ProvisionError> {
        let count = match non_empty(self.count) {
            None => 1,
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|c| (1..=MAX_BATCH_COUNT).contains(c))
                .ok_or_else(|| {
                    ProvisionError::Validation(format!(
                        "Invalid count parameter. Must be an integer between 1 and {}",
                        MAX_BATCH_COUNT
                    ))
                })?,
        };

        let numa = non_empty(self.numa)
            .map(|raw| {
                raw.trim().parse::<u32>().map_err(|_| {
                    ProvisionError::Validation(format!("Invalid NUMA node ID: {}", raw))
                })
            })
            .transpose()?;

        Ok(ProvisioningRequest {
            phy_only: flag(&self.phy_only),
            ht_only: flag(&self.ht_only),
            reset: flag(&self.reset),
            base_template: self.base_template,
            vm_template: self.vm_template,
            node: non_empty(self.node),
            name: non_empty(self.name),
            numa,
            cores: CoreOverrides {
                phy: non_empty(self.phy),
                ht: non_empty(self.ht),
            },
            count,
        })
    }
}

impl DeleteForm {
    pub fn into_request(self) -> Result<DeleteRequest, ProvisionError> {
        let stop_method = self
            .stop_method
            .as_deref()
            .unwrap_or_default()
            .parse::<StopMethod>()
            .map_err(ProvisionError::Validation)?;

        let target = match (non_empty(self.vm_name), non_empty(self.node), non_empty(self.vm_id)) {
            (Some(name), _, _) => VmTarget::Name(name),
            (None, Some(node), Some(raw)) => VmTarget::Id {
                node,
                vm_id: raw.trim().parse().map_err(|_| {
                    ProvisionError::Validation("vm_id must be a number".to_string())
                })?,
            },
            _ => {
                return Err(ProvisionError::Validation(
                    "vm_name or (node and vm_id) are required".to_string(),
                ))
            }
        };

        Ok(DeleteRequest {
            target,
            stop_method,
        })
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Record and report a failed request, then build its response
fn failure(state: &AppState, handler: &str, err: ProvisionError) -> Response {
    state.metrics.record_error(handler);
    state.reporter.report(handler, &err);

    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn request_id(headers: &HeaderMap) -> Uuid {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4)
}

fn with_request_id(request_id: Uuid, mut response: Response) -> Response {
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "200 OK")
}

/// Prometheus scrape endpoint
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        state.metrics.render(),
    )
}

/// Create one VM, or a batch when `count` > 1
pub async fn create_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<CreateForm>, FormRejection>,
) -> Response {
    let request_id = request_id(&headers);

    let req = match form
        .map_err(|e| ProvisionError::Validation(format!("Bad request: {}", e)))
        .and_then(|Form(f)| f.into_request())
    {
        Ok(req) => req,
        Err(e) => return with_request_id(request_id, failure(&state, CREATE_PATH, e)),
    };

    let scope = state.request_scope();
    let span = info_span!("create", request_id = %request_id, count = req.count);

    let response = async {
        if req.is_bulk() {
            info!("Bulk VM creation requested: count={}", req.count);
            match state.pipeline.create_batch(&req, &scope.token).await {
                Ok(batch) => Json(batch).into_response(),
                Err(e) => failure(&state, CREATE_PATH, e),
            }
        } else {
            match state.pipeline.create(&req, &scope.token).await {
                Ok(result) => Json(result).into_response(),
                Err(e) => {
                    error!("VM creation failed: {}", e);
                    failure(&state, CREATE_PATH, e)
                }
            }
        }
    }
    .instrument(span)
    .await;

    with_request_id(request_id, response)
}

/// Stop and delete a VM
pub async fn delete_vm(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<DeleteForm>, FormRejection>,
) -> Response {
    let request_id = request_id(&headers);

    let req = match form
        .map_err(|e| ProvisionError::Validation(format!("Bad request: {}", e)))
        .and_then(|Form(f)| f.into_request())
    {
        Ok(req) => req,
        Err(e) => return with_request_id(request_id, failure(&state, DELETE_PATH, e)),
    };

    let scope = state.request_scope();
    let span = info_span!("delete", request_id = %request_id);

    let response = match state
        .pipeline
        .delete(&req, &scope.token)
        .instrument(span)
        .await
    {
        Ok(deleted) => Json(deleted).into_response(),
        Err(e) => {
            error!("VM deletion failed: {}", e);
            failure(&state, DELETE_PATH, e)
        }
    };

    with_request_id(request_id, response)
}

/// Reject requests without the configured `X-Auth-Token`
pub async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let presented = req
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok());

    if !state.is_authorized(presented) {
        let path = req.uri().path().to_string();
        error!("Unauthorized access to {}", path);
        state.metrics.record_error(&path);
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(req).await
}

/// Create the Axum router
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route(CREATE_PATH, post(create_vm))
        .route(DELETE_PATH, post(delete_vm))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/health-check", get(health_check))
        .route("/metrics", get(metrics))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
