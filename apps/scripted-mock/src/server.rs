use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{MethodRouter, get, on, post},
};
use serde::Serialize;
use thiserror::Error;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::{
    script::{CompiledHandler, HandlerResponse, ScriptError, ScriptRequest},
    state::{StateError, TestStateStore},
};

mod control;

#[derive(Clone)]
pub struct AppState {
    service_name: String,
    store: Arc<TestStateStore>,
    max_body_bytes: usize,
    route_count: usize,
}

impl AppState {
    #[must_use]
    pub fn new(
        service_name: String,
        store: Arc<TestStateStore>,
        max_body_bytes: usize,
        route_count: usize,
    ) -> Self {
        Self {
            service_name,
            store,
            max_body_bytes,
            route_count,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TestStateStore> {
        &self.store
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    routes: usize,
}

pub fn build_router(state: AppState, handlers: &[Arc<CompiledHandler>]) -> Router {
    let mut router = Router::new()
        .route("/__health", get(health))
        .route("/__config", post(control::update_config))
        .route("/__reset_calls", post(control::reset_calls))
        .route("/__calls", get(control::list_calls));

    for (path, method_router) in scripted_routes(handlers) {
        router = router.route(&path, method_router);
    }

    router.with_state(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http()),
    )
}

/// Groups handlers by path so every method of one path shares a single router entry.
fn scripted_routes(handlers: &[Arc<CompiledHandler>]) -> BTreeMap<String, MethodRouter<AppState>> {
    let mut routes = BTreeMap::<String, MethodRouter<AppState>>::new();
    for handler in handlers {
        let key = handler.route();
        let Some(filter) = key.method_filter() else {
            tracing::warn!(route = %key, "skipping route with unroutable method");
            continue;
        };

        let endpoint = Arc::clone(handler);
        let dispatch = move |State(state): State<AppState>,
                             params: Option<Path<HashMap<String, String>>>,
                             query: Option<Query<HashMap<String, String>>>,
                             request: Request| {
            let handler = Arc::clone(&endpoint);
            async move { dispatch_route(state, handler, params, query, request).await }
        };

        let path = key.path().to_string();
        let method_router = match routes.remove(&path) {
            Some(existing) => existing.on(filter, dispatch),
            None => on(filter, dispatch),
        };
        routes.insert(path, method_router);
    }
    routes
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.service_name,
        routes: state.route_count,
    })
}

async fn dispatch_route(
    state: AppState,
    handler: Arc<CompiledHandler>,
    params: Option<Path<HashMap<String, String>>>,
    query: Option<Query<HashMap<String, String>>>,
    request: Request,
) -> Result<Response, ApiError> {
    let route = handler.route().to_string();
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|error| ApiError::BodyRead {
            route: route.clone(),
            message: error.to_string(),
        })?;

    let script_request = ScriptRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        headers: header_map(&parts.headers),
        query: query
            .map(|Query(values)| values.into_iter().collect())
            .unwrap_or_default(),
        params: params
            .map(|Path(values)| values.into_iter().collect())
            .unwrap_or_default(),
        body,
    };

    let config = state.store.config_snapshot();
    let store = Arc::clone(&state.store);
    let outcome =
        tokio::task::spawn_blocking(move || handler.invoke(script_request, config, store))
            .await
            .map_err(|error| ApiError::Worker {
                route: route.clone(),
                message: error.to_string(),
            })?;
    let response = outcome.map_err(|source| ApiError::Script {
        route: route.clone(),
        source,
    })?;

    into_http_response(&route, response)
}

fn header_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

fn into_http_response(route: &str, response: HandlerResponse) -> Result<Response, ApiError> {
    let invalid = |message: String| ApiError::InvalidResponse {
        route: route.to_string(),
        message,
    };

    let status = StatusCode::from_u16(response.status).map_err(|error| invalid(error.to_string()))?;
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|error| invalid(format!("header name '{name}': {error}")))?;
        let header_value = HeaderValue::from_str(&value)
            .map_err(|error| invalid(format!("header '{name}' value: {error}")))?;
        headers.insert(header_name, header_value);
    }

    let mut http = (status, Json(response.body)).into_response();
    http.headers_mut().extend(headers);
    Ok(http)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unable to read request body for {route}: {message}")]
    BodyRead { route: String, message: String },
    #[error("{route}: {source}")]
    Script {
        route: String,
        #[source]
        source: ScriptError,
    },
    #[error("processor worker for {route} failed: {message}")]
    Worker { route: String, message: String },
    #[error("invalid response from {route}: {message}")]
    InvalidResponse { route: String, message: String },
    #[error(transparent)]
    Config(#[from] StateError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            Self::BodyRead { .. } => "body_read_failed",
            Self::Script { .. } => "processor_failed",
            Self::Worker { .. } => "worker_failed",
            Self::InvalidResponse { .. } => "invalid_response",
            Self::Config(_) => "invalid_config",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.code();
        let message = self.to_string();
        tracing::warn!(error = code, reason = %message, "request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}
