//! Plugin host: serves local [`ToolHandler`]s over the plugin HTTP contract.
//!
//! ```text
//! POST /execute   describe | invoke | release
//! GET  /health
//! ```
//!
//! Unknown hooks and unknown tools answer 400, invalid arguments 422,
//! other handler failures 500.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use opsloop_core::error::ToolExecutionError;
use opsloop_core::tool::{ToolHandler, ToolInvocation};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::dispatcher::validate_arguments;
use crate::plugin::{DescribeResponse, DescribedTool, ErrorBody, InvokeResponse, PluginRequest};

struct HostState {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
    released: Mutex<BTreeSet<String>>,
}

/// An HTTP plugin built from in-process handlers.
#[derive(Clone)]
pub struct PluginHost {
    state: Arc<HostState>,
}

impl Default for PluginHost {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tools: usize,
}

impl PluginHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(HostState {
                handlers: BTreeMap::new(),
                released: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    /// Add a handler. A later handler with the same name replaces the earlier one.
    pub fn with_handler(self, handler: Arc<dyn ToolHandler>) -> Self {
        let mut handlers = self.state.handlers.clone();
        handlers.insert(handler.name().to_string(), handler);
        Self {
            state: Arc::new(HostState {
                handlers,
                released: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn with_handlers(self, handlers: impl IntoIterator<Item = Arc<dyn ToolHandler>>) -> Self {
        handlers.into_iter().fold(self, Self::with_handler)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.state.handlers.keys().map(String::as_str).collect()
    }

    /// Session ids a caller has released so far.
    pub fn released_sessions(&self) -> Vec<String> {
        self.state
            .released
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/execute", post(execute_handler))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind `addr` and serve in a background task. Returns the bound address,
    /// which matters when `addr` asks for port 0.
    pub async fn spawn(
        &self,
        addr: &str,
    ) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let app = self.router();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!(error = %e, "Plugin host stopped");
            }
        });
        debug!(addr = %local, tools = self.state.handlers.len(), "Plugin host spawned");
        Ok((local, handle))
    }

    /// Serve on `addr` until `shutdown` resolves.
    pub async fn serve(
        &self,
        addr: &str,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, tools = ?self.tool_names(), "Plugin host starting");
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }
}

async fn health_handler(State(state): State<Arc<HostState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tools: state.handlers.len(),
    })
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: error.into() })).into_response()
}

async fn execute_handler(
    State(state): State<Arc<HostState>>,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let request: PluginRequest = match serde_json::from_value(body) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, format!("bad request: {e}")),
    };

    match request {
        PluginRequest::Describe => {
            let tools = state
                .handlers
                .values()
                .map(|h| DescribedTool::from_definition(&h.to_definition()))
                .collect();
            Json(DescribeResponse { tools }).into_response()
        }
        PluginRequest::Invoke {
            session_id,
            payload,
        } => {
            let Some(handler) = state.handlers.get(&payload.tool) else {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    format!("unknown tool: {}", payload.tool),
                );
            };
            let args = match validate_arguments(&handler.input_schema(), &payload.args) {
                Ok(args) => args,
                Err(e) => return tool_error_response(e),
            };
            let invocation = ToolInvocation {
                session_id,
                tool: payload.tool,
                args,
                state: payload.state,
            };
            match handler.invoke(invocation).await {
                Ok(resp) => Json(InvokeResponse {
                    result: resp.result,
                    state_delta: resp.state_delta,
                })
                .into_response(),
                Err(e) => tool_error_response(e),
            }
        }
        PluginRequest::Release { session_id } => {
            debug!(session_id = %session_id, "Session released by caller");
            state
                .released
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session_id);
            Json(serde_json::json!({})).into_response()
        }
    }
}

fn tool_error_response(err: ToolExecutionError) -> Response {
    let status = match &err {
        ToolExecutionError::UnknownTool { .. } => StatusCode::BAD_REQUEST,
        ToolExecutionError::InvalidArguments { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ToolExecutionError::Rejected { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
        }
        ToolExecutionError::PluginUnreachable { .. } => StatusCode::BAD_GATEWAY,
        ToolExecutionError::HandlerFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::builtin_handlers;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    fn host() -> PluginHost {
        PluginHost::new().with_handlers(builtin_handlers())
    }

    async fn post_execute(host: &PluginHost, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method("POST")
            .uri("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = host.router().oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_check() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = host().router().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["tools"], 2);
    }

    #[tokio::test]
    async fn describe_lists_handlers() {
        let (status, body) = post_execute(&host(), json!({"hook": "describe"})).await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["session_recall", "session_remember"]);
        assert!(body["tools"][1]["inputSchema"]["required"].is_array());
    }

    #[tokio::test]
    async fn invoke_returns_result_and_delta() {
        let (status, body) = post_execute(
            &host(),
            json!({
                "hook": "invoke",
                "sessionId": "s-1",
                "payload": {"tool": "session_remember", "args": {"key": "pod", "value": "api-1"}, "state": {}}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stateDelta"]["pod"], "api-1");
    }

    #[tokio::test]
    async fn error_statuses() {
        let host = host();
        let (status, body) = post_execute(&host, json!({"hook": "teleport"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = post_execute(
            &host,
            json!({"hook": "invoke", "sessionId": "s-1", "payload": {"tool": "nope"}}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post_execute(
            &host,
            json!({"hook": "invoke", "sessionId": "s-1", "payload": {"tool": "session_remember", "args": {"key": "k"}}}),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("value"));
    }

    #[tokio::test]
    async fn release_is_recorded() {
        let host = host();
        let (status, _) = post_execute(&host, json!({"hook": "release", "sessionId": "s-9"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(host.released_sessions(), vec!["s-9".to_string()]);
    }
}
