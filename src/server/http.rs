//! HTTP surface of a node
//!
//! Each local lock server is nested under its service endpoint with one POST route per
//! operation plus `/login`. Errors travel as an [`RpcErrorBody`] with a stable code.

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::types::{LockReply, LockRpcArgs, LoginArgs, RpcErrorBody};
use crate::common::Error;
use crate::server::rpc::{LockOp, LockRpcService};

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = RpcErrorBody {
            code: self.rpc_code(),
            message: self.to_string(),
        };
        (self.to_http_status(), Json(body)).into_response()
    }
}

/// Shared state of the node-level routes
#[derive(Clone)]
pub struct NodeState {
    pub node_id: String,
    pub services: Arc<Vec<LockRpcService>>,
}

async fn login(
    State(service): State<LockRpcService>,
    Json(args): Json<LoginArgs>,
) -> Result<impl IntoResponse, Error> {
    let reply = service.login(&args).await?;
    Ok(Json(reply))
}

async fn dispatch(service: LockRpcService, op: LockOp, req: LockRpcArgs) -> Response {
    match service.call(op, &req) {
        Ok(ok) => Json(LockReply { ok }).into_response(),
        Err(e) => {
            if e.is_misuse() {
                tracing::debug!(op = %op, resource = %req.args.resource, "{}", e);
            }
            e.into_response()
        }
    }
}

/// Routes of a single lock server, relative to its service endpoint
pub fn lock_router(service: LockRpcService) -> Router {
    let mut router = Router::new().route("/login", post(login));
    for op in LockOp::ALL {
        router = router.route(
            op.route(),
            post(
                move |State(service): State<LockRpcService>, Json(req): Json<LockRpcArgs>| {
                    dispatch(service, op, req)
                },
            ),
        );
    }
    router.with_state(service)
}

async fn health(State(state): State<NodeState>) -> impl IntoResponse {
    let locked: usize = state.services.iter().map(|s| s.server().len()).sum();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "node_id": state.node_id,
            "version": crate::VERSION,
            "lock_servers": state.services.iter().map(|s| s.service_endpoint()).collect::<Vec<_>>(),
            "locked_resources": locked,
        })),
    )
}

/// Full router of a node: health plus every local lock server
pub fn create_router(state: NodeState) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .with_state(state.clone());

    for service in state.services.iter() {
        let path = service.service_endpoint().to_string();
        router = router.nest(&path, lock_router(service.clone()));
    }

    router
        .layer(middleware::from_fn(request_tracing_middleware))
        .layer(TraceLayer::new_for_http())
}
