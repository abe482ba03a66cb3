//! worker对broker暴露的RPC端点

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tracing::debug;

use jobflow_core::models::{
    CancelTaskRequest, CancelTaskResponse, DispatchTaskRequest, DispatchTaskResponse, Node,
    NodeRole, PingResponse,
};
use jobflow_core::{RpcResponse, SchedulerResult, ServerLifecycle};

use crate::runtime::WorkerRuntime;

#[derive(Clone)]
pub struct WorkerState {
    pub node: Node,
    pub lifecycle: Arc<ServerLifecycle>,
    pub runtime: Arc<WorkerRuntime>,
}

pub fn create_routes(state: WorkerState) -> Router {
    Router::new()
        .route("/rpc/ping", get(ping))
        .route("/rpc/tasks/dispatch", post(dispatch_task))
        .route("/rpc/tasks/cancel", post(cancel_task))
        .with_state(state)
}

async fn ping(State(state): State<WorkerState>) -> RpcResponse<PingResponse> {
    RpcResponse::success(PingResponse {
        server_id: state.node.server_id.clone(),
        url: state.node.url.clone(),
        role: NodeRole::Worker,
        state: state.lifecycle.state().to_string(),
    })
}

async fn dispatch_task(
    State(state): State<WorkerState>,
    Json(request): Json<DispatchTaskRequest>,
) -> SchedulerResult<RpcResponse<DispatchTaskResponse>> {
    state.lifecycle.ensure_running()?;
    debug!("收到任务派发: {} ({})", request.task_id, request.executor);
    let response = state.runtime.submit(request).await;
    Ok(RpcResponse::success(response))
}

async fn cancel_task(
    State(state): State<WorkerState>,
    Json(request): Json<CancelTaskRequest>,
) -> SchedulerResult<RpcResponse<CancelTaskResponse>> {
    state.lifecycle.ensure_running()?;
    let signalled = state.runtime.cancel(&request.task_id).await;
    Ok(RpcResponse::success(CancelTaskResponse { signalled }))
}
