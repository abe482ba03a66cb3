//! broker对外的RPC端点
//!
//! 除ping外, 所有端点在服务进入RUNNING之前都返回SERVER_NOT_READY。

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use jobflow_core::models::{
    HeartbeatRequest, HeartbeatResponse, Node, NodeRole, PingResponse, RegisterRequest,
    RegisterResponse, TaskFeedback, Worker,
};
use jobflow_core::{
    now_millis, RpcResponse, SchedulerError, SchedulerResult, ServerLifecycle,
};
use jobflow_domain::{
    DomainEvent, EventPublisher, Execution, ExecutionState, Flow, FlowRepository, IdGenerator,
    IdKind, RefType, Schedule, Task,
};
use jobflow_infrastructure::MetricsCollector;

use crate::execution_manager::{ExecutionManager, TriggerRequest};
use crate::registry::NodeRegistry;
use crate::scheduler::ScheduleSweeper;

type RpcResult<T> = SchedulerResult<RpcResponse<T>>;

#[derive(Clone)]
pub struct BrokerState {
    pub node: Node,
    pub lifecycle: Arc<ServerLifecycle>,
    pub registry: Arc<NodeRegistry>,
    pub manager: Arc<ExecutionManager>,
    pub sweeper: Arc<ScheduleSweeper>,
    pub flows: Arc<dyn FlowRepository>,
    pub ids: Arc<dyn IdGenerator>,
    pub events: Arc<dyn EventPublisher>,
}

pub fn create_routes(state: BrokerState) -> Router {
    Router::new()
        .route("/rpc/ping", get(ping))
        // worker通道
        .route("/rpc/workers/register", post(register_worker))
        .route("/rpc/workers/heartbeat", post(heartbeat))
        .route("/rpc/tasks/feedback", post(feedback))
        // 管理操作
        .route("/rpc/workers", get(list_workers))
        .route("/rpc/workers/{id}/enable", post(enable_worker))
        .route("/rpc/workers/{id}/disable", post(disable_worker))
        .route("/rpc/flows", post(save_flow))
        .route("/rpc/flows/{id}/trigger", post(trigger_flow))
        .route("/rpc/schedules", post(submit_schedule))
        .route("/rpc/schedules/delays", post(submit_delay))
        .route("/rpc/schedules/{id}/trigger", post(trigger_schedule))
        .route("/rpc/executions/{id}", get(get_execution))
        .route("/rpc/executions/{id}/cancel", post(cancel_execution))
        .route("/rpc/executions/{id}/pause", post(pause_execution))
        .route("/rpc/executions/{id}/resume", post(resume_execution))
        .with_state(state)
}

async fn ping(State(state): State<BrokerState>) -> RpcResponse<PingResponse> {
    RpcResponse::success(PingResponse {
        server_id: state.node.server_id.clone(),
        url: state.node.url.clone(),
        role: NodeRole::Broker,
        state: state.lifecycle.state().to_string(),
    })
}

async fn register_worker(
    State(state): State<BrokerState>,
    Json(request): Json<RegisterRequest>,
) -> RpcResult<RegisterResponse> {
    state.lifecycle.ensure_running()?;
    if request.url.trim().is_empty() {
        return Err(SchedulerError::RegisterFailure("worker地址为空".to_string()));
    }
    if request.executors.is_empty() {
        return Err(SchedulerError::RegisterFailure(format!(
            "worker {} 没有声明任何执行器",
            request.url
        )));
    }

    let now = now_millis();
    let worker_id = request
        .server_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.ids.next_id(IdKind::Worker));
    let mut node = Node::new(&worker_id, &request.url, NodeRole::Worker);
    node.tags = request.tags;

    let available = request.metric.available_queue_num;
    let is_new = state
        .registry
        .online(node, request.executors, request.metric, now)
        .await;
    MetricsCollector::new().set_worker_available_queue(&worker_id, available);
    if is_new {
        info!("Worker {} 注册成功: {}", worker_id, request.url);
        let event = DomainEvent::WorkerOnline {
            server_id: worker_id.clone(),
        };
        if let Err(e) = state.events.publish(event).await {
            warn!("发布Worker {} 上线事件失败: {}", worker_id, e);
        }
    }

    // 心跳必须回到登记了这个worker的broker
    Ok(RpcResponse::success(RegisterResponse {
        worker_id,
        broker_url: state.node.url.clone(),
        brokers: alive_brokers(&state, now).await,
    }))
}

async fn heartbeat(
    State(state): State<BrokerState>,
    Json(request): Json<HeartbeatRequest>,
) -> RpcResult<HeartbeatResponse> {
    state.lifecycle.ensure_running()?;
    let now = now_millis();
    let available = request.metric.available_queue_num;
    state
        .registry
        .touch(&request.worker_id, request.metric, now)
        .await?;
    MetricsCollector::new().set_worker_available_queue(&request.worker_id, available);
    Ok(RpcResponse::success(HeartbeatResponse {
        brokers: alive_brokers(&state, now).await,
    }))
}

async fn alive_brokers(state: &BrokerState, now: i64) -> Vec<String> {
    let mut brokers: Vec<String> = state
        .registry
        .all_alive(NodeRole::Broker, now)
        .await
        .into_iter()
        .map(|node| node.url)
        .collect();
    if brokers.is_empty() {
        brokers.push(state.node.url.clone());
    }
    brokers
}

async fn feedback(
    State(state): State<BrokerState>,
    Json(feedback): Json<TaskFeedback>,
) -> RpcResult<bool> {
    state.lifecycle.ensure_running()?;
    state.manager.feedback(feedback).await?;
    Ok(RpcResponse::success(true))
}

async fn list_workers(State(state): State<BrokerState>) -> RpcResult<Vec<Worker>> {
    state.lifecycle.ensure_running()?;
    Ok(RpcResponse::success(state.registry.workers(now_millis()).await))
}

async fn enable_worker(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> RpcResult<bool> {
    state.lifecycle.ensure_running()?;
    state.registry.set_enabled(&id, true).await?;
    Ok(RpcResponse::success(true))
}

async fn disable_worker(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> RpcResult<bool> {
    state.lifecycle.ensure_running()?;
    state.registry.set_enabled(&id, false).await?;
    info!("Worker {} 已禁用", id);
    Ok(RpcResponse::success(true))
}

async fn save_flow(State(state): State<BrokerState>, Json(flow): Json<Flow>) -> RpcResult<Flow> {
    state.lifecycle.ensure_running()?;
    flow.ensure_valid()?;
    state.flows.save(&flow).await?;
    Ok(RpcResponse::success(flow))
}

/// 手动触发请求; ref_type缺省为WORKFLOW
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTriggerRequest {
    pub ref_type: Option<RefType>,
    pub appoint_server_id: Option<String>,
    pub appoint_url: Option<String>,
}

async fn trigger_flow(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
    Json(request): Json<ManualTriggerRequest>,
) -> RpcResult<Execution> {
    state.lifecycle.ensure_running()?;
    let mut trigger = TriggerRequest::manual(id, request.ref_type.unwrap_or(RefType::Workflow));
    trigger.invocation.appoint_server_id = request.appoint_server_id;
    trigger.invocation.appoint_url = request.appoint_url;
    Ok(RpcResponse::success(state.manager.trigger(trigger).await?))
}

async fn submit_schedule(
    State(state): State<BrokerState>,
    Json(schedule): Json<Schedule>,
) -> RpcResult<Schedule> {
    state.lifecycle.ensure_running()?;
    Ok(RpcResponse::success(state.sweeper.submit(schedule).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayRequest {
    pub ref_id: String,
    pub ref_type: RefType,
    pub fire_at: i64,
}

async fn submit_delay(
    State(state): State<BrokerState>,
    Json(request): Json<DelayRequest>,
) -> RpcResult<String> {
    state.lifecycle.ensure_running()?;
    let delay = state
        .sweeper
        .submit_delay(&request.ref_id, request.ref_type, request.fire_at)
        .await?;
    Ok(RpcResponse::success(delay.id))
}

async fn trigger_schedule(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> RpcResult<Execution> {
    state.lifecycle.ensure_running()?;
    Ok(RpcResponse::success(state.sweeper.trigger_now(&id).await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecutionView {
    pub execution: Execution,
    pub tasks: Vec<Task>,
}

async fn get_execution(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> RpcResult<ExecutionView> {
    state.lifecycle.ensure_running()?;
    let execution = state.manager.execution(&id).await?;
    let tasks = state.manager.tasks_of(&id).await?;
    Ok(RpcResponse::success(ExecutionView { execution, tasks }))
}

async fn cancel_execution(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> RpcResult<ExecutionState> {
    state.lifecycle.ensure_running()?;
    Ok(RpcResponse::success(state.manager.cancel(&id).await?))
}

async fn pause_execution(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> RpcResult<ExecutionState> {
    state.lifecycle.ensure_running()?;
    Ok(RpcResponse::success(state.manager.pause(&id).await?))
}

async fn resume_execution(
    State(state): State<BrokerState>,
    Path(id): Path<String>,
) -> RpcResult<ExecutionState> {
    state.lifecycle.ensure_running()?;
    Ok(RpcResponse::success(state.manager.resume(&id).await?))
}
