use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Node, NodeRole, WorkerMetric};

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// 为空时由broker分配
    pub server_id: Option<String>,
    pub url: String,
    pub executors: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, Vec<String>>,
    pub metric: WorkerMetric,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub worker_id: String,
    pub broker_url: String,
    pub brokers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub worker_id: String,
    pub url: String,
    pub metric: WorkerMetric,
}

/// 心跳响应携带当前存活的broker拓扑
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub brokers: Vec<String>,
}

/// 任务在map-reduce中的角色
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    #[default]
    Normal,
    Split,
    Map,
    Reduce,
}

/// broker -> worker 的任务派发
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchTaskRequest {
    pub task_id: String,
    pub execution_id: String,
    pub job_id: String,
    pub executor: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub params: serde_json::Value,
    /// MAP为分片数据, REDUCE为所有分片结果
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    pub broker_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    QueueFull,
    Draining,
    Disabled,
    UnsupportedExecutor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchTaskResponse {
    pub accepted: bool,
    pub reason: Option<RejectReason>,
}

impl DispatchTaskResponse {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Self {
            accepted: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackStatus {
    Executing,
    Succeeded,
    Failed,
    Cancelled,
}

impl FeedbackStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Executing)
    }
}

/// worker -> broker 的状态反馈
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFeedback {
    pub task_id: String,
    pub execution_id: String,
    pub worker_id: String,
    pub status: FeedbackStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskFeedback {
    pub fn executing(request: &DispatchTaskRequest, worker_id: &str) -> Self {
        Self::new(request, worker_id, FeedbackStatus::Executing)
    }

    pub fn succeeded(
        request: &DispatchTaskRequest,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Self {
        Self {
            result: Some(result),
            ..Self::new(request, worker_id, FeedbackStatus::Succeeded)
        }
    }

    pub fn failed(request: &DispatchTaskRequest, worker_id: &str, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::new(request, worker_id, FeedbackStatus::Failed)
        }
    }

    pub fn cancelled(request: &DispatchTaskRequest, worker_id: &str) -> Self {
        Self::new(request, worker_id, FeedbackStatus::Cancelled)
    }

    fn new(request: &DispatchTaskRequest, worker_id: &str, status: FeedbackStatus) -> Self {
        Self {
            task_id: request.task_id.clone(),
            execution_id: request.execution_id.clone(),
            worker_id: worker_id.to_string(),
            status,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskRequest {
    pub task_id: String,
    pub execution_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelTaskResponse {
    /// 任务仍在队列或运行中并已发出取消信号
    pub signalled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub server_id: String,
    pub url: String,
    pub role: NodeRole,
    pub state: String,
}

impl PingResponse {
    pub fn node(&self) -> Node {
        Node::new(self.server_id.clone(), self.url.clone(), self.role)
    }
}
