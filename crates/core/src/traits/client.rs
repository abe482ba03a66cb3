use async_trait::async_trait;

use crate::models::{
    CancelTaskRequest, CancelTaskResponse, DispatchTaskRequest, DispatchTaskResponse,
    HeartbeatRequest, HeartbeatResponse, PingResponse, RegisterRequest, RegisterResponse,
    TaskFeedback,
};
use crate::SchedulerResult;

/// broker调用其他节点(worker或对等broker)的RPC接口
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn dispatch_task(
        &self,
        worker_url: &str,
        request: &DispatchTaskRequest,
    ) -> SchedulerResult<DispatchTaskResponse>;

    async fn cancel_task(
        &self,
        worker_url: &str,
        request: &CancelTaskRequest,
    ) -> SchedulerResult<CancelTaskResponse>;

    async fn ping(&self, url: &str) -> SchedulerResult<PingResponse>;
}

/// worker调用broker的RPC接口
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn register(
        &self,
        broker_url: &str,
        request: &RegisterRequest,
    ) -> SchedulerResult<RegisterResponse>;

    async fn heartbeat(
        &self,
        broker_url: &str,
        request: &HeartbeatRequest,
    ) -> SchedulerResult<HeartbeatResponse>;

    async fn feedback(&self, broker_url: &str, feedback: &TaskFeedback) -> SchedulerResult<()>;
}
