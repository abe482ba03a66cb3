#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use jobflow_broker::Broker;
use jobflow_core::models::{
    CancelTaskRequest, CancelTaskResponse, DispatchTaskRequest, DispatchTaskResponse, Node,
    NodeRole, PingResponse, RejectReason, WorkerMetric,
};
use jobflow_core::{now_millis, BrokerConfig, NodeClient, SchedulerError, SchedulerResult};

/// 记录所有派发与取消请求的节点客户端
#[derive(Default)]
pub struct RecordingClient {
    pub dispatched: Mutex<Vec<(String, DispatchTaskRequest)>>,
    pub cancelled: Mutex<Vec<(String, CancelTaskRequest)>>,
    pub rejecting: Mutex<Vec<String>>,
}

impl RecordingClient {
    pub fn dispatched(&self) -> Vec<(String, DispatchTaskRequest)> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> DispatchTaskRequest {
        self.dispatched.lock().unwrap().last().cloned().unwrap().1
    }

    pub fn cancelled(&self) -> Vec<(String, CancelTaskRequest)> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn reject_from(&self, worker_url: &str) {
        self.rejecting.lock().unwrap().push(worker_url.to_string());
    }
}

#[async_trait]
impl NodeClient for RecordingClient {
    async fn dispatch_task(
        &self,
        worker_url: &str,
        request: &DispatchTaskRequest,
    ) -> SchedulerResult<DispatchTaskResponse> {
        if self.rejecting.lock().unwrap().iter().any(|url| url == worker_url) {
            return Ok(DispatchTaskResponse::rejected(RejectReason::QueueFull));
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((worker_url.to_string(), request.clone()));
        Ok(DispatchTaskResponse::accepted())
    }

    async fn cancel_task(
        &self,
        worker_url: &str,
        request: &CancelTaskRequest,
    ) -> SchedulerResult<CancelTaskResponse> {
        self.cancelled
            .lock()
            .unwrap()
            .push((worker_url.to_string(), request.clone()));
        Ok(CancelTaskResponse { signalled: true })
    }

    async fn ping(&self, url: &str) -> SchedulerResult<PingResponse> {
        Err(SchedulerError::Network(format!("无法连接 {url}")))
    }
}

pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        server_id: "broker-test".to_string(),
        advertised_url: "http://broker-test:7070".to_string(),
        ..BrokerConfig::default()
    }
}

pub async fn started_broker() -> (Broker, Arc<RecordingClient>) {
    let client = Arc::new(RecordingClient::default());
    let broker = Broker::with_client(test_config(), client.clone()).unwrap();
    broker.start().await.unwrap();
    (broker, client)
}

pub fn metric(available_queue_num: u32) -> WorkerMetric {
    WorkerMetric {
        cpu_processors: 4,
        cpu_load: 0.1,
        free_memory: 8 * 1024 * 1024 * 1024,
        available_queue_num,
        last_heartbeat_at: now_millis(),
    }
}

pub async fn add_worker(broker: &Broker, id: &str, executors: &[&str]) {
    broker
        .registry()
        .online(
            Node::new(id, format!("http://{id}"), NodeRole::Worker),
            executors.iter().map(|e| e.to_string()).collect(),
            metric(10),
            now_millis(),
        )
        .await;
}
