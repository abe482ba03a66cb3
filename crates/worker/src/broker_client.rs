use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use jobflow_core::models::{
    HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse, TaskFeedback,
};
use jobflow_core::{BrokerClient, RpcResponse, SchedulerError, SchedulerResult};

/// worker到broker的HTTP客户端
pub struct HttpBrokerClient {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpBrokerClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            timeout,
        }
    }

    async fn post<Req, Resp>(&self, url: String, body: &Req) -> SchedulerResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .http_client
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                debug!("请求 {} 失败: {}", url, e);
                SchedulerError::Network(format!("请求 {url} 失败: {e}"))
            })?;
        let status = response.status();
        let envelope: RpcResponse<Resp> = response.json().await.map_err(|e| {
            SchedulerError::Network(format!("解析 {url} 的响应失败 (HTTP {status}): {e}"))
        })?;
        envelope.into_result()
    }
}

#[async_trait]
impl BrokerClient for HttpBrokerClient {
    async fn register(
        &self,
        broker_url: &str,
        request: &RegisterRequest,
    ) -> SchedulerResult<RegisterResponse> {
        self.post(format!("{broker_url}/rpc/workers/register"), request)
            .await
    }

    async fn heartbeat(
        &self,
        broker_url: &str,
        request: &HeartbeatRequest,
    ) -> SchedulerResult<HeartbeatResponse> {
        self.post(format!("{broker_url}/rpc/workers/heartbeat"), request)
            .await
    }

    async fn feedback(&self, broker_url: &str, feedback: &TaskFeedback) -> SchedulerResult<()> {
        let _: bool = self
            .post(format!("{broker_url}/rpc/tasks/feedback"), feedback)
            .await?;
        Ok(())
    }
}
