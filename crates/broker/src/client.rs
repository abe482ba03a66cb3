use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use jobflow_core::models::{
    CancelTaskRequest, CancelTaskResponse, DispatchTaskRequest, DispatchTaskResponse,
    PingResponse,
};
use jobflow_core::{NodeClient, RpcResponse, SchedulerError, SchedulerResult};

/// 基于HTTP的节点客户端, 每个请求都带超时
pub struct HttpNodeClient {
    http_client: reqwest::Client,
    timeout: Duration,
}

impl HttpNodeClient {
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
            .map_err(|e| map_transport_error(&url, e))?;
        decode(&url, response).await
    }

    async fn get<Resp: DeserializeOwned>(&self, url: String) -> SchedulerResult<Resp> {
        let response = self
            .http_client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(&url, e))?;
        decode(&url, response).await
    }
}

fn map_transport_error(url: &str, e: reqwest::Error) -> SchedulerError {
    if e.is_timeout() {
        debug!("请求 {} 超时", url);
        SchedulerError::TaskTimeout {
            task_id: url.to_string(),
        }
    } else {
        SchedulerError::Network(format!("请求 {url} 失败: {e}"))
    }
}

async fn decode<Resp: DeserializeOwned>(
    url: &str,
    response: reqwest::Response,
) -> SchedulerResult<Resp> {
    let status = response.status();
    let envelope: RpcResponse<Resp> = response.json().await.map_err(|e| {
        SchedulerError::Network(format!("解析 {url} 的响应失败 (HTTP {status}): {e}"))
    })?;
    envelope.into_result()
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn dispatch_task(
        &self,
        worker_url: &str,
        request: &DispatchTaskRequest,
    ) -> SchedulerResult<DispatchTaskResponse> {
        self.post(format!("{worker_url}/rpc/tasks/dispatch"), request)
            .await
    }

    async fn cancel_task(
        &self,
        worker_url: &str,
        request: &CancelTaskRequest,
    ) -> SchedulerResult<CancelTaskResponse> {
        self.post(format!("{worker_url}/rpc/tasks/cancel"), request).await
    }

    async fn ping(&self, url: &str) -> SchedulerResult<PingResponse> {
        self.get(format!("{url}/rpc/ping")).await
    }
}
