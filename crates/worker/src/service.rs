use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use jobflow_core::models::{Node, NodeRole};
use jobflow_core::{
    BrokerClient, SchedulerError, SchedulerResult, ServerLifecycle, ServerState, WorkerConfig,
};

use crate::broker_client::HttpBrokerClient;
use crate::executors::{ExecutorRegistry, TaskExecutor};
use crate::heartbeat::{BrokerConnector, WorkerIdentity};
use crate::rpc::{create_routes, WorkerState};
use crate::runtime::{ConcurrencyLimiter, TaskQueue, WorkerRuntime};

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    config: WorkerConfig,
    executors: ExecutorRegistry,
    client: Option<Arc<dyn BrokerClient>>,
}

impl WorkerServiceBuilder {
    /// 默认注册内置的shell和http执行器
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            executors: ExecutorRegistry::with_builtin(),
            client: None,
        }
    }

    /// 注册任务执行器
    pub fn register_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        info!("注册任务执行器: {}", executor.name());
        self.executors.register(executor);
        self
    }

    pub fn broker_client(mut self, client: Arc<dyn BrokerClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> SchedulerResult<WorkerService> {
        let mut config = self.config;
        config
            .validate()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        if config.server_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            config.server_id = Some(default_server_id());
        }
        let server_id = config.server_id.clone().unwrap_or_default();

        let client: Arc<dyn BrokerClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpBrokerClient::new(config.request_timeout())),
        };
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let executors = Arc::new(self.executors);
        let connector = Arc::new(BrokerConnector::new(
            config.clone(),
            executors.names(),
            client,
            queue.clone(),
        ));
        let runtime = Arc::new(WorkerRuntime::new(
            queue,
            ConcurrencyLimiter::new(config.concurrency),
            executors,
            connector.clone(),
        ));

        let mut node = Node::new(server_id, &config.advertised_url, NodeRole::Worker);
        node.tags = config.tags.clone();
        let state = WorkerState {
            node,
            lifecycle: Arc::new(ServerLifecycle::new()),
            runtime,
        };
        Ok(WorkerService {
            config,
            state,
            connector,
        })
    }
}

/// worker节点: 执行运行时、RPC端点与broker连接的组合
pub struct WorkerService {
    config: WorkerConfig,
    state: WorkerState,
    connector: Arc<BrokerConnector>,
}

impl WorkerService {
    pub fn builder(config: WorkerConfig) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(config)
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn lifecycle(&self) -> &Arc<ServerLifecycle> {
        &self.state.lifecycle
    }

    pub fn runtime(&self) -> &Arc<WorkerRuntime> {
        &self.state.runtime
    }

    pub fn connector(&self) -> &Arc<BrokerConnector> {
        &self.connector
    }

    pub fn router(&self) -> Router {
        create_routes(self.state.clone())
    }

    /// 进入RUNNING后向broker注册; 注册失败时服务直接终止
    pub async fn start(&self) -> SchedulerResult<WorkerIdentity> {
        let lifecycle = &self.state.lifecycle;
        if !lifecycle.advance(ServerState::Initializing) {
            return Err(SchedulerError::ServerNotReady {
                state: lifecycle.state().to_string(),
            });
        }
        lifecycle.advance(ServerState::Running);

        match self.connector.register().await {
            Ok(identity) => {
                info!(
                    "worker {} 已启动: {}",
                    identity.worker_id, self.config.advertised_url
                );
                Ok(identity)
            }
            Err(e) => {
                lifecycle.advance(ServerState::Terminated);
                Err(e)
            }
        }
    }

    /// 拒绝新任务并等待队列排空
    pub async fn stop(&self) {
        self.state.lifecycle.advance(ServerState::Terminating);
        if !self
            .state
            .runtime
            .drain(self.config.drain_timeout())
            .await
        {
            warn!("worker排空超时, 剩余任务已取消");
        }
        self.state.lifecycle.advance(ServerState::Terminated);
        info!("worker {} 已停止", self.state.node.server_id);
    }

    /// 监听RPC端口, 注册并运行执行循环与心跳, 直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                SchedulerError::Network(format!("绑定地址失败 {}: {}", self.config.bind_address, e))
            })?;
        info!("worker RPC监听于 {}", self.config.bind_address);

        let server_handle = {
            let app = self.router();
            let mut shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                let shutdown = async move {
                    let _ = shutdown_rx.recv().await;
                };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown)
                    .await
                {
                    error!("worker RPC服务运行失败: {}", e);
                }
            })
        };

        // 执行循环在排空结束后才停止
        let (runtime_stop_tx, runtime_stop_rx) = broadcast::channel(1);
        let runtime_handle = {
            let runtime = self.state.runtime.clone();
            tokio::spawn(async move { runtime.run(runtime_stop_rx).await })
        };

        if let Err(e) = self.start().await {
            let _ = runtime_stop_tx.send(());
            server_handle.abort();
            let _ = runtime_handle.await;
            return Err(e);
        }

        let heartbeat_handle = {
            let connector = self.connector.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move { connector.run_heartbeat(shutdown_rx).await })
        };

        let _ = shutdown_rx.recv().await;
        info!("worker收到关闭信号");
        self.stop().await;
        let _ = runtime_stop_tx.send(());

        let _ = tokio::join!(server_handle, runtime_handle, heartbeat_handle);
        Ok(())
    }
}

/// 未配置server_id时使用主机名
fn default_server_id() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "worker".to_string())
}
