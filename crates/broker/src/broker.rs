use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};

use jobflow_core::models::{Node, NodeRole, WorkerMetric};
use jobflow_core::{
    now_millis, BrokerConfig, NodeClient, SchedulerError, SchedulerResult, ServerLifecycle,
    ServerState,
};
use jobflow_domain::{
    EventPublisher, ExecutionRepository, FlowRepository, IdGenerator, ScheduleDelayRepository,
    ScheduleRepository, TaskRepository,
};
use jobflow_infrastructure::{
    BroadcastEventPublisher, InMemoryExecutionRepository, InMemoryFlowRepository,
    InMemoryScheduleDelayRepository, InMemoryScheduleRepository, InMemoryTaskRepository,
    UuidIdGenerator,
};

use crate::client::HttpNodeClient;
use crate::dispatcher::TaskDispatcher;
use crate::execution_manager::{ExecutionManager, ExecutionManagerConfig};
use crate::failure_detector::FailureDetector;
use crate::registry::NodeRegistry;
use crate::rpc::{create_routes, BrokerState};
use crate::scheduler::ScheduleSweeper;
use crate::strategies::LoadBalancer;

const EVENT_BUS_CAPACITY: usize = 1024;

/// broker使用的存储端口; 集群内的broker必须共享同一份
#[derive(Clone)]
pub struct BrokerStores {
    pub flows: Arc<dyn FlowRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub delays: Arc<dyn ScheduleDelayRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub tasks: Arc<dyn TaskRepository>,
    pub ids: Arc<dyn IdGenerator>,
    pub events: Arc<dyn EventPublisher>,
}

impl BrokerStores {
    /// 进程内存储, 只适用于单broker部署和测试
    pub fn in_memory() -> Self {
        Self {
            flows: Arc::new(InMemoryFlowRepository::new()),
            schedules: Arc::new(InMemoryScheduleRepository::new()),
            delays: Arc::new(InMemoryScheduleDelayRepository::new()),
            executions: Arc::new(InMemoryExecutionRepository::new()),
            tasks: Arc::new(InMemoryTaskRepository::new()),
            ids: Arc::new(UuidIdGenerator::new()),
            events: Arc::new(BroadcastEventPublisher::new(EVENT_BUS_CAPACITY)),
        }
    }
}

/// broker构建器
pub struct BrokerBuilder {
    config: BrokerConfig,
    client: Option<Arc<dyn NodeClient>>,
    stores: Option<BrokerStores>,
    registry: Option<Arc<NodeRegistry>>,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            client: None,
            stores: None,
            registry: None,
        }
    }

    pub fn node_client(mut self, client: Arc<dyn NodeClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// 使用外部存储; 未指定时为进程内存储
    pub fn stores(mut self, stores: BrokerStores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// 与其他broker共享节点注册表
    pub fn registry(mut self, registry: Arc<NodeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> SchedulerResult<Broker> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;

        let client: Arc<dyn NodeClient> = match self.client {
            Some(client) => client,
            None => Arc::new(HttpNodeClient::new(config.dispatch_timeout())),
        };
        let stores = self.stores.unwrap_or_else(BrokerStores::in_memory);
        let registry = match self.registry {
            Some(registry) => registry,
            None => Arc::new(NodeRegistry::new(config.heartbeat_timeout())),
        };
        let node = Node::new(&config.server_id, &config.advertised_url, NodeRole::Broker);

        let dispatcher = Arc::new(TaskDispatcher::new(
            registry.clone(),
            LoadBalancer::new(),
            client.clone(),
            config.dispatch_attempts,
            config.retry_backoff(),
        ));
        let manager = Arc::new(ExecutionManager::new(
            ExecutionManagerConfig::from(&config),
            stores.flows.clone(),
            stores.executions.clone(),
            stores.tasks.clone(),
            stores.schedules.clone(),
            stores.ids.clone(),
            stores.events.clone(),
            dispatcher,
        ));
        let sweeper = Arc::new(ScheduleSweeper::new(
            &config.server_id,
            &config.advertised_url,
            registry.clone(),
            stores.schedules.clone(),
            stores.delays.clone(),
            stores.flows.clone(),
            stores.ids.clone(),
            manager.clone(),
        ));
        let detector = Arc::new(FailureDetector::new(
            node.clone(),
            config.peers.clone(),
            registry.clone(),
            client,
            stores.events.clone(),
            config.liveness_check_interval(),
        ));

        let state = BrokerState {
            node,
            lifecycle: Arc::new(ServerLifecycle::new()),
            registry,
            manager,
            sweeper,
            flows: stores.flows.clone(),
            ids: stores.ids.clone(),
            events: stores.events.clone(),
        };
        Ok(Broker {
            config,
            state,
            detector,
            stores,
        })
    }
}

/// broker节点: 注册中心、调度扫描、派发与执行状态机的组合
pub struct Broker {
    config: BrokerConfig,
    state: BrokerState,
    detector: Arc<FailureDetector>,
    stores: BrokerStores,
}

impl Broker {
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    pub fn new(config: BrokerConfig) -> SchedulerResult<Self> {
        BrokerBuilder::new(config).build()
    }

    /// 使用指定的节点客户端和进程内存储
    pub fn with_client(
        config: BrokerConfig,
        client: Arc<dyn NodeClient>,
    ) -> SchedulerResult<Self> {
        BrokerBuilder::new(config).node_client(client).build()
    }

    pub fn state(&self) -> &BrokerState {
        &self.state
    }

    pub fn lifecycle(&self) -> &Arc<ServerLifecycle> {
        &self.state.lifecycle
    }

    pub fn manager(&self) -> &Arc<ExecutionManager> {
        &self.state.manager
    }

    pub fn sweeper(&self) -> &Arc<ScheduleSweeper> {
        &self.state.sweeper
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.state.registry
    }

    pub fn stores(&self) -> &BrokerStores {
        &self.stores
    }

    pub fn router(&self) -> Router {
        create_routes(self.state.clone())
    }

    /// 把自己登记为存活broker并进入RUNNING
    pub async fn start(&self) -> SchedulerResult<()> {
        let lifecycle = &self.state.lifecycle;
        if !lifecycle.advance(ServerState::Initializing) {
            return Err(SchedulerError::ServerNotReady {
                state: lifecycle.state().to_string(),
            });
        }
        self.state
            .registry
            .online(
                self.state.node.clone(),
                Vec::new(),
                WorkerMetric::default(),
                now_millis(),
            )
            .await;
        lifecycle.advance(ServerState::Running);
        info!(
            "broker {} 已启动: {}",
            self.config.server_id, self.config.advertised_url
        );
        Ok(())
    }

    pub async fn stop(&self) {
        self.state.lifecycle.advance(ServerState::Terminating);
        self.detector.stop().await;
        self.state.registry.offline(&self.state.node.server_id).await;
        self.state.lifecycle.advance(ServerState::Terminated);
        info!("broker {} 已停止", self.config.server_id);
    }

    /// 监听RPC端口并运行后台循环, 直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> SchedulerResult<()> {
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| {
                SchedulerError::Network(format!("绑定地址失败 {}: {}", self.config.bind_address, e))
            })?;
        self.start().await?;
        info!("broker RPC监听于 {}", self.config.bind_address);

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
                    error!("broker RPC服务运行失败: {}", e);
                }
            })
        };

        let sweep_handle = {
            let sweeper = self.state.sweeper.clone();
            let manager = self.state.manager.clone();
            let interval = self.config.sweep_interval();
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                run_sweep_loop(sweeper, manager, interval, shutdown_rx).await;
            })
        };

        let detector_handle = {
            let detector = self.detector.clone();
            tokio::spawn(async move { detector.start().await })
        };

        let _ = shutdown_rx.recv().await;
        info!("broker收到关闭信号");
        self.stop().await;

        let _ = tokio::join!(server_handle, sweep_handle, detector_handle);
        Ok(())
    }
}

async fn run_sweep_loop(
    sweeper: Arc<ScheduleSweeper>,
    manager: Arc<ExecutionManager>,
    interval: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = now_millis();
                if let Err(e) = sweeper.sweep(now).await {
                    error!("调度扫描失败: {}", e);
                }
                if let Err(e) = manager.sweep_tasks(now).await {
                    error!("任务超时扫描失败: {}", e);
                }
            }
            _ = shutdown_rx.recv() => {
                info!("扫描循环收到关闭信号");
                break;
            }
        }
    }
}
