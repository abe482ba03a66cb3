//! 单进程内通过真实HTTP端口运行broker与worker

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use jobflow_broker::{Broker, TriggerRequest};
use jobflow_core::{now_millis, BrokerConfig, SchedulerResult, WorkerConfig};
use jobflow_domain::{Execution, ExecutionState, ExecutorNode, Flow, FlowNode, RefType};
use jobflow_worker::{TaskContext, TaskExecutor, WorkerService};

/// 把params.text转成大写
struct UpperExecutor;

#[async_trait]
impl TaskExecutor for UpperExecutor {
    fn name(&self) -> &str {
        "upper"
    }

    async fn execute(&self, context: &TaskContext) -> SchedulerResult<Value> {
        let text = context.params["text"].as_str().unwrap_or_default();
        Ok(json!(text.to_uppercase()))
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

async fn wait_for<F, Fut>(condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

struct Cluster {
    broker: Arc<Broker>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Cluster {
    async fn start() -> Self {
        let broker_port = free_port();
        let worker_port = free_port();
        let broker_url = format!("http://127.0.0.1:{broker_port}");

        let broker = Arc::new(
            Broker::new(BrokerConfig {
                server_id: "broker-e2e".to_string(),
                bind_address: format!("127.0.0.1:{broker_port}"),
                advertised_url: broker_url.clone(),
                sweep_interval_ms: 100,
                ..BrokerConfig::default()
            })
            .unwrap(),
        );
        let worker = Arc::new(
            WorkerService::builder(WorkerConfig {
                server_id: Some("worker-e2e".to_string()),
                bind_address: format!("127.0.0.1:{worker_port}"),
                advertised_url: format!("http://127.0.0.1:{worker_port}"),
                broker_urls: vec![broker_url],
                heartbeat_interval_seconds: 1,
                register_attempts: 50,
                register_backoff_ms: 100,
                drain_timeout_seconds: 2,
                ..WorkerConfig::default()
            })
            .register_executor(Arc::new(UpperExecutor))
            .build()
            .unwrap(),
        );

        let (shutdown_tx, _) = broadcast::channel(4);
        let mut handles = Vec::new();
        {
            let broker = broker.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                broker.run(shutdown_rx).await.unwrap();
            }));
        }
        {
            let worker = worker.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                worker.run(shutdown_rx).await.unwrap();
            }));
        }

        let cluster = Self {
            broker,
            shutdown_tx,
            handles,
        };
        let registry = cluster.broker.registry().clone();
        let registered = wait_for(move || {
            let registry = registry.clone();
            async move {
                registry
                    .workers(now_millis())
                    .await
                    .iter()
                    .any(|w| w.id() == "worker-e2e" && w.alive)
            }
        })
        .await;
        assert!(registered, "worker未能注册到broker");
        cluster
    }

    async fn run_to_end(&self, flow: Flow) -> Execution {
        let manager = self.broker.manager();
        self.broker.state().flows.save(&flow).await.unwrap();
        let execution = manager
            .trigger(TriggerRequest::manual(&flow.id, RefType::Workflow))
            .await
            .unwrap();
        let finished = {
            let manager = manager.clone();
            let id = execution.id.clone();
            wait_for(move || {
                let manager = manager.clone();
                let id = id.clone();
                async move {
                    manager
                        .execution(&id)
                        .await
                        .map(|e| e.state.is_terminal())
                        .unwrap_or(false)
                }
            })
            .await
        };
        assert!(finished, "执行 {} 未在限定时间内结束", execution.id);
        manager.execution(&execution.id).await.unwrap()
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            handle.await.unwrap();
        }
    }
}

fn upper(id: &str, text: &str) -> ExecutorNode {
    let mut node = ExecutorNode::new(id, "upper");
    node.params = json!({ "text": text });
    node
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_job_runs_on_remote_worker() {
    let cluster = Cluster::start().await;

    let execution = cluster
        .run_to_end(Flow::single_job("job-e2e", upper("shout", "hello")))
        .await;
    assert_eq!(execution.state, ExecutionState::Success);

    let tasks = cluster.broker.manager().tasks_of(&execution.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].result, Some(json!("HELLO")));
    assert_eq!(tasks[0].worker_id.as_deref(), Some("worker-e2e"));

    cluster.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workflow_runs_nodes_in_dependency_order() {
    let cluster = Cluster::start().await;

    let flow = Flow::new("chain-e2e", "chain")
        .with_node(FlowNode::trigger("start"))
        .with_node(FlowNode::Executor(upper("a", "first")))
        .with_node(FlowNode::Executor(upper("b", "second")))
        .with_edge("start", "a")
        .with_edge("a", "b");
    let execution = cluster.run_to_end(flow).await;
    assert_eq!(execution.state, ExecutionState::Success);

    let tasks = cluster.broker.manager().tasks_of(&execution.id).await.unwrap();
    let a = tasks.iter().find(|t| t.node_id == "a").unwrap();
    let b = tasks.iter().find(|t| t.node_id == "b").unwrap();
    assert_eq!(a.result, Some(json!("FIRST")));
    assert_eq!(b.result, Some(json!("SECOND")));

    cluster.stop().await;
}
