mod common;

use std::sync::Arc;

use serde_json::json;

use common::{request, worker_config, MockBrokerClient};
use jobflow_core::models::FeedbackStatus;
use jobflow_core::SchedulerError;
use jobflow_worker::{BrokerConnector, FeedbackReporter, TaskOutcome, TaskQueue};

fn connector(
    broker_urls: &[&str],
    client: Arc<MockBrokerClient>,
    queue: Arc<TaskQueue>,
) -> BrokerConnector {
    BrokerConnector::new(
        worker_config(broker_urls),
        vec!["echo".to_string(), "shell".to_string()],
        client,
        queue,
    )
}

#[tokio::test]
async fn test_register_skips_unreachable_broker() {
    let client = Arc::new(MockBrokerClient::default());
    client.unreachable("http://broker-a");
    client.set_topology(&["http://broker-a", "http://broker-b"]);
    let connector = connector(
        &["http://broker-a", "http://broker-b"],
        client.clone(),
        Arc::new(TaskQueue::new(5)),
    );

    let identity = connector.register().await.unwrap();
    assert_eq!(identity.worker_id, "worker-test");
    assert_eq!(identity.broker_url, "http://broker-b");

    let registrations = client.registrations();
    assert_eq!(registrations.len(), 2);
    let (_, request) = &registrations[1];
    assert_eq!(request.url, "http://worker-test:7171");
    assert_eq!(request.executors, vec!["echo", "shell"]);
}

#[tokio::test]
async fn test_register_gives_up_after_configured_attempts() {
    let client = Arc::new(MockBrokerClient::default());
    client.unreachable("http://broker-a");
    let mut config = worker_config(&["http://broker-a"]);
    config.register_attempts = 3;
    let connector = BrokerConnector::new(
        config,
        vec!["echo".to_string()],
        client.clone(),
        Arc::new(TaskQueue::new(5)),
    );

    match connector.register().await {
        Err(SchedulerError::RegisterFailure(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(client.registrations().len(), 3);
    assert!(connector.identity().await.is_none());
}

#[tokio::test]
async fn test_metric_reports_available_queue_slots() {
    let client = Arc::new(MockBrokerClient::default());
    let queue = Arc::new(TaskQueue::new(5));
    queue.try_push(request("t1", "echo", json!(1), 0)).unwrap();
    queue.try_push(request("t2", "echo", json!(2), 0)).unwrap();
    let connector = connector(&["http://broker-a"], client.clone(), queue.clone());

    connector.register().await.unwrap();
    let (_, registered) = client.registrations().pop().unwrap();
    assert_eq!(registered.metric.available_queue_num, 3);
    assert!(registered.metric.cpu_processors >= 1);

    queue.close();
    connector.heartbeat_once().await.unwrap();
    connector.register().await.unwrap();
    let (_, registered) = client.registrations().pop().unwrap();
    assert_eq!(registered.metric.available_queue_num, 0);
}

#[tokio::test]
async fn test_heartbeat_learns_broker_topology() {
    let client = Arc::new(MockBrokerClient::default());
    let connector = connector(
        &["http://broker-a"],
        client.clone(),
        Arc::new(TaskQueue::new(5)),
    );
    connector.register().await.unwrap();
    assert_eq!(connector.brokers().await, vec!["http://broker-a"]);

    client.set_topology(&["http://broker-a", "http://broker-c"]);
    connector.heartbeat_once().await.unwrap();
    assert_eq!(
        connector.brokers().await,
        vec!["http://broker-a", "http://broker-c"]
    );
}

#[tokio::test]
async fn test_unknown_worker_reregisters_with_same_id() {
    let client = Arc::new(MockBrokerClient::default());
    let connector = connector(
        &["http://broker-a"],
        client.clone(),
        Arc::new(TaskQueue::new(5)),
    );
    connector.register().await.unwrap();

    client.forget_workers("http://broker-a");
    connector.heartbeat_once().await.unwrap();

    let registrations = client.registrations();
    assert_eq!(registrations.len(), 2);
    assert_eq!(registrations[1].1.server_id.as_deref(), Some("worker-test"));
    assert_eq!(
        connector.identity().await.unwrap().broker_url,
        "http://broker-a"
    );
}

#[tokio::test]
async fn test_heartbeat_fails_over_to_another_broker() {
    let client = Arc::new(MockBrokerClient::default());
    client.set_topology(&["http://broker-a", "http://broker-b"]);
    let connector = connector(
        &["http://broker-a", "http://broker-b"],
        client.clone(),
        Arc::new(TaskQueue::new(5)),
    );
    let identity = connector.register().await.unwrap();
    assert_eq!(identity.broker_url, "http://broker-a");

    client.unreachable("http://broker-a");
    connector.heartbeat_once().await.unwrap();
    assert_eq!(
        connector.identity().await.unwrap().broker_url,
        "http://broker-b"
    );

    // 所有broker都不可达时心跳返回错误, 保留原身份
    client.unreachable("http://broker-b");
    assert!(connector.heartbeat_once().await.is_err());
    assert_eq!(
        connector.identity().await.unwrap().broker_url,
        "http://broker-b"
    );
}

#[tokio::test]
async fn test_feedback_prefers_dispatching_broker() {
    let client = Arc::new(MockBrokerClient::default());
    client.set_topology(&["http://broker-a", "http://broker-b"]);
    let connector = connector(
        &["http://broker-a", "http://broker-b"],
        client.clone(),
        Arc::new(TaskQueue::new(5)),
    );
    connector.register().await.unwrap();

    let dispatched = request("t1", "echo", json!(1), 0);
    connector
        .report(&dispatched, TaskOutcome::Succeeded(json!(1)))
        .await;
    let feedbacks = client.feedbacks();
    assert_eq!(feedbacks.len(), 1);
    assert_eq!(feedbacks[0].0, "http://broker-a");
    assert_eq!(feedbacks[0].1.status, FeedbackStatus::Succeeded);
    assert_eq!(feedbacks[0].1.worker_id, "worker-test");
    assert_eq!(feedbacks[0].1.result, Some(json!(1)));

    client.unreachable("http://broker-a");
    connector
        .report(&dispatched, TaskOutcome::Failed("boom".to_string()))
        .await;
    let feedbacks = client.feedbacks();
    assert_eq!(feedbacks.len(), 2);
    assert_eq!(feedbacks[1].0, "http://broker-b");
    assert_eq!(feedbacks[1].1.error.as_deref(), Some("boom"));
}
