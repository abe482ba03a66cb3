mod common;

use std::sync::Arc;

use common::{started_broker, test_config, RecordingClient};
use jobflow_broker::{Broker, BrokerStores};
use jobflow_core::models::{Node, NodeRole, WorkerMetric};
use jobflow_core::{now_millis, BrokerConfig, SchedulerError};
use jobflow_domain::{
    ExecutionRepository, ExecutorNode, Flow, FlowRepository, RefType, Schedule, ScheduleOption,
    ScheduleRepository,
};

fn fixed_rate(start_at: i64, interval_ms: i64) -> Schedule {
    Schedule::new(
        "",
        "job-1",
        RefType::Job,
        ScheduleOption::FixedRate {
            start_at,
            interval_ms: Some(interval_ms),
        },
    )
}

async fn broker_with_job() -> Broker {
    let (broker, _client) = started_broker().await;
    broker
        .state()
        .flows
        .save(&Flow::single_job("job-1", ExecutorNode::new("echo", "shell")))
        .await
        .unwrap();
    broker
}

#[tokio::test]
async fn test_fixed_rate_fires_once_per_trigger_point() {
    let broker = broker_with_job().await;
    let now = now_millis();
    let schedule = broker
        .sweeper()
        .submit(fixed_rate(now - 1_000, 60_000))
        .await
        .unwrap();
    assert!(!schedule.id.is_empty());

    let report = broker.sweeper().sweep(now).await.unwrap();
    assert_eq!(report.fired, 1);
    let report = broker.sweeper().sweep(now + 1_000).await.unwrap();
    assert_eq!(report.fired, 0);
    let report = broker.sweeper().sweep(now + 61_000).await.unwrap();
    assert_eq!(report.fired, 1);
}

#[tokio::test]
async fn test_schedule_is_not_fired_without_alive_broker() {
    let client = Arc::new(RecordingClient::default());
    let broker = Broker::with_client(test_config(), client).unwrap();
    broker
        .state()
        .flows
        .save(&Flow::single_job("job-1", ExecutorNode::new("echo", "shell")))
        .await
        .unwrap();
    let now = now_millis();
    broker
        .sweeper()
        .submit(fixed_rate(now - 1_000, 60_000))
        .await
        .unwrap();

    let report = broker.sweeper().sweep(now).await.unwrap();
    assert_eq!(report.fired, 0);
}

#[tokio::test]
async fn test_delay_fires_exactly_once() {
    let broker = broker_with_job().await;
    let now = now_millis();
    broker
        .sweeper()
        .submit_delay("job-1", RefType::Job, now + 5_000)
        .await
        .unwrap();

    assert_eq!(broker.sweeper().sweep(now).await.unwrap().delays_fired, 0);
    assert_eq!(
        broker.sweeper().sweep(now + 5_000).await.unwrap().delays_fired,
        1
    );
    assert_eq!(
        broker.sweeper().sweep(now + 6_000).await.unwrap().delays_fired,
        0
    );
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let broker = broker_with_job().await;
    let cron = Schedule::new(
        "",
        "job-1",
        RefType::Job,
        ScheduleOption::Cron {
            expression: "not a cron".to_string(),
        },
    );
    assert!(matches!(
        broker.sweeper().submit(cron).await,
        Err(SchedulerError::InvalidCron { .. })
    ));

    let mut unknown = fixed_rate(0, 1_000);
    unknown.ref_id = "missing".to_string();
    assert!(matches!(
        broker.sweeper().submit(unknown).await,
        Err(SchedulerError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_manual_trigger_records_schedule() {
    let broker = broker_with_job().await;
    let schedule = broker
        .sweeper()
        .submit(fixed_rate(now_millis() + 3_600_000, 60_000))
        .await
        .unwrap();

    let execution = broker.sweeper().trigger_now(&schedule.id).await.unwrap();
    assert_eq!(execution.schedule_id.as_deref(), Some(schedule.id.as_str()));
    assert_eq!(execution.ref_id, "job-1");
}

async fn peer_broker(server_id: &str, url: &str, stores: &BrokerStores) -> Broker {
    let config = BrokerConfig {
        server_id: server_id.to_string(),
        advertised_url: url.to_string(),
        ..BrokerConfig::default()
    };
    let broker = Broker::builder(config)
        .node_client(Arc::new(RecordingClient::default()))
        .stores(stores.clone())
        .build()
        .unwrap();
    broker.start().await.unwrap();
    broker
}

async fn see_each_other(brokers: &[&Broker]) {
    for broker in brokers {
        for peer in brokers {
            broker
                .registry()
                .online(
                    broker_node(peer),
                    Vec::new(),
                    WorkerMetric::default(),
                    now_millis(),
                )
                .await;
        }
    }
}

fn broker_node(broker: &Broker) -> Node {
    let node = &broker.state().node;
    Node::new(&node.server_id, &node.url, NodeRole::Broker)
}

/// 两个broker共享存储, 每个调度在同一触发点恰好被它的所有者触发一次
#[tokio::test]
async fn test_two_brokers_fire_each_schedule_once() {
    let stores = BrokerStores::in_memory();
    stores
        .flows
        .save(&Flow::single_job("job-1", ExecutorNode::new("echo", "shell")))
        .await
        .unwrap();
    let b1 = peer_broker("b1", "http://b1:7070", &stores).await;
    let b2 = peer_broker("b2", "http://b2:7070", &stores).await;
    see_each_other(&[&b1, &b2]).await;

    let now = now_millis();
    for i in 0..10 {
        b1.sweeper()
            .submit(fixed_rate(now - 1_000 - i, 60_000))
            .await
            .unwrap();
    }

    let mut fired = 0;
    for _ in 0..3 {
        fired += b1.sweeper().sweep(now).await.unwrap().fired;
        fired += b2.sweeper().sweep(now).await.unwrap().fired;
    }
    assert_eq!(fired, 10);
    assert_eq!(stores.executions.find_active().await.unwrap().len(), 10);

    let owners: Vec<Option<String>> = stores
        .schedules
        .find_enabled()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.broker_url)
        .collect();
    assert!(owners.iter().all(|owner| matches!(
        owner.as_deref(),
        Some("http://b1:7070") | Some("http://b2:7070")
    )));
}
