#[cfg(test)]
mod strategies_tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use crate::strategies::*;
    use jobflow_core::models::*;

    fn create_test_worker(id: &str, executors: Vec<&str>, available_queue_num: u32) -> Worker {
        Worker {
            node: Node::new(id, format!("http://{id}:7171"), NodeRole::Worker),
            executors: executors.iter().map(|s| s.to_string()).collect(),
            metric: WorkerMetric {
                cpu_processors: 4,
                cpu_load: 0.5,
                free_memory: 4096 * 1024 * 1024,
                available_queue_num,
                last_heartbeat_at: 0,
            },
            enabled: true,
            alive: true,
        }
    }

    fn select(
        balancer: &LoadBalancer,
        workers: &[Worker],
        option: &DispatchOption,
    ) -> Option<String> {
        balancer
            .select(workers, "shell", option, &InvocationParams::default())
            .map(|w| w.node.server_id)
    }

    #[test]
    fn test_round_robin_cycles_candidates() {
        let balancer = LoadBalancer::new();
        let workers = vec![
            create_test_worker("worker1", vec!["shell"], 5),
            create_test_worker("worker2", vec!["shell"], 5),
            create_test_worker("worker3", vec!["shell"], 5),
        ];
        let option = DispatchOption::with_strategy(LoadBalanceType::RoundRobin);

        let picks: Vec<String> = (0..3)
            .map(|_| select(&balancer, &workers, &option).unwrap())
            .collect();
        let distinct: HashSet<&String> = picks.iter().collect();
        assert_eq!(distinct.len(), 3);
        assert_eq!(select(&balancer, &workers, &option).unwrap(), picks[0]);
    }

    #[test]
    fn test_random_only_picks_candidates() {
        let balancer = LoadBalancer::new();
        let workers = vec![
            create_test_worker("worker1", vec!["shell"], 5),
            create_test_worker("worker2", vec!["http"], 5),
        ];
        let option = DispatchOption::with_strategy(LoadBalanceType::Random);
        for _ in 0..20 {
            assert_eq!(select(&balancer, &workers, &option).unwrap(), "worker1");
        }
    }

    #[test]
    fn test_resource_aware_prefers_queue_headroom() {
        let balancer = LoadBalancer::new();
        let workers = vec![
            create_test_worker("busy", vec!["shell"], 1),
            create_test_worker("idle", vec!["shell"], 9),
        ];
        let option = DispatchOption::with_strategy(LoadBalanceType::ResourceAware);
        assert_eq!(select(&balancer, &workers, &option).unwrap(), "idle");
    }

    #[test]
    fn test_full_queue_excluded() {
        let balancer = LoadBalancer::new();
        let workers = vec![create_test_worker("full", vec!["shell"], 0)];
        for strategy in [
            LoadBalanceType::Random,
            LoadBalanceType::RoundRobin,
            LoadBalanceType::ResourceAware,
        ] {
            let option = DispatchOption::with_strategy(strategy);
            assert!(select(&balancer, &workers, &option).is_none());
        }
    }

    #[test]
    fn test_ram_requirement_filters_workers() {
        let balancer = LoadBalancer::new();
        let mut small = create_test_worker("small", vec!["shell"], 5);
        small.metric.free_memory = 512 * 1024 * 1024;
        let large = create_test_worker("large", vec!["shell"], 5);
        let option = DispatchOption {
            ram_requirement_mb: 1024,
            ..DispatchOption::with_strategy(LoadBalanceType::RoundRobin)
        };
        for _ in 0..4 {
            assert_eq!(
                select(&balancer, &[small.clone(), large.clone()], &option).unwrap(),
                "large"
            );
        }

        // <=0 表示不限制
        let unconstrained = DispatchOption {
            ram_requirement_mb: 0,
            ..DispatchOption::with_strategy(LoadBalanceType::ResourceAware)
        };
        assert!(select(&balancer, &[small], &unconstrained).is_some());
    }

    #[test]
    fn test_cpu_requirement_uses_headroom() {
        let balancer = LoadBalancer::new();
        // 4核, 负载0.5 -> 2核余量
        let worker = create_test_worker("w", vec!["shell"], 5);
        let needs_two = DispatchOption {
            cpu_requirement: 2.0,
            ..Default::default()
        };
        let needs_three = DispatchOption {
            cpu_requirement: 3.0,
            ..Default::default()
        };
        assert!(select(&balancer, &[worker.clone()], &needs_two).is_some());
        assert!(select(&balancer, &[worker], &needs_three).is_none());
    }

    #[test]
    fn test_tag_filters_must_all_match() {
        let balancer = LoadBalancer::new();
        let mut gpu = create_test_worker("gpu", vec!["shell"], 5);
        gpu.node.tags.insert("zone".into(), vec!["east".into()]);
        gpu.node.tags.insert("accel".into(), vec!["a100".into()]);
        let mut plain = create_test_worker("plain", vec!["shell"], 5);
        plain.node.tags.insert("zone".into(), vec!["east".into()]);

        let option = DispatchOption {
            tag_filters: vec![
                TagFilter::any("zone", &["east"]),
                TagFilter::any("accel", &["a100", "h100"]),
            ],
            ..Default::default()
        };
        for _ in 0..3 {
            assert_eq!(
                select(&balancer, &[plain.clone(), gpu.clone()], &option).unwrap(),
                "gpu"
            );
        }
    }

    #[test]
    fn test_disabled_and_dead_workers_excluded() {
        let balancer = LoadBalancer::new();
        let mut disabled = create_test_worker("disabled", vec!["shell"], 5);
        disabled.enabled = false;
        let mut dead = create_test_worker("dead", vec!["shell"], 5);
        dead.alive = false;
        assert!(select(&balancer, &[disabled, dead], &DispatchOption::default()).is_none());
    }

    #[test]
    fn test_appoint_exact_or_empty() {
        let balancer = LoadBalancer::new();
        let workers = vec![
            create_test_worker("worker1", vec!["shell"], 5),
            create_test_worker("worker2", vec!["shell"], 5),
        ];
        let option = DispatchOption::with_strategy(LoadBalanceType::Appoint);

        let params = InvocationParams::appoint("worker2");
        let pinned = balancer.select(&workers, "shell", &option, &params);
        assert_eq!(pinned.unwrap().node.server_id, "worker2");

        let by_url = InvocationParams {
            appoint_server_id: None,
            appoint_url: Some("http://worker1:7171".to_string()),
        };
        assert_eq!(
            balancer.select(&workers, "shell", &option, &by_url).unwrap().node.server_id,
            "worker1"
        );

        // 指定节点不存在时不回退到其他节点
        let params = InvocationParams::appoint("worker9");
        let missing = balancer.select(&workers, "shell", &option, &params);
        assert!(missing.is_none());

        // 没有指定节点的APPOINT策略同样为空
        assert!(balancer
            .select(&workers, "shell", &option, &InvocationParams::default())
            .is_none());
    }

    #[test]
    fn test_custom_strategy_registration() {
        let mut balancer = LoadBalancer::new();
        balancer.register(
            LoadBalanceType::Random,
            Arc::new(|candidates: &[&Worker]| candidates.len() - 1),
        );
        let workers = vec![
            create_test_worker("worker1", vec!["shell"], 5),
            create_test_worker("worker2", vec!["shell"], 5),
        ];
        let option = DispatchOption::with_strategy(LoadBalanceType::Random);
        assert_eq!(select(&balancer, &workers, &option).unwrap(), "worker2");
    }
}
