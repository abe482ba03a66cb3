//! 负载均衡
//!
//! 候选过滤流水线: 启用且存活 -> 指定节点 -> 执行器/标签/资源过滤 -> 策略选择。
//! 策略是以 [`LoadBalanceType`] 为键的函数注册表。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, warn};

use jobflow_core::models::{DispatchOption, InvocationParams, LoadBalanceType, Worker};

/// 从非空候选中返回被选中的下标
pub type StrategyFn = Arc<dyn Fn(&[&Worker]) -> usize + Send + Sync>;

pub fn random_strategy() -> StrategyFn {
    Arc::new(|candidates: &[&Worker]| rand::rng().random_range(0..candidates.len()))
}

pub fn round_robin_strategy() -> StrategyFn {
    let counter = Arc::new(AtomicUsize::new(0));
    Arc::new(move |candidates: &[&Worker]| {
        counter.fetch_add(1, Ordering::Relaxed) % candidates.len()
    })
}

/// 优先队列余量, 其次CPU余量, 最后空闲内存
pub fn resource_aware_strategy() -> StrategyFn {
    Arc::new(|candidates: &[&Worker]| {
        candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.metric
                    .available_queue_num
                    .cmp(&b.metric.available_queue_num)
                    .then(
                        a.metric
                            .cpu_headroom()
                            .partial_cmp(&b.metric.cpu_headroom())
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.metric.free_memory.cmp(&b.metric.free_memory))
            })
            .map(|(index, _)| index)
            .unwrap_or(0)
    })
}

/// 指定节点在流水线中已经唯一确定, 这里只取第一个
pub fn appoint_strategy() -> StrategyFn {
    Arc::new(|_: &[&Worker]| 0)
}

pub struct LoadBalancer {
    strategies: HashMap<LoadBalanceType, StrategyFn>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        let mut balancer = Self {
            strategies: HashMap::new(),
        };
        balancer.register(LoadBalanceType::Random, random_strategy());
        balancer.register(LoadBalanceType::RoundRobin, round_robin_strategy());
        balancer.register(LoadBalanceType::ResourceAware, resource_aware_strategy());
        balancer.register(LoadBalanceType::Appoint, appoint_strategy());
        balancer
    }

    pub fn register(&mut self, load_balance_type: LoadBalanceType, strategy: StrategyFn) {
        self.strategies.insert(load_balance_type, strategy);
    }

    /// 选出一个worker; 返回None表示暂时无法派发, 由调用方稍后重试
    pub fn select(
        &self,
        candidates: &[Worker],
        executor: &str,
        option: &DispatchOption,
        params: &InvocationParams,
    ) -> Option<Worker> {
        let live: Vec<&Worker> = candidates.iter().filter(|w| w.is_dispatchable()).collect();
        if live.is_empty() {
            debug!("没有启用且存活的Worker节点");
            return None;
        }

        if params.is_appointed() {
            return Self::appointed(&live, params).cloned();
        }
        if option.load_balance_type == LoadBalanceType::Appoint {
            warn!("负载均衡类型为APPOINT但调用参数没有指定节点");
            return None;
        }

        let suitable: Vec<&Worker> = live
            .into_iter()
            .filter(|w| w.supports(executor))
            .filter(|w| option.tag_filters.iter().all(|f| f.matches(&w.node.tags)))
            .filter(|w| Self::has_resources(w, option))
            .collect();
        if suitable.is_empty() {
            debug!("没有满足执行器 {} 的标签与资源要求的Worker", executor);
            return None;
        }

        let strategy = match self.strategies.get(&option.load_balance_type) {
            Some(strategy) => strategy,
            None => {
                warn!("未注册的负载均衡策略: {:?}", option.load_balance_type);
                return None;
            }
        };
        let index = strategy(suitable.as_slice()).min(suitable.len() - 1);
        let selected = suitable[index];
        debug!(
            "{:?}策略选择Worker: {} (索引: {}/{})",
            option.load_balance_type,
            selected.id(),
            index,
            suitable.len()
        );
        Some(selected.clone())
    }

    fn appointed<'a>(live: &[&'a Worker], params: &InvocationParams) -> Option<&'a Worker> {
        let found = live.iter().copied().find(|w| {
            params
                .appoint_server_id
                .as_deref()
                .is_some_and(|id| w.node.server_id == id)
                || params
                    .appoint_url
                    .as_deref()
                    .is_some_and(|url| w.node.url == url)
        });
        if found.is_none() {
            debug!(
                "指定的节点不可用: server_id={:?}, url={:?}",
                params.appoint_server_id, params.appoint_url
            );
        }
        found
    }

    /// 队列必须有余量; CPU与内存要求 <=0 时不限制
    pub fn has_resources(worker: &Worker, option: &DispatchOption) -> bool {
        let metric = &worker.metric;
        if metric.available_queue_num == 0 {
            return false;
        }
        if option.cpu_requirement > 0.0 && metric.cpu_headroom() < option.cpu_requirement {
            return false;
        }
        if option.ram_requirement_mb > 0
            && metric.free_memory_mb() < option.ram_requirement_mb as u64
        {
            return false;
        }
        true
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}
