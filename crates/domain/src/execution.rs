use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use jobflow_core::models::{InvocationParams, TaskKind};
use serde::{Deserialize, Serialize};

use crate::flow::Flow;
use crate::schedule::RefType;
use crate::state::{transition, ExecutionState, StateEvent, Transition};

/// 一次触发产生的运行实例, 只由所属broker修改
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub ref_id: String,
    pub ref_type: RefType,
    pub schedule_id: Option<String>,
    pub trigger_at: i64,
    pub state: ExecutionState,
    /// 触发时的工作流快照, 执行期间不随工作流修改而变化
    pub flow: Flow,
    /// 工作流节点状态, 触发节点创建即成功
    pub node_states: BTreeMap<String, ExecutionState>,
    #[serde(default)]
    pub invocation: InvocationParams,
    /// 已创建过REDUCE任务的分片节点
    #[serde(default)]
    pub reduced_nodes: BTreeSet<String>,
    pub broker_url: String,
    pub failure_cause: Option<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        flow: &Flow,
        ref_type: RefType,
        trigger_at: i64,
        broker_url: impl Into<String>,
    ) -> Self {
        let node_states = flow
            .nodes
            .iter()
            .map(|node| {
                let state = if node.is_trigger() {
                    ExecutionState::Success
                } else {
                    ExecutionState::Created
                };
                (node.id().to_string(), state)
            })
            .collect();
        let now = Utc::now();
        Self {
            id: id.into(),
            ref_id: flow.id.clone(),
            ref_type,
            schedule_id: None,
            trigger_at,
            state: ExecutionState::Created,
            flow: flow.clone(),
            node_states,
            invocation: InvocationParams::default(),
            reduced_nodes: BTreeSet::new(),
            broker_url: broker_url.into(),
            failure_cause: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, event: StateEvent) -> Transition {
        let outcome = transition(self.state, event);
        if let Transition::Applied { to, .. } = outcome {
            self.state = to;
            self.updated_at = Utc::now();
        }
        outcome
    }

    pub fn node_state(&self, node_id: &str) -> ExecutionState {
        self.node_states.get(node_id).copied().unwrap_or_default()
    }

    /// 节点状态同样走转换表, 终态节点不会被覆盖
    pub fn apply_node(&mut self, node_id: &str, event: StateEvent) -> Transition {
        let current = self.node_state(node_id);
        let outcome = transition(current, event);
        if let Transition::Applied { to, .. } = outcome {
            self.node_states.insert(node_id.to_string(), to);
            self.updated_at = Utc::now();
        }
        outcome
    }
}

/// 派发到单个worker的执行单元
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub executor: String,
    pub kind: TaskKind,
    pub shard_index: Option<u32>,
    pub params: serde_json::Value,
    pub input: Option<serde_json::Value>,
    pub state: ExecutionState,
    pub worker_id: Option<String>,
    pub worker_url: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub dispatched_at: Option<i64>,
    /// 0 表示使用broker默认超时
    pub timeout_ms: u64,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        execution_id: impl Into<String>,
        node_id: impl Into<String>,
        executor: impl Into<String>,
        kind: TaskKind,
        params: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            execution_id: execution_id.into(),
            node_id: node_id.into(),
            executor: executor.into(),
            kind,
            shard_index: None,
            params,
            input: None,
            state: ExecutionState::Created,
            worker_id: None,
            worker_url: None,
            result: None,
            error: None,
            attempts: 0,
            dispatched_at: None,
            timeout_ms: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_shard(mut self, index: u32, input: serde_json::Value) -> Self {
        self.shard_index = Some(index);
        self.input = Some(input);
        self
    }

    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.timeout_ms = timeout_ms.unwrap_or(0);
        self
    }

    pub fn apply(&mut self, event: StateEvent) -> Transition {
        let outcome = transition(self.state, event);
        if let Transition::Applied { to, .. } = outcome {
            self.state = to;
            self.updated_at = Utc::now();
        }
        outcome
    }

    /// 派发未完成或已失联, 可以重新派发
    pub fn awaiting_dispatch(&self) -> bool {
        matches!(
            self.state,
            ExecutionState::Created | ExecutionState::Restarted
        )
    }

    /// 已交给worker且尚未结束
    pub fn in_flight(&self) -> bool {
        matches!(
            self.state,
            ExecutionState::Queued | ExecutionState::Running | ExecutionState::Killing
        )
    }
}
